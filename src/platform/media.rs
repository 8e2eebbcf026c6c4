//! Media state the cloner reads from video elements and load waits

#[derive(Debug, Clone, PartialEq)]
pub enum MediaLoad {
    Ready,
    /// Load or decode failed; the capture proceeds with what is available
    Failed(String),
}

/// Snapshot of a `<video>` element
#[derive(Debug, Clone, PartialEq, Default)]
pub struct VideoState {
    pub current_src: Option<String>,
    pub src: Option<String>,
    pub poster: Option<String>,
    pub current_time: f64,
}

impl VideoState {
    /// Source actually selected for playback
    pub fn playing_src(&self) -> Option<&str> {
        self.current_src
            .as_deref()
            .or(self.src.as_deref())
            .filter(|s| !s.is_empty())
    }

    pub fn poster(&self) -> Option<&str> {
        self.poster.as_deref().filter(|p| !p.is_empty())
    }

    /// A video with no selected source renders as its poster
    pub fn shows_poster_only(&self) -> bool {
        self.current_src.as_deref().map_or(true, str::is_empty) && self.poster().is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn poster_only_without_current_source() {
        let v = VideoState {
            poster: Some("poster.png".to_string()),
            ..Default::default()
        };
        assert!(v.shows_poster_only());
        assert_eq!(v.playing_src(), None);

        let playing = VideoState {
            current_src: Some("movie.mp4".to_string()),
            poster: Some("poster.png".to_string()),
            current_time: 2.5,
            ..Default::default()
        };
        assert!(!playing.shows_poster_only());
        assert_eq!(playing.playing_src(), Some("movie.mp4"));
    }
}
