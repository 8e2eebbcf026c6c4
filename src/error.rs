//! Error types for the capture engine

use thiserror::Error;

/// Result type alias for capture operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while capturing a DOM subtree
///
/// Only sandbox creation, serialization and rasterization failures abort a
/// capture. The other variants travel inside the embedding pipeline and are
/// logged and absorbed there.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum Error {
    /// The detached document used for baseline styles could not be created
    #[error("Sandbox creation failed: {0}")]
    Sandbox(String),

    /// A resource could not be fetched
    #[error("Failed to fetch {url}: {reason}")]
    Fetch { url: String, reason: String },

    /// Operation timed out
    #[error("Operation timed out after {0}ms")]
    Timeout(u64),

    /// Drawing or encoding failed
    #[error("Rendering failed: {0}")]
    Render(String),

    /// The assembled SVG could not be serialized
    #[error("Serialization failed: {0}")]
    Serialize(String),

    /// Image bytes could not be patched
    #[error("Invalid image metadata: {0}")]
    Metadata(String),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// Worker pool failure
    #[error("Worker error: {0}")]
    Worker(String),

    /// The host does not provide the requested capability
    #[error("Unsupported by host: {0}")]
    Unsupported(String),

    /// Generic error
    #[error("{0}")]
    Other(String),
}

impl Error {
    pub(crate) fn fetch(url: impl Into<String>, reason: impl std::fmt::Display) -> Self {
        Error::Fetch {
            url: url.into(),
            reason: reason.to_string(),
        }
    }
}

impl From<base64::DecodeError> for Error {
    fn from(err: base64::DecodeError) -> Self {
        Error::Metadata(format!("invalid base64 payload: {}", err))
    }
}

impl From<image::ImageError> for Error {
    fn from(err: image::ImageError) -> Self {
        Error::Render(err.to_string())
    }
}
