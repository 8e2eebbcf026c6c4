//! Host surface the capture engine runs against
//!
//! A [`Host`] exposes the live document: tree access, computed styles, box
//! metrics, replaced-content snapshots (canvas, video, frames), stylesheets
//! and network access. The engine never assumes a particular DOM
//! implementation; everything it reads about the page comes through here.

#[cfg(feature = "static-host")]
mod cascade;

pub mod media;

#[cfg(feature = "net")]
pub mod net;

#[cfg(feature = "static-host")]
pub mod static_page;

pub use media::{MediaLoad, VideoState};

use crate::dom::Namespace;
use crate::rendering::RasterBackend;
use crate::style::ComputedStyle;
use crate::{Error, Result};
use futures::future::{self, LocalBoxFuture};
use std::fmt::Debug;
use std::sync::Arc;
use url::Url;

/// Browser engine family of the host. Drives engine-specific workarounds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BrowserEngine {
    Blink,
    WebKit,
    Gecko,
    #[default]
    Other,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    Element,
    Text,
    Comment,
    Other,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ElementName {
    pub local: String,
    pub namespace: Namespace,
}

impl ElementName {
    pub fn html(local: &str) -> Self {
        Self {
            local: local.to_string(),
            namespace: Namespace::Html,
        }
    }

    pub fn svg(local: &str) -> Self {
        Self {
            local: local.to_string(),
            namespace: Namespace::Svg,
        }
    }

    pub fn tag(&self) -> String {
        self.local.to_ascii_lowercase()
    }

    pub fn is_svg(&self) -> bool {
        self.namespace == Namespace::Svg
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct ScrollMetrics {
    pub scroll_left: f64,
    pub scroll_top: f64,
    pub scroll_width: f64,
    pub scroll_height: f64,
    pub client_width: f64,
    pub client_height: f64,
}

impl ScrollMetrics {
    pub fn overflows(&self) -> bool {
        self.scroll_height > self.client_height || self.scroll_width > self.client_width
    }
}

/// A stylesheet attached to the host document.
///
/// `rules` is `None` when the sheet's rules cannot be read (cross-origin).
#[derive(Debug, Clone, PartialEq, Default)]
pub struct StyleSheet {
    pub href: Option<String>,
    pub rules: Option<Vec<String>>,
}

/// How a fetched body is handed back to the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResponseKind {
    DataUrl,
    Text,
    Bytes,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FetchRequest {
    pub url: String,
    pub kind: ResponseKind,
    pub headers: Vec<(String, String)>,
    pub timeout_ms: u64,
}

impl FetchRequest {
    pub fn new(url: impl Into<String>, kind: ResponseKind) -> Self {
        Self {
            url: url.into(),
            kind,
            headers: Vec::new(),
            timeout_ms: 30000,
        }
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct FetchResponse {
    pub content_type: Option<String>,
    pub body: Vec<u8>,
}

/// Fetch usable from worker threads
pub trait BlockingFetch: Send + Sync {
    fn fetch_blocking(&self, request: &FetchRequest) -> Result<FetchResponse>;
}

/// Detached document that reports the style an element gets with no authored CSS
pub trait Sandbox {
    fn default_style(
        &self,
        name: &ElementName,
        attributes: &[(String, String)],
        pseudo: Option<&str>,
    ) -> Result<ComputedStyle>;
}

/// The live page a capture reads from.
///
/// Required methods cover the tree, styles and network. Replaced-content
/// accessors default to "not available", which the cloner treats as a
/// degraded clone rather than an error.
pub trait Host {
    type Node: Clone + Debug + 'static;
    type Raster: RasterBackend;

    fn engine(&self) -> BrowserEngine {
        BrowserEngine::Other
    }

    /// Document base URL used to resolve relative references
    fn base_url(&self) -> Option<Url>;

    fn supports_webp(&self) -> bool {
        true
    }

    fn node_kind(&self, node: &Self::Node) -> NodeKind;
    fn text(&self, node: &Self::Node) -> Option<String>;
    fn element_name(&self, node: &Self::Node) -> Option<ElementName>;
    fn attributes(&self, node: &Self::Node) -> Vec<(String, String)>;
    fn children(&self, node: &Self::Node) -> Vec<Self::Node>;

    /// Children of an open shadow root, if the element hosts one
    fn shadow_children(&self, _node: &Self::Node) -> Option<Vec<Self::Node>> {
        None
    }

    /// Nodes assigned to a `<slot>`
    fn assigned_nodes(&self, _node: &Self::Node) -> Option<Vec<Self::Node>> {
        None
    }

    fn computed_style(&self, node: &Self::Node, pseudo: Option<&str>) -> Result<ComputedStyle>;
    fn create_sandbox(&self) -> Result<Box<dyn Sandbox + '_>>;
    fn scroll_metrics(&self, node: &Self::Node) -> ScrollMetrics;

    /// `(width, height)` of the element's border box
    fn bounding_box(&self, node: &Self::Node) -> Option<(f64, f64)>;

    fn style_sheets(&self) -> Vec<StyleSheet>;

    /// Element with the given `id` inside any inline `<svg>` of the document
    fn find_svg_definition(&self, id: &str) -> Option<Self::Node>;

    /// Live value of a form control
    fn form_value(&self, _node: &Self::Node) -> Option<String> {
        None
    }

    fn current_src(&self, _node: &Self::Node) -> Option<String> {
        None
    }

    /// PNG data URL of a canvas' current bitmap
    fn canvas_data_url(&self, _node: &Self::Node) -> Result<String> {
        Err(Error::Unsupported("canvas encoding".to_string()))
    }

    fn canvas_pixels(&self, _node: &Self::Node) -> Result<image::RgbaImage> {
        Err(Error::Unsupported("canvas pixel access".to_string()))
    }

    /// Body of a same-origin frame. `Ok(None)` when the frame is inaccessible.
    fn frame_body(&self, _node: &Self::Node) -> Result<Option<Self::Node>> {
        Ok(None)
    }

    fn video(&self, _node: &Self::Node) -> Option<VideoState> {
        None
    }

    /// Resolves once every image and video in `node`'s subtree settled
    fn wait_media_ready<'a>(&'a self, _node: &'a Self::Node) -> LocalBoxFuture<'a, MediaLoad> {
        Box::pin(future::ready(MediaLoad::Ready))
    }

    /// Seek a copy of the video to `time` and encode that frame as a data URL
    fn capture_video_frame<'a>(
        &'a self,
        _node: &'a Self::Node,
        _time: f64,
    ) -> LocalBoxFuture<'a, Result<String>> {
        Box::pin(future::ready(Err(Error::Unsupported(
            "video frame capture".to_string(),
        ))))
    }

    /// Main-thread fetch
    fn fetch(&self, request: FetchRequest) -> LocalBoxFuture<'_, Result<FetchResponse>>;

    fn raster(&self) -> &Self::Raster;

    /// Fetcher handed to worker threads. `None` disables worker delegation.
    fn blocking_fetcher(&self) -> Option<Arc<dyn BlockingFetch>> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fetch_request_header_lookup_ignores_case() {
        let mut req = FetchRequest::new("https://example.com/a.png", ResponseKind::DataUrl);
        req.headers.push(("Accept".to_string(), "image/*".to_string()));
        assert_eq!(req.header("accept"), Some("image/*"));
        assert_eq!(req.header("cache-control"), None);
    }

    #[test]
    fn scroll_metrics_overflow() {
        let m = ScrollMetrics {
            scroll_height: 300.0,
            client_height: 100.0,
            ..Default::default()
        };
        assert!(m.overflows());
        assert!(!ScrollMetrics::default().overflows());
    }
}
