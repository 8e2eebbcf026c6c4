//! domsnap
//!
//! Capture a rendered DOM subtree as a standalone image. The subtree is cloned
//! with its computed styles inlined, every external resource is embedded as a
//! data URL, the result is wrapped in an SVG `foreignObject` and, unless SVG
//! output was requested, drawn onto a canvas and encoded.
//!
//! The page is reached through the [`Host`] trait. With the default
//! `static-host` feature, [`platform::static_page::StaticPage`] provides a host
//! built from static HTML.
//!
//! # Example
//!
//! ```no_run
//! use domsnap::platform::static_page::StaticPage;
//! use domsnap::{CaptureConfig, OutputType};
//!
//! # async fn run() -> domsnap::Result<()> {
//! let page = StaticPage::parse("<div id=card style=\"width:120px;height:80px\">Hi</div>", None);
//! let card = page.select("#card").expect("element");
//! let config = CaptureConfig {
//!     scale: 2.0,
//!     output: OutputType::Png,
//!     ..Default::default()
//! };
//! let data_url = domsnap::dom_to_data_url(&page, &card, config).await?;
//! assert!(data_url.starts_with("data:image/png;base64,"));
//! # Ok(())
//! # }
//! ```

use serde::Deserialize;
use std::fmt;
use std::sync::Arc;

pub mod capture;
pub mod context;
pub mod css;
pub mod dom;
pub mod error;
pub mod platform;
pub mod rendering;
pub mod style;

mod clone;
mod embed;
mod font;
mod svg;
mod worker;

pub use capture::{
    capture_batch, ignore_marked_elements, CaptureTarget, CapturedImage, FileNamer, ImageOptions,
};
pub use context::CaptureContext;
pub use embed::Resolved;
pub use error::{Error, Result};
pub use platform::{BrowserEngine, Host};
pub use svg::svg_to_data_url;

use dom::{Document, Element, NodeId};
use platform::{ElementName, NodeKind};

/// Transparent 1×1 GIF used when an image cannot be fetched
pub const DEFAULT_PLACEHOLDER_IMAGE: &str =
    "data:image/png;base64,R0lGODlhAQABAIAAAAAAAP///yH5BAEAAAAALAAAAAABAAEAAAIBRAA7";

/// Output encoding of a capture
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputType {
    #[default]
    Png,
    Jpeg,
    Webp,
    Svg,
}

impl OutputType {
    pub fn mime(self) -> &'static str {
        match self {
            OutputType::Png => "image/png",
            OutputType::Jpeg => "image/jpeg",
            OutputType::Webp => "image/webp",
            OutputType::Svg => "image/svg+xml",
        }
    }

    /// File extension used for exported files
    pub fn extension(self) -> &'static str {
        match self {
            OutputType::Png => "png",
            OutputType::Jpeg => "jpg",
            OutputType::Webp => "webp",
            OutputType::Svg => "svg",
        }
    }
}

impl std::str::FromStr for OutputType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "png" => Ok(OutputType::Png),
            "jpg" | "jpeg" => Ok(OutputType::Jpeg),
            "webp" => Ok(OutputType::Webp),
            "svg" => Ok(OutputType::Svg),
            other => Err(Error::Config(format!("unknown output type '{}'", other))),
        }
    }
}

/// What a node filter sees of a source node
#[derive(Debug, Clone, Copy)]
pub struct FilterNode<'a> {
    pub kind: NodeKind,
    pub name: Option<&'a ElementName>,
    pub attributes: &'a [(String, String)],
}

impl FilterNode<'_> {
    pub fn has_attribute(&self, name: &str) -> bool {
        self.attributes.iter().any(|(k, _)| k == name)
    }
}

pub type NodeFilter = Arc<dyn Fn(&FilterNode<'_>) -> bool + Send + Sync>;
pub type ProgressHandler = Arc<dyn Fn(usize, usize) + Send + Sync>;
pub type NodeHook = Arc<dyn Fn(&mut Document, NodeId) + Send + Sync>;
pub type PlaceholderHandler = Arc<dyn Fn(Option<&Element>) -> String + Send + Sync>;

/// Web font embedding options
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct FontOptions {
    /// Literal `@font-face` CSS used instead of scanning the document's stylesheets
    pub css_text: Option<String>,
    /// Skip faces whose `unicode-range` covers none of the characters used
    pub minify: bool,
    /// Keep only this `format()` alternative in multi-source `src` lists
    pub preferred_format: Option<String>,
}

/// Resource fetch options
#[derive(Clone, Deserialize)]
#[serde(default)]
pub struct FetchOptions {
    /// Extra request headers
    pub headers: Vec<(String, String)>,
    /// Send `Cache-Control: no-cache`
    pub bypassing_cache: bool,
    /// URLs containing any of these fragments get a timestamp query parameter
    pub cache_busting: Vec<String>,
    /// Data URL used for images that fail to load. `None` lets the failure through.
    pub placeholder_image: Option<String>,
    /// Per-node placeholder, takes precedence over `placeholder_image`
    #[serde(skip)]
    pub placeholder_with: Option<PlaceholderHandler>,
}

impl Default for FetchOptions {
    fn default() -> Self {
        Self {
            headers: Vec::new(),
            bypassing_cache: false,
            cache_busting: Vec::new(),
            placeholder_image: Some(DEFAULT_PLACEHOLDER_IMAGE.to_string()),
            placeholder_with: None,
        }
    }
}

impl fmt::Debug for FetchOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FetchOptions")
            .field("headers", &self.headers)
            .field("bypassing_cache", &self.bypassing_cache)
            .field("cache_busting", &self.cache_busting)
            .field("placeholder_image", &self.placeholder_image.as_ref().map(|p| p.len()))
            .field("placeholder_with", &self.placeholder_with.is_some())
            .finish()
    }
}

/// Feature switches for compatibility behaviour
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(default)]
pub struct Features {
    /// Materialize `::-webkit-scrollbar*` styles on scrolling elements
    pub copy_scrollbar: bool,
    /// Drop attributes whose names are not identifier-like
    pub remove_abnormal_attributes: bool,
    /// Strip control characters that strict XML parsers reject
    pub remove_control_character: bool,
    /// Redraw the SVG once per embedded image on engines that paint late
    pub fix_svg_xml_decode: bool,
    /// Translate children by their parent's scroll offset
    pub restore_scroll_position: bool,
}

impl Default for Features {
    fn default() -> Self {
        Self {
            copy_scrollbar: true,
            remove_abnormal_attributes: true,
            remove_control_character: true,
            fix_svg_xml_decode: true,
            restore_scroll_position: false,
        }
    }
}

/// Configuration for a capture
///
/// The defaults produce a PNG at the element's own size with web fonts
/// embedded and a transparent placeholder for broken images.
///
/// # Examples
///
/// ```
/// let cfg = domsnap::CaptureConfig::default();
/// assert_eq!(cfg.scale, 1.0);
/// assert_eq!(cfg.dpi(), None);
/// ```
#[derive(Clone, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    /// Output width in CSS pixels (0 = element's bounding box)
    pub width: f64,
    /// Output height in CSS pixels (0 = element's bounding box)
    pub height: f64,
    /// Device pixel ratio of the raster output
    pub scale: f64,
    /// Encoder quality for lossy formats, 0.0 to 1.0
    pub quality: f64,
    pub background_color: Option<String>,
    pub output: OutputType,
    /// Timeout for media readiness and each resource fetch
    pub timeout_ms: u64,
    /// Cap on either canvas dimension (0 = unlimited)
    pub maximum_canvas_size: u32,
    /// `None` disables web font embedding
    pub font: Option<FontOptions>,
    pub fetch: FetchOptions,
    /// Extra inline styles applied to the cloned root
    pub style: Vec<(String, String)>,
    /// Restrict style diffing to these properties
    pub include_style_properties: Option<Vec<String>>,
    /// Base delay between compatibility redraws
    pub draw_image_interval_ms: u64,
    /// Number of fetch worker threads
    pub worker_number: usize,
    /// Keep caches alive after a render instead of destroying the context
    pub reuse_context: bool,
    /// Log phase timings at debug level
    pub debug: bool,
    pub features: Features,
    #[serde(skip)]
    pub filter: Option<NodeFilter>,
    #[serde(skip)]
    pub progress: Option<ProgressHandler>,
    #[serde(skip)]
    pub on_clone_node: Option<NodeHook>,
    #[serde(skip)]
    pub on_embed_node: Option<NodeHook>,
    #[serde(skip)]
    pub on_create_foreign_object_svg: Option<NodeHook>,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            width: 0.0,
            height: 0.0,
            scale: 1.0,
            quality: 1.0,
            background_color: None,
            output: OutputType::Png,
            timeout_ms: 30000,
            maximum_canvas_size: 0,
            font: Some(FontOptions::default()),
            fetch: FetchOptions::default(),
            style: Vec::new(),
            include_style_properties: None,
            draw_image_interval_ms: 100,
            worker_number: 1,
            reuse_context: false,
            debug: false,
            features: Features::default(),
            filter: None,
            progress: None,
            on_clone_node: None,
            on_embed_node: None,
            on_create_foreign_object_svg: None,
        }
    }
}

impl fmt::Debug for CaptureConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CaptureConfig")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("scale", &self.scale)
            .field("quality", &self.quality)
            .field("background_color", &self.background_color)
            .field("output", &self.output)
            .field("timeout_ms", &self.timeout_ms)
            .field("maximum_canvas_size", &self.maximum_canvas_size)
            .field("font", &self.font)
            .field("fetch", &self.fetch)
            .field("style", &self.style)
            .field("worker_number", &self.worker_number)
            .field("reuse_context", &self.reuse_context)
            .field("features", &self.features)
            .field("filter", &self.filter.is_some())
            .finish_non_exhaustive()
    }
}

impl CaptureConfig {
    /// Density written into PNG/JPEG metadata
    pub fn dpi(&self) -> Option<f64> {
        if self.scale == 1.0 {
            None
        } else {
            Some(96.0 * self.scale)
        }
    }

    pub fn validate(&self) -> Result<()> {
        if !self.scale.is_finite() || self.scale <= 0.0 {
            return Err(Error::Config(format!("scale must be positive, got {}", self.scale)));
        }
        if !(0.0..=1.0).contains(&self.quality) {
            return Err(Error::Config(format!(
                "quality must be within 0..=1, got {}",
                self.quality
            )));
        }
        if self.width < 0.0 || self.height < 0.0 {
            return Err(Error::Config("width and height must not be negative".to_string()));
        }
        Ok(())
    }
}

/// Capture `node` and encode it as configured by `config.output`.
pub async fn dom_to_data_url<H: Host>(host: &H, node: &H::Node, config: CaptureConfig) -> Result<String> {
    let mut context = CaptureContext::new(host, node.clone(), config).await?;
    context.render().await
}

pub async fn dom_to_png<H: Host>(host: &H, node: &H::Node, config: CaptureConfig) -> Result<String> {
    dom_to_data_url(host, node, CaptureConfig { output: OutputType::Png, ..config }).await
}

pub async fn dom_to_jpeg<H: Host>(host: &H, node: &H::Node, config: CaptureConfig) -> Result<String> {
    dom_to_data_url(host, node, CaptureConfig { output: OutputType::Jpeg, ..config }).await
}

pub async fn dom_to_webp<H: Host>(host: &H, node: &H::Node, config: CaptureConfig) -> Result<String> {
    dom_to_data_url(host, node, CaptureConfig { output: OutputType::Webp, ..config }).await
}

/// Percent-encoded `data:image/svg+xml` URL of the assembled SVG
pub async fn dom_to_svg<H: Host>(host: &H, node: &H::Node, config: CaptureConfig) -> Result<String> {
    dom_to_data_url(host, node, CaptureConfig { output: OutputType::Svg, ..config }).await
}

/// Serialized `foreignObject` SVG markup
pub async fn dom_to_foreign_object_svg<H: Host>(
    host: &H,
    node: &H::Node,
    config: CaptureConfig,
) -> Result<String> {
    let mut context = CaptureContext::new(host, node.clone(), config).await?;
    context.svg_markup().await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dpi_follows_scale() {
        let mut cfg = CaptureConfig::default();
        assert_eq!(cfg.dpi(), None);
        cfg.scale = 2.0;
        assert_eq!(cfg.dpi(), Some(192.0));
    }

    #[test]
    fn config_deserializes_with_defaults() {
        let cfg: CaptureConfig = serde_json::from_str(
            r#"{ "scale": 3, "output": "jpeg", "features": { "restore_scroll_position": true }, "font": null }"#,
        )
        .unwrap();
        assert_eq!(cfg.scale, 3.0);
        assert_eq!(cfg.output, OutputType::Jpeg);
        assert!(cfg.features.restore_scroll_position);
        assert!(cfg.features.copy_scrollbar);
        assert!(cfg.font.is_none());
        assert_eq!(cfg.timeout_ms, 30000);
        assert_eq!(cfg.fetch.placeholder_image.as_deref(), Some(DEFAULT_PLACEHOLDER_IMAGE));
    }

    #[test]
    fn validate_rejects_bad_values() {
        assert!(CaptureConfig { scale: 0.0, ..Default::default() }.validate().is_err());
        assert!(CaptureConfig { quality: 1.5, ..Default::default() }.validate().is_err());
        assert!(CaptureConfig::default().validate().is_ok());
    }

    #[test]
    fn output_type_parsing() {
        assert_eq!("JPG".parse::<OutputType>().unwrap(), OutputType::Jpeg);
        assert_eq!(OutputType::Jpeg.extension(), "jpg");
        assert!("gif".parse::<OutputType>().is_err());
    }
}
