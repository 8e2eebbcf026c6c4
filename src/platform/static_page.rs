//! Host built from static HTML
//!
//! [`StaticPage`] parses markup with `scraper`, keeps the tree in an arena
//! [`Document`] and answers the engine's questions the way a browser would
//! for a page that never runs script: computed styles come from a small
//! cascade, boxes from a block/inline approximation and resources from an
//! in-memory store, `data:`/`file:` URLs or HTTP.
//!
//! Live state that static markup cannot express (scroll offsets, form
//! values, canvas pixels, video frames, slow media) is injected with the
//! `set_*` methods.

use super::cascade::{self, FlatRule};
use super::media::{MediaLoad, VideoState};
use super::{
    BlockingFetch, BrowserEngine, ElementName, FetchRequest, FetchResponse, Host, NodeKind, ResponseKind,
    Sandbox, ScrollMetrics, StyleSheet,
};
use crate::clone::encode_png_data_url;
use crate::css::{resolve_url, Declarations};
use crate::dom::{Document, Element, Namespace, NodeData, NodeId};
use crate::rendering::software::SoftwareRaster;
use crate::style::ComputedStyle;
use crate::{Error, Result};
use data_url::DataUrl;
use futures::future::{self, LocalBoxFuture};
use image::RgbaImage;
use log::{debug, warn};
use scraper::{ElementRef, Html, Node as HtmlNode, Selector};
use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::rc::Rc;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use url::Url;

#[cfg(feature = "net")]
use super::net::HttpFetcher;

const DEFAULT_VIEWPORT: (f64, f64) = (1024.0, 768.0);
const DEFAULT_CANVAS_SIZE: (u32, u32) = (300, 150);
/// Average glyph advance as a fraction of the font size
const GLYPH_ADVANCE: f64 = 0.5;

const BLOCK_DISPLAYS: [&str; 6] = ["block", "list-item", "flex", "grid", "table", "flow-root"];

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn parse_px(value: &str) -> Option<f64> {
    let value = value.trim();
    value
        .strip_suffix("px")
        .unwrap_or(value)
        .trim()
        .parse::<f64>()
        .ok()
        .filter(|v| v.is_finite())
}

fn guess_content_type(path: &str) -> Option<&'static str> {
    let ext = path.rsplit('.').next()?.to_ascii_lowercase();
    Some(match ext.as_str() {
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "webp" => "image/webp",
        "svg" => "image/svg+xml",
        "css" => "text/css",
        "html" | "htm" => "text/html",
        "woff" => "font/woff",
        "woff2" => "font/woff2",
        "ttf" => "font/ttf",
        "otf" => "font/otf",
        _ => return None,
    })
}

fn decode_data_url(url: &str) -> Result<FetchResponse> {
    let parsed = DataUrl::process(url).map_err(|e| Error::fetch(url, format!("{:?}", e)))?;
    let mime = parsed.mime_type();
    let content_type = format!("{}/{}", mime.type_, mime.subtype);
    let (body, _) = parsed
        .decode_to_vec()
        .map_err(|e| Error::fetch(url, format!("{:?}", e)))?;
    Ok(FetchResponse {
        content_type: Some(content_type),
        body,
    })
}

#[derive(Debug, Clone)]
enum StoredResource {
    Found(FetchResponse),
    Missing(u16),
}

/// Resources registered on the page plus a per-URL request counter
#[derive(Debug, Default)]
struct ResourceStore {
    resources: Mutex<HashMap<String, StoredResource>>,
    hits: Mutex<HashMap<String, usize>>,
    pending: Mutex<HashSet<String>>,
}

impl ResourceStore {
    fn record(&self, url: &str) {
        *lock(&self.hits).entry(url.to_string()).or_insert(0) += 1;
    }

    fn is_pending(&self, url: &str) -> bool {
        lock(&self.pending).contains(url)
    }

    /// Answer `url` without the network, or `None` when it needs HTTP.
    fn local(&self, url: &str) -> Option<Result<FetchResponse>> {
        if let Some(stored) = lock(&self.resources).get(url).cloned() {
            return Some(match stored {
                StoredResource::Found(response) => Ok(response),
                StoredResource::Missing(status) => Err(Error::fetch(url, format!("HTTP {}", status))),
            });
        }
        if url.starts_with("data:") {
            return Some(decode_data_url(url));
        }
        if url.starts_with("file:") {
            return Some(read_file_url(url));
        }
        None
    }
}

fn read_file_url(url: &str) -> Result<FetchResponse> {
    let path = Url::parse(url)
        .ok()
        .and_then(|u| u.to_file_path().ok())
        .ok_or_else(|| Error::fetch(url, "not a file path"))?;
    let body = std::fs::read(&path).map_err(|e| Error::fetch(url, e))?;
    Ok(FetchResponse {
        content_type: guess_content_type(&path.to_string_lossy()).map(str::to_string),
        body,
    })
}

/// Thread-safe fetcher over the page's resources, handed to fetch workers
#[derive(Debug, Clone)]
pub struct ResourceFetcher {
    store: Arc<ResourceStore>,
    #[cfg(feature = "net")]
    http: Option<HttpFetcher>,
}

impl ResourceFetcher {
    fn new(store: Arc<ResourceStore>) -> Self {
        Self {
            store,
            #[cfg(feature = "net")]
            http: match HttpFetcher::new() {
                Ok(http) => Some(http),
                Err(e) => {
                    warn!("HTTP fetching disabled: {}", e);
                    None
                }
            },
        }
    }

    fn network(&self, request: FetchRequest) -> LocalBoxFuture<'static, Result<FetchResponse>> {
        #[cfg(feature = "net")]
        if let Some(http) = &self.http {
            return http.fetch(request);
        }
        Box::pin(future::ready(Err(Error::fetch(&request.url, "no network backend"))))
    }
}

impl BlockingFetch for ResourceFetcher {
    fn fetch_blocking(&self, request: &FetchRequest) -> Result<FetchResponse> {
        self.store.record(&request.url);
        if self.store.is_pending(&request.url) {
            std::thread::sleep(Duration::from_millis(request.timeout_ms));
            return Err(Error::Timeout(request.timeout_ms));
        }
        if let Some(result) = self.store.local(&request.url) {
            return result;
        }
        #[cfg(feature = "net")]
        if let Some(http) = &self.http {
            return http.fetch_blocking(request);
        }
        Err(Error::fetch(&request.url, "no network backend"))
    }
}

#[derive(Debug, Clone)]
struct MatchedRule {
    specificity: u32,
    order: usize,
    pseudo: Option<String>,
    declarations: Declarations,
}

/// One parsed markup source: the main page, a `srcdoc` frame or a shadow tree
struct ParsedDocument {
    html: Html,
    /// Arena ids of the document's elements in tree order
    elements: Vec<NodeId>,
    sheets: Vec<StyleSheet>,
}

#[derive(Debug, Clone)]
struct CanvasState {
    pixels: RgbaImage,
    tainted: bool,
}

#[derive(Debug, Default)]
struct LiveState {
    scroll: HashMap<NodeId, ScrollMetrics>,
    form_values: HashMap<NodeId, String>,
    canvases: HashMap<NodeId, CanvasState>,
    videos: HashMap<NodeId, VideoState>,
    video_frames: HashMap<NodeId, String>,
    current_src: HashMap<NodeId, String>,
    pending_media: HashSet<NodeId>,
    failed_media: HashMap<NodeId, String>,
}

/// Default styles for a detached document
struct StaticSandbox;

impl Sandbox for StaticSandbox {
    fn default_style(
        &self,
        name: &ElementName,
        attributes: &[(String, String)],
        pseudo: Option<&str>,
    ) -> Result<ComputedStyle> {
        let mut style = cascade::base_style(&name.tag(), name.namespace, attributes, None, pseudo);
        cascade::finish(&mut style);
        Ok(style)
    }
}

/// A page parsed from static HTML
pub struct StaticPage {
    doc: Document,
    root: NodeId,
    base: Option<Url>,
    documents: Vec<ParsedDocument>,
    matched: HashMap<NodeId, Vec<MatchedRule>>,
    cascaded: RefCell<HashMap<(NodeId, Option<String>), Rc<ComputedStyle>>>,
    frames: HashMap<NodeId, NodeId>,
    shadow_roots: HashMap<NodeId, NodeId>,
    shadow_hosts: HashMap<NodeId, NodeId>,
    store: Arc<ResourceStore>,
    fetcher: Arc<ResourceFetcher>,
    live: LiveState,
    engine: BrowserEngine,
    viewport: (f64, f64),
    sandbox_failure: Option<String>,
    raster: SoftwareRaster,
}

impl std::fmt::Debug for StaticPage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StaticPage")
            .field("base", &self.base)
            .field("nodes", &self.doc.len())
            .field("documents", &self.documents.len())
            .field("engine", &self.engine)
            .finish_non_exhaustive()
    }
}

impl StaticPage {
    /// Parse a full HTML document. `base` resolves relative URLs.
    pub fn parse(html: &str, base: Option<&str>) -> Self {
        let base = base.and_then(|b| match Url::parse(b) {
            Ok(url) => Some(url),
            Err(e) => {
                warn!("ignoring invalid base URL '{}': {}", b, e);
                None
            }
        });
        let store = Arc::new(ResourceStore::default());
        let fetcher = Arc::new(ResourceFetcher::new(store.clone()));
        let mut page = Self {
            doc: Document::new(),
            root: NodeId::default(),
            base,
            documents: Vec::new(),
            matched: HashMap::new(),
            cascaded: RefCell::new(HashMap::new()),
            frames: HashMap::new(),
            shadow_roots: HashMap::new(),
            shadow_hosts: HashMap::new(),
            store,
            fetcher,
            live: LiveState::default(),
            engine: BrowserEngine::Other,
            viewport: DEFAULT_VIEWPORT,
            sandbox_failure: None,
            raster: SoftwareRaster::new(),
        };
        page.root = page.import(Html::parse_document(html), true);
        page.restyle();
        page
    }

    /// Import a parsed source into the arena and return its root element.
    fn import(&mut self, html: Html, link_sheets: bool) -> NodeId {
        let mut elements = Vec::new();
        let root = import_element(&mut self.doc, html.root_element(), Namespace::Html, "", &mut elements);
        let sheets = self.collect_sheets(root, link_sheets);
        self.documents.push(ParsedDocument { html, elements, sheets });

        let frames: Vec<(NodeId, String)> = self
            .doc
            .descendants(root)
            .into_iter()
            .filter_map(|n| {
                let el = self.doc.element(n)?;
                (el.namespace == Namespace::Html && el.tag() == "iframe")
                    .then(|| el.attr("srcdoc").map(|s| (n, s.to_string())))
                    .flatten()
            })
            .collect();
        for (iframe, srcdoc) in frames {
            let frame_root = self.import(Html::parse_document(&srcdoc), false);
            let body = self
                .doc
                .children(frame_root)
                .iter()
                .copied()
                .find(|c| self.doc.tag(*c).as_deref() == Some("body"));
            if let Some(body) = body {
                self.frames.insert(iframe, body);
            }
        }
        root
    }

    fn collect_sheets(&self, root: NodeId, link_sheets: bool) -> Vec<StyleSheet> {
        let mut sheets = Vec::new();
        for node in self.doc.descendants(root) {
            let Some(el) = self.doc.element(node) else { continue };
            if el.namespace != Namespace::Html {
                continue;
            }
            match el.tag().as_str() {
                "style" => sheets.push(StyleSheet {
                    href: None,
                    rules: Some(cascade::parse_rules(&self.doc.text_content(node))),
                }),
                "link" if link_sheets => {
                    let is_stylesheet = el
                        .attr("rel")
                        .map_or(false, |rel| rel.split_whitespace().any(|r| r.eq_ignore_ascii_case("stylesheet")));
                    if let (true, Some(href)) = (is_stylesheet, el.attr("href")) {
                        sheets.push(StyleSheet {
                            href: Some(resolve_url(href, self.base.as_ref())),
                            rules: None,
                        });
                    }
                }
                _ => {}
            }
        }
        sheets
    }

    /// Match every stylesheet rule against its document again.
    fn restyle(&mut self) {
        self.matched.clear();
        self.cascaded.borrow_mut().clear();
        for parsed in &self.documents {
            let index: HashMap<_, usize> = parsed
                .html
                .root_element()
                .descendants()
                .filter_map(ElementRef::wrap)
                .enumerate()
                .map(|(i, e)| (e.id(), i))
                .collect();
            let rules: Vec<FlatRule> = parsed
                .sheets
                .iter()
                .filter_map(|sheet| sheet.rules.as_ref())
                .flat_map(|rules| cascade::flatten_rules(rules))
                .collect();
            for (order, rule) in rules.into_iter().enumerate() {
                let selector = match Selector::parse(&rule.selector) {
                    Ok(selector) => selector,
                    Err(_) => {
                        debug!("skipping unsupported selector '{}'", rule.selector);
                        continue;
                    }
                };
                for element in parsed.html.select(&selector) {
                    let Some(node) = index.get(&element.id()).and_then(|i| parsed.elements.get(*i)) else {
                        continue;
                    };
                    self.matched.entry(*node).or_default().push(MatchedRule {
                        specificity: rule.specificity,
                        order,
                        pseudo: rule.pseudo.clone(),
                        declarations: rule.declarations.clone(),
                    });
                }
            }
        }
    }

    /// Arena tree of the page
    pub fn document(&self) -> &Document {
        &self.doc
    }

    /// The `<html>` element
    pub fn root(&self) -> NodeId {
        self.root
    }

    pub fn body(&self) -> Option<NodeId> {
        self.select("body")
    }

    /// Elements of the main document matching a CSS selector, in tree order
    pub fn select_all(&self, selector: &str) -> Vec<NodeId> {
        let (Some(parsed), Ok(selector)) = (self.documents.first(), Selector::parse(selector)) else {
            return Vec::new();
        };
        let index: HashMap<_, usize> = parsed
            .html
            .root_element()
            .descendants()
            .filter_map(ElementRef::wrap)
            .enumerate()
            .map(|(i, e)| (e.id(), i))
            .collect();
        parsed
            .html
            .select(&selector)
            .filter_map(|e| index.get(&e.id()).and_then(|i| parsed.elements.get(*i)).copied())
            .collect()
    }

    pub fn select(&self, selector: &str) -> Option<NodeId> {
        self.select_all(selector).into_iter().next()
    }

    pub fn set_engine(&mut self, engine: BrowserEngine) {
        self.engine = engine;
    }

    pub fn set_viewport(&mut self, width: f64, height: f64) {
        self.viewport = (width, height);
    }

    /// Serve `body` for `url`.
    pub fn add_resource(&mut self, url: &str, content_type: &str, body: impl Into<Vec<u8>>) {
        lock(&self.store.resources).insert(
            url.to_string(),
            StoredResource::Found(FetchResponse {
                content_type: Some(content_type.to_string()),
                body: body.into(),
            }),
        );
    }

    /// Answer `url` with an HTTP error status.
    pub fn add_missing_resource(&mut self, url: &str, status: u16) {
        lock(&self.store.resources).insert(url.to_string(), StoredResource::Missing(status));
    }

    /// Requests for `url` never complete.
    pub fn set_pending_resource(&mut self, url: &str) {
        lock(&self.store.pending).insert(url.to_string());
    }

    /// Number of fetches issued for `url`
    pub fn request_count(&self, url: &str) -> usize {
        lock(&self.store.hits).get(url).copied().unwrap_or(0)
    }

    /// Append a stylesheet to the main document.
    pub fn add_stylesheet(&mut self, href: Option<&str>, css: &str) {
        let sheet = StyleSheet {
            href: href.map(str::to_string),
            rules: Some(cascade::parse_rules(css)),
        };
        if let Some(main) = self.documents.first_mut() {
            main.sheets.push(sheet);
        }
        self.restyle();
    }

    /// Fetch the rules of `<link rel="stylesheet">` sheets. Sheets that fail
    /// to load stay unreadable.
    pub async fn load_stylesheets(&mut self) {
        let pending: Vec<(usize, String)> = self
            .documents
            .first()
            .map(|main| {
                main.sheets
                    .iter()
                    .enumerate()
                    .filter(|(_, s)| s.rules.is_none())
                    .filter_map(|(i, s)| s.href.clone().map(|h| (i, h)))
                    .collect()
            })
            .unwrap_or_default();
        if pending.is_empty() {
            return;
        }
        for (index, href) in pending {
            let result = self.fetch(FetchRequest::new(href.clone(), ResponseKind::Text)).await;
            let text = result.and_then(|r| String::from_utf8(r.body).map_err(|e| Error::fetch(&href, e)));
            match text {
                Ok(text) => {
                    if let Some(sheet) = self.documents.first_mut().and_then(|m| m.sheets.get_mut(index)) {
                        sheet.rules = Some(cascade::parse_rules(&text));
                    }
                }
                Err(e) => warn!("failed to load stylesheet {}: {}", href, e),
            }
        }
        self.restyle();
    }

    /// Attach an open shadow root to `host` with the given markup.
    pub fn attach_shadow(&mut self, host: NodeId, markup: &str) {
        let container = self.import(Html::parse_fragment(markup), false);
        self.shadow_roots.insert(host, container);
        self.shadow_hosts.insert(container, host);
        self.restyle();
    }

    pub fn set_scroll(&mut self, node: NodeId, metrics: ScrollMetrics) {
        self.live.scroll.insert(node, metrics);
    }

    pub fn set_form_value(&mut self, node: NodeId, value: &str) {
        self.live.form_values.insert(node, value.to_string());
    }

    /// Canvas bitmap. A tainted canvas refuses data URL export.
    pub fn set_canvas(&mut self, node: NodeId, pixels: RgbaImage, tainted: bool) {
        self.live.canvases.insert(node, CanvasState { pixels, tainted });
    }

    pub fn set_video(&mut self, node: NodeId, state: VideoState) {
        self.live.videos.insert(node, state);
    }

    /// Frame data URL returned when the video is seeked for capture
    pub fn set_video_frame(&mut self, node: NodeId, data_url: &str) {
        self.live.video_frames.insert(node, data_url.to_string());
    }

    pub fn set_current_src(&mut self, node: NodeId, src: &str) {
        self.live.current_src.insert(node, src.to_string());
    }

    /// Media in `node` never finishes loading.
    pub fn set_pending_media(&mut self, node: NodeId) {
        self.live.pending_media.insert(node);
    }

    pub fn set_failed_media(&mut self, node: NodeId, reason: &str) {
        self.live.failed_media.insert(node, reason.to_string());
    }

    /// Make sandbox creation fail.
    pub fn set_sandbox_failure(&mut self, reason: &str) {
        self.sandbox_failure = Some(reason.to_string());
    }

    /// Parent whose style `node` inherits, crossing shadow boundaries
    fn style_parent(&self, node: NodeId) -> Option<NodeId> {
        let parent = self.doc.parent(node)?;
        Some(self.shadow_hosts.get(&parent).copied().unwrap_or(parent))
    }

    fn cascaded(&self, node: NodeId, pseudo: Option<&str>) -> Result<Rc<ComputedStyle>> {
        let key = (node, pseudo.map(str::to_string));
        if let Some(style) = self.cascaded.borrow().get(&key) {
            return Ok(style.clone());
        }
        let el = self
            .doc
            .element(node)
            .ok_or_else(|| Error::Other("computed style requested for a non-element".to_string()))?;
        let parent = match pseudo {
            Some(_) => Some(self.cascaded(node, None)?),
            None => match self.style_parent(node).filter(|p| self.doc.element(*p).is_some()) {
                Some(p) => Some(self.cascaded(p, None)?),
                None => None,
            },
        };
        let parent = parent.as_deref();
        let mut style = cascade::base_style(&el.tag(), el.namespace, &el.attrs, parent, pseudo);

        let mut rules: Vec<&MatchedRule> = self
            .matched
            .get(&node)
            .map(|rules| rules.iter().filter(|r| r.pseudo.as_deref() == pseudo).collect())
            .unwrap_or_default();
        rules.sort_by_key(|r| (r.specificity, r.order));
        for important in [false, true] {
            for rule in &rules {
                for decl in rule.declarations.iter().filter(|d| d.important == important) {
                    cascade::apply_declaration(&mut style, &decl.name, &decl.value, parent);
                }
            }
            if pseudo.is_none() {
                for decl in el.style.iter().filter(|d| d.important == important) {
                    cascade::apply_declaration(&mut style, &decl.name, &decl.value, parent);
                }
            }
        }
        cascade::finish(&mut style);

        let style = Rc::new(style);
        self.cascaded.borrow_mut().insert(key, style.clone());
        Ok(style)
    }

    fn px(&self, style: &ComputedStyle, name: &str) -> f64 {
        style.value(name).and_then(parse_px).unwrap_or(0.0)
    }

    fn horizontal_extent(&self, style: &ComputedStyle) -> f64 {
        ["padding-left", "padding-right", "border-left-width", "border-right-width"]
            .iter()
            .map(|n| self.px(style, n))
            .sum()
    }

    fn vertical_extent(&self, style: &ComputedStyle) -> f64 {
        ["padding-top", "padding-bottom", "border-top-width", "border-bottom-width"]
            .iter()
            .map(|n| self.px(style, n))
            .sum()
    }

    fn font_size(&self, style: &ComputedStyle) -> f64 {
        style.value("font-size").and_then(parse_px).unwrap_or(16.0)
    }

    fn line_height(&self, style: &ComputedStyle) -> f64 {
        let font_size = self.font_size(style);
        match style.value("line-height") {
            Some(v) if v.ends_with("px") => parse_px(v).unwrap_or(font_size * 1.2),
            Some(v) => v.parse::<f64>().map(|f| f * font_size).unwrap_or(font_size * 1.2),
            None => font_size * 1.2,
        }
    }

    fn is_block(style: &ComputedStyle) -> bool {
        style.value("display").map_or(false, |d| BLOCK_DISPLAYS.contains(&d))
    }

    fn is_hidden(style: &ComputedStyle) -> bool {
        style.value("display") == Some("none")
    }

    fn attr_px(el: &Element, name: &str) -> Option<f64> {
        el.attr(name).and_then(parse_px)
    }

    /// Border-box width from the specified width, or `None` for `auto`
    fn specified_width(&self, node: NodeId, el: &Element, style: &ComputedStyle) -> Option<f64> {
        let extent = self.horizontal_extent(style);
        let border_box = style.value("box-sizing") == Some("border-box");
        let value = style.value("width")?;
        let content = if let Some(percent) = value.strip_suffix('%') {
            percent.trim().parse::<f64>().ok()? / 100.0 * self.containing_width(node)
        } else if let Some(px) = parse_px(value) {
            px
        } else {
            return Self::attr_px(el, "width").map(|w| w + extent);
        };
        Some(if border_box { content } else { content + extent })
    }

    fn containing_width(&self, node: NodeId) -> f64 {
        match self.style_parent(node).filter(|p| self.doc.element(*p).is_some()) {
            Some(parent) => {
                let extent = self
                    .cascaded(parent, None)
                    .map(|s| self.horizontal_extent(&s))
                    .unwrap_or(0.0);
                (self.layout_width(parent) - extent).max(0.0)
            }
            None => self.viewport.0,
        }
    }

    fn layout_width(&self, node: NodeId) -> f64 {
        let (Some(el), Ok(style)) = (self.doc.element(node), self.cascaded(node, None)) else {
            return 0.0;
        };
        if Self::is_hidden(&style) {
            return 0.0;
        }
        if let Some(width) = self.specified_width(node, el, &style) {
            return width;
        }
        if Self::is_block(&style) {
            let margins = self.px(&style, "margin-left") + self.px(&style, "margin-right");
            return (self.containing_width(node) - margins).max(0.0);
        }
        self.intrinsic_width(node)
    }

    /// Shrink-to-fit width from content only
    fn intrinsic_width(&self, node: NodeId) -> f64 {
        match self.doc.data(node) {
            NodeData::Text(text) => {
                let font_size = self
                    .doc
                    .parent(node)
                    .and_then(|p| self.cascaded(p, None).ok())
                    .map_or(16.0, |s| self.font_size(&s));
                let chars = text.split_whitespace().collect::<Vec<_>>().join(" ").chars().count();
                chars as f64 * font_size * GLYPH_ADVANCE
            }
            NodeData::Element(el) => {
                let Ok(style) = self.cascaded(node, None) else { return 0.0 };
                if Self::is_hidden(&style) {
                    return 0.0;
                }
                let percent = style.value("width").map_or(false, |w| w.trim_end().ends_with('%'));
                if !percent {
                    if let Some(width) = self.specified_width(node, el, &style) {
                        return width;
                    }
                }
                let content = self
                    .doc
                    .children(node)
                    .iter()
                    .map(|c| self.intrinsic_width(*c))
                    .fold(0.0, f64::max);
                content + self.horizontal_extent(&style)
            }
            _ => 0.0,
        }
    }

    fn layout_height(&self, node: NodeId) -> f64 {
        let (Some(el), Ok(style)) = (self.doc.element(node), self.cascaded(node, None)) else {
            return 0.0;
        };
        if Self::is_hidden(&style) {
            return 0.0;
        }
        let extent = self.vertical_extent(&style);
        let border_box = style.value("box-sizing") == Some("border-box");
        if let Some(height) = style.value("height").and_then(parse_px) {
            return if border_box { height } else { height + extent };
        }
        if let Some(height) = Self::attr_px(el, "height") {
            return height + extent;
        }

        let mut blocks = 0.0;
        let mut line: Option<f64> = None;
        let children: Vec<NodeId> = match self.shadow_roots.get(&node) {
            Some(container) => self.doc.children(*container).to_vec(),
            None => self.doc.children(node).to_vec(),
        };
        for child in children {
            match self.doc.data(child) {
                NodeData::Text(text) if !text.trim().is_empty() => {
                    line = Some(line.unwrap_or(0.0).max(self.line_height(&style)));
                }
                NodeData::Element(_) => {
                    let Ok(child_style) = self.cascaded(child, None) else { continue };
                    if Self::is_hidden(&child_style) {
                        continue;
                    }
                    let height = self.layout_height(child);
                    if Self::is_block(&child_style) {
                        blocks += height
                            + self.px(&child_style, "margin-top")
                            + self.px(&child_style, "margin-bottom");
                    } else {
                        line = Some(line.unwrap_or(0.0).max(height));
                    }
                }
                _ => {}
            }
        }
        blocks + line.unwrap_or(0.0) + extent
    }

    fn element_tag(&self, node: NodeId) -> Option<(String, Namespace)> {
        self.doc.element(node).map(|e| (e.tag(), e.namespace))
    }

    fn is_html(&self, node: NodeId, tag: &str) -> bool {
        self.element_tag(node)
            .map_or(false, |(t, ns)| ns == Namespace::Html && t == tag)
    }

    fn derived_video(&self, node: NodeId) -> Option<VideoState> {
        if !self.is_html(node, "video") {
            return None;
        }
        let el = self.doc.element(node)?;
        let base = self.base.as_ref();
        let src = el
            .attr("src")
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .or_else(|| {
                self.doc
                    .children(node)
                    .iter()
                    .filter(|c| self.is_html(**c, "source"))
                    .find_map(|c| self.doc.element(*c)?.attr("src").map(str::to_string))
            })
            .map(|s| resolve_url(&s, base));
        let poster = el.attr("poster").filter(|p| !p.is_empty()).map(|p| resolve_url(p, base));
        Some(VideoState {
            current_src: src.clone(),
            src,
            poster,
            current_time: 0.0,
        })
    }

    fn canvas_state(&self, node: NodeId) -> Option<CanvasState> {
        if !self.is_html(node, "canvas") {
            return None;
        }
        if let Some(state) = self.live.canvases.get(&node) {
            return Some(state.clone());
        }
        let el = self.doc.element(node)?;
        let size = |name: &str, fallback: u32| el.attr(name).and_then(|v| v.trim().parse::<u32>().ok()).unwrap_or(fallback);
        Some(CanvasState {
            pixels: RgbaImage::new(size("width", DEFAULT_CANVAS_SIZE.0), size("height", DEFAULT_CANVAS_SIZE.1)),
            tainted: false,
        })
    }
}

fn import_element(
    doc: &mut Document,
    element: ElementRef<'_>,
    parent_namespace: Namespace,
    parent_name: &str,
    elements: &mut Vec<NodeId>,
) -> NodeId {
    let value = element.value();
    let local = value.name();
    let namespace = if local == "svg" || (parent_namespace == Namespace::Svg && parent_name != "foreignObject") {
        Namespace::Svg
    } else {
        Namespace::Html
    };
    let mut el = Element::new(local, namespace);
    for (name, value) in value.attrs() {
        if name == "style" {
            el.style = Declarations::parse(value);
        } else {
            el.attrs.push((name.to_string(), value.to_string()));
        }
    }
    let id = doc.create_node(NodeData::Element(el));
    elements.push(id);
    for child in element.children() {
        let imported = match child.value() {
            HtmlNode::Element(_) => {
                ElementRef::wrap(child).map(|c| import_element(doc, c, namespace, local, elements))
            }
            HtmlNode::Text(text) => Some(doc.create_text(&**text)),
            HtmlNode::Comment(comment) => Some(doc.create_node(NodeData::Comment((**comment).to_string()))),
            _ => None,
        };
        if let Some(imported) = imported {
            doc.append_child(id, imported);
        }
    }
    id
}

impl Host for StaticPage {
    type Node = NodeId;
    type Raster = SoftwareRaster;

    fn engine(&self) -> BrowserEngine {
        self.engine
    }

    fn base_url(&self) -> Option<Url> {
        self.base.clone()
    }

    fn node_kind(&self, node: &NodeId) -> NodeKind {
        match self.doc.data(*node) {
            NodeData::Element(_) => NodeKind::Element,
            NodeData::Text(_) => NodeKind::Text,
            NodeData::Comment(_) => NodeKind::Comment,
            NodeData::Raw(_) => NodeKind::Other,
        }
    }

    fn text(&self, node: &NodeId) -> Option<String> {
        match self.doc.data(*node) {
            NodeData::Text(t) | NodeData::Comment(t) => Some(t.clone()),
            _ => None,
        }
    }

    fn element_name(&self, node: &NodeId) -> Option<ElementName> {
        self.doc.element(*node).map(|el| ElementName {
            local: el.name.clone(),
            namespace: el.namespace,
        })
    }

    fn attributes(&self, node: &NodeId) -> Vec<(String, String)> {
        let Some(el) = self.doc.element(*node) else { return Vec::new() };
        let mut attrs = el.attrs.clone();
        if !el.style.is_empty() {
            attrs.push(("style".to_string(), el.style.to_css_text()));
        }
        attrs
    }

    fn children(&self, node: &NodeId) -> Vec<NodeId> {
        self.doc.children(*node).to_vec()
    }

    fn shadow_children(&self, node: &NodeId) -> Option<Vec<NodeId>> {
        self.shadow_roots
            .get(node)
            .map(|container| self.doc.children(*container).to_vec())
    }

    fn assigned_nodes(&self, node: &NodeId) -> Option<Vec<NodeId>> {
        let mut ancestor = self.doc.parent(*node);
        let host = loop {
            let current = ancestor?;
            if let Some(host) = self.shadow_hosts.get(&current) {
                break *host;
            }
            ancestor = self.doc.parent(current);
        };
        let name = self.doc.element(*node)?.attr("name").unwrap_or("").to_string();
        let assigned: Vec<NodeId> = self
            .doc
            .children(host)
            .iter()
            .copied()
            .filter(|c| match self.doc.data(*c) {
                NodeData::Element(el) => el.attr("slot").unwrap_or("") == name,
                NodeData::Text(t) => name.is_empty() && !t.trim().is_empty(),
                _ => false,
            })
            .collect();
        (!assigned.is_empty()).then_some(assigned)
    }

    fn computed_style(&self, node: &NodeId, pseudo: Option<&str>) -> Result<ComputedStyle> {
        let mut style = self.cascaded(*node, pseudo)?.as_ref().clone();
        if pseudo.is_none() && !Self::is_hidden(&style) {
            style.set("width", format!("{}px", self.layout_width(*node)), false);
            style.set("height", format!("{}px", self.layout_height(*node)), false);
        }
        Ok(style)
    }

    fn create_sandbox(&self) -> Result<Box<dyn Sandbox + '_>> {
        match &self.sandbox_failure {
            Some(reason) => Err(Error::Sandbox(reason.clone())),
            None => Ok(Box::new(StaticSandbox)),
        }
    }

    fn scroll_metrics(&self, node: &NodeId) -> ScrollMetrics {
        if let Some(metrics) = self.live.scroll.get(node) {
            return *metrics;
        }
        let (width, height) = (self.layout_width(*node), self.layout_height(*node));
        let borders = self.cascaded(*node, None).map_or((0.0, 0.0), |s| {
            (
                self.px(&s, "border-left-width") + self.px(&s, "border-right-width"),
                self.px(&s, "border-top-width") + self.px(&s, "border-bottom-width"),
            )
        });
        let client_width = (width - borders.0).max(0.0);
        let client_height = (height - borders.1).max(0.0);
        ScrollMetrics {
            scroll_left: 0.0,
            scroll_top: 0.0,
            scroll_width: client_width,
            scroll_height: client_height,
            client_width,
            client_height,
        }
    }

    fn bounding_box(&self, node: &NodeId) -> Option<(f64, f64)> {
        self.doc.element(*node)?;
        Some((self.layout_width(*node), self.layout_height(*node)))
    }

    fn style_sheets(&self) -> Vec<StyleSheet> {
        self.documents
            .first()
            .map(|main| main.sheets.clone())
            .unwrap_or_default()
    }

    fn find_svg_definition(&self, id: &str) -> Option<NodeId> {
        self.doc.descendants(self.root).into_iter().find(|n| {
            self.doc
                .element(*n)
                .map_or(false, |el| el.namespace == Namespace::Svg && el.attr("id") == Some(id))
        })
    }

    fn form_value(&self, node: &NodeId) -> Option<String> {
        if let Some(value) = self.live.form_values.get(node) {
            return Some(value.clone());
        }
        let (tag, namespace) = self.element_tag(*node)?;
        if namespace != Namespace::Html {
            return None;
        }
        match tag.as_str() {
            "input" => self.doc.element(*node)?.attr("value").map(str::to_string),
            "textarea" => Some(self.doc.text_content(*node)),
            "select" => {
                let options: Vec<NodeId> = self
                    .doc
                    .descendants(*node)
                    .into_iter()
                    .filter(|n| self.is_html(*n, "option"))
                    .collect();
                let selected = options
                    .iter()
                    .find(|o| self.doc.element(**o).map_or(false, |e| e.has_attr("selected")))
                    .or(options.first())?;
                let el = self.doc.element(*selected)?;
                Some(
                    el.attr("value")
                        .map(str::to_string)
                        .unwrap_or_else(|| self.doc.text_content(*selected).trim().to_string()),
                )
            }
            _ => None,
        }
    }

    fn current_src(&self, node: &NodeId) -> Option<String> {
        if let Some(src) = self.live.current_src.get(node) {
            return Some(src.clone());
        }
        if !self.is_html(*node, "img") {
            return None;
        }
        let src = self.doc.element(*node)?.attr("src")?;
        Some(resolve_url(src, self.base.as_ref()))
    }

    fn canvas_data_url(&self, node: &NodeId) -> Result<String> {
        let state = self
            .canvas_state(*node)
            .ok_or_else(|| Error::Unsupported("not a canvas".to_string()))?;
        if state.tainted {
            return Err(Error::Render("canvas is tainted by cross-origin data".to_string()));
        }
        encode_png_data_url(&state.pixels)
    }

    fn canvas_pixels(&self, node: &NodeId) -> Result<RgbaImage> {
        self.canvas_state(*node)
            .map(|state| state.pixels)
            .ok_or_else(|| Error::Unsupported("not a canvas".to_string()))
    }

    fn frame_body(&self, node: &NodeId) -> Result<Option<NodeId>> {
        Ok(self.frames.get(node).copied())
    }

    fn video(&self, node: &NodeId) -> Option<VideoState> {
        self.live
            .videos
            .get(node)
            .cloned()
            .or_else(|| self.derived_video(*node))
    }

    fn wait_media_ready<'a>(&'a self, node: &'a NodeId) -> LocalBoxFuture<'a, MediaLoad> {
        let subtree = self.doc.descendants(*node);
        if subtree.iter().any(|n| self.live.pending_media.contains(n)) {
            return Box::pin(future::pending());
        }
        let failure = subtree.iter().find_map(|n| self.live.failed_media.get(n)).cloned();
        Box::pin(future::ready(match failure {
            Some(reason) => MediaLoad::Failed(reason),
            None => MediaLoad::Ready,
        }))
    }

    fn capture_video_frame<'a>(&'a self, node: &'a NodeId, _time: f64) -> LocalBoxFuture<'a, Result<String>> {
        let frame = self
            .live
            .video_frames
            .get(node)
            .cloned()
            .ok_or_else(|| Error::Unsupported("video frame capture".to_string()));
        Box::pin(future::ready(frame))
    }

    fn fetch(&self, request: FetchRequest) -> LocalBoxFuture<'_, Result<FetchResponse>> {
        self.store.record(&request.url);
        if self.store.is_pending(&request.url) {
            return Box::pin(future::pending());
        }
        match self.store.local(&request.url) {
            Some(result) => Box::pin(future::ready(result)),
            None => self.fetcher.network(request),
        }
    }

    fn raster(&self) -> &SoftwareRaster {
        &self.raster
    }

    fn blocking_fetcher(&self) -> Option<Arc<dyn BlockingFetch>> {
        Some(self.fetcher.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PAGE: &str = r#"<!doctype html>
<html><head><style>
  p { color: blue; margin: 0 }
  .note { color: green; padding: 4px }
  #main .note::before { content: "*"; color: red }
</style></head>
<body>
  <div id="main" style="width: 200px">
    <p class="note">Hello <b>world</b></p>
    <p style="color: orange !important" class="note">Other</p>
  </div>
  <svg width="10" height="10"><defs><circle id="dot" r="2"/></defs></svg>
</body></html>"#;

    #[test]
    fn cascade_orders_specificity_and_importance() {
        let page = StaticPage::parse(PAGE, None);
        let notes = page.select_all(".note");
        assert_eq!(notes.len(), 2);
        let first = page.computed_style(&notes[0], None).unwrap();
        assert_eq!(first.value("color"), Some("rgb(0, 128, 0)"));
        assert_eq!(first.value("padding-left"), Some("4px"));
        let second = page.computed_style(&notes[1], None).unwrap();
        assert_eq!(second.value("color"), Some("rgb(255, 165, 0)"));

        let bold = page.select("b").unwrap();
        let inherited = page.computed_style(&bold, None).unwrap();
        assert_eq!(inherited.value("color"), Some("rgb(0, 128, 0)"));
        assert_eq!(inherited.value("font-weight"), Some("700"));
    }

    #[test]
    fn pseudo_element_styles() {
        let page = StaticPage::parse(PAGE, None);
        let note = page.select(".note").unwrap();
        let before = page.computed_style(&note, Some(":before")).unwrap();
        assert_eq!(before.value("content"), Some("\"*\""));
        assert_eq!(before.value("color"), Some("rgb(255, 0, 0)"));
        let after = page.computed_style(&note, Some(":after")).unwrap();
        assert_eq!(after.value("content"), Some("none"));
    }

    #[test]
    fn boxes_follow_specified_and_containing_widths() {
        let page = StaticPage::parse(PAGE, None);
        let main = page.select("#main").unwrap();
        let note = page.select(".note").unwrap();
        assert_eq!(page.bounding_box(&main).unwrap().0, 200.0);
        let (width, height) = page.bounding_box(&note).unwrap();
        assert_eq!(width, 200.0);
        assert!(height > 8.0);
        let style = page.computed_style(&main, None).unwrap();
        assert_eq!(style.value("width"), Some("200px"));
    }

    #[test]
    fn svg_namespace_and_definitions() {
        let page = StaticPage::parse(PAGE, None);
        let dot = page.find_svg_definition("dot").unwrap();
        let name = page.element_name(&dot).unwrap();
        assert!(name.is_svg());
        assert_eq!(name.local, "circle");
        let body = page.body().unwrap();
        assert_eq!(page.element_name(&body).unwrap().namespace, Namespace::Html);
    }

    #[test]
    fn shadow_roots_assign_slots() {
        let mut page = StaticPage::parse(
            r#"<div id="host"><span slot="title">T</span>body text</div>"#,
            None,
        );
        let host = page.select("#host").unwrap();
        page.attach_shadow(host, r#"<h2><slot name="title"></slot></h2><slot></slot>"#);
        let shadow = page.shadow_children(&host).unwrap();
        assert_eq!(shadow.len(), 2);
        let named = page.document().first_child(shadow[0]).unwrap();
        let assigned = page.assigned_nodes(&named).unwrap();
        assert_eq!(page.element_name(&assigned[0]).unwrap().local, "span");
        let default = page.assigned_nodes(&shadow[1]).unwrap();
        assert_eq!(page.text(&default[0]).as_deref(), Some("body text"));
    }

    #[test]
    fn srcdoc_frames_expose_their_body() {
        let page = StaticPage::parse(r#"<iframe srcdoc="<p>inside</p>"></iframe>"#, None);
        let frame = page.select("iframe").unwrap();
        let body = page.frame_body(&frame).unwrap().unwrap();
        assert_eq!(page.document().text_content(body), "inside");
    }

    #[tokio::test]
    async fn resources_are_served_and_counted() {
        let mut page = StaticPage::parse("<p>x</p>", Some("https://example.test/"));
        page.add_resource("https://example.test/a.png", "image/png", vec![1, 2, 3]);
        page.add_missing_resource("https://example.test/gone.png", 404);
        let ok = page
            .fetch(FetchRequest::new("https://example.test/a.png", ResponseKind::DataUrl))
            .await
            .unwrap();
        assert_eq!(ok.body, vec![1, 2, 3]);
        assert_eq!(ok.content_type.as_deref(), Some("image/png"));
        let missing = page
            .fetch(FetchRequest::new("https://example.test/gone.png", ResponseKind::DataUrl))
            .await;
        assert!(matches!(missing, Err(Error::Fetch { .. })));
        assert_eq!(page.request_count("https://example.test/a.png"), 1);

        let data = page
            .fetch(FetchRequest::new("data:text/plain;base64,aGk=", ResponseKind::Text))
            .await
            .unwrap();
        assert_eq!(data.body, b"hi".to_vec());
        assert_eq!(data.content_type.as_deref(), Some("text/plain"));
    }

    #[tokio::test]
    async fn linked_stylesheets_load_from_the_store() {
        let mut page = StaticPage::parse(
            r#"<link rel="stylesheet" href="site.css"><p id="t">x</p>"#,
            Some("https://example.test/"),
        );
        page.add_resource("https://example.test/site.css", "text/css", "#t { color: #f00 }");
        assert_eq!(page.style_sheets()[0].rules, None);
        page.load_stylesheets().await;
        let t = page.select("#t").unwrap();
        assert_eq!(page.computed_style(&t, None).unwrap().value("color"), Some("rgb(255, 0, 0)"));
        assert_eq!(page.style_sheets()[0].href.as_deref(), Some("https://example.test/site.css"));
    }

    #[test]
    fn form_values_and_canvas_defaults() {
        let page = StaticPage::parse(
            r#"<input id="i" value="typed"><select id="s"><option>a</option><option value="b" selected>B</option></select><canvas id="c" width="4" height="2"></canvas>"#,
            None,
        );
        assert_eq!(page.form_value(&page.select("#i").unwrap()).as_deref(), Some("typed"));
        assert_eq!(page.form_value(&page.select("#s").unwrap()).as_deref(), Some("b"));
        let canvas = page.select("#c").unwrap();
        assert_eq!(page.canvas_pixels(&canvas).unwrap().dimensions(), (4, 2));
        assert!(page.canvas_data_url(&canvas).unwrap().starts_with("data:image/png;base64,"));
    }

    #[test]
    fn sandbox_reports_user_agent_defaults() {
        let mut page = StaticPage::parse("<p>x</p>", None);
        let sandbox = page.create_sandbox().unwrap();
        let div = sandbox.default_style(&ElementName::html("div"), &[], None).unwrap();
        assert_eq!(div.value("display"), Some("block"));
        assert_eq!(div.value("color"), Some("rgb(0, 0, 0)"));
        drop(sandbox);
        page.set_sandbox_failure("no document");
        assert!(matches!(page.create_sandbox(), Err(Error::Sandbox(_))));
    }
}
