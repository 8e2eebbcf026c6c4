//! Resource embedding: the deduplicated fetch pipeline and the task drain

use crate::context::CaptureContext;
use crate::css::{has_css_url, is_data_url, parse_css_urls, replace_css_url, resolve_url};
use crate::dom::{Element, Namespace, NodeId};
use crate::platform::{BrowserEngine, FetchRequest, FetchResponse, Host, ResponseKind};
use crate::{Error, ProgressHandler, Result};
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use futures::future::{join_all, LocalBoxFuture, Shared};
use futures::FutureExt;
use log::{debug, warn};
use std::cell::{Cell, RefCell};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use url::Url;

/// Style properties that may reference images
const IMAGE_PROPERTIES: [&str; 5] = [
    "background-image",
    "border-image-source",
    "-webkit-border-image",
    "-webkit-mask-image",
    "list-style-image",
];

/// Concurrent pullers draining the task list
const TASK_PULLERS: usize = 4;

/// A settled fetch
#[derive(Debug, Clone, PartialEq)]
pub enum Resolved {
    DataUrl(String),
    Text(String),
    Bytes(Vec<u8>),
}

impl Resolved {
    pub fn from_response(response: FetchResponse, kind: ResponseKind) -> Result<Self> {
        Ok(match kind {
            ResponseKind::DataUrl => {
                let mime = response
                    .content_type
                    .as_deref()
                    .map(|c| c.split(';').next().unwrap_or(c).trim())
                    .filter(|c| !c.is_empty())
                    .unwrap_or("application/octet-stream");
                Resolved::DataUrl(format!("data:{};base64,{}", mime, STANDARD.encode(&response.body)))
            }
            ResponseKind::Text => Resolved::Text(String::from_utf8_lossy(&response.body).into_owned()),
            ResponseKind::Bytes => Resolved::Bytes(response.body),
        })
    }

    pub fn into_data_url(self) -> Result<String> {
        match self {
            Resolved::DataUrl(url) => Ok(url),
            other => Err(Error::Other(format!("expected a data URL, got {:?}", other.kind()))),
        }
    }

    pub fn into_text(self) -> Result<String> {
        match self {
            Resolved::Text(text) => Ok(text),
            Resolved::Bytes(bytes) => Ok(String::from_utf8_lossy(&bytes).into_owned()),
            Resolved::DataUrl(_) => Err(Error::Other("expected text, got a data URL".to_string())),
        }
    }

    fn kind(&self) -> ResponseKind {
        match self {
            Resolved::DataUrl(_) => ResponseKind::DataUrl,
            Resolved::Text(_) => ResponseKind::Text,
            Resolved::Bytes(_) => ResponseKind::Bytes,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RequestKind {
    Image,
    Text,
}

pub(crate) type SharedResponse<'h> = Shared<LocalBoxFuture<'h, Result<Resolved>>>;

/// Settle-once fetch registered under its URL
pub(crate) struct PendingRequest<'h> {
    pub(crate) kind: RequestKind,
    pub(crate) response: SharedResponse<'h>,
}

pub(crate) type Task<'a> = LocalBoxFuture<'a, Result<()>>;

/// Embedding work collected for one render
#[derive(Default)]
pub(crate) struct TaskQueue<'a> {
    tasks: RefCell<Vec<Task<'a>>>,
}

impl<'a> TaskQueue<'a> {
    pub(crate) fn new() -> Self {
        Self {
            tasks: RefCell::new(Vec::new()),
        }
    }

    pub(crate) fn push(&self, task: Task<'a>) {
        self.tasks.borrow_mut().push(task);
    }

    pub(crate) fn len(&self) -> usize {
        self.tasks.borrow().len()
    }

    /// Run every queued task to completion. Failures are logged, never propagated.
    pub(crate) async fn drain(&self, progress: Option<&ProgressHandler>, prefix: &str) {
        let total = self.len();
        let completed = Cell::new(0usize);
        if let Some(progress) = progress {
            progress(0, total);
        }
        join_all((0..TASK_PULLERS).map(|_| self.pull(&completed, total, progress, prefix))).await;
    }

    async fn pull(
        &self,
        completed: &Cell<usize>,
        total: usize,
        progress: Option<&ProgressHandler>,
        prefix: &str,
    ) {
        loop {
            let next = self.tasks.borrow_mut().pop();
            let Some(task) = next else { break };
            if let Err(e) = task.await {
                warn!("{} failed to run task: {}", prefix, e);
            }
            completed.set(completed.get() + 1);
            if let Some(progress) = progress {
                progress(completed.get(), total);
            }
        }
    }
}

fn timestamp_millis() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or(0)
}

enum EmbedJob {
    Image { id: NodeId, attr: &'static str, src: String, element: Element },
    Use { id: NodeId, attr: &'static str, href: String },
    StyleImage { id: NodeId, property: &'static str, value: String },
}

impl<'h, H: Host> CaptureContext<'h, H> {
    fn counts_draws(&self) -> bool {
        matches!(self.host.engine(), BrowserEngine::WebKit | BrowserEngine::Gecko)
    }

    pub(crate) fn accept_of_image(&self) -> String {
        let webp = if self.host.supports_webp() { "image/webp," } else { "" };
        format!("{}image/svg+xml,image/*,*/*;q=0.8", webp)
    }

    fn cache_busted(&self, url: &str) -> String {
        let busting = &self.config.fetch.cache_busting;
        if busting.iter().any(|fragment| url.contains(fragment.as_str())) {
            let sep = if url.contains('?') { '&' } else { '?' };
            format!("{}{}{}", url, sep, timestamp_millis())
        } else {
            url.to_string()
        }
    }

    fn placeholder_for(&self, element: Option<&Element>) -> Option<String> {
        match &self.config.fetch.placeholder_with {
            Some(callback) => Some(callback(element)),
            None => self.config.fetch.placeholder_image.clone(),
        }
    }

    /// Fetch `url` through the request cache.
    ///
    /// The first call for a URL starts the fetch; later calls share its
    /// outcome. Image requests that fail settle with the placeholder.
    pub(crate) fn fetch_resource(
        &self,
        url: &str,
        kind: RequestKind,
        response: ResponseKind,
        element: Option<&Element>,
    ) -> SharedResponse<'h> {
        if kind == RequestKind::Image && self.counts_draws() {
            self.draw_image_count.set(self.draw_image_count.get() + 1);
        }
        if let Some(pending) = self.requests.borrow().get(url) {
            if pending.kind != kind {
                debug!("{} reusing {:?} request for {} as {:?}", self.log_prefix(), pending.kind, url, kind);
            }
            return pending.response.clone();
        }

        let mut request = FetchRequest::new(self.cache_busted(url), response);
        request.timeout_ms = self.config.timeout_ms;
        request.headers = self.config.fetch.headers.clone();
        let cache = if self.config.fetch.bypassing_cache { "no-cache" } else { "max-stale" };
        request.headers.push(("Cache-Control".to_string(), cache.to_string()));
        if kind == RequestKind::Image {
            request.headers.push(("Accept".to_string(), self.accept_of_image()));
        }

        let host = self.host;
        let slot = self.requests.borrow().len();
        let workers = self.workers.clone().filter(|pool| {
            pool.len() > 0 && host.engine() != BrowserEngine::WebKit && url.starts_with("http")
        });
        let placeholder = match kind {
            RequestKind::Image => self.placeholder_for(element),
            RequestKind::Text => None,
        };
        let timeout_ms = self.config.timeout_ms;
        let prefix = self.log_prefix();
        let raw_url = url.to_string();

        let future = async move {
            let attempt = async {
                if let Some(pool) = &workers {
                    match pool.dispatch(slot, request.clone()) {
                        Ok(reply) => match reply.await {
                            Ok(result) => return result,
                            Err(_) => warn!("{} fetch worker dropped {}, fetching on main thread", prefix, raw_url),
                        },
                        Err(e) => warn!("{} {}, fetching {} on main thread", prefix, e, raw_url),
                    }
                }
                let response = host.fetch(request.clone()).await?;
                Resolved::from_response(response, request.kind)
            };
            let result = match tokio::time::timeout(Duration::from_millis(timeout_ms), attempt).await {
                Ok(result) => result,
                Err(_) => Err(Error::Timeout(timeout_ms)),
            };
            match (result, placeholder) {
                (Ok(resolved), _) => Ok(resolved),
                (Err(e), Some(placeholder)) => {
                    warn!("{} failed to fetch image {}, using placeholder: {}", prefix, raw_url, e);
                    Ok(Resolved::DataUrl(placeholder))
                }
                (Err(e), None) => Err(e),
            }
        }
        .boxed_local()
        .shared();

        self.requests.borrow_mut().insert(
            url.to_string(),
            PendingRequest {
                kind,
                response: future.clone(),
            },
        );
        future
    }

    /// Replace every non-data `url()` in `css` with a fetched data URL.
    pub(crate) async fn replace_css_urls_with_data_urls(
        &self,
        css: String,
        base: Option<&Url>,
        is_image: bool,
    ) -> String {
        if !has_css_url(&css) {
            return css;
        }
        let kind = if is_image { RequestKind::Image } else { RequestKind::Text };
        let mut css = css;
        for (raw, url) in parse_css_urls(&css, base) {
            let fetched = self
                .fetch_resource(&url, kind, ResponseKind::DataUrl, None)
                .await
                .and_then(Resolved::into_data_url);
            match fetched {
                Ok(data_url) => css = replace_css_url(&css, &raw, &data_url),
                Err(e) => warn!("{} failed to fetch css url {}: {}", self.log_prefix(), raw, e),
            }
        }
        css
    }

    /// Queue embedding work for every reference in the clone rooted at `root`.
    pub(crate) fn embed_node<'a>(&'a self, queue: &TaskQueue<'a>, root: NodeId) {
        let jobs = self.collect_embed_jobs(root);
        let base = self.host.base_url();
        for job in jobs {
            match job {
                EmbedJob::Image { id, attr, src, element } => {
                    if is_data_url(&src) {
                        if self.counts_draws() {
                            self.draw_image_count.set(self.draw_image_count.get() + 1);
                        }
                        continue;
                    }
                    let url = resolve_url(&src, base.as_ref());
                    let response = self.fetch_resource(&url, RequestKind::Image, ResponseKind::DataUrl, Some(&element));
                    queue.push(
                        async move {
                            let data_url = response.await?.into_data_url()?;
                            if data_url.is_empty() {
                                return Ok(());
                            }
                            let mut doc = self.document.borrow_mut();
                            if let Some(el) = doc.element_mut(id) {
                                if attr == "src" {
                                    el.remove_attr("srcset");
                                }
                                el.set_attr("data-original-src", src);
                                el.set_attr(attr, data_url);
                            }
                            Ok(())
                        }
                        .boxed_local(),
                    );
                }
                EmbedJob::Use { id, attr, href } => self.embed_svg_use(queue, id, attr, &href, base.as_ref()),
                EmbedJob::StyleImage { id, property, value } => {
                    if self.counts_draws() {
                        self.draw_image_count.set(self.draw_image_count.get() + 1);
                    }
                    if !has_css_url(&value) {
                        continue;
                    }
                    let base = base.clone();
                    queue.push(
                        async move {
                            let replaced = self
                                .replace_css_urls_with_data_urls(value.clone(), base.as_ref(), true)
                                .await;
                            if replaced.is_empty() || replaced == value {
                                return Ok(());
                            }
                            let mut doc = self.document.borrow_mut();
                            if let Some(el) = doc.element_mut(id) {
                                let important = el.style.get(property).map_or(false, |d| d.important);
                                el.style.set(property, replaced, important);
                            }
                            Ok(())
                        }
                        .boxed_local(),
                    );
                }
            }
        }
    }

    fn collect_embed_jobs(&self, root: NodeId) -> Vec<EmbedJob> {
        let doc = self.document.borrow();
        let mut jobs = Vec::new();
        for id in doc.descendants(root) {
            let Some(el) = doc.element(id) else { continue };
            let tag = el.tag();
            match (el.namespace, tag.as_str()) {
                (Namespace::Html, "img") => {
                    if let Some(src) = el.attr("src").filter(|s| !s.is_empty()) {
                        jobs.push(EmbedJob::Image { id, attr: "src", src: src.to_string(), element: el.clone() });
                    }
                }
                (Namespace::Svg, "image") => {
                    if let Some((attr, href)) = svg_href(el) {
                        jobs.push(EmbedJob::Image { id, attr, src: href, element: el.clone() });
                    }
                }
                (Namespace::Svg, "use") => {
                    if let Some((attr, href)) = svg_href(el) {
                        jobs.push(EmbedJob::Use { id, attr, href });
                    }
                }
                _ => {}
            }
            if el.namespace == Namespace::Html {
                for property in IMAGE_PROPERTIES {
                    if let Some(value) = el.style.value(property).filter(|v| !v.is_empty() && *v != "none") {
                        jobs.push(EmbedJob::StyleImage { id, property, value: value.to_string() });
                    }
                }
            }
        }
        jobs
    }

    fn ensure_defs(&self) -> NodeId {
        if let Some(defs) = self.defs.get() {
            return defs;
        }
        let defs = self.document.borrow_mut().create_element("defs", Namespace::Svg);
        self.defs.set(Some(defs));
        defs
    }

    /// Pull the target of an SVG `<use>` into the shared `<defs>`.
    fn embed_svg_use<'a>(&'a self, queue: &TaskQueue<'a>, id: NodeId, attr: &'static str, href: &str, base: Option<&Url>) {
        let (svg_url, fragment) = href.split_once('#').unwrap_or((href, ""));
        if fragment.is_empty() {
            return;
        }
        if !svg_url.is_empty() {
            if let Some(el) = self.document.borrow_mut().element_mut(id) {
                el.set_attr(attr, format!("#{}", fragment));
            }
        }
        let defs = self.ensure_defs();
        let already = self.pending_defs.borrow().contains(fragment)
            || self.document.borrow().find_by_id(defs, fragment).is_some();
        if already {
            return;
        }
        if let Some(definition) = self.host.find_svg_definition(fragment) {
            let copy = {
                let mut doc = self.document.borrow_mut();
                crate::clone::copy_host_subtree(self.host, &mut doc, &definition)
            };
            if let Some(copy) = copy {
                self.document.borrow_mut().append_child(defs, copy);
            }
            self.pending_defs.borrow_mut().insert(fragment.to_string());
        } else if !svg_url.is_empty() {
            self.pending_defs.borrow_mut().insert(fragment.to_string());
            let url = resolve_url(svg_url, base);
            let response = self.fetch_resource(&url, RequestKind::Text, ResponseKind::Text, None);
            queue.push(
                async move {
                    let markup = response.await?.into_text()?;
                    let mut doc = self.document.borrow_mut();
                    let raw = doc.create_raw(markup);
                    doc.append_child(defs, raw);
                    Ok(())
                }
                .boxed_local(),
            );
        }
    }
}

fn svg_href(el: &Element) -> Option<(&'static str, String)> {
    if let Some(href) = el.attr("href").filter(|h| !h.is_empty()) {
        return Some(("href", href.to_string()));
    }
    el.attr("xlink:href")
        .filter(|h| !h.is_empty())
        .map(|h| ("xlink:href", h.to_string()))
}
