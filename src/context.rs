//! Per-capture configuration and caches

use crate::dom::{Document, NodeId};
use crate::embed::PendingRequest;
use crate::platform::{BrowserEngine, Host, MediaLoad, Sandbox};
use crate::style::ComputedStyle;
use crate::worker::WorkerPool;
use crate::{CaptureConfig, Error, Result};
use log::{debug, warn};
use std::cell::{Cell, Ref, RefCell};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

static CAPTURE_SERIAL: AtomicU64 = AtomicU64::new(0);

/// State shared by every phase of one capture.
///
/// A context is created per capture and destroyed after its first render
/// unless `reuse_context` is set. Rendering takes `&mut self`, so a reused
/// context can only serve one render at a time.
pub struct CaptureContext<'h, H: Host> {
    pub(crate) host: &'h H,
    pub(crate) root: H::Node,
    pub(crate) config: CaptureConfig,
    pub(crate) width: f64,
    pub(crate) height: f64,
    pub(crate) serial: u64,
    pub(crate) sandbox: Option<Box<dyn Sandbox + 'h>>,
    pub(crate) workers: Option<Rc<WorkerPool>>,

    /// Baseline styles keyed by element signature
    pub(crate) default_computed_styles: RefCell<HashMap<String, Rc<ComputedStyle>>>,
    /// Pseudo-element rule bodies with the selectors that use them, in insertion order
    pub(crate) svg_styles: RefCell<Vec<(String, Vec<String>)>>,
    /// Characters rendered per font family
    pub(crate) font_families: RefCell<BTreeMap<String, BTreeSet<char>>>,
    /// Inlined `@font-face` CSS keyed by the original rule text
    pub(crate) font_css_texts: RefCell<HashMap<String, String>>,
    pub(crate) requests: RefCell<HashMap<String, PendingRequest<'h>>>,
    pub(crate) draw_image_count: Cell<u32>,

    /// Tree the clone and its SVG wrapper are built in
    pub(crate) document: RefCell<Document>,
    pub(crate) defs: Cell<Option<NodeId>>,
    pub(crate) pending_defs: RefCell<HashSet<String>>,
    /// Font CSS collected for the current render
    pub(crate) font_css: RefCell<Vec<String>>,
    pseudo_counter: Cell<u64>,
    destroyed: bool,
}

impl<'h, H: Host> CaptureContext<'h, H> {
    /// Prepare a capture of `root`: create the baseline sandbox, start fetch
    /// workers, wait for media in the subtree and resolve the output size.
    pub async fn new(host: &'h H, root: H::Node, config: CaptureConfig) -> Result<Self> {
        config.validate()?;
        let serial = CAPTURE_SERIAL.fetch_add(1, Ordering::Relaxed);

        let sandbox = match host.create_sandbox() {
            Ok(sandbox) => sandbox,
            Err(Error::Sandbox(reason)) => return Err(Error::Sandbox(reason)),
            Err(other) => return Err(Error::Sandbox(other.to_string())),
        };

        let workers = Self::spawn_workers(host, &config, serial);

        let mut context = Self {
            host,
            root,
            width: config.width,
            height: config.height,
            config,
            serial,
            sandbox: Some(sandbox),
            workers,
            default_computed_styles: RefCell::new(HashMap::new()),
            svg_styles: RefCell::new(Vec::new()),
            font_families: RefCell::new(BTreeMap::new()),
            font_css_texts: RefCell::new(HashMap::new()),
            requests: RefCell::new(HashMap::new()),
            draw_image_count: Cell::new(0),
            document: RefCell::new(Document::new()),
            defs: Cell::new(None),
            pending_defs: RefCell::new(HashSet::new()),
            font_css: RefCell::new(Vec::new()),
            pseudo_counter: Cell::new(0),
            destroyed: false,
        };

        let started = Instant::now();
        context.wait_until_load().await;
        context.log_phase("wait until load", started);
        context.resolve_bounding_box();
        Ok(context)
    }

    fn spawn_workers(host: &H, config: &CaptureConfig, serial: u64) -> Option<Rc<WorkerPool>> {
        if config.worker_number == 0 || host.engine() == BrowserEngine::WebKit {
            return None;
        }
        let fetcher = host.blocking_fetcher()?;
        let count = config.worker_number.min(num_cpus::get().max(1));
        match WorkerPool::spawn(count, fetcher) {
            Ok(pool) => Some(Rc::new(pool)),
            Err(e) => {
                warn!("[#{}] failed to start fetch workers: {}", serial, e);
                None
            }
        }
    }

    async fn wait_until_load(&self) {
        let limit = Duration::from_millis(self.config.timeout_ms);
        match tokio::time::timeout(limit, self.host.wait_media_ready(&self.root)).await {
            Ok(MediaLoad::Ready) => {}
            Ok(MediaLoad::Failed(reason)) => {
                warn!("{} media failed to load, rendering anyway: {}", self.log_prefix(), reason)
            }
            Err(_) => warn!(
                "{} media not ready after {}ms, rendering anyway",
                self.log_prefix(),
                self.config.timeout_ms
            ),
        }
    }

    fn resolve_bounding_box(&mut self) {
        if self.width > 0.0 && self.height > 0.0 {
            return;
        }
        let (box_width, box_height) = self.host.bounding_box(&self.root).unwrap_or((0.0, 0.0));
        let attributes = self.host.attributes(&self.root);
        let attr = |name: &str| {
            attributes
                .iter()
                .find(|(k, _)| k == name)
                .and_then(|(_, v)| v.trim().parse::<f64>().ok())
                .unwrap_or(0.0)
        };
        let width = if box_width > 0.0 { box_width } else { attr("width") };
        let height = if box_height > 0.0 { box_height } else { attr("height") };
        if self.width <= 0.0 {
            self.width = width;
        }
        if self.height <= 0.0 {
            self.height = height;
        }
    }

    pub fn width(&self) -> f64 {
        self.width
    }

    pub fn height(&self) -> f64 {
        self.height
    }

    pub fn dpi(&self) -> Option<f64> {
        self.config.dpi()
    }

    pub fn config(&self) -> &CaptureConfig {
        &self.config
    }

    pub fn config_mut(&mut self) -> &mut CaptureConfig {
        &mut self.config
    }

    /// Tree holding the most recent clone and SVG
    pub fn document(&self) -> Ref<'_, Document> {
        self.document.borrow()
    }

    /// Number of distinct URLs requested so far
    pub fn request_count(&self) -> usize {
        self.requests.borrow().len()
    }

    pub fn font_families(&self) -> BTreeMap<String, BTreeSet<char>> {
        self.font_families.borrow().clone()
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed
    }

    pub(crate) fn log_prefix(&self) -> String {
        format!("[#{}]", self.serial)
    }

    pub(crate) fn log_phase(&self, label: &str, started: Instant) {
        if self.config.debug {
            debug!("{} {}: {:?}", self.log_prefix(), label, started.elapsed());
        }
    }

    /// Unique class name for a materialized pseudo-element
    pub(crate) fn next_pseudo_class(&self) -> String {
        let n = self.pseudo_counter.get() + 1;
        self.pseudo_counter.set(n);
        format!("u{:x}{}", self.serial, n)
    }

    pub(crate) fn ensure_alive(&self) -> Result<()> {
        if self.destroyed {
            Err(Error::Config("capture context was destroyed".to_string()))
        } else {
            Ok(())
        }
    }

    /// Clear per-render SVG state so a reused context starts fresh.
    pub(crate) fn reset_render_state(&self) {
        *self.document.borrow_mut() = Document::new();
        self.defs.set(None);
        self.pending_defs.borrow_mut().clear();
        self.svg_styles.borrow_mut().clear();
        self.font_css.borrow_mut().clear();
        self.draw_image_count.set(0);
    }

    /// Drop caches, the sandbox and the worker pool.
    pub fn destroy(&mut self) {
        if self.destroyed {
            return;
        }
        self.reset_render_state();
        self.default_computed_styles.borrow_mut().clear();
        self.font_families.borrow_mut().clear();
        self.font_css_texts.borrow_mut().clear();
        self.requests.borrow_mut().clear();
        self.sandbox = None;
        if let Some(pool) = self.workers.take() {
            pool.shutdown();
        }
        self.destroyed = true;
    }
}

impl<'h, H: Host> Drop for CaptureContext<'h, H> {
    fn drop(&mut self) {
        self.destroy();
    }
}
