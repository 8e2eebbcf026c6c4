//! Capture orchestration and batch export

use crate::clone::copy_host_subtree;
use crate::context::CaptureContext;
use crate::dom::NodeId;
use crate::embed::TaskQueue;
use crate::platform::{Host, NodeKind};
use crate::rendering::dpi::change_dpi;
use crate::rendering::{rasterize, RasterOptions, EMPTY_DATA_URL};
use crate::svg::svg_to_data_url;
use crate::{CaptureConfig, Error, FilterNode, NodeFilter, OutputType, ProgressHandler, Result};
use log::{debug, error, warn};
use serde::Deserialize;
use std::sync::Arc;
use std::time::Instant;

impl<'h, H: Host> CaptureContext<'h, H> {
    /// Clone, embed and wrap the root in a `foreignObject` SVG.
    ///
    /// Returns the `<svg>` node of [`CaptureContext::document`]. A root that
    /// is itself an `<svg>` element is copied as is.
    pub async fn foreign_object_svg(&mut self) -> Result<NodeId> {
        self.ensure_alive()?;
        self.reset_render_state();
        let this: &Self = self;
        this.build_svg().await
    }

    async fn build_svg(&self) -> Result<NodeId> {
        let root_name = self.host.element_name(&self.root);
        if root_name.as_ref().map_or(false, |n| n.is_svg() && n.tag() == "svg") {
            let mut doc = self.document.borrow_mut();
            return copy_host_subtree(self.host, &mut doc, &self.root)
                .ok_or_else(|| Error::Serialize("svg root could not be copied".to_string()));
        }

        let started = Instant::now();
        let clone = self
            .clone_node(self.root.clone(), true, None, None)
            .await
            .ok_or_else(|| Error::Serialize("capture root produced no clone".to_string()))?;
        self.log_phase("clone node", started);
        if let Some(hook) = &self.config.on_clone_node {
            hook(&mut self.document.borrow_mut(), clone);
        }

        let queue = TaskQueue::new();
        if self.config.font.is_some() && self.document.borrow().element(clone).is_some() {
            let started = Instant::now();
            self.embed_web_font(&queue).await;
            self.log_phase("embed web font", started);
        }

        let started = Instant::now();
        self.embed_node(&queue, clone);
        debug!("{} running {} embed tasks", self.log_prefix(), queue.len());
        queue.drain(self.config.progress.as_ref(), &self.log_prefix()).await;
        self.log_phase("embed node", started);
        if let Some(hook) = &self.config.on_embed_node {
            hook(&mut self.document.borrow_mut(), clone);
        }

        let svg = self.assemble_svg(clone);
        if let Some(hook) = &self.config.on_create_foreign_object_svg {
            hook(&mut self.document.borrow_mut(), svg);
        }
        Ok(svg)
    }

    /// Serialized markup of a fresh `foreignObject` SVG.
    pub async fn svg_markup(&mut self) -> Result<String> {
        let result = match self.foreign_object_svg().await {
            Ok(svg) => Ok(self.document.borrow().serialize(svg)),
            Err(e) => Err(e),
        };
        self.finish();
        result
    }

    /// Render with the configured output type and return a data URL.
    ///
    /// The context is destroyed afterwards unless `reuse_context` is set.
    pub async fn render(&mut self) -> Result<String> {
        self.ensure_alive()?;
        let result = self.render_once().await;
        self.finish();
        result
    }

    /// [`render`](Self::render) with a different output type.
    pub async fn render_as(&mut self, output: OutputType) -> Result<String> {
        self.config.output = output;
        self.render().await
    }

    async fn render_once(&mut self) -> Result<String> {
        let svg = self.foreign_object_svg().await?;
        let markup = self.document.borrow().serialize(svg);
        let svg_url = svg_to_data_url(&markup, self.config.features.remove_control_character);
        let output = self.config.output;
        if output == OutputType::Svg {
            return Ok(svg_url);
        }

        let options = RasterOptions {
            width: self.width,
            height: self.height,
            scale: self.config.scale,
            maximum_canvas_size: self.config.maximum_canvas_size,
            background_color: self.config.background_color.clone(),
            output,
            quality: self.config.quality,
            timeout_ms: self.config.timeout_ms,
            redraws: if self.config.features.fix_svg_xml_decode {
                self.draw_image_count.get()
            } else {
                0
            },
            draw_interval_ms: self.config.draw_image_interval_ms,
        };
        let started = Instant::now();
        let data_url = rasterize(self.host.raster(), &svg_url, &options, &self.log_prefix()).await?;
        self.draw_image_count.set(0);
        self.log_phase("image to canvas", started);

        let Some(dpi) = self.dpi() else { return Ok(data_url) };
        if !matches!(output, OutputType::Png | OutputType::Jpeg) || data_url == EMPTY_DATA_URL {
            return Ok(data_url);
        }
        match change_dpi(&data_url, output, dpi) {
            Ok(patched) => Ok(patched),
            Err(e) => {
                warn!("{} failed to write {} dpi: {}", self.log_prefix(), dpi, e);
                Ok(data_url)
            }
        }
    }

    fn finish(&mut self) {
        if !self.config.reuse_context {
            self.destroy();
        }
    }
}

/// Per-target export options
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct ImageOptions {
    pub label: String,
    pub format: OutputType,
    /// One image is produced per scale
    pub scales: Vec<f64>,
    pub quality: f64,
    pub include_scale_in_label: bool,
}

impl Default for ImageOptions {
    fn default() -> Self {
        Self {
            label: "image".to_string(),
            format: OutputType::Jpeg,
            scales: vec![1.0],
            quality: 1.0,
            include_scale_in_label: false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CaptureTarget<N> {
    pub node: N,
    pub options: ImageOptions,
}

/// A named capture result. Both fields are empty when the capture failed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CapturedImage {
    pub data_url: String,
    pub file_name: String,
}

/// Hands out file names unique within one batch.
#[derive(Debug, Clone, Default)]
pub struct FileNamer {
    taken: Vec<String>,
}

impl FileNamer {
    pub fn new() -> Self {
        Self::default()
    }

    /// `label[_@{scale}x].{ext}`, or the next free `-N` variant of it.
    pub fn name(&mut self, label: &str, scale: Option<f64>, output: OutputType) -> String {
        let extension = output.extension();
        let stem = match scale {
            Some(scale) => format!("{}_@{}x", label, scale),
            None => label.to_string(),
        };
        let proposed = format!("{}.{}", stem, extension);
        if !self.taken.contains(&proposed) {
            self.taken.push(proposed.clone());
            return proposed;
        }

        let (base, mut counter) = match split_counter(&stem) {
            Some((base, n)) => (base, n + 1),
            None => (stem.as_str(), 2),
        };
        let mut candidate = format!("{}-{}.{}", base, counter, extension);
        while self.taken.contains(&candidate) {
            counter += 1;
            candidate = format!("{}-{}.{}", base, counter, extension);
        }
        self.taken.push(candidate.clone());
        candidate
    }
}

/// `("label", 3)` for `"label-3"`
fn split_counter(stem: &str) -> Option<(&str, u64)> {
    let (base, digits) = stem.rsplit_once('-')?;
    if digits.is_empty() || !digits.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok().map(|n| (base, n))
}

/// Node filter that drops elements carrying `data-ignore-capture`
pub fn ignore_marked_elements() -> NodeFilter {
    Arc::new(|node: &FilterNode<'_>| {
        node.kind != NodeKind::Element || !node.has_attribute("data-ignore-capture")
    })
}

fn is_hidden<H: Host>(host: &H, node: &H::Node) -> bool {
    let style = match host.computed_style(node, None) {
        Ok(style) => style,
        Err(_) => return false,
    };
    let zero_size = host
        .bounding_box(node)
        .map_or(true, |(w, h)| w <= 0.0 || h <= 0.0);
    style.value("display") == Some("none")
        || style.value("visibility").map_or(false, |v| v != "visible")
        || style
            .value("opacity")
            .and_then(|o| o.trim().parse::<f64>().ok())
            .map_or(false, |o| o == 0.0)
        || zero_size
}

fn has_transparent_background<H: Host>(host: &H, node: &H::Node) -> bool {
    let Ok(style) = host.computed_style(node, None) else { return false };
    let color = style.value("background-color").unwrap_or("rgba(0, 0, 0, 0)");
    let image = style.value("background-image").unwrap_or("none");
    matches!(color, "rgba(0, 0, 0, 0)" | "transparent") && image == "none"
}

/// Capture every visible target at each of its scales.
///
/// Hidden targets are skipped. `on_image` receives `(n, total)` before the
/// n-th image starts. A failed capture yields an empty [`CapturedImage`].
pub async fn capture_batch<H: Host>(
    host: &H,
    targets: &[CaptureTarget<H::Node>],
    base: &CaptureConfig,
    on_image: Option<&ProgressHandler>,
) -> Vec<CapturedImage> {
    let visible: Vec<&CaptureTarget<H::Node>> = targets.iter().filter(|t| !is_hidden(host, &t.node)).collect();
    if visible.len() != targets.len() {
        debug!("skipping {} hidden elements", targets.len() - visible.len());
    }
    let total: usize = visible.iter().map(|t| t.options.scales.len()).sum();

    let mut namer = FileNamer::new();
    let mut images = Vec::with_capacity(total);
    let mut number = 0;
    for target in visible {
        let options = &target.options;
        let include_scale = options.include_scale_in_label || options.scales.len() > 1;
        for &scale in &options.scales {
            number += 1;
            if let Some(progress) = on_image {
                progress(number, total);
            }
            let mut config = CaptureConfig {
                scale,
                quality: options.quality,
                output: options.format,
                filter: base.filter.clone().or_else(|| Some(ignore_marked_elements())),
                ..base.clone()
            };
            if options.format == OutputType::Jpeg && has_transparent_background(host, &target.node) {
                config.style.push(("background-color".to_string(), "#FFFFFF".to_string()));
            }
            match crate::dom_to_data_url(host, &target.node, config).await {
                Ok(data_url) => images.push(CapturedImage {
                    data_url,
                    file_name: namer.name(&options.label, include_scale.then_some(scale), options.format),
                }),
                Err(e) => {
                    error!("failed to capture '{}': {}", options.label, e);
                    images.push(CapturedImage::default());
                }
            }
        }
    }
    images
}
