//! Rasterization of the assembled SVG
//!
//! The engine draws through [`RasterBackend`] so hosts can hand it their own
//! canvas. [`software::SoftwareRaster`] is the `image`-crate implementation
//! used by the static host.

pub mod dpi;
pub mod software;

use crate::{OutputType, Result};
use futures::future::LocalBoxFuture;
use log::warn;
use std::time::Duration;

/// Data URL a zero-sized canvas encodes to
pub const EMPTY_DATA_URL: &str = "data:,";

pub trait RasterBackend {
    type Bitmap;
    type Surface: Surface<Bitmap = Self::Bitmap>;

    /// Decode the image behind `url`
    fn load_bitmap<'a>(&'a self, url: &'a str) -> LocalBoxFuture<'a, Result<Self::Bitmap>>;

    fn create_surface(&self, width: u32, height: u32) -> Result<Self::Surface>;
}

/// A pixel canvas
pub trait Surface {
    type Bitmap;

    fn size(&self) -> (u32, u32);

    /// Fill the whole surface with a CSS color
    fn fill(&mut self, color: &str) -> Result<()>;

    /// Draw `bitmap` stretched over the whole surface
    fn draw(&mut self, bitmap: &Self::Bitmap) -> Result<()>;

    fn to_data_url(&self, output: OutputType, quality: f64) -> Result<String>;
}

/// Canvas size in device pixels for a `width` x `height` CSS box.
///
/// Each axis is `floor(size * scale)`. With a nonzero `max`, an axis over the
/// cap is set to `max` and the other shrinks by the same ratio; when both are
/// over, the larger one is capped.
pub fn canvas_size(width: f64, height: f64, scale: f64, max: u32) -> (u32, u32) {
    let mut w = (width * scale).floor().max(0.0) as u32;
    let mut h = (height * scale).floor().max(0.0) as u32;
    if max == 0 || (w <= max && h <= max) {
        return (w, h);
    }
    let shrink = |other: u32, capped: u32| (other as f64 * (max as f64 / capped as f64)) as u32;
    if (w > max && h > max && w > h) || (w > max && h <= max) {
        h = shrink(h, w);
        w = max;
    } else {
        w = shrink(w, h);
        h = max;
    }
    (w, h)
}

#[derive(Debug, Clone)]
pub struct RasterOptions {
    pub width: f64,
    pub height: f64,
    pub scale: f64,
    pub maximum_canvas_size: u32,
    pub background_color: Option<String>,
    pub output: OutputType,
    pub quality: f64,
    pub timeout_ms: u64,
    /// Extra draws after the first one
    pub redraws: u32,
    pub draw_interval_ms: u64,
}

/// Load `source` and draw it onto a new surface, then encode.
///
/// A source that fails to load or draw leaves the surface with just its
/// background; only surface creation and encoding errors are returned.
pub async fn rasterize<B: RasterBackend>(
    backend: &B,
    source: &str,
    options: &RasterOptions,
    log_prefix: &str,
) -> Result<String> {
    let limit = Duration::from_millis(options.timeout_ms);
    let bitmap = match tokio::time::timeout(limit, backend.load_bitmap(source)).await {
        Ok(Ok(bitmap)) => Some(bitmap),
        Ok(Err(e)) => {
            warn!("{} failed to load svg image: {}", log_prefix, e);
            None
        }
        Err(_) => {
            warn!("{} svg image not loaded after {}ms", log_prefix, options.timeout_ms);
            None
        }
    };

    let (width, height) = canvas_size(
        options.width,
        options.height,
        options.scale,
        options.maximum_canvas_size,
    );
    let mut surface = backend.create_surface(width, height)?;
    if let Some(color) = &options.background_color {
        if let Err(e) = surface.fill(color) {
            warn!("{} ignoring background color: {}", log_prefix, e);
        }
    }

    if let Some(bitmap) = &bitmap {
        draw(&mut surface, bitmap, log_prefix);
        for i in 0..options.redraws {
            tokio::time::sleep(Duration::from_millis(i as u64 + options.draw_interval_ms)).await;
            draw(&mut surface, bitmap, log_prefix);
        }
    }

    surface.to_data_url(options.output, options.quality)
}

fn draw<S: Surface>(surface: &mut S, bitmap: &S::Bitmap, log_prefix: &str) {
    if let Err(e) = surface.draw(bitmap) {
        warn!("{} failed to draw image: {}", log_prefix, e);
    }
}
