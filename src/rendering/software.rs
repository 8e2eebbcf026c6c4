//! CPU raster backend on the `image` crate

use super::{RasterBackend, Surface, EMPTY_DATA_URL};
use crate::{Error, OutputType, Result};
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use data_url::DataUrl;
use futures::future::{self, LocalBoxFuture};
use image::imageops::{self, FilterType};
use image::{ImageFormat, Rgba, RgbaImage};
use std::io::Cursor;

/// Decodes raster data URLs and draws them with `imageops`.
///
/// SVG sources are not rendered; drawing one fails and the surface keeps
/// its background.
#[derive(Debug, Clone, Copy, Default)]
pub struct SoftwareRaster;

impl SoftwareRaster {
    pub fn new() -> Self {
        Self
    }

    fn decode(&self, url: &str) -> Result<RgbaImage> {
        let parsed = DataUrl::process(url)
            .map_err(|e| Error::Render(format!("not a data URL: {:?}", e)))?;
        let mime = parsed.mime_type();
        if mime.type_ == "image" && mime.subtype == "svg+xml" {
            return Err(Error::Unsupported("svg rasterization".to_string()));
        }
        let (bytes, _) = parsed
            .decode_to_vec()
            .map_err(|e| Error::Render(format!("invalid data URL body: {:?}", e)))?;
        Ok(image::load_from_memory(&bytes)?.to_rgba8())
    }
}

impl RasterBackend for SoftwareRaster {
    type Bitmap = RgbaImage;
    type Surface = SoftwareSurface;

    fn load_bitmap<'a>(&'a self, url: &'a str) -> LocalBoxFuture<'a, Result<RgbaImage>> {
        Box::pin(future::ready(self.decode(url)))
    }

    fn create_surface(&self, width: u32, height: u32) -> Result<SoftwareSurface> {
        Ok(SoftwareSurface {
            pixels: RgbaImage::new(width, height),
        })
    }
}

#[derive(Debug, Clone)]
pub struct SoftwareSurface {
    pixels: RgbaImage,
}

impl SoftwareSurface {
    pub fn pixels(&self) -> &RgbaImage {
        &self.pixels
    }
}

impl Surface for SoftwareSurface {
    type Bitmap = RgbaImage;

    fn size(&self) -> (u32, u32) {
        self.pixels.dimensions()
    }

    fn fill(&mut self, color: &str) -> Result<()> {
        let color = parse_css_color(color)
            .ok_or_else(|| Error::Render(format!("unsupported color '{}'", color)))?;
        for pixel in self.pixels.pixels_mut() {
            *pixel = blend(*pixel, color);
        }
        Ok(())
    }

    fn draw(&mut self, bitmap: &RgbaImage) -> Result<()> {
        let (width, height) = self.size();
        if width == 0 || height == 0 {
            return Ok(());
        }
        if bitmap.dimensions() == (width, height) {
            imageops::overlay(&mut self.pixels, bitmap, 0, 0);
        } else {
            let resized = imageops::resize(bitmap, width, height, FilterType::Triangle);
            imageops::overlay(&mut self.pixels, &resized, 0, 0);
        }
        Ok(())
    }

    fn to_data_url(&self, output: OutputType, quality: f64) -> Result<String> {
        let (width, height) = self.size();
        if width == 0 || height == 0 {
            return Ok(EMPTY_DATA_URL.to_string());
        }
        let mut buffer = Vec::new();
        let mut cursor = Cursor::new(&mut buffer);
        match output {
            OutputType::Png => self.pixels.write_to(&mut cursor, ImageFormat::Png)?,
            OutputType::Jpeg => {
                let quality = (quality * 100.0).round().clamp(1.0, 100.0) as u8;
                let encoder = image::codecs::jpeg::JpegEncoder::new_with_quality(&mut cursor, quality);
                image::DynamicImage::ImageRgba8(self.pixels.clone())
                    .to_rgb8()
                    .write_with_encoder(encoder)?;
            }
            OutputType::Webp => {
                let encoder = image::codecs::webp::WebPEncoder::new_lossless(&mut cursor);
                self.pixels.write_with_encoder(encoder)?;
            }
            OutputType::Svg => return Err(Error::Unsupported("svg is not a raster format".to_string())),
        }
        Ok(format!("data:{};base64,{}", output.mime(), STANDARD.encode(&buffer)))
    }
}

/// Source-over blend of `top` onto `bottom`
fn blend(bottom: Rgba<u8>, top: Rgba<u8>) -> Rgba<u8> {
    let ta = top[3] as f64 / 255.0;
    let ba = bottom[3] as f64 / 255.0;
    let out_a = ta + ba * (1.0 - ta);
    if out_a <= 0.0 {
        return Rgba([0, 0, 0, 0]);
    }
    let channel = |i: usize| {
        let v = (top[i] as f64 * ta + bottom[i] as f64 * ba * (1.0 - ta)) / out_a;
        v.round().clamp(0.0, 255.0) as u8
    };
    Rgba([channel(0), channel(1), channel(2), (out_a * 255.0).round() as u8])
}

const NAMED_COLORS: [(&str, [u8; 3]); 18] = [
    ("black", [0, 0, 0]),
    ("white", [255, 255, 255]),
    ("red", [255, 0, 0]),
    ("green", [0, 128, 0]),
    ("blue", [0, 0, 255]),
    ("yellow", [255, 255, 0]),
    ("cyan", [0, 255, 255]),
    ("aqua", [0, 255, 255]),
    ("magenta", [255, 0, 255]),
    ("fuchsia", [255, 0, 255]),
    ("gray", [128, 128, 128]),
    ("grey", [128, 128, 128]),
    ("silver", [192, 192, 192]),
    ("maroon", [128, 0, 0]),
    ("navy", [0, 0, 128]),
    ("purple", [128, 0, 128]),
    ("teal", [0, 128, 128]),
    ("orange", [255, 165, 0]),
];

/// Parse the CSS color forms a background option is usually given in.
pub fn parse_css_color(value: &str) -> Option<Rgba<u8>> {
    let value = value.trim().to_ascii_lowercase();
    if value == "transparent" {
        return Some(Rgba([0, 0, 0, 0]));
    }
    if let Some(hex) = value.strip_prefix('#') {
        return parse_hex(hex);
    }
    if let Some(args) = value
        .strip_prefix("rgba(")
        .or_else(|| value.strip_prefix("rgb("))
        .and_then(|rest| rest.strip_suffix(')'))
    {
        return parse_rgb_args(args);
    }
    NAMED_COLORS
        .iter()
        .find(|(name, _)| *name == value)
        .map(|(_, [r, g, b])| Rgba([*r, *g, *b, 255]))
}

fn parse_hex(hex: &str) -> Option<Rgba<u8>> {
    if !hex.chars().all(|c| c.is_ascii_hexdigit()) {
        return None;
    }
    let digit = |i: usize| u8::from_str_radix(&hex[i..i + 1], 16).ok().map(|v| v * 17);
    let pair = |i: usize| u8::from_str_radix(&hex[i..i + 2], 16).ok();
    match hex.len() {
        3 => Some(Rgba([digit(0)?, digit(1)?, digit(2)?, 255])),
        4 => Some(Rgba([digit(0)?, digit(1)?, digit(2)?, digit(3)?])),
        6 => Some(Rgba([pair(0)?, pair(2)?, pair(4)?, 255])),
        8 => Some(Rgba([pair(0)?, pair(2)?, pair(4)?, pair(6)?])),
        _ => None,
    }
}

fn parse_rgb_args(args: &str) -> Option<Rgba<u8>> {
    let parts: Vec<&str> = args
        .split(|c: char| c == ',' || c == '/' || c.is_whitespace())
        .filter(|p| !p.is_empty())
        .collect();
    if parts.len() != 3 && parts.len() != 4 {
        return None;
    }
    let channel = |p: &str| -> Option<u8> {
        let v = match p.strip_suffix('%') {
            Some(pct) => pct.parse::<f64>().ok()? * 2.55,
            None => p.parse::<f64>().ok()?,
        };
        Some(v.round().clamp(0.0, 255.0) as u8)
    };
    let alpha = match parts.get(3) {
        Some(p) => {
            let a = match p.strip_suffix('%') {
                Some(pct) => pct.parse::<f64>().ok()? / 100.0,
                None => p.parse::<f64>().ok()?,
            };
            (a.clamp(0.0, 1.0) * 255.0).round() as u8
        }
        None => 255,
    };
    Some(Rgba([channel(parts[0])?, channel(parts[1])?, channel(parts[2])?, alpha]))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn png_data_url(image: &RgbaImage) -> String {
        let mut buf = Cursor::new(Vec::new());
        image.write_to(&mut buf, ImageFormat::Png).unwrap();
        format!("data:image/png;base64,{}", STANDARD.encode(buf.into_inner()))
    }

    fn decode(data_url: &str) -> image::DynamicImage {
        let body = data_url.split_once(',').unwrap().1;
        image::load_from_memory(&STANDARD.decode(body).unwrap()).unwrap()
    }

    #[test]
    fn parses_common_color_forms() {
        assert_eq!(parse_css_color("#fff"), Some(Rgba([255, 255, 255, 255])));
        assert_eq!(parse_css_color("#00ff0080"), Some(Rgba([0, 255, 0, 128])));
        assert_eq!(parse_css_color("rgb(10, 20, 30)"), Some(Rgba([10, 20, 30, 255])));
        assert_eq!(parse_css_color("rgba(10,20,30,0.5)"), Some(Rgba([10, 20, 30, 128])));
        assert_eq!(parse_css_color("rgb(10 20 30 / 50%)"), Some(Rgba([10, 20, 30, 128])));
        assert_eq!(parse_css_color(" White "), Some(Rgba([255, 255, 255, 255])));
        assert_eq!(parse_css_color("transparent"), Some(Rgba([0, 0, 0, 0])));
        assert_eq!(parse_css_color("#12"), None);
        assert_eq!(parse_css_color("papayawhip-ish"), None);
    }

    #[test]
    fn fill_draw_and_encode_png() {
        let raster = SoftwareRaster::new();
        let mut surface = raster.create_surface(4, 2).unwrap();
        surface.fill("#ff0000").unwrap();

        let source = RgbaImage::from_pixel(2, 1, Rgba([0, 0, 255, 255]));
        let bitmap = raster.decode(&png_data_url(&source)).unwrap();
        surface.draw(&bitmap).unwrap();
        let pixel = surface.pixels().get_pixel(3, 1);
        assert!(pixel[2] > 200 && pixel[0] < 50, "{:?}", pixel);

        let url = surface.to_data_url(OutputType::Png, 1.0).unwrap();
        assert!(url.starts_with("data:image/png;base64,"));
        let decoded = decode(&url);
        assert_eq!((decoded.width(), decoded.height()), (4, 2));
    }

    #[test]
    fn jpeg_and_webp_encode() {
        let raster = SoftwareRaster::new();
        let mut surface = raster.create_surface(3, 3).unwrap();
        surface.fill("white").unwrap();
        let jpeg = surface.to_data_url(OutputType::Jpeg, 0.8).unwrap();
        assert!(jpeg.starts_with("data:image/jpeg;base64,"));
        assert_eq!(decode(&jpeg).width(), 3);
        let webp = surface.to_data_url(OutputType::Webp, 1.0).unwrap();
        assert!(webp.starts_with("data:image/webp;base64,"));
    }

    #[test]
    fn svg_sources_and_empty_surfaces() {
        let raster = SoftwareRaster::new();
        assert!(matches!(
            raster.decode("data:image/svg+xml;charset=utf-8,%3Csvg%2F%3E"),
            Err(Error::Unsupported(_))
        ));
        let empty = raster.create_surface(0, 10).unwrap();
        assert_eq!(empty.to_data_url(OutputType::Png, 1.0).unwrap(), EMPTY_DATA_URL);
    }
}
