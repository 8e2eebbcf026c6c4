//! Physical pixel density patching for PNG and JPEG output

use crate::{Error, OutputType, Result};
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use log::debug;

const PNG_SIGNATURE: [u8; 8] = [0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A];
const INCHES_PER_METER: f64 = 39.3701;

/// Base64 fragments that mark an existing `pHYs` chunk for the usual IHDR layouts.
const LEGACY_PHYS_SIGNATURES: [&str; 3] = ["AAlwSFlz", "AAAJcEhZ", "AAAACXBI"];

const CRC_TABLE: [u32; 256] = crc_table();

const fn crc_table() -> [u32; 256] {
    let mut table = [0u32; 256];
    let mut n = 0;
    while n < 256 {
        let mut c = n as u32;
        let mut k = 0;
        while k < 8 {
            c = if c & 1 != 0 { 0xEDB8_8320 ^ (c >> 1) } else { c >> 1 };
            k += 1;
        }
        table[n] = c;
        n += 1;
    }
    table
}

/// CRC32 as used by PNG chunks (reflected polynomial, seeded with all ones).
pub fn crc32(bytes: &[u8]) -> u32 {
    let mut c = !0u32;
    for b in bytes {
        c = CRC_TABLE[((c ^ *b as u32) & 0xFF) as usize] ^ (c >> 8);
    }
    !c
}

pub fn pixels_per_meter(dpi: f64) -> u32 {
    (dpi * INCHES_PER_METER).round() as u32
}

fn phys_chunk(dpi: f64) -> Vec<u8> {
    let ppm = pixels_per_meter(dpi).to_be_bytes();
    let mut body = Vec::with_capacity(13);
    body.extend_from_slice(b"pHYs");
    body.extend_from_slice(&ppm);
    body.extend_from_slice(&ppm);
    body.push(1);
    let crc = crc32(&body).to_be_bytes();

    let mut chunk = Vec::with_capacity(21);
    chunk.extend_from_slice(&9u32.to_be_bytes());
    chunk.extend_from_slice(&body);
    chunk.extend_from_slice(&crc);
    chunk
}

struct Chunk {
    offset: usize,
    kind: [u8; 4],
    len: usize,
}

fn png_chunks(bytes: &[u8]) -> Result<Vec<Chunk>> {
    if bytes.len() < 8 || bytes[..8] != PNG_SIGNATURE {
        return Err(Error::Metadata("missing PNG signature".to_string()));
    }
    let mut chunks = Vec::new();
    let mut pos = 8;
    while pos + 8 <= bytes.len() {
        let len = u32::from_be_bytes([bytes[pos], bytes[pos + 1], bytes[pos + 2], bytes[pos + 3]]) as usize;
        let kind = [bytes[pos + 4], bytes[pos + 5], bytes[pos + 6], bytes[pos + 7]];
        if pos + 12 + len > bytes.len() {
            return Err(Error::Metadata(format!(
                "truncated {} chunk",
                String::from_utf8_lossy(&kind)
            )));
        }
        chunks.push(Chunk { offset: pos, kind, len });
        pos += 12 + len;
        if &kind == b"IEND" {
            break;
        }
    }
    Ok(chunks)
}

/// Set the `pHYs` density of a PNG, replacing an existing chunk that
/// precedes the image data or inserting one right after `IHDR`.
pub fn patch_png(bytes: &[u8], dpi: f64) -> Result<Vec<u8>> {
    let chunks = png_chunks(bytes)?;
    let ihdr = chunks
        .first()
        .filter(|c| &c.kind == b"IHDR")
        .ok_or_else(|| Error::Metadata("first chunk is not IHDR".to_string()))?;
    let existing = chunks
        .iter()
        .take_while(|c| &c.kind != b"IDAT")
        .find(|c| &c.kind == b"pHYs");

    let mut out = Vec::with_capacity(bytes.len() + 21);
    match existing {
        Some(phys) => {
            out.extend_from_slice(&bytes[..phys.offset]);
            out.extend_from_slice(&phys_chunk(dpi));
            out.extend_from_slice(&bytes[phys.offset + 12 + phys.len..]);
        }
        None => {
            let split = ihdr.offset + 12 + ihdr.len;
            out.extend_from_slice(&bytes[..split]);
            out.extend_from_slice(&phys_chunk(dpi));
            out.extend_from_slice(&bytes[split..]);
        }
    }
    Ok(out)
}

/// Read the `pHYs` payload: `(ppm_x, ppm_y, unit)`.
pub fn read_png_phys(bytes: &[u8]) -> Result<Option<(u32, u32, u8)>> {
    Ok(png_chunks(bytes)?
        .into_iter()
        .find(|c| &c.kind == b"pHYs" && c.len == 9)
        .map(|c| {
            let p = &bytes[c.offset + 8..c.offset + 17];
            (
                u32::from_be_bytes([p[0], p[1], p[2], p[3]]),
                u32::from_be_bytes([p[4], p[5], p[6], p[7]]),
                p[8],
            )
        }))
}

/// Set the JFIF density of a JPEG, adding an APP0 segment when absent.
pub fn patch_jpeg(bytes: &[u8], dpi: f64) -> Result<Vec<u8>> {
    if bytes.len() < 4 || bytes[0] != 0xFF || bytes[1] != 0xD8 {
        return Err(Error::Metadata("missing JPEG SOI marker".to_string()));
    }
    let density = dpi.round().clamp(0.0, u16::MAX as f64) as u16;
    let [hi, lo] = density.to_be_bytes();
    let has_jfif = bytes.len() >= 18 && bytes[2..4] == [0xFF, 0xE0] && &bytes[6..11] == b"JFIF\0";

    let mut out;
    if has_jfif {
        out = bytes.to_vec();
    } else {
        out = Vec::with_capacity(bytes.len() + 18);
        out.extend_from_slice(&bytes[..2]);
        out.extend_from_slice(&[0xFF, 0xE0, 0x00, 0x10]);
        out.extend_from_slice(b"JFIF\0");
        out.extend_from_slice(&[0x01, 0x01, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00]);
        out.extend_from_slice(&bytes[2..]);
    }
    out[13] = 1;
    out[14] = hi;
    out[15] = lo;
    out[16] = hi;
    out[17] = lo;
    Ok(out)
}

/// Offset of a known `pHYs` base64 fragment in a PNG body.
pub fn legacy_phys_offset(base64_body: &str) -> Option<usize> {
    LEGACY_PHYS_SIGNATURES
        .iter()
        .find_map(|sig| base64_body.find(sig))
}

/// Rewrite the density metadata of a PNG or JPEG data URL.
///
/// Other output types are returned unchanged.
pub fn change_dpi(data_url: &str, output: OutputType, dpi: f64) -> Result<String> {
    if !matches!(output, OutputType::Png | OutputType::Jpeg) {
        return Ok(data_url.to_string());
    }
    let (header, body) = data_url
        .split_once(',')
        .ok_or_else(|| Error::Metadata("data URL has no payload".to_string()))?;
    if !header.ends_with(";base64") {
        return Err(Error::Metadata("data URL is not base64 encoded".to_string()));
    }
    let bytes = STANDARD.decode(body)?;
    let patched = match output {
        OutputType::Png => {
            if let Some(offset) = legacy_phys_offset(body) {
                debug!("existing pHYs fragment at base64 offset {}", offset);
            }
            patch_png(&bytes, dpi)?
        }
        _ => patch_jpeg(&bytes, dpi)?,
    };
    Ok(format!("{},{}", header, STANDARD.encode(patched)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tiny_png() -> Vec<u8> {
        let img = image::RgbaImage::from_pixel(1, 1, image::Rgba([0, 0, 0, 0]));
        let mut buf = std::io::Cursor::new(Vec::new());
        img.write_to(&mut buf, image::ImageFormat::Png).unwrap();
        buf.into_inner()
    }

    #[test]
    fn crc_matches_known_vector() {
        assert_eq!(crc32(b"IEND"), 0xAE42_6082);
        assert_eq!(crc32(b"123456789"), 0xCBF4_3926);
    }

    #[test]
    fn png_gets_phys_after_ihdr() {
        let png = tiny_png();
        let patched = patch_png(&png, 192.0).unwrap();
        assert_eq!(&patched[37..41], b"pHYs");
        let (x, y, unit) = read_png_phys(&patched).unwrap().unwrap();
        assert_eq!(x, (192.0f64 * 39.3701).round() as u32);
        assert_eq!(y, x);
        assert_eq!(unit, 1);
        let crc = u32::from_be_bytes([patched[50], patched[51], patched[52], patched[53]]);
        assert_eq!(crc, crc32(&patched[37..50]));
    }

    #[test]
    fn existing_phys_is_overwritten_not_duplicated() {
        let once = patch_png(&tiny_png(), 144.0).unwrap();
        let twice = patch_png(&once, 300.0).unwrap();
        assert_eq!(once.len(), twice.len());
        assert_eq!(read_png_phys(&twice).unwrap().unwrap().0, pixels_per_meter(300.0));
        assert!(image::load_from_memory(&twice).is_ok());
    }

    #[test]
    fn legacy_scan_finds_inserted_chunk() {
        let patched = patch_png(&tiny_png(), 192.0).unwrap();
        let body = STANDARD.encode(&patched);
        assert!(legacy_phys_offset(&body).is_some());
    }

    #[test]
    fn jpeg_density_fields() {
        let img = image::RgbImage::from_pixel(2, 2, image::Rgb([255, 0, 0]));
        let mut buf = std::io::Cursor::new(Vec::new());
        img.write_to(&mut buf, image::ImageFormat::Jpeg).unwrap();
        let patched = patch_jpeg(buf.get_ref(), 192.0).unwrap();
        assert_eq!(&patched[6..11], b"JFIF\0");
        assert_eq!(patched[13], 1);
        assert_eq!(u16::from_be_bytes([patched[14], patched[15]]), 192);
        assert_eq!(u16::from_be_bytes([patched[16], patched[17]]), 192);
    }

    #[test]
    fn jpeg_without_app0_gets_one() {
        let bare = [0xFF, 0xD8, 0xFF, 0xD9];
        let patched = patch_jpeg(&bare, 72.0).unwrap();
        assert_eq!(patched.len(), 4 + 18);
        assert_eq!(&patched[2..4], &[0xFF, 0xE0]);
        assert_eq!(&patched[patched.len() - 2..], &[0xFF, 0xD9]);
    }

    #[test]
    fn change_dpi_round_trips_data_url() {
        let url = format!("data:image/png;base64,{}", STANDARD.encode(tiny_png()));
        let out = change_dpi(&url, OutputType::Png, 192.0).unwrap();
        let body = out.strip_prefix("data:image/png;base64,").unwrap();
        let bytes = STANDARD.decode(body).unwrap();
        assert_eq!(read_png_phys(&bytes).unwrap().unwrap().2, 1);
        assert_eq!(change_dpi("data:image/webp;base64,AA", OutputType::Webp, 192.0).unwrap(), "data:image/webp;base64,AA");
        assert!(change_dpi("data:image/png;base64,!!", OutputType::Png, 192.0).is_err());
    }
}
