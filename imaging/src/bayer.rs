//! Bayer mosaic reconstruction
//!
//! The primary path runs bilinear interpolation row-parallel on the rayon pool.
//! `debayer_serial` runs the same per-row kernel on the calling thread, so both
//! paths produce byte-identical output.
//!
//! The pattern must match the physical sensor. Decoding with the wrong tile
//! order does not fail; it silently swaps the red and blue channels.

use crate::ImagingError;
use image::RgbImage;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

// =============================================================================
// BAYER PATTERN
// =============================================================================

/// 2x2 color filter tile ordering, named by the top-left row then second row
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum BayerPattern {
    Rggb,
    Bggr,
    Grbg,
    Gbrg,
}

/// Color channel of a single photosite
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Channel {
    Red = 0,
    Green = 1,
    Blue = 2,
}

impl BayerPattern {
    /// Map the vendor SDK pattern index (0=RG, 1=BG, 2=GR, 3=GB)
    pub fn from_sdk_index(index: i32) -> Option<Self> {
        match index {
            0 => Some(BayerPattern::Rggb),
            1 => Some(BayerPattern::Bggr),
            2 => Some(BayerPattern::Grbg),
            3 => Some(BayerPattern::Gbrg),
            _ => None,
        }
    }

    /// Column/row parity of the red photosite within the tile
    fn red_offset(self) -> (usize, usize) {
        match self {
            BayerPattern::Rggb => (0, 0),
            BayerPattern::Bggr => (1, 1),
            BayerPattern::Grbg => (1, 0),
            BayerPattern::Gbrg => (0, 1),
        }
    }

    /// Color filter over the photosite at (x, y)
    pub fn channel_at(self, x: usize, y: usize) -> Channel {
        let (rx, ry) = self.red_offset();
        let (px, py) = (x & 1, y & 1);
        if px == rx && py == ry {
            Channel::Red
        } else if px != rx && py != ry {
            Channel::Blue
        } else {
            Channel::Green
        }
    }
}

impl Default for BayerPattern {
    fn default() -> Self {
        BayerPattern::Bggr
    }
}

impl fmt::Display for BayerPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            BayerPattern::Rggb => "RGGB",
            BayerPattern::Bggr => "BGGR",
            BayerPattern::Grbg => "GRBG",
            BayerPattern::Gbrg => "GBRG",
        };
        f.write_str(name)
    }
}

impl FromStr for BayerPattern {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "RGGB" | "RG" => Ok(BayerPattern::Rggb),
            "BGGR" | "BG" => Ok(BayerPattern::Bggr),
            "GRBG" | "GR" => Ok(BayerPattern::Grbg),
            "GBRG" | "GB" => Ok(BayerPattern::Gbrg),
            other => Err(format!("Unknown Bayer pattern: {}", other)),
        }
    }
}

/// Reconstruction kernel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DebayerAlgorithm {
    /// Full-resolution bilinear interpolation
    #[default]
    Bilinear,
    /// Each 2x2 tile collapses to one color (greens averaged), replicated to all four pixels
    SuperPixel,
}

// =============================================================================
// SAMPLE TYPES
// =============================================================================

/// Raw sensor sample, 8- or 16-bit
pub trait Sample: Copy + Send + Sync {
    fn value(self) -> u32;

    /// Scale a value in this sample's range down to 8 bits
    fn to_u8(value: u32) -> u8;
}

impl Sample for u8 {
    #[inline]
    fn value(self) -> u32 {
        self as u32
    }

    #[inline]
    fn to_u8(value: u32) -> u8 {
        value.min(255) as u8
    }
}

impl Sample for u16 {
    #[inline]
    fn value(self) -> u32 {
        self as u32
    }

    #[inline]
    fn to_u8(value: u32) -> u8 {
        ((value + 128) / 257).min(255) as u8
    }
}

// =============================================================================
// PUBLIC ENTRY POINTS
// =============================================================================

/// Debayer an 8-bit mosaic with the parallel bilinear kernel
pub fn debayer(
    raw: &[u8],
    width: u32,
    height: u32,
    pattern: BayerPattern,
) -> Result<RgbImage, ImagingError> {
    debayer_with(raw, width, height, pattern, DebayerAlgorithm::Bilinear)
}

/// Debayer a 16-bit mosaic; output is scaled to 8 bits per channel
pub fn debayer_u16(
    raw: &[u16],
    width: u32,
    height: u32,
    pattern: BayerPattern,
) -> Result<RgbImage, ImagingError> {
    debayer_with(raw, width, height, pattern, DebayerAlgorithm::Bilinear)
}

/// Debayer with an explicit algorithm, using the rayon pool
pub fn debayer_with<T: Sample>(
    raw: &[T],
    width: u32,
    height: u32,
    pattern: BayerPattern,
    algorithm: DebayerAlgorithm,
) -> Result<RgbImage, ImagingError> {
    let (w, h) = validate(raw, width, height)?;
    let mut buf = vec![0u8; w * h * 3];

    buf.par_chunks_mut(w * 3)
        .enumerate()
        .for_each(|(y, row)| reconstruct_row(raw, w, h, y, pattern, algorithm, row));

    into_image(width, height, buf)
}

/// Single-threaded fallback. Produces exactly the same bytes as `debayer_with`.
pub fn debayer_serial<T: Sample>(
    raw: &[T],
    width: u32,
    height: u32,
    pattern: BayerPattern,
    algorithm: DebayerAlgorithm,
) -> Result<RgbImage, ImagingError> {
    let (w, h) = validate(raw, width, height)?;
    let mut buf = vec![0u8; w * h * 3];

    for (y, row) in buf.chunks_mut(w * 3).enumerate() {
        reconstruct_row(raw, w, h, y, pattern, algorithm, row);
    }

    into_image(width, height, buf)
}

/// Sample an RGB image through a color filter mosaic. Used to build synthetic sensor data.
pub fn mosaic(image: &RgbImage, pattern: BayerPattern) -> Vec<u8> {
    let (w, h) = image.dimensions();
    let mut out = Vec::with_capacity(w as usize * h as usize);
    for y in 0..h {
        for x in 0..w {
            let px = image.get_pixel(x, y);
            out.push(px[pattern.channel_at(x as usize, y as usize) as usize]);
        }
    }
    out
}

// =============================================================================
// KERNELS
// =============================================================================

fn validate<T>(raw: &[T], width: u32, height: u32) -> Result<(usize, usize), ImagingError> {
    if width < 2 || height < 2 {
        return Err(ImagingError::InvalidDimensions {
            width,
            height,
            reason: "a Bayer mosaic needs at least one full 2x2 tile".to_string(),
        });
    }
    let expected = (width as usize)
        .checked_mul(height as usize)
        .ok_or_else(|| ImagingError::InvalidDimensions {
            width,
            height,
            reason: "pixel count overflows".to_string(),
        })?;
    if raw.len() < expected {
        return Err(ImagingError::BufferLength {
            expected,
            actual: raw.len(),
        });
    }
    Ok((width as usize, height as usize))
}

fn into_image(width: u32, height: u32, buf: Vec<u8>) -> Result<RgbImage, ImagingError> {
    RgbImage::from_raw(width, height, buf).ok_or(ImagingError::InvalidDimensions {
        width,
        height,
        reason: "output buffer does not match dimensions".to_string(),
    })
}

fn reconstruct_row<T: Sample>(
    raw: &[T],
    w: usize,
    h: usize,
    y: usize,
    pattern: BayerPattern,
    algorithm: DebayerAlgorithm,
    row: &mut [u8],
) {
    match algorithm {
        DebayerAlgorithm::Bilinear => bilinear_row(raw, w, h, y, pattern, row),
        DebayerAlgorithm::SuperPixel => superpixel_row(raw, w, h, y, pattern, row),
    }
}

/// Missing channels are the mean of same-colored photosites in the 3x3 neighborhood.
/// Any in-bounds 3x3 window of an image at least 2x2 contains every channel.
fn bilinear_row<T: Sample>(
    raw: &[T],
    w: usize,
    h: usize,
    y: usize,
    pattern: BayerPattern,
    row: &mut [u8],
) {
    for x in 0..w {
        let own = pattern.channel_at(x, y);
        let mut sums = [0u32; 3];
        let mut counts = [0u32; 3];

        let y0 = y.saturating_sub(1);
        let y1 = (y + 1).min(h - 1);
        let x0 = x.saturating_sub(1);
        let x1 = (x + 1).min(w - 1);

        for ny in y0..=y1 {
            for nx in x0..=x1 {
                let channel = pattern.channel_at(nx, ny);
                if channel == own && (nx != x || ny != y) {
                    continue;
                }
                sums[channel as usize] += raw[ny * w + nx].value();
                counts[channel as usize] += 1;
            }
        }

        let out = &mut row[x * 3..x * 3 + 3];
        for c in 0..3 {
            let value = if counts[c] == 0 {
                0
            } else {
                (sums[c] + counts[c] / 2) / counts[c]
            };
            out[c] = T::to_u8(value);
        }
    }
}

fn superpixel_row<T: Sample>(
    raw: &[T],
    w: usize,
    h: usize,
    y: usize,
    pattern: BayerPattern,
    row: &mut [u8],
) {
    let ty = tile_origin(y, h);
    for x in 0..w {
        let tx = tile_origin(x, w);
        let mut rgb = [0u32; 3];
        let mut greens = 0u32;
        for (dx, dy) in [(0, 0), (1, 0), (0, 1), (1, 1)] {
            let (sx, sy) = (tx + dx, ty + dy);
            let v = raw[sy * w + sx].value();
            match pattern.channel_at(sx, sy) {
                Channel::Red => rgb[0] = v,
                Channel::Green => {
                    rgb[1] += v;
                    greens += 1;
                }
                Channel::Blue => rgb[2] = v,
            }
        }
        rgb[1] = (rgb[1] + greens / 2) / greens.max(1);

        let out = &mut row[x * 3..x * 3 + 3];
        for c in 0..3 {
            out[c] = T::to_u8(rgb[c]);
        }
    }
}

/// Even-aligned origin of the tile covering `pos`; the trailing odd line reuses the previous tile
fn tile_origin(pos: usize, len: usize) -> usize {
    let origin = pos & !1;
    if origin + 1 < len {
        origin
    } else {
        origin - 2
    }
}
