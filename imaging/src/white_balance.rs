//! Software white balance applied after debayering
//!
//! Gray world assumes the scene averages to neutral. Only mid-tone pixels
//! (between two luminance percentiles) are averaged, so a bright moon or a
//! black horizon does not drag the channel gains.

use crate::stats::{luma, Histogram};
use image::RgbImage;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

pub const GRAY_WORLD_LOW_PERCENTILE: f64 = 5.0;
pub const GRAY_WORLD_HIGH_PERCENTILE: f64 = 95.0;

/// Below this many mid-tone pixels the whole frame is averaged instead
pub const GRAY_WORLD_MIN_PIXELS: usize = 100;

pub const MIN_SOFTWARE_GAIN: f64 = 0.1;
pub const MAX_SOFTWARE_GAIN: f64 = 4.0;

/// Per-channel multipliers
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct WhiteBalanceGains {
    pub red: f64,
    pub green: f64,
    pub blue: f64,
}

impl Default for WhiteBalanceGains {
    fn default() -> Self {
        Self {
            red: 1.0,
            green: 1.0,
            blue: 1.0,
        }
    }
}

impl WhiteBalanceGains {
    /// Red and blue gains with green untouched
    pub fn manual(red: f64, blue: f64) -> Self {
        Self {
            red,
            green: 1.0,
            blue,
        }
    }

    pub fn is_neutral(&self) -> bool {
        *self == Self::default()
    }
}

/// Gains that pull the mid-tone channel means to their common average.
///
/// Returns neutral gains for empty or black images.
pub fn gray_world_gains(image: &RgbImage, low_percentile: f64, high_percentile: f64) -> WhiteBalanceGains {
    let lumas: Vec<u8> = image.pixels().map(|p| luma(p[0], p[1], p[2])).collect();
    let hist = Histogram::from_samples(lumas.iter().copied());
    let low = hist.percentile(low_percentile);
    let high = hist.percentile(high_percentile);

    let sums = |in_band: &dyn Fn(u8) -> bool| {
        image
            .pixels()
            .zip(&lumas)
            .filter(|(_, &l)| in_band(l))
            .fold((0usize, [0u64; 3]), |(n, mut sum), (p, _)| {
                for (s, &v) in sum.iter_mut().zip(p.0.iter()) {
                    *s += v as u64;
                }
                (n + 1, sum)
            })
    };

    let (mut count, mut sum) = sums(&|l| (l as f64) >= low && (l as f64) <= high);
    if count < GRAY_WORLD_MIN_PIXELS {
        (count, sum) = sums(&|_| true);
    }
    if count == 0 {
        return WhiteBalanceGains::default();
    }

    let [r, g, b] = sum.map(|s| s as f64 / count as f64);
    let target = (r + g + b) / 3.0;
    if target <= 0.0 {
        return WhiteBalanceGains::default();
    }
    WhiteBalanceGains {
        red: target / (r + 1e-6),
        green: target / (g + 1e-6),
        blue: target / (b + 1e-6),
    }
}

/// Scale each channel in place, rounding and saturating to 8 bits
pub fn apply_gains(image: &mut RgbImage, gains: WhiteBalanceGains) {
    if gains.is_neutral() {
        return;
    }
    let gains = [gains.red, gains.green, gains.blue];
    image.par_chunks_mut(3).for_each(|px| {
        for (v, g) in px.iter_mut().zip(gains) {
            *v = (*v as f64 * g).round().clamp(0.0, 255.0) as u8;
        }
    });
}

/// Estimate gray world gains and apply them. Returns the gains used.
pub fn apply_gray_world(image: &mut RgbImage, low_percentile: f64, high_percentile: f64) -> WhiteBalanceGains {
    let gains = gray_world_gains(image, low_percentile, high_percentile);
    apply_gains(image, gains);
    gains
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    #[test]
    fn test_gray_world_neutralizes_cast() {
        // Warm cast with a gradient so the percentile band is meaningful
        let mut img = RgbImage::from_fn(40, 40, |x, _| {
            let base = 60 + x as u8 * 2;
            Rgb([base + 30, base, base.saturating_sub(20)])
        });
        let gains = apply_gray_world(&mut img, GRAY_WORLD_LOW_PERCENTILE, GRAY_WORLD_HIGH_PERCENTILE);
        assert!(gains.red < 1.0 && gains.blue > 1.0, "{:?}", gains);

        let n = (img.width() * img.height()) as f64;
        let mean = |c: usize| img.pixels().map(|p| p[c] as f64).sum::<f64>() / n;
        let (r, g, b) = (mean(0), mean(1), mean(2));
        assert!((r - g).abs() < 2.0 && (b - g).abs() < 2.0, "{} {} {}", r, g, b);
    }

    #[test]
    fn test_gray_world_ignores_highlights() {
        // Neutral sky with a saturated red blob in the top 5%
        let img = RgbImage::from_fn(40, 40, |x, y| {
            if x < 4 && y < 16 {
                Rgb([255, 200, 200])
            } else {
                let v = 50 + (x + y) as u8;
                Rgb([v, v, v])
            }
        });
        let gains = gray_world_gains(&img, GRAY_WORLD_LOW_PERCENTILE, GRAY_WORLD_HIGH_PERCENTILE);
        assert!((gains.red - 1.0).abs() < 0.01, "{:?}", gains);
        assert!((gains.blue - 1.0).abs() < 0.01, "{:?}", gains);
    }

    #[test]
    fn test_black_frame_keeps_neutral_gains() {
        let mut img = RgbImage::new(16, 16);
        let gains = apply_gray_world(&mut img, 5.0, 95.0);
        assert!(gains.is_neutral());
        assert!(img.pixels().all(|p| p.0 == [0, 0, 0]));
    }

    #[test]
    fn test_manual_gains_saturate() {
        let mut img = RgbImage::from_pixel(4, 4, Rgb([100, 100, 200]));
        apply_gains(&mut img, WhiteBalanceGains::manual(1.5, 2.0));
        assert_eq!(img.get_pixel(0, 0).0, [150, 100, 255]);

        let before = img.clone();
        apply_gains(&mut img, WhiteBalanceGains::default());
        assert_eq!(img, before);
    }
}
