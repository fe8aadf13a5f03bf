//! Brightness, clipping and image statistics
//!
//! All statistics run on 8-bit data through a 256-bin histogram, so cost is
//! linear in pixel count and independent of the algorithm chosen.

use image::RgbImage;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Pixel level above which a sample counts as clipped
pub const DEFAULT_CLIP_LEVEL: u8 = 245;

/// Fraction of clipped samples above which a frame is considered clipping
pub const DEFAULT_CLIP_FRACTION: f64 = 0.05;

/// Percentile used when the percentile algorithm is selected without one
pub const DEFAULT_BRIGHTNESS_PERCENTILE: f64 = 75.0;

// =============================================================================
// BRIGHTNESS ALGORITHM
// =============================================================================

/// Statistic used as the auto-exposure convergence signal
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BrightnessAlgorithm {
    #[default]
    Mean,
    Median,
    Percentile,
}

impl BrightnessAlgorithm {
    /// Parse a configured name, falling back to `Mean` for anything unrecognized
    pub fn from_name_or_default(name: &str) -> Self {
        name.parse().unwrap_or_else(|_| {
            tracing::warn!("Unknown brightness algorithm '{}', using mean", name);
            BrightnessAlgorithm::Mean
        })
    }
}

impl FromStr for BrightnessAlgorithm {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "mean" | "average" => Ok(BrightnessAlgorithm::Mean),
            "median" => Ok(BrightnessAlgorithm::Median),
            "percentile" => Ok(BrightnessAlgorithm::Percentile),
            other => Err(format!("Unknown brightness algorithm: {}", other)),
        }
    }
}

impl fmt::Display for BrightnessAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BrightnessAlgorithm::Mean => f.write_str("mean"),
            BrightnessAlgorithm::Median => f.write_str("median"),
            BrightnessAlgorithm::Percentile => f.write_str("percentile"),
        }
    }
}

// =============================================================================
// HISTOGRAM
// =============================================================================

/// 256-bin histogram of 8-bit samples
#[derive(Debug, Clone)]
pub struct Histogram {
    counts: [u64; 256],
    total: u64,
}

impl Histogram {
    pub fn from_samples<I: IntoIterator<Item = u8>>(samples: I) -> Self {
        let mut counts = [0u64; 256];
        let mut total = 0u64;
        for s in samples {
            counts[s as usize] += 1;
            total += 1;
        }
        Self { counts, total }
    }

    /// Histogram of Rec.601 luminance
    pub fn luminance(image: &RgbImage) -> Self {
        Self::from_samples(image.pixels().map(|p| luma(p[0], p[1], p[2])))
    }

    pub fn total(&self) -> u64 {
        self.total
    }

    pub fn mean(&self) -> f64 {
        if self.total == 0 {
            return 0.0;
        }
        let sum: u64 = self
            .counts
            .iter()
            .enumerate()
            .map(|(v, &c)| v as u64 * c)
            .sum();
        sum as f64 / self.total as f64
    }

    pub fn std_dev(&self) -> f64 {
        if self.total == 0 {
            return 0.0;
        }
        let mean = self.mean();
        let var: f64 = self
            .counts
            .iter()
            .enumerate()
            .map(|(v, &c)| {
                let d = v as f64 - mean;
                d * d * c as f64
            })
            .sum::<f64>()
            / self.total as f64;
        var.sqrt()
    }

    pub fn min(&self) -> u8 {
        self.counts.iter().position(|&c| c > 0).unwrap_or(0) as u8
    }

    pub fn max(&self) -> u8 {
        self.counts.iter().rposition(|&c| c > 0).unwrap_or(0) as u8
    }

    /// Percentile with linear interpolation between closest ranks
    pub fn percentile(&self, p: f64) -> f64 {
        if self.total == 0 {
            return 0.0;
        }
        let p = p.clamp(0.0, 100.0);
        let rank = p / 100.0 * (self.total - 1) as f64;
        let lo = rank.floor() as u64;
        let hi = rank.ceil() as u64;
        let lo_v = self.value_at_rank(lo) as f64;
        let hi_v = self.value_at_rank(hi) as f64;
        lo_v + (hi_v - lo_v) * (rank - lo as f64)
    }

    pub fn median(&self) -> f64 {
        self.percentile(50.0)
    }

    /// Number of samples strictly above `level`
    pub fn count_above(&self, level: u8) -> u64 {
        self.counts[level as usize + 1..].iter().sum()
    }

    fn value_at_rank(&self, rank: u64) -> u8 {
        let mut seen = 0u64;
        for (v, &c) in self.counts.iter().enumerate() {
            seen += c;
            if seen > rank {
                return v as u8;
            }
        }
        255
    }
}

#[inline]
pub(crate) fn luma(r: u8, g: u8, b: u8) -> u8 {
    ((299 * r as u32 + 587 * g as u32 + 114 * b as u32 + 500) / 1000) as u8
}

// =============================================================================
// BRIGHTNESS & CLIPPING
// =============================================================================

/// Luminance statistic for the given algorithm. `percentile` is only used by
/// `BrightnessAlgorithm::Percentile`.
pub fn compute_brightness(image: &RgbImage, algorithm: BrightnessAlgorithm, percentile: f64) -> f64 {
    let hist = Histogram::luminance(image);
    match algorithm {
        BrightnessAlgorithm::Mean => hist.mean(),
        BrightnessAlgorithm::Median => hist.median(),
        BrightnessAlgorithm::Percentile => hist.percentile(percentile),
    }
}

/// Fraction (0..=1) of channel samples strictly above `level`
pub fn clipped_fraction(image: &RgbImage, level: u8) -> f64 {
    let hist = Histogram::from_samples(image.as_raw().iter().copied());
    if hist.total() == 0 {
        return 0.0;
    }
    hist.count_above(level) as f64 / hist.total() as f64
}

/// True when more than `threshold` (a fraction) of samples sit above `DEFAULT_CLIP_LEVEL`
pub fn detect_clipping(image: &RgbImage, threshold: f64) -> bool {
    detect_clipping_at(image, DEFAULT_CLIP_LEVEL, threshold)
}

pub fn detect_clipping_at(image: &RgbImage, level: u8, threshold: f64) -> bool {
    clipped_fraction(image, level) > threshold
}

// =============================================================================
// IMAGE STATISTICS
// =============================================================================

/// Luminance statistics attached to every delivered frame
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct ImageStats {
    pub mean: f64,
    pub median: f64,
    pub min: u8,
    pub max: u8,
    pub std_dev: f64,
    pub p25: f64,
    pub p75: f64,
    pub p95: f64,
}

impl ImageStats {
    pub fn from_image(image: &RgbImage) -> Self {
        Self::from_histogram(&Histogram::luminance(image))
    }

    pub fn from_histogram(hist: &Histogram) -> Self {
        Self {
            mean: hist.mean(),
            median: hist.median(),
            min: hist.min(),
            max: hist.max(),
            std_dev: hist.std_dev(),
            p25: hist.percentile(25.0),
            p75: hist.percentile(75.0),
            p95: hist.percentile(95.0),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    fn gray(width: u32, height: u32, level: u8) -> RgbImage {
        RgbImage::from_pixel(width, height, Rgb([level, level, level]))
    }

    /// 10 rows: 9 at `base`, one at `top`
    fn banded(base: u8, top: u8) -> RgbImage {
        RgbImage::from_fn(10, 10, |_, y| {
            let v = if y == 0 { top } else { base };
            Rgb([v, v, v])
        })
    }

    #[test]
    fn test_mean_brightness() {
        let img = gray(10, 10, 100);
        assert!((compute_brightness(&img, BrightnessAlgorithm::Mean, 0.0) - 100.0).abs() < 1e-9);
    }

    #[test]
    fn test_median_ignores_outliers() {
        let img = banded(100, 255);
        let median = compute_brightness(&img, BrightnessAlgorithm::Median, 0.0);
        let mean = compute_brightness(&img, BrightnessAlgorithm::Mean, 0.0);
        assert_eq!(median, 100.0);
        assert!(mean > 110.0);
    }

    #[test]
    fn test_percentile_interpolates() {
        let hist = Histogram::from_samples([0u8, 10, 20, 30]);
        // rank = 0.5 * 3 = 1.5 -> halfway between 10 and 20
        assert!((hist.percentile(50.0) - 15.0).abs() < 1e-9);
        assert!((hist.percentile(100.0) - 30.0).abs() < 1e-9);
        assert!((hist.percentile(0.0) - 0.0).abs() < 1e-9);

        let img = banded(50, 250);
        let p95 = compute_brightness(&img, BrightnessAlgorithm::Percentile, 95.0);
        assert!(p95 > 50.0);
    }

    #[test]
    fn test_luminance_weights() {
        assert_eq!(luma(255, 255, 255), 255);
        assert_eq!(luma(0, 0, 0), 0);
        assert_eq!(luma(255, 0, 0), 76);
        assert_eq!(luma(0, 255, 0), 150);
    }

    #[test]
    fn test_unknown_algorithm_defaults_to_mean() {
        assert_eq!(
            BrightnessAlgorithm::from_name_or_default("weird"),
            BrightnessAlgorithm::Mean
        );
        assert_eq!(
            BrightnessAlgorithm::from_name_or_default("Percentile"),
            BrightnessAlgorithm::Percentile
        );
    }

    #[test]
    fn test_no_clipping() {
        let img = gray(10, 10, 128);
        assert_eq!(clipped_fraction(&img, DEFAULT_CLIP_LEVEL), 0.0);
        assert!(!detect_clipping(&img, DEFAULT_CLIP_FRACTION));
    }

    #[test]
    fn test_significant_clipping() {
        let img = banded(100, 255);
        assert!((clipped_fraction(&img, DEFAULT_CLIP_LEVEL) - 0.10).abs() < 1e-9);
        assert!(detect_clipping(&img, DEFAULT_CLIP_FRACTION));
    }

    #[test]
    fn test_minor_clipping_under_threshold() {
        let img = RgbImage::from_fn(100, 1, |x, _| {
            let v = if x < 3 { 250 } else { 100 };
            Rgb([v, v, v])
        });
        assert!(!detect_clipping(&img, DEFAULT_CLIP_FRACTION));
    }

    #[test]
    fn test_custom_clip_level() {
        let img = gray(10, 10, 200);
        assert!(!detect_clipping_at(&img, 245, DEFAULT_CLIP_FRACTION));
        assert!(detect_clipping_at(&img, 150, DEFAULT_CLIP_FRACTION));
        assert_eq!(clipped_fraction(&img, 150), 1.0);
    }

    #[test]
    fn test_image_stats() {
        let img = banded(100, 200);
        let stats = ImageStats::from_image(&img);
        assert_eq!(stats.min, 100);
        assert_eq!(stats.max, 200);
        assert!((stats.mean - 110.0).abs() < 1e-9);
        assert_eq!(stats.median, 100.0);
        assert!(stats.std_dev > 0.0);
        assert!(stats.p95 >= stats.p75 && stats.p75 >= stats.p25);
    }

    #[test]
    fn test_empty_image() {
        let img = RgbImage::new(0, 0);
        assert_eq!(compute_brightness(&img, BrightnessAlgorithm::Mean, 0.0), 0.0);
        assert_eq!(clipped_fraction(&img, 245), 0.0);
    }
}
