//! Camera settings
//!
//! `CameraSettings` is an immutable snapshot handed to capture operations.
//! Changes go through `PartialSettings` and `CameraSettings::merged`, then are
//! pushed to the live camera by the connection manager.

use crate::error::ConfigError;
use sentinel_imaging::{
    BayerPattern, BrightnessAlgorithm, WhiteBalanceGains, DEFAULT_CLIP_FRACTION, DEFAULT_CLIP_LEVEL,
    GRAY_WORLD_HIGH_PERCENTILE, GRAY_WORLD_LOW_PERCENTILE, MAX_SOFTWARE_GAIN, MIN_SOFTWARE_GAIN,
};
use serde::{Deserialize, Deserializer, Serialize};
use std::time::Duration;

/// Shortest exposure the ASI cameras accept (32 microseconds)
pub const MIN_EXPOSURE: Duration = Duration::from_micros(32);

/// Longest exposure the ASI cameras accept (2000 seconds)
pub const MAX_EXPOSURE: Duration = Duration::from_secs(2000);

const MAX_EXPOSURE_MS: f64 = 2_000_000.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FlipMode {
    #[default]
    None,
    Horizontal,
    Vertical,
    Both,
}

impl FlipMode {
    /// ASI_FLIP value
    pub fn sdk_value(self) -> i64 {
        match self {
            FlipMode::None => 0,
            FlipMode::Horizontal => 1,
            FlipMode::Vertical => 2,
            FlipMode::Both => 3,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WhiteBalanceMode {
    /// Fixed red/blue gains from the settings
    #[default]
    Manual,
    /// The camera's own auto white balance
    AsiAuto,
    /// Camera gains neutral (50/50), balanced in software per frame
    GrayWorld,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CameraSettings {
    pub exposure_ms: f64,
    pub gain: i64,
    pub white_balance: WhiteBalanceMode,
    pub wb_r: i64,
    pub wb_b: i64,
    pub offset: i64,
    pub flip: FlipMode,
    pub bayer_pattern: BayerPattern,
    pub use_raw16: bool,
    pub auto_exposure: bool,
    pub target_brightness: f64,
    pub max_exposure_ms: f64,
    #[serde(deserialize_with = "lenient_algorithm")]
    pub brightness_algorithm: BrightnessAlgorithm,
    pub brightness_percentile: f64,
    /// Fraction of clipped samples that counts as clipping
    pub clipping_threshold: f64,
    /// Sample level above which a sample is clipped
    pub clip_level: u8,
    /// Multiply red/blue by `software_gain_r`/`software_gain_b` after debayering (manual mode only)
    pub software_gains: bool,
    pub software_gain_r: f64,
    pub software_gain_b: f64,
    /// Luminance percentile band that gray world averages over
    pub gray_world_low_percentile: f64,
    pub gray_world_high_percentile: f64,
}

impl Default for CameraSettings {
    fn default() -> Self {
        Self {
            exposure_ms: 100.0,
            gain: 100,
            white_balance: WhiteBalanceMode::Manual,
            wb_r: 75,
            wb_b: 99,
            offset: 20,
            flip: FlipMode::None,
            bayer_pattern: BayerPattern::Bggr,
            use_raw16: false,
            auto_exposure: true,
            target_brightness: 100.0,
            max_exposure_ms: 30_000.0,
            brightness_algorithm: BrightnessAlgorithm::Percentile,
            brightness_percentile: 75.0,
            clipping_threshold: DEFAULT_CLIP_FRACTION,
            clip_level: DEFAULT_CLIP_LEVEL,
            software_gains: false,
            software_gain_r: 1.0,
            software_gain_b: 1.0,
            gray_world_low_percentile: GRAY_WORLD_LOW_PERCENTILE,
            gray_world_high_percentile: GRAY_WORLD_HIGH_PERCENTILE,
        }
    }
}

/// Never panics: out-of-range and NaN inputs saturate into [0, MAX_EXPOSURE]
fn ms_to_duration(ms: f64) -> Duration {
    Duration::try_from_secs_f64(ms.clamp(0.0, MAX_EXPOSURE_MS) / 1000.0).unwrap_or(Duration::ZERO)
}

fn lenient_algorithm<'de, D>(deserializer: D) -> Result<BrightnessAlgorithm, D::Error>
where
    D: Deserializer<'de>,
{
    let name = String::deserialize(deserializer)?;
    Ok(BrightnessAlgorithm::from_name_or_default(&name))
}

impl CameraSettings {
    pub fn exposure(&self) -> Duration {
        ms_to_duration(self.exposure_ms)
    }

    pub fn max_exposure(&self) -> Duration {
        ms_to_duration(self.max_exposure_ms)
    }

    pub fn set_exposure(&mut self, exposure: Duration) {
        self.exposure_ms = exposure.as_secs_f64() * 1000.0;
    }

    /// Software gains for manual mode, `None` when disabled or not in manual mode
    pub fn manual_software_gains(&self) -> Option<WhiteBalanceGains> {
        (self.white_balance == WhiteBalanceMode::Manual && self.software_gains)
            .then(|| WhiteBalanceGains::manual(self.software_gain_r, self.software_gain_b))
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let min_ms = MIN_EXPOSURE.as_secs_f64() * 1000.0;
        if !(self.exposure_ms > 0.0 && self.exposure_ms <= MAX_EXPOSURE_MS) {
            return Err(ConfigError::invalid(
                "exposure_ms",
                format!("must be positive and at most {}", MAX_EXPOSURE_MS),
            ));
        }
        if !(self.max_exposure_ms >= min_ms && self.max_exposure_ms <= MAX_EXPOSURE_MS) {
            return Err(ConfigError::invalid(
                "max_exposure_ms",
                format!("must be in [{}, {}]", min_ms, MAX_EXPOSURE_MS),
            ));
        }
        if self.auto_exposure && self.exposure_ms > self.max_exposure_ms {
            return Err(ConfigError::invalid(
                "exposure_ms",
                "must not exceed max_exposure_ms with auto exposure",
            ));
        }
        if self.gain < 0 {
            return Err(ConfigError::invalid("gain", "must not be negative"));
        }
        if !(self.target_brightness > 0.0 && self.target_brightness <= 255.0) {
            return Err(ConfigError::invalid("target_brightness", "must be in (0, 255]"));
        }
        if !(0.0..=100.0).contains(&self.brightness_percentile) {
            return Err(ConfigError::invalid("brightness_percentile", "must be in [0, 100]"));
        }
        if !(0.0..=1.0).contains(&self.clipping_threshold) {
            return Err(ConfigError::invalid("clipping_threshold", "must be a fraction in [0, 1]"));
        }
        for (field, gain) in [("software_gain_r", self.software_gain_r), ("software_gain_b", self.software_gain_b)] {
            if !(MIN_SOFTWARE_GAIN..=MAX_SOFTWARE_GAIN).contains(&gain) {
                return Err(ConfigError::invalid(
                    field,
                    format!("must be in [{}, {}]", MIN_SOFTWARE_GAIN, MAX_SOFTWARE_GAIN),
                ));
            }
        }
        let (low, high) = (self.gray_world_low_percentile, self.gray_world_high_percentile);
        if !(0.0..=100.0).contains(&low) || !(0.0..=100.0).contains(&high) || low >= high {
            return Err(ConfigError::invalid(
                "gray_world_low_percentile",
                "percentile band must satisfy 0 <= low < high <= 100",
            ));
        }
        Ok(())
    }

    /// Merge a partial update. The result is validated before being returned.
    pub fn merged(&self, partial: &PartialSettings) -> Result<Self, ConfigError> {
        let mut next = self.clone();
        macro_rules! take {
            ($($field:ident),*) => {
                $(if let Some(v) = partial.$field.clone() { next.$field = v; })*
            };
        }
        take!(
            exposure_ms,
            gain,
            white_balance,
            wb_r,
            wb_b,
            offset,
            flip,
            bayer_pattern,
            use_raw16,
            auto_exposure,
            target_brightness,
            max_exposure_ms,
            brightness_algorithm,
            brightness_percentile,
            clipping_threshold,
            clip_level,
            software_gains,
            software_gain_r,
            software_gain_b,
            gray_world_low_percentile,
            gray_world_high_percentile
        );
        if next.auto_exposure && partial.exposure_ms.is_none() && next.exposure_ms > next.max_exposure_ms {
            next.exposure_ms = next.max_exposure_ms;
        }
        next.validate()?;
        Ok(next)
    }
}

/// A subset of settings to change while running
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PartialSettings {
    pub exposure_ms: Option<f64>,
    pub gain: Option<i64>,
    pub white_balance: Option<WhiteBalanceMode>,
    pub wb_r: Option<i64>,
    pub wb_b: Option<i64>,
    pub offset: Option<i64>,
    pub flip: Option<FlipMode>,
    pub bayer_pattern: Option<BayerPattern>,
    pub use_raw16: Option<bool>,
    pub auto_exposure: Option<bool>,
    pub target_brightness: Option<f64>,
    pub max_exposure_ms: Option<f64>,
    pub brightness_algorithm: Option<BrightnessAlgorithm>,
    pub brightness_percentile: Option<f64>,
    pub clipping_threshold: Option<f64>,
    pub clip_level: Option<u8>,
    pub software_gains: Option<bool>,
    pub software_gain_r: Option<f64>,
    pub software_gain_b: Option<f64>,
    pub gray_world_low_percentile: Option<f64>,
    pub gray_world_high_percentile: Option<f64>,
}

impl PartialSettings {
    pub fn is_empty(&self) -> bool {
        *self == PartialSettings::default()
    }

    /// Fold a later update into this one; fields set in `newer` win
    pub fn merge(&mut self, newer: PartialSettings) {
        let pending = self;
        macro_rules! overlay {
            ($($field:ident),*) => {
                $(if newer.$field.is_some() { pending.$field = newer.$field; })*
            };
        }
        overlay!(
            exposure_ms,
            gain,
            white_balance,
            wb_r,
            wb_b,
            offset,
            flip,
            bayer_pattern,
            use_raw16,
            auto_exposure,
            target_brightness,
            max_exposure_ms,
            brightness_algorithm,
            brightness_percentile,
            clipping_threshold,
            clip_level,
            software_gains,
            software_gain_r,
            software_gain_b,
            gray_world_low_percentile,
            gray_world_high_percentile
        );
    }

    /// True when only values that need no camera write changed
    pub fn is_processing_only(&self) -> bool {
        self.exposure_ms.is_none()
            && self.gain.is_none()
            && self.white_balance.is_none()
            && self.wb_r.is_none()
            && self.wb_b.is_none()
            && self.offset.is_none()
            && self.flip.is_none()
            && self.use_raw16.is_none()
    }
}
