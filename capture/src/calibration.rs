//! Exposure calibration engine
//!
//! Two separate algorithms share the brightness measurement:
//!
//! - `run_calibration` is a bounded multiplicative search run before
//!   continuous capture. Steps are large (up to 4x) and it stops as soon as
//!   the measured brightness is within 5% of target.
//! - `adjust_exposure_auto` is a single damped step per captured frame with a
//!   wide acceptance band, so normal sky variation does not cause hunting.
//!
//! Clipping always wins over brightness: a clipped frame only ever shortens
//! the exposure.

use crate::error::{CalibrationError, CaptureError};
use crate::settings::{CameraSettings, MAX_EXPOSURE, MIN_EXPOSURE};
use image::RgbImage;
use sentinel_imaging::{clipped_fraction, compute_brightness, BrightnessAlgorithm};
use serde::Serialize;
use std::fmt;
use std::time::Duration;

/// Calibration stops when brightness is within this fraction of target
pub const CALIBRATION_TOLERANCE: f64 = 0.05;
/// Per-iteration calibration step bounds
pub const CALIBRATION_STEP_MIN: f64 = 0.25;
pub const CALIBRATION_STEP_MAX: f64 = 4.0;
/// Largest calibration step allowed while the frame is clipped
pub const CALIBRATION_CLIP_STEP: f64 = 0.5;

/// Per-frame trim leaves exposure alone within this fraction of target
pub const TRIM_BAND: f64 = 0.20;
/// Deviations beyond this fraction apply the full correction
pub const TRIM_AGGRESSIVE: f64 = 0.50;
pub const TRIM_FACTOR_MIN: f64 = 0.5;
pub const TRIM_FACTOR_MAX: f64 = 2.0;
/// Largest per-frame factor while the frame is clipped
pub const TRIM_CLIP_FACTOR: f64 = 0.7;

/// Result of a calibration run
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ExposureEstimate {
    pub exposure: Duration,
    /// Brightness measured at `exposure`
    pub brightness: f64,
    /// Frames taken to reach this estimate
    pub attempts: u32,
    pub converged: bool,
}

impl fmt::Display for ExposureEstimate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:.2}ms at brightness {:.1} after {} frames",
            self.exposure.as_secs_f64() * 1000.0,
            self.brightness,
            self.attempts
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AdjustReason {
    WithinBand,
    TooDark,
    TooBright,
    Clipping,
    /// A correction was wanted but the exposure is pinned at a bound
    AtLimit,
}

/// One per-frame trim decision
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ExposureDelta {
    pub previous: Duration,
    pub proposed: Duration,
    pub brightness: f64,
    pub clipped_fraction: f64,
    pub reason: AdjustReason,
}

impl ExposureDelta {
    pub fn changed(&self) -> bool {
        self.previous != self.proposed
    }

    pub fn factor(&self) -> f64 {
        self.proposed.as_secs_f64() / self.previous.as_secs_f64().max(f64::MIN_POSITIVE)
    }
}

/// Brightness and clipping read from one frame
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Measurement {
    pub brightness: f64,
    pub clipped_fraction: f64,
    pub clipping: bool,
}

#[derive(Debug, Clone)]
pub struct ExposureCalibrator {
    target_brightness: f64,
    min_exposure: Duration,
    max_exposure: Duration,
    algorithm: BrightnessAlgorithm,
    percentile: f64,
    clip_level: u8,
    clip_threshold: f64,
    current: Duration,
}

impl ExposureCalibrator {
    pub fn from_settings(settings: &CameraSettings) -> Self {
        let max_exposure = settings.max_exposure().clamp(MIN_EXPOSURE, MAX_EXPOSURE);
        Self {
            target_brightness: settings.target_brightness,
            min_exposure: MIN_EXPOSURE,
            max_exposure,
            algorithm: settings.brightness_algorithm,
            percentile: settings.brightness_percentile,
            clip_level: settings.clip_level,
            clip_threshold: settings.clipping_threshold,
            current: settings.exposure().clamp(MIN_EXPOSURE, max_exposure),
        }
    }

    /// Current exposure estimate
    pub fn exposure(&self) -> Duration {
        self.current
    }

    pub fn set_exposure(&mut self, exposure: Duration) {
        self.current = self.clamp(exposure);
    }

    pub fn bounds(&self) -> (Duration, Duration) {
        (self.min_exposure, self.max_exposure)
    }

    fn clamp(&self, exposure: Duration) -> Duration {
        exposure.clamp(self.min_exposure, self.max_exposure)
    }

    pub fn measure(&self, image: &RgbImage) -> Measurement {
        let brightness = compute_brightness(image, self.algorithm, self.percentile);
        let clipped = clipped_fraction(image, self.clip_level);
        Measurement {
            brightness,
            clipped_fraction: clipped,
            clipping: clipped > self.clip_threshold,
        }
    }

    /// Capture-measure-correct up to `max_attempts` times.
    ///
    /// `capture` takes one frame at the given exposure. On success the
    /// estimate's exposure is also the calibrator's current exposure. On
    /// `NoConvergence` the current exposure is set to the best estimate seen.
    pub fn run_calibration<F>(&mut self, max_attempts: u32, mut capture: F) -> Result<ExposureEstimate, CalibrationError>
    where
        F: FnMut(Duration) -> Result<RgbImage, CaptureError>,
    {
        let max_attempts = max_attempts.max(1);
        let target = self.target_brightness;
        let tolerance = target * CALIBRATION_TOLERANCE;
        let mut attempts = 0;
        let mut best_error = f64::INFINITY;
        let mut best = ExposureEstimate {
            exposure: self.current,
            brightness: 0.0,
            attempts: 0,
            converged: false,
        };

        tracing::info!(
            "Calibrating exposure: target={:.1} +/- {:.1}, start={:?}, range={:?}-{:?}",
            target,
            tolerance,
            self.current,
            self.min_exposure,
            self.max_exposure
        );

        while attempts < max_attempts {
            attempts += 1;
            let exposure = self.current;
            let image = capture(exposure)?;
            let m = self.measure(&image);
            let error = (m.brightness - target).abs();
            let converged = error <= tolerance && !m.clipping;
            let estimate = ExposureEstimate {
                exposure,
                brightness: m.brightness,
                attempts,
                converged,
            };

            tracing::info!(
                "Calibration {}/{}: {:?} -> brightness {:.1} (clipped {:.2}%)",
                attempts,
                max_attempts,
                exposure,
                m.brightness,
                m.clipped_fraction * 100.0
            );

            if converged {
                tracing::info!("Calibration converged: {}", estimate);
                return Ok(estimate);
            }
            if error <= best_error {
                best_error = error;
                best = estimate;
            }

            let mut step = (target / m.brightness.max(1.0)).clamp(CALIBRATION_STEP_MIN, CALIBRATION_STEP_MAX);
            if m.clipping {
                step = step.min(CALIBRATION_CLIP_STEP);
            }
            let next = self.clamp(scale(exposure, step));
            if next == exposure {
                tracing::warn!("Calibration pinned at {:?}, stopping early", exposure);
                break;
            }
            self.current = next;
        }

        self.current = best.exposure;
        tracing::warn!(
            "Calibration did not converge after {} attempts, using {}",
            attempts,
            best
        );
        Err(CalibrationError::NoConvergence { attempts, best })
    }

    /// One damped correction for a captured frame
    pub fn adjust_exposure_auto(&mut self, image: &RgbImage) -> ExposureDelta {
        let m = self.measure(image);
        let target = self.target_brightness;
        let previous = self.current;
        let ratio = target / m.brightness.max(1.0);
        let deviation = (m.brightness - target).abs() / target;

        let (factor, reason) = if m.clipping {
            (ratio.clamp(TRIM_FACTOR_MIN, TRIM_CLIP_FACTOR), AdjustReason::Clipping)
        } else if deviation <= TRIM_BAND {
            (1.0, AdjustReason::WithinBand)
        } else {
            let raw = if deviation > TRIM_AGGRESSIVE { ratio } else { ratio.sqrt() };
            let reason = if ratio > 1.0 {
                AdjustReason::TooDark
            } else {
                AdjustReason::TooBright
            };
            (raw.clamp(TRIM_FACTOR_MIN, TRIM_FACTOR_MAX), reason)
        };

        let proposed = if reason == AdjustReason::WithinBand {
            previous
        } else {
            self.clamp(scale(previous, factor))
        };
        let reason = if reason != AdjustReason::WithinBand && proposed == previous {
            AdjustReason::AtLimit
        } else {
            reason
        };
        self.current = proposed;

        let delta = ExposureDelta {
            previous,
            proposed,
            brightness: m.brightness,
            clipped_fraction: m.clipped_fraction,
            reason,
        };
        if delta.changed() {
            tracing::debug!(
                "Auto exposure {:?}: brightness {:.1} -> {:?} to {:?} (x{:.2})",
                reason,
                m.brightness,
                previous,
                proposed,
                delta.factor()
            );
        }
        delta
    }
}

/// `exposure * factor`, saturating instead of panicking on overflow
fn scale(exposure: Duration, factor: f64) -> Duration {
    Duration::try_from_secs_f64(exposure.as_secs_f64() * factor).unwrap_or(MAX_EXPOSURE)
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    fn gray(level: u8) -> RgbImage {
        RgbImage::from_pixel(20, 20, Rgb([level, level, level]))
    }

    /// Linear sensor: `slope` brightness per millisecond, saturating at 255
    fn linear(slope: f64) -> impl FnMut(Duration) -> Result<RgbImage, CaptureError> {
        move |exposure| {
            let level = (exposure.as_secs_f64() * 1000.0 * slope).round().min(255.0);
            Ok(gray(level as u8))
        }
    }

    #[test]
    fn test_scale_saturates() {
        assert_eq!(scale(Duration::from_secs(2), 0.5), Duration::from_secs(1));
        assert_eq!(scale(Duration::MAX, 4.0), MAX_EXPOSURE);
        assert_eq!(scale(Duration::from_secs(1), f64::NAN), MAX_EXPOSURE);

        let mut cal = ExposureCalibrator::from_settings(&settings(1e30, 1e30));
        assert_eq!(cal.bounds().1, MAX_EXPOSURE);
        assert_eq!(cal.exposure(), MAX_EXPOSURE);
        let delta = cal.adjust_exposure_auto(&gray(0));
        assert_eq!(delta.reason, AdjustReason::AtLimit);
    }

    fn settings(exposure_ms: f64, max_ms: f64) -> CameraSettings {
        CameraSettings {
            exposure_ms,
            max_exposure_ms: max_ms,
            target_brightness: 100.0,
            brightness_algorithm: BrightnessAlgorithm::Mean,
            ..CameraSettings::default()
        }
    }

    #[test]
    fn test_calibration_converges_on_linear_sensor() {
        let mut cal = ExposureCalibrator::from_settings(&settings(1000.0, 30_000.0));
        let est = cal.run_calibration(15, linear(0.08)).unwrap();
        assert!(est.converged);
        assert!((est.brightness - 100.0).abs() <= 5.0);
        assert!(est.attempts < 15);
        assert_eq!(cal.exposure(), est.exposure);
    }

    #[test]
    fn test_calibration_from_far_off_start() {
        let mut cal = ExposureCalibrator::from_settings(&settings(1.0, 30_000.0));
        let est = cal.run_calibration(15, linear(0.01)).unwrap();
        assert!((est.brightness - 100.0).abs() <= 5.0);
        assert!(est.exposure <= Duration::from_secs(30));
    }

    #[test]
    fn test_calibration_never_exceeds_max() {
        let mut seen = Vec::new();
        let mut cal = ExposureCalibrator::from_settings(&settings(100.0, 2_000.0));
        let err = cal
            .run_calibration(15, |exposure| {
                seen.push(exposure);
                Ok(gray(10))
            })
            .unwrap_err();

        assert!(seen.iter().all(|&e| e >= MIN_EXPOSURE && e <= Duration::from_secs(2)));
        match err {
            CalibrationError::NoConvergence { attempts, best } => {
                assert!(attempts < 15, "should stop once pinned at the bound");
                assert_eq!(best.exposure, Duration::from_secs(2));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_calibration_clipped_frames_step_down() {
        let mut seen = Vec::new();
        let mut cal = ExposureCalibrator::from_settings(&settings(1000.0, 30_000.0));
        let _ = cal.run_calibration(3, |exposure| {
            seen.push(exposure);
            Ok(gray(255))
        });
        assert!(seen[1] <= seen[0] / 2);
    }

    #[test]
    fn test_calibration_propagates_capture_error() {
        let mut cal = ExposureCalibrator::from_settings(&settings(100.0, 1000.0));
        let err = cal
            .run_calibration(5, |_| Err(CaptureError::Timeout("slow".into())))
            .unwrap_err();
        assert!(matches!(err, CalibrationError::Capture(CaptureError::Timeout(_))));
    }

    #[test]
    fn test_trim_within_band_is_noop() {
        let mut cal = ExposureCalibrator::from_settings(&settings(1000.0, 30_000.0));
        let delta = cal.adjust_exposure_auto(&gray(115));
        assert_eq!(delta.reason, AdjustReason::WithinBand);
        assert!(!delta.changed());
    }

    #[test]
    fn test_trim_damped_and_aggressive() {
        let mut cal = ExposureCalibrator::from_settings(&settings(1000.0, 30_000.0));
        // 30% too dark: sqrt(100/70)
        let delta = cal.adjust_exposure_auto(&gray(70));
        assert_eq!(delta.reason, AdjustReason::TooDark);
        assert!((delta.factor() - (100.0f64 / 70.0).sqrt()).abs() < 1e-6);

        // 4x too bright: full ratio clamped to 0.5
        cal.set_exposure(Duration::from_millis(1000));
        let delta = cal.adjust_exposure_auto(&gray(220));
        assert_eq!(delta.reason, AdjustReason::TooBright);
        assert!((delta.factor() - 0.5).abs() < 1e-6);
    }

    #[test]
    fn test_trim_clipping_only_shortens() {
        let mut cal = ExposureCalibrator::from_settings(&settings(1000.0, 30_000.0));
        // Mostly dark frame with a saturated band above the clip fraction
        let image = RgbImage::from_fn(10, 10, |_, y| if y < 2 { Rgb([255, 255, 255]) } else { Rgb([20, 20, 20]) });
        let delta = cal.adjust_exposure_auto(&image);
        assert_eq!(delta.reason, AdjustReason::Clipping);
        assert!(delta.factor() <= TRIM_CLIP_FACTOR + 1e-9);
    }

    #[test]
    fn test_trim_reports_limit() {
        let mut cal = ExposureCalibrator::from_settings(&settings(500.0, 500.0));
        let delta = cal.adjust_exposure_auto(&gray(10));
        assert_eq!(delta.reason, AdjustReason::AtLimit);
        assert_eq!(delta.proposed, Duration::from_millis(500));
    }
}
