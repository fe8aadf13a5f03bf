//! Delivered frames and their metadata

use crate::error::CaptureError;
use crate::settings::{CameraSettings, WhiteBalanceMode};
use chrono::{DateTime, Utc};
use image::{Rgb, RgbImage};
use sentinel_imaging::{
    apply_gains, apply_gray_world, debayer, debayer_u16, BayerPattern, ImageStats, WhiteBalanceGains,
};
use sentinel_native::{ImageType, RawFrame};
use serde::Serialize;
use std::time::Duration;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FrameMetadata {
    pub camera_name: String,
    pub session_id: Uuid,
    /// 1-based within the session
    pub frame_number: u64,
    pub exposure_ms: f64,
    pub gain: i64,
    /// Degrees C; `None` when the camera has no sensor or the read failed
    pub temperature_c: Option<f64>,
    pub timestamp: DateTime<Utc>,
    pub width: u32,
    pub height: u32,
    pub bit_depth: u32,
    /// `None` for mono sensors
    pub bayer_pattern: Option<BayerPattern>,
    pub brightness: f64,
    pub clipped_percent: f64,
    /// Auto exposure changed the exposure for the next frame
    pub exposure_adjusted: bool,
    /// Software white balance applied after debayering
    pub white_balance_gains: Option<WhiteBalanceGains>,
    pub stats: ImageStats,
}

/// A decoded image plus metadata. Ownership passes to the observer.
#[derive(Debug, Clone)]
pub struct Frame {
    pub image: RgbImage,
    pub metadata: FrameMetadata,
}

/// Convert a raw readout to RGB. `pattern` is `None` for mono sensors.
pub fn decode_raw(raw: &RawFrame, pattern: Option<BayerPattern>) -> Result<RgbImage, CaptureError> {
    match (pattern, raw.image_type) {
        (Some(pattern), ImageType::Raw8) => Ok(debayer(&raw.data, raw.width, raw.height, pattern)?),
        (Some(pattern), ImageType::Raw16) => {
            Ok(debayer_u16(&raw.samples_u16(), raw.width, raw.height, pattern)?)
        }
        (None, image_type) => {
            let samples: Vec<u8> = match image_type {
                ImageType::Raw8 => raw.data.clone(),
                ImageType::Raw16 => raw
                    .samples_u16()
                    .into_iter()
                    .map(|v| ((v as u32 + 128) / 257).min(255) as u8)
                    .collect(),
            };
            let expected = raw.width as usize * raw.height as usize;
            if samples.len() != expected {
                return Err(CaptureError::Decode(format!(
                    "expected {} samples, got {}",
                    expected,
                    samples.len()
                )));
            }
            Ok(RgbImage::from_fn(raw.width, raw.height, |x, y| {
                let v = samples[y as usize * raw.width as usize + x as usize];
                Rgb([v, v, v])
            }))
        }
    }
}

/// Decode, then apply the configured software white balance.
///
/// Mono frames are never balanced. Returns the gains that were applied.
pub fn develop(
    raw: &RawFrame,
    pattern: Option<BayerPattern>,
    settings: &CameraSettings,
) -> Result<(RgbImage, Option<WhiteBalanceGains>), CaptureError> {
    let mut image = decode_raw(raw, pattern)?;
    if pattern.is_none() {
        return Ok((image, None));
    }
    let gains = match settings.white_balance {
        WhiteBalanceMode::GrayWorld => Some(apply_gray_world(
            &mut image,
            settings.gray_world_low_percentile,
            settings.gray_world_high_percentile,
        )),
        _ => settings.manual_software_gains().map(|gains| {
            apply_gains(&mut image, gains);
            gains
        }),
    };
    Ok((image, gains))
}

/// Numbers frames and stamps session-wide metadata
#[derive(Debug, Clone)]
pub struct FrameBuilder {
    camera_name: String,
    session_id: Uuid,
    frames: u64,
}

/// Per-exposure values that go into the metadata
#[derive(Debug, Clone, Copy)]
pub struct ExposureRecord {
    pub exposure: Duration,
    pub gain: i64,
    pub temperature_c: Option<f64>,
    pub brightness: f64,
    pub clipped_fraction: f64,
    pub exposure_adjusted: bool,
    pub white_balance_gains: Option<WhiteBalanceGains>,
}

impl FrameBuilder {
    pub fn new(camera_name: impl Into<String>) -> Self {
        Self {
            camera_name: camera_name.into(),
            session_id: Uuid::new_v4(),
            frames: 0,
        }
    }

    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    /// Frames built so far
    pub fn frame_count(&self) -> u64 {
        self.frames
    }

    pub fn set_camera_name(&mut self, name: impl Into<String>) {
        self.camera_name = name.into();
    }

    pub fn build(
        &mut self,
        raw: &RawFrame,
        pattern: Option<BayerPattern>,
        image: RgbImage,
        record: ExposureRecord,
    ) -> Frame {
        self.frames += 1;
        let metadata = FrameMetadata {
            camera_name: self.camera_name.clone(),
            session_id: self.session_id,
            frame_number: self.frames,
            exposure_ms: record.exposure.as_secs_f64() * 1000.0,
            gain: record.gain,
            temperature_c: record.temperature_c,
            timestamp: Utc::now(),
            width: image.width(),
            height: image.height(),
            bit_depth: raw.image_type.bit_depth(),
            bayer_pattern: pattern,
            brightness: record.brightness,
            clipped_percent: record.clipped_fraction * 100.0,
            exposure_adjusted: record.exposure_adjusted,
            white_balance_gains: record.white_balance_gains,
            stats: ImageStats::from_image(&image),
        };
        Frame { image, metadata }
    }
}
