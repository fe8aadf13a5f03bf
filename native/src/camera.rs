//! Camera value types shared by every SDK implementation

use crate::traits::NativeError;
use crate::utils::calculate_buffer_size;
use sentinel_imaging::BayerPattern;
use serde::{Deserialize, Serialize};

/// Static description of one enumerated camera
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CameraInfo {
    /// Enumeration index (may change across USB re-enumeration)
    pub index: usize,
    /// SDK camera id used by every per-camera call
    pub camera_id: i32,
    pub name: String,
    pub max_width: u32,
    pub max_height: u32,
    /// Pixel pitch in micrometres
    pub pixel_size_um: f64,
    pub is_color: bool,
    pub bayer_pattern: Option<BayerPattern>,
    pub bit_depth: u32,
    pub supports_raw16: bool,
    pub is_usb3: bool,
    pub has_cooler: bool,
}

/// Adjustable camera controls
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ControlType {
    Gain,
    /// Microseconds
    Exposure,
    WhiteBalanceRed,
    WhiteBalanceBlue,
    Offset,
    BandwidthOverload,
    /// Read-only, reported as degrees C x 10
    Temperature,
    Flip,
    AutoMaxGain,
    /// Milliseconds
    AutoMaxExposure,
    AutoTargetBrightness,
}

impl ControlType {
    /// ASI_CONTROL_TYPE value
    pub fn sdk_code(self) -> i32 {
        match self {
            ControlType::Gain => 0,
            ControlType::Exposure => 1,
            ControlType::WhiteBalanceRed => 3,
            ControlType::WhiteBalanceBlue => 4,
            ControlType::Offset => 5,
            ControlType::BandwidthOverload => 6,
            ControlType::Temperature => 8,
            ControlType::Flip => 9,
            ControlType::AutoMaxGain => 10,
            ControlType::AutoMaxExposure => 11,
            ControlType::AutoTargetBrightness => 12,
        }
    }

    pub fn from_sdk_code(code: i32) -> Option<Self> {
        Some(match code {
            0 => ControlType::Gain,
            1 => ControlType::Exposure,
            3 => ControlType::WhiteBalanceRed,
            4 => ControlType::WhiteBalanceBlue,
            5 => ControlType::Offset,
            6 => ControlType::BandwidthOverload,
            8 => ControlType::Temperature,
            9 => ControlType::Flip,
            10 => ControlType::AutoMaxGain,
            11 => ControlType::AutoMaxExposure,
            12 => ControlType::AutoTargetBrightness,
            _ => return None,
        })
    }
}

/// Reported limits for one control
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControlRange {
    pub min: i64,
    pub max: i64,
    pub default: i64,
    pub writable: bool,
    pub auto_supported: bool,
}

impl ControlRange {
    pub fn clamp(&self, value: i64) -> i64 {
        value.clamp(self.min, self.max)
    }

    pub fn contains(&self, value: i64) -> bool {
        value >= self.min && value <= self.max
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ImageType {
    #[default]
    Raw8,
    Raw16,
}

impl ImageType {
    pub fn sdk_code(self) -> i32 {
        match self {
            ImageType::Raw8 => 0,
            ImageType::Raw16 => 2,
        }
    }

    pub fn from_sdk_code(code: i32) -> Option<Self> {
        match code {
            0 => Some(ImageType::Raw8),
            2 => Some(ImageType::Raw16),
            _ => None,
        }
    }

    pub fn bytes_per_pixel(self) -> u32 {
        match self {
            ImageType::Raw8 => 1,
            ImageType::Raw16 => 2,
        }
    }

    pub fn bit_depth(self) -> u32 {
        self.bytes_per_pixel() * 8
    }
}

/// Region of interest and transfer format
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RoiFormat {
    pub width: u32,
    pub height: u32,
    pub bin: u32,
    pub image_type: ImageType,
}

impl RoiFormat {
    pub fn full_frame(info: &CameraInfo, image_type: ImageType) -> Self {
        Self {
            width: info.max_width,
            height: info.max_height,
            bin: 1,
            image_type,
        }
    }

    pub fn buffer_size(&self) -> Result<usize, NativeError> {
        calculate_buffer_size(self.width, self.height, self.image_type.bytes_per_pixel())
    }
}

/// Snapshot exposure state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExposureStatus {
    Idle,
    Working,
    Success,
    Failed,
}

impl ExposureStatus {
    pub fn from_sdk_code(code: i32) -> Self {
        match code {
            1 => ExposureStatus::Working,
            2 => ExposureStatus::Success,
            3 => ExposureStatus::Failed,
            _ => ExposureStatus::Idle,
        }
    }
}

/// Undecoded sensor readout
#[derive(Debug, Clone)]
pub struct RawFrame {
    pub width: u32,
    pub height: u32,
    pub image_type: ImageType,
    pub data: Vec<u8>,
}

impl RawFrame {
    /// Little-endian 16-bit samples; only meaningful for `Raw16`
    pub fn samples_u16(&self) -> Vec<u16> {
        self.data
            .chunks_exact(2)
            .map(|chunk| u16::from_le_bytes([chunk[0], chunk[1]]))
            .collect()
    }
}
