//! Native SDK Traits
//!
//! Defines the synchronous interface every camera SDK binding implements,
//! the error type shared by all bindings, and timeout configuration.

use crate::camera::*;
use std::fmt::Debug;
use std::time::Duration;
use thiserror::Error;

// =============================================================================
// TIMEOUT CONFIGURATION
// =============================================================================

/// Configuration for blocking SDK operations.
///
/// SDK calls can hang indefinitely if hardware becomes unresponsive. These
/// bounds keep the capture thread from waiting forever.
///
/// # Default Values
/// - `exposure_margin`: 60 seconds on top of the exposure duration
/// - `min_exposure_timeout`: 30 seconds
/// - `poll_interval`: 100ms
/// - `open_attempts`: 3, spaced by `open_retry_delay` (1 second)
#[derive(Debug, Clone)]
pub struct NativeTimeoutConfig {
    /// Readout margin added to the exposure duration when polling for completion.
    pub exposure_margin: Duration,

    /// Lower bound of the exposure polling timeout, for very short exposures.
    pub min_exposure_timeout: Duration,

    /// Poll interval for checking exposure completion.
    pub poll_interval: Duration,

    /// How many times to try opening a camera before giving up.
    pub open_attempts: u32,

    /// Wait between open attempts.
    pub open_retry_delay: Duration,
}

impl Default for NativeTimeoutConfig {
    fn default() -> Self {
        Self {
            exposure_margin: Duration::from_secs(60),
            min_exposure_timeout: Duration::from_secs(30),
            poll_interval: Duration::from_millis(100),
            open_attempts: 3,
            open_retry_delay: Duration::from_secs(1),
        }
    }
}

impl NativeTimeoutConfig {
    /// Short timeouts for in-process simulated cameras.
    pub fn strict() -> Self {
        Self {
            exposure_margin: Duration::from_secs(2),
            min_exposure_timeout: Duration::from_secs(2),
            poll_interval: Duration::from_millis(1),
            open_attempts: 3,
            open_retry_delay: Duration::from_millis(5),
        }
    }

    /// Exposure duration plus margin, never below `min_exposure_timeout`.
    pub fn calculate_exposure_timeout(&self, exposure_secs: f64) -> Duration {
        let timeout = Duration::from_secs_f64(exposure_secs.max(0.0)) + self.exposure_margin;
        timeout.max(self.min_exposure_timeout)
    }
}

// =============================================================================
// ERRORS
// =============================================================================

/// Errors from native SDK calls
#[derive(Error, Debug, Clone, PartialEq)]
pub enum NativeError {
    #[error("SDK library not found: {0}")]
    LibraryNotFound(String),

    #[error("Failed to load SDK library {path}: {reason}")]
    LibraryLoad { path: String, reason: String },

    #[error("Camera not connected")]
    NotConnected,

    #[error("Camera was removed")]
    Disconnected,

    /// The camera is held by another process or busy with another operation
    #[error("Camera busy (code {code}): {message}")]
    Busy { code: i32, message: String },

    #[error("SDK error {code}: {message}")]
    Sdk { code: i32, message: String },

    #[error("Operation not supported")]
    NotSupported,

    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("Exposure failed: {0}")]
    ExposureFailed(String),

    #[error("Exposure aborted")]
    ExposureAborted,

    /// Exposure polling timeout.
    #[error("Exposure polling timeout after {duration:?}: {details}")]
    ExposureTimeout {
        /// How long we polled before timing out
        duration: Duration,
        /// Details about the exposure (e.g., expected duration)
        details: String,
    },

    #[error("Operation timed out: {0}")]
    Timeout(String),
}

impl NativeError {
    /// Create an exposure polling timeout error.
    pub fn exposure_timeout(duration: Duration, expected_exposure: f64) -> Self {
        Self::ExposureTimeout {
            duration,
            details: format!(
                "expected exposure was {:.3}s, waited {:.1}s",
                expected_exposure,
                duration.as_secs_f64()
            ),
        }
    }

    /// Vendor error code, when the failure came from an SDK return value
    pub fn code(&self) -> Option<i32> {
        match self {
            Self::Busy { code, .. } | Self::Sdk { code, .. } => Some(*code),
            _ => None,
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout(_) | Self::ExposureTimeout { .. })
    }
}

// =============================================================================
// SDK INTERFACE
// =============================================================================

/// Synchronous camera SDK binding.
///
/// Methods map one-to-one onto vendor calls and take the SDK camera id.
/// Implementations serialize access internally; callers may share one
/// instance across threads.
pub trait CameraSdk: Send + Sync + Debug {
    /// Human-readable vendor name for logs
    fn vendor(&self) -> &str;

    fn num_cameras(&self) -> Result<usize, NativeError>;

    fn camera_info(&self, index: usize) -> Result<CameraInfo, NativeError>;

    fn open(&self, camera_id: i32) -> Result<(), NativeError>;

    fn init(&self, camera_id: i32) -> Result<(), NativeError>;

    fn close(&self, camera_id: i32) -> Result<(), NativeError>;

    fn control_range(&self, camera_id: i32, control: ControlType) -> Result<ControlRange, NativeError>;

    /// Returns the value and whether auto mode is active
    fn get_control(&self, camera_id: i32, control: ControlType) -> Result<(i64, bool), NativeError>;

    fn set_control(
        &self,
        camera_id: i32,
        control: ControlType,
        value: i64,
        auto: bool,
    ) -> Result<(), NativeError>;

    fn set_roi_format(&self, camera_id: i32, roi: RoiFormat) -> Result<(), NativeError>;

    fn roi_format(&self, camera_id: i32) -> Result<RoiFormat, NativeError>;

    fn start_exposure(&self, camera_id: i32) -> Result<(), NativeError>;

    fn stop_exposure(&self, camera_id: i32) -> Result<(), NativeError>;

    fn exposure_status(&self, camera_id: i32) -> Result<ExposureStatus, NativeError>;

    /// Copy the finished exposure into `buffer`, which must match the ROI size
    fn read_exposure_data(&self, camera_id: i32, buffer: &mut [u8]) -> Result<(), NativeError>;

    /// Leave video (streaming) mode if active
    fn stop_video_capture(&self, camera_id: i32) -> Result<(), NativeError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exposure_timeout_has_floor() {
        let config = NativeTimeoutConfig::default();
        let timeout = config.calculate_exposure_timeout(0.001);
        assert!(timeout > Duration::from_secs(60) && timeout < Duration::from_secs(61));

        let config = NativeTimeoutConfig {
            exposure_margin: Duration::from_secs(1),
            ..NativeTimeoutConfig::default()
        };
        assert_eq!(config.calculate_exposure_timeout(2.0), Duration::from_secs(30));
        assert_eq!(config.calculate_exposure_timeout(45.0), Duration::from_secs(46));
    }

    #[test]
    fn test_error_codes() {
        let busy = NativeError::Busy {
            code: 16,
            message: "in use".into(),
        };
        assert_eq!(busy.code(), Some(16));
        assert_eq!(NativeError::NotConnected.code(), None);
        assert!(NativeError::exposure_timeout(Duration::from_secs(3), 1.0).is_timeout());
    }
}
