//! Runtime configuration
//!
//! Everything has a default, so an empty JSON object is a valid config file.

use crate::backoff::ReconnectPolicy;
use crate::error::ConfigError;
use crate::schedule::ScheduleWindow;
use crate::settings::CameraSettings;
use sentinel_native::NativeTimeoutConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Shortest join timeout `stop` may use; long exposures must be able to finish
pub const MIN_STOP_TIMEOUT: Duration = Duration::from_secs(10);

/// Capture loop timing
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureOptions {
    /// Pause between frames
    pub interval_ms: u64,
    /// Frames allowed for the pre-capture exposure search
    pub calibration_attempts: u32,
    pub reconnect: ReconnectPolicy,
    /// How long `stop` waits for the capture thread to exit
    pub stop_timeout_ms: u64,
}

impl Default for CaptureOptions {
    fn default() -> Self {
        Self {
            interval_ms: 5_000,
            calibration_attempts: 15,
            reconnect: ReconnectPolicy::default(),
            stop_timeout_ms: 15_000,
        }
    }
}

impl CaptureOptions {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_millis(self.stop_timeout_ms)
    }
}

/// Connection and SDK call timing
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionOptions {
    /// Pause between disconnect and connect when reconnecting
    pub settle_delay_ms: u64,
    pub open_attempts: u32,
    pub open_retry_delay_ms: u64,
    /// Added to the exposure time when waiting for readout
    pub exposure_margin_secs: u64,
    pub min_exposure_timeout_secs: u64,
    pub poll_interval_ms: u64,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        let t = NativeTimeoutConfig::default();
        Self {
            settle_delay_ms: 500,
            open_attempts: t.open_attempts,
            open_retry_delay_ms: t.open_retry_delay.as_millis() as u64,
            exposure_margin_secs: t.exposure_margin.as_secs(),
            min_exposure_timeout_secs: t.min_exposure_timeout.as_secs(),
            poll_interval_ms: t.poll_interval.as_millis() as u64,
        }
    }
}

impl ConnectionOptions {
    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }

    pub fn timeouts(&self) -> NativeTimeoutConfig {
        NativeTimeoutConfig {
            exposure_margin: Duration::from_secs(self.exposure_margin_secs),
            min_exposure_timeout: Duration::from_secs(self.min_exposure_timeout_secs),
            poll_interval: Duration::from_millis(self.poll_interval_ms),
            open_attempts: self.open_attempts,
            open_retry_delay: Duration::from_millis(self.open_retry_delay_ms),
        }
    }
}

/// Top-level configuration file
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SentinelConfig {
    /// Vendor library; empty searches the platform default names
    pub sdk_path: PathBuf,
    pub camera_index: usize,
    pub settings: CameraSettings,
    pub schedule: ScheduleWindow,
    pub capture: CaptureOptions,
    pub connection: ConnectionOptions,
}

impl SentinelConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::Load(format!("{}: {}", path.display(), e)))?;
        let config: Self = serde_json::from_str(&text)
            .map_err(|e| ConfigError::Load(format!("{}: {}", path.display(), e)))?;
        config.validate()?;
        tracing::debug!("Loaded configuration from {}", path.display());
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.settings.validate()?;
        if self.capture.stop_timeout() < MIN_STOP_TIMEOUT {
            return Err(ConfigError::invalid(
                "capture.stop_timeout_ms",
                format!("must be at least {}", MIN_STOP_TIMEOUT.as_millis()),
            ));
        }
        if self.capture.reconnect.max_attempts == 0 {
            return Err(ConfigError::invalid("capture.reconnect.max_attempts", "must be at least 1"));
        }
        if self.connection.poll_interval_ms == 0 {
            return Err(ConfigError::invalid("connection.poll_interval_ms", "must be positive"));
        }
        Ok(())
    }
}
