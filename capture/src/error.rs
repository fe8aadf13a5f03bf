//! Error types for the capture core
//!
//! Every SDK failure is normalized into one of these enums before it reaches
//! the capture loop. Transient capture errors are retried; only
//! `ErrorKind::ReconnectExhausted` stops the loop for good.
//!
//! # Error Categories
//!
//! - `SdkError`: library loading and camera enumeration
//! - `ConnectError`: opening and configuring a camera
//! - `CalibrationError`: pre-capture exposure search
//! - `CaptureError`: a single exposure/readout cycle
//! - `StartError` / `ConfigError`: inbound API misuse

use crate::calibration::ExposureEstimate;
use sentinel_native::NativeError;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum SdkError {
    #[error("SDK library not found: {0}")]
    NotFound(String),

    #[error("SDK initialization failed: {0}")]
    InitFailed(String),

    #[error("SDK not initialized")]
    NotInitialized,

    #[error("Camera enumeration failed: {0}")]
    Enumeration(String),
}

impl From<NativeError> for SdkError {
    fn from(err: NativeError) -> Self {
        match err {
            NativeError::LibraryNotFound(path) => SdkError::NotFound(path),
            NativeError::LibraryLoad { path, reason } => {
                SdkError::InitFailed(format!("{}: {}", path, reason))
            }
            other => SdkError::Enumeration(other.to_string()),
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConnectError {
    #[error("Camera already open: {0}")]
    AlreadyOpen(String),

    #[error("Camera busy (code {code}): {message}")]
    DeviceBusy { code: i32, message: String },

    /// SDK call failed; `code` is the vendor error code when one was returned
    #[error("SDK failure (code {code:?}): {message}")]
    SdkFailure { code: Option<i32>, message: String },

    #[error("No camera at index {0}")]
    NoCamera(usize),

    #[error(transparent)]
    Sdk(#[from] SdkError),
}

impl ConnectError {
    pub fn code(&self) -> Option<i32> {
        match self {
            ConnectError::DeviceBusy { code, .. } => Some(*code),
            ConnectError::SdkFailure { code, .. } => *code,
            _ => None,
        }
    }
}

impl From<NativeError> for ConnectError {
    fn from(err: NativeError) -> Self {
        match err {
            NativeError::Busy { code, message } => ConnectError::DeviceBusy { code, message },
            other => ConnectError::SdkFailure {
                code: other.code(),
                message: other.to_string(),
            },
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum CaptureError {
    #[error("Camera not connected")]
    NotConnected,

    #[error("Camera was removed")]
    Disconnected,

    #[error("Exposure timed out: {0}")]
    Timeout(String),

    #[error("Exposure failed: {0}")]
    ExposureFailed(String),

    #[error("Exposure aborted")]
    Aborted,

    #[error("SDK failure (code {code:?}): {message}")]
    Sdk { code: Option<i32>, message: String },

    #[error("Frame decode failed: {0}")]
    Decode(String),

    #[error("Capture loop is running")]
    LoopRunning,

    #[error("Connect failed: {0}")]
    Connect(#[from] ConnectError),
}

impl CaptureError {
    /// Vendor error code, if the failure carried one
    pub fn code(&self) -> Option<i32> {
        match self {
            CaptureError::Sdk { code, .. } => *code,
            CaptureError::Connect(e) => e.code(),
            _ => None,
        }
    }
}

impl From<NativeError> for CaptureError {
    fn from(err: NativeError) -> Self {
        match err {
            NativeError::NotConnected => CaptureError::NotConnected,
            NativeError::Disconnected => CaptureError::Disconnected,
            NativeError::ExposureAborted => CaptureError::Aborted,
            NativeError::ExposureFailed(msg) => CaptureError::ExposureFailed(msg),
            e @ (NativeError::ExposureTimeout { .. } | NativeError::Timeout(_)) => {
                CaptureError::Timeout(e.to_string())
            }
            other => CaptureError::Sdk {
                code: other.code(),
                message: other.to_string(),
            },
        }
    }
}

impl From<sentinel_imaging::ImagingError> for CaptureError {
    fn from(err: sentinel_imaging::ImagingError) -> Self {
        CaptureError::Decode(err.to_string())
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum CalibrationError {
    /// Soft failure: the caller continues with `best`
    #[error("Calibration did not converge after {attempts} attempts (best {best})")]
    NoConvergence { attempts: u32, best: ExposureEstimate },

    #[error("Calibration capture failed: {0}")]
    Capture(#[from] CaptureError),
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum StartError {
    #[error("Capture already running")]
    AlreadyRunning,

    #[error("SDK not initialized")]
    SdkNotInitialized,

    #[error("Invalid settings: {0}")]
    InvalidSettings(#[from] ConfigError),

    #[error("Failed to spawn capture thread: {0}")]
    Spawn(String),
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
    #[error("Invalid value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },

    #[error("Failed to apply settings: {0}")]
    Apply(#[from] ConnectError),

    #[error("Failed to load configuration: {0}")]
    Load(String),
}

impl ConfigError {
    pub fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        ConfigError::Invalid {
            field,
            reason: reason.into(),
        }
    }
}

/// Category reported through `CaptureObserver::on_error`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorKind {
    Sdk,
    Connect,
    Calibration,
    Capture,
    /// Fatal: the loop has stopped and needs an operator restart
    ReconnectExhausted,
    /// Fatal: the capture thread panicked and was torn down
    WorkerPanicked,
}

impl ErrorKind {
    pub fn is_fatal(self) -> bool {
        matches!(self, ErrorKind::ReconnectExhausted | ErrorKind::WorkerPanicked)
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::Sdk => "sdk",
            ErrorKind::Connect => "connect",
            ErrorKind::Calibration => "calibration",
            ErrorKind::Capture => "capture",
            ErrorKind::ReconnectExhausted => "reconnect_exhausted",
            ErrorKind::WorkerPanicked => "worker_panicked",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_busy_maps_to_device_busy() {
        let err: ConnectError = NativeError::Busy {
            code: 16,
            message: "in use".into(),
        }
        .into();
        assert!(matches!(err, ConnectError::DeviceBusy { code: 16, .. }));
        assert_eq!(err.code(), Some(16));
    }

    #[test]
    fn test_sdk_code_preserved() {
        let err: ConnectError = NativeError::Sdk {
            code: 2,
            message: "invalid id".into(),
        }
        .into();
        assert_eq!(err.code(), Some(2));

        let capture: CaptureError = NativeError::Sdk {
            code: 13,
            message: "buffer".into(),
        }
        .into();
        assert_eq!(capture.code(), Some(13));
    }

    #[test]
    fn test_native_to_capture_error() {
        assert_eq!(CaptureError::from(NativeError::Disconnected), CaptureError::Disconnected);
        assert_eq!(CaptureError::from(NativeError::ExposureAborted), CaptureError::Aborted);
        assert!(matches!(
            CaptureError::from(NativeError::Timeout("x".into())),
            CaptureError::Timeout(_)
        ));
    }

    #[test]
    fn test_library_errors() {
        assert_eq!(
            SdkError::from(NativeError::LibraryNotFound("/x".into())),
            SdkError::NotFound("/x".into())
        );
        assert!(matches!(
            SdkError::from(NativeError::LibraryLoad {
                path: "/x".into(),
                reason: "bad elf".into()
            }),
            SdkError::InitFailed(_)
        ));
    }

    #[test]
    fn test_fatal_kinds() {
        assert!(ErrorKind::ReconnectExhausted.is_fatal());
        assert!(ErrorKind::WorkerPanicked.is_fatal());
        assert!(!ErrorKind::Capture.is_fatal());
    }
}
