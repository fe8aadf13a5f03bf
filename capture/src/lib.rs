//! Sentinel capture core
//!
//! Camera lifecycle and auto-exposure for unattended all-sky capture:
//! - `connection`: SDK context use, enumeration, connect/disconnect/reconnect
//! - `calibration`: pre-capture exposure search and per-frame trim
//! - `controller`: the capture loop state machine and its inbound API
//! - `schedule`, `backoff`, `settings`, `config`: the policies it runs on
//!
//! Frames, state changes and errors leave through [`CaptureObserver`].

pub mod backoff;
pub mod calibration;
pub mod config;
pub mod connection;
pub mod controller;
pub mod error;
pub mod frame;
pub mod observer;
pub mod schedule;
pub mod sdk;
pub mod settings;

pub use backoff::{Backoff, ReconnectAttemptCounter, ReconnectPolicy};
pub use calibration::{AdjustReason, ExposureCalibrator, ExposureDelta, ExposureEstimate};
pub use config::{CaptureOptions, ConnectionOptions, SentinelConfig};
pub use connection::{CameraHandle, ConnectionManager};
pub use controller::CaptureController;
pub use error::{CalibrationError, CaptureError, ConfigError, ConnectError, ErrorKind, SdkError, StartError};
pub use frame::{develop, Frame, FrameMetadata};
pub use observer::{CaptureObserver, CaptureState};
pub use schedule::{in_schedule_window, Clock, ScheduleWindow, SystemClock};
pub use sdk::SdkContext;
pub use settings::{CameraSettings, FlipMode, PartialSettings, WhiteBalanceMode, MAX_EXPOSURE, MIN_EXPOSURE};
