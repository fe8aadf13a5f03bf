//! Outbound callbacks from the capture loop

use crate::error::ErrorKind;
use crate::frame::Frame;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Capture loop state. Only the loop changes it; everyone else observes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum CaptureState {
    #[default]
    Idle,
    Connecting,
    Calibrating,
    Capturing,
    /// Outside the schedule window with the camera released
    OffPeakDisconnected,
    /// Recovering from a failure, or stopped after a fatal one
    Error,
    Stopping,
}

impl fmt::Display for CaptureState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CaptureState::Idle => "idle",
            CaptureState::Connecting => "connecting",
            CaptureState::Calibrating => "calibrating",
            CaptureState::Capturing => "capturing",
            CaptureState::OffPeakDisconnected => "off-peak",
            CaptureState::Error => "error",
            CaptureState::Stopping => "stopping",
        };
        f.write_str(name)
    }
}

/// Receiver for frames, state changes and errors.
///
/// Called on the capture thread, in capture order. Implementations should
/// return quickly; slow work belongs on another thread.
pub trait CaptureObserver: Send + Sync {
    fn on_frame(&self, frame: Frame);

    fn on_status(&self, _state: CaptureState, _message: &str) {}

    fn on_error(&self, _kind: ErrorKind, _message: &str) {}
}
