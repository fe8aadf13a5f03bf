//! Shared fixtures for the capture integration tests

#![allow(dead_code)]

use chrono::NaiveTime;
use sentinel_capture::{
    CaptureController, CaptureObserver, CaptureOptions, CaptureState, Clock, ConnectionManager, ErrorKind, Frame,
    FrameMetadata, ReconnectPolicy, SdkContext,
};
use sentinel_native::{NativeTimeoutConfig, SimulatedSdk};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Records every callback
#[derive(Default)]
pub struct Recorder {
    pub frames: Mutex<Vec<FrameMetadata>>,
    pub statuses: Mutex<Vec<(CaptureState, String)>>,
    pub errors: Mutex<Vec<(ErrorKind, String)>>,
}

impl Recorder {
    pub fn frame_count(&self) -> usize {
        self.frames.lock().unwrap().len()
    }

    pub fn last_frame(&self) -> Option<FrameMetadata> {
        self.frames.lock().unwrap().last().cloned()
    }

    pub fn errors_of(&self, kind: ErrorKind) -> usize {
        self.errors.lock().unwrap().iter().filter(|(k, _)| *k == kind).count()
    }

    pub fn saw_state(&self, state: CaptureState) -> bool {
        self.statuses.lock().unwrap().iter().any(|(s, _)| *s == state)
    }
}

impl CaptureObserver for Recorder {
    fn on_frame(&self, frame: Frame) {
        self.frames.lock().unwrap().push(frame.metadata);
    }

    fn on_status(&self, state: CaptureState, message: &str) {
        self.statuses.lock().unwrap().push((state, message.to_string()));
    }

    fn on_error(&self, kind: ErrorKind, message: &str) {
        self.errors.lock().unwrap().push((kind, message.to_string()));
    }
}

/// Wall clock the test moves by hand
pub struct ManualClock(Mutex<NaiveTime>);

impl ManualClock {
    pub fn at(h: u32, m: u32) -> Arc<Self> {
        Arc::new(Self(Mutex::new(hm(h, m))))
    }

    pub fn set(&self, h: u32, m: u32) {
        *self.0.lock().unwrap() = hm(h, m);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> NaiveTime {
        *self.0.lock().unwrap()
    }
}

pub fn hm(h: u32, m: u32) -> NaiveTime {
    NaiveTime::from_hms_opt(h, m, 0).unwrap()
}

pub fn manager(sdk: &Arc<SimulatedSdk>) -> Arc<ConnectionManager> {
    let manager = ConnectionManager::new(Arc::new(SdkContext::with_sdk(sdk.clone())))
        .with_timeouts(NativeTimeoutConfig::strict())
        .with_settle_delay(Duration::from_millis(1));
    manager.initialize_sdk("").unwrap();
    Arc::new(manager)
}

pub fn fast_options() -> CaptureOptions {
    CaptureOptions {
        interval_ms: 5,
        calibration_attempts: 15,
        reconnect: ReconnectPolicy {
            base_delay_ms: 1,
            max_delay_ms: 4,
            max_attempts: 5,
        },
        stop_timeout_ms: 15_000,
    }
}

pub fn controller(sdk: &Arc<SimulatedSdk>, options: CaptureOptions) -> (CaptureController, Arc<Recorder>) {
    let recorder = Arc::new(Recorder::default());
    let controller = CaptureController::new(manager(sdk), recorder.clone(), options);
    (controller, recorder)
}

/// Poll `condition` until it holds or `timeout` passes
pub fn wait_for(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(2));
    }
    condition()
}
