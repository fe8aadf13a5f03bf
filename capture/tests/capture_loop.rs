mod common;

use common::{controller, fast_options, wait_for, ManualClock, Recorder};
use sentinel_capture::{
    CameraSettings, CaptureController, CaptureError, CaptureObserver, CaptureState, ConfigError, ConnectionManager,
    ErrorKind, Frame, PartialSettings, ReconnectPolicy, ScheduleWindow, SdkContext, StartError, WhiteBalanceMode,
};
use sentinel_imaging::BrightnessAlgorithm;
use sentinel_native::{ControlType, SimulatedSdk};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

const WAIT: Duration = Duration::from_secs(10);

fn manual_exposure() -> CameraSettings {
    CameraSettings {
        auto_exposure: false,
        ..CameraSettings::default()
    }
}

#[test]
fn calibrates_before_first_frame() {
    let sdk = Arc::new(SimulatedSdk::default().with_response(|ms, _| ms * 0.08));
    let (controller, recorder) = controller(&sdk, fast_options());
    let settings = CameraSettings {
        exposure_ms: 1000.0,
        target_brightness: 100.0,
        max_exposure_ms: 5000.0,
        brightness_algorithm: BrightnessAlgorithm::Mean,
        ..CameraSettings::default()
    };

    controller.start(0, settings, ScheduleWindow::always()).unwrap();
    assert!(wait_for(WAIT, || recorder.frame_count() > 0));
    let exposures_before_first = sdk.exposure_count();
    controller.stop();

    let first = recorder.frames.lock().unwrap()[0].clone();
    assert!((first.brightness - 100.0).abs() <= 10.0, "brightness {}", first.brightness);
    assert!((first.exposure_ms - 1250.0).abs() < 20.0, "exposure {}", first.exposure_ms);
    assert!(exposures_before_first < 15);
    assert!(recorder.saw_state(CaptureState::Calibrating));
    assert!(recorder
        .frames
        .lock()
        .unwrap()
        .iter()
        .all(|f| f.exposure_ms <= 5000.0));
    assert!((controller.settings().exposure_ms - 1250.0).abs() < 20.0);
}

#[test]
fn calibration_stops_at_max_exposure() {
    // Too dark to ever reach the target
    let sdk = Arc::new(SimulatedSdk::default().with_response(|ms, _| ms * 0.001));
    let (controller, recorder) = controller(&sdk, fast_options());
    let settings = CameraSettings {
        exposure_ms: 500.0,
        max_exposure_ms: 2000.0,
        brightness_algorithm: BrightnessAlgorithm::Mean,
        ..CameraSettings::default()
    };

    controller.start(0, settings, ScheduleWindow::always()).unwrap();
    assert!(wait_for(WAIT, || recorder.frame_count() > 0));
    controller.stop();

    let first = recorder.frames.lock().unwrap()[0].clone();
    assert_eq!(first.exposure_ms, 2000.0);
    assert_eq!(recorder.errors_of(ErrorKind::Calibration), 0);
}

#[test]
fn persistent_failure_stops_loop_once() {
    let sdk = Arc::new(SimulatedSdk::default());
    sdk.fail_all_exposures(true);
    let (controller, recorder) = controller(&sdk, fast_options());

    controller.start(0, CameraSettings::default(), ScheduleWindow::always()).unwrap();
    assert!(wait_for(WAIT, || recorder.errors_of(ErrorKind::ReconnectExhausted) > 0));
    assert!(wait_for(WAIT, || !controller.is_capturing()));

    // The thread is gone: no further SDK traffic
    std::thread::sleep(Duration::from_millis(50));
    let calls = sdk.call_count();
    std::thread::sleep(Duration::from_millis(50));
    assert_eq!(sdk.call_count(), calls);

    assert_eq!(recorder.errors_of(ErrorKind::ReconnectExhausted), 1);
    assert_eq!(sdk.exposure_count(), 5);
    assert_eq!(controller.state(), CaptureState::Error);
    assert!(!controller.manager().is_connected());
    assert!(!sdk.is_open(0));
    assert_eq!(recorder.frame_count(), 0);
}

#[test]
fn successful_frame_resets_failure_count() {
    let sdk = Arc::new(SimulatedSdk::default());
    let (controller, recorder) = controller(&sdk, fast_options());
    controller.start(0, manual_exposure(), ScheduleWindow::always()).unwrap();
    assert!(wait_for(WAIT, || recorder.frame_count() > 0));

    sdk.fail_next_exposures(3);
    let seen = recorder.frame_count();
    assert!(wait_for(WAIT, || recorder.frame_count() > seen + 1));

    sdk.fail_next_exposures(4);
    let seen = recorder.frame_count();
    assert!(wait_for(WAIT, || recorder.frame_count() > seen + 1));

    assert!(controller.is_capturing());
    assert_eq!(recorder.errors_of(ErrorKind::ReconnectExhausted), 0);
    assert!(recorder.errors_of(ErrorKind::Capture) >= 7);
    controller.stop();
}

#[test]
fn recovers_after_replug() {
    let sdk = Arc::new(SimulatedSdk::default());
    let mut options = fast_options();
    options.reconnect = ReconnectPolicy {
        base_delay_ms: 20,
        max_delay_ms: 200,
        max_attempts: 5,
    };
    let (controller, recorder) = controller(&sdk, options);
    controller.start(0, manual_exposure(), ScheduleWindow::always()).unwrap();
    assert!(wait_for(WAIT, || recorder.frame_count() > 0));

    sdk.set_unplugged(true);
    assert!(wait_for(WAIT, || controller.state() == CaptureState::Error));
    sdk.set_unplugged(false);

    let seen = recorder.frame_count();
    assert!(wait_for(WAIT, || recorder.frame_count() > seen));
    assert!(controller.is_capturing());
    assert_eq!(recorder.errors_of(ErrorKind::ReconnectExhausted), 0);

    let session = recorder.frames.lock().unwrap()[0].session_id;
    assert_eq!(recorder.last_frame().unwrap().session_id, session);
    controller.stop();
}

#[test]
fn follows_schedule_window() {
    let sdk = Arc::new(SimulatedSdk::default());
    let clock = ManualClock::at(12, 0);
    let recorder = Arc::new(Recorder::default());
    let controller = CaptureController::new(common::manager(&sdk), recorder.clone(), fast_options())
        .with_clock(clock.clone());
    let window = ScheduleWindow::new(common::hm(22, 0), common::hm(6, 0));

    controller.start(0, manual_exposure(), window).unwrap();
    assert!(wait_for(WAIT, || controller.state() == CaptureState::OffPeakDisconnected));
    std::thread::sleep(Duration::from_millis(30));
    assert_eq!(sdk.open_count(), 0);
    assert_eq!(recorder.frame_count(), 0);

    clock.set(23, 0);
    assert!(wait_for(WAIT, || recorder.frame_count() > 0));

    clock.set(12, 0);
    assert!(wait_for(WAIT, || controller.state() == CaptureState::OffPeakDisconnected));
    assert!(wait_for(WAIT, || !sdk.is_open(0)));
    assert!(controller.is_capturing());
    assert!(!controller.manager().is_connected());

    let seen = recorder.frame_count();
    clock.set(23, 0);
    assert!(wait_for(WAIT, || recorder.frame_count() > seen));
    controller.stop();
}

#[test]
fn stop_disconnects_and_goes_idle() {
    let sdk = Arc::new(SimulatedSdk::default());
    let (controller, recorder) = controller(&sdk, fast_options());
    controller.start(0, manual_exposure(), ScheduleWindow::always()).unwrap();
    assert!(wait_for(WAIT, || recorder.frame_count() > 0));

    controller.stop();
    assert!(!controller.is_capturing());
    assert_eq!(controller.state(), CaptureState::Idle);
    assert!(!controller.manager().is_connected());
    assert!(!sdk.is_open(0));
    assert_eq!(
        recorder.statuses.lock().unwrap().last().map(|(s, _)| *s),
        Some(CaptureState::Idle)
    );

    // Stopping twice is harmless and a new session can start
    controller.stop();
    controller.start(0, manual_exposure(), ScheduleWindow::always()).unwrap();
    let seen = recorder.frame_count();
    assert!(wait_for(WAIT, || recorder.frame_count() > seen));
    controller.stop();
}

#[test]
fn configure_while_running_reaches_camera() {
    let sdk = Arc::new(SimulatedSdk::default());
    let (controller, recorder) = controller(&sdk, fast_options());
    controller.start(0, manual_exposure(), ScheduleWindow::always()).unwrap();
    assert!(wait_for(WAIT, || recorder.frame_count() > 0));

    let update = PartialSettings {
        gain: Some(300),
        ..PartialSettings::default()
    };
    controller.configure(update).unwrap();
    assert_eq!(controller.settings().gain, 300);
    assert!(wait_for(WAIT, || sdk.control_value(0, ControlType::Gain) == Some(300)));
    assert!(wait_for(WAIT, || recorder.last_frame().map(|f| f.gain) == Some(300)));

    let invalid = PartialSettings {
        exposure_ms: Some(-1.0),
        ..PartialSettings::default()
    };
    assert!(matches!(controller.configure(invalid), Err(ConfigError::Invalid { .. })));
    assert_eq!(controller.settings().gain, 300);
    controller.stop();
}

/// Host observer whose first `on_frame` panics
struct FailsOnFirstFrame {
    inner: Arc<Recorder>,
    armed: AtomicBool,
}

impl CaptureObserver for FailsOnFirstFrame {
    fn on_frame(&self, frame: Frame) {
        if self.armed.swap(false, Ordering::SeqCst) {
            panic!("host failed to store frame");
        }
        self.inner.on_frame(frame);
    }

    fn on_status(&self, state: CaptureState, message: &str) {
        self.inner.on_status(state, message);
    }

    fn on_error(&self, kind: ErrorKind, message: &str) {
        self.inner.on_error(kind, message);
    }
}

#[test]
fn observer_panic_leaves_controller_restartable() {
    let sdk = Arc::new(SimulatedSdk::default());
    let recorder = Arc::new(Recorder::default());
    let observer = Arc::new(FailsOnFirstFrame {
        inner: recorder.clone(),
        armed: AtomicBool::new(true),
    });
    let controller = CaptureController::new(common::manager(&sdk), observer, fast_options());

    controller.start(0, manual_exposure(), ScheduleWindow::always()).unwrap();
    assert!(wait_for(WAIT, || recorder.errors_of(ErrorKind::WorkerPanicked) > 0));
    assert!(wait_for(WAIT, || !controller.is_capturing()));
    assert_eq!(controller.state(), CaptureState::Error);
    assert!(wait_for(WAIT, || !sdk.is_open(0)));
    assert!(!controller.manager().is_connected());
    assert_eq!(recorder.frame_count(), 0);
    let (kind, message) = recorder.errors.lock().unwrap()[0].clone();
    assert_eq!(kind, ErrorKind::WorkerPanicked);
    assert!(message.contains("host failed to store frame"), "{}", message);

    controller.start(0, manual_exposure(), ScheduleWindow::always()).unwrap();
    assert!(wait_for(WAIT, || recorder.frame_count() > 0));
    assert!(controller.is_capturing());
    controller.stop();
    assert_eq!(controller.state(), CaptureState::Idle);
}

/// Host observer that holds the loop inside `on_frame` until released
struct SlowHost {
    inner: Arc<Recorder>,
    entered: AtomicBool,
    release: AtomicBool,
}

impl CaptureObserver for SlowHost {
    fn on_frame(&self, frame: Frame) {
        self.entered.store(true, Ordering::SeqCst);
        while !self.release.load(Ordering::SeqCst) {
            std::thread::sleep(Duration::from_millis(1));
        }
        self.inner.on_frame(frame);
    }

    fn on_status(&self, state: CaptureState, message: &str) {
        self.inner.on_status(state, message);
    }
}

#[test]
fn unconfirmed_stop_leaves_camera_with_loop() {
    let sdk = Arc::new(SimulatedSdk::default());
    let recorder = Arc::new(Recorder::default());
    let host = Arc::new(SlowHost {
        inner: recorder.clone(),
        entered: AtomicBool::new(false),
        release: AtomicBool::new(false),
    });
    let mut options = fast_options();
    options.stop_timeout_ms = 50;
    let controller = CaptureController::new(common::manager(&sdk), host.clone(), options);

    controller.start(0, manual_exposure(), ScheduleWindow::always()).unwrap();
    assert!(wait_for(WAIT, || host.entered.load(Ordering::SeqCst)));

    assert!(!controller.stop());
    assert!(!controller.is_capturing());
    assert!(sdk.is_open(0));
    assert_eq!(
        controller.start(0, manual_exposure(), ScheduleWindow::always()),
        Err(StartError::AlreadyRunning)
    );

    host.release.store(true, Ordering::SeqCst);
    assert!(wait_for(WAIT, || !sdk.is_open(0)));
    assert!(controller.stop());
    assert_eq!(sdk.close_count(), 1);

    controller.start(0, manual_exposure(), ScheduleWindow::always()).unwrap();
    assert!(wait_for(WAIT, || recorder.frame_count() > 1));
    assert!(controller.stop());
}

#[test]
fn huge_exposure_is_rejected_without_panicking() {
    let sdk = Arc::new(SimulatedSdk::default());
    let (controller, recorder) = controller(&sdk, fast_options());
    let huge = CameraSettings {
        exposure_ms: 1e30,
        ..manual_exposure()
    };
    assert!(matches!(
        controller.start(0, huge, ScheduleWindow::always()),
        Err(StartError::InvalidSettings(ConfigError::Invalid { field: "exposure_ms", .. }))
    ));
    assert!(!controller.is_capturing());

    controller.start(0, manual_exposure(), ScheduleWindow::always()).unwrap();
    assert!(wait_for(WAIT, || recorder.frame_count() > 0));
    for update in [
        PartialSettings {
            exposure_ms: Some(1e30),
            ..PartialSettings::default()
        },
        PartialSettings {
            max_exposure_ms: Some(1e30),
            ..PartialSettings::default()
        },
    ] {
        assert!(matches!(controller.configure(update), Err(ConfigError::Invalid { .. })));
    }

    let seen = recorder.frame_count();
    assert!(wait_for(WAIT, || recorder.frame_count() > seen + 1));
    assert!(controller.is_capturing());
    assert_eq!(controller.state(), CaptureState::Capturing);
    assert_eq!(controller.settings().exposure_ms, 100.0);
    assert_eq!(recorder.errors_of(ErrorKind::WorkerPanicked), 0);
    controller.stop();
}

#[test]
fn gray_world_balances_delivered_frames() {
    let sdk = Arc::new(SimulatedSdk::default());
    let (controller, recorder) = controller(&sdk, fast_options());
    let settings = CameraSettings {
        white_balance: WhiteBalanceMode::GrayWorld,
        ..manual_exposure()
    };

    controller.start(0, settings, ScheduleWindow::always()).unwrap();
    assert!(wait_for(WAIT, || recorder.frame_count() > 0));
    assert_eq!(sdk.control_value(0, ControlType::WhiteBalanceRed), Some(50));
    assert_eq!(sdk.control_value(0, ControlType::WhiteBalanceBlue), Some(50));
    assert!(recorder.last_frame().unwrap().white_balance_gains.is_some());

    controller
        .configure(PartialSettings {
            white_balance: Some(WhiteBalanceMode::Manual),
            ..PartialSettings::default()
        })
        .unwrap();
    assert!(wait_for(WAIT, || sdk.control_value(0, ControlType::WhiteBalanceRed) == Some(75)));
    let seen = recorder.frame_count();
    assert!(wait_for(WAIT, || recorder.frame_count() > seen + 1));
    assert_eq!(recorder.last_frame().unwrap().white_balance_gains, None);
    controller.stop();
}

#[test]
fn start_rejections() {
    let sdk = Arc::new(SimulatedSdk::default());
    let (controller, recorder) = controller(&sdk, fast_options());

    let bad = CameraSettings {
        target_brightness: 0.0,
        ..CameraSettings::default()
    };
    assert!(matches!(
        controller.start(0, bad, ScheduleWindow::always()),
        Err(StartError::InvalidSettings(_))
    ));

    controller.start(0, manual_exposure(), ScheduleWindow::always()).unwrap();
    assert_eq!(
        controller.start(0, manual_exposure(), ScheduleWindow::always()),
        Err(StartError::AlreadyRunning)
    );
    assert!(wait_for(WAIT, || recorder.frame_count() > 0));
    controller.stop();

    let uninitialized = Arc::new(ConnectionManager::new(Arc::new(SdkContext::with_sdk(sdk.clone()))));
    let idle = CaptureController::new(uninitialized, Arc::new(Recorder::default()), fast_options());
    assert_eq!(
        idle.start(0, manual_exposure(), ScheduleWindow::always()),
        Err(StartError::SdkNotInitialized)
    );
}

#[test]
fn single_capture_outside_loop() {
    let sdk = Arc::new(SimulatedSdk::default());
    let (controller, recorder) = controller(&sdk, fast_options());

    let frame = controller.capture_single(0, &manual_exposure()).unwrap();
    assert_eq!(frame.metadata.frame_number, 1);
    assert_eq!(frame.metadata.temperature_c, Some(21.5));
    assert_eq!(frame.image.dimensions(), (64, 48));
    assert!(!controller.manager().is_connected());
    assert!(!sdk.is_open(0));

    controller.start(0, manual_exposure(), ScheduleWindow::always()).unwrap();
    assert!(wait_for(WAIT, || recorder.frame_count() > 0));
    assert_eq!(
        controller.capture_single(0, &manual_exposure()).unwrap_err(),
        CaptureError::LoopRunning
    );
    controller.stop();
}
