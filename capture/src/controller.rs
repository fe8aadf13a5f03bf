//! Capture loop
//!
//! `CaptureController` is the inbound API (`start`, `stop`, `configure`). The
//! loop itself runs on one named worker thread per session and is the only
//! code that drives exposures. It moves through phases:
//!
//! ```text
//! Connect -> Calibrate -> Capture <-> OffPeak
//!               ^            |
//!               +-- Recover <+  (bounded reconnect with backoff)
//! ```
//!
//! Whatever phase the loop leaves from, the camera is disconnected before the
//! thread exits.

use crate::backoff::{Backoff, ReconnectAttemptCounter};
use crate::calibration::ExposureCalibrator;
use crate::config::CaptureOptions;
use crate::connection::ConnectionManager;
use crate::error::{CalibrationError, CaptureError, ConfigError, ErrorKind, StartError};
use crate::frame::{develop, ExposureRecord, Frame, FrameBuilder};
use crate::observer::{CaptureObserver, CaptureState};
use crate::schedule::{Clock, ScheduleWindow, SystemClock};
use crate::settings::{CameraSettings, PartialSettings};
use sentinel_imaging::BayerPattern;
use sentinel_native::utils::CleanupGuard;
use sentinel_native::CameraInfo;
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError, TryRecvError};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::{self, JoinHandle, ThreadId};
use std::time::Duration;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

// =============================================================================
// SHARED STATE
// =============================================================================

/// State shared between the controller and its worker thread
struct Shared {
    running: AtomicBool,
    stop_requested: Mutex<bool>,
    wake: Condvar,
    state: Mutex<CaptureState>,
    settings: Mutex<CameraSettings>,
    pending: Mutex<PartialSettings>,
}

impl Shared {
    fn new() -> Self {
        Self {
            running: AtomicBool::new(false),
            stop_requested: Mutex::new(false),
            wake: Condvar::new(),
            state: Mutex::new(CaptureState::Idle),
            settings: Mutex::new(CameraSettings::default()),
            pending: Mutex::new(PartialSettings::default()),
        }
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    fn request_stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        *lock(&self.stop_requested) = true;
        self.wake.notify_all();
    }

    /// Sleep for `duration` unless a stop is requested first. Returns true if stopped.
    fn sleep(&self, duration: Duration) -> bool {
        let guard = lock(&self.stop_requested);
        let (guard, _) = self
            .wake
            .wait_timeout_while(guard, duration, |stopped| !*stopped)
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *guard
    }
}

struct Worker {
    thread: JoinHandle<()>,
    done: mpsc::Receiver<()>,
    id: ThreadId,
}

/// Signals the controller when the worker exits, including by panic
struct DoneSignal(mpsc::Sender<()>);

impl Drop for DoneSignal {
    fn drop(&mut self) {
        let _ = self.0.send(());
    }
}

// =============================================================================
// CONTROLLER
// =============================================================================

pub struct CaptureController {
    manager: Arc<ConnectionManager>,
    observer: Arc<dyn CaptureObserver>,
    options: CaptureOptions,
    clock: Arc<dyn Clock>,
    shared: Arc<Shared>,
    worker: Mutex<Option<Worker>>,
}

impl CaptureController {
    pub fn new(
        manager: Arc<ConnectionManager>,
        observer: Arc<dyn CaptureObserver>,
        options: CaptureOptions,
    ) -> Self {
        Self {
            manager,
            observer,
            options,
            clock: Arc::new(SystemClock),
            shared: Arc::new(Shared::new()),
            worker: Mutex::new(None),
        }
    }

    /// Replace the wall clock used for schedule checks
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn manager(&self) -> &Arc<ConnectionManager> {
        &self.manager
    }

    pub fn is_capturing(&self) -> bool {
        self.shared.is_running()
    }

    pub fn state(&self) -> CaptureState {
        *lock(&self.shared.state)
    }

    /// Latest settings, including auto-exposure changes made by the loop
    pub fn settings(&self) -> CameraSettings {
        lock(&self.shared.settings).clone()
    }

    pub fn start(&self, camera_index: usize, settings: CameraSettings, schedule: ScheduleWindow) -> Result<(), StartError> {
        settings.validate()?;

        let mut worker = lock(&self.worker);
        if self.shared.is_running() {
            return Err(StartError::AlreadyRunning);
        }
        if let Some(previous) = worker.take() {
            match previous.done.try_recv() {
                Ok(()) | Err(TryRecvError::Disconnected) => {
                    let _ = previous.thread.join();
                }
                Err(TryRecvError::Empty) => {
                    // A previous stop was not confirmed and the thread is still exiting
                    *worker = Some(previous);
                    return Err(StartError::AlreadyRunning);
                }
            }
        }
        if !self.manager.is_sdk_initialized() {
            return Err(StartError::SdkNotInitialized);
        }

        *lock(&self.shared.stop_requested) = false;
        *lock(&self.shared.settings) = settings.clone();
        *lock(&self.shared.pending) = PartialSettings::default();
        self.shared.running.store(true, Ordering::SeqCst);

        let (done_tx, done_rx) = mpsc::channel();
        let shared = Arc::clone(&self.shared);
        let observer = Arc::clone(&self.observer);
        let capture_loop = CaptureLoop {
            calibrator: ExposureCalibrator::from_settings(&settings),
            counter: ReconnectAttemptCounter::new(self.options.reconnect),
            frames: FrameBuilder::new(String::new()),
            manager: Arc::clone(&self.manager),
            observer: Arc::clone(&self.observer),
            shared: Arc::clone(&self.shared),
            clock: Arc::clone(&self.clock),
            options: self.options.clone(),
            schedule,
            settings,
            index: camera_index,
            camera: None,
        };

        tracing::info!("Starting capture on camera {} (schedule {})", camera_index, schedule);
        let spawned = thread::Builder::new()
            .name("sentinel-capture".to_string())
            .spawn(move || {
                let _done = DoneSignal(done_tx);
                // The loop's own guard has disconnected by the time this returns
                if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| capture_loop.run())) {
                    worker_panicked(&shared, observer.as_ref(), payload.as_ref());
                }
            });

        match spawned {
            Ok(thread) => {
                let id = thread.thread().id();
                *worker = Some(Worker {
                    thread,
                    done: done_rx,
                    id,
                });
                Ok(())
            }
            Err(e) => {
                self.shared.running.store(false, Ordering::SeqCst);
                Err(StartError::Spawn(e.to_string()))
            }
        }
    }

    /// Request the loop to stop and wait for it to exit.
    ///
    /// Waits up to the configured stop timeout. Returns false when the thread
    /// is still alive afterwards; it keeps the camera until it finishes, and
    /// `start` refuses until then.
    pub fn stop(&self) -> bool {
        if self.shared.is_running() {
            self.set_state(CaptureState::Stopping, "Stopping capture");
        }
        self.shared.request_stop();

        let mut slot = lock(&self.worker);
        let Some(worker) = slot.take() else {
            return true;
        };

        if worker.id == thread::current().id() {
            // Called from an observer callback; the loop exits on its own
            *slot = Some(worker);
            return false;
        }
        drop(slot);

        self.manager.abort_exposure();

        let timeout = self.options.stop_timeout();
        match worker.done.recv_timeout(timeout) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                if worker.thread.join().is_err() {
                    tracing::error!("Capture thread panicked");
                }
                tracing::info!("Capture stopped");
                true
            }
            Err(RecvTimeoutError::Timeout) => {
                tracing::warn!("Capture thread stop not confirmed after {:?}", timeout);
                *lock(&self.worker) = Some(worker);
                false
            }
        }
    }

    /// Change settings while capturing.
    ///
    /// The update is validated immediately. Camera-side values are written by
    /// the loop before its next exposure; when idle the update only changes
    /// the stored snapshot.
    pub fn configure(&self, partial: PartialSettings) -> Result<(), ConfigError> {
        let mut current = lock(&self.shared.settings);
        let next = current.merged(&partial)?;
        if self.shared.is_running() {
            lock(&self.shared.pending).merge(partial);
            tracing::debug!("Queued settings update for the capture loop");
        }
        *current = next;
        Ok(())
    }

    /// One synchronous connect, expose, decode and disconnect cycle.
    /// Refused while the loop owns the camera.
    pub fn capture_single(&self, camera_index: usize, settings: &CameraSettings) -> Result<Frame, CaptureError> {
        if self.shared.is_running() {
            return Err(CaptureError::LoopRunning);
        }

        let info = self.manager.connect(camera_index, settings)?;
        let manager = Arc::clone(&self.manager);
        let _cleanup = CleanupGuard::new(move || manager.disconnect());

        let pattern = color_pattern(&info, settings.bayer_pattern);
        let raw = self.manager.expose(settings.exposure())?;
        let (image, white_balance_gains) = develop(&raw, pattern, settings)?;
        let m = ExposureCalibrator::from_settings(settings).measure(&image);
        let record = ExposureRecord {
            exposure: settings.exposure(),
            gain: settings.gain,
            temperature_c: self.manager.temperature(),
            brightness: m.brightness,
            clipped_fraction: m.clipped_fraction,
            exposure_adjusted: false,
            white_balance_gains,
        };
        Ok(FrameBuilder::new(info.name).build(&raw, pattern, image, record))
    }

    fn set_state(&self, state: CaptureState, message: &str) {
        *lock(&self.shared.state) = state;
        self.observer.on_status(state, message);
    }
}

impl Drop for CaptureController {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Leave the controller restartable after the loop panicked
fn worker_panicked(shared: &Shared, observer: &dyn CaptureObserver, payload: &(dyn Any + Send)) {
    shared.running.store(false, Ordering::SeqCst);
    *lock(&shared.state) = CaptureState::Error;

    let reason = payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string());
    let message = format!("Capture thread panicked: {}; restart required", reason);
    tracing::error!("{}", message);

    let notified = panic::catch_unwind(AssertUnwindSafe(|| {
        observer.on_status(CaptureState::Error, &message);
        observer.on_error(ErrorKind::WorkerPanicked, &message);
    }));
    if notified.is_err() {
        tracing::error!("Observer panicked while reporting the capture thread panic");
    }
}

/// Settings pattern for color sensors, `None` for mono
fn color_pattern(info: &CameraInfo, configured: BayerPattern) -> Option<BayerPattern> {
    info.is_color.then_some(configured)
}

// =============================================================================
// LOOP
// =============================================================================

enum Phase {
    Connect,
    Calibrate,
    Capture,
    OffPeak,
    Recover(CaptureError),
    Fatal { attempts: u32, last: CaptureError },
}

struct CaptureLoop {
    manager: Arc<ConnectionManager>,
    observer: Arc<dyn CaptureObserver>,
    shared: Arc<Shared>,
    clock: Arc<dyn Clock>,
    options: CaptureOptions,
    schedule: ScheduleWindow,
    settings: CameraSettings,
    index: usize,
    camera: Option<CameraInfo>,
    calibrator: ExposureCalibrator,
    counter: ReconnectAttemptCounter,
    frames: FrameBuilder,
}

impl CaptureLoop {
    fn run(mut self) {
        let mut fatal = false;
        {
            let manager = Arc::clone(&self.manager);
            let _cleanup = CleanupGuard::new(move || manager.disconnect());

            let mut phase = Phase::Connect;
            while self.shared.is_running() {
                phase = match phase {
                    Phase::Connect => self.connect(),
                    Phase::Calibrate => self.calibrate(),
                    Phase::Capture => self.capture(),
                    Phase::OffPeak => self.off_peak(),
                    Phase::Recover(err) => self.recover(err),
                    Phase::Fatal { attempts, last } => {
                        self.fatal(attempts, &last);
                        fatal = true;
                        break;
                    }
                };
            }
        }

        self.shared.running.store(false, Ordering::SeqCst);
        if !fatal {
            self.set_state(CaptureState::Idle, "Capture stopped");
        }
        tracing::debug!("Capture thread exiting after {} frames", self.frames.frame_count());
    }

    fn set_state(&self, state: CaptureState, message: &str) {
        let changed = {
            let mut current = lock(&self.shared.state);
            let changed = *current != state;
            *current = state;
            changed
        };
        if changed {
            tracing::info!("Capture state -> {}: {}", state, message);
        } else {
            tracing::debug!("{}", message);
        }
        self.observer.on_status(state, message);
    }

    fn report_error(&self, kind: ErrorKind, message: &str) {
        tracing::warn!("{} error: {}", kind, message);
        self.observer.on_error(kind, message);
    }

    fn in_window(&self) -> bool {
        self.schedule.contains(self.clock.now())
    }

    fn after_connect(&mut self, info: CameraInfo) -> Phase {
        self.frames.set_camera_name(info.name.clone());
        self.camera = Some(info);
        if self.settings.auto_exposure {
            Phase::Calibrate
        } else {
            Phase::Capture
        }
    }

    /// Index to reconnect with; USB re-enumeration can reorder cameras
    fn resolve_index(&mut self) -> usize {
        let Some(name) = self.camera.as_ref().map(|c| c.name.clone()) else {
            return self.index;
        };
        match self.manager.find_camera_by_name(&name) {
            Ok(Some(index)) => {
                if index != self.index {
                    tracing::info!("{} moved from index {} to {}", name, self.index, index);
                    self.index = index;
                }
            }
            Ok(None) => tracing::warn!("{} not found, retrying index {}", name, self.index),
            Err(e) => tracing::warn!("Camera lookup failed: {}", e),
        }
        self.index
    }

    fn connect(&mut self) -> Phase {
        if !self.in_window() {
            self.set_state(
                CaptureState::OffPeakDisconnected,
                &format!("Outside capture window {}, waiting", self.schedule),
            );
            return Phase::OffPeak;
        }

        self.set_state(CaptureState::Connecting, &format!("Connecting to camera {}", self.index));
        match self.manager.connect(self.index, &self.settings) {
            Ok(info) => self.after_connect(info),
            Err(e) => {
                self.report_error(ErrorKind::Connect, &format_error(&e.to_string(), e.code()));
                Phase::Recover(CaptureError::Connect(e))
            }
        }
    }

    fn calibrate(&mut self) -> Phase {
        self.set_state(
            CaptureState::Calibrating,
            &format!("Calibrating exposure toward brightness {:.0}", self.settings.target_brightness),
        );

        self.calibrator = ExposureCalibrator::from_settings(&self.settings);
        let manager = Arc::clone(&self.manager);
        let shared = Arc::clone(&self.shared);
        let pattern = self.pattern();
        let settings = &self.settings;
        let result = self
            .calibrator
            .run_calibration(self.options.calibration_attempts, |exposure| {
                if !shared.is_running() {
                    return Err(CaptureError::Aborted);
                }
                let raw = manager.expose(exposure)?;
                develop(&raw, pattern, settings).map(|(image, _)| image)
            });

        match result {
            Ok(estimate) => {
                self.settings.set_exposure(estimate.exposure);
                self.publish_settings();
                self.set_state(CaptureState::Capturing, &format!("Calibrated: {}", estimate));
                Phase::Capture
            }
            Err(CalibrationError::NoConvergence { attempts, best }) => {
                self.settings.set_exposure(best.exposure);
                self.publish_settings();
                self.set_state(
                    CaptureState::Capturing,
                    &format!("Calibration did not converge in {} frames, continuing with {}", attempts, best),
                );
                Phase::Capture
            }
            Err(CalibrationError::Capture(e)) => {
                if !self.shared.is_running() {
                    return Phase::Capture;
                }
                self.report_error(ErrorKind::Calibration, &format_error(&e.to_string(), e.code()));
                Phase::Recover(e)
            }
        }
    }

    fn capture(&mut self) -> Phase {
        self.apply_pending();

        if !self.in_window() {
            self.set_state(
                CaptureState::OffPeakDisconnected,
                &format!("Outside capture window {}, disconnecting", self.schedule),
            );
            self.manager.disconnect();
            return Phase::OffPeak;
        }

        if *lock(&self.shared.state) != CaptureState::Capturing {
            self.set_state(CaptureState::Capturing, "Capturing");
        }

        match self.capture_frame() {
            Ok(frame) => {
                self.counter.reset();
                self.observer.on_frame(frame);
                self.shared.sleep(self.options.interval());
                Phase::Capture
            }
            Err(_) if !self.shared.is_running() => Phase::Capture,
            Err(e) => {
                self.report_error(ErrorKind::Capture, &format_error(&e.to_string(), e.code()));
                Phase::Recover(e)
            }
        }
    }

    fn capture_frame(&mut self) -> Result<Frame, CaptureError> {
        let exposure = self.settings.exposure();
        let raw = self.manager.expose(exposure)?;
        let pattern = self.pattern();
        let (image, white_balance_gains) = develop(&raw, pattern, &self.settings)?;

        let (brightness, clipped_fraction, adjusted) = if self.settings.auto_exposure {
            self.calibrator.set_exposure(exposure);
            let delta = self.calibrator.adjust_exposure_auto(&image);
            if delta.changed() {
                self.settings.set_exposure(delta.proposed);
                self.publish_settings();
            }
            (delta.brightness, delta.clipped_fraction, delta.changed())
        } else {
            let m = self.calibrator.measure(&image);
            (m.brightness, m.clipped_fraction, false)
        };

        let record = ExposureRecord {
            exposure,
            gain: self.settings.gain,
            temperature_c: self.manager.temperature(),
            brightness,
            clipped_fraction,
            exposure_adjusted: adjusted,
            white_balance_gains,
        };
        Ok(self.frames.build(&raw, pattern, image, record))
    }

    fn off_peak(&mut self) -> Phase {
        if !self.in_window() {
            self.shared.sleep(self.options.interval());
            return Phase::OffPeak;
        }

        self.set_state(CaptureState::Connecting, "Entered capture window, reconnecting");
        let index = self.resolve_index();
        match self.manager.reconnect(index, &self.settings) {
            Ok(info) => self.after_connect(info),
            Err(e) => {
                self.report_error(ErrorKind::Connect, &format_error(&e.to_string(), e.code()));
                Phase::Recover(CaptureError::Connect(e))
            }
        }
    }

    fn recover(&mut self, err: CaptureError) -> Phase {
        let (attempt, delay) = match self.counter.record_failure() {
            Backoff::Exhausted { attempts } => return Phase::Fatal { attempts, last: err },
            Backoff::Retry { attempt, delay } => (attempt, delay),
        };

        self.set_state(
            CaptureState::Error,
            &format!(
                "{}; reconnect attempt {}/{} in {:.1}s",
                format_error(&err.to_string(), err.code()),
                attempt,
                self.counter.policy().max_attempts - 1,
                delay.as_secs_f64()
            ),
        );
        if self.shared.sleep(delay) {
            return Phase::Capture;
        }

        let index = self.resolve_index();
        match self.manager.reconnect(index, &self.settings) {
            Ok(info) => {
                self.set_state(CaptureState::Capturing, &format!("Reconnected to {}", info.name));
                self.frames.set_camera_name(info.name.clone());
                self.camera = Some(info);
                Phase::Capture
            }
            Err(e) => {
                self.report_error(ErrorKind::Connect, &format_error(&e.to_string(), e.code()));
                Phase::Recover(CaptureError::Connect(e))
            }
        }
    }

    fn fatal(&mut self, attempts: u32, last: &CaptureError) {
        self.manager.disconnect();
        self.shared.running.store(false, Ordering::SeqCst);
        let message = format!(
            "Giving up after {} consecutive failures; restart required. Last error: {}",
            attempts,
            format_error(&last.to_string(), last.code())
        );
        *lock(&self.shared.state) = CaptureState::Error;
        tracing::error!("{}", message);
        self.observer.on_status(CaptureState::Error, &message);
        self.observer.on_error(ErrorKind::ReconnectExhausted, &message);
    }

    /// Write queued `configure` updates to the loop settings and the camera
    fn apply_pending(&mut self) {
        let pending = std::mem::take(&mut *lock(&self.shared.pending));
        if pending.is_empty() {
            return;
        }
        let next = match self.settings.merged(&pending) {
            Ok(next) => next,
            Err(e) => {
                tracing::warn!("Dropping settings update: {}", e);
                return;
            }
        };
        let camera_side = !pending.is_processing_only();
        self.settings = next;
        let current = self.calibrator.exposure();
        self.calibrator = ExposureCalibrator::from_settings(&self.settings);
        if pending.exposure_ms.is_none() {
            self.calibrator.set_exposure(current);
        }

        if camera_side {
            if let Err(e) = self.manager.configure(&self.settings) {
                self.report_error(ErrorKind::Connect, &format_error(&e.to_string(), e.code()));
            }
        }
        tracing::info!("Applied settings update");
    }

    fn publish_settings(&self) {
        *lock(&self.shared.settings) = self.settings.clone();
    }

    fn pattern(&self) -> Option<BayerPattern> {
        match &self.camera {
            Some(info) => color_pattern(info, self.settings.bayer_pattern),
            None => Some(self.settings.bayer_pattern),
        }
    }
}

fn format_error(message: &str, code: Option<i32>) -> String {
    match code {
        Some(code) => format!("{} (SDK code {})", message, code),
        None => message.to_string(),
    }
}
