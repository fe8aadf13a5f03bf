//! Connection manager
//!
//! Owns at most one open camera. Connect and disconnect are serialized by the
//! handle mutex so a shutdown, an external stop and the capture loop's own
//! recovery path can all call `disconnect` without double-closing the device.
//!
//! Long-running calls (exposure waits) operate on a cloned `Arc<CameraHandle>`
//! and never hold the mutex.

use crate::error::{CaptureError, ConnectError, SdkError};
use crate::sdk::SdkContext;
use crate::settings::{CameraSettings, WhiteBalanceMode};
use sentinel_native::utils::{wait_for_exposure, CleanupGuard};
use sentinel_native::{
    CameraInfo, CameraSdk, ControlType, ImageType, NativeError, NativeTimeoutConfig, RawFrame, RoiFormat,
};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

/// USB bandwidth share requested on connect
const BANDWIDTH_OVERLOAD: i64 = 40;

/// Camera red/blue WB when software gray world does the balancing
const NEUTRAL_WB: i64 = 50;

/// Values written back on disconnect so the next application finds a neutral camera
const FACTORY_DEFAULTS: [(ControlType, i64); 9] = [
    (ControlType::Gain, 0),
    (ControlType::Exposure, 100_000),
    (ControlType::WhiteBalanceRed, 52),
    (ControlType::WhiteBalanceBlue, 95),
    (ControlType::Offset, 50),
    (ControlType::Flip, 0),
    (ControlType::AutoMaxGain, 0),
    (ControlType::AutoMaxExposure, 0),
    (ControlType::AutoTargetBrightness, 100),
];

// =============================================================================
// CAMERA HANDLE
// =============================================================================

/// One open SDK camera session. The device is closed exactly once, either by
/// `ConnectionManager::disconnect` or when the last reference is dropped.
pub struct CameraHandle {
    sdk: Arc<dyn CameraSdk>,
    info: CameraInfo,
    roi: Mutex<RoiFormat>,
    abort: AtomicBool,
    closed: AtomicBool,
}

impl std::fmt::Debug for CameraHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CameraHandle")
            .field("camera_id", &self.info.camera_id)
            .field("name", &self.info.name)
            .field("closed", &self.closed.load(Ordering::SeqCst))
            .finish()
    }
}

impl CameraHandle {
    fn new(sdk: Arc<dyn CameraSdk>, info: CameraInfo) -> Self {
        let roi = RoiFormat::full_frame(&info, ImageType::Raw8);
        Self {
            sdk,
            info,
            roi: Mutex::new(roi),
            abort: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        }
    }

    pub fn info(&self) -> &CameraInfo {
        &self.info
    }

    pub fn roi(&self) -> RoiFormat {
        *self.roi.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn id(&self) -> i32 {
        self.info.camera_id
    }

    /// Write a control after clamping it to the range the camera reports
    fn set_clamped(&self, control: ControlType, value: i64, auto: bool) -> Result<i64, NativeError> {
        let range = self.sdk.control_range(self.id(), control)?;
        let clamped = range.clamp(value);
        if clamped != value {
            tracing::warn!(
                "{:?} value {} outside camera range [{}, {}], using {}",
                control,
                value,
                range.min,
                range.max,
                clamped
            );
        }
        self.sdk.set_control(self.id(), control, clamped, auto)?;
        Ok(clamped)
    }

    /// Push every camera-side setting to the device
    pub fn apply_settings(&self, settings: &CameraSettings) -> Result<(), ConnectError> {
        self.set_clamped(ControlType::Gain, settings.gain, false)?;
        self.set_clamped(ControlType::Exposure, duration_to_us(settings.exposure()), false)?;

        let (wb_r, wb_b, auto_wb) = match settings.white_balance {
            WhiteBalanceMode::Manual => (settings.wb_r, settings.wb_b, false),
            WhiteBalanceMode::AsiAuto => (settings.wb_r, settings.wb_b, true),
            WhiteBalanceMode::GrayWorld => (NEUTRAL_WB, NEUTRAL_WB, false),
        };
        self.set_clamped(ControlType::WhiteBalanceRed, wb_r, auto_wb)?;
        self.set_clamped(ControlType::WhiteBalanceBlue, wb_b, auto_wb)?;

        self.set_clamped(ControlType::Offset, settings.offset, false)?;
        self.set_clamped(ControlType::Flip, settings.flip.sdk_value(), false)?;

        let image_type = if settings.use_raw16 && self.info.supports_raw16 {
            ImageType::Raw16
        } else {
            if settings.use_raw16 {
                tracing::warn!("{} does not support RAW16, using RAW8", self.info.name);
            }
            ImageType::Raw8
        };
        let roi = RoiFormat::full_frame(&self.info, image_type);
        self.sdk.set_roi_format(self.id(), roi)?;
        *self.roi.lock().unwrap_or_else(|poisoned| poisoned.into_inner()) = roi;

        tracing::debug!(
            "Applied settings to {}: exposure={:.1}ms gain={} wb={}/{} offset={} flip={:?} format={:?}",
            self.info.name,
            settings.exposure_ms,
            settings.gain,
            settings.wb_r,
            settings.wb_b,
            settings.offset,
            settings.flip,
            image_type
        );
        Ok(())
    }

    /// Take one exposure and read it out. Blocks for the exposure duration.
    pub fn expose(&self, exposure: Duration, timeouts: &NativeTimeoutConfig) -> Result<RawFrame, CaptureError> {
        if self.is_closed() {
            return Err(CaptureError::NotConnected);
        }
        if self.abort.load(Ordering::SeqCst) {
            return Err(CaptureError::Aborted);
        }

        let id = self.id();
        self.sdk
            .set_control(id, ControlType::Exposure, duration_to_us(exposure), false)?;
        self.sdk.start_exposure(id)?;

        let secs = exposure.as_secs_f64();
        if let Err(e) = wait_for_exposure(|| self.sdk.exposure_status(id), timeouts, secs, &self.abort) {
            if let Err(stop_err) = self.sdk.stop_exposure(id) {
                tracing::debug!("stop_exposure after failed wait: {}", stop_err);
            }
            return Err(e.into());
        }

        let roi = self.roi();
        let mut data = vec![0u8; roi.buffer_size()?];
        self.sdk.read_exposure_data(id, &mut data)?;

        Ok(RawFrame {
            width: roi.width,
            height: roi.height,
            image_type: roi.image_type,
            data,
        })
    }

    /// Sensor temperature in degrees C, if the camera reports one
    pub fn temperature(&self) -> Option<f64> {
        match self.sdk.get_control(self.id(), ControlType::Temperature) {
            Ok((raw, _)) => Some(raw as f64 / 10.0),
            Err(e) => {
                tracing::debug!("Temperature unavailable: {}", e);
                None
            }
        }
    }

    /// Make any in-progress exposure wait return `Aborted`
    pub fn abort(&self) {
        self.abort.store(true, Ordering::SeqCst);
    }

    fn factory_reset(&self) {
        let id = self.id();
        if let Err(e) = self
            .sdk
            .set_roi_format(id, RoiFormat::full_frame(&self.info, ImageType::Raw8))
        {
            tracing::warn!("Reset ROI on {} failed: {}", self.info.name, e);
        }
        for (control, value) in FACTORY_DEFAULTS {
            if let Err(e) = self.sdk.set_control(id, control, value, false) {
                tracing::warn!("Reset {:?} on {} failed: {}", control, self.info.name, e);
            }
        }
    }

    /// Stop, reset and close. Every step is best effort.
    fn shutdown(&self) {
        if self.is_closed() {
            return;
        }
        self.abort();
        let id = self.id();
        if let Err(e) = self.sdk.stop_exposure(id) {
            tracing::debug!("stop_exposure during disconnect: {}", e);
        }
        if let Err(e) = self.sdk.stop_video_capture(id) {
            tracing::debug!("stop_video_capture during disconnect: {}", e);
        }
        self.factory_reset();
        self.close();
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        match self.sdk.close(self.id()) {
            Ok(()) => tracing::info!("Closed camera {}", self.info.name),
            Err(e) => tracing::warn!("Closing camera {} failed: {}", self.info.name, e),
        }
    }
}

impl Drop for CameraHandle {
    fn drop(&mut self) {
        self.close();
    }
}

fn duration_to_us(d: Duration) -> i64 {
    i64::try_from(d.as_micros()).unwrap_or(i64::MAX)
}

// =============================================================================
// CONNECTION MANAGER
// =============================================================================

pub struct ConnectionManager {
    context: Arc<SdkContext>,
    timeouts: NativeTimeoutConfig,
    settle_delay: Duration,
    sdk_acquired: AtomicBool,
    handle: Mutex<Option<Arc<CameraHandle>>>,
}

impl std::fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("context", &self.context)
            .field("handle", &*self.lock_handle())
            .finish()
    }
}

impl ConnectionManager {
    pub fn new(context: Arc<SdkContext>) -> Self {
        Self {
            context,
            timeouts: NativeTimeoutConfig::default(),
            settle_delay: Duration::from_millis(500),
            sdk_acquired: AtomicBool::new(false),
            handle: Mutex::new(None),
        }
    }

    pub fn with_timeouts(mut self, timeouts: NativeTimeoutConfig) -> Self {
        self.timeouts = timeouts;
        self
    }

    /// Pause between disconnect and connect in `reconnect`
    pub fn with_settle_delay(mut self, delay: Duration) -> Self {
        self.settle_delay = delay;
        self
    }

    pub fn timeouts(&self) -> &NativeTimeoutConfig {
        &self.timeouts
    }

    pub fn context(&self) -> &Arc<SdkContext> {
        &self.context
    }

    fn lock_handle(&self) -> MutexGuard<'_, Option<Arc<CameraHandle>>> {
        self.handle.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Take a reference on the SDK. Repeated calls are no-ops.
    pub fn initialize_sdk(&self, path: impl AsRef<Path>) -> Result<(), SdkError> {
        if self.sdk_acquired.load(Ordering::SeqCst) {
            return Ok(());
        }
        self.context.initialize(path)?;
        if self.sdk_acquired.swap(true, Ordering::SeqCst) {
            // Lost a race with another initializer; keep a single reference
            self.context.release();
        }
        Ok(())
    }

    pub fn is_sdk_initialized(&self) -> bool {
        self.sdk_acquired.load(Ordering::SeqCst) && self.context.is_initialized()
    }

    /// Disconnect and drop this manager's SDK reference
    pub fn release_sdk(&self) {
        self.disconnect();
        if self.sdk_acquired.swap(false, Ordering::SeqCst) {
            self.context.release();
        }
    }

    pub fn detect_cameras(&self) -> Result<Vec<CameraInfo>, SdkError> {
        let sdk = self.context.sdk()?;
        let count = sdk.num_cameras().map_err(|e| SdkError::Enumeration(e.to_string()))?;
        if count == 0 {
            tracing::warn!("No cameras detected");
            return Ok(Vec::new());
        }

        let mut cameras = Vec::with_capacity(count);
        for index in 0..count {
            match sdk.camera_info(index) {
                Ok(info) => {
                    tracing::debug!(
                        "Found camera {}: {} ({}x{}, {:.2}um)",
                        index,
                        info.name,
                        info.max_width,
                        info.max_height,
                        info.pixel_size_um
                    );
                    cameras.push(info);
                }
                Err(e) => tracing::warn!("Could not read camera {} properties: {}", index, e),
            }
        }
        Ok(cameras)
    }

    /// Current index of the camera called `name`
    pub fn find_camera_by_name(&self, name: &str) -> Result<Option<usize>, SdkError> {
        Ok(self
            .detect_cameras()?
            .into_iter()
            .find(|info| info.name == name)
            .map(|info| info.index))
    }

    pub fn connect(&self, index: usize, settings: &CameraSettings) -> Result<CameraInfo, ConnectError> {
        let mut slot = self.lock_handle();
        if let Some(handle) = slot.as_ref() {
            return Err(ConnectError::AlreadyOpen(handle.info.name.clone()));
        }

        let sdk = self.context.sdk()?;
        let count = sdk.num_cameras()?;
        if index >= count {
            return Err(ConnectError::NoCamera(index));
        }
        let info = sdk.camera_info(index)?;
        let id = info.camera_id;

        self.open_with_retry(sdk.as_ref(), &info)?;

        let guard = CleanupGuard::new(|| {
            if let Err(e) = sdk.close(id) {
                tracing::warn!("Closing {} after failed init: {}", info.name, e);
            }
        });
        sdk.init(id)?;
        guard.defuse();

        // From here the handle owns the open device and closes it on drop
        let handle = CameraHandle::new(Arc::clone(&sdk), info.clone());
        handle.set_clamped(ControlType::BandwidthOverload, BANDWIDTH_OVERLOAD, false)?;
        handle.apply_settings(settings)?;

        if let Some(sensor) = info.bayer_pattern {
            if sensor != settings.bayer_pattern {
                tracing::warn!(
                    "{} reports a {} sensor but {} is configured; colors may be swapped",
                    info.name,
                    sensor,
                    settings.bayer_pattern
                );
            }
        }

        tracing::info!(
            "Connected to {} (index {}, {}x{})",
            info.name,
            index,
            info.max_width,
            info.max_height
        );
        *slot = Some(Arc::new(handle));
        Ok(info)
    }

    fn open_with_retry(&self, sdk: &dyn CameraSdk, info: &CameraInfo) -> Result<(), ConnectError> {
        let attempts = self.timeouts.open_attempts.max(1);
        let mut attempt = 1;
        loop {
            match sdk.open(info.camera_id) {
                Ok(()) => return Ok(()),
                Err(e) if attempt < attempts => {
                    tracing::warn!(
                        "Opening {} failed (attempt {}/{}): {}",
                        info.name,
                        attempt,
                        attempts,
                        e
                    );
                    std::thread::sleep(self.timeouts.open_retry_delay);
                    attempt += 1;
                }
                Err(e) => {
                    tracing::error!("Opening {} failed after {} attempts: {}", info.name, attempts, e);
                    return Err(e.into());
                }
            }
        }
    }

    /// Reapply settings to the open camera. Returns false when nothing is connected.
    pub fn configure(&self, settings: &CameraSettings) -> Result<bool, ConnectError> {
        match self.handle() {
            Some(handle) => {
                handle.apply_settings(settings)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Safe to call at any time, from any thread, any number of times
    pub fn disconnect(&self) {
        let mut slot = self.lock_handle();
        let Some(handle) = slot.take() else {
            return;
        };
        tracing::info!("Disconnecting {}", handle.info.name);
        handle.shutdown();
    }

    pub fn reconnect(&self, index: usize, settings: &CameraSettings) -> Result<CameraInfo, ConnectError> {
        self.disconnect();
        std::thread::sleep(self.settle_delay);
        self.connect(index, settings)
    }

    pub fn is_connected(&self) -> bool {
        self.lock_handle().is_some()
    }

    pub fn handle(&self) -> Option<Arc<CameraHandle>> {
        self.lock_handle().clone()
    }

    pub fn camera_info(&self) -> Option<CameraInfo> {
        self.lock_handle().as_ref().map(|h| h.info.clone())
    }

    /// Expose on the open camera without holding the connection lock
    pub fn expose(&self, exposure: Duration) -> Result<RawFrame, CaptureError> {
        let handle = self.handle().ok_or(CaptureError::NotConnected)?;
        handle.expose(exposure, &self.timeouts)
    }

    /// Interrupt an exposure wait on the open camera, if any
    pub fn abort_exposure(&self) {
        if let Some(handle) = self.handle() {
            handle.abort();
        }
    }

    pub fn temperature(&self) -> Option<f64> {
        self.handle().and_then(|h| h.temperature())
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        self.release_sdk();
    }
}
