//! Simulated camera SDK
//!
//! An in-process [`CameraSdk`] that behaves like the ASI library closely enough
//! to drive the connection manager and capture loop without hardware. Frames
//! are uniform Bayer mosaics whose level comes from a response function of
//! exposure and gain. Failures, busy devices and unplug events can be injected,
//! and every SDK call is counted.

use crate::camera::*;
use crate::traits::{CameraSdk, NativeError};
use sentinel_imaging::BayerPattern;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

/// Maps (exposure in ms, gain) to an 8-bit sensor level
pub type ResponseFn = dyn Fn(f64, i64) -> f64 + Send + Sync;

/// One simulated device
#[derive(Debug, Clone)]
pub struct SimCamera {
    pub name: String,
    pub width: u32,
    pub height: u32,
    pub bayer_pattern: Option<BayerPattern>,
    pub pixel_size_um: f64,
    pub supports_raw16: bool,
}

impl SimCamera {
    /// Color camera with an RGGB sensor
    pub fn new(name: impl Into<String>, width: u32, height: u32) -> Self {
        Self {
            name: name.into(),
            width,
            height,
            bayer_pattern: Some(BayerPattern::Rggb),
            pixel_size_um: 2.9,
            supports_raw16: true,
        }
    }

    pub fn with_bayer(mut self, pattern: Option<BayerPattern>) -> Self {
        self.bayer_pattern = pattern;
        self
    }
}

impl Default for SimCamera {
    fn default() -> Self {
        Self::new("ZWO ASI585MC (simulated)", 64, 48)
    }
}

struct SimExposure {
    started: Instant,
    exposure_us: i64,
    gain: i64,
    fail: bool,
}

struct OpenCamera {
    initialized: bool,
    controls: HashMap<ControlType, (i64, bool)>,
    roi: RoiFormat,
    exposure: Option<SimExposure>,
}

#[derive(Default)]
struct SimState {
    cameras: Vec<SimCamera>,
    open: HashMap<i32, OpenCamera>,
    fail_exposures: u32,
    fail_all_exposures: bool,
    busy_opens: u32,
    unplugged: bool,
    exposure_delay: Duration,
}

pub struct SimulatedSdk {
    response: Box<ResponseFn>,
    state: Mutex<SimState>,
    calls: AtomicU64,
    opens: AtomicU64,
    closes: AtomicU64,
    exposures: AtomicU64,
}

impl std::fmt::Debug for SimulatedSdk {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimulatedSdk")
            .field("calls", &self.calls.load(Ordering::SeqCst))
            .finish()
    }
}

impl Default for SimulatedSdk {
    fn default() -> Self {
        Self::new(vec![SimCamera::default()])
    }
}

impl SimulatedSdk {
    pub fn new(cameras: Vec<SimCamera>) -> Self {
        Self {
            // Reaches a level of 100 at about 1s with gain 100
            response: Box::new(|exposure_ms, gain| exposure_ms * 0.05 * (1.0 + gain as f64 / 100.0)),
            state: Mutex::new(SimState {
                cameras,
                ..SimState::default()
            }),
            calls: AtomicU64::new(0),
            opens: AtomicU64::new(0),
            closes: AtomicU64::new(0),
            exposures: AtomicU64::new(0),
        }
    }

    pub fn with_response<F>(mut self, response: F) -> Self
    where
        F: Fn(f64, i64) -> f64 + Send + Sync + 'static,
    {
        self.response = Box::new(response);
        self
    }

    /// How long an exposure reports `Working` before succeeding
    pub fn with_exposure_delay(self, delay: Duration) -> Self {
        self.state().exposure_delay = delay;
        self
    }

    // =========================================================================
    // Fault injection
    // =========================================================================

    /// The next `count` exposures end with status `Failed`
    pub fn fail_next_exposures(&self, count: u32) {
        self.state().fail_exposures = count;
    }

    pub fn fail_all_exposures(&self, fail: bool) {
        self.state().fail_all_exposures = fail;
    }

    /// The next `count` open attempts report the device busy
    pub fn busy_next_opens(&self, count: u32) {
        self.state().busy_opens = count;
    }

    /// Simulate pulling the USB cable; open handles start failing with `Disconnected`
    pub fn set_unplugged(&self, unplugged: bool) {
        self.state().unplugged = unplugged;
    }

    /// Replace the enumerated device list, e.g. to reorder indices
    pub fn set_cameras(&self, cameras: Vec<SimCamera>) {
        self.state().cameras = cameras;
    }

    // =========================================================================
    // Inspection
    // =========================================================================

    pub fn call_count(&self) -> u64 {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn open_count(&self) -> u64 {
        self.opens.load(Ordering::SeqCst)
    }

    pub fn close_count(&self) -> u64 {
        self.closes.load(Ordering::SeqCst)
    }

    pub fn exposure_count(&self) -> u64 {
        self.exposures.load(Ordering::SeqCst)
    }

    pub fn is_open(&self, camera_id: i32) -> bool {
        self.state().open.contains_key(&camera_id)
    }

    pub fn control_value(&self, camera_id: i32, control: ControlType) -> Option<i64> {
        self.state()
            .open
            .get(&camera_id)
            .and_then(|cam| cam.controls.get(&control))
            .map(|&(value, _)| value)
    }

    pub fn current_roi(&self, camera_id: i32) -> Option<RoiFormat> {
        self.state().open.get(&camera_id).map(|cam| cam.roi)
    }

    fn state(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn count_call(&self) {
        self.calls.fetch_add(1, Ordering::SeqCst);
    }

    /// Lock state and resolve an open camera, mapping unplug and closed states to SDK errors
    fn with_open<T>(
        &self,
        camera_id: i32,
        f: impl FnOnce(&mut OpenCamera, &SimState) -> Result<T, NativeError>,
    ) -> Result<T, NativeError> {
        self.count_call();
        let mut state = self.state();
        if state.unplugged {
            return Err(NativeError::Disconnected);
        }
        let mut cam = state.open.remove(&camera_id).ok_or(NativeError::NotConnected)?;
        let result = f(&mut cam, &state);
        state.open.insert(camera_id, cam);
        result
    }
}

fn invalid_index() -> NativeError {
    NativeError::Sdk {
        code: 1,
        message: "ASI_ERROR_INVALID_INDEX: No camera connected or camera index out of bounds".into(),
    }
}

fn default_range(control: ControlType) -> ControlRange {
    let (min, max, default, writable) = match control {
        ControlType::Gain => (0, 600, 200, true),
        ControlType::Exposure => (32, 2_000_000_000, 10_000, true),
        ControlType::WhiteBalanceRed => (1, 99, 52, true),
        ControlType::WhiteBalanceBlue => (1, 99, 95, true),
        ControlType::Offset => (0, 255, 8, true),
        ControlType::BandwidthOverload => (40, 100, 50, true),
        ControlType::Temperature => (-500, 1000, 20, false),
        ControlType::Flip => (0, 3, 0, true),
        ControlType::AutoMaxGain => (0, 600, 300, true),
        ControlType::AutoMaxExposure => (1, 60_000, 30_000, true),
        ControlType::AutoTargetBrightness => (50, 160, 100, true),
    };
    ControlRange {
        min,
        max,
        default,
        writable,
        auto_supported: matches!(
            control,
            ControlType::Gain
                | ControlType::Exposure
                | ControlType::WhiteBalanceRed
                | ControlType::WhiteBalanceBlue
                | ControlType::BandwidthOverload
        ),
    }
}

impl CameraSdk for SimulatedSdk {
    fn vendor(&self) -> &str {
        "Simulated"
    }

    fn num_cameras(&self) -> Result<usize, NativeError> {
        self.count_call();
        let state = self.state();
        Ok(if state.unplugged { 0 } else { state.cameras.len() })
    }

    fn camera_info(&self, index: usize) -> Result<CameraInfo, NativeError> {
        self.count_call();
        let state = self.state();
        if state.unplugged {
            return Err(invalid_index());
        }
        let cam = state.cameras.get(index).ok_or_else(invalid_index)?;
        Ok(CameraInfo {
            index,
            camera_id: index as i32,
            name: cam.name.clone(),
            max_width: cam.width,
            max_height: cam.height,
            pixel_size_um: cam.pixel_size_um,
            is_color: cam.bayer_pattern.is_some(),
            bayer_pattern: cam.bayer_pattern,
            bit_depth: 12,
            supports_raw16: cam.supports_raw16,
            is_usb3: true,
            has_cooler: false,
        })
    }

    fn open(&self, camera_id: i32) -> Result<(), NativeError> {
        self.count_call();
        let mut state = self.state();
        if state.unplugged {
            return Err(NativeError::Sdk {
                code: 2,
                message: "ASI_ERROR_INVALID_ID: Invalid camera ID".into(),
            });
        }
        if state.busy_opens > 0 {
            state.busy_opens -= 1;
            return Err(NativeError::Busy {
                code: 16,
                message: "ASI_ERROR_GENERAL_ERROR: camera in use by another application".into(),
            });
        }
        let cam = usize::try_from(camera_id)
            .ok()
            .and_then(|i| state.cameras.get(i))
            .ok_or_else(invalid_index)?;
        let roi = RoiFormat {
            width: cam.width,
            height: cam.height,
            bin: 1,
            image_type: ImageType::Raw8,
        };
        state.open.entry(camera_id).or_insert_with(|| OpenCamera {
            initialized: false,
            controls: HashMap::new(),
            roi,
            exposure: None,
        });
        self.opens.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn init(&self, camera_id: i32) -> Result<(), NativeError> {
        self.with_open(camera_id, |cam, _| {
            cam.initialized = true;
            Ok(())
        })
    }

    fn close(&self, camera_id: i32) -> Result<(), NativeError> {
        self.count_call();
        let mut state = self.state();
        match state.open.remove(&camera_id) {
            Some(_) => {
                self.closes.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
            None => Err(NativeError::NotConnected),
        }
    }

    fn control_range(&self, camera_id: i32, control: ControlType) -> Result<ControlRange, NativeError> {
        self.with_open(camera_id, |_, _| Ok(default_range(control)))
    }

    fn get_control(&self, camera_id: i32, control: ControlType) -> Result<(i64, bool), NativeError> {
        self.with_open(camera_id, |cam, _| {
            if control == ControlType::Temperature {
                return Ok((215, false));
            }
            Ok(cam
                .controls
                .get(&control)
                .copied()
                .unwrap_or((default_range(control).default, false)))
        })
    }

    fn set_control(
        &self,
        camera_id: i32,
        control: ControlType,
        value: i64,
        auto: bool,
    ) -> Result<(), NativeError> {
        self.with_open(camera_id, |cam, _| {
            let range = default_range(control);
            if !range.writable {
                return Err(NativeError::Sdk {
                    code: 3,
                    message: format!("{:?} is read-only", control),
                });
            }
            cam.controls.insert(control, (range.clamp(value), auto));
            Ok(())
        })
    }

    fn set_roi_format(&self, camera_id: i32, roi: RoiFormat) -> Result<(), NativeError> {
        self.with_open(camera_id, |cam, _| {
            if roi.width == 0 || roi.height == 0 {
                return Err(NativeError::Sdk {
                    code: 8,
                    message: "ASI_ERROR_INVALID_SIZE".into(),
                });
            }
            cam.roi = roi;
            Ok(())
        })
    }

    fn roi_format(&self, camera_id: i32) -> Result<RoiFormat, NativeError> {
        self.with_open(camera_id, |cam, _| Ok(cam.roi))
    }

    fn start_exposure(&self, camera_id: i32) -> Result<(), NativeError> {
        self.count_call();
        let mut state = self.state();
        if state.unplugged {
            return Err(NativeError::Disconnected);
        }
        let fail = if state.fail_all_exposures {
            true
        } else if state.fail_exposures > 0 {
            state.fail_exposures -= 1;
            true
        } else {
            false
        };
        let cam = state.open.get_mut(&camera_id).ok_or(NativeError::NotConnected)?;
        if !cam.initialized {
            return Err(NativeError::Sdk {
                code: 12,
                message: "ASI_ERROR_INVALID_SEQUENCE: camera not initialized".into(),
            });
        }
        let exposure_us = cam
            .controls
            .get(&ControlType::Exposure)
            .map(|&(v, _)| v)
            .unwrap_or(default_range(ControlType::Exposure).default);
        let gain = cam
            .controls
            .get(&ControlType::Gain)
            .map(|&(v, _)| v)
            .unwrap_or(default_range(ControlType::Gain).default);
        cam.exposure = Some(SimExposure {
            started: Instant::now(),
            exposure_us,
            gain,
            fail,
        });
        self.exposures.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn stop_exposure(&self, camera_id: i32) -> Result<(), NativeError> {
        self.with_open(camera_id, |cam, _| {
            cam.exposure = None;
            Ok(())
        })
    }

    fn exposure_status(&self, camera_id: i32) -> Result<ExposureStatus, NativeError> {
        self.with_open(camera_id, |cam, state| {
            Ok(match &cam.exposure {
                None => ExposureStatus::Idle,
                Some(exp) if exp.fail => ExposureStatus::Failed,
                Some(exp) if exp.started.elapsed() < state.exposure_delay => ExposureStatus::Working,
                Some(_) => ExposureStatus::Success,
            })
        })
    }

    fn read_exposure_data(&self, camera_id: i32, buffer: &mut [u8]) -> Result<(), NativeError> {
        self.with_open(camera_id, |cam, _| {
            let exp = cam.exposure.take().ok_or_else(|| NativeError::Sdk {
                code: 12,
                message: "ASI_ERROR_INVALID_SEQUENCE: no finished exposure".into(),
            })?;
            let expected = cam.roi.buffer_size()?;
            if buffer.len() < expected {
                return Err(NativeError::Sdk {
                    code: 13,
                    message: "ASI_ERROR_BUFFER_TOO_SMALL".into(),
                });
            }

            let level = (self.response)(exp.exposure_us as f64 / 1000.0, exp.gain).clamp(0.0, 255.0);
            match cam.roi.image_type {
                ImageType::Raw8 => buffer[..expected].fill(level.round() as u8),
                ImageType::Raw16 => {
                    let sample = ((level * 257.0).round() as u16).to_le_bytes();
                    for chunk in buffer[..expected].chunks_exact_mut(2) {
                        chunk.copy_from_slice(&sample);
                    }
                }
            }
            Ok(())
        })
    }

    fn stop_video_capture(&self, camera_id: i32) -> Result<(), NativeError> {
        self.with_open(camera_id, |_, _| Ok(()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_camera(sdk: &SimulatedSdk) {
        sdk.open(0).unwrap();
        sdk.init(0).unwrap();
    }

    #[test]
    fn test_enumeration() {
        let sdk = SimulatedSdk::new(vec![
            SimCamera::new("Cam A", 32, 32),
            SimCamera::new("Cam B", 16, 16).with_bayer(None),
        ]);
        assert_eq!(sdk.num_cameras().unwrap(), 2);
        let b = sdk.camera_info(1).unwrap();
        assert_eq!(b.name, "Cam B");
        assert!(!b.is_color);
        assert!(sdk.camera_info(2).is_err());
    }

    #[test]
    fn test_exposure_produces_response_level() {
        let sdk = SimulatedSdk::default().with_response(|ms, _| ms / 10.0);
        open_camera(&sdk);
        sdk.set_control(0, ControlType::Exposure, 800_000, false).unwrap();
        sdk.start_exposure(0).unwrap();
        assert_eq!(sdk.exposure_status(0).unwrap(), ExposureStatus::Success);

        let roi = sdk.roi_format(0).unwrap();
        let mut buf = vec![0u8; roi.buffer_size().unwrap()];
        sdk.read_exposure_data(0, &mut buf).unwrap();
        assert!(buf.iter().all(|&b| b == 80));
        assert_eq!(sdk.exposure_count(), 1);
    }

    #[test]
    fn test_raw16_readout() {
        let sdk = SimulatedSdk::default().with_response(|_, _| 255.0);
        open_camera(&sdk);
        let info = sdk.camera_info(0).unwrap();
        sdk.set_roi_format(0, RoiFormat::full_frame(&info, ImageType::Raw16)).unwrap();
        sdk.start_exposure(0).unwrap();
        let mut buf = vec![0u8; info.max_width as usize * info.max_height as usize * 2];
        sdk.read_exposure_data(0, &mut buf).unwrap();
        assert_eq!(&buf[..2], &[0xff, 0xff]);
    }

    #[test]
    fn test_fault_injection() {
        let sdk = SimulatedSdk::default();
        sdk.busy_next_opens(1);
        assert!(matches!(sdk.open(0), Err(NativeError::Busy { code: 16, .. })));
        open_camera(&sdk);

        sdk.fail_next_exposures(1);
        sdk.start_exposure(0).unwrap();
        assert_eq!(sdk.exposure_status(0).unwrap(), ExposureStatus::Failed);
        sdk.start_exposure(0).unwrap();
        assert_eq!(sdk.exposure_status(0).unwrap(), ExposureStatus::Success);

        sdk.set_unplugged(true);
        assert_eq!(sdk.start_exposure(0), Err(NativeError::Disconnected));
        assert_eq!(sdk.num_cameras().unwrap(), 0);
    }

    #[test]
    fn test_controls_clamped_and_close() {
        let sdk = SimulatedSdk::default();
        open_camera(&sdk);
        sdk.set_control(0, ControlType::Gain, 9999, false).unwrap();
        assert_eq!(sdk.control_value(0, ControlType::Gain), Some(600));
        assert!(sdk.set_control(0, ControlType::Temperature, 1, false).is_err());
        assert_eq!(sdk.get_control(0, ControlType::Temperature).unwrap(), (215, false));

        sdk.close(0).unwrap();
        assert!(!sdk.is_open(0));
        assert_eq!(sdk.close(0), Err(NativeError::NotConnected));
        assert_eq!(sdk.close_count(), 1);
    }
}
