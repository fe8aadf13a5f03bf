//! Common utilities for native SDK drivers
//!
//! This module provides:
//! - Safe C string conversion with null-termination validation
//! - Overflow-safe buffer size calculations
//! - A cleanup guard for partially completed connects
//! - Blocking exposure polling with timeout and abort

use crate::camera::ExposureStatus;
use crate::traits::{NativeError, NativeTimeoutConfig};
use std::ffi::c_char;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

// =============================================================================
// SAFE STRING CONVERSION
// =============================================================================

/// Convert a C string pointer to a Rust String with bounds checking.
///
/// Null pointers yield an empty string. At most `max_len` bytes are read, the
/// string ends at the first null byte, and invalid UTF-8 is replaced lossily.
///
/// # Safety
/// If `ptr` is not null it must point to at least `max_len` readable bytes.
pub(crate) unsafe fn cstr_to_string(ptr: *const c_char, max_len: usize) -> String {
    if ptr.is_null() {
        return String::new();
    }

    let slice = std::slice::from_raw_parts(ptr as *const u8, max_len);
    let null_pos = slice.iter().position(|&c| c == 0).unwrap_or(max_len);
    String::from_utf8_lossy(&slice[..null_pos]).to_string()
}

/// Safely convert a fixed-size C char array to a Rust String.
pub fn safe_char_array_to_string<const N: usize>(arr: &[c_char; N]) -> String {
    // Safety: the array is exactly N bytes
    unsafe { cstr_to_string(arr.as_ptr(), N) }
}

// =============================================================================
// OVERFLOW-SAFE BUFFER CALCULATIONS
// =============================================================================

/// Calculate buffer size for image data with overflow protection.
///
/// # Example
/// ```ignore
/// let buffer_size = calculate_buffer_size(3840, 2160, 2)?;
/// let mut buffer: Vec<u8> = vec![0u8; buffer_size];
/// ```
pub fn calculate_buffer_size(width: u32, height: u32, bytes_per_pixel: u32) -> Result<usize, NativeError> {
    (width as usize)
        .checked_mul(height as usize)
        .and_then(|pixels| pixels.checked_mul(bytes_per_pixel as usize))
        .filter(|&size| size <= isize::MAX as usize)
        .ok_or_else(|| {
            NativeError::InvalidParameter(format!(
                "Image buffer size overflow: {}x{} with {} bytes/pixel",
                width, height, bytes_per_pixel
            ))
        })
}

// =============================================================================
// CONNECT WITH CLEANUP GUARD
// =============================================================================

/// A guard that runs cleanup unless defused.
///
/// Used where a device must be closed again if initialization fails after
/// it was opened.
///
/// # Example
/// ```ignore
/// sdk.open(camera_id)?;
/// let cleanup_guard = CleanupGuard::new(|| {
///     let _ = sdk.close(camera_id);
/// });
///
/// sdk.init(camera_id)?;
/// apply_settings(camera_id)?;
///
/// cleanup_guard.defuse();
/// ```
pub struct CleanupGuard<F: FnOnce()> {
    cleanup: Option<F>,
}

impl<F: FnOnce()> CleanupGuard<F> {
    pub fn new(cleanup: F) -> Self {
        Self {
            cleanup: Some(cleanup),
        }
    }

    /// Defuse the guard, preventing the cleanup function from running.
    pub fn defuse(mut self) {
        self.cleanup = None;
    }
}

impl<F: FnOnce()> Drop for CleanupGuard<F> {
    fn drop(&mut self) {
        if let Some(cleanup) = self.cleanup.take() {
            cleanup();
        }
    }
}

// =============================================================================
// TIMEOUT UTILITIES
// =============================================================================

/// Block until an exposure finishes, fails, times out or is aborted.
///
/// `status` is polled every `config.poll_interval`. The timeout is the exposure
/// duration plus the configured margin. Setting `abort` ends the wait with
/// `NativeError::ExposureAborted` at the next poll.
pub fn wait_for_exposure<F>(
    mut status: F,
    config: &NativeTimeoutConfig,
    exposure_secs: f64,
    abort: &AtomicBool,
) -> Result<(), NativeError>
where
    F: FnMut() -> Result<ExposureStatus, NativeError>,
{
    let tracker = TimeoutTracker::for_exposure(config, exposure_secs);

    loop {
        if abort.load(Ordering::SeqCst) {
            tracing::debug!("Exposure wait aborted after {:?}", tracker.elapsed());
            return Err(NativeError::ExposureAborted);
        }

        match status()? {
            ExposureStatus::Success => {
                tracing::debug!(
                    "Exposure completed after {:.3}s (expected {:.3}s)",
                    tracker.elapsed().as_secs_f64(),
                    exposure_secs
                );
                return Ok(());
            }
            ExposureStatus::Failed => {
                return Err(NativeError::ExposureFailed(format!(
                    "SDK reported failure after {:.3}s",
                    tracker.elapsed().as_secs_f64()
                )));
            }
            ExposureStatus::Working | ExposureStatus::Idle => {}
        }

        if tracker.is_expired() {
            tracing::warn!(
                "Exposure timeout after {:?} (expected {:.3}s exposure + margin)",
                tracker.elapsed(),
                exposure_secs
            );
            return Err(tracker.exposure_timeout_error(exposure_secs));
        }

        std::thread::sleep(config.poll_interval);
    }
}

/// Tracks the duration of an operation for timeout checking.
#[derive(Debug, Clone)]
pub struct TimeoutTracker {
    start: Instant,
    timeout: Duration,
}

impl TimeoutTracker {
    pub fn new(timeout: Duration) -> Self {
        Self {
            start: Instant::now(),
            timeout,
        }
    }

    pub fn for_exposure(config: &NativeTimeoutConfig, exposure_secs: f64) -> Self {
        Self::new(config.calculate_exposure_timeout(exposure_secs))
    }

    pub fn is_expired(&self) -> bool {
        self.start.elapsed() > self.timeout
    }

    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }

    pub fn exposure_timeout_error(&self, expected_exposure: f64) -> NativeError {
        NativeError::exposure_timeout(self.elapsed(), expected_exposure)
    }
}
