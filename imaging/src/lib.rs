//! Sentinel Imaging Library
//!
//! Pure image routines used by the capture core:
//! - Bayer mosaic reconstruction (debayering)
//! - Brightness statistics that drive auto-exposure
//! - Clipping detection and per-frame image statistics
//! - Software white balance (gray world and fixed gains)

pub mod bayer;
pub mod stats;
pub mod white_balance;

pub use bayer::*;
pub use stats::*;
pub use white_balance::*;

use thiserror::Error;

/// Errors raised by the imaging routines
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ImagingError {
    #[error("Invalid image dimensions: {width}x{height} ({reason})")]
    InvalidDimensions {
        width: u32,
        height: u32,
        reason: String,
    },

    #[error("Buffer length mismatch: expected {expected} samples, got {actual}")]
    BufferLength { expected: usize, actual: usize },
}
