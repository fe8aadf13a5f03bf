//! Sentinel native camera layer
//!
//! Thin, synchronous access to vendor camera SDKs behind the [`CameraSdk`] trait:
//! - `vendor::zwo` loads the ZWO ASI library at runtime
//! - `sim` provides a scriptable in-process camera for development and tests

pub mod camera;
pub mod sim;
pub mod traits;
pub mod utils;
pub mod vendor;

pub use camera::*;
pub use sim::{SimCamera, SimulatedSdk};
pub use traits::{CameraSdk, NativeError, NativeTimeoutConfig};
pub use vendor::zwo::AsiSdk;
