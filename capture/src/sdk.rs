//! Reference-counted SDK context
//!
//! The vendor library is process-global. `SdkContext` owns the single loaded
//! instance and counts how many users initialized it, so repeated
//! `initialize` calls are cheap and the library is dropped with the last
//! `release`.

use crate::error::SdkError;
use sentinel_native::{AsiSdk, CameraSdk, NativeError};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

/// Builds an SDK implementation from a library path
pub type SdkLoader = dyn Fn(&Path) -> Result<Arc<dyn CameraSdk>, NativeError> + Send + Sync;

#[derive(Default)]
struct SdkState {
    sdk: Option<Arc<dyn CameraSdk>>,
    refs: u32,
    path: Option<PathBuf>,
}

pub struct SdkContext {
    loader: Box<SdkLoader>,
    state: Mutex<SdkState>,
}

impl std::fmt::Debug for SdkContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state();
        f.debug_struct("SdkContext")
            .field("loaded", &state.sdk.is_some())
            .field("refs", &state.refs)
            .field("path", &state.path)
            .finish()
    }
}

impl SdkContext {
    /// Context for the ZWO ASI library
    pub fn asi() -> Self {
        Self::with_loader(|path| {
            let sdk = AsiSdk::load(path)?;
            Ok(Arc::new(sdk) as Arc<dyn CameraSdk>)
        })
    }

    pub fn with_loader<F>(loader: F) -> Self
    where
        F: Fn(&Path) -> Result<Arc<dyn CameraSdk>, NativeError> + Send + Sync + 'static,
    {
        Self {
            loader: Box::new(loader),
            state: Mutex::new(SdkState::default()),
        }
    }

    /// Context around an SDK that is already constructed, e.g. the simulator.
    /// The path passed to `initialize` is ignored.
    pub fn with_sdk(sdk: Arc<dyn CameraSdk>) -> Self {
        Self::with_loader(move |_| Ok(Arc::clone(&sdk)))
    }

    /// Load the library on first use; later calls only take a reference
    pub fn initialize(&self, path: impl AsRef<Path>) -> Result<(), SdkError> {
        let path = path.as_ref();
        let mut state = self.state();

        if state.sdk.is_some() {
            state.refs += 1;
            tracing::debug!("SDK already initialized ({} references)", state.refs);
            return Ok(());
        }

        let sdk = (self.loader)(path).map_err(|e| {
            tracing::error!("Failed to initialize camera SDK from '{}': {}", path.display(), e);
            SdkError::from(e)
        })?;
        tracing::info!("Initialized {} camera SDK", sdk.vendor());

        state.sdk = Some(sdk);
        state.refs = 1;
        state.path = Some(path.to_path_buf());
        Ok(())
    }

    /// Drop one reference; unloads the library when none remain
    pub fn release(&self) {
        let mut state = self.state();
        match state.refs {
            0 => {}
            1 => {
                state.refs = 0;
                state.sdk = None;
                state.path = None;
                tracing::info!("Camera SDK released");
            }
            _ => state.refs -= 1,
        }
    }

    pub fn sdk(&self) -> Result<Arc<dyn CameraSdk>, SdkError> {
        self.state().sdk.clone().ok_or(SdkError::NotInitialized)
    }

    pub fn is_initialized(&self) -> bool {
        self.state().sdk.is_some()
    }

    pub fn ref_count(&self) -> u32 {
        self.state().refs
    }

    fn state(&self) -> MutexGuard<'_, SdkState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
