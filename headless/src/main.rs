//! Sentinel headless runner
//!
//! Runs the capture loop from a JSON config file until interrupted.

mod logging;

use anyhow::{bail, Context};
use clap::Parser;
use sentinel_capture::{
    CaptureController, CaptureObserver, CaptureState, ConnectionManager, ErrorKind, Frame, SdkContext,
    SentinelConfig,
};
use sentinel_native::SimulatedSdk;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

#[derive(Debug, Parser)]
#[command(name = "sentinel", version, about = "Unattended all-sky camera capture")]
struct Args {
    /// JSON configuration file; defaults are used when omitted
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Use the in-process simulated camera instead of the vendor SDK
    #[arg(long)]
    simulate: bool,

    /// List connected cameras and exit
    #[arg(long)]
    list: bool,

    /// Print the effective configuration as JSON and exit
    #[arg(long)]
    print_config: bool,

    /// Stop after this many seconds
    #[arg(long, value_name = "SECONDS")]
    auto_stop: Option<u64>,

    /// Also write daily rolling log files here
    #[arg(long)]
    log_dir: Option<PathBuf>,

    /// Default log level when RUST_LOG is unset
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Overrides `camera_index` from the config
    #[arg(long)]
    camera_index: Option<usize>,

    /// Overrides `sdk_path` from the config
    #[arg(long)]
    sdk_path: Option<PathBuf>,
}

/// Summarizes frames and events in the log. Fatal errors also wake `main`.
struct LogObserver {
    fatal: Arc<Notify>,
}

impl CaptureObserver for LogObserver {
    fn on_frame(&self, frame: Frame) {
        let meta = &frame.metadata;
        tracing::info!(
            "Frame #{} {}x{} exposure {:.2}ms gain {} brightness {:.1} clipped {:.2}%{}",
            meta.frame_number,
            meta.width,
            meta.height,
            meta.exposure_ms,
            meta.gain,
            meta.brightness,
            meta.clipped_percent,
            if meta.exposure_adjusted { " (adjusted)" } else { "" }
        );
        match serde_json::to_string(meta) {
            Ok(json) => tracing::debug!("Frame metadata: {}", json),
            Err(e) => tracing::warn!("Failed to serialize frame metadata: {}", e),
        }
    }

    fn on_status(&self, state: CaptureState, message: &str) {
        tracing::debug!("[{}] {}", state, message);
    }

    fn on_error(&self, kind: ErrorKind, message: &str) {
        if kind.is_fatal() {
            tracing::error!("Fatal {} error: {}", kind, message);
            self.fatal.notify_one();
        } else {
            tracing::warn!("{} error: {}", kind, message);
        }
    }
}

fn load_config(args: &Args) -> anyhow::Result<SentinelConfig> {
    let mut config = match &args.config {
        Some(path) => SentinelConfig::load(path).with_context(|| format!("loading {}", path.display()))?,
        None => SentinelConfig::default(),
    };
    if let Some(index) = args.camera_index {
        config.camera_index = index;
    }
    if let Some(path) = &args.sdk_path {
        config.sdk_path = path.clone();
    }
    config.validate().context("invalid configuration")?;
    Ok(config)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Shutdown {
    Requested,
    /// The capture loop stopped itself and will not recover
    Fatal,
}

async fn wait_for_shutdown(auto_stop: Option<Duration>, fatal: &Notify) -> Shutdown {
    let auto_stop = async {
        match auto_stop {
            Some(after) => tokio::time::sleep(after).await,
            None => std::future::pending().await,
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::warn!("Cannot listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            if let Err(e) = result {
                tracing::warn!("Cannot listen for ctrl-c: {}", e);
            }
            tracing::info!("Interrupted");
        }
        _ = terminate => tracing::info!("Terminated"),
        _ = auto_stop => tracing::info!("Auto-stop reached"),
        _ = fatal.notified() => {
            tracing::error!("Capture loop stopped on a fatal error");
            return Shutdown::Fatal;
        }
    }
    Shutdown::Requested
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    logging::init(args.log_dir.as_deref(), &args.log_level);

    let config = load_config(&args)?;
    if args.print_config {
        println!("{}", serde_json::to_string_pretty(&config)?);
        return Ok(());
    }

    let context = if args.simulate {
        tracing::info!("Using simulated camera");
        SdkContext::with_sdk(Arc::new(SimulatedSdk::default()))
    } else {
        SdkContext::asi()
    };
    let manager = Arc::new(
        ConnectionManager::new(Arc::new(context))
            .with_timeouts(config.connection.timeouts())
            .with_settle_delay(config.connection.settle_delay()),
    );
    manager
        .initialize_sdk(&config.sdk_path)
        .context("initializing camera SDK")?;

    let cameras = manager.detect_cameras().context("enumerating cameras")?;
    for camera in &cameras {
        tracing::info!(
            "Camera {}: {} ({}x{}, {})",
            camera.index,
            camera.name,
            camera.max_width,
            camera.max_height,
            if camera.is_color { "color" } else { "mono" }
        );
    }
    if args.list {
        manager.release_sdk();
        return Ok(());
    }
    if cameras.is_empty() {
        manager.release_sdk();
        bail!("no cameras detected");
    }

    let fatal = Arc::new(Notify::new());
    let controller = Arc::new(CaptureController::new(
        Arc::clone(&manager),
        Arc::new(LogObserver {
            fatal: Arc::clone(&fatal),
        }),
        config.capture.clone(),
    ));
    controller
        .start(config.camera_index, config.settings.clone(), config.schedule)
        .context("starting capture")?;

    let shutdown = wait_for_shutdown(args.auto_stop.map(Duration::from_secs), &fatal).await;

    // stop() blocks for up to the join timeout
    let stopping = Arc::clone(&controller);
    let confirmed = tokio::task::spawn_blocking(move || stopping.stop())
        .await
        .context("stopping capture")?;
    if confirmed {
        manager.release_sdk();
    } else {
        tracing::warn!("Capture thread still running, leaving the SDK loaded");
    }

    if shutdown == Shutdown::Fatal {
        bail!("capture stopped after a fatal error ({})", controller.state());
    }
    tracing::info!("Shutdown complete");
    Ok(())
}
