//! Subscriber setup for the headless runner

use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use tracing_subscriber::fmt;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

const LOG_FILE_PREFIX: &str = "sentinel.log";

/// Days of rolled log files to keep
const KEEP_DAYS: i64 = 7;

static LOG_GUARD: OnceLock<tracing_appender::non_blocking::WorkerGuard> = OnceLock::new();

/// Install the global subscriber. `RUST_LOG` overrides `default_level`.
///
/// With a log directory, output also goes to a daily rolling file there and
/// files older than a week are removed.
pub fn init(log_dir: Option<&Path>, default_level: &str) {
    install_panic_hook();

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    let Some(log_dir) = log_dir else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer().with_target(false))
            .init();
        return;
    };

    if let Err(e) = std::fs::create_dir_all(log_dir) {
        eprintln!("Failed to create log directory {}: {}", log_dir.display(), e);
        return init(None, default_level);
    }

    let file_appender = tracing_appender::rolling::daily(log_dir, LOG_FILE_PREFIX);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
    LOG_GUARD.set(guard).ok();

    let console_layer = fmt::layer().with_target(false).with_ansi(true);
    let file_layer = fmt::layer().with_target(true).with_ansi(false).with_writer(non_blocking);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(console_layer)
        .with(file_layer)
        .init();

    tracing::info!("Logging to {}", log_dir.display());
    cleanup_old_logs(log_dir, KEEP_DAYS);
}

fn install_panic_hook() {
    std::panic::set_hook(Box::new(|info| {
        let location = info
            .location()
            .map(|l| format!("{}:{}:{}", l.file(), l.line(), l.column()))
            .unwrap_or_else(|| "unknown".to_string());
        eprintln!("PANIC at {}: {}", location, info);
        tracing::error!("PANIC at {}: {}", location, info);
    }));
}

/// Rolled files are named `sentinel.log.YYYY-MM-DD`
fn rolled_file_date(name: &str) -> Option<chrono::NaiveDate> {
    let date = name.strip_prefix(LOG_FILE_PREFIX)?.strip_prefix('.')?;
    chrono::NaiveDate::parse_from_str(date, "%Y-%m-%d").ok()
}

/// Remove rolled log files older than `keep_days`. Failures are logged only.
fn cleanup_old_logs(log_dir: &Path, keep_days: i64) {
    let cutoff = chrono::Local::now().date_naive() - chrono::Duration::days(keep_days);

    let entries = match std::fs::read_dir(log_dir) {
        Ok(entries) => entries,
        Err(e) => {
            tracing::debug!("Cannot read log directory for cleanup: {}", e);
            return;
        }
    };

    let expired: Vec<PathBuf> = entries
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|path| {
            path.file_name()
                .and_then(|n| n.to_str())
                .and_then(rolled_file_date)
                .is_some_and(|date| date < cutoff)
        })
        .collect();

    for path in expired {
        match std::fs::remove_file(&path) {
            Ok(()) => tracing::debug!("Deleted old log file: {:?}", path),
            Err(e) => tracing::warn!("Failed to delete old log file {:?}: {}", path, e),
        }
    }
}
