//! Logging setup for tarn with file output and optional stdout.
//!
//! Logs always go to a file at `warn` level (or higher if requested).
//! Stdout logging is enabled when `TARN_LOG` or `RUST_LOG` is set, or in
//! debug builds.
//!
//! Priority: `TARN_LOG` > `RUST_LOG` > default (`warn` globally, `info` for
//! tarn crates). Default log file: `<data_local_dir>/tarn/logs/tarn-<pid>.log`.

use std::{env, path::PathBuf};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{
    fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer, Registry,
};

const CRATES: &[&str] = &["tarn_buffer", "tarn_linemap", "tarn_sparse"];

/// Returned from [`init`]; must be held alive to ensure log file flushing.
pub struct LogGuard {
    _file_guard: WorkerGuard,
    pub log_file: PathBuf,
}

pub struct LogConfig {
    pub log_file_path: Option<PathBuf>,
}

/// Initialize logging.
///
/// The returned [`LogGuard`] must be held for the lifetime of the program --
/// dropping it flushes and stops the background file writer.
///
/// Safe to call multiple times -- will not crash if logging is already
/// initialized.
pub fn init(config: LogConfig) -> Result<LogGuard, Box<dyn std::error::Error + Send + Sync>> {
    let (log_dir, filename) = resolve_log_path(config.log_file_path);

    std::fs::create_dir_all(&log_dir).ok();

    let file_appender = tracing_appender::rolling::never(&log_dir, &filename);
    let (non_blocking_file, file_guard) = tracing_appender::non_blocking(file_appender);

    let file_layer = fmt::layer()
        .with_writer(non_blocking_file)
        .with_ansi(false)
        .with_filter(file_filter());

    let stdout_enabled =
        env::var("TARN_LOG").is_ok() || env::var("RUST_LOG").is_ok() || cfg!(debug_assertions);

    let stdout_layer = if stdout_enabled {
        Some(fmt::layer().with_filter(filter()))
    } else {
        None
    };

    Registry::default()
        .with(file_layer)
        .with(stdout_layer)
        .try_init()?;

    Ok(LogGuard {
        _file_guard: file_guard,
        log_file: log_dir.join(filename),
    })
}

/// Initialize stdout-only logging for tests.
///
/// Will not crash if called multiple times or if logging is already
/// initialized by another test.
pub fn test() {
    let _ = fmt().with_env_filter(filter()).try_init();
}

fn resolve_log_path(override_path: Option<PathBuf>) -> (PathBuf, String) {
    let filename = format!("tarn-{}.log", std::process::id());

    if let Some(path) = override_path {
        if path.extension().is_some() {
            let dir = path
                .parent()
                .map(|p| p.to_path_buf())
                .unwrap_or_else(|| PathBuf::from("."));
            let name = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or(filename);
            return (dir, name);
        }
        return (path, filename);
    }

    let dir = dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("tarn")
        .join("logs");

    (dir, filename)
}

/// File filter: uses the user-specified level if set, otherwise `warn`.
fn file_filter() -> EnvFilter {
    if env::var("TARN_LOG").is_ok() || env::var("RUST_LOG").is_ok() {
        return filter();
    }
    EnvFilter::new("warn")
}

fn filter() -> EnvFilter {
    if let Ok(tarn_log) = env::var("TARN_LOG") {
        return expand_tarn_log(&tarn_log);
    }

    if let Ok(rust_log) = env::var("RUST_LOG") {
        return EnvFilter::new(rust_log);
    }

    let mut spec = String::from("warn");
    for krate in CRATES {
        spec.push_str(&format!(",{krate}=info"));
    }
    EnvFilter::new(spec)
}

/// Expand bare `TARN_LOG` levels into per-crate filter strings.
///
/// `TARN_LOG=debug` becomes `warn,tarn_buffer=debug,...`, while values that
/// already contain module syntax (`=`, `:` or `,`) are used as-is.
fn expand_tarn_log(tarn_log: &str) -> EnvFilter {
    if tarn_log.contains('=') || tarn_log.contains(':') || tarn_log.contains(',') {
        return EnvFilter::new(tarn_log);
    }

    let mut spec = String::from("warn");
    for krate in CRATES {
        spec.push_str(&format!(",{krate}={tarn_log}"));
    }
    EnvFilter::new(spec)
}
