//! Tracing subscriber setup.
//!
//! Everything goes to stderr, filtered by `RUST_LOG` (default `info`). When a
//! log file is given, the same events are also written there without ANSI
//! colours through a non-blocking appender.

use std::path::Path;

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Keeps the file appender's worker alive; drop it last.
pub struct LogGuard {
    _file_guard: Option<tracing_appender::non_blocking::WorkerGuard>,
}

/// Install the global subscriber. Call once from `main`.
pub fn init(log_file: Option<&Path>) -> LogGuard {
    let filter = || EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let file_guard = match log_file.and_then(split_log_path) {
        Some((dir, name)) => {
            let _ = std::fs::create_dir_all(&dir);
            let appender = tracing_appender::rolling::never(dir, name);
            let (non_blocking, guard) = tracing_appender::non_blocking(appender);

            tracing_subscriber::registry()
                .with(filter())
                .with(fmt::layer().with_writer(std::io::stderr))
                .with(fmt::layer().with_writer(non_blocking).with_ansi(false))
                .init();

            Some(guard)
        }
        None => {
            tracing_subscriber::registry()
                .with(filter())
                .with(fmt::layer().with_writer(std::io::stderr))
                .init();

            None
        }
    };

    LogGuard {
        _file_guard: file_guard,
    }
}

fn split_log_path(path: &Path) -> Option<(std::path::PathBuf, std::ffi::OsString)> {
    let name = path.file_name()?.to_os_string();
    let dir = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => std::path::PathBuf::from("."),
    };
    Some((dir, name))
}
