//! Logging infrastructure for fasttor-rs.
//!
//! Logging goes through the tracing ecosystem. Output is written either to
//! stdout with ANSI colors or appended to a log file through
//! `tracing-appender`.
//!
//! # Log Levels
//!
//! | Level | Used for |
//! |-------|----------|
//! | [`Debug`](crate::LogLevel::Debug) | Every command sent and reply received |
//! | [`Info`](crate::LogLevel::Info) | Startup details |
//! | [`Notice`](crate::LogLevel::Notice) | Circuit launched, built, lost; stream fallback |
//! | [`Warn`](crate::LogLevel::Warn) | Recoverable trouble during shutdown |
//! | [`Error`](crate::LogLevel::Error) | The failure that ended the run |
//!
//! `RUST_LOG` overrides the configured level.
//!
//! ```rust,no_run
//! use fasttor_rs::{LogLevel, logger};
//!
//! logger::init(LogLevel::Notice, None).unwrap();
//! logger::plog(LogLevel::Notice, "built circuit 12. All Systems Go!");
//! ```

use std::path::Path;
use std::sync::OnceLock;

use tracing::{debug, error, info, warn};
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::EnvFilter;

use crate::config::LogLevel;
use crate::error::{Error, Result};

static LOGGER_INITIALIZED: OnceLock<()> = OnceLock::new();

/// Initialize the logging system.
///
/// Subsequent calls are no-ops.
///
/// * `logfile` - `None` logs to stdout, `Some(path)` appends to that file
///
/// # Errors
///
/// Returns [`Error::Config`] if the log file cannot be opened or a global
/// subscriber is already installed.
pub fn init(level: LogLevel, logfile: Option<&str>) -> Result<()> {
    if LOGGER_INITIALIZED.get().is_some() {
        return Ok(());
    }

    let filter = match level {
        LogLevel::Debug => "debug",
        LogLevel::Info => "info",
        LogLevel::Notice => "info",
        LogLevel::Warn => "warn",
        LogLevel::Error => "error",
    };
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));

    match logfile {
        None => {
            let subscriber = tracing_subscriber::fmt()
                .with_env_filter(env_filter)
                .with_target(false)
                .with_thread_ids(false)
                .with_span_events(FmtSpan::NONE)
                .with_ansi(true)
                .finish();
            tracing::subscriber::set_global_default(subscriber)
                .map_err(|e| Error::Config(format!("failed to set logger: {}", e)))?;
        }
        Some(path) => {
            let appender = file_appender(Path::new(path))?;
            let subscriber = tracing_subscriber::fmt()
                .with_env_filter(env_filter)
                .with_target(false)
                .with_thread_ids(false)
                .with_ansi(false)
                .with_writer(appender)
                .finish();
            tracing::subscriber::set_global_default(subscriber)
                .map_err(|e| Error::Config(format!("failed to set logger: {}", e)))?;
        }
    }

    LOGGER_INITIALIZED.get_or_init(|| ());
    Ok(())
}

fn file_appender(path: &Path) -> Result<RollingFileAppender> {
    let (directory, file_name) = split_log_path(path)?;
    RollingFileAppender::builder()
        .rotation(Rotation::NEVER)
        .filename_prefix(file_name)
        .build(directory)
        .map_err(|e| Error::Config(format!("cannot open log file {}: {}", path.display(), e)))
}

fn split_log_path(path: &Path) -> Result<(&Path, &str)> {
    let file_name = path
        .file_name()
        .and_then(|name| name.to_str())
        .ok_or_else(|| Error::Config(format!("invalid log file path: {}", path.display())))?;
    let directory = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    Ok((directory, file_name))
}

/// Log a message at the specified level.
///
/// | LogLevel | tracing macro |
/// |----------|---------------|
/// | Debug | `debug!` |
/// | Info | `info!` |
/// | Notice | `info!` |
/// | Warn | `warn!` |
/// | Error | `error!` |
///
/// ```rust
/// use fasttor_rs::{LogLevel, logger};
///
/// logger::plog(LogLevel::Notice, "letting tor route to example.com:443");
/// ```
pub fn plog(level: LogLevel, message: &str) {
    match level {
        LogLevel::Debug => debug!("{}", message),
        LogLevel::Info => info!("{}", message),
        LogLevel::Notice => info!("{}", message),
        LogLevel::Warn => warn!("{}", message),
        LogLevel::Error => error!("{}", message),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_log_path() {
        let (dir, name) = split_log_path(Path::new("/var/log/fasttor.log")).unwrap();
        assert_eq!(dir, Path::new("/var/log"));
        assert_eq!(name, "fasttor.log");

        let (dir, name) = split_log_path(Path::new("fasttor.log")).unwrap();
        assert_eq!(dir, Path::new("."));
        assert_eq!(name, "fasttor.log");

        assert!(split_log_path(Path::new("/")).is_err());
    }

    #[test]
    fn test_file_appender_creates_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fasttor.log");
        let _appender = file_appender(&path).unwrap();
        assert!(path.exists());
    }

    #[test]
    fn test_plog_without_subscriber() {
        plog(LogLevel::Debug, "debug");
        plog(LogLevel::Notice, "notice");
        plog(LogLevel::Error, "error");
    }
}
