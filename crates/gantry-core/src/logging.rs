//! Logging configuration using tracing

use std::path::PathBuf;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::error::Result;

/// Initialize the logging subsystem
///
/// Logs are written to `~/.local/share/gantry/logs/`.
/// Log level is controlled by the `GANTRY_LOG` environment variable.
///
/// # Examples
/// ```bash
/// GANTRY_LOG=debug cargo test
/// GANTRY_LOG=gantry_engine=trace cargo test
/// ```
pub fn init() -> Result<()> {
    let log_dir = get_log_directory()?;
    std::fs::create_dir_all(&log_dir)?;

    let file_appender = RollingFileAppender::new(Rotation::DAILY, &log_dir, "gantry.log");

    // Default to info, allow override via GANTRY_LOG
    let env_filter =
        EnvFilter::try_from_env("GANTRY_LOG").unwrap_or_else(|_| EnvFilter::new("gantry=info,warn"));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(
            fmt::layer()
                .with_writer(file_appender)
                .with_ansi(false)
                .with_target(true)
                .with_thread_ids(false)
                .with_file(true)
                .with_line_number(true)
                .with_timer(fmt::time::ChronoLocal::new(
                    "%Y-%m-%d %H:%M:%S%.3f".to_string(),
                )),
        )
        .init();

    tracing::info!("Gantry logging initialized");
    tracing::info!("Log directory: {}", log_dir.display());

    Ok(())
}

/// Get the log directory path
fn get_log_directory() -> Result<PathBuf> {
    let base = dirs::data_local_dir().unwrap_or_else(|| PathBuf::from("."));
    Ok(base.join("gantry").join("logs"))
}

/// Get the log file path for the current day
pub fn get_current_log_file() -> Result<PathBuf> {
    let dir = get_log_directory()?;
    Ok(dir.join("gantry.log"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_directory_layout() {
        let dir = get_log_directory().unwrap();
        assert!(dir.ends_with("gantry/logs"), "unexpected log dir: {}", dir.display());
    }

    #[test]
    fn test_current_log_file_lives_in_log_directory() {
        let file = get_current_log_file().unwrap();
        assert!(file.ends_with("gantry/logs/gantry.log"));
        assert_eq!(file.parent(), Some(get_log_directory().unwrap().as_path()));
    }
}
