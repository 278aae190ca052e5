// ferry-logging: one tracing setup shared by every role binary.
//
// Precedence: an explicit log-config file wins, then `-v` counting, then
// RUST_LOG, then warn.

use std::fs::File;
use std::path::Path;
use std::sync::Arc;

use tracing_subscriber::EnvFilter;

#[derive(Debug, thiserror::Error)]
pub enum LoggingError {
    #[error("cannot open log file {path}: {reason}")]
    LogFile { path: String, reason: String },
    #[error("cannot read log config {path}: {reason}")]
    LogConfig { path: String, reason: String },
    #[error("logging already initialized")]
    AlreadyInitialized,
}

/// Install the global subscriber.
///
/// * `verbosity`: `-v` count: 0 = warn, 1 = info, 2+ = debug.
/// * `log_file`: append to a file instead of stdout.
/// * `log_config`: a file holding a tracing filter directive
///   (e.g. `info,server=debug`); overrides `verbosity`.
pub fn init(
    verbosity: u8,
    log_file: Option<&Path>,
    log_config: Option<&Path>,
) -> Result<(), LoggingError> {
    let filter = match log_config {
        Some(path) => {
            let directive =
                std::fs::read_to_string(path).map_err(|e| LoggingError::LogConfig {
                    path: path.display().to_string(),
                    reason: e.to_string(),
                })?;
            EnvFilter::new(directive.trim())
        }
        None => match verbosity {
            0 => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
            1 => EnvFilter::new("info"),
            _ => EnvFilter::new("debug"),
        },
    };

    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    let result = match log_file {
        Some(path) => {
            let file = File::options()
                .create(true)
                .append(true)
                .open(path)
                .map_err(|e| LoggingError::LogFile {
                    path: path.display().to_string(),
                    reason: e.to_string(),
                })?;
            builder.with_writer(Arc::new(file)).with_ansi(false).try_init()
        }
        None => builder.try_init(),
    };
    result.map_err(|_| LoggingError::AlreadyInitialized)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn init_with_log_file_creates_it() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("role.log");
        // First init in the process wins; later calls report as much.
        match init(1, Some(&log), None) {
            Ok(()) => assert!(log.exists()),
            Err(LoggingError::AlreadyInitialized) => {}
            Err(other) => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn missing_log_config_is_an_error() {
        let err = init(0, None, Some(Path::new("/nonexistent/logging.yaml"))).unwrap_err();
        assert!(matches!(err, LoggingError::LogConfig { .. }));
    }

    #[test]
    fn unwritable_log_file_is_an_error() {
        let mut config = tempfile::NamedTempFile::new().unwrap();
        config.write_all(b"info").unwrap();
        let err = init(0, Some(Path::new("/nonexistent/dir/role.log")), None).unwrap_err();
        assert!(matches!(err, LoggingError::LogFile { .. }));
    }
}
