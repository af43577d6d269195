//! Logging configuration for applications embedding steptrail.
//!
//! # Example
//!
//! ```ignore
//! use steptrail_core::logging::{init_logging, LoggingOptions};
//!
//! init_logging(&LoggingOptions::default()).unwrap();
//! ```

use std::path::PathBuf;

use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::error::{Error, Result};

/// Where and how verbosely to log.
#[derive(Debug, Clone)]
pub struct LoggingOptions {
    /// Default level when `RUST_LOG` is not set (e.g. "info", "debug")
    pub level: String,
    /// Directory for daily-rotated log files; console-only when `None`
    pub directory: Option<PathBuf>,
    /// Prefix for rotated log files
    pub filename_prefix: String,
}

impl Default for LoggingOptions {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            directory: None,
            filename_prefix: "steptrail.log".to_string(),
        }
    }
}

/// Initialize the global tracing subscriber.
///
/// `RUST_LOG` overrides the configured level. With a directory set, logs
/// additionally go to a daily-rotated file without ANSI escapes.
pub fn init_logging(options: &LoggingOptions) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&options.level));
    let console_layer = fmt::layer().with_target(false).compact();
    let registry = tracing_subscriber::registry().with(filter).with(console_layer);

    let init_result = match &options.directory {
        Some(directory) => {
            let file_appender = RollingFileAppender::builder()
                .rotation(Rotation::DAILY)
                .filename_prefix(options.filename_prefix.as_str())
                .build(directory)
                .map_err(|e| Error::internal(format!("Failed to create log appender: {}", e)))?;
            let file_layer = fmt::layer().with_writer(file_appender).with_ansi(false);
            registry.with(file_layer).try_init()
        }
        None => registry.try_init(),
    };

    init_result.map_err(|e| Error::internal(format!("Failed to init tracing: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_logging_with_file_output() {
        let dir = tempfile::tempdir().unwrap();
        let options = LoggingOptions {
            level: "debug".to_string(),
            directory: Some(dir.path().to_path_buf()),
            filename_prefix: "steptrail-test.log".to_string(),
        };
        init_logging(&options).unwrap();
        tracing::info!("logging initialized");

        // the global subscriber can only be claimed once per process
        let err = init_logging(&LoggingOptions::default()).unwrap_err();
        assert!(matches!(err, Error::Internal(_)));
    }
}
