//! # Logging
//!
//! Every component logs through `tracing`. The service owning the process
//! installs the subscriber once with [init]:
//!
//! ```rust,no_run
//! use vmware_desktop_utility::logging::{self, LogConfig};
//!
//! logging::init(&LogConfig::new().with_level("debug")).unwrap();
//! ```
//!
//! Without an explicit level, `RUST_LOG` is honoured and `warn` is the
//! default. `debug` forces `trace` for everything.
use std::{
    fs::{self, OpenOptions},
    io,
    path::PathBuf,
    sync::Arc,
};

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const DEFAULT_LEVEL: &str = "warn";

#[derive(Debug, thiserror::Error)]
pub enum LoggingError {
    #[error("a global tracing subscriber is already installed")]
    AlreadyInitialized,
    #[error("invalid log filter {0}: {1}")]
    Filter(String, String),
    #[error("failed to open log file {0}: {1}")]
    File(PathBuf, io::Error),
}

#[derive(Debug, Clone, Default)]
pub struct LogConfig {
    /// Filter directive, e.g. `info` or `vmware_desktop_utility=debug`
    pub level: Option<String>,
    pub debug: bool,
    /// Log to this file instead of stderr
    pub file: Option<PathBuf>,
    /// Append to `file` instead of truncating it
    pub append: bool,
}

impl LogConfig {
    pub fn new() -> LogConfig {
        LogConfig::default()
    }

    pub fn with_level(mut self, level: &str) -> LogConfig {
        self.level = Some(level.to_string());
        self
    }

    pub fn with_debug(mut self, debug: bool) -> LogConfig {
        self.debug = debug;
        self
    }

    pub fn with_file(mut self, file: PathBuf, append: bool) -> LogConfig {
        self.file = Some(file);
        self.append = append;
        self
    }

    /// Filter resulting from the configuration and the environment
    pub fn filter(&self) -> Result<EnvFilter, LoggingError> {
        if self.debug {
            return Ok(EnvFilter::new("trace"));
        }
        match &self.level {
            Some(level) => EnvFilter::try_new(level)
                .map_err(|e| LoggingError::Filter(level.clone(), e.to_string())),
            None => Ok(EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(DEFAULT_LEVEL))),
        }
    }
}

/// Install the global subscriber
pub fn init(config: &LogConfig) -> Result<(), LoggingError> {
    let filter = config.filter()?;
    let registry = tracing_subscriber::registry().with(filter);

    let installed = match &config.file {
        Some(path) => {
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent).map_err(|e| LoggingError::File(path.clone(), e))?;
            }
            let file = OpenOptions::new()
                .create(true)
                .write(true)
                .append(config.append)
                .truncate(!config.append)
                .open(path)
                .map_err(|e| LoggingError::File(path.clone(), e))?;
            registry
                .with(fmt::layer().with_writer(Arc::new(file)).with_ansi(false))
                .try_init()
        }
        None => registry
            .with(fmt::layer().with_writer(io::stderr))
            .try_init(),
    };
    installed.map_err(|_| LoggingError::AlreadyInitialized)
}
