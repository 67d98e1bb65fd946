//! Logging setup and lightweight timing spans
//!
//! The core logs through the `log` facade. Binaries call [`init_logging`] once
//! to install `env_logger`; `RUST_LOG` takes precedence over the configured
//! level.
//!
//! # Usage
//!
//! ```no_run
//! use meridian::config::LoggingConfig;
//! use meridian::logging::{init_logging, Span};
//!
//! init_logging(&LoggingConfig::default());
//!
//! let span = Span::start("commit");
//! // ... do work ...
//! span.finish();
//! ```

use log::{debug, trace};
use std::time::{Duration, Instant};

use crate::config::LoggingConfig;

/// Installs `env_logger` with the configured default filter
///
/// Returns `false` if a logger was already installed; the existing one is kept.
pub fn init_logging(config: &LoggingConfig) -> bool {
    let installed = env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(config.level.as_str()),
    )
    .format_timestamp_millis()
    .try_init()
    .is_ok();

    if installed {
        debug!("📝 Logging initialized (default filter: {})", config.level);
    }
    installed
}

/// Measures one named stretch of work and logs its duration at `trace`
#[must_use = "a span measures nothing unless finished"]
pub struct Span {
    name: &'static str,
    started: Instant,
}

impl Span {
    pub fn start(name: &'static str) -> Self {
        Self {
            name,
            started: Instant::now(),
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn finish(self) -> Duration {
        let elapsed = self.elapsed();
        trace!("⏱️ {} took {:?}", self.name, elapsed);
        elapsed
    }
}
