//! Typed configuration from environment variables.
//!
//! Loads once at startup, fails fast on malformed values. Every knob has a
//! default suited to local development.

use std::time::Duration;

use crate::error::{Error, Result};

#[derive(Debug, Clone)]
pub struct Config {
    /// Path to the SQLite database file.
    pub db_path: String,
    /// Number of workers to spawn.
    pub workers: usize,
    /// Global cap on leased + running jobs.
    pub max_in_flight: usize,
    /// Queue visibility timeout / lease duration.
    pub visibility_timeout: Duration,
    /// Per-attempt handler execution bound.
    pub handler_timeout: Duration,
    /// Idle worker poll interval.
    pub poll_interval: Duration,
    /// Default attempt limit for submissions that don't specify one.
    pub default_max_attempts: u32,
    pub log_level: String,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// In local dev, call `dotenvy::dotenv().ok()` before this.
    pub fn from_env() -> Result<Self> {
        let config = Self {
            db_path: std::env::var("EVENTOPS_DB_PATH").unwrap_or_else(|_| "eventops.db".to_string()),
            workers: parsed_var("EVENTOPS_WORKERS", 4)?,
            max_in_flight: parsed_var("EVENTOPS_MAX_IN_FLIGHT", 16)?,
            visibility_timeout: Duration::from_secs(parsed_var(
                "EVENTOPS_VISIBILITY_TIMEOUT_SECS",
                60,
            )?),
            handler_timeout: Duration::from_secs(parsed_var("EVENTOPS_HANDLER_TIMEOUT_SECS", 30)?),
            poll_interval: Duration::from_millis(parsed_var("EVENTOPS_POLL_INTERVAL_MS", 500)?),
            default_max_attempts: parsed_var("EVENTOPS_MAX_ATTEMPTS", 3)?,
            log_level: std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
        };
        config.validate()?;
        Ok(config)
    }

    /// Reject timeout combinations that undermine lease accounting.
    ///
    /// A handler timeout at or above the visibility timeout lets an attempt
    /// outlive its lease, so the queue re-delivers the reference while the
    /// attempt is still running and the attempt gets double-counted.
    pub fn validate(&self) -> Result<()> {
        if self.handler_timeout >= self.visibility_timeout {
            return Err(Error::Config(format!(
                "handler timeout ({:?}) must be below the visibility timeout ({:?})",
                self.handler_timeout, self.visibility_timeout
            )));
        }
        Ok(())
    }
}

fn parsed_var<T: std::str::FromStr>(name: &str, default: T) -> Result<T> {
    match std::env::var(name) {
        Ok(raw) => raw
            .parse()
            .map_err(|_| Error::Config(format!("invalid value for {name}: {raw:?}"))),
        Err(_) => Ok(default),
    }
}
