//! Typed configuration from environment variables.
//!
//! Loads once at startup and fails fast on malformed values. Every variable
//! is optional; unset ones fall back to defaults suitable for local runs.

use std::path::PathBuf;

use crate::error::{Error, Result};

pub const DEFAULT_SERVICE_NAME: &str = "uow-rs";

#[derive(Debug, Clone)]
pub struct Config {
    /// SQLite database file. `None` means a temporary database file.
    pub database_path: Option<PathBuf>,
    pub otel_endpoint: Option<String>,
    pub log_level: String,
    pub service_name: String,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// In local dev, call `dotenvy::dotenv().ok()` before this.
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            database_path: optional_var("UOW_DATABASE_PATH")?.map(PathBuf::from),
            otel_endpoint: optional_var("OTEL_ENDPOINT")?,
            log_level: optional_var("LOG_LEVEL")?.unwrap_or_else(|| "info".to_string()),
            service_name: optional_var("UOW_SERVICE_NAME")?
                .unwrap_or_else(|| DEFAULT_SERVICE_NAME.to_string()),
        })
    }
}

/// Unset is `None`; set but blank is an error.
fn optional_var(name: &str) -> Result<Option<String>> {
    match std::env::var(name) {
        Ok(value) if value.trim().is_empty() => Err(Error::Config(format!(
            "environment variable {name} is set but empty"
        ))),
        Ok(value) => Ok(Some(value)),
        Err(std::env::VarError::NotPresent) => Ok(None),
        Err(std::env::VarError::NotUnicode(_)) => Err(Error::Config(format!(
            "environment variable {name} is not valid unicode"
        ))),
    }
}
