//! Service configuration.
//!
//! All knobs come from the environment (optionally via a `.env` file loaded
//! in `main`). Anything unset falls back to the defaults below.

use std::path::PathBuf;

/// Top-level service configuration.
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    /// Base directory for stored entries. `None` resolves to
    /// `<home>/.guetzli-data` when the store is opened.
    pub storage_base: Option<PathBuf>,
    /// Server bind address.
    pub bind_address: String,
    /// Server port.
    pub port: u16,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            storage_base: None,
            bind_address: "0.0.0.0".to_string(),
            port: 8080,
        }
    }
}

impl ServiceConfig {
    /// Load the configuration from environment variables.
    ///
    /// Recognized variables: `GUETZLI_STORAGE_BASE`, `API_BIND_ADDRESS`,
    /// `API_PORT`.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            storage_base: std::env::var("GUETZLI_STORAGE_BASE")
                .ok()
                .filter(|v| !v.is_empty())
                .map(PathBuf::from),
            bind_address: std::env::var("API_BIND_ADDRESS").unwrap_or(defaults.bind_address),
            port: std::env::var("API_PORT")
                .ok()
                .and_then(|p| p.parse().ok())
                .unwrap_or(defaults.port),
        }
    }
}
