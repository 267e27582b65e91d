use std::env;

use log::*;

pub const DEFAULT_HOST: &str = "127.0.0.1";
pub const DEFAULT_PORT: u16 = 8000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub notifier: Option<GotifyConfig>,
}

/// Endpoint and application token of a Gotify server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GotifyConfig {
    pub url: String,
    pub token: String,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid PORT value: {0:?}")]
    InvalidPort(String),
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Builds the config from an arbitrary variable source. Empty values are treated as unset.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let var = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let host = var("HOST").unwrap_or_else(|| DEFAULT_HOST.to_string());
        let port = match var("PORT") {
            Some(port) => port.parse::<u16>().map_err(|_| ConfigError::InvalidPort(port))?,
            None => DEFAULT_PORT,
        };

        let notifier = match (var("GOTIFY_URL"), var("GOTIFY_TOKEN")) {
            (Some(url), Some(token)) => Some(GotifyConfig { url, token }),
            (None, None) => None,
            (url, _) => {
                warn!(
                    "Incomplete Gotify configuration, missing {}; notifications disabled",
                    if url.is_none() { "GOTIFY_URL" } else { "GOTIFY_TOKEN" }
                );
                None
            }
        };

        debug!("Loaded config: host={host}, port={port}, notifier={}", notifier.is_some());
        Ok(Config {
            host,
            port,
            notifier,
        })
    }
}
