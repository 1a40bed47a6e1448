//! Client configuration.

use crate::ReconnectPolicy;
use quarry_engine::Schema;
use serde::{Deserialize, Serialize};
use std::env;

/// When a successful write is reflected in the local collection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApplyWrites {
    /// Apply every committed write as soon as the backend confirms it.
    #[default]
    OnConfirm,
    /// Apply confirmed inserts at once; updates and deletes wait for their
    /// change event.
    InsertsOnly,
}

/// Settings for a live table.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClientConfig {
    #[serde(default)]
    pub apply_writes: ApplyWrites,

    #[serde(default)]
    pub reconnect: ReconnectPolicy,

    /// Validate writes locally before sending them.
    #[serde(skip)]
    pub schema: Option<Schema>,
}

impl ClientConfig {
    /// Validate writes against the back-office table schemas.
    pub fn back_office() -> Self {
        Self {
            schema: Some(Schema::back_office()),
            ..Self::default()
        }
    }

    pub fn with_apply_writes(mut self, apply_writes: ApplyWrites) -> Self {
        self.apply_writes = apply_writes;
        self
    }

    pub fn with_reconnect(mut self, reconnect: ReconnectPolicy) -> Self {
        self.reconnect = reconnect;
        self
    }
}

/// Where the HTTP backend finds the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    /// Base URL, e.g. `http://localhost:3000`
    pub url: String,
    /// Bearer token sent with every request
    pub token: Option<String>,
}

impl ServerConfig {
    /// Load from `QUARRY_URL` and `QUARRY_TOKEN`.
    pub fn from_env() -> Result<Self, ConfigError> {
        let url = env::var("QUARRY_URL").map_err(|_| ConfigError::MissingUrl)?;
        if !(url.starts_with("http://") || url.starts_with("https://")) {
            return Err(ConfigError::InvalidUrl(url));
        }
        let token = env::var("QUARRY_TOKEN").ok().filter(|t| !t.is_empty());

        Ok(Self {
            url: url.trim_end_matches('/').to_string(),
            token,
        })
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("QUARRY_URL environment variable is required")]
    MissingUrl,

    #[error("Invalid QUARRY_URL value: {0}")]
    InvalidUrl(String),
}
