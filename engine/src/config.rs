//! Engine configuration.

use crate::{error::Result, Error, RemotePath};
use serde::{Deserialize, Serialize};
use std::env;
use std::fmt;
use std::str::FromStr;

/// Default attribute holding a record's identifier.
pub const DEFAULT_ID_ATTRIBUTE: &str = "id";

/// How an engine keeps its local side in step with the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SyncMode {
    /// Live subscription; local changes are pushed as they happen.
    #[default]
    Continuous,
    /// No subscription; reads and writes happen on explicit request.
    OneShot,
}

impl fmt::Display for SyncMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyncMode::Continuous => write!(f, "continuous"),
            SyncMode::OneShot => write!(f, "one-shot"),
        }
    }
}

impl FromStr for SyncMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "continuous" | "auto" => Ok(SyncMode::Continuous),
            "one-shot" | "oneshot" | "manual" => Ok(SyncMode::OneShot),
            other => Err(Error::InvalidMode(other.to_string())),
        }
    }
}

/// Configuration shared by record and collection engines.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncConfig {
    /// Store url or bare path of the bound node
    pub url: String,
    /// Continuous or one-shot synchronisation
    #[serde(default)]
    pub mode: SyncMode,
    /// Attribute holding record identifiers
    #[serde(default = "default_id_attribute")]
    pub id_attribute: String,
}

fn default_id_attribute() -> String {
    DEFAULT_ID_ATTRIBUTE.to_string()
}

impl SyncConfig {
    /// Create a continuous-mode configuration for `url`.
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            mode: SyncMode::default(),
            id_attribute: default_id_attribute(),
        }
    }

    /// Load configuration from environment variables.
    ///
    /// `TETHER_URL` is required; `TETHER_MODE` and `TETHER_ID_ATTRIBUTE`
    /// are optional.
    pub fn from_env() -> Result<Self> {
        let url = env::var("TETHER_URL").map_err(|_| Error::MissingPath)?;

        let mode = match env::var("TETHER_MODE") {
            Ok(mode) => mode.parse()?,
            Err(_) => SyncMode::default(),
        };

        let id_attribute =
            env::var("TETHER_ID_ATTRIBUTE").unwrap_or_else(|_| default_id_attribute());

        Ok(Self {
            url,
            mode,
            id_attribute,
        })
    }

    /// Sets the sync mode.
    pub fn with_mode(mut self, mode: SyncMode) -> Self {
        self.mode = mode;
        self
    }

    /// Sets the identifier attribute.
    pub fn with_id_attribute(mut self, id_attribute: impl Into<String>) -> Self {
        self.id_attribute = id_attribute.into();
        self
    }

    /// Resolve the configured url into a store path.
    pub fn path(&self) -> Result<RemotePath> {
        if self.url.trim().is_empty() {
            return Err(Error::MissingPath);
        }
        RemotePath::parse(&self.url)
    }
}
