//! Error taxonomy for the plugin host.

use std::path::PathBuf;
use thiserror::Error;

/// Result type used throughout the plugin host.
pub type PluginResult<T> = Result<T, PluginHostError>;

/// Every error the kernel can produce, grouped by the boundary that raises it.
///
/// Propagation policy: errors inside fan-out queries are swallowed per
/// plugin and replaced with empty lists; errors inside lifecycle mutations
/// are surfaced to the caller; shutdown swallows every error and logs it.
#[derive(Debug, Error)]
pub enum PluginHostError {
    /// The plugin's code object is missing, modified, corrupted, or at an
    /// unexpected version relative to the integrity registry.
    #[error("integrity check failed for plugin '{id}': {status}")]
    Integrity { id: String, status: String },

    /// The plugin directory's descriptor is malformed or incomplete.
    #[error("descriptor error for plugin directory {path:?}: {reason}")]
    Descriptor { path: PathBuf, reason: String },

    /// Settings migration failed; the settings file was left untouched.
    #[error("migration failed for plugin '{id}' on property '{property}': {reason}")]
    Migration {
        id: String,
        property: String,
        reason: String,
    },

    /// The isolated loader could not produce a viable plugin instance.
    #[error("load failed for plugin '{id}': {reason}")]
    Load { id: String, reason: String },

    /// A mediated call was rejected by the security proxy.
    #[error("security error for plugin '{id}': {reason}")]
    Security { id: String, reason: String },

    /// The plugin itself raised an error inside a mediated call.
    #[error("plugin '{id}' raised an error in '{method}': {reason}")]
    Plugin {
        id: String,
        method: String,
        reason: String,
    },

    /// A plugin directory could not be reclaimed within the retry budget.
    #[error("could not delete plugin directory {path:?} within the retry budget")]
    Deletion { path: PathBuf },

    /// The plugin was not found in the live set or the registry.
    #[error("plugin '{id}' not found")]
    NotFound { id: String },

    /// The plugin is already registered.
    #[error("plugin '{id}' is already registered")]
    AlreadyRegistered { id: String },

    /// An early-update operation against the external registry/installer
    /// collaborators failed.
    #[error("update error for plugin '{id}': {reason}")]
    Update { id: String, reason: String },

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON (de)serialization error.
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    /// TOML (de)serialization error for the host configuration file.
    #[error("host configuration error: {0}")]
    Toml(String),

    /// A plugin-boundary call exceeded its wall-clock timeout.
    #[error("operation timed out for plugin '{id}'")]
    Timeout { id: String },

    /// Generic/catch-all error for conditions not covered above.
    #[error("{0}")]
    Generic(String),
}

impl From<toml::de::Error> for PluginHostError {
    fn from(err: toml::de::Error) -> Self {
        PluginHostError::Toml(err.to_string())
    }
}

impl From<toml::ser::Error> for PluginHostError {
    fn from(err: toml::ser::Error) -> Self {
        PluginHostError::Toml(err.to_string())
    }
}

impl From<libloading::Error> for PluginHostError {
    fn from(err: libloading::Error) -> Self {
        PluginHostError::Load {
            id: "unknown".to_string(),
            reason: err.to_string(),
        }
    }
}

impl From<reqwest::Error> for PluginHostError {
    fn from(err: reqwest::Error) -> Self {
        PluginHostError::Update {
            id: "registry".to_string(),
            reason: err.to_string(),
        }
    }
}

impl From<url::ParseError> for PluginHostError {
    fn from(err: url::ParseError) -> Self {
        PluginHostError::Generic(format!("URL parse error: {err}"))
    }
}
