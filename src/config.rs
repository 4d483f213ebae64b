//! Ambient, process-wide host configuration: the plugin root and the
//! default security policy, loaded from an optional TOML file.
//!
//! This is distinct from the per-plugin JSON documents (`plugin.json`,
//! `plugin-settings.json`, `plugin-registry.json`) the on-disk layout
//! mandates for B/C/A -- those stay JSON because the domain layout names
//! them explicitly. `HostConfig` is the surrounding application's own
//! deployment knob, in the TOML format the rest of this crate's dependency
//! stack already carries for that purpose.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::PluginResult;
use crate::proxy::SecurityPolicy;

/// Process-wide host configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostConfig {
    /// Root directory under which every plugin directory lives.
    pub plugin_root: PathBuf,
    /// Security policy overrides. Omit the table entirely (or any field in
    /// it) to take the recommended defaults from §6.
    #[serde(default)]
    pub security: SecurityPolicyConfig,
}

/// TOML-friendly mirror of `SecurityPolicy`'s fields (durations in whole
/// seconds, `allow_all_config_keys` standing in for the policy's
/// `Option<Vec<String>>`).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SecurityPolicyConfig {
    pub method_timeout_secs: u64,
    pub default_call_limit: u64,
    pub per_method_call_limits: HashMap<String, u64>,
    pub max_result_items: usize,
    pub max_string_length: usize,
    pub allow_all_config_keys: bool,
    pub allowed_config_keys: Vec<String>,
}

impl Default for SecurityPolicyConfig {
    fn default() -> Self {
        let recommended = SecurityPolicy::recommended(PathBuf::new());
        Self {
            method_timeout_secs: recommended.method_timeout.as_secs(),
            default_call_limit: recommended.default_call_limit,
            per_method_call_limits: recommended.per_method_call_limits,
            max_result_items: recommended.max_result_items,
            max_string_length: recommended.max_string_length,
            allow_all_config_keys: recommended.allowed_config_keys.is_none(),
            allowed_config_keys: recommended.allowed_config_keys.unwrap_or_default(),
        }
    }
}

impl SecurityPolicyConfig {
    fn into_policy(self, allowed_plugin_base_path: PathBuf) -> SecurityPolicy {
        SecurityPolicy {
            method_timeout: Duration::from_secs(self.method_timeout_secs),
            default_call_limit: self.default_call_limit,
            per_method_call_limits: self.per_method_call_limits,
            max_result_items: self.max_result_items,
            max_string_length: self.max_string_length,
            allowed_config_keys: if self.allow_all_config_keys {
                None
            } else {
                Some(self.allowed_config_keys)
            },
            allowed_plugin_base_path,
        }
    }
}

impl HostConfig {
    /// Recommended defaults rooted at `plugin_root`.
    pub fn new(plugin_root: impl Into<PathBuf>) -> Self {
        Self {
            plugin_root: plugin_root.into(),
            security: SecurityPolicyConfig::default(),
        }
    }

    /// Load a TOML host config from `path`. A missing file yields
    /// recommended defaults rooted at `plugin_root` rather than an error --
    /// the host config is operator-supplied and optional, unlike the
    /// per-plugin settings documents that C always creates on first read.
    pub fn load_or_default(path: &Path, plugin_root: impl Into<PathBuf>) -> PluginResult<Self> {
        match std::fs::read_to_string(path) {
            Ok(contents) => Ok(toml::from_str(&contents)?),
            Err(e) => {
                tracing::debug!(
                    "no host config at {:?}, using recommended defaults: {}",
                    path,
                    e
                );
                Ok(Self::new(plugin_root))
            }
        }
    }

    /// Persist this configuration as TOML at `path`.
    pub fn save(&self, path: &Path) -> PluginResult<()> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// The effective `SecurityPolicy` for this configuration, with
    /// `allowed_plugin_base_path` pinned to `plugin_root`.
    pub fn security_policy(&self) -> SecurityPolicy {
        self.security.clone().into_policy(self.plugin_root.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_yields_recommended_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config =
            HostConfig::load_or_default(&dir.path().join("host.toml"), dir.path()).unwrap();
        assert_eq!(config.plugin_root, dir.path());
        assert_eq!(config.security.max_result_items, 200);
        assert!(!config.security.allow_all_config_keys);
    }

    #[test]
    fn parses_a_toml_file_overriding_policy_values() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("host.toml");
        std::fs::write(
            &path,
            "plugin_root = \"/tmp\"\n[security]\nmethod_timeout_secs = 5\nmax_result_items = 10\n",
        )
        .unwrap();

        let config = HostConfig::load_or_default(&path, dir.path()).unwrap();
        assert_eq!(config.security.method_timeout_secs, 5);
        assert_eq!(config.security.max_result_items, 10);
    }

    #[test]
    fn round_trips_through_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("host.toml");

        let config = HostConfig::new(dir.path());
        config.save(&path).unwrap();

        let reloaded = HostConfig::load_or_default(&path, dir.path()).unwrap();
        assert_eq!(reloaded.plugin_root, config.plugin_root);
        assert_eq!(
            reloaded.security.max_string_length,
            config.security.max_string_length
        );
    }

    #[test]
    fn security_policy_reflects_overrides() {
        let mut config = HostConfig::new("/plugins");
        config.security.max_result_items = 5;
        let policy = config.security_policy();
        assert_eq!(policy.max_result_items, 5);
        assert_eq!(policy.allowed_plugin_base_path, PathBuf::from("/plugins"));
    }
}
