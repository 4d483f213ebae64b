//! The plugin capability contract and the exchanged `Mod` record.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use crate::error::PluginResult;

/// The capability every plugin must implement to be loadable.
///
/// This is the "shared symbol set" the isolated loader never privatizes:
/// both the host and every plugin link the same version of this trait, so
/// a plugin's implementation is type-identical to the host's interface
/// rather than merely nominally the same shape.
#[async_trait]
pub trait Plugin: Send + Sync {
    /// Stable identifier, unchanged across versions of the plugin.
    fn plugin_id(&self) -> &str;

    /// Human-readable name.
    fn display_name(&self) -> &str;

    /// Short description.
    fn description(&self) -> &str;

    /// Plugin version (free text).
    fn version(&self) -> &str;

    /// Plugin author.
    fn author(&self) -> &str;

    /// Whether the plugin is enabled. The security proxy never forwards
    /// this from the raw plugin's own notion of "enabled" -- the proxy's
    /// externally visible `enabled` reflects `PluginSettings.enabled`.
    fn enabled(&self) -> bool;

    /// Set the enabled flag on the raw plugin.
    fn set_enabled(&mut self, enabled: bool);

    /// The plugin's own directory, as seen by the plugin.
    fn plugin_directory(&self) -> &str;

    /// Set the plugin directory (mediated by the proxy's path-containment
    /// check before it ever reaches here).
    fn set_plugin_directory(&mut self, directory: String);

    /// Called once after construction; may be called again whenever the
    /// host updates the plugin's configuration.
    async fn initialize(
        &mut self,
        configuration: HashMap<String, serde_json::Value>,
    ) -> PluginResult<()>;

    /// Produce the plugin's current list of recent mods. Must be finite
    /// and is not restartable; may return an empty list.
    async fn get_recent_mods(&mut self) -> PluginResult<Vec<Mod>>;

    /// Release any resources held by the plugin.
    async fn dispose(&mut self);

    /// Downcast support for embedders that need the concrete type back.
    fn as_any(&self) -> &dyn Any;

    /// Mutable downcast support.
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

/// A mod-listing record exchanged between a plugin and the host.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Mod {
    pub name: String,
    pub publisher: String,
    #[serde(rename = "type")]
    pub mod_type: String,
    pub version: String,
    pub mod_url: String,
    pub download_url: String,
    pub image_url: String,
    pub upload_date: Option<DateTime<Utc>>,
    pub file_size: Option<u64>,
    pub plugin_source: String,
    pub tags: Vec<String>,
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
}

/// Factory that produces a `Plugin` instance from the injected context.
///
/// This is the Rust-native rendition of the spec's reflection-driven
/// constructor enumeration: rather than the host inspecting the plugin
/// type's constructors, the plugin's factory is handed an
/// `InjectionContext` and picks out what it needs.
pub trait PluginFactory: Send + Sync {
    /// Construct a plugin instance using the supplied injection context.
    fn create(&self, ctx: &InjectionContext) -> PluginResult<Box<dyn Plugin>>;
}

/// Type alias for the plugin entry point every loadable `cdylib` exports.
pub type PluginCreate = unsafe fn() -> *mut dyn PluginFactory;

/// A no-op logger handed to plugins that declare a logger-shaped
/// constructor parameter.
#[derive(Debug, Clone, Default)]
pub struct NoopLogger;

impl NoopLogger {
    pub fn log(&self, _level: &str, _message: &str) {}
}

/// A minimal HTTP client descriptor injected into plugins that declare an
/// HTTP-client-shaped constructor parameter.
#[derive(Debug, Clone)]
pub struct InjectedHttpClient {
    pub timeout: Duration,
    pub user_agent: String,
}

impl Default for InjectedHttpClient {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(5 * 60),
            user_agent: "pluginhost-runtime/1.0".to_string(),
        }
    }
}

/// A declared constructor parameter a plugin's descriptor may list so the
/// loader knows what to inject and under what name.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParamHint {
    pub name: String,
    pub type_hint: ParamTypeHint,
    #[serde(default)]
    pub default: Option<serde_json::Value>,
}

/// The recognized shapes a constructor parameter can declare.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParamTypeHint {
    Logger,
    HttpClient,
    StringPath,
    StringOther,
    Duration,
    Value,
    Optional,
}

/// Everything the isolated loader makes available for constructor
/// injection, built once per load.
#[derive(Clone)]
pub struct InjectionContext {
    pub logger: NoopLogger,
    pub http_client: InjectedHttpClient,
    pub plugin_directory: PathBuf,
    pub default_duration: Duration,
}

impl InjectionContext {
    /// Build the standard injection context for one plugin load.
    pub fn new(plugin_directory: PathBuf) -> Self {
        Self {
            logger: NoopLogger,
            http_client: InjectedHttpClient::default(),
            plugin_directory,
            default_duration: Duration::from_secs(30 * 60),
        }
    }

    /// Resolve a single declared parameter to the JSON value that should be
    /// injected, following the same rules the spec lists for the
    /// reflection-driven constructor scan: logger-shaped -> no-op logger;
    /// http client -> timeout+UA client; `directory|path`-named string ->
    /// plugin directory; other strings -> empty string; duration -> 30
    /// minute default; value type -> zero value; optional-with-default ->
    /// default; else -> null.
    pub fn resolve(&self, hint: &ParamHint) -> serde_json::Value {
        match hint.type_hint {
            ParamTypeHint::Logger => serde_json::json!("noop-logger"),
            ParamTypeHint::HttpClient => serde_json::json!({
                "timeout_secs": self.http_client.timeout.as_secs(),
                "user_agent": self.http_client.user_agent,
            }),
            ParamTypeHint::StringPath => {
                serde_json::json!(self.plugin_directory.to_string_lossy())
            }
            ParamTypeHint::StringOther => serde_json::json!(""),
            ParamTypeHint::Duration => serde_json::json!(self.default_duration.as_secs()),
            ParamTypeHint::Value => serde_json::json!(0),
            ParamTypeHint::Optional => hint.default.clone().unwrap_or(serde_json::Value::Null),
        }
    }

    /// Resolve every declared parameter in order.
    pub fn resolve_all(&self, hints: &[ParamHint]) -> Vec<serde_json::Value> {
        hints.iter().map(|h| self.resolve(h)).collect()
    }
}

/// Parameter name heuristic used when a hint's name looks like a path,
/// matching the spec's `/directory|path/i` rule.
pub fn looks_like_path_param(name: &str) -> bool {
    let lower = name.to_ascii_lowercase();
    lower.contains("directory") || lower.contains("path")
}

/// In-process test doubles for the `Plugin` capability, used by other
/// modules' test suites to exercise the proxy/lifecycle without a real
/// compiled code object.
#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::Arc;
    use std::time::Duration as StdDuration;

    /// A minimal `Plugin` implementation: returns a fixed list of mods,
    /// optionally after sleeping, and records the configuration it was
    /// last initialized with.
    pub struct StubPlugin {
        id: String,
        enabled: bool,
        directory: String,
        mods: Vec<Mod>,
        sleep_before_mods: Option<StdDuration>,
        pub received_configuration: Arc<Mutex<Option<HashMap<String, serde_json::Value>>>>,
    }

    impl StubPlugin {
        pub fn new(id: impl Into<String>) -> Self {
            Self {
                id: id.into(),
                enabled: false,
                directory: String::new(),
                mods: Vec::new(),
                sleep_before_mods: None,
                received_configuration: Arc::new(Mutex::new(None)),
            }
        }

        pub fn with_mods(mut self, mods: Vec<Mod>) -> Self {
            self.mods = mods;
            self
        }

        pub fn with_sleep(mut self, duration: StdDuration) -> Self {
            self.sleep_before_mods = Some(duration);
            self
        }
    }

    #[async_trait]
    impl Plugin for StubPlugin {
        fn plugin_id(&self) -> &str {
            &self.id
        }

        fn display_name(&self) -> &str {
            &self.id
        }

        fn description(&self) -> &str {
            ""
        }

        fn version(&self) -> &str {
            "1.0.0"
        }

        fn author(&self) -> &str {
            ""
        }

        fn enabled(&self) -> bool {
            self.enabled
        }

        fn set_enabled(&mut self, enabled: bool) {
            self.enabled = enabled;
        }

        fn plugin_directory(&self) -> &str {
            &self.directory
        }

        fn set_plugin_directory(&mut self, directory: String) {
            self.directory = directory;
        }

        async fn initialize(
            &mut self,
            configuration: HashMap<String, serde_json::Value>,
        ) -> PluginResult<()> {
            *self.received_configuration.lock() = Some(configuration);
            Ok(())
        }

        async fn get_recent_mods(&mut self) -> PluginResult<Vec<Mod>> {
            if let Some(duration) = self.sleep_before_mods {
                tokio::time::sleep(duration).await;
            }
            Ok(self.mods.clone())
        }

        async fn dispose(&mut self) {}

        fn as_any(&self) -> &dyn Any {
            self
        }

        fn as_any_mut(&mut self) -> &mut dyn Any {
            self
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolves_path_param_to_plugin_directory() {
        let ctx = InjectionContext::new(PathBuf::from("/plugins/example"));
        let hint = ParamHint {
            name: "pluginDirectory".to_string(),
            type_hint: ParamTypeHint::StringPath,
            default: None,
        };
        assert_eq!(ctx.resolve(&hint), serde_json::json!("/plugins/example"));
    }

    #[test]
    fn resolves_optional_to_its_default() {
        let ctx = InjectionContext::new(PathBuf::from("/plugins/example"));
        let hint = ParamHint {
            name: "retries".to_string(),
            type_hint: ParamTypeHint::Optional,
            default: Some(serde_json::json!(3)),
        };
        assert_eq!(ctx.resolve(&hint), serde_json::json!(3));
    }

    #[test]
    fn path_name_heuristic() {
        assert!(looks_like_path_param("pluginDirectory"));
        assert!(looks_like_path_param("basePath"));
        assert!(!looks_like_path_param("apiKey"));
    }
}
