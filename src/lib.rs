//! # pluginhost
//!
//! A plugin host runtime for long-lived applications that ingest
//! third-party code modules, load each in isolation, mediate every call
//! across the trust boundary, keep an on-disk ledger of their integrity
//! and lifecycle, and can safely retract a module at runtime.
//!
//! The core is the Plugin Lifecycle & Isolation Kernel:
//!
//! - **Hasher & Integrity Registry** ([`integrity`]) — content-hash drift
//!   detection across process runs.
//! - **Descriptor Loader** ([`descriptor`]) — parses a plugin's
//!   declarative descriptor, falling back to a probing scan.
//! - **Settings Store & Migrator** ([`settings`]) — per-plugin enable
//!   state and configuration, with schema-driven migration and rollback.
//! - **Isolated Loader** ([`isolation`]) — private-namespace dynamic
//!   loading with deterministic teardown.
//! - **Security Proxy** ([`proxy`]) — the only path from host to plugin;
//!   enforces quotas, timeouts, and sanitization.
//! - **Lifecycle Manager** ([`lifecycle`]) — orchestrates the above and
//!   owns the live set of loaded plugins.
//! - **Safe Deletion Service** ([`deletion`]) — unregister, reclamation
//!   wait, retry-delete with backoff.
//! - **Early-Update Service** ([`update`]) — installs/upgrades plugins
//!   before any plugin code is loaded.
//!
//! Ambient concerns sit alongside the kernel: [`config::HostConfig`] holds
//! the process-wide deployment settings (plugin root, security policy
//! overrides), loaded from an optional TOML file.
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use pluginhost::PluginHost;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let host = PluginHost::new("/var/lib/myapp/plugins");
//!     host.initialize().await;
//!
//!     for mod_record in host.get_all_recent_mods().await {
//!         println!("{} from {}", mod_record.name, mod_record.plugin_source);
//!     }
//!
//!     host.shutdown().await;
//!     Ok(())
//! }
//! ```
//!
//! ## Non-goals
//!
//! The "mod-listing" business logic inside each plugin is opaque to this
//! crate; it only sees the capability contract ([`traits::Plugin`]). A
//! network registry fetcher and archive extractor for installation are
//! external collaborators ([`update::RegistryProvider`],
//! [`update::Installer`]); only their contracts are specified here.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod deletion;
pub mod descriptor;
pub mod error;
pub mod integrity;
pub mod isolation;
pub mod lifecycle;
pub mod proxy;
pub mod settings;
pub mod traits;
pub mod update;
pub mod versioning;

pub use config::{HostConfig, SecurityPolicyConfig};
pub use deletion::DeletionService;
pub use descriptor::{DescriptorLoader, PluginDescriptor};
pub use error::{PluginHostError, PluginResult};
pub use integrity::{IntegrityRecord, IntegrityRegistry, IntegrityStatus};
pub use isolation::{IsolatedLoader, LoaderHandle, NamespacePolicy, Resolution};
pub use lifecycle::{LifecycleManager, LoadedPlugin};
pub use proxy::{ProxyHandle, SecurityPolicy};
pub use settings::{PluginSettings, SettingsStore};
pub use traits::{Mod, Plugin, PluginFactory};
pub use update::{InstallResult, Installer, RegistryEntry, RegistryProvider, UpdateService};

use std::path::{Path, PathBuf};

/// Top-level facade wiring the Lifecycle Manager and Safe Deletion
/// Service together over one plugin root.
pub struct PluginHost {
    lifecycle: LifecycleManager,
    plugin_root: PathBuf,
}

impl PluginHost {
    /// Create a host rooted at `plugin_root` with the recommended
    /// security policy.
    pub fn new(plugin_root: impl Into<PathBuf>) -> Self {
        let plugin_root = plugin_root.into();
        Self {
            lifecycle: LifecycleManager::new(&plugin_root),
            plugin_root,
        }
    }

    /// Build a host with a custom security policy.
    pub fn with_policy(plugin_root: impl Into<PathBuf>, policy: SecurityPolicy) -> Self {
        let plugin_root = plugin_root.into();
        Self {
            lifecycle: LifecycleManager::new(&plugin_root).with_policy(policy),
            plugin_root,
        }
    }

    /// Build a host from an ambient [`HostConfig`] (typically loaded from a
    /// TOML file via [`HostConfig::load_or_default`]).
    pub fn from_config(config: HostConfig) -> Self {
        let policy = config.security_policy();
        Self::with_policy(config.plugin_root, policy)
    }

    /// Discover and load every enabled plugin under the plugin root.
    pub async fn initialize(&self) {
        self.lifecycle.initialize().await;
    }

    /// Persist the enable flag for a plugin; loads or unregisters it as
    /// appropriate.
    pub async fn set_enabled(&self, plugin_id: &str, enabled: bool) -> PluginResult<()> {
        self.lifecycle.set_enabled(plugin_id, enabled).await
    }

    /// Persist configuration for a plugin and, if loaded, re-initialize
    /// it.
    pub async fn update_configuration(
        &self,
        plugin_id: &str,
        configuration: std::collections::HashMap<String, serde_json::Value>,
    ) -> PluginResult<()> {
        self.lifecycle.update_configuration(plugin_id, configuration).await
    }

    /// All currently loaded plugin ids.
    pub fn get_all(&self) -> Vec<String> {
        self.lifecycle.get_all()
    }

    /// Fan out `getRecentMods` across every loaded plugin, tolerating
    /// per-plugin failure and deduplicating by canonical mod URL.
    pub async fn get_all_recent_mods(&self) -> Vec<Mod> {
        self.lifecycle.get_all_recent_mods().await
    }

    /// Unregister and safely delete a plugin's directory: unregister,
    /// wait for reclamation, then retry-delete with backoff.
    pub async fn safe_delete(&self, plugin_id: &str, timeout: Option<std::time::Duration>) -> bool {
        let plugin_directory = self.plugin_root.join(plugin_id);
        DeletionService::new(&self.lifecycle)
            .safe_delete(plugin_id, &plugin_directory, timeout)
            .await
    }

    /// Run the early-update protocol against `registry`/`installer`
    /// before calling [`PluginHost::initialize`].
    pub async fn run_early_update<R, I>(&self, registry: R, installer: I) -> PluginResult<Vec<InstallResult>>
    where
        R: RegistryProvider,
        I: Installer,
    {
        UpdateService::new(registry, installer).run(&self.plugin_root).await
    }

    /// The plugin root this host was constructed with.
    pub fn plugin_root(&self) -> &Path {
        &self.plugin_root
    }

    /// Access the underlying integrity registry.
    pub fn integrity(&self) -> &IntegrityRegistry {
        self.lifecycle.integrity()
    }

    /// Dispose every loaded plugin with a 30-second overall budget.
    /// Idempotent.
    pub async fn shutdown(&self) {
        self.lifecycle.shutdown().await;
    }
}
