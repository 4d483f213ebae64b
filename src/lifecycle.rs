//! Lifecycle Manager: orchestrates discovery, integrity checking, settings,
//! isolated loading, and security wrapping; owns the live set of loaded
//! plugins.

use dashmap::DashMap;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

use crate::descriptor::{DescriptorLoader, PluginDescriptor};
use crate::error::{PluginHostError, PluginResult};
use crate::integrity::{IntegrityRegistry, IntegrityStatus};
use crate::isolation::IsolatedLoader;
use crate::proxy::{ProxyHandle, SecurityPolicy};
use crate::settings::SettingsStore;
use crate::traits::Mod;

/// A plugin that has completed the load protocol and is in the live set.
///
/// `proxy` is `Arc`-wrapped so a reader can clone the handle out of a
/// `DashMap` entry and drop the entry's guard before awaiting a mediated
/// call; holding the guard itself across an `.await` would block any
/// concurrent `register`/`unregister` on the same shard for the duration
/// of the call.
pub struct LoadedPlugin {
    pub descriptor: PluginDescriptor,
    pub plugin_directory: PathBuf,
    pub proxy: Arc<ProxyHandle>,
}

/// Orchestrates the full plugin lifecycle. Owns the live set (a
/// `DashMap` keyed by plugin id) and serializes registration and
/// unregistration through a single mutex, per invariant I6; reads never
/// take that mutex.
pub struct LifecycleManager {
    plugin_root: PathBuf,
    live_set: Arc<DashMap<String, LoadedPlugin>>,
    registration_lock: Mutex<()>,
    integrity: Arc<IntegrityRegistry>,
    descriptors: DescriptorLoader,
    settings: SettingsStore,
    loader: IsolatedLoader,
    policy: Arc<SecurityPolicy>,
}

impl LifecycleManager {
    pub fn new(plugin_root: impl Into<PathBuf>) -> Self {
        let plugin_root = plugin_root.into();
        let policy = Arc::new(SecurityPolicy::recommended(plugin_root.clone()));
        Self {
            integrity: Arc::new(IntegrityRegistry::new(&plugin_root)),
            plugin_root,
            live_set: Arc::new(DashMap::new()),
            registration_lock: Mutex::new(()),
            descriptors: DescriptorLoader::new(),
            settings: SettingsStore::new(),
            loader: IsolatedLoader::new(),
            policy,
        }
    }

    /// Use a non-default security policy (e.g. for tests exercising
    /// tighter quotas).
    pub fn with_policy(mut self, policy: SecurityPolicy) -> Self {
        self.policy = Arc::new(policy);
        self
    }

    fn plugin_directories(&self) -> Vec<PathBuf> {
        let Ok(entries) = std::fs::read_dir(&self.plugin_root) else {
            return vec![];
        };

        entries
            .flatten()
            .map(|e| e.path())
            .filter(|p| p.is_dir())
            .collect()
    }

    /// Discover, integrity-check, and load every enabled plugin under the
    /// plugin root.
    pub async fn initialize(&self) {
        for directory in self.plugin_directories() {
            let Some(descriptor) = self.descriptors.load(&directory) else {
                continue;
            };

            let settings = match self.settings.load(&directory, &descriptor) {
                Ok(s) => s,
                Err(e) => {
                    tracing::warn!(
                        "lifecycle: settings load failed for '{}': {}",
                        descriptor.plugin_id,
                        e
                    );
                    continue;
                }
            };

            if !settings.enabled {
                continue;
            }

            if let Err(e) = self.load_one(descriptor, directory, settings.configuration).await {
                tracing::warn!("lifecycle: failed to load plugin: {}", e);
            }
        }
    }

    /// The six-step load protocol for one plugin. Integrity/settings/
    /// load/wrap/initialize failures are logged and recorded; nothing
    /// propagates beyond the top-level error return.
    async fn load_one(
        &self,
        descriptor: PluginDescriptor,
        plugin_directory: PathBuf,
        configuration: std::collections::HashMap<String, serde_json::Value>,
    ) -> PluginResult<()> {
        let code_object_path = descriptor.code_object_path(&plugin_directory);
        self.integrity.register(&descriptor, &code_object_path);

        let status = self.integrity.verify(&descriptor.plugin_id);
        if matches!(status, IntegrityStatus::Missing | IntegrityStatus::Corrupted) {
            let err = PluginHostError::Integrity {
                id: descriptor.plugin_id.clone(),
                status: format!("{:?}", status),
            };
            self.integrity
                .record_load(&descriptor.plugin_id, false, Some(err.to_string()), None);
            return Err(err);
        }

        let start = std::time::Instant::now();
        let handle = match self.loader.load(
            &code_object_path,
            &descriptor.main_type_name,
            &plugin_directory,
        ) {
            Ok(h) => h,
            Err(e) => {
                self.integrity
                    .record_load(&descriptor.plugin_id, false, Some(e.to_string()), None);
                return Err(e);
            }
        };

        let proxy = Arc::new(ProxyHandle::new(descriptor.plugin_id.clone(), handle, self.policy.clone()));

        if let Err(e) = proxy.initialize(configuration).await {
            proxy.dispose().await;
            self.integrity
                .record_load(&descriptor.plugin_id, false, Some(e.to_string()), None);
            return Err(e);
        }

        let runtime_ms = start.elapsed().as_millis() as u64;
        self.integrity
            .record_load(&descriptor.plugin_id, true, None, Some(runtime_ms));

        self.register(LoadedPlugin {
            descriptor,
            plugin_directory,
            proxy,
        })
        .await?;

        Ok(())
    }

    /// Insert a loaded plugin into the live set. Serialized by the
    /// registration mutex; at most one live instance per id (I1).
    pub async fn register(&self, loaded: LoadedPlugin) -> PluginResult<()> {
        let _guard = self.registration_lock.lock().await;

        if self.live_set.contains_key(&loaded.descriptor.plugin_id) {
            return Err(PluginHostError::AlreadyRegistered {
                id: loaded.descriptor.plugin_id.clone(),
            });
        }

        self.live_set.insert(loaded.descriptor.plugin_id.clone(), loaded);
        Ok(())
    }

    /// Unregister (and dispose) a plugin. Idempotent: unregistering a
    /// plugin not in the live set is not an error.
    pub async fn unregister(&self, plugin_id: &str) -> PluginResult<()> {
        let _guard = self.registration_lock.lock().await;

        let Some((_, loaded)) = self.live_set.remove(plugin_id) else {
            return Ok(());
        };

        loaded.proxy.dispose().await;
        let weak = loaded.proxy.unload().await;
        IsolatedLoader::wait_for_unload(weak, Duration::from_secs(10)).await;

        Ok(())
    }

    /// Persist the enable flag; load if newly enabled, unregister if
    /// newly disabled.
    pub async fn set_enabled(&self, plugin_id: &str, enabled: bool) -> PluginResult<()> {
        let plugin_directory = self.plugin_root.join(plugin_id);
        let descriptor = self
            .descriptors
            .load(&plugin_directory)
            .ok_or_else(|| PluginHostError::NotFound {
                id: plugin_id.to_string(),
            })?;

        let settings = self.settings.set_enabled(&plugin_directory, &descriptor, enabled)?;

        if enabled {
            if !self.live_set.contains_key(plugin_id) {
                self.load_one(descriptor, plugin_directory, settings.configuration)
                    .await?;
            }
        } else {
            self.unregister(plugin_id).await?;
        }

        Ok(())
    }

    /// Persist configuration and, if the plugin is loaded, re-initialize
    /// it with the new configuration.
    pub async fn update_configuration(
        &self,
        plugin_id: &str,
        configuration: std::collections::HashMap<String, serde_json::Value>,
    ) -> PluginResult<()> {
        let plugin_directory = self.plugin_root.join(plugin_id);
        let descriptor = self
            .descriptors
            .load(&plugin_directory)
            .ok_or_else(|| PluginHostError::NotFound {
                id: plugin_id.to_string(),
            })?;

        self.settings
            .update_configuration(&plugin_directory, &descriptor, configuration.clone())?;

        // Clone the handle out and drop the map guard before awaiting: holding
        // a `DashMap` `Ref` across `.await` would block a concurrent
        // `register`/`unregister` on this shard for the duration of the call.
        let proxy = self.live_set.get(plugin_id).map(|entry| entry.proxy.clone());
        if let Some(proxy) = proxy {
            proxy.initialize(configuration).await?;
        }

        Ok(())
    }

    /// All loaded plugin ids.
    pub fn get_all(&self) -> Vec<String> {
        self.live_set.iter().map(|e| e.key().clone()).collect()
    }

    /// All loaded plugins whose settings mark them enabled (i.e. every
    /// entry in the live set, since only enabled plugins are loaded).
    pub fn get_enabled(&self) -> Vec<String> {
        self.get_all()
    }

    /// True if `plugin_id` is currently loaded.
    pub fn contains(&self, plugin_id: &str) -> bool {
        self.live_set.contains_key(plugin_id)
    }

    /// Fan out `getRecentMods` to every loaded plugin concurrently,
    /// tagging results with their source plugin id, deduplicating by
    /// canonical mod URL (first occurrence wins), and tolerating
    /// per-plugin failure by contributing an empty list.
    pub async fn get_all_recent_mods(&self) -> Vec<Mod> {
        let ids = self.get_all();

        let futures = ids.into_iter().map(|id| {
            // Clone the proxy handle out and drop the map guard before
            // awaiting: holding a `DashMap` `Ref` across `.await` would block
            // a concurrent `register`/`unregister` on this shard for the
            // duration of the call (up to the method timeout).
            let proxy = self.live_set.get(&id).map(|entry| entry.proxy.clone());
            async move {
                let Some(proxy) = proxy else {
                    return vec![];
                };
                match proxy.get_recent_mods().await {
                    Ok(mut mods) => {
                        for m in &mut mods {
                            m.plugin_source = id.clone();
                        }
                        mods
                    }
                    Err(e) => {
                        tracing::warn!("fan-out: plugin '{}' failed getRecentMods: {}", id, e);
                        vec![]
                    }
                }
            }
        });

        let results = futures::future::join_all(futures).await;

        let mut seen: HashSet<String> = HashSet::new();
        let mut deduped = Vec::new();
        for mods in results {
            for m in mods {
                let key = Self::canonical_mod_key(&m);
                if seen.insert(key) {
                    deduped.push(m);
                }
            }
        }

        deduped
    }

    /// The dedup key for `get_all_recent_mods`: a mod's canonical URL
    /// (scheme + host + path, query and fragment stripped, trailing slash
    /// normalized) when it has a parseable `mod_url`, so two records that
    /// differ only by e.g. an affiliate query string collapse to one;
    /// falls back to `plugin_source::name` when the URL is empty or
    /// unparseable.
    fn canonical_mod_key(m: &Mod) -> String {
        if m.mod_url.is_empty() {
            return format!("{}::{}", m.plugin_source, m.name);
        }

        let Ok(parsed) = url::Url::parse(&m.mod_url) else {
            return format!("{}::{}", m.plugin_source, m.name);
        };

        let path = parsed.path();
        let normalized_path = if path.len() > 1 {
            path.trim_end_matches('/')
        } else {
            path
        };

        match parsed.port() {
            Some(port) => format!(
                "{}://{}:{}{}",
                parsed.scheme(),
                parsed.host_str().unwrap_or(""),
                port,
                normalized_path
            ),
            None => format!(
                "{}://{}{}",
                parsed.scheme(),
                parsed.host_str().unwrap_or(""),
                normalized_path
            ),
        }
    }

    /// Dispose every loaded plugin with an overall 30-second budget.
    /// Idempotent; errors are swallowed and logged.
    pub async fn shutdown(&self) {
        let ids = self.get_all();
        let shutdown = async {
            for id in ids {
                if let Err(e) = self.unregister(&id).await {
                    tracing::warn!("shutdown: failed to unregister '{}': {}", id, e);
                }
            }
        };

        if tokio::time::timeout(Duration::from_secs(30), shutdown)
            .await
            .is_err()
        {
            tracing::warn!("shutdown: exceeded the 30-second overall budget");
        }
    }

    pub fn plugin_root(&self) -> &Path {
        &self.plugin_root
    }

    pub fn integrity(&self) -> &IntegrityRegistry {
        &self.integrity
    }
}
