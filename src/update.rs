//! Early-Update Service: runs before the Lifecycle Manager touches any
//! plugin code, installing new plugins and upgrading outdated ones while
//! preserving each plugin's enable state and configuration.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::descriptor::DescriptorLoader;
use crate::error::PluginResult;
use crate::settings::{PluginSettings, SettingsStore};
use crate::versioning::is_newer;

/// One entry in the external registry's canonical plugin metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryEntry {
    pub id: String,
    pub name: String,
    pub version: String,
    pub download_url: String,
}

/// The outcome of an install/upgrade attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstallResult {
    pub success: bool,
    pub installed_path: Option<PathBuf>,
    pub error: Option<String>,
}

/// External collaborator: lists the canonical plugin catalog. Its
/// implementation (an HTTP-backed registry, a local mirror, ...) is out
/// of scope for the kernel; only the contract is specified.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait RegistryProvider: Send + Sync {
    async fn list_available(&self) -> PluginResult<Vec<RegistryEntry>>;
}

/// External collaborator: downloads and installs/replaces a plugin's
/// files into the plugin root. Its implementation (an archive extractor,
/// a package manager, ...) is out of scope for the kernel.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Installer: Send + Sync {
    async fn download_and_install(
        &self,
        entry: &RegistryEntry,
        plugin_root: &Path,
    ) -> PluginResult<InstallResult>;
}

/// A thin `reqwest`-backed `RegistryProvider`, demonstrating the
/// contract rather than shipping a full implementation.
pub struct HttpRegistryProvider {
    client: reqwest::Client,
    registry_url: url::Url,
}

impl HttpRegistryProvider {
    pub fn new(registry_url: url::Url) -> Self {
        Self {
            client: reqwest::Client::new(),
            registry_url,
        }
    }
}

#[async_trait]
impl RegistryProvider for HttpRegistryProvider {
    async fn list_available(&self) -> PluginResult<Vec<RegistryEntry>> {
        let entries = self
            .client
            .get(self.registry_url.clone())
            .send()
            .await?
            .json::<Vec<RegistryEntry>>()
            .await?;
        Ok(entries)
    }
}

/// Runs the install-new / update-existing protocol against one plugin
/// root.
pub struct UpdateService<R, I> {
    registry: R,
    installer: I,
    descriptors: DescriptorLoader,
    settings: SettingsStore,
}

impl<R, I> UpdateService<R, I>
where
    R: RegistryProvider,
    I: Installer,
{
    pub fn new(registry: R, installer: I) -> Self {
        Self {
            registry,
            installer,
            descriptors: DescriptorLoader::new(),
            settings: SettingsStore::new(),
        }
    }

    fn installed_plugin_ids(&self, plugin_root: &Path) -> HashMap<String, String> {
        let Ok(entries) = std::fs::read_dir(plugin_root) else {
            return HashMap::new();
        };

        entries
            .flatten()
            .map(|e| e.path())
            .filter(|p| p.is_dir())
            .filter_map(|dir| {
                let descriptor = self.descriptors.load(&dir)?;
                Some((descriptor.plugin_id, descriptor.version))
            })
            .collect()
    }

    /// Run the full early-update protocol: install any registry entry not
    /// yet present, then upgrade any installed plugin whose registry
    /// version is newer, preserving `enabled`/`configuration`.
    pub async fn run(&self, plugin_root: &Path) -> PluginResult<Vec<InstallResult>> {
        let installed = self.installed_plugin_ids(plugin_root);
        let catalog = self.registry.list_available().await?;

        let mut results = Vec::new();

        for entry in &catalog {
            match installed.get(&entry.id) {
                None => {
                    tracing::info!("update: installing new plugin '{}'", entry.id);
                    let result = self.installer.download_and_install(entry, plugin_root).await?;
                    results.push(result);
                }
                Some(installed_version) => {
                    if is_newer(&entry.version, installed_version) {
                        tracing::info!(
                            "update: upgrading plugin '{}' from {} to {}",
                            entry.id,
                            installed_version,
                            entry.version
                        );
                        let result = self.upgrade_existing(entry, plugin_root).await?;
                        results.push(result);
                    }
                }
            }
        }

        Ok(results)
    }

    async fn upgrade_existing(
        &self,
        entry: &RegistryEntry,
        plugin_root: &Path,
    ) -> PluginResult<InstallResult> {
        let plugin_directory = plugin_root.join(&entry.id);

        let previous_settings = self
            .descriptors
            .load(&plugin_directory)
            .and_then(|descriptor| self.settings.load(&plugin_directory, &descriptor).ok());

        let result = self
            .installer
            .download_and_install(entry, plugin_root)
            .await?;

        if result.success {
            if let Some(previous) = previous_settings {
                self.restore_settings_after_upgrade(&plugin_directory, &entry.version, previous)?;
            }
        }

        Ok(result)
    }

    fn restore_settings_after_upgrade(
        &self,
        plugin_directory: &Path,
        new_version: &str,
        mut previous: PluginSettings,
    ) -> PluginResult<()> {
        previous.version = new_version.to_string();
        previous.schema_version = new_version.to_string();
        previous.last_updated = chrono::Utc::now();
        self.settings.save(plugin_directory, &previous)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Writes a fresh plugin directory for `entry` into `plugin_root`, the
    /// way a real `Installer` would after downloading and extracting an
    /// archive.
    fn install_fixture(entry: &RegistryEntry, plugin_root: &Path) -> InstallResult {
        let plugin_directory = plugin_root.join(&entry.id);
        std::fs::create_dir_all(&plugin_directory).unwrap();
        std::fs::write(plugin_directory.join("mod.bin"), b"code").unwrap();
        std::fs::write(
            plugin_directory.join("plugin.json"),
            serde_json::json!({
                "pluginId": entry.id,
                "assemblyName": "mod.bin",
                "mainClass": "Main",
                "version": entry.version,
            })
            .to_string(),
        )
        .unwrap();

        InstallResult {
            success: true,
            installed_path: Some(plugin_directory),
            error: None,
        }
    }

    #[tokio::test]
    async fn scenario_six_update_preserves_enable_state_and_configuration() {
        let dir = tempfile::tempdir().unwrap();
        let plugin_root = dir.path();
        let plugin_directory = plugin_root.join("d");
        std::fs::create_dir_all(&plugin_directory).unwrap();
        std::fs::write(plugin_directory.join("mod.bin"), b"code").unwrap();
        std::fs::write(
            plugin_directory.join("plugin.json"),
            serde_json::json!({
                "pluginId": "d",
                "assemblyName": "mod.bin",
                "mainClass": "Main",
                "version": "1.0.0",
            })
            .to_string(),
        )
        .unwrap();

        let settings = PluginSettings {
            enabled: true,
            configuration: HashMap::from([(
                "ApiKey".to_string(),
                serde_json::Value::String("K".to_string()),
            )]),
            version: "1.0.0".to_string(),
            schema_version: "1.0.0".to_string(),
            previous_configuration: None,
            previous_schema_version: None,
            last_updated: chrono::Utc::now(),
            metadata: HashMap::new(),
        };
        std::fs::write(
            plugin_directory.join("plugin-settings.json"),
            serde_json::to_string(&settings).unwrap(),
        )
        .unwrap();

        let mut registry = MockRegistryProvider::new();
        registry.expect_list_available().returning(|| {
            Ok(vec![RegistryEntry {
                id: "d".to_string(),
                name: "D".to_string(),
                version: "2.0.0".to_string(),
                download_url: "https://example.com/d.zip".to_string(),
            }])
        });

        let mut installer = MockInstaller::new();
        installer
            .expect_download_and_install()
            .returning(|entry, plugin_root| Ok(install_fixture(entry, plugin_root)));

        let service = UpdateService::new(registry, installer);
        let results = service.run(plugin_root).await.unwrap();
        assert_eq!(results.len(), 1);
        assert!(results[0].success);

        let contents = std::fs::read_to_string(plugin_directory.join("plugin-settings.json")).unwrap();
        let restored: PluginSettings = serde_json::from_str(&contents).unwrap();
        assert!(restored.enabled);
        assert_eq!(
            restored.configuration.get("ApiKey"),
            Some(&serde_json::Value::String("K".to_string()))
        );
        assert_eq!(restored.version, "2.0.0");
    }

    #[tokio::test]
    async fn installs_a_registry_entry_not_yet_present() {
        let dir = tempfile::tempdir().unwrap();

        let mut registry = MockRegistryProvider::new();
        registry.expect_list_available().returning(|| {
            Ok(vec![RegistryEntry {
                id: "new-plugin".to_string(),
                name: "New".to_string(),
                version: "1.0.0".to_string(),
                download_url: "https://example.com/new.zip".to_string(),
            }])
        });

        let mut installer = MockInstaller::new();
        installer
            .expect_download_and_install()
            .returning(|entry, plugin_root| Ok(install_fixture(entry, plugin_root)));

        let service = UpdateService::new(registry, installer);
        let results = service.run(dir.path()).await.unwrap();
        assert_eq!(results.len(), 1);
        assert!(dir.path().join("new-plugin/mod.bin").exists());
    }
}
