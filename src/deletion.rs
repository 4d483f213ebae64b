//! Safe Deletion Service: unregister -> reclamation-wait -> retry-delete
//! with backoff, independent of the isolation backend.

use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::lifecycle::LifecycleManager;

/// Default overall wait budget for the reclamation-wait loop.
const DEFAULT_RECLAMATION_TIMEOUT: Duration = Duration::from_secs(150);
const RECLAMATION_POLL_INTERVAL: Duration = Duration::from_millis(750);
const DEFAULT_MAX_RETRIES: u32 = 6;
const RETRY_BASE_MS: f64 = 500.0;
const RETRY_GROWTH: f64 = 1.8;
const RETRY_CAP_MS: f64 = 8000.0;
const LOCKED_FILES_LOG_LIMIT: usize = 20;

/// Coordinates the full safe-deletion protocol for one plugin directory.
pub struct DeletionService<'a> {
    lifecycle: &'a LifecycleManager,
}

impl<'a> DeletionService<'a> {
    pub fn new(lifecycle: &'a LifecycleManager) -> Self {
        Self { lifecycle }
    }

    /// Unregister the plugin, wait for its files to unlock, then retry
    /// deletion with backoff. Returns `true` on success.
    pub async fn safe_delete(
        &self,
        plugin_id: &str,
        plugin_directory: &Path,
        timeout: Option<Duration>,
    ) -> bool {
        if let Err(e) = self.lifecycle.unregister(plugin_id).await {
            tracing::warn!("safe_delete: unregister('{}') failed: {}", plugin_id, e);
            return false;
        }

        let deadline_budget = timeout.unwrap_or(DEFAULT_RECLAMATION_TIMEOUT);
        if !self.wait_until_deletable(plugin_directory, deadline_budget).await {
            tracing::warn!(
                "safe_delete: '{}' did not become deletable within {:?}",
                plugin_id,
                deadline_budget
            );
        }

        self.retry_delete(plugin_directory, DEFAULT_MAX_RETRIES).await
    }

    async fn wait_until_deletable(&self, plugin_directory: &Path, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if Self::can_be_deleted(plugin_directory) {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(RECLAMATION_POLL_INTERVAL).await;
        }
    }

    /// Probe-open every file under `plugin_directory` with exclusive
    /// access; any I/O error means the directory is not yet deletable.
    pub fn can_be_deleted(plugin_directory: &Path) -> bool {
        let Ok(entries) = std::fs::read_dir(plugin_directory) else {
            return true;
        };

        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_dir() {
                if !Self::can_be_deleted(&path) {
                    return false;
                }
                continue;
            }

            if std::fs::OpenOptions::new().read(true).write(true).open(&path).is_err() {
                return false;
            }
        }

        true
    }

    /// Backoff formula: `min(500 * 1.8^(k-1), 8000)` ms for attempt `k`.
    fn backoff_ms(attempt: u32) -> u64 {
        let ms = RETRY_BASE_MS * RETRY_GROWTH.powi(attempt as i32 - 1);
        ms.min(RETRY_CAP_MS) as u64
    }

    async fn retry_delete(&self, plugin_directory: &Path, max_retries: u32) -> bool {
        for attempt in 1..=max_retries {
            // Drive a few rounds of reclamation to flush any still-unloading namespace.
            tokio::task::yield_now().await;

            match std::fs::remove_dir_all(plugin_directory) {
                Ok(()) => return true,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => return true,
                Err(e) => {
                    let locked = Self::locked_files(plugin_directory);
                    tracing::warn!(
                        "retry_delete: attempt {} failed for {:?}: {}; locked files: {:?}",
                        attempt,
                        plugin_directory,
                        e,
                        locked
                    );

                    if attempt == max_retries {
                        break;
                    }

                    tokio::time::sleep(Duration::from_millis(Self::backoff_ms(attempt))).await;
                }
            }
        }

        false
    }

    fn locked_files(plugin_directory: &Path) -> Vec<PathBuf> {
        let Ok(entries) = std::fs::read_dir(plugin_directory) else {
            return vec![];
        };

        entries
            .flatten()
            .map(|e| e.path())
            .filter(|p| p.is_file())
            .filter(|p| std::fs::OpenOptions::new().write(true).open(p).is_err())
            .take(LOCKED_FILES_LOG_LIMIT)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::PluginDescriptor;
    use crate::isolation::LoaderHandle;
    use crate::lifecycle::LoadedPlugin;
    use crate::proxy::{ProxyHandle, SecurityPolicy};
    use crate::traits::test_support::StubPlugin;
    use std::sync::Arc;

    fn descriptor(id: &str) -> PluginDescriptor {
        PluginDescriptor {
            plugin_id: id.to_string(),
            display_name: id.to_string(),
            description: String::new(),
            author: String::new(),
            version: "1.0.0".to_string(),
            code_object_name: "mod.bin".to_string(),
            main_type_name: "Main".to_string(),
            configuration: None,
            dependencies: vec![],
            permissions: vec![],
            tags: vec![],
            category: None,
            constructor_params: vec![],
        }
    }

    #[tokio::test]
    async fn scenario_five_safe_delete_of_a_loaded_plugin() {
        let dir = tempfile::tempdir().unwrap();
        let plugin_root = dir.path().join("root");
        let plugin_directory = plugin_root.join("c");
        std::fs::create_dir_all(&plugin_directory).unwrap();
        std::fs::write(plugin_directory.join("mod.bin"), b"code").unwrap();

        let manager = LifecycleManager::new(&plugin_root);
        let policy = Arc::new(SecurityPolicy::recommended(&plugin_root));
        let handle = LoaderHandle::for_test(Box::new(StubPlugin::new("c")));
        let proxy = ProxyHandle::new("c".to_string(), handle, policy);

        // Touch the code object, as the scenario specifies, before deleting.
        proxy.get_recent_mods().await.unwrap();

        manager
            .register(LoadedPlugin {
                descriptor: descriptor("c"),
                plugin_directory: plugin_directory.clone(),
                proxy: Arc::new(proxy),
            })
            .await
            .unwrap();
        assert!(manager.get_all().contains(&"c".to_string()));

        let service = DeletionService::new(&manager);
        let deleted = service
            .safe_delete("c", &plugin_directory, Some(Duration::from_secs(10)))
            .await;

        assert!(deleted);
        assert!(!plugin_directory.exists());
        assert!(!manager.get_all().contains(&"c".to_string()));
    }

    #[test]
    fn backoff_follows_the_geometric_formula_and_caps_at_8000() {
        assert_eq!(DeletionService::backoff_ms(1), 500);
        assert_eq!(DeletionService::backoff_ms(2), 900);
        assert_eq!(DeletionService::backoff_ms(3), 1620);
        assert_eq!(DeletionService::backoff_ms(10), 8000);
    }

    #[test]
    fn can_be_deleted_is_true_for_an_unlocked_directory() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.txt"), b"hello").unwrap();
        assert!(DeletionService::can_be_deleted(dir.path()));
    }

    #[test]
    fn can_be_deleted_is_true_for_a_missing_directory() {
        let missing = PathBuf::from("/nonexistent/plugin/dir");
        assert!(DeletionService::can_be_deleted(&missing));
    }

    #[tokio::test]
    async fn safe_delete_on_an_already_missing_directory_succeeds() {
        let dir = tempfile::tempdir().unwrap();
        let plugin_root = dir.path().join("root");
        std::fs::create_dir(&plugin_root).unwrap();
        let plugin_dir = plugin_root.join("c");
        // Never created: retry_delete should treat NotFound as success.

        let manager = LifecycleManager::new(&plugin_root);
        let service = DeletionService::new(&manager);
        let deleted = service
            .safe_delete("c", &plugin_dir, Some(Duration::from_secs(2)))
            .await;
        assert!(deleted);
    }
}
