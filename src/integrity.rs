//! Hasher & Integrity Registry: persists a `{pluginId -> hash/size/mtime
//! /status/load-stats}` ledger at the plugin root and detects drift across
//! process runs.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::descriptor::PluginDescriptor;

/// Classification of a plugin's code object relative to the registry's
/// recorded hash.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub enum IntegrityStatus {
    Unknown,
    Valid,
    Modified,
    Missing,
    Corrupted,
    VersionMismatch,
}

/// One row of the integrity registry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntegrityRecord {
    pub plugin_id: String,
    pub display_name: String,
    pub version: String,
    pub code_object_path: PathBuf,
    pub code_object_hash: String,
    pub code_object_size: u64,
    pub last_modified: DateTime<Utc>,
    pub status: IntegrityStatus,
    pub last_loaded: Option<DateTime<Utc>>,
    pub load_count: u64,
    pub total_runtime_ms: u64,
    pub last_error: Option<String>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct RegistryFile {
    #[serde(default)]
    records: HashMap<String, IntegrityRecord>,
}

/// The integrity registry: one JSON file at the plugin root, loaded
/// lazily and rewritten after every mutation under a single write mutex.
pub struct IntegrityRegistry {
    root: PathBuf,
    state: Mutex<RegistryFile>,
}

impl IntegrityRegistry {
    /// `root` is the plugin root directory; the registry file lives at
    /// `root/plugin-registry.json`.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let state = Self::load_from_disk(&root);
        Self {
            root,
            state: Mutex::new(state),
        }
    }

    fn registry_path(root: &Path) -> PathBuf {
        root.join("plugin-registry.json")
    }

    fn load_from_disk(root: &Path) -> RegistryFile {
        let path = Self::registry_path(root);
        match std::fs::read_to_string(&path) {
            Ok(contents) => match serde_json::from_str(&contents) {
                Ok(file) => file,
                Err(e) => {
                    tracing::warn!("integrity registry at {:?} is corrupt: {}", path, e);
                    RegistryFile::default()
                }
            },
            Err(_) => RegistryFile::default(),
        }
    }

    fn persist(&self, state: &RegistryFile) {
        let path = Self::registry_path(&self.root);
        match serde_json::to_string_pretty(state) {
            Ok(json) => {
                if let Err(e) = std::fs::write(&path, json) {
                    tracing::error!("failed to write integrity registry {:?}: {}", path, e);
                }
            }
            Err(e) => tracing::error!("failed to serialize integrity registry: {}", e),
        }
    }

    fn hash_file(path: &Path) -> std::io::Result<(String, u64)> {
        let bytes = std::fs::read(path)?;
        let mut hasher = Sha256::new();
        hasher.update(&bytes);
        let digest = hasher.finalize();
        Ok((hex::encode(digest), bytes.len() as u64))
    }

    /// Upsert a record for `descriptor`, recomputing the hash of the code
    /// object at `code_object_path`. If the id is new, the record is
    /// created with `status = Valid`; if present, discovery fields are
    /// updated but lifetime stats (`loadCount`, `totalRuntime`, `lastLoaded`,
    /// `lastError`) are preserved.
    pub fn register(&self, descriptor: &PluginDescriptor, code_object_path: &Path) {
        let (hash, size) = match Self::hash_file(code_object_path) {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!(
                    "cannot hash code object {:?} for plugin '{}': {}",
                    code_object_path,
                    descriptor.plugin_id,
                    e
                );
                (String::new(), 0)
            }
        };

        let mtime = std::fs::metadata(code_object_path)
            .and_then(|m| m.modified())
            .map(DateTime::<Utc>::from)
            .unwrap_or_else(|_| Utc::now());

        let mut state = self.state.lock().unwrap();
        let entry = state
            .records
            .entry(descriptor.plugin_id.clone())
            .or_insert_with(|| IntegrityRecord {
                plugin_id: descriptor.plugin_id.clone(),
                display_name: descriptor.display_name.clone(),
                version: descriptor.version.clone(),
                code_object_path: code_object_path.to_path_buf(),
                code_object_hash: hash.clone(),
                code_object_size: size,
                last_modified: mtime,
                status: IntegrityStatus::Valid,
                last_loaded: None,
                load_count: 0,
                total_runtime_ms: 0,
                last_error: None,
            });

        entry.display_name = descriptor.display_name.clone();
        entry.version = descriptor.version.clone();
        entry.code_object_path = code_object_path.to_path_buf();
        entry.code_object_hash = hash;
        entry.code_object_size = size;
        entry.last_modified = mtime;
        entry.status = IntegrityStatus::Valid;

        self.persist(&state);
    }

    /// Recompute the status of a plugin's code object relative to the
    /// recorded hash. On `Modified`, the record's hash and mtime are
    /// updated in place so the next check is stable.
    pub fn verify(&self, plugin_id: &str) -> IntegrityStatus {
        let mut state = self.state.lock().unwrap();
        let Some(record) = state.records.get(plugin_id).cloned() else {
            return IntegrityStatus::Unknown;
        };

        if !record.code_object_path.exists() {
            if let Some(r) = state.records.get_mut(plugin_id) {
                r.status = IntegrityStatus::Missing;
            }
            self.persist(&state);
            return IntegrityStatus::Missing;
        }

        let (hash, size) = match Self::hash_file(&record.code_object_path) {
            Ok(v) => v,
            Err(_) => {
                if let Some(r) = state.records.get_mut(plugin_id) {
                    r.status = IntegrityStatus::Corrupted;
                }
                self.persist(&state);
                return IntegrityStatus::Corrupted;
            }
        };

        let status = if size != record.code_object_size || hash != record.code_object_hash {
            IntegrityStatus::Modified
        } else {
            IntegrityStatus::Valid
        };

        if status == IntegrityStatus::Modified {
            if let Some(r) = state.records.get_mut(plugin_id) {
                r.code_object_hash = hash;
                r.code_object_size = size;
                r.last_modified = Utc::now();
                r.status = status;
            }
            self.persist(&state);
        }

        status
    }

    /// Record the outcome of a load attempt against a plugin's integrity
    /// row.
    pub fn record_load(
        &self,
        plugin_id: &str,
        success: bool,
        error: Option<String>,
        runtime_ms: Option<u64>,
    ) {
        let mut state = self.state.lock().unwrap();
        if let Some(record) = state.records.get_mut(plugin_id) {
            record.load_count += 1;
            if let Some(runtime) = runtime_ms {
                record.total_runtime_ms += runtime;
            }
            record.last_loaded = Some(Utc::now());
            record.last_error = if success { None } else { error };
        }
        self.persist(&state);
    }

    /// Drop every row whose code object no longer exists on disk.
    pub fn cleanup_missing(&self) {
        let mut state = self.state.lock().unwrap();
        state
            .records
            .retain(|_, record| record.code_object_path.exists());
        self.persist(&state);
    }

    /// Verify every registered plugin and return the resulting map.
    pub fn verify_all(&self) -> HashMap<String, IntegrityStatus> {
        let ids: Vec<String> = self.state.lock().unwrap().records.keys().cloned().collect();
        ids.into_iter().map(|id| {
            let status = self.verify(&id);
            (id, status)
        }).collect()
    }

    /// Snapshot a single record, if present.
    pub fn get(&self, plugin_id: &str) -> Option<IntegrityRecord> {
        self.state.lock().unwrap().records.get(plugin_id).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor(id: &str, code_object_name: &str) -> PluginDescriptor {
        PluginDescriptor {
            plugin_id: id.to_string(),
            display_name: id.to_string(),
            description: String::new(),
            author: String::new(),
            version: "1.0.0".to_string(),
            code_object_name: code_object_name.to_string(),
            main_type_name: "Main".to_string(),
            configuration: None,
            dependencies: vec![],
            permissions: vec![],
            tags: vec![],
            category: None,
            constructor_params: vec![],
        }
    }

    #[test]
    fn register_then_verify_reports_valid() {
        let dir = tempfile::tempdir().unwrap();
        let code_object = dir.path().join("mod.bin");
        std::fs::write(&code_object, vec![0u8; 128]).unwrap();

        let registry = IntegrityRegistry::new(dir.path());
        let descriptor = descriptor("a", "mod.bin");
        registry.register(&descriptor, &code_object);

        assert_eq!(registry.verify("a"), IntegrityStatus::Valid);
    }

    #[test]
    fn appending_a_byte_is_detected_as_modified_and_hash_updates() {
        let dir = tempfile::tempdir().unwrap();
        let code_object = dir.path().join("mod.bin");
        std::fs::write(&code_object, vec![0u8; 128]).unwrap();

        let registry = IntegrityRegistry::new(dir.path());
        let descriptor = descriptor("a", "mod.bin");
        registry.register(&descriptor, &code_object);
        let original_hash = registry.get("a").unwrap().code_object_hash;

        let mut bytes = vec![0u8; 128];
        bytes.push(1);
        std::fs::write(&code_object, &bytes).unwrap();

        assert_eq!(registry.verify("a"), IntegrityStatus::Modified);
        let updated = registry.get("a").unwrap();
        assert_ne!(updated.code_object_hash, original_hash);
    }

    #[test]
    fn missing_code_object_is_reported_missing() {
        let dir = tempfile::tempdir().unwrap();
        let code_object = dir.path().join("mod.bin");
        std::fs::write(&code_object, vec![0u8; 16]).unwrap();

        let registry = IntegrityRegistry::new(dir.path());
        registry.register(&descriptor("a", "mod.bin"), &code_object);
        std::fs::remove_file(&code_object).unwrap();

        assert_eq!(registry.verify("a"), IntegrityStatus::Missing);
    }

    #[test]
    fn cleanup_missing_drops_rows_for_deleted_files() {
        let dir = tempfile::tempdir().unwrap();
        let code_object = dir.path().join("mod.bin");
        std::fs::write(&code_object, vec![0u8; 16]).unwrap();

        let registry = IntegrityRegistry::new(dir.path());
        registry.register(&descriptor("a", "mod.bin"), &code_object);
        std::fs::remove_file(&code_object).unwrap();

        registry.cleanup_missing();
        assert!(registry.get("a").is_none());
    }

    #[test]
    fn corrupt_registry_file_yields_empty_registry_not_a_crash() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("plugin-registry.json"), "not json").unwrap();

        let registry = IntegrityRegistry::new(dir.path());
        assert!(registry.get("anything").is_none());
    }
}
