//! Descriptor parsing: reads a plugin directory's `plugin.json`, falling
//! back to a probing scan of the directory's code objects when no
//! descriptor is declared.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::isolation::IsolatedLoader;
use crate::traits::ParamHint;

/// A plugin's declarative descriptor, parsed from `plugin.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginDescriptor {
    pub plugin_id: String,
    #[serde(default)]
    pub display_name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub author: String,
    #[serde(default)]
    pub version: String,
    /// The file inside the plugin directory that holds the plugin code.
    /// On disk this is named `assemblyName`.
    #[serde(rename = "assemblyName")]
    pub code_object_name: String,
    /// The symbolic name of the implementing type. On disk this is named
    /// `mainClass`.
    #[serde(rename = "mainClass")]
    pub main_type_name: String,
    #[serde(default)]
    pub configuration: Option<ConfigurationBlock>,
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default)]
    pub permissions: Vec<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub category: Option<String>,
    /// Declared constructor parameters for the injected-DI loader.
    #[serde(default)]
    pub constructor_params: Vec<ParamHint>,
}

impl PluginDescriptor {
    /// Path to this descriptor's declared code object inside `plugin_directory`.
    pub fn code_object_path(&self, plugin_directory: &Path) -> PathBuf {
        plugin_directory.join(&self.code_object_name)
    }
}

/// The `configuration` block of a descriptor, carrying an optional schema.
/// Parsed but not validated at discovery time; validation happens at
/// migration (see `settings.rs`).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConfigurationBlock {
    #[serde(default)]
    pub schema: Option<ConfigSchema>,
}

/// A schema declared by a plugin's descriptor, used to drive settings
/// migration and validation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConfigSchema {
    #[serde(default)]
    pub properties: HashMap<String, SchemaProperty>,
    #[serde(default)]
    pub required: Vec<String>,
}

/// One property of a plugin's configuration schema.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchemaProperty {
    #[serde(rename = "type")]
    pub property_type: SchemaType,
    #[serde(default)]
    pub default: Option<serde_json::Value>,
}

/// The recognized schema property types and their migration coercion rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SchemaType {
    String,
    Boolean,
    Integer,
    Number,
    Array,
    Object,
}

/// Loads descriptors from plugin directories, preferring the declared
/// `plugin.json` and falling back to a probing scan.
pub struct DescriptorLoader {
    loader: IsolatedLoader,
}

impl DescriptorLoader {
    pub fn new() -> Self {
        Self {
            loader: IsolatedLoader::new(),
        }
    }

    /// Attempt to produce a descriptor for `plugin_directory`. Every
    /// failure is logged and yields `None`; nothing here panics or
    /// propagates an error out of the loader.
    pub fn load(&self, plugin_directory: &Path) -> Option<PluginDescriptor> {
        if let Some(descriptor) = self.parse_declared(plugin_directory) {
            return Some(descriptor);
        }

        self.discover_by_scan(plugin_directory)
    }

    fn parse_declared(&self, plugin_directory: &Path) -> Option<PluginDescriptor> {
        let descriptor_path = plugin_directory.join("plugin.json");
        let contents = match std::fs::read_to_string(&descriptor_path) {
            Ok(c) => c,
            Err(e) => {
                tracing::debug!("no declared descriptor at {:?}: {}", descriptor_path, e);
                return None;
            }
        };

        let descriptor: PluginDescriptor = match serde_json::from_str(&contents) {
            Ok(d) => d,
            Err(e) => {
                tracing::warn!("malformed descriptor at {:?}: {}", descriptor_path, e);
                return None;
            }
        };

        if descriptor.plugin_id.trim().is_empty()
            || descriptor.code_object_name.trim().is_empty()
            || descriptor.main_type_name.trim().is_empty()
        {
            tracing::warn!(
                "descriptor at {:?} is missing a required field",
                descriptor_path
            );
            return None;
        }

        if !descriptor.code_object_path(plugin_directory).exists() {
            tracing::warn!(
                "descriptor at {:?} names a code object that does not exist",
                descriptor_path
            );
            return None;
        }

        Some(descriptor)
    }

    /// Scan the directory's candidate code objects, probing each with a
    /// throwaway isolated loader, and accept the first that implements the
    /// plugin capability.
    fn discover_by_scan(&self, plugin_directory: &Path) -> Option<PluginDescriptor> {
        let entries = match std::fs::read_dir(plugin_directory) {
            Ok(e) => e,
            Err(e) => {
                tracing::debug!("cannot scan {:?}: {}", plugin_directory, e);
                return None;
            }
        };

        for entry in entries.flatten() {
            let path = entry.path();
            if !Self::looks_like_code_object(&path) {
                continue;
            }

            if self.loader.probe(&path, plugin_directory) {
                let plugin_id = path
                    .file_stem()
                    .map(|s| s.to_string_lossy().into_owned())
                    .unwrap_or_else(|| "unknown".to_string());

                tracing::info!(
                    "discovered plugin '{}' by scan at {:?}",
                    plugin_id,
                    path
                );

                return Some(PluginDescriptor {
                    plugin_id: plugin_id.clone(),
                    display_name: plugin_id.clone(),
                    description: String::new(),
                    author: String::new(),
                    version: "0.0.0".to_string(),
                    code_object_name: path
                        .file_name()
                        .map(|n| n.to_string_lossy().into_owned())
                        .unwrap_or_default(),
                    main_type_name: "Main".to_string(),
                    configuration: None,
                    dependencies: vec![],
                    permissions: vec![],
                    tags: vec![],
                    category: None,
                    constructor_params: vec![],
                });
            }
        }

        None
    }

    fn looks_like_code_object(path: &Path) -> bool {
        if !path.is_file() {
            return false;
        }
        match path.extension().and_then(|e| e.to_str()) {
            Some("so") | Some("dylib") | Some("dll") => true,
            _ => false,
        }
    }
}

impl Default for DescriptorLoader {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn parses_a_well_formed_descriptor() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("mod.bin"), b"fake-code-object").unwrap();

        let descriptor = serde_json::json!({
            "pluginId": "a",
            "assemblyName": "mod.bin",
            "mainClass": "Main",
            "version": "1.0.0",
        });
        let mut f = std::fs::File::create(dir.path().join("plugin.json")).unwrap();
        f.write_all(descriptor.to_string().as_bytes()).unwrap();

        let loader = DescriptorLoader::new();
        let parsed = loader.load(dir.path()).expect("descriptor should parse");
        assert_eq!(parsed.plugin_id, "a");
        assert_eq!(parsed.code_object_name, "mod.bin");
    }

    #[test]
    fn missing_descriptor_and_no_code_objects_yields_none() {
        let dir = tempfile::tempdir().unwrap();
        let loader = DescriptorLoader::new();
        assert!(loader.load(dir.path()).is_none());
    }

    #[test]
    fn descriptor_naming_a_missing_code_object_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let descriptor = serde_json::json!({
            "pluginId": "a",
            "assemblyName": "does-not-exist.so",
            "mainClass": "Main",
        });
        std::fs::write(
            dir.path().join("plugin.json"),
            descriptor.to_string(),
        )
        .unwrap();

        let loader = DescriptorLoader::new();
        assert!(loader.load(dir.path()).is_none());
    }

    #[test]
    fn empty_plugin_id_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("mod.bin"), b"x").unwrap();
        let descriptor = serde_json::json!({
            "pluginId": "",
            "assemblyName": "mod.bin",
            "mainClass": "Main",
        });
        std::fs::write(
            dir.path().join("plugin.json"),
            descriptor.to_string(),
        )
        .unwrap();

        let loader = DescriptorLoader::new();
        assert!(loader.load(dir.path()).is_none());
    }
}
