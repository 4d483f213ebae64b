//! Settings Store & Migrator: per-plugin persisted enable state and
//! configuration, migrated across descriptor-version changes with
//! rollback and schema validation.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::descriptor::{ConfigSchema, PluginDescriptor, SchemaType};
use crate::error::{PluginHostError, PluginResult};

/// Per-plugin persisted state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginSettings {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub configuration: HashMap<String, Value>,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub schema_version: String,
    #[serde(default)]
    pub previous_configuration: Option<HashMap<String, Value>>,
    #[serde(default)]
    pub previous_schema_version: Option<String>,
    pub last_updated: DateTime<Utc>,
    #[serde(default)]
    pub metadata: HashMap<String, Value>,
}

impl PluginSettings {
    fn defaults(descriptor: &PluginDescriptor) -> Self {
        Self {
            enabled: false,
            configuration: HashMap::new(),
            version: descriptor.version.clone(),
            schema_version: descriptor.version.clone(),
            previous_configuration: None,
            previous_schema_version: None,
            last_updated: Utc::now(),
            metadata: HashMap::new(),
        }
    }
}

/// Reads, migrates, and persists settings for plugins inside one plugin
/// root.
pub struct SettingsStore;

impl SettingsStore {
    pub fn new() -> Self {
        Self
    }

    fn settings_path(plugin_directory: &Path) -> PathBuf {
        plugin_directory.join("plugin-settings.json")
    }

    /// Load (creating defaults if absent) and, if the descriptor's
    /// version or schema version has advanced, migrate in place.
    pub fn load(
        &self,
        plugin_directory: &Path,
        descriptor: &PluginDescriptor,
    ) -> PluginResult<PluginSettings> {
        let path = Self::settings_path(plugin_directory);

        let mut settings = match std::fs::read_to_string(&path) {
            Ok(contents) => serde_json::from_str(&contents)?,
            Err(_) => {
                let defaults = PluginSettings::defaults(descriptor);
                self.save(plugin_directory, &defaults)?;
                return Ok(defaults);
            }
        };

        let schema_version = descriptor.version.clone();
        if descriptor.version != Self::settings_version(&settings)
            || schema_version != settings.schema_version
        {
            self.migrate(&mut settings, descriptor)?;
            self.save(plugin_directory, &settings)?;
        }

        Ok(settings)
    }

    fn settings_version(settings: &PluginSettings) -> String {
        settings.version.clone()
    }

    /// Migrate `settings` in place to match `descriptor`'s current
    /// version/schema, snapshotting the pre-migration state for rollback.
    fn migrate(
        &self,
        settings: &mut PluginSettings,
        descriptor: &PluginDescriptor,
    ) -> PluginResult<()> {
        settings.previous_configuration = Some(settings.configuration.clone());
        settings.previous_schema_version = Some(settings.schema_version.clone());

        let schema = descriptor
            .configuration
            .as_ref()
            .and_then(|c| c.schema.as_ref());

        let mut migrated = HashMap::new();

        if let Some(schema) = schema {
            for (name, property) in &schema.properties {
                let value = settings.configuration.get(name).cloned();
                let coerced = match value {
                    Some(v) => Self::coerce(&v, property.property_type).or_else(|| {
                        tracing::warn!(
                            "migration: could not coerce property '{}' for plugin '{}', falling back to default",
                            name,
                            descriptor.plugin_id
                        );
                        property.default.clone()
                    }),
                    None => property.default.clone(),
                };

                if let Some(coerced) = coerced {
                    migrated.insert(name.clone(), coerced);
                }
            }
        }

        settings.configuration = migrated;
        settings.version = descriptor.version.clone();
        settings.schema_version = descriptor.version.clone();
        settings.last_updated = Utc::now();
        settings
            .metadata
            .insert("lastMigration".to_string(), Value::String(Utc::now().to_rfc3339()));

        Ok(())
    }

    /// Coerce a raw value to the declared schema type, per the migration
    /// coercion table. Returns `None` on failure so the caller can fall
    /// back to the schema default.
    fn coerce(value: &Value, target: SchemaType) -> Option<Value> {
        match target {
            SchemaType::String => Some(Value::String(Self::canonical_string(value))),
            SchemaType::Boolean => match value {
                Value::Bool(b) => Some(Value::Bool(*b)),
                Value::String(s) => match s.to_ascii_lowercase().as_str() {
                    "true" => Some(Value::Bool(true)),
                    "false" => Some(Value::Bool(false)),
                    _ => None,
                },
                Value::Number(n) => n.as_i64().map(|i| Value::Bool(i != 0)),
                _ => None,
            },
            SchemaType::Integer => match value {
                Value::Number(n) => {
                    if let Some(i) = n.as_i64() {
                        Some(Value::Number(i.into()))
                    } else {
                        n.as_f64().map(|f| Value::Number((f.trunc() as i64).into()))
                    }
                }
                Value::String(s) => s.trim().parse::<i64>().ok().map(|i| Value::Number(i.into())),
                _ => None,
            },
            SchemaType::Number => match value {
                Value::Number(n) => Some(Value::Number(n.clone())),
                Value::String(s) => s
                    .trim()
                    .parse::<f64>()
                    .ok()
                    .and_then(serde_json::Number::from_f64)
                    .map(Value::Number),
                _ => None,
            },
            SchemaType::Array => match value {
                Value::Array(a) => Some(Value::Array(a.clone())),
                _ => Some(Value::Array(vec![])),
            },
            SchemaType::Object => match value {
                Value::Object(o) => Some(Value::Object(o.clone())),
                _ => Some(Value::Object(serde_json::Map::new())),
            },
        }
    }

    fn canonical_string(value: &Value) -> String {
        match value {
            Value::String(s) => s.clone(),
            Value::Bool(b) => b.to_string(),
            Value::Number(n) => n.to_string(),
            Value::Null => String::new(),
            other => other.to_string(),
        }
    }

    /// Restore the previous configuration snapshot, if any. Returns
    /// `false` (a no-op) when there is no snapshot to restore.
    pub fn rollback(&self, plugin_directory: &Path) -> PluginResult<bool> {
        let path = Self::settings_path(plugin_directory);
        let contents = std::fs::read_to_string(&path)?;
        let mut settings: PluginSettings = serde_json::from_str(&contents)?;

        let Some(previous_configuration) = settings.previous_configuration.take() else {
            return Ok(false);
        };
        let previous_schema_version = settings.previous_schema_version.take();

        settings.configuration = previous_configuration;
        if let Some(v) = previous_schema_version {
            settings.schema_version = v;
        }
        settings
            .metadata
            .insert("rolledBackAt".to_string(), Value::String(Utc::now().to_rfc3339()));
        settings.last_updated = Utc::now();

        self.save(plugin_directory, &settings)?;
        Ok(true)
    }

    /// Every `required` property named by the descriptor's schema must be
    /// present in the settings' configuration.
    pub fn validate(&self, plugin_directory: &Path, descriptor: &PluginDescriptor) -> bool {
        let Ok(settings) = self.load(plugin_directory, descriptor) else {
            return false;
        };

        let Some(schema) = descriptor.configuration.as_ref().and_then(|c| c.schema.as_ref()) else {
            return true;
        };

        for required in &schema.required {
            if !settings.configuration.contains_key(required) {
                tracing::warn!(
                    "validation: plugin '{}' is missing required configuration property '{}'",
                    descriptor.plugin_id,
                    required
                );
                return false;
            }
        }

        true
    }

    /// True iff the descriptor's schema declares at least one property.
    /// Side effect: ensures a settings file exists.
    pub fn has_configurable_settings(
        &self,
        plugin_directory: &Path,
        descriptor: &PluginDescriptor,
    ) -> PluginResult<bool> {
        self.load(plugin_directory, descriptor)?;
        Ok(Self::schema_has_properties(descriptor))
    }

    fn schema_has_properties(descriptor: &PluginDescriptor) -> bool {
        descriptor
            .configuration
            .as_ref()
            .and_then(|c| c.schema.as_ref())
            .map(|s: &ConfigSchema| !s.properties.is_empty())
            .unwrap_or(false)
    }

    /// Persist `settings` to disk.
    pub fn save(&self, plugin_directory: &Path, settings: &PluginSettings) -> PluginResult<()> {
        let path = Self::settings_path(plugin_directory);
        let json = serde_json::to_string_pretty(settings)
            .map_err(|e| PluginHostError::Generic(format!("failed to serialize settings: {e}")))?;
        std::fs::write(&path, json)?;
        Ok(())
    }

    /// Persist configuration and, optionally, the enabled flag.
    pub fn update_configuration(
        &self,
        plugin_directory: &Path,
        descriptor: &PluginDescriptor,
        configuration: HashMap<String, Value>,
    ) -> PluginResult<PluginSettings> {
        let mut settings = self.load(plugin_directory, descriptor)?;
        settings.configuration = configuration;
        settings.last_updated = Utc::now();
        self.save(plugin_directory, &settings)?;
        Ok(settings)
    }

    /// Persist the enabled flag.
    pub fn set_enabled(
        &self,
        plugin_directory: &Path,
        descriptor: &PluginDescriptor,
        enabled: bool,
    ) -> PluginResult<PluginSettings> {
        let mut settings = self.load(plugin_directory, descriptor)?;
        settings.enabled = enabled;
        settings.last_updated = Utc::now();
        self.save(plugin_directory, &settings)?;
        Ok(settings)
    }
}

impl Default for SettingsStore {
    fn default() -> Self {
        Self::new()
    }
}
