//! Security Proxy: wraps a raw plugin and enforces quotas, timeouts,
//! argument sanitization, result validation, and path containment on
//! every inbound call.

use dashmap::DashMap;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::error::{PluginHostError, PluginResult};
use crate::isolation::LoaderHandle;
use crate::traits::Mod;

/// Process-wide, immutable-after-construction policy the proxy enforces.
#[derive(Debug, Clone)]
pub struct SecurityPolicy {
    pub method_timeout: Duration,
    pub default_call_limit: u64,
    pub per_method_call_limits: HashMap<String, u64>,
    pub max_result_items: usize,
    pub max_string_length: usize,
    pub allowed_config_keys: Option<Vec<String>>,
    pub allowed_plugin_base_path: PathBuf,
}

impl SecurityPolicy {
    /// The recommended defaults from the external interface spec.
    pub fn recommended(allowed_plugin_base_path: impl Into<PathBuf>) -> Self {
        let mut per_method_call_limits = HashMap::new();
        per_method_call_limits.insert("initialize".to_string(), 3);
        per_method_call_limits.insert("get_recent_mods".to_string(), 50);

        Self {
            method_timeout: Duration::from_secs(30),
            default_call_limit: 100,
            per_method_call_limits,
            max_result_items: 200,
            max_string_length: 2000,
            allowed_config_keys: Some(
                [
                    "ApiKey",
                    "BaseUrl",
                    "Timeout",
                    "EnableDebug",
                    "CacheDuration",
                    "UserAgent",
                    "RequestDelay",
                    "MaxRetries",
                    "ProxyUrl",
                ]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            ),
            allowed_plugin_base_path: allowed_plugin_base_path.into(),
        }
    }

    fn limit_for(&self, method: &str) -> u64 {
        self.per_method_call_limits
            .get(method)
            .copied()
            .unwrap_or(self.default_call_limit)
    }

    fn key_allowed(&self, key: &str) -> bool {
        match &self.allowed_config_keys {
            Some(keys) => keys.iter().any(|k| k == key),
            None => true,
        }
    }
}

/// The blocked private/loopback host prefixes, preserved exactly as
/// documented (the `172.` prefix is intentionally broader than RFC 1918's
/// `172.16.0.0/12`).
const BLOCKED_HOST_PREFIXES: &[&str] = &["192.168.", "10.", "172."];
const BLOCKED_HOSTS: &[&str] = &["localhost", "127.0.0.1"];

/// Wraps a raw plugin handle and mediates every inbound call per the
/// security policy. This is the only way host code is permitted to reach
/// a plugin: no raw plugin reference escapes the kernel.
pub struct ProxyHandle {
    plugin_id: String,
    inner: Arc<tokio::sync::Mutex<LoaderHandle>>,
    policy: Arc<SecurityPolicy>,
    call_counters: Arc<DashMap<(String, String), AtomicU64>>,
}

impl ProxyHandle {
    pub fn new(plugin_id: String, handle: LoaderHandle, policy: Arc<SecurityPolicy>) -> Self {
        Self {
            plugin_id,
            inner: Arc::new(tokio::sync::Mutex::new(handle)),
            policy,
            call_counters: Arc::new(DashMap::new()),
        }
    }

    fn check_quota(&self, method: &str) -> PluginResult<()> {
        let key = (self.plugin_id.clone(), method.to_string());
        let counter = self
            .call_counters
            .entry(key)
            .or_insert_with(|| AtomicU64::new(0));
        let count = counter.fetch_add(1, Ordering::SeqCst) + 1;

        if count > self.policy.limit_for(method) {
            return Err(PluginHostError::Security {
                id: self.plugin_id.clone(),
                reason: "call limit exceeded".to_string(),
            });
        }

        Ok(())
    }

    /// Reset all call counters for this plugin. Called on unregistration.
    pub fn reset_counters(&self) {
        self.call_counters
            .retain(|(plugin_id, _), _| plugin_id != &self.plugin_id);
    }

    /// Sanitize a configuration map: keep only allowed keys, strip
    /// dangerous substrings from string values, truncate to the max
    /// string length.
    fn sanitize_configuration(
        &self,
        configuration: HashMap<String, serde_json::Value>,
    ) -> HashMap<String, serde_json::Value> {
        configuration
            .into_iter()
            .filter(|(k, _)| self.policy.key_allowed(k))
            .map(|(k, v)| {
                let sanitized = match v {
                    serde_json::Value::String(s) => {
                        serde_json::Value::String(Self::sanitize_string(&s, self.policy.max_string_length))
                    }
                    other => other,
                };
                (k, sanitized)
            })
            .collect()
    }

    fn sanitize_string(input: &str, max_len: usize) -> String {
        let lower = input.to_ascii_lowercase();
        let mut output = input.to_string();
        for needle in ["<script", "javascript:", "file://"] {
            if lower.contains(needle) {
                output = Self::strip_case_insensitive(&output, needle);
            }
        }
        Self::truncate_chars(&output, max_len)
    }

    fn strip_case_insensitive(input: &str, needle: &str) -> String {
        let lower_input = input.to_ascii_lowercase();
        let lower_needle = needle.to_ascii_lowercase();
        let mut result = String::with_capacity(input.len());
        let mut rest = input;
        let mut lower_rest = lower_input.as_str();
        while let Some(pos) = lower_rest.find(&lower_needle) {
            result.push_str(&rest[..pos]);
            rest = &rest[pos + needle.len()..];
            lower_rest = &lower_rest[pos + needle.len()..];
        }
        result.push_str(rest);
        result
    }

    fn truncate_chars(input: &str, max_len: usize) -> String {
        input.chars().take(max_len).collect()
    }

    /// Strip `<.*?>` HTML tags, strip control characters, truncate, trim.
    fn sanitize_text_field(input: &str, max_len: usize) -> String {
        let no_tags = Self::strip_html_tags(input);
        let no_control: String = no_tags
            .chars()
            .filter(|c| {
                let code = *c as u32;
                !((0x00..=0x1F).contains(&code) || code == 0x7F)
            })
            .collect();
        Self::truncate_chars(&no_control, max_len).trim().to_string()
    }

    fn strip_html_tags(input: &str) -> String {
        let mut out = String::with_capacity(input.len());
        let mut in_tag = false;
        for c in input.chars() {
            match c {
                '<' => in_tag = true,
                '>' => in_tag = false,
                _ if !in_tag => out.push(c),
                _ => {}
            }
        }
        out
    }

    /// Validate and sanitize one URL field: empty passes through; else
    /// must parse as absolute http(s) with a non-blocked host, or is
    /// replaced with an empty string.
    fn sanitize_url_field(raw: &str) -> String {
        if raw.is_empty() {
            return String::new();
        }

        let Ok(parsed) = url::Url::parse(raw) else {
            return String::new();
        };

        if parsed.scheme() != "http" && parsed.scheme() != "https" {
            return String::new();
        }

        let Some(host) = parsed.host_str() else {
            return String::new();
        };

        if BLOCKED_HOSTS.contains(&host) {
            return String::new();
        }

        if BLOCKED_HOST_PREFIXES.iter().any(|p| host.starts_with(p)) {
            return String::new();
        }

        raw.to_string()
    }

    fn sanitize_mod(&self, mut record: Mod) -> Mod {
        record.mod_url = Self::sanitize_url_field(&record.mod_url);
        record.download_url = Self::sanitize_url_field(&record.download_url);
        record.image_url = Self::sanitize_url_field(&record.image_url);

        record.name = Self::sanitize_text_field(&record.name, self.policy.max_string_length);
        record.publisher = Self::sanitize_text_field(&record.publisher, self.policy.max_string_length);
        record.mod_type = Self::sanitize_text_field(&record.mod_type, self.policy.max_string_length);
        record.version = Self::sanitize_text_field(&record.version, self.policy.max_string_length);

        record
    }

    /// Mediated `initialize`: sanitizes the configuration, enforces quota
    /// and timeout.
    pub async fn initialize(
        &self,
        configuration: HashMap<String, serde_json::Value>,
    ) -> PluginResult<()> {
        self.check_quota("initialize")?;
        let sanitized = self.sanitize_configuration(configuration);

        let inner = self.inner.clone();
        let id = self.plugin_id.clone();
        let fut = async move {
            let mut guard = inner.lock().await;
            match guard.plugin_mut() {
                Some(plugin) => plugin.initialize(sanitized).await,
                None => Err(PluginHostError::NotFound { id }),
            }
        };

        tokio::time::timeout(self.policy.method_timeout, fut)
            .await
            .map_err(|_| PluginHostError::Timeout {
                id: self.plugin_id.clone(),
            })?
    }

    /// Mediated `getRecentMods`: caps list size, validates/sanitizes every
    /// record.
    pub async fn get_recent_mods(&self) -> PluginResult<Vec<Mod>> {
        self.check_quota("get_recent_mods")?;

        let inner = self.inner.clone();
        let id = self.plugin_id.clone();
        let fut = async move {
            let mut guard = inner.lock().await;
            match guard.plugin_mut() {
                Some(plugin) => plugin.get_recent_mods().await,
                None => Err(PluginHostError::NotFound { id }),
            }
        };

        let mods = tokio::time::timeout(self.policy.method_timeout, fut)
            .await
            .map_err(|_| PluginHostError::Timeout {
                id: self.plugin_id.clone(),
            })??;

        Ok(mods
            .into_iter()
            .take(self.policy.max_result_items)
            .map(|m| self.sanitize_mod(m))
            .collect())
    }

    /// Mediated `pluginDirectory` setter: rejects any path that is not a
    /// canonicalized descendant of the policy's allowed base path.
    pub fn set_plugin_directory(&self, directory: &Path) -> PluginResult<PathBuf> {
        let canonical = directory.canonicalize().map_err(|e| PluginHostError::Security {
            id: self.plugin_id.clone(),
            reason: format!("cannot canonicalize {:?}: {e}", directory),
        })?;

        let allowed = self
            .policy
            .allowed_plugin_base_path
            .canonicalize()
            .unwrap_or_else(|_| self.policy.allowed_plugin_base_path.clone());

        if !canonical.starts_with(&allowed) {
            return Err(PluginHostError::Security {
                id: self.plugin_id.clone(),
                reason: format!("{:?} is not a descendant of the allowed plugin base path", canonical),
            });
        }

        Ok(canonical)
    }

    /// Forward disposal to the inner plugin with a timeout; errors are
    /// swallowed and logged, never propagated.
    pub async fn dispose(&self) {
        let inner = self.inner.clone();
        let fut = async move {
            let mut guard = inner.lock().await;
            if let Some(plugin) = guard.plugin_mut() {
                plugin.dispose().await;
            }
        };

        if tokio::time::timeout(self.policy.method_timeout, fut)
            .await
            .is_err()
        {
            tracing::warn!("plugin '{}' disposal timed out", self.plugin_id);
        }
    }

    /// Tear down the loader handle and return a weak library reference
    /// for `IsolatedLoader::wait_for_unload`. A concurrent mediated call
    /// still in flight holds a clone of this handle, so this waits
    /// (bounded by the policy's method timeout) for it to finish rather
    /// than assuming unique ownership; if one is still outstanding once
    /// the deadline passes, logs a warning and returns an already-dead
    /// weak reference instead of blocking unregistration forever.
    pub async fn unload(self: Arc<Self>) -> std::sync::Weak<libloading::Library> {
        self.reset_counters();

        let plugin_id = self.plugin_id.clone();
        let timeout = self.policy.method_timeout;
        let deadline = tokio::time::Instant::now() + timeout;

        let mut handle = self;
        loop {
            match Arc::try_unwrap(handle) {
                Ok(proxy) => {
                    return match Arc::try_unwrap(proxy.inner) {
                        Ok(mutex) => mutex.into_inner().dispose(),
                        Err(_) => {
                            tracing::warn!(
                                "loader handle for '{}' is still shared at unload; leaving its library mapped",
                                plugin_id
                            );
                            std::sync::Weak::new()
                        }
                    };
                }
                Err(shared) => {
                    if tokio::time::Instant::now() >= deadline {
                        tracing::warn!(
                            "proxy handle for '{}' still has outstanding references after {:?}; \
                             leaving its library mapped rather than blocking unregistration",
                            plugin_id,
                            timeout
                        );
                        return std::sync::Weak::new();
                    }
                    handle = shared;
                    tokio::time::sleep(Duration::from_millis(20)).await;
                }
            }
        }
    }
}
