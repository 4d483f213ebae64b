//! The isolated loader: binds one plugin's code object in a private
//! namespace, injects its constructor dependencies, and tears it down
//! deterministically.

use libloading::{Library, Symbol};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::time::Instant;

use crate::error::{PluginHostError, PluginResult};
use crate::traits::{InjectionContext, Plugin, PluginCreate, PluginFactory};

/// Modules that are never privatized: the kernel's own capability
/// interface plus any configured prefix of host-owned modules. Requests
/// for a dependency whose name falls in this set resolve to the
/// host-namespace copy rather than a fresh private one, which is what
/// keeps a plugin's implementation of `Plugin` type-identical to the
/// host's trait definition.
#[derive(Debug, Clone)]
pub struct NamespacePolicy {
    shared_prefixes: Vec<String>,
}

impl NamespacePolicy {
    /// The kernel's own interface module is always shared.
    pub fn new() -> Self {
        Self {
            shared_prefixes: vec!["pluginhost::".to_string(), "pluginhost_abi".to_string()],
        }
    }

    /// Add a host-owned module prefix that should resolve to the host
    /// namespace instead of being loaded privately.
    pub fn add_shared_prefix(&mut self, prefix: impl Into<String>) {
        self.shared_prefixes.push(prefix.into());
    }

    pub fn is_shared(&self, name: &str) -> bool {
        self.shared_prefixes.iter().any(|p| name.starts_with(p.as_str()))
    }
}

impl Default for NamespacePolicy {
    fn default() -> Self {
        Self::new()
    }
}

/// Where a dependency-by-name request resolves, per the private-namespace
/// resolution algorithm.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    /// Resolved to the host's own copy (shared symbol set).
    Host,
    /// Resolved to a code object found inside the plugin's own directory.
    PrivatePlugin(PathBuf),
    /// Deferred to the system namespace (not found privately).
    System,
}

/// A loaded plugin's raw handle: the plugin instance plus the strong
/// reference to its private library image. Field order matters: the
/// plugin is dropped before the library, so any destructor logic inside
/// the plugin runs while its own code is still mapped.
pub struct LoaderHandle {
    plugin: Option<Box<dyn Plugin>>,
    library: Option<Arc<Library>>,
}

impl LoaderHandle {
    /// Borrow the plugin instance mutably.
    pub fn plugin_mut(&mut self) -> Option<&mut (dyn Plugin + 'static)> {
        self.plugin.as_deref_mut()
    }

    /// A weak reference to the private library image, used to drive
    /// `wait_for_unload` after `dispose`.
    pub fn weak_library(&self) -> Weak<Library> {
        self.library.as_ref().map(Arc::downgrade).unwrap_or_default()
    }

    /// Drop the plugin instance and this handle's strong library
    /// reference. The caller should have already awaited the plugin's own
    /// `dispose()` coroutine before calling this.
    pub fn dispose(mut self) -> Weak<Library> {
        let weak = self.weak_library();
        self.plugin.take();
        weak
    }

    /// Build a handle around an in-process plugin with no backing dynamic
    /// library, for tests that exercise the proxy/lifecycle without a real
    /// compiled code object. `weak_library` upgrades to `None` immediately,
    /// matching an already-unloaded namespace.
    #[cfg(test)]
    pub(crate) fn for_test(plugin: Box<dyn Plugin>) -> Self {
        Self {
            plugin: Some(plugin),
            library: None,
        }
    }
}

/// Per-plugin isolated loader: binds one code object in a namespace that
/// privately resolves the plugin's own dependencies from its directory and
/// defers the shared interface to the host.
pub struct IsolatedLoader {
    namespace: NamespacePolicy,
}

impl IsolatedLoader {
    /// Create a new isolated loader with the default namespace policy.
    pub fn new() -> Self {
        Self {
            namespace: NamespacePolicy::new(),
        }
    }

    /// Create an isolated loader with a custom namespace policy.
    pub fn with_namespace(namespace: NamespacePolicy) -> Self {
        Self { namespace }
    }

    /// Resolve a dependency name under this loader's private-namespace
    /// rules, given the plugin directory it is loading for.
    pub fn resolve_dependency(&self, name: &str, plugin_directory: &Path) -> Resolution {
        if self.namespace.is_shared(name) {
            return Resolution::Host;
        }

        let candidate = plugin_directory.join(Self::library_filename(name));
        if candidate.exists() {
            return Resolution::PrivatePlugin(candidate);
        }

        Resolution::System
    }

    /// Load one plugin's code object, constructing it via the injected
    /// `InjectionContext` rather than reflective constructor enumeration.
    ///
    /// `main_type_name` is retained for diagnostics/logging; the type
    /// itself is selected at compile time by whichever `cdylib` exports
    /// `_plugin_create`, not looked up by name at runtime.
    pub fn load(
        &self,
        code_object_path: &Path,
        main_type_name: &str,
        plugin_directory: &Path,
    ) -> PluginResult<LoaderHandle> {
        tracing::info!(
            "isolated loader: loading {:?} (main type '{}') for directory {:?}",
            code_object_path,
            main_type_name,
            plugin_directory
        );

        let library = unsafe { Library::new(code_object_path) }.map_err(|e| PluginHostError::Load {
            id: main_type_name.to_string(),
            reason: format!("failed to load {:?}: {e}", code_object_path),
        })?;

        let create: Symbol<PluginCreate> = unsafe { library.get(b"_plugin_create") }.map_err(|e| {
            PluginHostError::Load {
                id: main_type_name.to_string(),
                reason: format!("no plugin entry point in {:?}: {e}", code_object_path),
            }
        })?;

        let ctx = InjectionContext::new(plugin_directory.to_path_buf());

        let plugin = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let factory_ptr = unsafe { create() };
            let factory: Box<dyn PluginFactory> = unsafe { Box::from_raw(factory_ptr) };
            factory.create(&ctx)
        }))
        .map_err(|_| PluginHostError::Load {
            id: main_type_name.to_string(),
            reason: "plugin construction panicked".to_string(),
        })??;

        tracing::info!("isolated loader: loaded plugin '{}'", plugin.plugin_id());

        Ok(LoaderHandle {
            plugin: Some(plugin),
            library: Some(Arc::new(library)),
        })
    }

    /// Load a candidate code object purely to probe whether it implements
    /// the plugin capability, then drop it immediately. Used by the
    /// descriptor loader's fallback scan.
    pub fn probe(&self, code_object_path: &Path, plugin_directory: &Path) -> bool {
        match self.load(code_object_path, "probe", plugin_directory) {
            Ok(handle) => {
                let _ = handle.dispose();
                true
            }
            Err(e) => {
                tracing::debug!("probe of {:?} failed: {}", code_object_path, e);
                false
            }
        }
    }

    /// Poll a weak reference to the private library image until it can no
    /// longer be upgraded (the library has been unloaded) or the timeout
    /// elapses. Once this returns `true`, the plugin's files are
    /// guaranteed unlocked.
    pub async fn wait_for_unload(weak: Weak<Library>, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if weak.upgrade().is_none() {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }

    /// Platform-specific shared library filename for a logical name.
    pub fn library_filename(name: &str) -> String {
        #[cfg(target_os = "windows")]
        {
            format!("{}.dll", name)
        }
        #[cfg(target_os = "macos")]
        {
            format!("lib{}.dylib", name)
        }
        #[cfg(all(unix, not(target_os = "macos")))]
        {
            format!("lib{}.so", name)
        }
    }
}

impl Default for IsolatedLoader {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shared_prefix_resolves_to_host() {
        let policy = NamespacePolicy::new();
        assert!(policy.is_shared("pluginhost::traits::Plugin"));
        assert!(!policy.is_shared("some_vendor_crate::Thing"));
    }

    #[test]
    fn unknown_dependency_resolves_to_system() {
        let loader = IsolatedLoader::new();
        let dir = std::env::temp_dir();
        let resolution = loader.resolve_dependency("not_a_shared_module_xyz", &dir);
        assert_eq!(resolution, Resolution::System);
    }

    #[test]
    fn shared_dependency_resolves_to_host_before_filesystem_check() {
        let loader = IsolatedLoader::new();
        let dir = std::env::temp_dir();
        let resolution = loader.resolve_dependency("pluginhost::traits", &dir);
        assert_eq!(resolution, Resolution::Host);
    }

    #[tokio::test]
    async fn wait_for_unload_returns_true_once_weak_is_dead() {
        let strong = Arc::new(5u8);
        let weak = Arc::downgrade(&strong);
        drop(strong);

        let deadline = Instant::now() + Duration::from_millis(200);
        loop {
            if weak.upgrade().is_none() {
                break;
            }
            assert!(Instant::now() < deadline, "weak reference never cleared");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    #[test]
    fn load_missing_file_is_a_load_error_not_a_panic() {
        let loader = IsolatedLoader::new();
        let bogus = PathBuf::from("/nonexistent/path/to/plugin.so");
        let dir = std::env::temp_dir();
        let result = loader.load(&bogus, "Main", &dir);
        assert!(result.is_err());
    }
}
