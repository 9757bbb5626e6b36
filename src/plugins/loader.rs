//! Module loader - import, cache and activate plugin entry modules
//!
//! The cache holds the live module of every activated plugin, keyed by
//! plugin directory. Activation always purges first and imports fresh, so a
//! reload picks up code changed on disk. Teardown prefers the cached live
//! instance because that is the one holding the plugin's registrations.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use thiserror::Error;

use super::manifest::PluginRecord;
use super::module::{Capabilities, ImportError, ModuleProvider, PluginModule};
use super::package::is_safe_path_segment;

/// Why a plugin could not be activated
#[derive(Debug, Error)]
pub enum ActivationError {
    /// Entry module could not be imported
    #[error("failed to import entry module: {0}")]
    Import(#[from] ImportError),

    /// `register` hook reported a failure
    #[error("register hook failed: {0}")]
    Register(String),

    /// Manifest declares a router but the module exports none
    #[error("manifest declares router {0:?} but the module exports no router")]
    MissingRouter(String),

    /// Router segment is not a single safe path segment
    #[error("invalid router segment {0:?}")]
    InvalidRouterSegment(String),

    /// Another plugin already mounted this segment during the pass
    #[error("router segment {0:?} is already mounted by another plugin")]
    DuplicateRouterSegment(String),
}

/// A successfully activated plugin
#[derive(Debug, Clone)]
pub struct Activation {
    /// Live module, also held in the loader cache
    pub module: Arc<PluginModule>,
    /// Router fragment and the segment it is mounted under
    pub route: Option<(String, axum::Router)>,
}

/// Imports entry modules through a [`ModuleProvider`] and tracks live ones
pub struct ModuleLoader {
    provider: Arc<dyn ModuleProvider>,
    cache: Mutex<HashMap<PathBuf, Arc<PluginModule>>>,
}

impl ModuleLoader {
    /// Create a loader backed by `provider`
    #[must_use]
    pub fn new(provider: Arc<dyn ModuleProvider>) -> Self {
        Self {
            provider,
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Import without caching or invoking any hook
    ///
    /// # Errors
    ///
    /// Returns the provider's import failure
    pub async fn probe(&self, record: &PluginRecord) -> Result<PluginModule, ImportError> {
        let entry = entry_path(record)?;
        self.provider.import(record, &entry).await
    }

    /// Drop cached modules for `dir` and anything below it
    ///
    /// Safe to call for plugins that were never loaded.
    pub fn purge(&self, dir: &Path) -> usize {
        let mut cache = self.cache();
        let before = cache.len();
        cache.retain(|key, _| !key.starts_with(dir));
        let purged = before - cache.len();
        if purged > 0 {
            tracing::debug!(path = %dir.display(), purged, "purged cached plugin module");
        }
        purged
    }

    /// Whether a live module is cached for `dir`
    #[must_use]
    pub fn is_cached(&self, dir: &Path) -> bool {
        self.cache().contains_key(dir)
    }

    /// Import a fresh module, check its router and run `register`
    ///
    /// `mounted` holds the segments already claimed during the current
    /// pass. On success the module is cached as the plugin's live instance.
    ///
    /// # Errors
    ///
    /// Returns the first activation failure; nothing is cached on failure
    pub async fn load_and_activate(
        &self,
        record: &PluginRecord,
        caps: &Capabilities,
        mounted: &BTreeMap<String, axum::Router>,
    ) -> Result<Activation, ActivationError> {
        let dir = record.dir().to_path_buf();
        self.purge(&dir);

        let module = self.probe(record).await?;
        let route = mount_point(record, &module, mounted)?;

        if let Some(hook) = module.register_hook() {
            hook.call(caps).await.map_err(ActivationError::Register)?;
        }

        let module = Arc::new(module);
        self.cache().insert(dir, Arc::clone(&module));

        tracing::info!(
            plugin = %record.name(),
            version = %record.manifest.version(),
            router = route.as_ref().map(|(segment, _)| segment.as_str()),
            "plugin activated"
        );
        Ok(Activation { module, route })
    }

    /// Run the plugin's `unregister` hook, if it has one
    ///
    /// Uses the cached live module when there is one, otherwise imports a
    /// fresh copy. Returns `Ok(true)` if a hook ran, `Ok(false)` if the
    /// module exports none. The cache is left untouched; callers purge.
    ///
    /// # Errors
    ///
    /// Returns a message if the module could not be imported or the hook
    /// failed
    pub async fn unregister(&self, record: &PluginRecord, caps: &Capabilities) -> Result<bool, String> {
        let cached = self.cache().get(record.dir()).cloned();
        let module = match cached {
            Some(module) => module,
            None => Arc::new(self.probe(record).await.map_err(|e| e.to_string())?),
        };

        let Some(hook) = module.unregister_hook() else {
            return Ok(false);
        };
        hook.call(caps).await?;
        tracing::info!(plugin = %record.name(), "plugin unregistered");
        Ok(true)
    }

    fn cache(&self) -> std::sync::MutexGuard<'_, HashMap<PathBuf, Arc<PluginModule>>> {
        self.cache.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl std::fmt::Debug for ModuleLoader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModuleLoader")
            .field("cached", &self.cache().len())
            .finish_non_exhaustive()
    }
}

fn entry_path(record: &PluginRecord) -> Result<PathBuf, ImportError> {
    record
        .manifest
        .entry_path(record.dir())
        .ok_or_else(|| ImportError::Failed("manifest declares no entry module".to_string()))
}

/// Resolve where the module's router is mounted, if anywhere
fn mount_point(
    record: &PluginRecord,
    module: &PluginModule,
    mounted: &BTreeMap<String, axum::Router>,
) -> Result<Option<(String, axum::Router)>, ActivationError> {
    let Some(segment) = record.manifest.router.as_deref().map(str::trim) else {
        if module.router().is_some() {
            tracing::warn!(
                plugin = %record.name(),
                "module exports a router but the manifest declares no segment, not mounting"
            );
        }
        return Ok(None);
    };

    if !is_safe_path_segment(segment) {
        return Err(ActivationError::InvalidRouterSegment(segment.to_string()));
    }
    let Some(router) = module.router() else {
        return Err(ActivationError::MissingRouter(segment.to_string()));
    };
    if mounted.contains_key(segment) {
        return Err(ActivationError::DuplicateRouterSegment(segment.to_string()));
    }
    Ok(Some((segment.to_string(), router.clone())))
}
