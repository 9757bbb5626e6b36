//! Plugin manager - activation passes and the public plugin operations
//!
//! One activation pass re-derives the whole catalog from disk:
//!
//! ```text
//! for each plugin directory (sorted):
//!     discover manifest ─► validate ─► catalog (always)
//!                                       └─► load + activate (if enabled)
//!                                             └─► merge sidebar, mount router
//! persist registry ─► log summary ─► replace catalog ─► publish plugins:reloaded
//! ```
//!
//! A single flag guards against overlapping passes. A second trigger while
//! a pass (or a mutating operation) is running is rejected immediately with
//! [`Error::ReentrancyRejected`]; nothing is queued.
//!
//! Install, uninstall and toggle hold the same guard for their whole
//! duration and finish with a pass of their own.

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock, Weak};

use serde_json::{Map, Value, json};

use super::deps::{CommandInstaller, PackageInstaller};
use super::discovery::{discover_plugins, load_manifest};
use super::loader::ModuleLoader;
use super::manifest::{DEFAULT_VERSION, MANIFEST_FILE, PluginManifest, PluginRecord};
use super::module::{Capabilities, DataStore, HostApp, ModuleProvider};
use super::package::{is_plugin_directory_name, stage_package};
use super::process::ProcessProvider;
use super::registry::{Registry, RegistryEntry, RegistryStore, write_atomic};
use super::validator::{ValidationError, validate};
use crate::config::Config;
use crate::events::{EventBus, PLUGINS_RELOADED};
use crate::{Error, Result};

/// Read-only result of the latest activation pass
#[derive(Debug, Default)]
pub struct Catalog {
    /// Every plugin with a readable manifest, in enumeration order
    pub plugins: Vec<PluginRecord>,
    /// Merged sidebar contributions of activated plugins
    pub sidebar: Map<String, Value>,
    /// Router fragments of activated plugins, keyed by mount segment
    pub routes: BTreeMap<String, axum::Router>,
}

impl Catalog {
    /// Names of all catalogued plugins
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        self.plugins.iter().map(|p| p.name().to_string()).collect()
    }

    /// Catalogued plugin by manifest name (the last one, if duplicated)
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&PluginRecord> {
        self.plugins.iter().rev().find(|p| p.name() == name)
    }
}

/// Summary of one activation pass
#[derive(Debug, Clone, Default)]
pub struct PassReport {
    /// Plugins catalogued
    pub discovered: usize,
    /// Plugins activated
    pub active: usize,
    /// Per-plugin problems that disabled or skipped a plugin
    pub errors: Vec<String>,
}

/// Clears the running flag when dropped, on every exit path
struct PassGuard<'a>(&'a AtomicBool);

impl<'a> PassGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Result<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| Self(flag))
            .map_err(|_| {
                tracing::warn!("plugin pass already running, rejecting request");
                Error::ReentrancyRejected
            })
    }
}

impl Drop for PassGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

struct Inner {
    config: Config,
    store: RegistryStore,
    loader: ModuleLoader,
    installer: Arc<dyn PackageInstaller>,
    events: EventBus,
    host_app: Option<HostApp>,
    data_store: Option<Arc<dyn DataStore>>,
    running: AtomicBool,
    catalog: RwLock<Arc<Catalog>>,
}

/// Builder for [`PluginManager`]
pub struct PluginManagerBuilder {
    config: Config,
    provider: Option<Arc<dyn ModuleProvider>>,
    installer: Option<Arc<dyn PackageInstaller>>,
    events: Option<EventBus>,
    host_app: Option<HostApp>,
    data_store: Option<Arc<dyn DataStore>>,
}

impl PluginManagerBuilder {
    /// Module provider (default: subprocess plugins)
    #[must_use]
    pub fn provider(mut self, provider: Arc<dyn ModuleProvider>) -> Self {
        self.provider = Some(provider);
        self
    }

    /// External package installer (default: the configured command)
    #[must_use]
    pub fn installer(mut self, installer: Arc<dyn PackageInstaller>) -> Self {
        self.installer = Some(installer);
        self
    }

    /// Event bus (default: the process-wide bus)
    #[must_use]
    pub fn events(mut self, events: EventBus) -> Self {
        self.events = Some(events);
        self
    }

    /// Host application handed to plugins
    #[must_use]
    pub fn host_app(mut self, app: HostApp) -> Self {
        self.host_app = Some(app);
        self
    }

    /// Data store handed to plugins
    #[must_use]
    pub fn data_store(mut self, store: Arc<dyn DataStore>) -> Self {
        self.data_store = Some(store);
        self
    }

    /// Build the manager with an empty catalog
    #[must_use]
    pub fn build(self) -> PluginManager {
        let provider: Arc<dyn ModuleProvider> = match self.provider {
            Some(provider) => provider,
            None => Arc::new(ProcessProvider::new(self.config.hook_timeout)),
        };
        let installer: Arc<dyn PackageInstaller> = match self.installer {
            Some(installer) => installer,
            None => Arc::new(CommandInstaller::new(self.config.dependencies.clone())),
        };

        PluginManager {
            inner: Arc::new(Inner {
                store: RegistryStore::new(&self.config.registry_path),
                loader: ModuleLoader::new(provider),
                installer,
                events: self.events.unwrap_or_else(|| EventBus::global().clone()),
                host_app: self.host_app,
                data_store: self.data_store,
                running: AtomicBool::new(false),
                catalog: RwLock::new(Arc::new(Catalog::default())),
                config: self.config,
            }),
        }
    }
}

/// Owner of the plugin catalog and entry point for every plugin operation
#[derive(Clone)]
pub struct PluginManager {
    inner: Arc<Inner>,
}

impl PluginManager {
    /// Manager with default provider, installer and the global event bus
    #[must_use]
    pub fn new(config: Config) -> Self {
        Self::builder(config).build()
    }

    /// Start building a manager
    #[must_use]
    pub fn builder(config: Config) -> PluginManagerBuilder {
        PluginManagerBuilder {
            config,
            provider: None,
            installer: None,
            events: None,
            host_app: None,
            data_store: None,
        }
    }

    /// Active configuration
    #[must_use]
    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    /// Event bus shared with plugins
    #[must_use]
    pub fn events(&self) -> &EventBus {
        &self.inner.events
    }

    /// Non-owning handle for plugins
    #[must_use]
    pub fn handle(&self) -> PluginManagerHandle {
        PluginManagerHandle {
            inner: Arc::downgrade(&self.inner),
        }
    }

    /// Whether a pass or mutating operation is in progress
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::Acquire)
    }

    /// Snapshot of the latest catalog
    #[must_use]
    pub fn catalog(&self) -> Arc<Catalog> {
        Arc::clone(
            &self
                .inner
                .catalog
                .read()
                .unwrap_or_else(PoisonError::into_inner),
        )
    }

    /// Names of all catalogued plugins; empty before the first pass
    #[must_use]
    pub fn list(&self) -> Vec<String> {
        self.catalog().names()
    }

    /// Merged sidebar contributions of the latest pass
    #[must_use]
    pub fn sidebar(&self) -> Map<String, Value> {
        self.catalog().sidebar.clone()
    }

    /// Catalogued plugins whose registry entry is enabled
    #[must_use]
    pub fn enabled_plugins(&self) -> Vec<PluginRecord> {
        self.catalog()
            .plugins
            .iter()
            .filter(|p| p.enabled)
            .cloned()
            .collect()
    }

    /// Persisted registry, read fresh from disk
    pub async fn registry(&self) -> Registry {
        self.inner.store.read().await
    }

    /// Run a full activation pass
    ///
    /// # Errors
    ///
    /// Returns `ReentrancyRejected` if another pass is running. Individual
    /// plugin failures never fail the pass; they are reported in the
    /// returned [`PassReport`]
    pub async fn reload(&self) -> Result<PassReport> {
        let _guard = PassGuard::acquire(&self.inner.running)?;
        Ok(self.pass().await)
    }

    /// Install a plugin package archive, returning the plugin name
    ///
    /// # Errors
    ///
    /// Returns `InvalidPackageLayout` unless the archive root holds exactly
    /// one directory, `PluginAlreadyExists` if that directory is already
    /// installed, a manifest error if the package has no usable manifest,
    /// or `ReentrancyRejected` if a pass is running
    pub async fn install(&self, archive: &Path) -> Result<String> {
        let _guard = PassGuard::acquire(&self.inner.running)?;
        let plugins_dir = &self.inner.config.plugins_dir;
        tracing::info!(archive = %archive.display(), "installing plugin package");

        let staged = stage_package(archive, plugins_dir).await?;
        let (path, manifest) = staged.install_into(plugins_dir).await?;

        let mut registry = self.inner.store.read().await;
        registry.insert(manifest.name.clone(), RegistryEntry::enabled());
        self.inner.store.write(&registry).await?;

        tracing::info!(plugin = %manifest.name, path = %path.display(), "plugin installed");
        self.pass().await;
        Ok(manifest.name)
    }

    /// Remove an installed plugin by directory name
    ///
    /// The plugin's `unregister` hook runs first; a failing hook is logged
    /// and removal continues.
    ///
    /// # Errors
    ///
    /// Returns `PluginNotFound` if the directory does not exist,
    /// `InvalidPluginName` for unsafe names, or `ReentrancyRejected` if a
    /// pass is running
    pub async fn uninstall(&self, directory_name: &str) -> Result<()> {
        let _guard = PassGuard::acquire(&self.inner.running)?;
        let dir = self.plugin_dir(directory_name)?;
        if !tokio::fs::metadata(&dir).await.is_ok_and(|m| m.is_dir()) {
            return Err(Error::PluginNotFound(directory_name.to_string()));
        }

        let name = match load_manifest(&dir).await {
            Ok((manifest_path, manifest)) => {
                let record = PluginRecord::new(manifest, directory_name, manifest_path);
                self.teardown(&record).await;
                record.name().to_string()
            }
            Err(e) => {
                tracing::warn!(
                    directory = %directory_name,
                    error = %e,
                    "cannot read manifest, removing without unregister"
                );
                directory_name.to_string()
            }
        };

        self.inner.loader.purge(&dir);
        tokio::fs::remove_dir_all(&dir).await?;

        let mut registry = self.inner.store.read().await;
        registry.remove(&name);
        self.inner.store.write(&registry).await?;

        tracing::info!(plugin = %name, directory = %directory_name, "plugin uninstalled");
        self.pass().await;
        Ok(())
    }

    /// Flip a plugin's enabled flag, returning the new state
    ///
    /// # Errors
    ///
    /// Returns `PluginNotFound` if the name is not in the registry or
    /// `ReentrancyRejected` if a pass is running
    pub async fn toggle(&self, name: &str) -> Result<bool> {
        self.change_enabled(name, None).await
    }

    /// Enable or disable a plugin, returning the new state
    ///
    /// Requesting the current state succeeds without doing anything.
    ///
    /// # Errors
    ///
    /// Returns `PluginNotFound` if the name is not in the registry or
    /// `ReentrancyRejected` if a pass is running
    pub async fn set_enabled(&self, name: &str, enabled: bool) -> Result<bool> {
        self.change_enabled(name, Some(enabled)).await
    }

    async fn change_enabled(&self, name: &str, target: Option<bool>) -> Result<bool> {
        let _guard = PassGuard::acquire(&self.inner.running)?;

        let mut registry = self.inner.store.read().await;
        let Some(current) = registry.get(name).map(|e| e.enabled) else {
            return Err(Error::PluginNotFound(name.to_string()));
        };
        let enabled = target.unwrap_or(!current);
        if enabled == current {
            tracing::info!(plugin = %name, enabled, "plugin already in requested state");
            return Ok(enabled);
        }

        if !enabled {
            match self.locate(name).await {
                Some(record) => {
                    self.teardown(&record).await;
                    self.inner.loader.purge(record.dir());
                }
                None => {
                    tracing::warn!(plugin = %name, "plugin directory not found, skipping unregister");
                }
            }
        }

        registry.insert(name.to_string(), RegistryEntry { enabled });
        self.inner.store.write(&registry).await?;

        tracing::info!(plugin = %name, enabled, "plugin state changed");
        self.pass().await;
        Ok(enabled)
    }

    /// Raw `manifest.json` text of a plugin directory
    ///
    /// # Errors
    ///
    /// Returns `PluginNotFound` if the directory has no manifest
    pub async fn manifest_source(&self, directory_name: &str) -> Result<String> {
        let path = self.plugin_dir(directory_name)?.join(MANIFEST_FILE);
        match tokio::fs::read_to_string(&path).await {
            Ok(text) => Ok(text),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(Error::PluginNotFound(directory_name.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Replace a plugin's `manifest.json`
    ///
    /// The text must parse as a manifest. Changes take effect on the next
    /// pass.
    ///
    /// # Errors
    ///
    /// Returns `PluginNotFound` if the directory does not exist,
    /// `ManifestParse` if the text is not a valid manifest, or the write
    /// failure
    pub async fn save_manifest(&self, directory_name: &str, text: &str) -> Result<()> {
        let dir = self.plugin_dir(directory_name)?;
        if !tokio::fs::metadata(&dir).await.is_ok_and(|m| m.is_dir()) {
            return Err(Error::PluginNotFound(directory_name.to_string()));
        }

        let path = dir.join(MANIFEST_FILE);
        PluginManifest::from_json(text).map_err(|message| Error::ManifestParse {
            path: path.clone(),
            message,
        })?;
        write_atomic(&path, text.as_bytes()).await?;

        tracing::info!(directory = %directory_name, "plugin manifest saved");
        Ok(())
    }

    fn plugin_dir(&self, directory_name: &str) -> Result<PathBuf> {
        if !is_plugin_directory_name(directory_name) {
            return Err(Error::InvalidPluginName(directory_name.to_string()));
        }
        Ok(self.inner.config.plugins_dir.join(directory_name))
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            host_app: self.inner.host_app.clone(),
            data_store: self.inner.data_store.clone(),
            events: self.inner.events.clone(),
            manager: self.handle(),
        }
    }

    /// Find a plugin by manifest name: catalog first, then a directory of
    /// the same name
    async fn locate(&self, name: &str) -> Option<PluginRecord> {
        if let Some(record) = self.catalog().get(name) {
            return Some(record.clone());
        }
        let dir = self.plugin_dir(name).ok()?;
        let (manifest_path, manifest) = load_manifest(&dir).await.ok()?;
        Some(PluginRecord::new(manifest, name, manifest_path))
    }

    /// Best-effort `unregister`
    async fn teardown(&self, record: &PluginRecord) {
        if let Err(e) = self.inner.loader.unregister(record, &self.capabilities()).await {
            tracing::warn!(plugin = %record.name(), error = %e, "unregister failed, continuing");
        }
    }

    /// One activation pass; the caller holds the guard
    async fn pass(&self) -> PassReport {
        let inner = &self.inner;
        tracing::info!(path = %inner.config.plugins_dir.display(), "loading plugins");

        let caps = self.capabilities();
        let mut registry = inner.store.read().await;
        let mut catalog = Catalog::default();
        let mut errors = Vec::new();
        let mut seen = HashSet::new();

        for (directory_name, outcome) in discover_plugins(&inner.config.plugins_dir).await {
            let found = match outcome {
                Ok(found) => found,
                Err(Error::ManifestMissing(path)) => {
                    tracing::warn!(
                        directory = %directory_name,
                        path = %path.display(),
                        "plugin directory has no manifest, skipping"
                    );
                    continue;
                }
                Err(e) => {
                    tracing::error!(directory = %directory_name, error = %e, "failed to load plugin manifest");
                    errors.push(format!("{directory_name}: {e}"));
                    continue;
                }
            };

            let mut record =
                PluginRecord::new(found.manifest, &found.directory_name, found.manifest_path);
            let name = record.name().to_string();

            if !seen.insert(name.clone()) {
                tracing::warn!(
                    plugin = %name,
                    directory = %directory_name,
                    "duplicate plugin name, later directory wins"
                );
            }
            if record.manifest.version.is_none() {
                tracing::warn!(plugin = %name, default = DEFAULT_VERSION, "manifest has no version");
            }
            if !record.manifest.permissions.is_empty() {
                tracing::info!(
                    plugin = %name,
                    permissions = ?record.manifest.permissions,
                    "plugin requests permissions (advisory)"
                );
            }

            registry.entry(name.clone()).or_insert_with(|| {
                tracing::info!(plugin = %name, "new plugin discovered, enabling");
                RegistryEntry::enabled()
            });

            let findings = validate(&record, &registry, &inner.loader, inner.installer.as_ref()).await;
            record.problems = findings.iter().map(ToString::to_string).collect();
            if findings.iter().any(ValidationError::is_fatal) {
                for finding in findings.iter().filter(|f| f.is_fatal()) {
                    tracing::error!(plugin = %name, error = %finding, "plugin failed validation");
                }
                tracing::error!(plugin = %name, "plugin has validation errors, disabling but keeping it listed");
                registry.insert(name.clone(), RegistryEntry { enabled: false });
                errors.push(format!("validation errors in {directory_name}"));
            }

            record.enabled = registry.get(&name).is_some_and(|e| e.enabled);
            tracing::info!(plugin = %name, directory = %directory_name, enabled = record.enabled, "loading plugin");

            if record.enabled {
                match inner.loader.load_and_activate(&record, &caps, &catalog.routes).await {
                    Ok(activation) => {
                        record.active = true;
                        if let Some(contributions) = &record.manifest.adminsidebar {
                            for (key, value) in contributions {
                                catalog.sidebar.insert(key.clone(), value.clone());
                            }
                        }
                        if let Some((segment, router)) = activation.route {
                            catalog.routes.insert(segment, router);
                        }
                    }
                    Err(e) => {
                        tracing::error!(plugin = %name, error = %e, "failed to activate plugin");
                        record.problems.push(e.to_string());
                        record.enabled = false;
                        registry.insert(name.clone(), RegistryEntry { enabled: false });
                        errors.push(format!("loading error in {directory_name}: {e}"));
                    }
                }
            } else {
                inner.loader.purge(record.dir());
            }

            catalog.plugins.push(record);
        }

        if let Err(e) = inner.store.write(&registry).await {
            tracing::error!(error = %e, "failed to write plugin registry");
        }

        let report = PassReport {
            discovered: catalog.plugins.len(),
            active: catalog.plugins.iter().filter(|p| p.active).count(),
            errors,
        };
        if report.errors.is_empty() {
            tracing::info!(plugins = report.discovered, active = report.active, "plugins loaded");
        } else {
            tracing::error!(
                plugins = report.discovered,
                active = report.active,
                errors = %report.errors.join(", "),
                "errors occurred while loading plugins"
            );
        }

        let names = catalog.names();
        *inner.catalog.write().unwrap_or_else(PoisonError::into_inner) = Arc::new(catalog);
        inner.events.publish(
            PLUGINS_RELOADED,
            json!({ "plugins": names, "errors": report.errors.len() }),
        );

        report
    }
}

impl std::fmt::Debug for PluginManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginManager")
            .field("plugins_dir", &self.inner.config.plugins_dir)
            .field("running", &self.is_running())
            .field("loader", &self.inner.loader)
            .finish_non_exhaustive()
    }
}

/// Weak handle to a [`PluginManager`], handed to plugins
///
/// Holding it does not keep the manager alive. Every accessor degrades to
/// an empty answer once the manager is gone.
#[derive(Clone, Default)]
pub struct PluginManagerHandle {
    inner: Weak<Inner>,
}

impl PluginManagerHandle {
    /// Handle not attached to any manager
    #[must_use]
    pub fn detached() -> Self {
        Self::default()
    }

    /// Upgrade to a full manager if it is still alive
    #[must_use]
    pub fn upgrade(&self) -> Option<PluginManager> {
        self.inner.upgrade().map(|inner| PluginManager { inner })
    }

    /// Names of all catalogued plugins
    #[must_use]
    pub fn list(&self) -> Vec<String> {
        self.upgrade().map(|m| m.list()).unwrap_or_default()
    }

    /// Snapshot of the latest catalog
    #[must_use]
    pub fn catalog(&self) -> Option<Arc<Catalog>> {
        self.upgrade().map(|m| m.catalog())
    }

    /// Whether `name` was enabled after the latest pass
    #[must_use]
    pub fn is_enabled(&self, name: &str) -> bool {
        self.catalog()
            .and_then(|c| c.get(name).map(|p| p.enabled))
            .unwrap_or(false)
    }
}

impl std::fmt::Debug for PluginManagerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginManagerHandle")
            .field("attached", &(self.inner.strong_count() > 0))
            .finish()
    }
}
