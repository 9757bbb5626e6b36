//! Plugin modules and the capabilities handed to them
//!
//! A [`PluginModule`] is what importing a plugin's entry file produces. Every
//! part is optional: a plugin may only contribute a sidebar entry, only a
//! router, or only lifecycle hooks.
//!
//! Importing is abstracted behind [`ModuleProvider`]. The default provider
//! runs entry files as subprocesses (see [`super::process`]); embedding hosts
//! and tests use [`StaticProvider`] to supply modules built in Rust.

use std::any::Any;
use std::collections::HashMap;
use std::future::Future;
use std::path::Path;
use std::sync::{Arc, PoisonError, RwLock};

use async_trait::async_trait;
use futures::future::BoxFuture;
use thiserror::Error;

use super::manager::PluginManagerHandle;
use super::manifest::PluginRecord;
use crate::events::EventBus;

/// Opaque host application handle
pub type HostApp = Arc<dyn Any + Send + Sync>;

/// Key/value store shared with plugins
#[async_trait]
pub trait DataStore: Send + Sync {
    /// Value stored under `key`
    async fn get(&self, key: &str) -> Option<serde_json::Value>;

    /// Store `value` under `key`, replacing any previous value
    async fn set(&self, key: &str, value: serde_json::Value);

    /// Remove `key`, returning true if it was present
    async fn delete(&self, key: &str) -> bool;
}

/// In-memory [`DataStore`]
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: tokio::sync::RwLock<HashMap<String, serde_json::Value>>,
}

impl MemoryStore {
    /// Create an empty store
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DataStore for MemoryStore {
    async fn get(&self, key: &str) -> Option<serde_json::Value> {
        self.entries.read().await.get(key).cloned()
    }

    async fn set(&self, key: &str, value: serde_json::Value) {
        self.entries.write().await.insert(key.to_string(), value);
    }

    async fn delete(&self, key: &str) -> bool {
        self.entries.write().await.remove(key).is_some()
    }
}

/// Everything a plugin receives when it is registered or unregistered
#[derive(Clone)]
pub struct Capabilities {
    /// Host application handle, if the host provides one
    pub host_app: Option<HostApp>,
    /// Shared data store, if the host provides one
    pub data_store: Option<Arc<dyn DataStore>>,
    /// Event bus shared by the host and all plugins
    pub events: EventBus,
    /// Non-owning handle back to the plugin manager
    pub manager: PluginManagerHandle,
}

impl std::fmt::Debug for Capabilities {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Capabilities")
            .field("host_app", &self.host_app.is_some())
            .field("data_store", &self.data_store.is_some())
            .field("events", &self.events)
            .finish_non_exhaustive()
    }
}

/// A `register` or `unregister` entry point
#[async_trait]
pub trait LifecycleHook: Send + Sync {
    /// Run the hook
    ///
    /// # Errors
    ///
    /// Returns a message describing why the hook failed
    async fn call(&self, caps: &Capabilities) -> Result<(), String>;
}

type HookFn = dyn Fn(Capabilities) -> BoxFuture<'static, Result<(), String>> + Send + Sync;

/// [`LifecycleHook`] backed by an async closure
pub struct FnHook {
    f: Box<HookFn>,
}

impl FnHook {
    /// Wrap an async closure
    pub fn new<F, Fut>(f: F) -> Self
    where
        F: Fn(Capabilities) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), String>> + Send + 'static,
    {
        Self {
            f: Box::new(move |caps| Box::pin(f(caps))),
        }
    }
}

#[async_trait]
impl LifecycleHook for FnHook {
    async fn call(&self, caps: &Capabilities) -> Result<(), String> {
        (self.f)(caps.clone()).await
    }
}

/// The evaluated entry module of a plugin
#[derive(Clone, Default)]
pub struct PluginModule {
    register: Option<Arc<dyn LifecycleHook>>,
    unregister: Option<Arc<dyn LifecycleHook>>,
    router: Option<axum::Router>,
}

impl PluginModule {
    /// Module with no capabilities
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the `register` hook from an async closure
    #[must_use]
    pub fn on_register<F, Fut>(self, f: F) -> Self
    where
        F: Fn(Capabilities) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), String>> + Send + 'static,
    {
        self.with_register(Arc::new(FnHook::new(f)))
    }

    /// Set the `unregister` hook from an async closure
    #[must_use]
    pub fn on_unregister<F, Fut>(self, f: F) -> Self
    where
        F: Fn(Capabilities) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), String>> + Send + 'static,
    {
        self.with_unregister(Arc::new(FnHook::new(f)))
    }

    /// Set the `register` hook
    #[must_use]
    pub fn with_register(mut self, hook: Arc<dyn LifecycleHook>) -> Self {
        self.register = Some(hook);
        self
    }

    /// Set the `unregister` hook
    #[must_use]
    pub fn with_unregister(mut self, hook: Arc<dyn LifecycleHook>) -> Self {
        self.unregister = Some(hook);
        self
    }

    /// Set the HTTP router
    #[must_use]
    pub fn with_router(mut self, router: axum::Router) -> Self {
        self.router = Some(router);
        self
    }

    /// The `register` hook, if exported
    #[must_use]
    pub fn register_hook(&self) -> Option<&Arc<dyn LifecycleHook>> {
        self.register.as_ref()
    }

    /// The `unregister` hook, if exported
    #[must_use]
    pub fn unregister_hook(&self) -> Option<&Arc<dyn LifecycleHook>> {
        self.unregister.as_ref()
    }

    /// The HTTP router, if exported
    #[must_use]
    pub const fn router(&self) -> Option<&axum::Router> {
        self.router.as_ref()
    }
}

impl std::fmt::Debug for PluginModule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginModule")
            .field("register", &self.register.is_some())
            .field("unregister", &self.unregister.is_some())
            .field("router", &self.router.is_some())
            .finish()
    }
}

/// Why a plugin's entry module could not be imported
#[derive(Debug, Clone, Error)]
pub enum ImportError {
    /// The module requires a package that is not installed
    #[error("cannot find module '{module}'")]
    ModuleNotFound {
        /// Missing package name
        module: String,
    },
    /// Any other load or evaluation failure
    #[error("{0}")]
    Failed(String),
}

/// Turns a plugin entry file into a [`PluginModule`]
#[async_trait]
pub trait ModuleProvider: Send + Sync {
    /// Import the entry module of `record`, located at `entry`
    ///
    /// Each call must produce a fresh evaluation of the module.
    ///
    /// # Errors
    ///
    /// Returns `ModuleNotFound` when a required package is missing and
    /// `Failed` for any other failure
    async fn import(
        &self,
        record: &PluginRecord,
        entry: &Path,
    ) -> Result<PluginModule, ImportError>;
}

type ModuleFactory = Arc<dyn Fn() -> Result<PluginModule, ImportError> + Send + Sync>;

/// Provider serving modules built in-process, keyed by plugin name
#[derive(Default)]
pub struct StaticProvider {
    factories: RwLock<HashMap<String, ModuleFactory>>,
}

impl StaticProvider {
    /// Create an empty provider
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Serve modules for `plugin` from `factory`
    ///
    /// The factory runs on every import, so each activation gets a fresh
    /// module value.
    pub fn insert<F>(&self, plugin: impl Into<String>, factory: F)
    where
        F: Fn() -> Result<PluginModule, ImportError> + Send + Sync + 'static,
    {
        self.factories
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(plugin.into(), Arc::new(factory));
    }

    /// Builder form of [`Self::insert`]
    #[must_use]
    pub fn with<F>(self, plugin: impl Into<String>, factory: F) -> Self
    where
        F: Fn() -> Result<PluginModule, ImportError> + Send + Sync + 'static,
    {
        self.insert(plugin, factory);
        self
    }
}

#[async_trait]
impl ModuleProvider for StaticProvider {
    async fn import(
        &self,
        record: &PluginRecord,
        _entry: &Path,
    ) -> Result<PluginModule, ImportError> {
        let factory = self
            .factories
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(record.name())
            .cloned();

        match factory {
            Some(factory) => factory(),
            None => Err(ImportError::Failed(format!(
                "no module registered for plugin {}",
                record.name()
            ))),
        }
    }
}

impl std::fmt::Debug for StaticProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let factories = self.factories.read().unwrap_or_else(PoisonError::into_inner);
        let mut names: Vec<&String> = factories.keys().collect();
        names.sort();
        f.debug_struct("StaticProvider").field("plugins", &names).finish()
    }
}
