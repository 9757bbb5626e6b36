//! Plugin runtime
//!
//! Plugins live one per directory under the plugin root, each described by
//! a `manifest.json`. Enablement is persisted in `plugins.json`. The
//! [`PluginManager`] re-derives the catalog, sidebar contributions and
//! mounted routers from disk on every activation pass.

pub mod deps;
pub mod discovery;
pub mod loader;
pub mod manager;
pub mod manifest;
pub mod module;
pub mod package;
pub mod process;
pub mod registry;
pub mod routes;
pub mod validator;

pub use deps::{CommandInstaller, PackageInstaller};
pub use discovery::{DiscoveredPlugin, discover_plugins};
pub use loader::{ActivationError, ModuleLoader};
pub use manager::{Catalog, PassReport, PluginManager, PluginManagerBuilder, PluginManagerHandle};
pub use manifest::{Dependency, PluginManifest, PluginRecord};
pub use module::{
    Capabilities, DataStore, FnHook, HostApp, ImportError, LifecycleHook, MemoryStore,
    ModuleProvider, PluginModule, StaticProvider,
};
pub use process::ProcessProvider;
pub use registry::{Registry, RegistryEntry, RegistryReadError, RegistryStore};
pub use validator::ValidationError;
