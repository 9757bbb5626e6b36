//! Panel Plugins - plugin runtime for the administration panel
//!
//! This library discovers, validates, activates, installs and removes
//! third-party plugin packages while the panel is running:
//! - Manifest discovery and validation, with best-effort dependency install
//! - Activation passes guarded against re-entry
//! - Zip package install/uninstall and enable/disable toggling
//! - A process-wide event bus shared by the host and plugins
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │                 Host (CLI, admin UI)                │
//! │   install  │  uninstall  │  toggle  │  reload  │ list│
//! └────────────────────┬────────────────────────────────┘
//!                      │
//! ┌────────────────────▼────────────────────────────────┐
//! │                  PluginManager                      │
//! │  Registry  │  Validator  │  Loader  │  Packages     │
//! └────────────────────┬────────────────────────────────┘
//!                      │
//! ┌────────────────────▼────────────────────────────────┐
//! │                    Plugins                          │
//! │  process modules  │  static modules  │  Event Bus   │
//! └─────────────────────────────────────────────────────┘
//! ```

pub mod config;
pub mod error;
pub mod events;
pub mod plugins;

pub use config::Config;
pub use error::{Error, Result};
pub use events::{BusEvent, EventBus, SubscriptionId};
pub use plugins::{
    Capabilities, Catalog, ModuleProvider, PassReport, PluginManager, PluginManagerHandle,
    PluginManifest, PluginModule, PluginRecord, StaticProvider,
};
