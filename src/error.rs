//! Error types for the plugin runtime

use std::path::PathBuf;

use thiserror::Error;

/// Result type alias for plugin runtime operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by the public plugin operations
///
/// Per-plugin problems found during an activation pass never show up here;
/// they are collected by the pass and the offending plugin is disabled
/// instead. Install, uninstall and toggle report failures directly.
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Plugin directory has no `manifest.json`
    #[error("manifest not found: {}", .0.display())]
    ManifestMissing(PathBuf),

    /// `manifest.json` exists but is not a usable manifest
    #[error("invalid manifest {}: {message}", .path.display())]
    ManifestParse {
        /// Path of the offending manifest
        path: PathBuf,
        /// Parser message
        message: String,
    },

    /// Package archive does not contain exactly one top-level directory
    #[error("invalid package layout: {0}")]
    InvalidPackageLayout(String),

    /// A plugin directory with this name is already installed
    #[error("plugin already exists: {0}")]
    PluginAlreadyExists(String),

    /// No plugin directory or registry entry with this name
    #[error("plugin not found: {0}")]
    PluginNotFound(String),

    /// Name cannot be used as a plugin directory
    #[error("invalid plugin name: {0:?}")]
    InvalidPluginName(String),

    /// An activation pass was already running
    #[error("an activation pass is already running")]
    ReentrancyRejected,

    /// External dependency installation failed
    #[error("dependency error: {0}")]
    Dependency(String),

    /// IO error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// TOML parsing error
    #[error("toml error: {0}")]
    Toml(#[from] toml::de::Error),

    /// Package archive could not be read
    #[error("archive error: {0}")]
    Archive(#[from] zip::result::ZipError),
}
