//! Plugin manifest format (`manifest.json`)

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Manifest file name inside every plugin directory
pub const MANIFEST_FILE: &str = "manifest.json";

/// Version assumed when a manifest does not declare one
pub const DEFAULT_VERSION: &str = "1.0.0";

/// Prefix marking a dependency on another plugin
const PLUGIN_DEPENDENCY_PREFIX: &str = "plugin:";

/// Declarative descriptor of a plugin
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PluginManifest {
    /// Unique plugin identifier
    pub name: String,
    /// Semver version string
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    /// Entry module, relative to the plugin directory
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub main: Option<String>,
    /// Path segment the plugin router is mounted under
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub router: Option<String>,
    /// `plugin:<name>` references or external package identifiers
    #[serde(default)]
    pub dependencies: Vec<String>,
    /// Capability tags, advisory only
    #[serde(default)]
    pub permissions: Vec<String>,
    /// Contributions merged into the host's admin sidebar
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub adminsidebar: Option<serde_json::Map<String, serde_json::Value>>,
}

impl PluginManifest {
    /// Parse manifest JSON
    ///
    /// # Errors
    ///
    /// Returns the parser message if the JSON is malformed, a required field
    /// is missing, or `name` is blank
    pub fn from_json(content: &str) -> Result<Self, String> {
        let manifest: Self = serde_json::from_str(content).map_err(|e| e.to_string())?;
        if manifest.name.trim().is_empty() {
            return Err("`name` must not be empty".to_string());
        }
        Ok(manifest)
    }

    /// Declared version, or the default when absent
    #[must_use]
    pub fn version(&self) -> &str {
        self.version.as_deref().unwrap_or(DEFAULT_VERSION)
    }

    /// Absolute path of the entry module, if one is declared
    #[must_use]
    pub fn entry_path(&self, plugin_dir: &Path) -> Option<PathBuf> {
        self.main
            .as_deref()
            .map(str::trim)
            .filter(|m| !m.is_empty())
            .map(|m| plugin_dir.join(m))
    }

    /// Parsed dependency list, in declaration order
    pub fn dependencies(&self) -> impl Iterator<Item = Dependency<'_>> {
        self.dependencies.iter().map(|d| Dependency::parse(d))
    }
}

/// A single manifest dependency
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dependency<'a> {
    /// Another plugin, by manifest name
    Plugin(&'a str),
    /// An external package resolved by the package manager
    External(&'a str),
}

impl<'a> Dependency<'a> {
    /// Classify a raw dependency string
    #[must_use]
    pub fn parse(raw: &'a str) -> Self {
        let raw = raw.trim();
        raw.strip_prefix(PLUGIN_DEPENDENCY_PREFIX)
            .map_or(Self::External(raw), Self::Plugin)
    }
}

/// A catalogued plugin, rebuilt on every activation pass
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PluginRecord {
    /// Manifest as read from disk
    #[serde(flatten)]
    pub manifest: PluginManifest,
    /// Name of the directory under the plugin root
    pub directory_name: String,
    /// Absolute path of `manifest.json`
    pub manifest_path: PathBuf,
    /// Registry state after the pass
    pub enabled: bool,
    /// Whether the plugin was loaded and registered during the pass
    pub active: bool,
    /// Validation and activation problems found during the pass
    pub problems: Vec<String>,
}

impl PluginRecord {
    /// Build a fresh record for a discovered manifest
    #[must_use]
    pub fn new(manifest: PluginManifest, directory_name: &str, manifest_path: PathBuf) -> Self {
        Self {
            manifest,
            directory_name: directory_name.to_string(),
            manifest_path,
            enabled: false,
            active: false,
            problems: Vec::new(),
        }
    }

    /// Manifest name
    #[must_use]
    pub fn name(&self) -> &str {
        &self.manifest.name
    }

    /// Directory containing the plugin
    #[must_use]
    pub fn dir(&self) -> &Path {
        self.manifest_path.parent().unwrap_or(&self.manifest_path)
    }
}
