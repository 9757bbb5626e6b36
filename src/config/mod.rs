//! Configuration management for the plugin runtime

pub mod file;

use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::{Error, Result};

/// Registry file name inside the plugin directory
pub const REGISTRY_FILE: &str = "plugins.json";

/// Default timeout for one plugin hook invocation
const DEFAULT_HOOK_TIMEOUT_SECS: u64 = 10;

/// Plugin runtime configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Directory holding one sub-directory per plugin
    pub plugins_dir: PathBuf,

    /// Path of the persisted enablement registry
    pub registry_path: PathBuf,

    /// External dependency handling
    pub dependencies: DependencyConfig,

    /// Timeout for a single plugin hook invocation
    pub hook_timeout: Duration,
}

/// External package resolution and installation
#[derive(Debug, Clone)]
pub struct DependencyConfig {
    /// Install missing external packages automatically
    pub auto_install: bool,

    /// Directory where installed packages are looked up
    pub modules_dir: PathBuf,

    /// Package manager command; the package name is appended
    pub install_command: Vec<String>,

    /// Working directory for the package manager
    pub workdir: PathBuf,
}

impl DependencyConfig {
    /// Defaults rooted at a plugin directory
    #[must_use]
    pub fn for_dir(plugins_dir: &Path) -> Self {
        let workdir = host_root(plugins_dir);
        Self {
            auto_install: true,
            modules_dir: workdir.join("node_modules"),
            install_command: default_install_command(),
            workdir,
        }
    }
}

/// Packages are installed next to the plugin directory, never inside it
fn host_root(plugins_dir: &Path) -> PathBuf {
    plugins_dir
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .map_or_else(|| PathBuf::from("."), Path::to_path_buf)
}

fn default_install_command() -> Vec<String> {
    vec!["npm".to_string(), "install".to_string()]
}

/// Default plugin directory (`~/.local/share/panel/plugins` on Linux)
#[must_use]
pub fn default_plugins_dir() -> PathBuf {
    directories::BaseDirs::new().map_or_else(
        || PathBuf::from("plugins"),
        |d| d.data_dir().join("panel").join("plugins"),
    )
}

impl Config {
    /// Fully defaulted configuration rooted at `plugins_dir`
    #[must_use]
    pub fn for_dir(plugins_dir: impl Into<PathBuf>) -> Self {
        let plugins_dir = plugins_dir.into();
        Self {
            registry_path: plugins_dir.join(REGISTRY_FILE),
            dependencies: DependencyConfig::for_dir(&plugins_dir),
            hook_timeout: Duration::from_secs(DEFAULT_HOOK_TIMEOUT_SECS),
            plugins_dir,
        }
    }

    /// Load configuration from environment variables and the TOML file
    ///
    /// Priority is env > toml > default.
    ///
    /// # Errors
    ///
    /// Returns error if an environment override is malformed or the plugin
    /// directory cannot be created
    pub fn load() -> Result<Self> {
        let fc = file::load_config_file().plugins;

        let plugins_dir = std::env::var("PANEL_PLUGINS_DIR")
            .ok()
            .or(fc.dir)
            .map_or_else(default_plugins_dir, PathBuf::from);

        std::fs::create_dir_all(&plugins_dir).map_err(|e| {
            Error::Config(format!(
                "cannot create plugin directory {}: {e}",
                plugins_dir.display()
            ))
        })?;

        let registry_path = std::env::var("PANEL_PLUGIN_REGISTRY")
            .ok()
            .or(fc.registry)
            .map_or_else(|| plugins_dir.join(REGISTRY_FILE), PathBuf::from);

        let modules_dir = std::env::var("PANEL_PLUGIN_MODULES_DIR")
            .ok()
            .or(fc.modules_dir)
            .map_or_else(|| host_root(&plugins_dir).join("node_modules"), PathBuf::from);

        let auto_install = match std::env::var("PANEL_PLUGIN_AUTO_INSTALL") {
            Ok(v) => parse_bool(&v).ok_or_else(|| {
                Error::Config(format!("PANEL_PLUGIN_AUTO_INSTALL: not a boolean: {v}"))
            })?,
            Err(_) => fc.auto_install.unwrap_or(true),
        };

        let install_command = std::env::var("PANEL_PLUGIN_INSTALL_CMD")
            .ok()
            .map(|s| s.split_whitespace().map(String::from).collect::<Vec<_>>())
            .or(fc.install_command)
            .filter(|cmd| !cmd.is_empty())
            .unwrap_or_else(default_install_command);

        let hook_timeout_secs = match std::env::var("PANEL_PLUGIN_HOOK_TIMEOUT_SECS") {
            Ok(v) => v.trim().parse::<u64>().map_err(|e| {
                Error::Config(format!("PANEL_PLUGIN_HOOK_TIMEOUT_SECS: {e}"))
            })?,
            Err(_) => fc.hook_timeout_secs.unwrap_or(DEFAULT_HOOK_TIMEOUT_SECS),
        };

        Ok(Self {
            registry_path,
            dependencies: DependencyConfig {
                auto_install,
                modules_dir,
                install_command,
                workdir: host_root(&plugins_dir),
            },
            hook_timeout: Duration::from_secs(hook_timeout_secs.max(1)),
            plugins_dir,
        })
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
