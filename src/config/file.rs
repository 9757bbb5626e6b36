//! TOML configuration file loading
//!
//! Supports `~/.config/panel/plugins.toml` as a persistent config source.
//! All fields are optional; the file is a partial overlay on top of defaults.

use std::path::PathBuf;

use serde::Deserialize;

/// Top-level TOML configuration file schema
#[derive(Debug, Default, Deserialize)]
pub struct PanelConfigFile {
    /// Plugin runtime configuration
    #[serde(default)]
    pub plugins: PluginsFileConfig,
}

/// Plugin runtime configuration
#[derive(Debug, Default, Deserialize)]
pub struct PluginsFileConfig {
    /// Directory holding one sub-directory per plugin
    pub dir: Option<String>,

    /// Path of the enablement registry (`plugins.json`)
    pub registry: Option<String>,

    /// Directory where external plugin packages are resolved
    pub modules_dir: Option<String>,

    /// Install missing external packages automatically
    pub auto_install: Option<bool>,

    /// Package manager command, the package name is appended
    pub install_command: Option<Vec<String>>,

    /// Timeout for a single plugin hook invocation
    pub hook_timeout_secs: Option<u64>,
}

/// Load the TOML config file from the standard path
///
/// Returns `PanelConfigFile::default()` if the file doesn't exist or can't be parsed.
pub fn load_config_file() -> PanelConfigFile {
    let Some(path) = config_file_path() else {
        return PanelConfigFile::default();
    };

    if !path.exists() {
        return PanelConfigFile::default();
    }

    match std::fs::read_to_string(&path) {
        Ok(content) => match parse_config(&content) {
            Ok(config) => {
                tracing::info!(path = %path.display(), "loaded config file");
                config
            }
            Err(e) => {
                tracing::warn!(
                    path = %path.display(),
                    error = %e,
                    "failed to parse config file, using defaults"
                );
                PanelConfigFile::default()
            }
        },
        Err(e) => {
            tracing::warn!(
                path = %path.display(),
                error = %e,
                "failed to read config file"
            );
            PanelConfigFile::default()
        }
    }
}

/// Parse config file contents
///
/// # Errors
///
/// Returns error if the content is not valid TOML for this schema
pub fn parse_config(content: &str) -> crate::Result<PanelConfigFile> {
    Ok(toml::from_str(content)?)
}

/// Return the config file path: `~/.config/panel/plugins.toml`
pub fn config_file_path() -> Option<PathBuf> {
    directories::BaseDirs::new().map(|d| d.config_dir().join("panel").join("plugins.toml"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_partial_overlay() {
        let config = parse_config(
            r#"
[plugins]
dir = "/srv/panel/plugins"
install_command = ["pnpm", "add"]
"#,
        )
        .unwrap();

        assert_eq!(config.plugins.dir.as_deref(), Some("/srv/panel/plugins"));
        assert_eq!(
            config.plugins.install_command,
            Some(vec!["pnpm".to_string(), "add".to_string()])
        );
        assert!(config.plugins.auto_install.is_none());
        assert!(config.plugins.registry.is_none());
    }

    #[test]
    fn empty_file_is_default() {
        let config = parse_config("").unwrap();
        assert!(config.plugins.dir.is_none());
    }

    #[test]
    fn reject_wrong_types() {
        assert!(parse_config("[plugins]\nauto_install = \"maybe\"").is_err());
    }
}
