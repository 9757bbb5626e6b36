//! Plugin discovery - scan the plugin root for `manifest.json` files

use std::path::{Path, PathBuf};

use super::manifest::{MANIFEST_FILE, PluginManifest};
use crate::{Error, Result};

/// A plugin directory with a parsed manifest
#[derive(Debug, Clone)]
pub struct DiscoveredPlugin {
    /// Directory name under the plugin root
    pub directory_name: String,
    /// Absolute path of the plugin directory
    pub path: PathBuf,
    /// Absolute path of `manifest.json`
    pub manifest_path: PathBuf,
    /// Parsed manifest
    pub manifest: PluginManifest,
}

/// List candidate plugin directories in enumeration order
///
/// Entries are sorted by name so every pass processes plugins in the same
/// order. Plain files (such as the registry) and hidden entries (including
/// install scratch directories) are skipped.
pub async fn plugin_directories(root: &Path) -> Vec<(String, PathBuf)> {
    let mut entries = match tokio::fs::read_dir(root).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            tracing::debug!(path = %root.display(), "plugin directory does not exist, skipping");
            return Vec::new();
        }
        Err(e) => {
            tracing::warn!(path = %root.display(), error = %e, "failed to read plugin directory");
            return Vec::new();
        }
    };

    let mut dirs = Vec::new();
    loop {
        let entry = match entries.next_entry().await {
            Ok(Some(entry)) => entry,
            Ok(None) => break,
            Err(e) => {
                tracing::warn!(path = %root.display(), error = %e, "failed to list plugin directory");
                break;
            }
        };

        let Ok(name) = entry.file_name().into_string() else {
            tracing::warn!(path = %entry.path().display(), "skipping non UTF-8 plugin directory");
            continue;
        };
        if name.starts_with('.') {
            continue;
        }

        let path = entry.path();
        match tokio::fs::metadata(&path).await {
            Ok(meta) if meta.is_dir() => dirs.push((name, path)),
            Ok(_) => {}
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "failed to stat plugin entry");
            }
        }
    }

    dirs.sort_by(|a, b| a.0.cmp(&b.0));
    dirs
}

/// Load and parse the manifest of one plugin directory
///
/// # Errors
///
/// Returns `ManifestMissing` if there is no manifest file and
/// `ManifestParse` if it cannot be read as a manifest
pub async fn load_manifest(plugin_dir: &Path) -> Result<(PathBuf, PluginManifest)> {
    let manifest_path = plugin_dir.join(MANIFEST_FILE);

    let content = match tokio::fs::read_to_string(&manifest_path).await {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(Error::ManifestMissing(manifest_path));
        }
        Err(e) => {
            return Err(Error::ManifestParse {
                path: manifest_path,
                message: e.to_string(),
            });
        }
    };

    match PluginManifest::from_json(&content) {
        Ok(manifest) => Ok((manifest_path, manifest)),
        Err(message) => Err(Error::ManifestParse {
            path: manifest_path,
            message,
        }),
    }
}

/// Scan the plugin root, returning each directory with its manifest outcome
pub async fn discover_plugins(root: &Path) -> Vec<(String, Result<DiscoveredPlugin>)> {
    let mut results = Vec::new();

    for (directory_name, path) in plugin_directories(root).await {
        let outcome = load_manifest(&path)
            .await
            .map(|(manifest_path, manifest)| {
                tracing::debug!(
                    plugin = %manifest.name,
                    path = %path.display(),
                    "discovered plugin"
                );
                DiscoveredPlugin {
                    directory_name: directory_name.clone(),
                    path,
                    manifest_path,
                    manifest,
                }
            });
        results.push((directory_name, outcome));
    }

    results
}
