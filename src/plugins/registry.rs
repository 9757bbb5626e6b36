//! Persisted enablement registry (`plugins.json`)
//!
//! The registry maps plugin name to `{"enabled": bool}`. Reads never fail:
//! a missing, empty or malformed file is logged and treated as empty.
//! Writes go to a sibling temp file which is then renamed over the target,
//! so a crash mid-write leaves the previous registry intact.
//!
//! Only single-process atomicity is provided. Two processes writing the
//! same registry concurrently is not supported.

use std::collections::BTreeMap;
use std::ffi::OsString;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::ser::{PrettyFormatter, Serializer};
use thiserror::Error;

/// Registry contents, keyed by plugin name
pub type Registry = BTreeMap<String, RegistryEntry>;

/// Persisted state of one plugin
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryEntry {
    /// Whether the plugin is activated on the next pass
    pub enabled: bool,
}

impl RegistryEntry {
    /// Entry for a newly discovered or installed plugin
    #[must_use]
    pub const fn enabled() -> Self {
        Self { enabled: true }
    }
}

/// Why the registry could not be read
#[derive(Debug, Error)]
pub enum RegistryReadError {
    /// File does not exist
    #[error("registry file does not exist")]
    Missing,
    /// File exists but is blank
    #[error("registry file is empty")]
    Empty,
    /// File is not a valid registry document
    #[error("registry file is malformed: {0}")]
    Malformed(#[from] serde_json::Error),
    /// File could not be read
    #[error("registry file could not be read: {0}")]
    Io(#[from] std::io::Error),
}

/// Reader/writer for the registry file
#[derive(Debug, Clone)]
pub struct RegistryStore {
    path: PathBuf,
}

impl RegistryStore {
    /// Store backed by `path`
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Path of the registry file
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the registry, reporting why it could not be read
    ///
    /// # Errors
    ///
    /// Returns the specific read failure
    pub async fn try_read(&self) -> Result<Registry, RegistryReadError> {
        let content = match tokio::fs::read_to_string(&self.path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(RegistryReadError::Missing);
            }
            Err(e) => return Err(e.into()),
        };

        if content.trim().is_empty() {
            return Err(RegistryReadError::Empty);
        }

        Ok(serde_json::from_str(&content)?)
    }

    /// Read the registry, treating every failure as an empty registry
    pub async fn read(&self) -> Registry {
        match self.try_read().await {
            Ok(registry) => registry,
            Err(RegistryReadError::Missing) => {
                tracing::info!(path = %self.path.display(), "no plugin registry yet, starting empty");
                Registry::new()
            }
            Err(RegistryReadError::Empty) => {
                tracing::error!(path = %self.path.display(), "plugin registry is empty");
                Registry::new()
            }
            Err(RegistryReadError::Malformed(e)) => {
                tracing::error!(
                    path = %self.path.display(),
                    error = %e,
                    "plugin registry is not valid JSON, treating as empty"
                );
                Registry::new()
            }
            Err(RegistryReadError::Io(e)) => {
                tracing::error!(
                    path = %self.path.display(),
                    error = %e,
                    "failed to read plugin registry, treating as empty"
                );
                Registry::new()
            }
        }
    }

    /// Atomically replace the registry file
    ///
    /// # Errors
    ///
    /// Returns error if serialization, the temp write or the rename fails
    pub async fn write(&self, registry: &Registry) -> crate::Result<()> {
        let bytes = to_pretty_json(registry)?;
        write_atomic(&self.path, &bytes).await?;

        tracing::info!(
            path = %self.path.display(),
            plugins = registry.len(),
            "plugin registry written"
        );
        Ok(())
    }
}

/// Replace `path` by writing a sibling `.tmp` file and renaming it over
///
/// # Errors
///
/// Returns error if the temp write or the rename fails; the temp file is
/// removed on a failed rename
pub async fn write_atomic(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent).await?;
    }

    let tmp = temp_path(path);
    tokio::fs::write(&tmp, bytes).await?;
    if let Err(e) = tokio::fs::rename(&tmp, path).await {
        let _ = tokio::fs::remove_file(&tmp).await;
        return Err(e);
    }
    Ok(())
}

fn temp_path(path: &Path) -> PathBuf {
    let mut name = OsString::from(path.as_os_str());
    name.push(".tmp");
    PathBuf::from(name)
}

/// Serialize with four-space indentation
fn to_pretty_json(registry: &Registry) -> serde_json::Result<Vec<u8>> {
    let mut out = Vec::new();
    let mut ser = Serializer::with_formatter(&mut out, PrettyFormatter::with_indent(b"    "));
    registry.serialize(&mut ser)?;
    Ok(out)
}
