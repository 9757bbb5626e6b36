//! Package archives - stage, check and move plugin zips into place
//!
//! An archive is extracted into a hidden scratch directory inside the
//! plugin root. Keeping scratch on the same filesystem makes the final move
//! a plain rename, and the hidden name keeps it out of discovery. The
//! scratch directory is removed when the [`StagedPackage`] is dropped,
//! whatever the outcome.

use std::path::{Component, Path, PathBuf};

use tempfile::TempDir;

use super::discovery::load_manifest;
use super::manifest::PluginManifest;
use crate::{Error, Result};

/// Prefix of install scratch directories
const SCRATCH_PREFIX: &str = ".install-";

/// Archiver metadata directories that are not part of the package
const IGNORED_ROOT_DIRS: &[&str] = &["__MACOSX"];

/// Whether `s` can be used as a router mount point
#[must_use]
pub fn is_safe_path_segment(s: &str) -> bool {
    let s = s.trim();
    if s.is_empty() || s.len() > 64 || s == "." || s == ".." {
        return false;
    }
    s.chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-' || c == '.')
}

/// Whether `name` names a directory directly under the plugin root that
/// discovery would pick up
///
/// Any single normal path component is accepted, spaces and non-ASCII
/// included. Separators, `.`, `..` and hidden names are not.
#[must_use]
pub fn is_plugin_directory_name(name: &str) -> bool {
    if name.starts_with('.') || name.contains(['/', '\\']) {
        return false;
    }
    let mut components = Path::new(name).components();
    matches!(
        (components.next(), components.next()),
        (Some(Component::Normal(_)), None)
    )
}

/// An extracted archive holding exactly one plugin directory
#[derive(Debug)]
pub struct StagedPackage {
    scratch: TempDir,
    directory_name: String,
}

impl StagedPackage {
    /// Name of the plugin directory inside the archive
    #[must_use]
    pub fn directory_name(&self) -> &str {
        &self.directory_name
    }

    /// Path of the extracted plugin directory inside scratch
    #[must_use]
    pub fn path(&self) -> PathBuf {
        self.scratch.path().join(&self.directory_name)
    }

    /// Move the plugin directory into `plugins_dir`
    ///
    /// The manifest is read before moving, so a package without a usable
    /// manifest never lands in the plugin tree.
    ///
    /// # Errors
    ///
    /// Returns `PluginAlreadyExists` if the target directory exists, a
    /// manifest error if the package has no usable manifest, or the rename
    /// failure
    pub async fn install_into(self, plugins_dir: &Path) -> Result<(PathBuf, PluginManifest)> {
        let target = plugins_dir.join(&self.directory_name);
        if tokio::fs::symlink_metadata(&target).await.is_ok() {
            return Err(Error::PluginAlreadyExists(self.directory_name));
        }

        let staged = self.path();
        let (_, manifest) = load_manifest(&staged).await?;

        tokio::fs::rename(&staged, &target).await?;
        tracing::info!(
            plugin = %manifest.name,
            path = %target.display(),
            "plugin package moved into place"
        );
        Ok((target, manifest))
    }
}

/// Extract `archive` into a scratch directory under `plugins_dir`
///
/// # Errors
///
/// Returns `InvalidPackageLayout` unless the archive root holds exactly one
/// directory, `InvalidPluginName` if that directory name is unsafe, or the
/// underlying archive/IO failure
pub async fn stage_package(archive: &Path, plugins_dir: &Path) -> Result<StagedPackage> {
    tokio::fs::create_dir_all(plugins_dir).await?;
    let scratch = tempfile::Builder::new()
        .prefix(SCRATCH_PREFIX)
        .tempdir_in(plugins_dir)?;

    let source = archive.to_path_buf();
    let dest = scratch.path().to_path_buf();
    let files = tokio::task::spawn_blocking(move || extract_archive(&source, &dest))
        .await
        .map_err(|e| Error::Io(std::io::Error::other(e)))??;
    tracing::debug!(archive = %archive.display(), files, "package extracted");

    let directory_name = single_root_directory(scratch.path()).await?;
    if !is_plugin_directory_name(&directory_name) {
        return Err(Error::InvalidPluginName(directory_name));
    }

    Ok(StagedPackage {
        scratch,
        directory_name,
    })
}

/// Extract every entry, refusing paths that escape `dest`
fn extract_archive(archive: &Path, dest: &Path) -> Result<usize> {
    let file = std::fs::File::open(archive)?;
    let mut zip = zip::ZipArchive::new(file)?;

    let mut files = 0;
    for i in 0..zip.len() {
        let mut entry = zip.by_index(i)?;
        let Some(relative) = entry.enclosed_name() else {
            return Err(Error::InvalidPackageLayout(format!(
                "entry {:?} escapes the package root",
                entry.name()
            )));
        };
        let out = dest.join(relative);

        if entry.is_dir() {
            std::fs::create_dir_all(&out)?;
            continue;
        }
        if let Some(parent) = out.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut target = std::fs::File::create(&out)?;
        std::io::copy(&mut entry, &mut target)?;
        files += 1;

        #[cfg(unix)]
        if let Some(mode) = entry.unix_mode() {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&out, std::fs::Permissions::from_mode(mode & 0o7777))?;
        }
    }
    Ok(files)
}

/// Name of the only directory at the root of an extracted package
async fn single_root_directory(root: &Path) -> Result<String> {
    let mut dirs = Vec::new();
    let mut entries = tokio::fs::read_dir(root).await?;
    while let Some(entry) = entries.next_entry().await? {
        let name = entry.file_name().to_string_lossy().to_string();
        if entry.file_type().await?.is_dir() {
            if IGNORED_ROOT_DIRS.contains(&name.as_str()) {
                continue;
            }
            dirs.push(name);
        } else {
            tracing::warn!(file = %name, "ignoring file at package root");
        }
    }

    match dirs.len() {
        1 => Ok(dirs.remove(0)),
        0 => Err(Error::InvalidPackageLayout(
            "archive contains no top-level directory".to_string(),
        )),
        n => {
            dirs.sort();
            Err(Error::InvalidPackageLayout(format!(
                "archive contains {n} top-level directories ({}), expected exactly one",
                dirs.join(", ")
            )))
        }
    }
}
