//! Manifest validator
//!
//! Checks run in order: entry file, declared dependencies, then a trial
//! import of the entry module. Findings are accumulated, never thrown.

use std::path::PathBuf;

use thiserror::Error;

use super::deps::PackageInstaller;
use super::loader::ModuleLoader;
use super::manifest::{Dependency, PluginRecord};
use super::module::ImportError;
use super::registry::Registry;

/// A problem found while validating one plugin
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    /// `main` is absent or names a file that does not exist
    #[error("{}", missing_entry_message(.0.as_ref()))]
    MissingEntryFile(Option<PathBuf>),

    /// A `plugin:` dependency is not installed or not enabled
    #[error("dependency plugin {name:?} is {}", plugin_state(.disabled))]
    MissingPluginDependency {
        /// Referenced plugin name
        name: String,
        /// True if the plugin is installed but disabled
        disabled: bool,
    },

    /// An external package is missing and could not be installed
    #[error("external package {package:?} is missing: {reason}")]
    MissingExternalDependency {
        /// Package identifier
        package: String,
        /// Why installation failed
        reason: String,
    },

    /// The entry module failed to load
    #[error("entry module failed to load: {0}")]
    EntryLoadError(String),
}

impl ValidationError {
    /// Whether this finding disables the plugin for the pass
    ///
    /// A missing plugin dependency is only a warning: the dependent plugin
    /// is still loaded.
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        !matches!(self, Self::MissingPluginDependency { .. })
    }
}

const fn plugin_state(disabled: &bool) -> &'static str {
    if *disabled { "disabled" } else { "not installed" }
}

fn missing_entry_message(entry: Option<&PathBuf>) -> String {
    entry.map_or_else(
        || "manifest declares no entry module".to_string(),
        |path| format!("entry file {} does not exist", path.display()),
    )
}

/// Validate one catalogued plugin against the current registry
///
/// External packages that cannot be resolved are handed to `installer`
/// before being reported missing. The trial import goes through `loader`
/// without caching or running any hook.
pub async fn validate(
    record: &PluginRecord,
    registry: &Registry,
    loader: &ModuleLoader,
    installer: &dyn PackageInstaller,
) -> Vec<ValidationError> {
    let mut findings = Vec::new();
    let name = record.name();

    let entry = record.manifest.entry_path(record.dir());
    let entry_exists = match &entry {
        Some(path) => tokio::fs::metadata(path).await.is_ok_and(|m| m.is_file()),
        None => false,
    };
    if !entry_exists {
        findings.push(ValidationError::MissingEntryFile(entry));
    }

    for dependency in record.manifest.dependencies() {
        match dependency {
            Dependency::Plugin(dep) => {
                let finding = match registry.get(dep) {
                    Some(entry) if entry.enabled => None,
                    Some(_) => Some(ValidationError::MissingPluginDependency {
                        name: dep.to_string(),
                        disabled: true,
                    }),
                    None => Some(ValidationError::MissingPluginDependency {
                        name: dep.to_string(),
                        disabled: false,
                    }),
                };
                if let Some(finding) = finding {
                    tracing::warn!(plugin = %name, dependency = %dep, "{finding}, loading anyway");
                    findings.push(finding);
                }
            }
            Dependency::External(package) if package.is_empty() => {}
            Dependency::External(package) => {
                if installer.is_resolvable(package) {
                    continue;
                }
                if let Err(e) = installer.install(package).await {
                    findings.push(ValidationError::MissingExternalDependency {
                        package: package.to_string(),
                        reason: e.to_string(),
                    });
                }
            }
        }
    }

    if entry_exists {
        if let Some(finding) = probe_entry(record, loader, installer).await {
            findings.push(finding);
        }
    }

    findings
}

/// Trial import, installing a reported missing module once
async fn probe_entry(
    record: &PluginRecord,
    loader: &ModuleLoader,
    installer: &dyn PackageInstaller,
) -> Option<ValidationError> {
    let module = match loader.probe(record).await {
        Ok(_) => return None,
        Err(ImportError::Failed(message)) => return Some(ValidationError::EntryLoadError(message)),
        Err(ImportError::ModuleNotFound { module }) => module,
    };

    tracing::warn!(plugin = %record.name(), module = %module, "entry module requires a missing package");
    if let Err(e) = installer.install(&module).await {
        return Some(ValidationError::MissingExternalDependency {
            package: module,
            reason: e.to_string(),
        });
    }

    loader
        .probe(record)
        .await
        .err()
        .map(|e| ValidationError::EntryLoadError(e.to_string()))
}
