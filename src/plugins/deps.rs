//! External package resolution and best-effort installation
//!
//! Installing a package shells out to the configured package manager with
//! the host's full privileges. Every attempt is logged at `warn` so the side
//! effect is visible in the host logs.

use std::path::Path;

use async_trait::async_trait;

use crate::Error;
use crate::config::DependencyConfig;

/// Resolves and installs external packages required by plugins
#[async_trait]
pub trait PackageInstaller: Send + Sync {
    /// Whether `package` is already available to plugins
    fn is_resolvable(&self, package: &str) -> bool;

    /// Install `package`
    ///
    /// # Errors
    ///
    /// Returns error if installation is disabled or the package manager fails
    async fn install(&self, package: &str) -> Result<(), Error>;
}

/// Package installer driven by an external command such as `npm install`
#[derive(Debug, Clone)]
pub struct CommandInstaller {
    config: DependencyConfig,
}

impl CommandInstaller {
    /// Create an installer from dependency configuration
    #[must_use]
    pub const fn new(config: DependencyConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl PackageInstaller for CommandInstaller {
    /// Only the modules directory counts; a binary of the same name on
    /// `PATH` says nothing about the package being importable
    fn is_resolvable(&self, package: &str) -> bool {
        let name = package_name(package);
        if name.is_empty() {
            return false;
        }
        self.config.modules_dir.join(name).is_dir()
    }

    async fn install(&self, package: &str) -> Result<(), Error> {
        if !self.config.auto_install {
            return Err(Error::Dependency(format!(
                "automatic installation disabled, install {package} manually"
            )));
        }
        if !is_safe_package_spec(package) {
            return Err(Error::Dependency(format!(
                "refusing to install suspicious package spec {package:?}"
            )));
        }

        let Some((program, base_args)) = self.config.install_command.split_first() else {
            return Err(Error::Dependency("install command is empty".to_string()));
        };
        let resolved = which::which(program).map_err(|e| {
            Error::Dependency(format!("install command {program} not found: {e}"))
        })?;
        let program = resolved.to_string_lossy();

        let mut args: Vec<&str> = base_args.iter().map(String::as_str).collect();
        args.push(package);

        tracing::warn!(
            package = %package,
            command = %format!("{program} {}", args.join(" ")),
            "installing missing plugin dependency"
        );

        let output = run_command(&program, &args, &self.config.workdir).await?;
        if output.ok {
            tracing::info!(package = %package, "installed plugin dependency");
            Ok(())
        } else {
            tracing::error!(
                package = %package,
                code = ?output.code,
                stderr = %output.stderr.trim(),
                "plugin dependency installation failed"
            );
            Err(Error::Dependency(format!(
                "could not install {package}: {program} exited with code {}",
                output.code.unwrap_or(-1)
            )))
        }
    }
}

/// Captured result of a package manager run
#[derive(Debug)]
struct CommandOutput {
    ok: bool,
    code: Option<i32>,
    stderr: String,
}

/// Run a command and capture output
async fn run_command(program: &str, args: &[&str], workdir: &Path) -> Result<CommandOutput, Error> {
    let output = tokio::process::Command::new(program)
        .args(args)
        .current_dir(workdir)
        .output()
        .await
        .map_err(|e| Error::Dependency(format!("failed to run {program}: {e}")))?;

    Ok(CommandOutput {
        ok: output.status.success(),
        code: output.status.code(),
        stderr: String::from_utf8_lossy(&output.stderr).to_string(),
    })
}

/// Strip a version suffix: `lodash@4` → `lodash`, `@scope/pkg@1` → `@scope/pkg`
fn package_name(spec: &str) -> &str {
    let spec = spec.trim();
    let search_from = usize::from(spec.starts_with('@'));
    spec[search_from..]
        .find('@')
        .map_or(spec, |i| &spec[..search_from + i])
}

/// Package specs are passed as a single argument; reject flags and paths
fn is_safe_package_spec(spec: &str) -> bool {
    !spec.is_empty()
        && !spec.starts_with('-')
        && !spec.contains("..")
        && spec
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '@' | '/' | '.' | '_' | '-' | '^' | '~'))
}
