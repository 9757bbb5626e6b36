//! Shared test utilities

#![allow(dead_code)]

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use panel_plugins::plugins::PackageInstaller;
use panel_plugins::{Config, Error, EventBus, PluginManager, StaticProvider};
use zip::write::SimpleFileOptions;

/// Installer that treats every package as present and never installs
pub struct NoInstall;

#[async_trait]
impl PackageInstaller for NoInstall {
    fn is_resolvable(&self, _package: &str) -> bool {
        true
    }

    async fn install(&self, package: &str) -> Result<(), Error> {
        Err(Error::Dependency(format!("installs disabled in tests: {package}")))
    }
}

/// Create `<root>/<dir>` with a manifest and an empty `main.js`
pub fn write_plugin(root: &Path, dir: &str, manifest: &str) -> PathBuf {
    let plugin_dir = root.join(dir);
    std::fs::create_dir_all(&plugin_dir).expect("failed to create plugin dir");
    std::fs::write(plugin_dir.join("manifest.json"), manifest).expect("failed to write manifest");
    std::fs::write(plugin_dir.join("main.js"), "").expect("failed to write entry file");
    plugin_dir
}

/// Write a zip archive holding `entries` (path, content)
pub fn write_package(path: &Path, entries: &[(&str, &str)]) {
    let file = std::fs::File::create(path).expect("failed to create archive");
    let mut zip = zip::ZipWriter::new(file);
    for (name, content) in entries {
        zip.start_file(*name, SimpleFileOptions::default())
            .expect("failed to start zip entry");
        zip.write_all(content.as_bytes()).expect("failed to write zip entry");
    }
    zip.finish().expect("failed to finish archive");
}

/// Manager over `plugins_dir` with in-process modules and an isolated bus
pub fn test_manager(plugins_dir: &Path, provider: StaticProvider) -> PluginManager {
    PluginManager::builder(Config::for_dir(plugins_dir))
        .provider(Arc::new(provider))
        .installer(Arc::new(NoInstall))
        .events(EventBus::new())
        .build()
}

/// Parsed contents of the registry file
pub fn registry_json(plugins_dir: &Path) -> serde_json::Value {
    let text = std::fs::read_to_string(plugins_dir.join("plugins.json"))
        .expect("failed to read registry");
    serde_json::from_str(&text).expect("registry is not valid json")
}

/// Sorted entry names directly under `dir`
pub fn dir_entries(dir: &Path) -> Vec<String> {
    let mut names: Vec<String> = std::fs::read_dir(dir)
        .expect("failed to read dir")
        .map(|e| e.expect("bad dir entry").file_name().to_string_lossy().to_string())
        .collect();
    names.sort();
    names
}
