//! Install, uninstall, toggle and reload integration tests

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use panel_plugins::plugins::{DataStore, MemoryStore};
use panel_plugins::{Config, Error, EventBus, PluginManager, PluginModule, StaticProvider};
use serde_json::json;
use tokio::sync::Notify;

mod common;
use common::{NoInstall, dir_entries, registry_json, test_manager, write_package, write_plugin};

fn plain(name: &str) -> String {
    format!(r#"{{"name": "{name}", "main": "main.js", "version": "1.0.0"}}"#)
}

#[tokio::test]
async fn guard_clears_after_pass_with_failures() {
    let dir = tempfile::tempdir().unwrap();
    write_plugin(dir.path(), "good", &plain("good"));
    write_plugin(dir.path(), "bad", &plain("bad"));

    let provider = StaticProvider::new()
        .with("good", || Ok(PluginModule::new()))
        .with("bad", || {
            Ok(PluginModule::new().on_register(|_| async { Err("register blew up".to_string()) }))
        });
    let manager = test_manager(dir.path(), provider);

    let report = manager.reload().await.unwrap();
    assert_eq!(report.discovered, 2);
    assert_eq!(report.active, 1);
    assert_eq!(report.errors.len(), 1);
    assert!(!manager.is_running());

    // The guard is free again
    manager.reload().await.unwrap();
    assert!(!manager.is_running());
}

#[tokio::test]
async fn concurrent_reload_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    write_plugin(dir.path(), "slow", &plain("slow"));

    let entered = Arc::new(Notify::new());
    let release = Arc::new(Notify::new());
    let (e, r) = (Arc::clone(&entered), Arc::clone(&release));
    let provider = StaticProvider::new().with("slow", move || {
        let (e, r) = (Arc::clone(&e), Arc::clone(&r));
        Ok(PluginModule::new().on_register(move |_| {
            let (e, r) = (Arc::clone(&e), Arc::clone(&r));
            async move {
                e.notify_one();
                r.notified().await;
                Ok(())
            }
        }))
    });
    let manager = test_manager(dir.path(), provider);

    let running = manager.clone();
    let first = tokio::spawn(async move { running.reload().await });
    entered.notified().await;

    assert!(manager.is_running());
    assert!(matches!(manager.reload().await, Err(Error::ReentrancyRejected)));
    assert!(matches!(
        manager.toggle("slow").await,
        Err(Error::ReentrancyRejected)
    ));

    release.notify_one();
    let report = first.await.unwrap().unwrap();
    assert_eq!(report.active, 1);
    assert!(!manager.is_running());
}

#[tokio::test]
async fn install_two_directory_archive_fails() {
    let dir = tempfile::tempdir().unwrap();
    let plugins = dir.path().join("plugins");
    write_plugin(&plugins, "existing", &plain("existing"));
    let manager = test_manager(
        &plugins,
        StaticProvider::new().with("existing", || Ok(PluginModule::new())),
    );
    manager.reload().await.unwrap();

    let before = dir_entries(&plugins);
    let registry_before = registry_json(&plugins);

    let archive = dir.path().join("double.zip");
    write_package(
        &archive,
        &[
            ("one/manifest.json", &plain("one")),
            ("two/manifest.json", &plain("two")),
        ],
    );

    let err = manager.install(&archive).await.unwrap_err();
    assert!(matches!(err, Error::InvalidPackageLayout(_)));
    assert_eq!(dir_entries(&plugins), before);
    assert_eq!(registry_json(&plugins), registry_before);
}

#[tokio::test]
async fn install_existing_name_fails_cleanly() {
    let dir = tempfile::tempdir().unwrap();
    let plugins = dir.path().join("plugins");
    let original = r#"{"name": "widgets", "main": "main.js", "version": "0.1.0"}"#;
    write_plugin(&plugins, "widgets", original);
    let manager = test_manager(
        &plugins,
        StaticProvider::new().with("widgets", || Ok(PluginModule::new())),
    );
    manager.reload().await.unwrap();
    let before = dir_entries(&plugins);

    let archive = dir.path().join("widgets.zip");
    write_package(
        &archive,
        &[
            ("widgets/manifest.json", &plain("widgets")),
            ("widgets/main.js", "// new version"),
        ],
    );

    let err = manager.install(&archive).await.unwrap_err();
    assert!(matches!(err, Error::PluginAlreadyExists(name) if name == "widgets"));
    assert_eq!(dir_entries(&plugins), before);
    assert!(!before.iter().any(|name| name.starts_with(".install-")));
    assert_eq!(
        std::fs::read_to_string(plugins.join("widgets").join("manifest.json")).unwrap(),
        original
    );
}

#[tokio::test]
async fn install_valid_package() {
    let dir = tempfile::tempdir().unwrap();
    let plugins = dir.path().join("plugins");
    let manager = test_manager(
        &plugins,
        StaticProvider::new().with("widgets", || Ok(PluginModule::new())),
    );
    manager.reload().await.unwrap();
    assert!(manager.list().is_empty());

    let archive = dir.path().join("widgets.zip");
    write_package(
        &archive,
        &[
            ("widgets/manifest.json", &plain("widgets")),
            ("widgets/main.js", "module.exports = {}"),
        ],
    );

    let name = manager.install(&archive).await.unwrap();
    assert_eq!(name, "widgets");
    assert_eq!(manager.list(), vec!["widgets"]);
    assert_eq!(registry_json(&plugins), json!({"widgets": {"enabled": true}}));
    assert!(manager.catalog().get("widgets").unwrap().active);
    assert!(!dir_entries(&plugins).iter().any(|n| n.starts_with(".install-")));
}

#[tokio::test]
async fn uninstall_missing_plugin_fails() {
    let dir = tempfile::tempdir().unwrap();
    write_plugin(dir.path(), "alpha", &plain("alpha"));
    let manager = test_manager(
        dir.path(),
        StaticProvider::new().with("alpha", || Ok(PluginModule::new())),
    );
    manager.reload().await.unwrap();
    let before = std::fs::read_to_string(dir.path().join("plugins.json")).unwrap();

    let err = manager.uninstall("ghost").await.unwrap_err();
    assert!(matches!(err, Error::PluginNotFound(name) if name == "ghost"));
    assert_eq!(
        std::fs::read_to_string(dir.path().join("plugins.json")).unwrap(),
        before
    );
}

#[tokio::test]
async fn uninstall_directory_with_spaces() {
    let dir = tempfile::tempdir().unwrap();
    write_plugin(dir.path(), "my plugin", &plain("spaced"));
    let manager = test_manager(
        dir.path(),
        StaticProvider::new().with("spaced", || Ok(PluginModule::new())),
    );
    manager.reload().await.unwrap();
    assert_eq!(manager.list(), vec!["spaced"]);
    assert_eq!(manager.catalog().get("spaced").unwrap().directory_name, "my plugin");

    let err = manager.uninstall("no such plugin").await.unwrap_err();
    assert!(matches!(err, Error::PluginNotFound(name) if name == "no such plugin"));

    assert!(manager.manifest_source("my plugin").await.unwrap().contains("spaced"));
    manager.uninstall("my plugin").await.unwrap();
    assert!(!dir.path().join("my plugin").exists());
    assert!(manager.list().is_empty());
    assert_eq!(registry_json(dir.path()), json!({}));
}

#[tokio::test]
async fn uninstall_rejects_paths_outside_plugin_root() {
    let dir = tempfile::tempdir().unwrap();
    let plugins = dir.path().join("plugins");
    write_plugin(&plugins, "alpha", &plain("alpha"));
    write_plugin(dir.path(), "outside", &plain("outside"));
    let manager = test_manager(
        &plugins,
        StaticProvider::new().with("alpha", || Ok(PluginModule::new())),
    );
    manager.reload().await.unwrap();

    for name in ["../outside", "..", ".", ""] {
        let err = manager.uninstall(name).await.unwrap_err();
        assert!(matches!(err, Error::InvalidPluginName(_)), "{name:?}: {err}");
    }
    assert!(dir.path().join("outside").exists());
    assert!(plugins.join("alpha").exists());
}

#[tokio::test]
async fn uninstall_runs_unregister_and_removes_everything() {
    let dir = tempfile::tempdir().unwrap();
    write_plugin(dir.path(), "alpha-dir", &plain("alpha"));
    write_plugin(dir.path(), "beta", &plain("beta"));

    let unregistered = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&unregistered);
    let provider = StaticProvider::new()
        .with("alpha", move || {
            let counter = Arc::clone(&counter);
            Ok(PluginModule::new().on_unregister(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
                async { Ok(()) }
            }))
        })
        .with("beta", || Ok(PluginModule::new()));
    let manager = test_manager(dir.path(), provider);
    manager.reload().await.unwrap();

    manager.uninstall("alpha-dir").await.unwrap();
    assert_eq!(unregistered.load(Ordering::SeqCst), 1);
    assert!(!dir.path().join("alpha-dir").exists());
    assert_eq!(manager.list(), vec!["beta"]);
    assert_eq!(registry_json(dir.path()), json!({"beta": {"enabled": true}}));
}

#[tokio::test]
async fn uninstall_continues_when_unregister_fails() {
    let dir = tempfile::tempdir().unwrap();
    write_plugin(dir.path(), "stubborn", &plain("stubborn"));
    let provider = StaticProvider::new().with("stubborn", || {
        Ok(PluginModule::new().on_unregister(|_| async { Err("refusing to leave".to_string()) }))
    });
    let manager = test_manager(dir.path(), provider);
    manager.reload().await.unwrap();

    manager.uninstall("stubborn").await.unwrap();
    assert!(!dir.path().join("stubborn").exists());
    assert!(manager.list().is_empty());
    assert_eq!(registry_json(dir.path()), json!({}));
}

#[tokio::test]
async fn missing_main_is_listed_but_never_loaded() {
    let dir = tempfile::tempdir().unwrap();
    write_plugin(dir.path(), "nomain", r#"{"name": "nomain"}"#);

    let imports = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&imports);
    let provider = StaticProvider::new().with("nomain", move || {
        counter.fetch_add(1, Ordering::SeqCst);
        Ok(PluginModule::new())
    });
    let manager = test_manager(dir.path(), provider);

    manager.reload().await.unwrap();
    assert_eq!(manager.list(), vec!["nomain"]);
    assert_eq!(imports.load(Ordering::SeqCst), 0);

    let catalog = manager.catalog();
    let record = catalog.get("nomain").unwrap();
    assert!(!record.active);
    assert!(!record.enabled);
    assert_eq!(registry_json(dir.path()), json!({"nomain": {"enabled": false}}));
}

#[tokio::test]
async fn absent_plugin_dependency_still_loads() {
    let dir = tempfile::tempdir().unwrap();
    write_plugin(
        dir.path(),
        "dependent",
        r#"{"name": "dependent", "main": "main.js", "dependencies": ["plugin:absent"]}"#,
    );
    write_plugin(dir.path(), "sibling", &plain("sibling"));

    let provider = StaticProvider::new()
        .with("dependent", || Ok(PluginModule::new()))
        .with("sibling", || Ok(PluginModule::new()));
    let manager = test_manager(dir.path(), provider);

    let report = manager.reload().await.unwrap();
    assert_eq!(report.active, 2);
    assert!(report.errors.is_empty());

    let catalog = manager.catalog();
    let dependent = catalog.get("dependent").unwrap();
    assert!(dependent.active);
    assert!(dependent.problems.iter().any(|p| p.contains("absent")));
    assert!(catalog.get("sibling").unwrap().active);
    assert_eq!(
        registry_json(dir.path()),
        json!({"dependent": {"enabled": true}, "sibling": {"enabled": true}})
    );
}

#[tokio::test]
async fn load_error_disables_but_keeps_listing() {
    let dir = tempfile::tempdir().unwrap();
    write_plugin(dir.path(), "broken", &plain("broken"));
    write_plugin(dir.path(), "fine", &plain("fine"));

    let provider = StaticProvider::new()
        .with("broken", || {
            Err(panel_plugins::plugins::ImportError::Failed(
                "SyntaxError: unexpected token".to_string(),
            ))
        })
        .with("fine", || Ok(PluginModule::new()));
    let manager = test_manager(dir.path(), provider);

    manager.reload().await.unwrap();
    assert_eq!(manager.list(), vec!["broken", "fine"]);
    assert!(!manager.catalog().get("broken").unwrap().enabled);
    assert!(manager.catalog().get("fine").unwrap().active);
    assert_eq!(registry_json(dir.path())["broken"]["enabled"], false);
}

#[tokio::test]
async fn disabling_unregisters_once_before_registry_write() {
    let dir = tempfile::tempdir().unwrap();
    write_plugin(dir.path(), "alpha", &plain("alpha"));
    let registry_path = dir.path().join("plugins.json");

    let seen_enabled: Arc<Mutex<Vec<bool>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen_enabled);
    let provider = StaticProvider::new().with("alpha", move || {
        let sink = Arc::clone(&sink);
        let registry_path = registry_path.clone();
        Ok(PluginModule::new().on_unregister(move |_| {
            let text = std::fs::read_to_string(&registry_path).unwrap();
            let registry: serde_json::Value = serde_json::from_str(&text).unwrap();
            sink.lock()
                .unwrap()
                .push(registry["alpha"]["enabled"].as_bool().unwrap());
            async { Ok(()) }
        }))
    });
    let manager = test_manager(dir.path(), provider);
    manager.reload().await.unwrap();

    let enabled = manager.toggle("alpha").await.unwrap();
    assert!(!enabled);
    // The hook saw the registry before the disable was committed
    assert_eq!(*seen_enabled.lock().unwrap(), vec![true]);
    assert_eq!(registry_json(dir.path()), json!({"alpha": {"enabled": false}}));

    let catalog = manager.catalog();
    let record = catalog.get("alpha").unwrap();
    assert!(!record.enabled);
    assert!(!record.active);
}

#[tokio::test]
async fn enabling_does_not_unregister() {
    let dir = tempfile::tempdir().unwrap();
    write_plugin(dir.path(), "alpha", &plain("alpha"));
    std::fs::write(
        dir.path().join("plugins.json"),
        r#"{"alpha": {"enabled": false}}"#,
    )
    .unwrap();

    let unregistered = Arc::new(AtomicUsize::new(0));
    let registered = Arc::new(AtomicUsize::new(0));
    let (u, r) = (Arc::clone(&unregistered), Arc::clone(&registered));
    let provider = StaticProvider::new().with("alpha", move || {
        let (u, r) = (Arc::clone(&u), Arc::clone(&r));
        Ok(PluginModule::new()
            .on_register(move |_| {
                r.fetch_add(1, Ordering::SeqCst);
                async { Ok(()) }
            })
            .on_unregister(move |_| {
                u.fetch_add(1, Ordering::SeqCst);
                async { Ok(()) }
            }))
    });
    let manager = test_manager(dir.path(), provider);
    manager.reload().await.unwrap();
    assert_eq!(registered.load(Ordering::SeqCst), 0);

    assert!(manager.toggle("alpha").await.unwrap());
    assert_eq!(unregistered.load(Ordering::SeqCst), 0);
    assert_eq!(registered.load(Ordering::SeqCst), 1);
    assert!(manager.catalog().get("alpha").unwrap().active);
}

#[tokio::test]
async fn set_enabled_to_current_state_is_a_no_op() {
    let dir = tempfile::tempdir().unwrap();
    write_plugin(dir.path(), "alpha", &plain("alpha"));

    let unregistered = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&unregistered);
    let provider = StaticProvider::new().with("alpha", move || {
        let counter = Arc::clone(&counter);
        Ok(PluginModule::new().on_unregister(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            async { Ok(()) }
        }))
    });
    let manager = test_manager(dir.path(), provider);
    manager.reload().await.unwrap();

    assert!(manager.set_enabled("alpha", true).await.unwrap());
    assert!(!manager.set_enabled("alpha", false).await.unwrap());
    assert!(!manager.set_enabled("alpha", false).await.unwrap());
    assert_eq!(unregistered.load(Ordering::SeqCst), 1);

    assert!(matches!(
        manager.toggle("ghost").await,
        Err(Error::PluginNotFound(_))
    ));
}

#[tokio::test]
async fn sidebar_last_plugin_wins() {
    let dir = tempfile::tempdir().unwrap();
    write_plugin(
        dir.path(),
        "alpha",
        r#"{"name": "alpha", "main": "main.js", "adminsidebar": {"A": {"url": "/alpha"}, "OnlyAlpha": {"url": "/a"}}}"#,
    );
    write_plugin(
        dir.path(),
        "beta",
        r#"{"name": "beta", "main": "main.js", "adminsidebar": {"A": {"url": "/beta"}}}"#,
    );

    let provider = StaticProvider::new()
        .with("alpha", || Ok(PluginModule::new()))
        .with("beta", || Ok(PluginModule::new()));
    let manager = test_manager(dir.path(), provider);
    manager.reload().await.unwrap();

    let sidebar = manager.sidebar();
    assert_eq!(sidebar["A"], json!({"url": "/beta"}));
    assert_eq!(sidebar["OnlyAlpha"], json!({"url": "/a"}));
}

#[tokio::test]
async fn disabled_plugins_contribute_nothing() {
    let dir = tempfile::tempdir().unwrap();
    write_plugin(
        dir.path(),
        "alpha",
        r#"{"name": "alpha", "main": "main.js", "adminsidebar": {"A": {"url": "/alpha"}}}"#,
    );
    std::fs::write(
        dir.path().join("plugins.json"),
        r#"{"alpha": {"enabled": false}}"#,
    )
    .unwrap();

    let manager = test_manager(
        dir.path(),
        StaticProvider::new().with("alpha", || Ok(PluginModule::new())),
    );
    manager.reload().await.unwrap();

    assert_eq!(manager.list(), vec!["alpha"]);
    assert!(manager.sidebar().is_empty());
    assert!(manager.enabled_plugins().is_empty());
}

#[tokio::test]
async fn register_receives_capabilities() {
    let dir = tempfile::tempdir().unwrap();
    write_plugin(dir.path(), "alpha", &plain("alpha"));

    let store = Arc::new(MemoryStore::new());
    let events = EventBus::new();
    let provider = StaticProvider::new().with("alpha", || {
        Ok(PluginModule::new().on_register(|caps| async move {
            let Some(store) = caps.data_store else {
                return Err("no data store".to_string());
            };
            store.set("alpha:registered", json!(true)).await;
            caps.events.subscribe("serverCreate", |_| {});
            if caps.host_app.is_some() {
                return Err("unexpected host app".to_string());
            }
            Ok(())
        }))
    });

    let manager = PluginManager::builder(Config::for_dir(dir.path()))
        .provider(Arc::new(provider))
        .installer(Arc::new(NoInstall))
        .events(events.clone())
        .data_store(store.clone())
        .build();
    manager.reload().await.unwrap();

    assert!(manager.catalog().get("alpha").unwrap().active);
    assert_eq!(store.get("alpha:registered").await, Some(json!(true)));
    assert_eq!(events.listener_count("serverCreate"), 1);
}

#[tokio::test]
async fn registry_survives_reloads() {
    let dir = tempfile::tempdir().unwrap();
    write_plugin(dir.path(), "alpha", &plain("alpha"));
    write_plugin(dir.path(), "beta", &plain("beta"));
    std::fs::write(dir.path().join("plugins.json"), "{ not json").unwrap();

    let provider = StaticProvider::new()
        .with("alpha", || Ok(PluginModule::new()))
        .with("beta", || Ok(PluginModule::new()));
    let manager = test_manager(dir.path(), provider);

    manager.reload().await.unwrap();
    manager.set_enabled("beta", false).await.unwrap();
    manager.reload().await.unwrap();

    assert_eq!(
        registry_json(dir.path()),
        json!({"alpha": {"enabled": true}, "beta": {"enabled": false}})
    );
    let text = std::fs::read_to_string(dir.path().join("plugins.json")).unwrap();
    assert!(text.contains("\n    \"alpha\": {\n        \"enabled\": true\n    }"));
}
