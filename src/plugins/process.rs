//! Subprocess-backed plugin modules
//!
//! An entry file is run once per hook invocation. The host writes a JSON
//! message to stdin and reads a JSON reply from stdout:
//!
//! | hook         | message extras              | reply                                     |
//! |--------------|-----------------------------|-------------------------------------------|
//! | `describe`   |                             | `{"register","unregister","router"}` bools |
//! | `register`   |                             | `{"subscribe": [event, ...]}`             |
//! | `unregister` |                             | `{"unsubscribe": [event, ...]}`           |
//! | `event`      | `event: {name, payload}`    | ignored                                   |
//! | `request`    | `request: {method, path, query, body}` | `{"status","body","content_type"}` |
//!
//! Every message also carries `plugin: {name, version, dir}`. An empty reply
//! counts as `{}`. The interpreter is chosen from the entry file extension.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, LazyLock, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use axum::body::Body;
use axum::extract::Request;
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use regex::Regex;
use serde::Deserialize;
use serde_json::{Value, json};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::time::timeout;

use super::manifest::PluginRecord;
use super::module::{Capabilities, ImportError, LifecycleHook, ModuleProvider, PluginModule};
use crate::events::{EventBus, SubscriptionId};

/// Largest request body forwarded to a plugin process
const MAX_REQUEST_BODY: usize = 2 * 1024 * 1024;

static MISSING_MODULE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?:Cannot find module|No module named|cannot load such file --) '?([^'\s]+)'?")
        .expect("valid regex")
});

/// Bus subscriptions made on behalf of process plugins, by plugin directory
/// and then by event
type SubscriptionLedger = Arc<Mutex<HashMap<PathBuf, HashMap<String, Vec<SubscriptionId>>>>>;

/// Module provider that runs plugin entry files as subprocesses
///
/// Every import yields a fresh module, but the subscriptions its `register`
/// hook makes are recorded per plugin directory on the provider. A later
/// `unregister` therefore releases forwarders made by any earlier import of
/// the same plugin, and re-registering replaces the previous instance's
/// forwarders instead of stacking new ones on top.
#[derive(Debug, Clone)]
pub struct ProcessProvider {
    hook_timeout: Duration,
    subscriptions: SubscriptionLedger,
}

impl ProcessProvider {
    /// Provider bounding every hook invocation by `hook_timeout`
    #[must_use]
    pub fn new(hook_timeout: Duration) -> Self {
        Self {
            hook_timeout,
            subscriptions: Arc::default(),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct Description {
    #[serde(default)]
    register: bool,
    #[serde(default)]
    unregister: bool,
    #[serde(default)]
    router: bool,
}

#[async_trait]
impl ModuleProvider for ProcessProvider {
    async fn import(
        &self,
        record: &PluginRecord,
        entry: &Path,
    ) -> Result<PluginModule, ImportError> {
        let runner = Arc::new(HookRunner {
            entry: entry.to_path_buf(),
            plugin: json!({
                "name": record.name(),
                "version": record.manifest.version(),
                "dir": record.dir(),
            }),
            dir: record.dir().to_path_buf(),
            timeout: self.hook_timeout,
            subscriptions: Arc::clone(&self.subscriptions),
        });

        let reply = runner.run("describe", json!({})).await?;
        let description: Description = serde_json::from_value(reply)
            .map_err(|e| ImportError::Failed(format!("invalid describe reply: {e}")))?;

        tracing::debug!(
            plugin = %record.name(),
            entry = %entry.display(),
            register = description.register,
            unregister = description.unregister,
            router = description.router,
            "imported process module"
        );

        let mut module = PluginModule::new();
        if description.register {
            module = module.with_register(Arc::new(RegisterHook(Arc::clone(&runner))));
        }
        if description.unregister {
            module = module.with_unregister(Arc::new(UnregisterHook(Arc::clone(&runner))));
        }
        if description.router {
            module = module.with_router(request_router(runner));
        }
        Ok(module)
    }
}

/// Runs hook invocations against one entry file
struct HookRunner {
    entry: PathBuf,
    plugin: Value,
    dir: PathBuf,
    timeout: Duration,
    subscriptions: SubscriptionLedger,
}

impl HookRunner {
    async fn run(&self, hook: &str, extra: Value) -> Result<Value, ImportError> {
        let mut message = json!({ "hook": hook, "plugin": self.plugin });
        if let (Some(message), Value::Object(extra)) = (message.as_object_mut(), extra) {
            message.extend(extra);
        }
        let input = serde_json::to_vec(&message)
            .map_err(|e| ImportError::Failed(format!("failed to serialize hook message: {e}")))?;

        let (program, args) = determine_executor(&self.entry).map_err(ImportError::Failed)?;

        let mut child = Command::new(&program)
            .args(&args)
            .current_dir(self.entry.parent().unwrap_or_else(|| Path::new(".")))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| ImportError::Failed(format!("failed to spawn {program}: {e}")))?;

        if let Some(mut stdin) = child.stdin.take() {
            if let Err(e) = stdin.write_all(&input).await {
                // The process may exit without reading its input
                if e.kind() != std::io::ErrorKind::BrokenPipe {
                    return Err(ImportError::Failed(format!(
                        "failed to write to plugin stdin: {e}"
                    )));
                }
            }
        }

        let output = timeout(self.timeout, child.wait_with_output())
            .await
            .map_err(|_| ImportError::Failed(format!("{hook} hook timed out after {:?}", self.timeout)))?
            .map_err(|e| ImportError::Failed(format!("{hook} hook execution failed: {e}")))?;

        let stderr = String::from_utf8_lossy(&output.stderr);
        if !stderr.trim().is_empty() {
            tracing::debug!(entry = %self.entry.display(), hook = %hook, stderr = %stderr.trim(), "plugin stderr");
        }

        if !output.status.success() {
            return Err(classify_failure(hook, output.status.code(), &stderr));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        if stdout.trim().is_empty() {
            return Ok(json!({}));
        }
        serde_json::from_str(&stdout)
            .map_err(|e| ImportError::Failed(format!("failed to parse {hook} hook output: {e}")))
    }

    fn track(&self, event: &str, id: SubscriptionId) {
        self.subscriptions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(self.dir.clone())
            .or_default()
            .entry(event.to_string())
            .or_default()
            .push(id);
    }

    /// Subscriptions for `event` made on behalf of this plugin directory
    fn take(&self, event: &str) -> Vec<SubscriptionId> {
        let mut ledger = self.subscriptions.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(events) = ledger.get_mut(&self.dir) else {
            return Vec::new();
        };
        let ids = events.remove(event).unwrap_or_default();
        if events.is_empty() {
            ledger.remove(&self.dir);
        }
        ids
    }

    /// Every subscription made on behalf of this plugin directory
    fn take_all(&self) -> Vec<SubscriptionId> {
        self.subscriptions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.dir)
            .map(|events| events.into_values().flatten().collect())
            .unwrap_or_default()
    }
}

/// Map a failed run onto an import error, detecting missing packages
fn classify_failure(hook: &str, code: Option<i32>, stderr: &str) -> ImportError {
    if let Some(module) = MISSING_MODULE
        .captures(stderr)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_string())
    {
        return ImportError::ModuleNotFound { module };
    }

    let detail = stderr.lines().map(str::trim).find(|l| !l.is_empty());
    let code = code.unwrap_or(-1);
    ImportError::Failed(detail.map_or_else(
        || format!("{hook} hook exited with code {code}"),
        |line| format!("{hook} hook exited with code {code}: {line}"),
    ))
}

/// Determine how to execute an entry file based on its extension
fn determine_executor(entry: &Path) -> Result<(String, Vec<String>), String> {
    let extension = entry.extension().and_then(|e| e.to_str()).unwrap_or("");
    let path = entry.to_str().ok_or("invalid entry path")?.to_string();

    match extension {
        "js" | "mjs" | "cjs" => Ok(("node".to_string(), vec![path])),
        "py" => Ok(("python3".to_string(), vec![path])),
        "ts" => Ok(("bun".to_string(), vec!["run".to_string(), path])),
        "rb" => Ok(("ruby".to_string(), vec![path])),
        "sh" => Ok(("bash".to_string(), vec![path])),
        "" => Ok((path, vec![])),
        _ => Err(format!("unsupported entry extension: .{extension}")),
    }
}

#[derive(Debug, Default, Deserialize)]
struct RegisterReply {
    #[serde(default)]
    subscribe: Vec<String>,
}

#[derive(Debug, Default, Deserialize)]
struct UnregisterReply {
    #[serde(default)]
    unsubscribe: Vec<String>,
}

struct RegisterHook(Arc<HookRunner>);

#[async_trait]
impl LifecycleHook for RegisterHook {
    async fn call(&self, caps: &Capabilities) -> Result<(), String> {
        // A previous instance of this plugin is being replaced
        let stale = self.0.take_all();
        if !stale.is_empty() {
            tracing::debug!(
                dir = %self.0.dir.display(),
                count = stale.len(),
                "releasing forwarders of replaced plugin instance"
            );
            for id in stale {
                caps.events.unsubscribe(id);
            }
        }

        let reply = self.0.run("register", json!({})).await.map_err(|e| e.to_string())?;
        let reply: RegisterReply =
            serde_json::from_value(reply).map_err(|e| format!("invalid register reply: {e}"))?;

        for event in reply.subscribe {
            let id = subscribe_forwarder(&caps.events, &event, Arc::clone(&self.0));
            self.0.track(&event, id);
        }
        Ok(())
    }
}

struct UnregisterHook(Arc<HookRunner>);

#[async_trait]
impl LifecycleHook for UnregisterHook {
    async fn call(&self, caps: &Capabilities) -> Result<(), String> {
        let reply = self.0.run("unregister", json!({})).await.map_err(|e| e.to_string())?;
        let reply: UnregisterReply =
            serde_json::from_value(reply).map_err(|e| format!("invalid unregister reply: {e}"))?;

        for event in reply.unsubscribe {
            for id in self.0.take(&event) {
                caps.events.unsubscribe(id);
            }
        }
        Ok(())
    }
}

/// Forward bus events to the plugin process without blocking the publisher
fn subscribe_forwarder(bus: &EventBus, event: &str, runner: Arc<HookRunner>) -> SubscriptionId {
    bus.subscribe(event, move |e| {
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            tracing::warn!(event = %e.name, "no runtime available, dropping plugin event");
            return;
        };
        let runner = Arc::clone(&runner);
        let extra = json!({ "event": e });
        let name = e.name.clone();
        handle.spawn(async move {
            if let Err(e) = runner.run("event", extra).await {
                tracing::warn!(
                    entry = %runner.entry.display(),
                    event = %name,
                    error = %e,
                    "plugin event handler failed"
                );
            }
        });
    })
}

#[derive(Debug, Deserialize)]
struct RequestReply {
    #[serde(default = "default_status")]
    status: u16,
    #[serde(default)]
    body: Value,
    #[serde(default)]
    content_type: Option<String>,
}

const fn default_status() -> u16 {
    200
}

/// Router forwarding every request to the plugin's `request` hook
fn request_router(runner: Arc<HookRunner>) -> axum::Router {
    axum::Router::new().fallback(move |req: Request| {
        let runner = Arc::clone(&runner);
        async move { forward_request(&runner, req).await }
    })
}

async fn forward_request(runner: &HookRunner, req: Request) -> Response {
    let (parts, body) = req.into_parts();
    let body = match axum::body::to_bytes(body, MAX_REQUEST_BODY).await {
        Ok(bytes) => String::from_utf8_lossy(&bytes).to_string(),
        Err(e) => return (StatusCode::PAYLOAD_TOO_LARGE, e.to_string()).into_response(),
    };

    let extra = json!({
        "request": {
            "method": parts.method.as_str(),
            "path": parts.uri.path(),
            "query": parts.uri.query().unwrap_or(""),
            "body": body,
        }
    });

    let reply = match runner.run("request", extra).await {
        Ok(reply) => reply,
        Err(e) => {
            tracing::warn!(entry = %runner.entry.display(), error = %e, "plugin request handler failed");
            return (StatusCode::BAD_GATEWAY, "plugin request failed").into_response();
        }
    };

    let reply: RequestReply = match serde_json::from_value(reply) {
        Ok(reply) => reply,
        Err(e) => {
            tracing::warn!(entry = %runner.entry.display(), error = %e, "invalid plugin response");
            return (StatusCode::BAD_GATEWAY, "invalid plugin response").into_response();
        }
    };

    let status = StatusCode::from_u16(reply.status).unwrap_or(StatusCode::BAD_GATEWAY);
    let (content_type, body) = match reply.body {
        Value::String(text) => (
            reply.content_type.unwrap_or_else(|| "text/plain; charset=utf-8".to_string()),
            text,
        ),
        Value::Null => (reply.content_type.unwrap_or_default(), String::new()),
        other => (
            reply.content_type.unwrap_or_else(|| "application/json".to_string()),
            other.to_string(),
        ),
    };

    let mut builder = Response::builder().status(status);
    if !content_type.is_empty() {
        builder = builder.header(header::CONTENT_TYPE, content_type);
    }
    builder
        .body(Body::from(body))
        .unwrap_or_else(|_| StatusCode::BAD_GATEWAY.into_response())
}
