//! HTTP entry point for plugin routers
//!
//! The host mounts [`router`] once. Each request is dispatched by its first
//! path segment to the router fragment in the current catalog snapshot, so
//! a reload swaps plugin routes without touching the host's router.

use axum::extract::Request;
use axum::http::{StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use tower::ServiceExt;

use super::manager::PluginManager;

/// Router dispatching `/<segment>/<rest>` to the plugin mounted at `segment`
///
/// The plugin router sees the request with the segment stripped, so a
/// plugin mounted at `widgets` handles `/widgets/list` as `/list`.
pub fn router(manager: PluginManager) -> axum::Router {
    axum::Router::new().fallback(move |req: Request| {
        let manager = manager.clone();
        async move { dispatch(&manager, req).await }
    })
}

async fn dispatch(manager: &PluginManager, req: Request) -> Response {
    let (segment, rest) = split_path(req.uri().path());
    let Some(plugin_router) = manager.catalog().routes.get(&segment).cloned() else {
        tracing::debug!(segment = %segment, "no plugin mounted for request");
        return StatusCode::NOT_FOUND.into_response();
    };

    let (mut parts, body) = req.into_parts();
    let target = match parts.uri.query() {
        Some(query) => format!("{rest}?{query}"),
        None => rest,
    };
    parts.uri = match target.parse::<Uri>() {
        Ok(uri) => uri,
        Err(e) => {
            tracing::warn!(segment = %segment, error = %e, "cannot rewrite plugin request uri");
            return StatusCode::BAD_REQUEST.into_response();
        }
    };

    match plugin_router.oneshot(Request::from_parts(parts, body)).await {
        Ok(response) => response,
        Err(never) => match never {},
    }
}

/// Split `/seg/a/b` into (`seg`, `/a/b`)
fn split_path(path: &str) -> (String, String) {
    let trimmed = path.trim_start_matches('/');
    match trimmed.split_once('/') {
        Some((segment, rest)) => (segment.to_string(), format!("/{rest}")),
        None => (trimmed.to_string(), "/".to_string()),
    }
}
