//! HTTP status server: a small read-only surface reporting the health of the
//! whole tunnel fleet, built as a plain `axum::Router` of `get` handlers
//! wrapped in `TraceLayer` and served with `axum::serve`.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use axum::extract::{Path as PathParam, State};
use axum::http::{header, StatusCode};
use axum::response::{Html, IntoResponse, Json};
use axum::routing::get;
use axum::Router;
use rust_embed::RustEmbed;
use serde::Serialize;
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;

use crate::app::Application;

/// Static assets packaged into the binary, served when no on-disk asset
/// directory is configured.
#[derive(RustEmbed)]
#[folder = "static/"]
struct EmbeddedAssets;

#[derive(Clone)]
struct AppState {
    app: Arc<Application>,
}

#[derive(Serialize)]
struct TunnelStatus {
    ok: bool,
    ident: String,
}

#[derive(Serialize)]
struct GlobalStatus {
    tunnels: BTreeMap<String, TunnelStatus>,
    ident: String,
    ok: bool,
}

#[derive(Serialize)]
struct StatusResponse {
    status: GlobalStatus,
    data: StatusData,
}

#[derive(Serialize)]
struct StatusData {
    forwardings: Vec<ForwardingView>,
}

#[derive(Serialize)]
struct ForwardingView {
    is_alive: bool,
    current_pid: Option<u32>,
    ident: String,
    starts_history: Vec<chrono::NaiveDate>,
    restarts_count: usize,
}

/// Build the status-server router over a shared [`Application`] handle.
///
/// `static_dir`, when it names an existing directory, is served verbatim via
/// [`ServeDir`]; otherwise `/static/*` falls back to the assets embedded into
/// the binary at compile time, so the route always answers something.
///
/// When `secret_prefix` is set, every route is nested under that path
/// segment instead of served at the root — a cheap way to keep the status
/// page off of casual port scans without adding real authentication.
pub fn build_router(app: Arc<Application>, static_dir: Option<&str>, secret_prefix: Option<&str>) -> Router {
    let state = AppState { app };

    let router = Router::new()
        .route("/", get(serve_status_html))
        .route("/health", get(serve_health_json));

    let router = match static_dir.filter(|dir| Path::new(dir).is_dir()) {
        Some(dir) => router.nest_service("/static", ServeDir::new(dir)),
        None => router.route("/static/{*path}", get(serve_embedded_asset)),
    };

    let router = router.with_state(state);

    let router = match secret_prefix {
        Some(prefix) => Router::new().nest(&format!("/{}", prefix.trim_matches('/')), router),
        None => router,
    };

    router.layer(TraceLayer::new_for_http())
}

fn guess_content_type(path: &str) -> &'static str {
    match path.rsplit('.').next() {
        Some("css") => "text/css",
        Some("js") => "application/javascript",
        Some("html") => "text/html",
        Some("svg") => "image/svg+xml",
        Some("png") => "image/png",
        Some("ico") => "image/x-icon",
        _ => "application/octet-stream",
    }
}

async fn serve_embedded_asset(PathParam(path): PathParam<String>) -> impl IntoResponse {
    match EmbeddedAssets::get(&path) {
        Some(file) => {
            let content_type = guess_content_type(&path);
            ([(header::CONTENT_TYPE, content_type)], file.data.into_owned()).into_response()
        }
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

async fn build_status_response(app: &Application) -> StatusResponse {
    let stats = app.get_stats().await;

    let mut tunnels = BTreeMap::new();
    let mut global_status = true;

    let forwardings: Vec<ForwardingView> = stats
        .status
        .iter()
        .map(|s| {
            if !s.is_alive {
                global_status = false;
            }

            tunnels.insert(
                s.ident.clone(),
                TunnelStatus {
                    ok: s.is_alive,
                    ident: format!("{}={}", s.ident, s.is_alive),
                },
            );

            ForwardingView {
                is_alive: s.is_alive,
                current_pid: s.pid,
                ident: s.ident.clone(),
                starts_history: s.starts_history.clone(),
                restarts_count: s.restarts_count,
            }
        })
        .collect();

    StatusResponse {
        status: GlobalStatus {
            ident: format!("global_status={global_status}"),
            ok: global_status,
            tunnels,
        },
        data: StatusData { forwardings },
    }
}

async fn serve_status_html(State(state): State<AppState>) -> impl IntoResponse {
    let response = build_status_response(&state.app).await;

    let rows: String = response
        .data
        .forwardings
        .iter()
        .map(|f| {
            format!(
                "<tr><td>{}</td><td>{}</td><td>{}</td><td>{}</td></tr>",
                f.ident,
                if f.is_alive { "up" } else { "down" },
                f.current_pid.map(|p| p.to_string()).unwrap_or_default(),
                f.restarts_count
            )
        })
        .collect();

    let page = format!(
        "<html><head><title>tunman status</title></head><body>\
         <h1>Tunnel status ({})</h1>\
         <table border=\"1\"><tr><th>ident</th><th>status</th><th>pid</th><th>restarts</th></tr>{rows}</table>\
         </body></html>",
        if response.status.ok { "ok" } else { "degraded" }
    );

    Html(page)
}

async fn serve_health_json(State(state): State<AppState>) -> impl IntoResponse {
    let response = build_status_response(&state.app).await;
    let code = if response.status.ok {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (code, Json(response))
}
