//! Development server: the HTTP surface over `App::read_asset`.
//!
//! `GET /<id>[?main]` renders the asset fresh (dev) or from cache, with a
//! strong etag and conditional-GET support: a request that is fresh
//! against `If-None-Match` or `If-Modified-Since` gets `304` with an empty
//! body. Unresolvable ids get `404`. Pipeline failures surface as `500`.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::SystemTime;

use axum::{
    body::Body,
    extract::State,
    http::{header, HeaderMap, StatusCode, Uri},
    response::Response,
    routing::get,
    Router,
};
use tower_http::cors::{Any, CorsLayer};
use tracing::{error, info};

use porter::{App, Asset};

/// Shared handle the handlers close over.
pub type SharedApp = Arc<App>;

/// Development server over one app.
pub struct Server {
    app: SharedApp,
    addr: SocketAddr,
}

impl Server {
    pub fn new(app: SharedApp, addr: SocketAddr) -> Self {
        Self { app, addr }
    }

    /// Bind and serve until the process exits.
    pub async fn start(self) -> anyhow::Result<()> {
        let router = build_router(self.app);
        let listener = tokio::net::TcpListener::bind(self.addr).await?;
        info!("porter listening on http://{}", self.addr);
        axum::serve(listener, router).await?;
        Ok(())
    }
}

/// Router serving every path through the asset pipeline. CORS is wide
/// open, as usual for a development server.
pub fn build_router(app: SharedApp) -> Router {
    Router::new()
        .route("/", get(handle_index))
        .fallback(handle_asset)
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(app)
}

async fn handle_index() -> Response {
    plain(StatusCode::OK, "porter is running\n")
}

async fn handle_asset(
    State(app): State<SharedApp>,
    uri: Uri,
    headers: HeaderMap,
) -> Response {
    let path = uri.path().trim_start_matches('/').to_string();
    let main = uri
        .query()
        .map(|query| query.split('&').any(|pair| pair == "main" || pair.starts_with("main=")))
        .unwrap_or(false);

    match app.read_asset(&path, main).await {
        Ok(Some(asset)) => {
            if is_fresh(&headers, &asset) {
                return not_modified(&asset);
            }
            ok(&asset)
        }
        Ok(None) => plain(StatusCode::NOT_FOUND, "not found\n"),
        Err(err) => {
            error!("failed to serve /{path}: {err}");
            plain(StatusCode::INTERNAL_SERVER_ERROR, "internal error\n")
        }
    }
}

/// Freshness per RFC 9110: `If-None-Match` wins over `If-Modified-Since`.
fn is_fresh(headers: &HeaderMap, asset: &Asset) -> bool {
    if let Some(if_none_match) = headers.get(header::IF_NONE_MATCH) {
        if let Ok(value) = if_none_match.to_str() {
            return value
                .split(',')
                .any(|tag| tag.trim() == asset.etag || tag.trim() == "*");
        }
        return false;
    }
    if let (Some(if_modified_since), Some(mtime)) =
        (headers.get(header::IF_MODIFIED_SINCE), asset.mtime)
    {
        if let Ok(value) = if_modified_since.to_str() {
            if let Ok(since) = httpdate::parse_http_date(value) {
                // HTTP dates have second precision.
                let mtime_secs = mtime
                    .duration_since(SystemTime::UNIX_EPOCH)
                    .map(|d| d.as_secs())
                    .unwrap_or(0);
                let since_secs = since
                    .duration_since(SystemTime::UNIX_EPOCH)
                    .map(|d| d.as_secs())
                    .unwrap_or(0);
                return mtime_secs <= since_secs;
            }
        }
    }
    false
}

fn ok(asset: &Asset) -> Response {
    let mut builder = Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, asset.content_type)
        .header(header::CACHE_CONTROL, "max-age=0")
        .header(header::ETAG, &asset.etag);
    if let Some(mtime) = asset.mtime {
        builder = builder.header(header::LAST_MODIFIED, httpdate::fmt_http_date(mtime));
    }
    builder
        .body(Body::from(asset.content.clone()))
        .unwrap_or_else(|_| plain(StatusCode::INTERNAL_SERVER_ERROR, "response build failed\n"))
}

fn not_modified(asset: &Asset) -> Response {
    let mut builder = Response::builder()
        .status(StatusCode::NOT_MODIFIED)
        .header(header::ETAG, &asset.etag)
        .header(header::CACHE_CONTROL, "max-age=0");
    if let Some(mtime) = asset.mtime {
        builder = builder.header(header::LAST_MODIFIED, httpdate::fmt_http_date(mtime));
    }
    builder
        .body(Body::empty())
        .unwrap_or_else(|_| plain(StatusCode::INTERNAL_SERVER_ERROR, "response build failed\n"))
}

fn plain(status: StatusCode, body: &'static str) -> Response {
    Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, "text/plain; charset=utf-8")
        .body(Body::from(body))
        .expect("static response")
}
