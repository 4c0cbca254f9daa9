//! Embedded web UI: landing page, portal page, and static assets.

use axum::body::Body as AxumBody;
use axum::extract::{Extension, Path};
use axum::http::{HeaderMap, HeaderValue, Request, StatusCode, header};
use axum::response::{IntoResponse, Response};
use rust_embed::RustEmbed;
use std::sync::Arc;

use crate::store::Store;

/// Embedded UI assets served by the fallback handler.
#[derive(RustEmbed)]
#[folder = "assets"]
pub struct WebAssets;

/// Serves `/`, `/assets/*`, and the favicon; everything unmatched gets the
/// 404 page.
pub async fn serve_frontend(req: Request<AxumBody>) -> Response {
    let path = req.uri().path().trim_start_matches('/');
    if path.is_empty() {
        return index_page();
    }
    // Assets are embedded flat; `/assets/x` and `/x` reach the same file.
    let key = path.strip_prefix("assets/").unwrap_or(path);
    match load_asset(key) {
        Some(response) => response,
        None => not_found_page(),
    }
}

/// `GET /p/{id}` and `/p/{id}/claimed`: the portal page when the portal is
/// live, the 404 page otherwise.
pub async fn portal_page(
    Path(portal_id): Path<String>,
    Extension(store): Extension<Arc<Store>>,
) -> Response {
    if store.portal_by_id(&portal_id).await.is_err() {
        return not_found_page();
    }
    index_page()
}

fn index_page() -> Response {
    match load_asset("index.html") {
        Some(response) => response,
        None => (StatusCode::INTERNAL_SERVER_ERROR, "web ui not available").into_response(),
    }
}

pub fn not_found_page() -> Response {
    match WebAssets::get("404.html") {
        Some(asset) => (
            StatusCode::NOT_FOUND,
            html_headers(),
            AxumBody::from(asset.data.into_owned()),
        )
            .into_response(),
        None => (StatusCode::NOT_FOUND, "not found").into_response(),
    }
}

fn load_asset(path: &str) -> Option<Response> {
    let asset = WebAssets::get(path)?;
    let mime = mime_guess::from_path(path).first_or_octet_stream();
    let mut headers = HeaderMap::new();
    if let Ok(value) = HeaderValue::from_str(mime.essence_str()) {
        headers.insert(header::CONTENT_TYPE, value);
    }
    Some((headers, AxumBody::from(asset.data.into_owned())).into_response())
}

fn html_headers() -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("text/html; charset=utf-8"),
    );
    headers
}
