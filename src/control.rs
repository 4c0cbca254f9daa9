//! Trusted control surface: portal creation and health.
//!
//! These routes carry no authentication; the operator binds them to loopback
//! or blocks `/api/control/*` at the proxy.

use axum::body::Bytes;
use axum::extract::Extension;
use axum::response::Json as JsonResponse;
use chrono::SecondsFormat;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

use crate::error::ApiError;
use crate::http::parse_json_body;
use crate::store::{ConflictPolicy, CreatePortalInput, Store, normalize_policy};

#[derive(Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct CreatePortalRequest {
    pub dest_abs: String,
    #[serde(default)]
    pub open_minutes: i64,
    #[serde(default)]
    pub reusable: bool,
    #[serde(default)]
    pub default_policy: String,
    #[serde(default)]
    pub autorename_on_conflict: bool,
}

#[derive(Deserialize, Serialize)]
pub struct CreatePortalResponse {
    pub portal_id: String,
    pub expires_at: String,
}

/// `POST /api/control/portals`.
pub async fn create_portal(
    Extension(store): Extension<Arc<Store>>,
    body: Bytes,
) -> Result<JsonResponse<CreatePortalResponse>, ApiError> {
    let req: CreatePortalRequest = parse_json_body(&body)?;

    let dest_abs = req.dest_abs.trim();
    if dest_abs.is_empty() {
        return Err(ApiError::BadRequest("dest_abs required".into()));
    }

    let default_policy = if req.default_policy.trim().is_empty() && req.autorename_on_conflict {
        ConflictPolicy::Autorename
    } else {
        normalize_policy(&req.default_policy)
            .ok_or_else(|| ApiError::BadRequest("policy must be overwrite or autorename".into()))?
    };

    let portal = store
        .create_portal(CreatePortalInput {
            dest_abs: PathBuf::from(dest_abs),
            open_minutes: req.open_minutes,
            reusable: req.reusable,
            default_policy,
        })
        .await
        .map_err(|_| ApiError::Internal("failed to create portal".into()))?;

    info!(
        portal_id = portal.id,
        dest_abs = %portal.dest_abs.display(),
        reusable = portal.reusable,
        policy = portal.default_policy.as_str(),
        "portal created"
    );

    Ok(JsonResponse(CreatePortalResponse {
        portal_id: portal.id,
        expires_at: portal.open_until.to_rfc3339_opts(SecondsFormat::Secs, true),
    }))
}

/// `GET /api/control/health`.
pub async fn health() -> JsonResponse<Value> {
    JsonResponse(json!({ "status": "ok" }))
}
