//! Public portal routes: info, claim, preflight, upload init, and close.

use axum::body::Bytes;
use axum::extract::{Extension, Path};
use axum::http::HeaderMap;
use axum::response::Json as JsonResponse;
use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::io::ErrorKind;
use std::sync::Arc;
use tokio::fs;
use tracing::{info, warn};

use crate::config::ServerConfig;
use crate::error::ApiError;
use crate::http::{ensure_empty_json_body, parse_json_body, require_client_token};
use crate::pathsafe;
use crate::store::{
    ConflictPolicy, CreateUploadInput, Portal, PortalState, Store, normalize_policy,
};
use crate::uploads::{
    UploadSidecar, portal_temp_dir, upload_temp_dir, upload_temp_paths, write_sidecar,
};

#[derive(Serialize)]
pub(crate) struct PolicyFlags {
    pub overwrite: bool,
    pub autorename: bool,
}

impl From<ConflictPolicy> for PolicyFlags {
    fn from(policy: ConflictPolicy) -> Self {
        Self {
            overwrite: policy == ConflictPolicy::Overwrite,
            autorename: policy == ConflictPolicy::Autorename,
        }
    }
}

#[derive(Serialize)]
pub(crate) struct PortalInfoResponse {
    pub portal_id: String,
    pub expires_at: String,
    pub policy: PolicyFlags,
    pub reusable: bool,
}

#[derive(Serialize)]
pub(crate) struct ClaimPortalResponse {
    pub portal_id: String,
    pub client_token: String,
    pub expires_at: String,
    pub policy: PolicyFlags,
    pub reusable: bool,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct PreflightRequest {
    #[serde(default)]
    pub items: Vec<PreflightItem>,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct PreflightItem {
    #[serde(default)]
    pub relpath: String,
    #[serde(default)]
    pub size: i64,
}

#[derive(Serialize)]
pub(crate) struct PreflightConflict {
    pub relpath: String,
    pub reason: &'static str,
}

#[derive(Serialize)]
pub(crate) struct PreflightResponse {
    pub total_files: usize,
    pub total_bytes: i64,
    pub conflicts: Vec<PreflightConflict>,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct InitUploadRequest {
    #[serde(default)]
    pub upload_id: String,
    #[serde(default)]
    pub relpath: String,
    #[serde(default)]
    pub size: i64,
    #[serde(default)]
    pub client_sha256: Option<String>,
    #[serde(default)]
    pub policy: Option<String>,
}

#[derive(Serialize)]
pub(crate) struct InitUploadResponse {
    pub upload_id: String,
    pub put_url: String,
}

#[derive(Serialize)]
pub(crate) struct ClosePortalResponse {
    pub status: &'static str,
}

/// `GET /api/portals/{id}/info`.
pub async fn portal_info(
    Path(portal_id): Path<String>,
    Extension(store): Extension<Arc<Store>>,
) -> Result<JsonResponse<PortalInfoResponse>, ApiError> {
    let portal = live_portal(&store, &portal_id).await?;
    Ok(JsonResponse(PortalInfoResponse {
        portal_id: portal.id,
        expires_at: expires_at(&portal.open_until),
        policy: portal.default_policy.into(),
        reusable: portal.reusable,
    }))
}

/// `POST /api/portals/{id}/claim`: mints a client token for the caller.
pub async fn claim_portal(
    Path(portal_id): Path<String>,
    Extension(store): Extension<Arc<Store>>,
    body: Bytes,
) -> Result<JsonResponse<ClaimPortalResponse>, ApiError> {
    ensure_empty_json_body(&body)?;

    let result = store.claim_portal(&portal_id).await?;
    info!(portal_id = %result.portal.id, "portal claimed");

    Ok(JsonResponse(ClaimPortalResponse {
        portal_id: result.portal.id,
        client_token: result.client_token,
        expires_at: expires_at(&result.portal.open_until),
        policy: result.portal.default_policy.into(),
        reusable: result.portal.reusable,
    }))
}

/// `POST /api/portals/{id}/preflight`: reports which targets already exist.
/// Never mutates state.
pub async fn preflight(
    Path(portal_id): Path<String>,
    Extension(store): Extension<Arc<Store>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<JsonResponse<PreflightResponse>, ApiError> {
    let portal = live_portal(&store, &portal_id).await?;
    require_client_token(&store, &portal.id, &headers).await?;
    let req: PreflightRequest = parse_json_body(&body)?;

    let mut total_bytes: i64 = 0;
    let mut conflicts = Vec::new();
    for item in &req.items {
        if item.size < 0 {
            return Err(ApiError::BadRequest("size must be non-negative".into()));
        }
        let cleaned = pathsafe::sanitize_relpath(&item.relpath)?;
        let final_abs = pathsafe::join_and_verify(&portal.dest_abs, &cleaned)?;
        total_bytes += item.size;
        match fs::metadata(&final_abs).await {
            Ok(_) => conflicts.push(PreflightConflict {
                relpath: cleaned,
                reason: "exists",
            }),
            Err(err) if err.kind() == ErrorKind::NotFound => {}
            Err(_) => return Err(ApiError::Internal("failed to preflight upload".into())),
        }
    }

    Ok(JsonResponse(PreflightResponse {
        total_files: req.items.len(),
        total_bytes,
        conflicts,
    }))
}

/// `POST /api/portals/{id}/uploads`: registers an upload and lays down its
/// sidecar; the store row is compensated away on any filesystem failure.
pub async fn init_upload(
    Path(portal_id): Path<String>,
    Extension(store): Extension<Arc<Store>>,
    Extension(config): Extension<Arc<ServerConfig>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<JsonResponse<InitUploadResponse>, ApiError> {
    let portal = live_portal(&store, &portal_id).await?;
    require_client_token(&store, &portal.id, &headers).await?;
    let req: InitUploadRequest = parse_json_body(&body)?;

    let upload_id = req.upload_id.trim().to_string();
    if upload_id.is_empty() {
        return Err(ApiError::BadRequest("upload_id required".into()));
    }
    if req.size < 0 {
        return Err(ApiError::BadRequest("size must be non-negative".into()));
    }

    let cleaned = pathsafe::sanitize_relpath(&req.relpath)?;
    pathsafe::join_and_verify(&portal.dest_abs, &cleaned)?;

    let policy = match req.policy.as_deref().map(str::trim) {
        None | Some("") => portal.default_policy,
        Some(raw) => normalize_policy(raw)
            .ok_or_else(|| ApiError::BadRequest("policy must be overwrite or autorename".into()))?,
    };
    let client_sha256 = req
        .client_sha256
        .as_deref()
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string);

    let upload = store
        .create_upload(CreateUploadInput {
            portal_id: portal.id.clone(),
            upload_id: upload_id.clone(),
            relpath: cleaned.clone(),
            size: req.size,
            client_sha256: client_sha256.clone(),
            policy,
        })
        .await?;

    let temp_dir = upload_temp_dir(&portal.dest_abs, &config.temp_dir_name, &portal.id);
    if let Err(err) = fs::create_dir_all(&temp_dir).await {
        warn!(upload_id, error = %err, "failed to create upload temp dir");
        store.delete_upload(&upload_id).await;
        return Err(ApiError::Internal("failed to prepare upload".into()));
    }

    let (_, meta_path) = upload_temp_paths(&temp_dir, &upload_id);
    let sidecar = UploadSidecar {
        portal_id: portal.id.clone(),
        upload_id: upload_id.clone(),
        relpath: cleaned.clone(),
        size: req.size,
        policy,
        client_sha256,
        created_at: upload.created_at.to_rfc3339_opts(SecondsFormat::Secs, true),
    };
    if let Err(err) = write_sidecar(&meta_path, &sidecar).await {
        warn!(upload_id, error = %err, "failed to write upload sidecar");
        let _ = fs::remove_file(&meta_path).await;
        store.delete_upload(&upload_id).await;
        return Err(ApiError::Internal("failed to prepare upload".into()));
    }

    info!(
        portal_id = portal.id,
        upload_id,
        relpath = cleaned,
        size = req.size,
        "upload initialized"
    );

    Ok(JsonResponse(InitUploadResponse {
        put_url: format!("/api/uploads/{upload_id}"),
        upload_id,
    }))
}

/// `POST /api/portals/{id}/close`. Refuses while uploads are draining; on a
/// completed close the portal's temp tree is removed.
pub async fn close_portal(
    Path(portal_id): Path<String>,
    Extension(store): Extension<Arc<Store>>,
    Extension(config): Extension<Arc<ServerConfig>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<JsonResponse<ClosePortalResponse>, ApiError> {
    ensure_empty_json_body(&body)?;
    require_client_token(&store, &portal_id, &headers).await?;

    let portal = store.close_portal(&portal_id).await?;
    if portal.state == PortalState::Closing && portal.active_uploads > 0 {
        return Err(ApiError::Conflict("portal has active uploads".into()));
    }

    cleanup_portal_temp_dir(&portal, &config.temp_dir_name).await;
    info!(portal_id = portal.id, "portal closed");

    Ok(JsonResponse(ClosePortalResponse { status: "closed" }))
}

/// Loads a portal that can still accept requests; `closing` reads as gone.
async fn live_portal(store: &Store, portal_id: &str) -> Result<Portal, ApiError> {
    let portal = store.portal_by_id(portal_id).await?;
    if portal.state == PortalState::Closing {
        return Err(ApiError::Gone("portal closed".into()));
    }
    Ok(portal)
}

pub(crate) async fn cleanup_portal_temp_dir(portal: &Portal, temp_dir_name: &str) {
    let portal_path = portal_temp_dir(&portal.dest_abs, temp_dir_name, &portal.id);
    if let Err(err) = fs::remove_dir_all(&portal_path).await
        && err.kind() != ErrorKind::NotFound
    {
        warn!(portal_id = portal.id, error = %err, "failed to remove portal temp dir");
    }
}

fn expires_at(open_until: &chrono::DateTime<Utc>) -> String {
    open_until.to_rfc3339_opts(SecondsFormat::Secs, true)
}
