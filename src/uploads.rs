//! Streaming upload pipeline, status reporting, and temp-tree layout.
//!
//! A PUT body is streamed into a `.part` file while being hashed; on success
//! the part is renamed into the destination under the upload's conflict
//! policy. Any failure marks the upload failed and removes its artifacts.

use axum::body::Body as AxumBody;
use axum::extract::{Extension, Path};
use axum::http::{HeaderMap, header};
use axum::response::Json as JsonResponse;
use chrono::Local;
use futures_util::stream::StreamExt;
use http_body_util::BodyExt;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::io::ErrorKind;
use std::path::{Path as FsPath, PathBuf};
use std::sync::Arc;
use tokio::fs::{self, File};
use tokio::io::AsyncWriteExt;
use tracing::{info, warn};

use crate::config::ServerConfig;
use crate::error::ApiError;
use crate::http::require_client_token;
use crate::pathsafe;
use crate::store::{ConflictPolicy, PortalState, Store, StoreError, UploadStatus};

/// Temp directory owned by one portal under its destination.
pub fn portal_temp_dir(dest_abs: &FsPath, temp_dir_name: &str, portal_id: &str) -> PathBuf {
    dest_abs.join(temp_dir_name).join(portal_id)
}

/// Directory holding `.part` payloads and `.json` sidecars for a portal.
pub fn upload_temp_dir(dest_abs: &FsPath, temp_dir_name: &str, portal_id: &str) -> PathBuf {
    portal_temp_dir(dest_abs, temp_dir_name, portal_id).join("uploads")
}

pub fn upload_temp_paths(temp_dir: &FsPath, upload_id: &str) -> (PathBuf, PathBuf) {
    let part_path = temp_dir.join(format!("{upload_id}.part"));
    let meta_path = temp_dir.join(format!("{upload_id}.json"));
    (part_path, meta_path)
}

/// Sidecar metadata written next to a `.part` file at init time.
#[derive(Serialize)]
pub(crate) struct UploadSidecar {
    pub portal_id: String,
    pub upload_id: String,
    pub relpath: String,
    pub size: i64,
    pub policy: ConflictPolicy,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_sha256: Option<String>,
    pub created_at: String,
}

pub(crate) async fn write_sidecar(path: &FsPath, sidecar: &UploadSidecar) -> std::io::Result<()> {
    let payload = serde_json::to_vec(sidecar).map_err(std::io::Error::other)?;
    fs::write(path, payload).await
}

#[derive(Serialize)]
pub(crate) struct UploadCommitResponse {
    pub status: String,
    pub relpath: String,
    pub server_sha256: String,
    pub bytes_received: i64,
    pub final_relpath: String,
}

#[derive(Serialize)]
pub(crate) struct UploadStatusResponse {
    pub upload_id: String,
    pub status: String,
    pub server_sha256: Option<String>,
    pub final_relpath: Option<String>,
    pub bytes_received: i64,
}

/// `PUT /api/uploads/{id}`: stream the body to disk, verify, and commit.
pub async fn stream_upload(
    Path(upload_id): Path<String>,
    Extension(store): Extension<Arc<Store>>,
    Extension(config): Extension<Arc<ServerConfig>>,
    headers: HeaderMap,
    body: AxumBody,
) -> Result<JsonResponse<UploadCommitResponse>, ApiError> {
    let upload = store.get_upload(&upload_id).await?;
    if upload.status == UploadStatus::Committed {
        return Err(ApiError::Conflict("upload already committed".into()));
    }

    let portal = store.portal_by_id(&upload.portal_id).await?;
    if portal.state == PortalState::Closing {
        return Err(ApiError::Gone("portal closed".into()));
    }
    require_client_token(&store, &portal.id, &headers).await?;

    let temp_dir = upload_temp_dir(&portal.dest_abs, &config.temp_dir_name, &portal.id);
    let (part_path, meta_path) = upload_temp_paths(&temp_dir, &upload_id);

    // The sweeper snapshots active uploads before touching artifacts, so the
    // upload must be marked active before the part file is opened.
    store.start_upload(&upload_id).await?;

    if content_length(&headers) != Some(upload.size) {
        fail_upload(&store, &upload_id, &part_path, &meta_path).await;
        return Err(ApiError::BadRequest("size mismatch".into()));
    }

    if let Err(err) = fs::create_dir_all(&temp_dir).await {
        warn!(upload_id, error = %err, "failed to create upload temp dir");
        fail_upload(&store, &upload_id, &part_path, &meta_path).await;
        return Err(ApiError::Internal("failed to prepare upload".into()));
    }

    let mut file = match File::create(&part_path).await {
        Ok(file) => file,
        Err(err) => {
            warn!(upload_id, error = %err, "failed to open part file");
            fail_upload(&store, &upload_id, &part_path, &meta_path).await;
            return Err(ApiError::Internal("failed to write upload".into()));
        }
    };

    let mut hasher = Sha256::new();
    let mut bytes_written: i64 = 0;
    let mut stream = BodyExt::into_data_stream(body);
    while let Some(chunk) = stream.next().await {
        let chunk = match chunk {
            Ok(chunk) => chunk,
            Err(err) => {
                warn!(upload_id, error = %err, "request body stream failed");
                drop(file);
                fail_upload(&store, &upload_id, &part_path, &meta_path).await;
                return Err(ApiError::Internal("failed to stream upload".into()));
            }
        };
        if chunk.is_empty() {
            continue;
        }
        hasher.update(&chunk);
        if let Err(err) = file.write_all(&chunk).await {
            warn!(upload_id, error = %err, "failed to write part file");
            drop(file);
            fail_upload(&store, &upload_id, &part_path, &meta_path).await;
            return Err(ApiError::Internal("failed to write upload".into()));
        }
        bytes_written += chunk.len() as i64;
    }

    if let Err(err) = file.sync_all().await {
        warn!(upload_id, error = %err, "failed to sync part file");
        drop(file);
        fail_upload(&store, &upload_id, &part_path, &meta_path).await;
        return Err(ApiError::Internal("failed to write upload".into()));
    }
    drop(file);

    if bytes_written != upload.size {
        fail_upload(&store, &upload_id, &part_path, &meta_path).await;
        return Err(ApiError::BadRequest("size mismatch".into()));
    }

    let server_sha256 = hex::encode(hasher.finalize());
    if let Some(client_sha256) = upload.client_sha256.as_deref()
        && !server_sha256.eq_ignore_ascii_case(client_sha256)
    {
        fail_upload(&store, &upload_id, &part_path, &meta_path).await;
        return Err(ApiError::BadRequest("sha256 mismatch".into()));
    }

    let resolved =
        resolve_final_relpath(&portal.dest_abs, &upload.relpath, upload.policy).await;
    let (final_relpath, final_abs) = match resolved {
        Ok(resolved) => resolved,
        Err(err) => {
            fail_upload(&store, &upload_id, &part_path, &meta_path).await;
            return Err(err);
        }
    };

    if let Some(parent) = final_abs.parent()
        && let Err(err) = fs::create_dir_all(parent).await
    {
        warn!(upload_id, error = %err, "failed to create destination dir");
        fail_upload(&store, &upload_id, &part_path, &meta_path).await;
        return Err(ApiError::Internal("failed to finalize upload".into()));
    }

    if let Err(err) = fs::rename(&part_path, &final_abs).await {
        warn!(upload_id, error = %err, "failed to commit upload");
        fail_upload(&store, &upload_id, &part_path, &meta_path).await;
        return Err(ApiError::Internal("failed to commit upload".into()));
    }

    if let Err(err) = fs::remove_file(&meta_path).await
        && err.kind() != ErrorKind::NotFound
    {
        warn!(upload_id, error = %err, "failed to remove upload sidecar");
    }

    let committed = store
        .mark_upload_committed(&upload_id, &server_sha256, &final_relpath, bytes_written)
        .await?;

    info!(
        upload_id,
        relpath = upload.relpath,
        final_relpath,
        bytes = bytes_written,
        elapsed_ms = (committed.updated_at - upload.created_at).num_milliseconds(),
        "upload committed"
    );

    Ok(JsonResponse(UploadCommitResponse {
        status: committed.status.as_str().to_string(),
        relpath: upload.relpath,
        server_sha256,
        bytes_received: bytes_written,
        final_relpath,
    }))
}

/// `GET /api/uploads/{id}/status`. Unknown IDs answer 200 with a `not_found`
/// status so clients can probe idempotently.
pub async fn upload_status(
    Path(upload_id): Path<String>,
    Extension(store): Extension<Arc<Store>>,
) -> Result<JsonResponse<UploadStatusResponse>, ApiError> {
    match store.get_upload(&upload_id).await {
        Ok(upload) => Ok(JsonResponse(UploadStatusResponse {
            upload_id: upload.id,
            status: upload.status.as_str().to_string(),
            server_sha256: upload.server_sha256,
            final_relpath: upload.final_relpath,
            bytes_received: upload.bytes_received,
        })),
        Err(StoreError::UploadNotFound) => Ok(JsonResponse(UploadStatusResponse {
            upload_id,
            status: "not_found".to_string(),
            server_sha256: None,
            final_relpath: None,
            bytes_received: 0,
        })),
        Err(err) => Err(err.into()),
    }
}

fn content_length(headers: &HeaderMap) -> Option<i64> {
    headers
        .get(header::CONTENT_LENGTH)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.parse::<i64>().ok())
}

/// Marks the upload failed and removes its on-disk artifacts.
async fn fail_upload(store: &Store, upload_id: &str, part_path: &FsPath, meta_path: &FsPath) {
    let _ = store.mark_upload_failed(upload_id).await;
    let _ = fs::remove_file(part_path).await;
    let _ = fs::remove_file(meta_path).await;
}

/// Picks the final relative path for a commit under the upload's policy.
///
/// Under `autorename` an occupied target is probed with timestamped
/// candidates. The probe loop is not atomic against a concurrent creator;
/// last writer wins, same as `overwrite`.
async fn resolve_final_relpath(
    dest_abs: &FsPath,
    relpath: &str,
    policy: ConflictPolicy,
) -> Result<(String, PathBuf), ApiError> {
    let final_abs = pathsafe::join_and_verify(dest_abs, relpath)?;
    if policy != ConflictPolicy::Autorename {
        return Ok((relpath.to_string(), final_abs));
    }

    match fs::metadata(&final_abs).await {
        Err(err) if err.kind() == ErrorKind::NotFound => {
            return Ok((relpath.to_string(), final_abs));
        }
        Err(_) => return Err(ApiError::Internal("failed to finalize upload".into())),
        Ok(_) => {}
    }

    let (dir, base) = match relpath.rsplit_once('/') {
        Some((dir, base)) => (Some(dir), base),
        None => (None, relpath),
    };
    let (name, ext) = split_ext(base);
    let timestamp = Local::now().format("%Y-%m-%d_%H%M%S").to_string();

    let mut attempt: u32 = 0;
    loop {
        let suffix = if attempt > 0 {
            format!("_{}", attempt + 1)
        } else {
            String::new()
        };
        let candidate = format!("{name}_{timestamp}{suffix}{ext}");
        let candidate_relpath = match dir {
            Some(dir) => format!("{dir}/{candidate}"),
            None => candidate,
        };
        let candidate_abs = pathsafe::join_and_verify(dest_abs, &candidate_relpath)?;
        match fs::metadata(&candidate_abs).await {
            Err(err) if err.kind() == ErrorKind::NotFound => {
                return Ok((candidate_relpath, candidate_abs));
            }
            Err(_) => return Err(ApiError::Internal("failed to finalize upload".into())),
            Ok(_) => {}
        }
        attempt += 1;
    }
}

fn split_ext(base: &str) -> (&str, &str) {
    match base.rfind('.') {
        Some(idx) => (&base[..idx], &base[idx..]),
        None => (base, ""),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;
    use tempfile::{TempDir, tempdir};

    use crate::store::{ConflictPolicy, CreatePortalInput, CreateUploadInput};

    const HELLO_SHA256: &str = "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824";

    struct Setup {
        _temp: TempDir,
        store: Arc<Store>,
        config: Arc<ServerConfig>,
        portal_id: String,
        client_token: String,
        dest: PathBuf,
    }

    async fn setup(policy: ConflictPolicy) -> Setup {
        let temp = tempdir().expect("tempdir");
        let dest = temp.path().to_path_buf();
        let store = Arc::new(Store::new());
        let portal = store
            .create_portal(CreatePortalInput {
                dest_abs: dest.clone(),
                open_minutes: 15,
                reusable: false,
                default_policy: policy,
            })
            .await
            .unwrap_or_else(|_| panic!("create portal failed"));
        let claim = store
            .claim_portal(&portal.id)
            .await
            .unwrap_or_else(|_| panic!("claim failed"));
        Setup {
            _temp: temp,
            store,
            config: Arc::new(ServerConfig {
                temp_dir_name: ".dropserve_tmp".to_string(),
            }),
            portal_id: portal.id,
            client_token: claim.client_token,
            dest,
        }
    }

    async fn create_upload(setup: &Setup, upload_id: &str, relpath: &str, size: i64) {
        create_upload_with(setup, upload_id, relpath, size, None, ConflictPolicy::Overwrite).await;
    }

    async fn create_upload_with(
        setup: &Setup,
        upload_id: &str,
        relpath: &str,
        size: i64,
        client_sha256: Option<String>,
        policy: ConflictPolicy,
    ) {
        setup
            .store
            .create_upload(CreateUploadInput {
                portal_id: setup.portal_id.clone(),
                upload_id: upload_id.to_string(),
                relpath: relpath.to_string(),
                size,
                client_sha256,
                policy,
            })
            .await
            .unwrap_or_else(|_| panic!("create upload failed"));
    }

    fn put_headers(setup: &Setup, content_length: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::CONTENT_LENGTH,
            HeaderValue::from_str(content_length).expect("header"),
        );
        headers.insert(
            "x-client-token",
            HeaderValue::from_str(&setup.client_token).expect("header"),
        );
        headers
    }

    async fn put(
        setup: &Setup,
        upload_id: &str,
        headers: HeaderMap,
        body: &'static str,
    ) -> Result<JsonResponse<UploadCommitResponse>, ApiError> {
        stream_upload(
            Path(upload_id.to_string()),
            Extension(setup.store.clone()),
            Extension(setup.config.clone()),
            headers,
            AxumBody::from(body),
        )
        .await
    }

    #[tokio::test]
    async fn streams_hashes_and_commits() {
        let setup = setup(ConflictPolicy::Overwrite).await;
        create_upload(&setup, "u1", "a/b.txt", 5).await;

        let headers = put_headers(&setup, "5");
        let JsonResponse(resp) = put(&setup, "u1", headers, "hello")
            .await
            .unwrap_or_else(|_| panic!("put failed"));

        assert_eq!(resp.status, "committed");
        assert_eq!(resp.final_relpath, "a/b.txt");
        assert_eq!(resp.server_sha256, HELLO_SHA256);
        assert_eq!(resp.bytes_received, 5);

        let contents = fs::read(setup.dest.join("a/b.txt")).await.expect("read");
        assert_eq!(contents, b"hello");

        let temp_dir = upload_temp_dir(&setup.dest, ".dropserve_tmp", &setup.portal_id);
        let (part_path, _) = upload_temp_paths(&temp_dir, "u1");
        assert!(fs::metadata(&part_path).await.is_err(), "part file lingers");

        // The portal's active counter is released on commit.
        let portal = setup
            .store
            .portal_by_id(&setup.portal_id)
            .await
            .unwrap_or_else(|_| panic!("portal lookup failed"));
        assert_eq!(portal.active_uploads, 0);
    }

    #[tokio::test]
    async fn content_length_mismatch_fails_upload() {
        let setup = setup(ConflictPolicy::Overwrite).await;
        create_upload(&setup, "u1", "a/b.txt", 10).await;

        let headers = put_headers(&setup, "5");
        let result = put(&setup, "u1", headers, "hello").await;
        assert!(matches!(result, Err(ApiError::BadRequest(_))));

        let upload = setup
            .store
            .get_upload("u1")
            .await
            .unwrap_or_else(|_| panic!("get upload failed"));
        assert_eq!(upload.status, UploadStatus::Failed);

        let temp_dir = upload_temp_dir(&setup.dest, ".dropserve_tmp", &setup.portal_id);
        let (part_path, _) = upload_temp_paths(&temp_dir, "u1");
        assert!(fs::metadata(&part_path).await.is_err());
    }

    #[tokio::test]
    async fn client_sha_mismatch_fails_upload() {
        let setup = setup(ConflictPolicy::Overwrite).await;
        create_upload_with(
            &setup,
            "u1",
            "b.txt",
            5,
            Some("00".repeat(32)),
            ConflictPolicy::Overwrite,
        )
        .await;

        let headers = put_headers(&setup, "5");
        let result = put(&setup, "u1", headers, "hello").await;
        assert!(matches!(result, Err(ApiError::BadRequest(_))));
        assert!(fs::metadata(setup.dest.join("b.txt")).await.is_err());

        let upload = setup
            .store
            .get_upload("u1")
            .await
            .unwrap_or_else(|_| panic!("get upload failed"));
        assert_eq!(upload.status, UploadStatus::Failed);
    }

    #[tokio::test]
    async fn matching_client_sha_commits() {
        let setup = setup(ConflictPolicy::Overwrite).await;
        create_upload_with(
            &setup,
            "u1",
            "b.txt",
            5,
            Some(HELLO_SHA256.to_uppercase()),
            ConflictPolicy::Overwrite,
        )
        .await;

        let headers = put_headers(&setup, "5");
        put(&setup, "u1", headers, "hello")
            .await
            .unwrap_or_else(|_| panic!("put failed"));
    }

    #[tokio::test]
    async fn autorename_preserves_existing_file() {
        let setup = setup(ConflictPolicy::Autorename).await;
        fs::write(setup.dest.join("report.pdf"), b"original")
            .await
            .expect("write existing");
        create_upload_with(
            &setup,
            "u1",
            "report.pdf",
            5,
            None,
            ConflictPolicy::Autorename,
        )
        .await;

        let headers = put_headers(&setup, "5");
        let JsonResponse(resp) = put(&setup, "u1", headers, "hello")
            .await
            .unwrap_or_else(|_| panic!("put failed"));

        assert_ne!(resp.final_relpath, "report.pdf");
        assert!(resp.final_relpath.starts_with("report_"));
        assert!(resp.final_relpath.ends_with(".pdf"));

        let original = fs::read(setup.dest.join("report.pdf")).await.expect("read");
        assert_eq!(original, b"original");
        let renamed = fs::read(setup.dest.join(&resp.final_relpath))
            .await
            .expect("read renamed");
        assert_eq!(renamed, b"hello");
    }

    #[tokio::test]
    async fn committed_upload_rejects_second_put() {
        let setup = setup(ConflictPolicy::Overwrite).await;
        create_upload(&setup, "u1", "b.txt", 5).await;

        let headers = put_headers(&setup, "5");
        put(&setup, "u1", headers, "hello")
            .await
            .unwrap_or_else(|_| panic!("put failed"));

        let headers = put_headers(&setup, "5");
        let result = put(&setup, "u1", headers, "hello").await;
        assert!(matches!(result, Err(ApiError::Conflict(_))));
    }

    #[tokio::test]
    async fn put_requires_client_token() {
        let setup = setup(ConflictPolicy::Overwrite).await;
        create_upload(&setup, "u1", "b.txt", 5).await;

        let mut headers = HeaderMap::new();
        headers.insert(header::CONTENT_LENGTH, HeaderValue::from_static("5"));
        let result = put(&setup, "u1", headers, "hello").await;
        assert!(matches!(result, Err(ApiError::Unauthorized(_))));
    }

    #[tokio::test]
    async fn unknown_upload_is_not_found() {
        let setup = setup(ConflictPolicy::Overwrite).await;
        let headers = put_headers(&setup, "5");
        let result = put(&setup, "missing", headers, "hello").await;
        assert!(matches!(result, Err(ApiError::NotFound(_))));
    }

    #[tokio::test]
    async fn status_reports_not_found_for_unknown_ids() {
        let store = Arc::new(Store::new());
        let JsonResponse(resp) = upload_status(Path("ghost".to_string()), Extension(store))
            .await
            .unwrap_or_else(|_| panic!("status failed"));
        assert_eq!(resp.status, "not_found");
        assert_eq!(resp.bytes_received, 0);
    }

    #[tokio::test]
    async fn status_tracks_commit() {
        let setup = setup(ConflictPolicy::Overwrite).await;
        create_upload(&setup, "u1", "b.txt", 5).await;

        let headers = put_headers(&setup, "5");
        put(&setup, "u1", headers, "hello")
            .await
            .unwrap_or_else(|_| panic!("put failed"));

        let JsonResponse(resp) =
            upload_status(Path("u1".to_string()), Extension(setup.store.clone()))
                .await
                .unwrap_or_else(|_| panic!("status failed"));
        assert_eq!(resp.status, "committed");
        assert_eq!(resp.server_sha256.as_deref(), Some(HELLO_SHA256));
        assert_eq!(resp.final_relpath.as_deref(), Some("b.txt"));
        assert_eq!(resp.bytes_received, 5);
    }

    #[test]
    fn split_ext_variants() {
        assert_eq!(split_ext("report.pdf"), ("report", ".pdf"));
        assert_eq!(split_ext("archive.tar.gz"), ("archive.tar", ".gz"));
        assert_eq!(split_ext("README"), ("README", ""));
        assert_eq!(split_ext(".env"), ("", ".env"));
    }
}
