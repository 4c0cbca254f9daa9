//! In-memory registry of portals and uploads.
//!
//! All state lives behind one async mutex; operations take the lock for their
//! full duration and never perform I/O while holding it. Portal lifecycle
//! transitions are computed by a single pure function consulted on every
//! access, so callers never observe a stale state.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use tokio::sync::Mutex;

use crate::config::DEFAULT_OPEN_MINUTES;
use crate::idgen;

/// Errors returned by store operations, compared by variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreError {
    PortalNotFound,
    PortalAlreadyClaimed,
    PortalClosed,
    ClientTokenRequired,
    ClientTokenInvalid,
    UploadNotFound,
    UploadAlreadyCommitted,
    UploadAlreadyExists,
    IdGeneration,
}

/// Conflict handling when an upload target already exists.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConflictPolicy {
    Overwrite,
    Autorename,
}

impl ConflictPolicy {
    pub fn as_str(self) -> &'static str {
        match self {
            ConflictPolicy::Overwrite => "overwrite",
            ConflictPolicy::Autorename => "autorename",
        }
    }
}

/// Parses a policy string; an empty value falls back to `overwrite`.
pub fn normalize_policy(raw: &str) -> Option<ConflictPolicy> {
    match raw.trim().to_lowercase().as_str() {
        "" | "overwrite" => Some(ConflictPolicy::Overwrite),
        "autorename" => Some(ConflictPolicy::Autorename),
        _ => None,
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PortalState {
    Open,
    Claimed,
    InUse,
    Closing,
    Closed,
    Expired,
}

impl PortalState {
    /// Terminal states accept no further transitions.
    pub fn is_terminal(self) -> bool {
        matches!(self, PortalState::Closed | PortalState::Expired)
    }
}

/// Computes the current state from the recorded one.
///
/// Expiry while open yields `Expired`; expiry with claims or uploads in flight
/// passes through `Closing` so active transfers can finish. A closing portal
/// with no active uploads advances to `Closed`.
fn refresh_state(
    state: PortalState,
    active_uploads: u32,
    now: DateTime<Utc>,
    open_until: DateTime<Utc>,
) -> PortalState {
    let mut state = state;
    if now > open_until {
        if state == PortalState::Open {
            state = PortalState::Expired;
        } else if !state.is_terminal() && state != PortalState::Closing {
            state = PortalState::Closing;
        }
    }
    if state == PortalState::Closing && active_uploads == 0 {
        state = PortalState::Closed;
    }
    state
}

/// A time-bounded capability to upload into one destination directory.
#[derive(Clone, Debug)]
pub struct Portal {
    pub id: String,
    pub dest_abs: PathBuf,
    pub open_until: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub reusable: bool,
    pub default_policy: ConflictPolicy,
    pub client_tokens: HashSet<String>,
    pub active_uploads: u32,
    pub state: PortalState,
}

impl Portal {
    fn refresh(&mut self, now: DateTime<Utc>) {
        self.state = refresh_state(self.state, self.active_uploads, now, self.open_until);
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UploadStatus {
    Writing,
    Committed,
    Failed,
}

impl UploadStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            UploadStatus::Writing => "writing",
            UploadStatus::Committed => "committed",
            UploadStatus::Failed => "failed",
        }
    }
}

/// One file transfer with a client-chosen ID and a declared size.
#[derive(Clone, Debug)]
pub struct Upload {
    pub id: String,
    pub portal_id: String,
    pub relpath: String,
    pub size: i64,
    pub client_sha256: Option<String>,
    pub policy: ConflictPolicy,
    pub status: UploadStatus,
    pub server_sha256: Option<String>,
    pub bytes_received: i64,
    pub final_relpath: Option<String>,
    pub active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

pub struct CreatePortalInput {
    pub dest_abs: PathBuf,
    pub open_minutes: i64,
    pub reusable: bool,
    pub default_policy: ConflictPolicy,
}

pub struct CreateUploadInput {
    pub portal_id: String,
    pub upload_id: String,
    pub relpath: String,
    pub size: i64,
    pub client_sha256: Option<String>,
    pub policy: ConflictPolicy,
}

pub struct ClaimResult {
    pub portal: Portal,
    pub client_token: String,
}

#[derive(Default)]
struct Inner {
    portals: HashMap<String, Portal>,
    uploads: HashMap<String, Upload>,
}

/// Process-wide portal/upload registry.
#[derive(Default)]
pub struct Store {
    inner: Mutex<Inner>,
}

impl Store {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn create_portal(&self, input: CreatePortalInput) -> Result<Portal, StoreError> {
        let id = idgen::new_portal_id().map_err(|_| StoreError::IdGeneration)?;
        let minutes = input.open_minutes.max(DEFAULT_OPEN_MINUTES);
        let now = Utc::now();

        let portal = Portal {
            id: id.clone(),
            dest_abs: input.dest_abs,
            open_until: now + Duration::minutes(minutes),
            created_at: now,
            reusable: input.reusable,
            default_policy: input.default_policy,
            client_tokens: HashSet::new(),
            active_uploads: 0,
            state: PortalState::Open,
        };

        let mut inner = self.inner.lock().await;
        inner.portals.insert(id, portal.clone());
        Ok(portal)
    }

    pub async fn claim_portal(&self, id: &str) -> Result<ClaimResult, StoreError> {
        let now = Utc::now();
        let mut inner = self.inner.lock().await;
        let portal = inner.portals.get_mut(id).ok_or(StoreError::PortalNotFound)?;
        portal.refresh(now);

        if portal.state.is_terminal() || portal.state == PortalState::Closing {
            return Err(StoreError::PortalClosed);
        }
        if !portal.reusable && !portal.client_tokens.is_empty() {
            return Err(StoreError::PortalAlreadyClaimed);
        }

        let client_token = idgen::new_client_token().map_err(|_| StoreError::IdGeneration)?;
        portal.client_tokens.insert(client_token.clone());
        if portal.state == PortalState::Open {
            portal.state = if portal.reusable {
                PortalState::InUse
            } else {
                PortalState::Claimed
            };
        }

        Ok(ClaimResult {
            portal: portal.clone(),
            client_token,
        })
    }

    /// Validates the client token presented for a portal.
    pub async fn require_client_token(
        &self,
        id: &str,
        token: Option<&str>,
    ) -> Result<(), StoreError> {
        let now = Utc::now();
        let mut inner = self.inner.lock().await;
        let portal = inner.portals.get_mut(id).ok_or(StoreError::PortalNotFound)?;
        portal.refresh(now);

        if portal.state.is_terminal() {
            return Err(StoreError::PortalClosed);
        }
        if portal.client_tokens.is_empty() && !portal.reusable {
            return Err(StoreError::ClientTokenRequired);
        }

        let token = token.unwrap_or("").trim();
        if token.is_empty() {
            return Err(StoreError::ClientTokenRequired);
        }
        if !portal.client_tokens.contains(token) {
            return Err(StoreError::ClientTokenInvalid);
        }

        Ok(())
    }

    pub async fn portal_by_id(&self, id: &str) -> Result<Portal, StoreError> {
        let now = Utc::now();
        let mut inner = self.inner.lock().await;
        let portal = inner.portals.get_mut(id).ok_or(StoreError::PortalNotFound)?;
        portal.refresh(now);

        if portal.state.is_terminal() {
            return Err(StoreError::PortalClosed);
        }

        Ok(portal.clone())
    }

    /// Requests teardown. The returned snapshot lets the caller distinguish a
    /// completed close from one still draining active uploads.
    pub async fn close_portal(&self, id: &str) -> Result<Portal, StoreError> {
        let now = Utc::now();
        let mut inner = self.inner.lock().await;
        let portal = inner.portals.get_mut(id).ok_or(StoreError::PortalNotFound)?;
        portal.refresh(now);

        if portal.state.is_terminal() {
            return Err(StoreError::PortalClosed);
        }

        portal.state = if portal.active_uploads == 0 {
            PortalState::Closed
        } else {
            PortalState::Closing
        };

        Ok(portal.clone())
    }

    pub async fn list_portals(&self) -> Vec<Portal> {
        let inner = self.inner.lock().await;
        inner.portals.values().cloned().collect()
    }

    /// Refreshes every portal against `now`, returning those that just became
    /// terminal.
    pub async fn sweep_portals(&self, now: DateTime<Utc>) -> Vec<Portal> {
        let mut inner = self.inner.lock().await;
        let mut newly_terminal = Vec::new();
        for portal in inner.portals.values_mut() {
            let was_terminal = portal.state.is_terminal();
            portal.refresh(now);
            if !was_terminal && portal.state.is_terminal() {
                newly_terminal.push(portal.clone());
            }
        }
        newly_terminal
    }

    pub async fn create_upload(&self, input: CreateUploadInput) -> Result<Upload, StoreError> {
        let now = Utc::now();
        let mut inner = self.inner.lock().await;
        let inner = &mut *inner;

        let portal = inner
            .portals
            .get_mut(&input.portal_id)
            .ok_or(StoreError::PortalNotFound)?;
        portal.refresh(now);
        if portal.state.is_terminal() || portal.state == PortalState::Closing {
            return Err(StoreError::PortalClosed);
        }

        if let Some(existing) = inner.uploads.get(&input.upload_id) {
            if existing.status == UploadStatus::Committed {
                return Err(StoreError::UploadAlreadyCommitted);
            }
            return Err(StoreError::UploadAlreadyExists);
        }

        let upload = Upload {
            id: input.upload_id.clone(),
            portal_id: input.portal_id,
            relpath: input.relpath,
            size: input.size,
            client_sha256: input.client_sha256,
            policy: input.policy,
            status: UploadStatus::Writing,
            server_sha256: None,
            bytes_received: 0,
            final_relpath: None,
            active: false,
            created_at: now,
            updated_at: now,
        };

        inner.uploads.insert(input.upload_id, upload.clone());
        if matches!(portal.state, PortalState::Open | PortalState::Claimed) {
            portal.state = PortalState::InUse;
        }

        Ok(upload)
    }

    pub async fn get_upload(&self, id: &str) -> Result<Upload, StoreError> {
        let inner = self.inner.lock().await;
        inner.uploads.get(id).cloned().ok_or(StoreError::UploadNotFound)
    }

    pub async fn delete_upload(&self, id: &str) {
        let now = Utc::now();
        let mut inner = self.inner.lock().await;
        let inner = &mut *inner;
        if let Some(upload) = inner.uploads.remove(id)
            && upload.active
            && let Some(portal) = inner.portals.get_mut(&upload.portal_id)
        {
            portal.active_uploads = portal.active_uploads.saturating_sub(1);
            portal.refresh(now);
        }
    }

    /// Marks an upload as actively streaming. Idempotent: the owning portal's
    /// active counter is incremented exactly once per upload.
    pub async fn start_upload(&self, id: &str) -> Result<Upload, StoreError> {
        let now = Utc::now();
        let mut inner = self.inner.lock().await;
        let inner = &mut *inner;

        let upload = inner.uploads.get_mut(id).ok_or(StoreError::UploadNotFound)?;
        let portal = inner
            .portals
            .get_mut(&upload.portal_id)
            .ok_or(StoreError::PortalNotFound)?;
        portal.refresh(now);
        if portal.state.is_terminal() {
            return Err(StoreError::PortalClosed);
        }

        if !upload.active {
            upload.active = true;
            upload.updated_at = now;
            portal.active_uploads += 1;
        }

        Ok(upload.clone())
    }

    pub async fn mark_upload_committed(
        &self,
        id: &str,
        server_sha256: &str,
        final_relpath: &str,
        bytes_received: i64,
    ) -> Result<Upload, StoreError> {
        let now = Utc::now();
        let mut inner = self.inner.lock().await;
        let inner = &mut *inner;

        let upload = inner.uploads.get_mut(id).ok_or(StoreError::UploadNotFound)?;
        settle_active(upload, &mut inner.portals, now);

        upload.status = UploadStatus::Committed;
        upload.server_sha256 = Some(server_sha256.to_string());
        upload.final_relpath = Some(final_relpath.to_string());
        upload.bytes_received = bytes_received;
        upload.updated_at = now;

        Ok(upload.clone())
    }

    pub async fn mark_upload_failed(&self, id: &str) -> Result<Upload, StoreError> {
        let now = Utc::now();
        let mut inner = self.inner.lock().await;
        let inner = &mut *inner;

        let upload = inner.uploads.get_mut(id).ok_or(StoreError::UploadNotFound)?;
        settle_active(upload, &mut inner.portals, now);

        upload.status = UploadStatus::Failed;
        upload.updated_at = now;

        Ok(upload.clone())
    }

    /// IDs of uploads currently streaming; the sweeper treats these artifacts
    /// as untouchable.
    pub async fn active_upload_ids(&self) -> HashSet<String> {
        let inner = self.inner.lock().await;
        inner
            .uploads
            .values()
            .filter(|upload| upload.active)
            .map(|upload| upload.id.clone())
            .collect()
    }
}

/// Clears the active flag and releases the portal's counter, letting a
/// closing portal advance to closed.
fn settle_active(upload: &mut Upload, portals: &mut HashMap<String, Portal>, now: DateTime<Utc>) {
    if !upload.active {
        return;
    }
    upload.active = false;
    if let Some(portal) = portals.get_mut(&upload.portal_id) {
        portal.active_uploads = portal.active_uploads.saturating_sub(1);
        portal.refresh(now);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    fn portal_input(dest: &Path) -> CreatePortalInput {
        CreatePortalInput {
            dest_abs: dest.to_path_buf(),
            open_minutes: 15,
            reusable: false,
            default_policy: ConflictPolicy::Overwrite,
        }
    }

    fn upload_input(portal_id: &str, upload_id: &str) -> CreateUploadInput {
        CreateUploadInput {
            portal_id: portal_id.to_string(),
            upload_id: upload_id.to_string(),
            relpath: "a/b.txt".to_string(),
            size: 5,
            client_sha256: None,
            policy: ConflictPolicy::Overwrite,
        }
    }

    #[test]
    fn refresh_expires_open_portals() {
        let now = Utc::now();
        let state = refresh_state(PortalState::Open, 0, now, now - Duration::seconds(1));
        assert_eq!(state, PortalState::Expired);
    }

    #[test]
    fn refresh_drains_claimed_portals_through_closing() {
        let now = Utc::now();
        let expired = now - Duration::seconds(1);
        assert_eq!(
            refresh_state(PortalState::Claimed, 1, now, expired),
            PortalState::Closing
        );
        assert_eq!(
            refresh_state(PortalState::InUse, 0, now, expired),
            PortalState::Closed
        );
    }

    #[test]
    fn refresh_keeps_terminal_states() {
        let now = Utc::now();
        let expired = now - Duration::seconds(1);
        assert_eq!(
            refresh_state(PortalState::Expired, 0, now, expired),
            PortalState::Expired
        );
        assert_eq!(
            refresh_state(PortalState::Closed, 0, now, expired),
            PortalState::Closed
        );
    }

    #[tokio::test]
    async fn single_use_portal_claims_once() {
        let store = Store::new();
        let portal = store
            .create_portal(portal_input(Path::new("/tmp/d")))
            .await
            .expect("create portal");

        let claim = store.claim_portal(&portal.id).await.expect("first claim");
        assert!(claim.client_token.starts_with("ct_"));
        assert_eq!(claim.portal.state, PortalState::Claimed);

        let second = store.claim_portal(&portal.id).await;
        assert_eq!(second.err(), Some(StoreError::PortalAlreadyClaimed));
    }

    #[tokio::test]
    async fn reusable_portal_claims_repeatedly() {
        let store = Store::new();
        let portal = store
            .create_portal(CreatePortalInput {
                reusable: true,
                ..portal_input(Path::new("/tmp/d"))
            })
            .await
            .expect("create portal");

        let first = store.claim_portal(&portal.id).await.expect("first claim");
        assert_eq!(first.portal.state, PortalState::InUse);
        let second = store.claim_portal(&portal.id).await.expect("second claim");
        assert_ne!(first.client_token, second.client_token);
    }

    #[tokio::test]
    async fn client_token_validation() {
        let store = Store::new();
        let portal = store
            .create_portal(portal_input(Path::new("/tmp/d")))
            .await
            .expect("create portal");

        assert_eq!(
            store.require_client_token(&portal.id, None).await.err(),
            Some(StoreError::ClientTokenRequired)
        );

        let claim = store.claim_portal(&portal.id).await.expect("claim");
        assert_eq!(
            store.require_client_token(&portal.id, None).await.err(),
            Some(StoreError::ClientTokenRequired)
        );
        assert_eq!(
            store.require_client_token(&portal.id, Some("ct_bogus")).await.err(),
            Some(StoreError::ClientTokenInvalid)
        );
        store
            .require_client_token(&portal.id, Some(&claim.client_token))
            .await
            .expect("valid token");
    }

    #[tokio::test]
    async fn create_upload_moves_portal_in_use() {
        let store = Store::new();
        let portal = store
            .create_portal(portal_input(Path::new("/tmp/d")))
            .await
            .expect("create portal");
        store.claim_portal(&portal.id).await.expect("claim");

        let upload = store
            .create_upload(upload_input(&portal.id, "u1"))
            .await
            .expect("create upload");
        assert_eq!(upload.status, UploadStatus::Writing);

        let refreshed = store.portal_by_id(&portal.id).await.expect("portal");
        assert_eq!(refreshed.state, PortalState::InUse);
    }

    #[tokio::test]
    async fn upload_id_collisions_are_rejected() {
        let store = Store::new();
        let portal = store
            .create_portal(portal_input(Path::new("/tmp/d")))
            .await
            .expect("create portal");

        store
            .create_upload(upload_input(&portal.id, "u1"))
            .await
            .expect("create upload");
        assert_eq!(
            store.create_upload(upload_input(&portal.id, "u1")).await.err(),
            Some(StoreError::UploadAlreadyExists)
        );

        store
            .mark_upload_committed("u1", "deadbeef", "a/b.txt", 5)
            .await
            .expect("commit");
        assert_eq!(
            store.create_upload(upload_input(&portal.id, "u1")).await.err(),
            Some(StoreError::UploadAlreadyCommitted)
        );
    }

    #[tokio::test]
    async fn start_upload_counts_once() {
        let store = Store::new();
        let portal = store
            .create_portal(portal_input(Path::new("/tmp/d")))
            .await
            .expect("create portal");
        store
            .create_upload(upload_input(&portal.id, "u1"))
            .await
            .expect("create upload");

        store.start_upload("u1").await.expect("start");
        store.start_upload("u1").await.expect("start again");

        let snapshot = store.portal_by_id(&portal.id).await.expect("portal");
        assert_eq!(snapshot.active_uploads, 1);
        assert_eq!(store.active_upload_ids().await.len(), 1);
    }

    #[tokio::test]
    async fn close_waits_for_active_uploads() {
        let store = Store::new();
        let portal = store
            .create_portal(portal_input(Path::new("/tmp/d")))
            .await
            .expect("create portal");
        store
            .create_upload(upload_input(&portal.id, "u1"))
            .await
            .expect("create upload");
        store.start_upload("u1").await.expect("start");

        let closing = store.close_portal(&portal.id).await.expect("close");
        assert_eq!(closing.state, PortalState::Closing);
        assert_eq!(closing.active_uploads, 1);

        store
            .mark_upload_committed("u1", "deadbeef", "a/b.txt", 5)
            .await
            .expect("commit");
        assert_eq!(
            store.portal_by_id(&portal.id).await.err(),
            Some(StoreError::PortalClosed)
        );
        assert_eq!(
            store.create_upload(upload_input(&portal.id, "u2")).await.err(),
            Some(StoreError::PortalClosed)
        );
    }

    #[tokio::test]
    async fn close_without_active_uploads_is_immediate() {
        let store = Store::new();
        let portal = store
            .create_portal(portal_input(Path::new("/tmp/d")))
            .await
            .expect("create portal");

        let closed = store.close_portal(&portal.id).await.expect("close");
        assert_eq!(closed.state, PortalState::Closed);
        assert_eq!(
            store.close_portal(&portal.id).await.err(),
            Some(StoreError::PortalClosed)
        );
    }

    #[tokio::test]
    async fn delete_upload_releases_active_counter() {
        let store = Store::new();
        let portal = store
            .create_portal(portal_input(Path::new("/tmp/d")))
            .await
            .expect("create portal");
        store
            .create_upload(upload_input(&portal.id, "u1"))
            .await
            .expect("create upload");
        store.start_upload("u1").await.expect("start");

        store.delete_upload("u1").await;
        let snapshot = store.portal_by_id(&portal.id).await.expect("portal");
        assert_eq!(snapshot.active_uploads, 0);
        assert_eq!(
            store.get_upload("u1").await.err(),
            Some(StoreError::UploadNotFound)
        );
    }

    #[tokio::test]
    async fn sweep_reports_newly_terminal_portals() {
        let store = Store::new();
        let portal = store
            .create_portal(portal_input(Path::new("/tmp/d")))
            .await
            .expect("create portal");

        assert!(store.sweep_portals(Utc::now()).await.is_empty());

        let later = Utc::now() + Duration::minutes(20);
        let terminal = store.sweep_portals(later).await;
        assert_eq!(terminal.len(), 1);
        assert_eq!(terminal[0].state, PortalState::Expired);
        assert_eq!(
            store.claim_portal(&portal.id).await.err(),
            Some(StoreError::PortalClosed)
        );

        // Already terminal portals are not reported twice.
        assert!(store.sweep_portals(later).await.is_empty());
    }

    #[test]
    fn policy_normalization() {
        assert_eq!(normalize_policy(""), Some(ConflictPolicy::Overwrite));
        assert_eq!(normalize_policy("Overwrite"), Some(ConflictPolicy::Overwrite));
        assert_eq!(normalize_policy(" autorename "), Some(ConflictPolicy::Autorename));
        assert_eq!(normalize_policy("rename"), None);
    }
}
