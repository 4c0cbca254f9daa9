//! Background garbage collection of abandoned upload artifacts.
//!
//! The sweeper reconciles the on-disk temp trees against store snapshots; it
//! never mutates upload or portal records. Artifacts of currently-streaming
//! uploads are skipped, and mtime freshness protects uploads that were just
//! initialized but have not started streaming yet.

use chrono::Utc;
use std::collections::HashSet;
use std::io::{self, ErrorKind};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::fs;
use tracing::{info, warn};

use crate::config::{
    DEFAULT_PART_MAX_AGE_SECS, DEFAULT_PORTAL_IDLE_MAX_SECS, DEFAULT_SWEEP_INTERVAL_SECS,
    DEFAULT_TEMP_DIR_NAME,
};
use crate::store::Store;

pub struct SweepConfig {
    pub temp_dir_name: String,
    pub sweep_interval: Duration,
    pub part_max_age: Duration,
    pub portal_idle_max_age: Duration,
    pub roots: Vec<PathBuf>,
}

pub struct Sweeper {
    cfg: SweepConfig,
    store: Arc<Store>,
}

impl Sweeper {
    pub fn new(mut cfg: SweepConfig, store: Arc<Store>) -> Self {
        if cfg.temp_dir_name.is_empty() {
            cfg.temp_dir_name = DEFAULT_TEMP_DIR_NAME.to_string();
        }
        if cfg.sweep_interval.is_zero() {
            cfg.sweep_interval = Duration::from_secs(DEFAULT_SWEEP_INTERVAL_SECS);
        }
        if cfg.part_max_age.is_zero() {
            cfg.part_max_age = Duration::from_secs(DEFAULT_PART_MAX_AGE_SECS);
        }
        if cfg.portal_idle_max_age.is_zero() {
            cfg.portal_idle_max_age = Duration::from_secs(DEFAULT_PORTAL_IDLE_MAX_SECS);
        }
        Self { cfg, store }
    }

    /// One full pass over every sweep root. Per-entry failures are logged and
    /// never abort the pass; the first root-level error is reported.
    pub async fn run_once(&self) -> io::Result<()> {
        for portal in self.store.sweep_portals(Utc::now()).await {
            info!(
                portal_id = portal.id,
                created_at = %portal.created_at,
                "portal reached terminal state"
            );
        }

        let active_uploads = self.store.active_upload_ids().await;
        let portals = self.store.list_portals().await;
        let active_portals: HashSet<String> = portals
            .iter()
            .filter(|portal| portal.active_uploads > 0)
            .map(|portal| portal.id.clone())
            .collect();

        let mut roots: HashSet<PathBuf> = self.cfg.roots.iter().cloned().collect();
        for portal in &portals {
            if !portal.dest_abs.as_os_str().is_empty() {
                roots.insert(portal.dest_abs.clone());
            }
        }

        let mut first_err = None;
        for root in roots {
            if let Err(err) = self.sweep_root(&root, &active_uploads, &active_portals).await {
                first_err.get_or_insert(err);
            }
        }
        match first_err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    async fn sweep_root(
        &self,
        root: &Path,
        active_uploads: &HashSet<String>,
        active_portals: &HashSet<String>,
    ) -> io::Result<()> {
        let temp_root = root.join(&self.cfg.temp_dir_name);
        let mut dir = match fs::read_dir(&temp_root).await {
            Ok(dir) => dir,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(()),
            Err(err) => return Err(err),
        };

        while let Some(entry) = dir.next_entry().await? {
            let metadata = match entry.metadata().await {
                Ok(metadata) => metadata,
                Err(_) => continue,
            };
            if !metadata.is_dir() {
                continue;
            }
            let portal_id = entry.file_name().to_string_lossy().to_string();
            let portal_path = entry.path();
            if let Err(err) = self
                .sweep_portal_dir(&portal_id, &portal_path, active_uploads, active_portals)
                .await
            {
                warn!(portal_id, error = %err, "portal temp sweep failed");
            }
        }

        Ok(())
    }

    async fn sweep_portal_dir(
        &self,
        portal_id: &str,
        portal_path: &Path,
        active_uploads: &HashSet<String>,
        active_portals: &HashSet<String>,
    ) -> io::Result<()> {
        let mut last_activity = mod_time(portal_path).await;
        let uploads_dir = portal_path.join("uploads");
        let mut dir = match fs::read_dir(&uploads_dir).await {
            Ok(dir) => dir,
            Err(err) if err.kind() == ErrorKind::NotFound => {
                return self
                    .maybe_remove_portal(portal_id, portal_path, last_activity, active_portals)
                    .await;
            }
            Err(err) => return Err(err),
        };

        let now = SystemTime::now();
        while let Some(entry) = dir.next_entry().await? {
            let metadata = match entry.metadata().await {
                Ok(metadata) => metadata,
                Err(_) => continue,
            };
            if metadata.is_dir() {
                continue;
            }
            let modified = match metadata.modified() {
                Ok(modified) => modified,
                Err(_) => continue,
            };
            if last_activity.is_none_or(|seen| modified > seen) {
                last_activity = Some(modified);
            }

            let name = entry.file_name().to_string_lossy().to_string();
            let Some(upload_id) = name
                .strip_suffix(".part")
                .or_else(|| name.strip_suffix(".json"))
            else {
                continue;
            };
            if active_uploads.contains(upload_id) {
                continue;
            }
            match now.duration_since(modified) {
                Ok(age) if age > self.cfg.part_max_age => {}
                _ => continue,
            }

            let path = entry.path();
            match fs::remove_file(&path).await {
                Ok(()) => info!(path = %path.display(), "removed stale upload artifact"),
                Err(err) if err.kind() != ErrorKind::NotFound => {
                    warn!(path = %path.display(), error = %err, "failed to remove stale artifact");
                }
                Err(_) => {}
            }
        }

        self.maybe_remove_portal(portal_id, portal_path, last_activity, active_portals)
            .await
    }

    async fn maybe_remove_portal(
        &self,
        portal_id: &str,
        portal_path: &Path,
        last_activity: Option<SystemTime>,
        active_portals: &HashSet<String>,
    ) -> io::Result<()> {
        if active_portals.contains(portal_id) {
            return Ok(());
        }
        let Some(last_activity) = last_activity else {
            return Ok(());
        };
        match SystemTime::now().duration_since(last_activity) {
            Ok(idle) if idle > self.cfg.portal_idle_max_age => {}
            _ => return Ok(()),
        }

        fs::remove_dir_all(portal_path).await?;
        info!(path = %portal_path.display(), "removed idle portal temp dir");
        Ok(())
    }
}

async fn mod_time(path: &Path) -> Option<SystemTime> {
    fs::metadata(path)
        .await
        .ok()
        .and_then(|metadata| metadata.modified().ok())
}

/// Runs the sweeper on its configured interval until the process exits.
pub fn spawn_sweeper(sweeper: Sweeper) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(sweeper.cfg.sweep_interval);
        // The first tick completes immediately; startup already swept.
        interval.tick().await;
        loop {
            interval.tick().await;
            if let Err(err) = sweeper.run_once().await {
                warn!(error = %err, "sweep failed");
            }
        }
    });
}
