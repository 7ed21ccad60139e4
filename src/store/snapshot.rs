//! Snapshot: persisted outcome of a cache's last refresh attempt
//!
//! A snapshot is replaced wholesale on every attempt (success, failure, or
//! cancellation) and never mutated in place. Failures keep the prior good
//! artifact fields and only record the exception text and the fresh
//! `refreshed` timestamp; `updated` moves only when the content hash changes.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{LarderError, LarderResult};
use crate::identity::CacheIdentity;
use crate::store::artifact;

/// Name of the metadata file inside each cache directory
pub const METADATA_FILE: &str = "snapshot.json";

const METADATA_TMP: &str = "snapshot.json.tmp";

/// Outcome of the last refresh attempt of one cache
#[derive(Debug, Clone)]
pub struct Snapshot {
    /// Qualified cache name, for error messages and the metadata file
    pub identity: String,

    /// Committed artifact path; `None` together with `hash` when the cache
    /// never successfully produced anything
    pub artifact: Option<PathBuf>,

    /// Content hash of the artifact
    pub hash: Option<String>,

    /// Artifact size in bytes
    pub size: u64,

    /// Fingerprint of the input ledger the artifact was built from
    pub input: String,

    /// When the artifact content last changed
    pub updated: DateTime<Utc>,

    /// When a refresh was last attempted
    pub refreshed: DateTime<Utc>,

    /// Duration of the last refresh attempt
    pub cost: Duration,

    /// Serialized failure of the last attempt, if any. May coexist with a
    /// valid artifact because a failing refresh keeps the last good value.
    pub exception: Option<String>,

    /// Whether the last attempt was cancelled. Persisted so cancelled
    /// refreshes are not automatically retried after a restart.
    pub cancelled: bool,
}

impl Snapshot {
    /// Path of the artifact, or the typed reason there is none
    pub fn require_artifact(&self) -> LarderResult<&Path> {
        match &self.artifact {
            Some(path) => Ok(path),
            None => {
                if let Some(text) = &self.exception {
                    Err(LarderError::Cached { text: text.clone() })
                } else if self.cancelled {
                    Err(LarderError::Cancelled)
                } else {
                    Err(LarderError::Empty(self.identity.clone()))
                }
            }
        }
    }

    /// Whether this snapshot carries an artifact
    pub fn has_artifact(&self) -> bool {
        self.artifact.is_some()
    }

    /// Build the snapshot for a successful refresh
    pub(crate) fn success(
        identity: &CacheIdentity,
        artifact: PathBuf,
        hash: String,
        size: u64,
        input: String,
        started: DateTime<Utc>,
        previous: Option<&Snapshot>,
    ) -> Self {
        let refreshed = Utc::now();
        let updated = match previous {
            Some(prev) if prev.hash.as_deref() == Some(hash.as_str()) => prev.updated,
            _ => refreshed,
        };
        Self {
            identity: identity.qualified(),
            artifact: Some(artifact),
            hash: Some(hash),
            size,
            input,
            updated,
            refreshed,
            cost: (refreshed - started).to_std().unwrap_or(Duration::ZERO),
            exception: None,
            cancelled: false,
        }
    }

    /// Build the snapshot for a failed or cancelled refresh.
    ///
    /// Prior artifact fields are carried over so a failure never destroys the
    /// last good value. Cancellation retains the prior exception text, since
    /// cancelling alone is not an error.
    pub(crate) fn failure(
        identity: &CacheIdentity,
        error: &LarderError,
        input: Option<String>,
        started: Option<DateTime<Utc>>,
        previous: Option<&Snapshot>,
    ) -> Self {
        let refreshed = Utc::now();
        let cancelled = matches!(error, LarderError::Cancelled);
        let exception = if cancelled {
            previous.and_then(|p| p.exception.clone())
        } else {
            Some(error.persisted_text())
        };
        match previous {
            Some(prev) => Self {
                identity: identity.qualified(),
                artifact: prev.artifact.clone(),
                hash: prev.hash.clone(),
                size: prev.size,
                input: input.unwrap_or_else(|| prev.input.clone()),
                updated: prev.updated,
                refreshed,
                cost: prev.cost,
                exception,
                cancelled,
            },
            None => Self {
                identity: identity.qualified(),
                artifact: None,
                hash: None,
                size: 0,
                input: input.unwrap_or_default(),
                updated: refreshed,
                refreshed,
                cost: started
                    .map(|s| (refreshed - s).to_std().unwrap_or(Duration::ZERO))
                    .unwrap_or(Duration::ZERO),
                exception,
                cancelled,
            },
        }
    }
}

/// On-disk form of a snapshot. Timestamps are epoch milliseconds and the
/// artifact is stored as a file name relative to the cache directory.
#[derive(Debug, Serialize, Deserialize)]
struct SnapshotRecord {
    identity: String,
    artifact: Option<String>,
    hash: Option<String>,
    size: u64,
    input: String,
    updated: i64,
    refreshed: i64,
    cost_ms: u64,
    exception: Option<String>,
    cancelled: bool,
}

/// Load the snapshot of a cache directory, cleaning up as it goes.
///
/// Fail-safe: corrupt metadata is logged once, the offending files are
/// removed, and the cache is treated as empty. Any artifact file not
/// referenced by the loaded snapshot is deleted as orphaned.
pub(crate) fn load(dir: &Path, identity: &CacheIdentity) -> Option<Snapshot> {
    let path = dir.join(METADATA_FILE);
    if !path.is_file() {
        remove_orphans(dir, None);
        return None;
    }
    match read_record(&path, dir, identity) {
        Ok(snapshot) => {
            remove_orphans(dir, snapshot.artifact.as_deref());
            Some(snapshot)
        }
        Err(err) => {
            warn!("Ignoring corrupt cache metadata at {}: {err}", path.display());
            if let Err(e) = fs::remove_file(&path) {
                warn!("Unable to remove corrupt metadata file: {e}");
            }
            remove_orphans(dir, None);
            None
        }
    }
}

fn read_record(path: &Path, dir: &Path, identity: &CacheIdentity) -> LarderResult<Snapshot> {
    let content = fs::read_to_string(path)
        .map_err(|e| LarderError::io(format!("reading metadata {}", path.display()), e))?;
    let record: SnapshotRecord = serde_json::from_str(&content)?;

    let corrupt = |reason: &str| LarderError::CorruptMetadata {
        path: path.to_path_buf(),
        reason: reason.to_string(),
    };
    if record.artifact.is_some() != record.hash.is_some() {
        return Err(corrupt("artifact and hash must be present together"));
    }
    let artifact = match record.artifact {
        Some(name) => {
            let file = dir.join(name);
            if !file.is_file() {
                return Err(corrupt("referenced artifact file is missing"));
            }
            Some(file)
        }
        None => None,
    };
    Ok(Snapshot {
        identity: record.identity,
        artifact,
        hash: record.hash,
        size: record.size,
        input: record.input,
        updated: DateTime::from_timestamp_millis(record.updated)
            .ok_or_else(|| corrupt("invalid updated timestamp"))?,
        refreshed: DateTime::from_timestamp_millis(record.refreshed)
            .ok_or_else(|| corrupt("invalid refreshed timestamp"))?,
        cost: Duration::from_millis(record.cost_ms),
        exception: record.exception,
        cancelled: record.cancelled,
    })
    .map(|snapshot| {
        debug!("Loaded snapshot of {}", identity.qualified());
        snapshot
    })
}

/// Persist a snapshot via create-temp-then-atomic-rename
pub(crate) fn save(dir: &Path, snapshot: &Snapshot) -> LarderResult<()> {
    fs::create_dir_all(dir)
        .map_err(|e| LarderError::io(format!("creating cache directory {}", dir.display()), e))?;
    let record = SnapshotRecord {
        identity: snapshot.identity.clone(),
        artifact: snapshot
            .artifact
            .as_ref()
            .and_then(|p| p.file_name())
            .and_then(|n| n.to_str())
            .map(String::from),
        hash: snapshot.hash.clone(),
        size: snapshot.size,
        input: snapshot.input.clone(),
        updated: snapshot.updated.timestamp_millis(),
        refreshed: snapshot.refreshed.timestamp_millis(),
        cost_ms: snapshot.cost.as_millis() as u64,
        exception: snapshot.exception.clone(),
        cancelled: snapshot.cancelled,
    };
    let content = serde_json::to_string_pretty(&record)?;
    let tmp = dir.join(METADATA_TMP);
    fs::write(&tmp, content)
        .map_err(|e| LarderError::io(format!("writing metadata {}", tmp.display()), e))?;
    fs::rename(&tmp, dir.join(METADATA_FILE))
        .map_err(|e| LarderError::io("committing metadata rename".to_string(), e))?;
    Ok(())
}

/// Remove the persisted metadata of a cache, if any
pub(crate) fn clear(dir: &Path) -> LarderResult<()> {
    let path = dir.join(METADATA_FILE);
    if path.is_file() {
        fs::remove_file(&path)
            .map_err(|e| LarderError::io(format!("removing metadata {}", path.display()), e))?;
    }
    Ok(())
}

/// Delete artifact, scratch, and temp files not referenced by `keep`
pub(crate) fn remove_orphans(dir: &Path, keep: Option<&Path>) {
    let Ok(entries) = fs::read_dir(dir) else {
        return;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if Some(path.as_path()) == keep {
            continue;
        }
        let stale_tmp = path.file_name().and_then(|n| n.to_str()) == Some(METADATA_TMP);
        if artifact::is_artifact_file(&path) || artifact::is_scratch_file(&path) || stale_tmp {
            debug!("Removing orphaned cache file {}", path.display());
            if let Err(e) = fs::remove_file(&path) {
                warn!("Unable to remove orphaned file {}: {e}", path.display());
            }
        }
    }
}
