//! Durable sync checkpoint.
//!
//! Records the last successful sync time, the app version synced, the
//! last dispatched job id, the server-assigned flash time, and the cached
//! device id. Persisted to `<state_dir>/device_stats.json`.
//!
//! Reads never fail: unreadable or corrupt storage yields the zero
//! checkpoint ("never synced"), which at worst triggers one redundant sync.

use crate::error::{Result, StatsError};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{debug, warn};

/// Fixed namespace the checkpoint is stored under.
pub const CHECKPOINT_NAMESPACE: &str = "device_stats";

/// Default upper bound of the cyclic job-id counter.
pub const DEFAULT_MAX_JOB_ID: u32 = 1000;

/// Persisted sync state for this device.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Checkpoint {
    /// Epoch millis of the last successful sync (None = never synced).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_synced_at: Option<i64>,
    /// App version active at the last successful sync.
    pub app_version: String,
    /// Last job id handed out, in `[1, max]` once any job was dispatched.
    pub last_job_id: u32,
    /// Server-assigned flash time, 0 if never received.
    pub flash_time: i64,
    /// Cached device id, empty until first cached.
    pub unique_device_id: String,
}

impl Checkpoint {
    /// Returns `true` if no sync has ever succeeded.
    pub fn never_synced(&self) -> bool {
        self.last_synced_at.is_none()
    }

    fn apply(&mut self, patch: CheckpointPatch) {
        if let Some(at) = patch.last_synced_at {
            self.last_synced_at = Some(at);
        }
        if let Some(version) = patch.app_version {
            self.app_version = version;
        }
        if let Some(id) = patch.last_job_id {
            self.last_job_id = id;
        }
        if let Some(flash_time) = patch.flash_time {
            self.flash_time = flash_time;
        }
        if let Some(device_id) = patch.unique_device_id {
            self.unique_device_id = device_id;
        }
    }
}

/// Partial update merged into the stored checkpoint. Unset fields are left alone.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CheckpointPatch {
    pub last_synced_at: Option<i64>,
    pub app_version: Option<String>,
    pub last_job_id: Option<u32>,
    pub flash_time: Option<i64>,
    pub unique_device_id: Option<String>,
}

impl CheckpointPatch {
    /// Record a successful sync at `at_ms`.
    #[must_use]
    pub fn synced_at(mut self, at_ms: i64) -> Self {
        self.last_synced_at = Some(at_ms);
        self
    }

    #[must_use]
    pub fn app_version(mut self, version: impl Into<String>) -> Self {
        self.app_version = Some(version.into());
        self
    }

    #[must_use]
    pub fn flash_time(mut self, flash_time: i64) -> Self {
        self.flash_time = Some(flash_time);
        self
    }

    #[must_use]
    pub fn unique_device_id(mut self, device_id: impl Into<String>) -> Self {
        self.unique_device_id = Some(device_id.into());
        self
    }
}

/// Mutex-serialized checkpoint store, file-backed or in-memory.
pub struct CheckpointStore {
    path: Option<PathBuf>,
    state: Mutex<Checkpoint>,
    max_job_id: u32,
}

impl CheckpointStore {
    /// Store backed by the given JSON file.
    pub fn open(path: PathBuf) -> Self {
        Self {
            path: Some(path),
            state: Mutex::new(Checkpoint::default()),
            max_job_id: DEFAULT_MAX_JOB_ID,
        }
    }

    /// Store backed by `<state_dir>/device_stats.json`.
    pub fn for_state_dir(state_dir: &Path) -> Self {
        Self::open(state_dir.join(format!("{CHECKPOINT_NAMESPACE}.json")))
    }

    /// Store that lives only in memory.
    pub fn in_memory() -> Self {
        Self {
            path: None,
            state: Mutex::new(Checkpoint::default()),
            max_job_id: DEFAULT_MAX_JOB_ID,
        }
    }

    /// Override the job-id wraparound bound (minimum 1).
    #[must_use]
    pub fn with_max_job_id(mut self, max_job_id: u32) -> Self {
        self.max_job_id = max_job_id.max(1);
        self
    }

    /// Current checkpoint. Falls back to the zero checkpoint on storage failure.
    pub fn read(&self) -> Checkpoint {
        let mut cached = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let Some(path) = &self.path else {
            return cached.clone();
        };

        match load_checkpoint(path) {
            Ok(checkpoint) => {
                *cached = checkpoint.clone();
                checkpoint
            }
            Err(e) => {
                warn!("checkpoint unavailable, treating device as never synced: {e}");
                Checkpoint::default()
            }
        }
    }

    /// Merge `patch` into the stored checkpoint and persist it.
    ///
    /// # Errors
    ///
    /// Returns [`StatsError::Storage`] if the merged record cannot be written.
    pub fn write(&self, patch: CheckpointPatch) -> Result<Checkpoint> {
        let mut cached = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let mut merged = self.current_locked(&cached);
        merged.apply(patch);
        self.persist_locked(&merged)?;
        *cached = merged.clone();
        Ok(merged)
    }

    /// Allocate the next job id: `last + 1`, wrapping to 1 after the bound.
    ///
    /// A failed persist is logged; the id is still handed out.
    pub fn next_job_id(&self) -> u32 {
        let mut cached = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let mut merged = self.current_locked(&cached);
        let next = if merged.last_job_id >= self.max_job_id {
            1
        } else {
            merged.last_job_id + 1
        };
        merged.last_job_id = next;
        if let Err(e) = self.persist_locked(&merged) {
            warn!("cannot persist job id {next}: {e}");
        }
        *cached = merged;
        debug!("allocated job id {next}");
        next
    }

    /// Merge base for a write: the file if readable, else the last good copy.
    fn current_locked(&self, cached: &Checkpoint) -> Checkpoint {
        let Some(path) = &self.path else {
            return cached.clone();
        };
        load_checkpoint(path).unwrap_or_else(|e| {
            warn!("checkpoint unreadable, merging into last known state: {e}");
            cached.clone()
        })
    }

    fn persist_locked(&self, checkpoint: &Checkpoint) -> Result<()> {
        match &self.path {
            Some(path) => save_checkpoint(path, checkpoint),
            None => Ok(()),
        }
    }
}

fn load_checkpoint(path: &Path) -> Result<Checkpoint> {
    let bytes = match std::fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Checkpoint::default()),
        Err(e) => {
            return Err(StatsError::Storage(format!(
                "cannot read checkpoint {}: {e}",
                path.display()
            )));
        }
    };

    serde_json::from_slice(&bytes)
        .map_err(|e| StatsError::Storage(format!("cannot parse checkpoint: {e}")))
}

fn save_checkpoint(path: &Path, checkpoint: &Checkpoint) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| {
            StatsError::Storage(format!(
                "cannot create checkpoint directory {}: {e}",
                parent.display()
            ))
        })?;
    }

    let tmp_path = path.with_extension("tmp");
    let json = serde_json::to_vec_pretty(checkpoint)
        .map_err(|e| StatsError::Storage(format!("cannot serialize checkpoint: {e}")))?;
    std::fs::write(&tmp_path, json)
        .map_err(|e| StatsError::Storage(format!("cannot write checkpoint temp file: {e}")))?;
    std::fs::rename(&tmp_path, path)
        .map_err(|e| StatsError::Storage(format!("cannot finalize checkpoint file: {e}")))?;
    Ok(())
}
