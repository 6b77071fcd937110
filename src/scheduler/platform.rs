//! Platform job-execution facility.
//!
//! [`JobScheduler`] is the seam between the scheduler core and whatever runs
//! jobs; [`AlarmClock`] arms one-shot wake-ups. [`LocalJobScheduler`] and
//! [`TokioAlarm`] implement both in-process: scheduled job records are
//! persisted to `jobs.json` so they survive restarts, and started jobs are
//! announced on a [`PlatformEvent`] channel.

use crate::error::{Result, StatsError};
use crate::identity::Connectivity;
use crate::payload::ReportJob;
use crate::scheduler::runner::Trigger;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Number of platform-level re-runs a failing job gets before it is dropped.
const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Current UTC milliseconds since epoch.
pub fn now_epoch_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// RFC 3339 rendering of an epoch-millis timestamp, for logs.
pub fn format_epoch_millis(ms: i64) -> String {
    chrono::DateTime::from_timestamp_millis(ms)
        .map(|at| at.to_rfc3339())
        .unwrap_or_else(|| ms.to_string())
}

/// Platform identifier of one scheduled unit of work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct JobHandle(pub u32);

impl From<&ReportJob> for JobHandle {
    fn from(job: &ReportJob) -> Self {
        Self(job.job_id)
    }
}

impl std::fmt::Display for JobHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "job-{}", self.0)
    }
}

/// Conditions attached to a scheduled job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobConstraints {
    /// Only start while connectivity reports online.
    pub network_required: bool,
    /// Minimum delay before the job may start, in milliseconds.
    pub min_latency_ms: u64,
    /// Keep the job across process restarts.
    pub persisted: bool,
}

impl Default for JobConstraints {
    fn default() -> Self {
        Self {
            network_required: true,
            min_latency_ms: 1000,
            persisted: true,
        }
    }
}

/// Job-execution facility used by the execution shim.
pub trait JobScheduler: Send + Sync {
    /// Queue `job`. A job with the same handle replaces the previous one.
    fn schedule(&self, job: ReportJob, constraints: JobConstraints) -> Result<JobHandle>;

    /// Drop a queued job. Returns `true` if it existed.
    fn cancel(&self, handle: JobHandle) -> Result<bool>;

    /// The job's slot is free. With `wants_reschedule`, the platform runs it
    /// again later under its own backoff.
    fn job_finished(&self, handle: JobHandle, wants_reschedule: bool);

    /// Handles of jobs queued or running.
    fn pending(&self) -> Vec<JobHandle>;
}

/// One-shot wake-up timer. Arming replaces any previous alarm.
pub trait AlarmClock: Send + Sync {
    fn set_alarm(&self, at_ms: i64);
}

/// Requests the platform sends to the execution shim.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlatformEvent {
    /// Run the job now.
    StartJob { handle: JobHandle, job: ReportJob },
    /// Stop the running job; it was cancelled or resources are reclaimed.
    StopJob { handle: JobHandle },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct JobRecord {
    job: ReportJob,
    constraints: JobConstraints,
    #[serde(default)]
    attempts: u32,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct JobQueueState {
    #[serde(default = "default_queue_version")]
    version: u8,
    #[serde(default)]
    jobs: Vec<JobRecord>,
}

fn default_queue_version() -> u8 {
    1
}

/// In-process job queue with persisted records and tokio start timers.
pub struct LocalJobScheduler {
    path: Option<PathBuf>,
    records: Mutex<BTreeMap<JobHandle, JobRecord>>,
    timers: Mutex<HashMap<JobHandle, JoinHandle<()>>>,
    events_tx: mpsc::UnboundedSender<PlatformEvent>,
    connectivity: Option<Arc<dyn Connectivity>>,
    backoff: Duration,
    max_attempts: u32,
}

impl LocalJobScheduler {
    /// Queue that keeps records in memory only.
    pub fn new(events_tx: mpsc::UnboundedSender<PlatformEvent>) -> Self {
        Self {
            path: None,
            records: Mutex::new(BTreeMap::new()),
            timers: Mutex::new(HashMap::new()),
            events_tx,
            connectivity: None,
            backoff: Duration::from_secs(30),
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }

    /// Queue persisted to `path`. Call [`restore`](Self::restore) to re-arm
    /// records left by a previous process.
    pub fn open(path: PathBuf, events_tx: mpsc::UnboundedSender<PlatformEvent>) -> Self {
        let mut scheduler = Self::new(events_tx);
        scheduler.path = Some(path);
        scheduler
    }

    /// Base delay for re-running a job that asked to be rescheduled
    /// (multiplied by the attempt number).
    #[must_use]
    pub fn with_backoff(mut self, backoff: Duration) -> Self {
        self.backoff = backoff;
        self
    }

    #[must_use]
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    /// Gate network-constrained jobs on this connectivity source.
    #[must_use]
    pub fn with_connectivity(mut self, connectivity: Arc<dyn Connectivity>) -> Self {
        self.connectivity = Some(connectivity);
        self
    }

    /// Reload persisted records and arm their start timers. Returns how many
    /// jobs were restored.
    pub fn restore(&self) -> usize {
        let state = match self.load_state() {
            Ok(state) => state,
            Err(e) => {
                warn!("cannot restore scheduled jobs: {e}");
                return 0;
            }
        };

        let mut restored = Vec::new();
        {
            let mut records = self.records.lock().unwrap_or_else(|e| e.into_inner());
            for record in state.jobs {
                let handle = JobHandle::from(&record.job);
                if records.contains_key(&handle) {
                    continue;
                }
                restored.push((handle, record.constraints.min_latency_ms));
                records.insert(handle, record);
            }
        }

        for (handle, latency_ms) in &restored {
            self.arm(*handle, Duration::from_millis(*latency_ms));
        }
        if !restored.is_empty() {
            info!("restored {} scheduled stats job(s)", restored.len());
        }
        restored.len()
    }

    /// Stop `handle` but keep its record, so the queue runs it again under
    /// backoff. Returns `false` if nothing is queued under that handle.
    pub fn reclaim(&self, handle: JobHandle) -> bool {
        let queued = {
            let records = self.records.lock().unwrap_or_else(|e| e.into_inner());
            records.contains_key(&handle)
        };
        if !queued {
            return false;
        }
        if self.events_tx.send(PlatformEvent::StopJob { handle }).is_err() {
            debug!("platform event channel closed, cannot stop {handle}");
        }
        info!("reclaiming {handle} for a later run");
        true
    }

    /// Queued jobs, in handle order.
    pub fn queued_jobs(&self) -> Vec<ReportJob> {
        let records = self.records.lock().unwrap_or_else(|e| e.into_inner());
        records.values().map(|r| r.job.clone()).collect()
    }

    fn arm(&self, handle: JobHandle, delay: Duration) {
        let (job, constraints) = {
            let records = self.records.lock().unwrap_or_else(|e| e.into_inner());
            match records.get(&handle) {
                Some(record) => (record.job.clone(), record.constraints),
                None => return,
            }
        };
        let events_tx = self.events_tx.clone();
        let connectivity = self.connectivity.clone();
        let backoff = self.backoff;

        let timer = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if constraints.network_required {
                if let Some(connectivity) = connectivity {
                    while !connectivity.is_online() {
                        debug!("{handle} waiting for network");
                        tokio::time::sleep(backoff).await;
                    }
                }
            }
            if events_tx
                .send(PlatformEvent::StartJob { handle, job })
                .is_err()
            {
                debug!("platform event channel closed, dropping start of {handle}");
            }
        });

        let mut timers = self.timers.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(previous) = timers.insert(handle, timer) {
            previous.abort();
        }
    }

    fn disarm(&self, handle: JobHandle) {
        let mut timers = self.timers.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(timer) = timers.remove(&handle) {
            timer.abort();
        }
    }

    fn persist(&self, records: &BTreeMap<JobHandle, JobRecord>) {
        let Some(path) = &self.path else {
            return;
        };
        let state = JobQueueState {
            version: default_queue_version(),
            jobs: records
                .values()
                .filter(|r| r.constraints.persisted)
                .cloned()
                .collect(),
        };
        if let Err(e) = save_queue(path, &state) {
            warn!("cannot persist scheduled jobs: {e}");
        }
    }

    fn load_state(&self) -> Result<JobQueueState> {
        let Some(path) = &self.path else {
            return Ok(JobQueueState::default());
        };
        let bytes = match std::fs::read(path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(JobQueueState::default());
            }
            Err(e) => {
                return Err(StatsError::Scheduler(format!(
                    "cannot read job queue: {e}"
                )));
            }
        };
        serde_json::from_slice(&bytes)
            .map_err(|e| StatsError::Scheduler(format!("cannot parse job queue: {e}")))
    }
}

impl JobScheduler for LocalJobScheduler {
    fn schedule(&self, job: ReportJob, constraints: JobConstraints) -> Result<JobHandle> {
        job.validate()?;
        let handle = JobHandle::from(&job);
        {
            let mut records = self.records.lock().unwrap_or_else(|e| e.into_inner());
            records.insert(
                handle,
                JobRecord {
                    job,
                    constraints,
                    attempts: 0,
                },
            );
            self.persist(&records);
        }
        debug!("scheduled {handle} to start in {}ms", constraints.min_latency_ms);
        self.arm(handle, Duration::from_millis(constraints.min_latency_ms));
        Ok(handle)
    }

    fn cancel(&self, handle: JobHandle) -> Result<bool> {
        let removed = {
            let mut records = self.records.lock().unwrap_or_else(|e| e.into_inner());
            let removed = records.remove(&handle).is_some();
            if removed {
                self.persist(&records);
            }
            removed
        };
        self.disarm(handle);
        if removed && self.events_tx.send(PlatformEvent::StopJob { handle }).is_err() {
            debug!("platform event channel closed, cannot stop {handle}");
        }
        Ok(removed)
    }

    fn job_finished(&self, handle: JobHandle, wants_reschedule: bool) {
        let rerun_delay = {
            let mut records = self.records.lock().unwrap_or_else(|e| e.into_inner());
            let Some(record) = records.get_mut(&handle) else {
                return;
            };

            if wants_reschedule && record.attempts + 1 < self.max_attempts {
                record.attempts += 1;
                let delay = self.backoff.saturating_mul(record.attempts);
                self.persist(&records);
                Some(delay)
            } else {
                if wants_reschedule {
                    info!("{handle} exhausted {} attempts, dropping", self.max_attempts);
                }
                records.remove(&handle);
                self.persist(&records);
                None
            }
        };

        match rerun_delay {
            Some(delay) => {
                debug!("re-running {handle} in {delay:?}");
                self.arm(handle, delay);
            }
            None => self.disarm(handle),
        }
    }

    fn pending(&self) -> Vec<JobHandle> {
        let records = self.records.lock().unwrap_or_else(|e| e.into_inner());
        records.keys().copied().collect()
    }
}

fn save_queue(path: &Path, state: &JobQueueState) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| {
            StatsError::Scheduler(format!("cannot create job queue directory: {e}"))
        })?;
    }
    let tmp_path = path.with_extension("tmp");
    let json = serde_json::to_vec_pretty(state)
        .map_err(|e| StatsError::Scheduler(format!("cannot serialize job queue: {e}")))?;
    std::fs::write(&tmp_path, json)
        .map_err(|e| StatsError::Scheduler(format!("cannot write job queue temp file: {e}")))?;
    std::fs::rename(&tmp_path, path)
        .map_err(|e| StatsError::Scheduler(format!("cannot finalize job queue file: {e}")))?;
    Ok(())
}

/// Alarm backed by a tokio sleep that sends [`Trigger::Alarm`] when it fires.
///
/// Alarms are not persisted; a boot trigger re-arms from the checkpoint.
pub struct TokioAlarm {
    trigger_tx: mpsc::UnboundedSender<Trigger>,
    armed: Mutex<Option<(i64, JoinHandle<()>)>>,
}

impl TokioAlarm {
    pub fn new(trigger_tx: mpsc::UnboundedSender<Trigger>) -> Self {
        Self {
            trigger_tx,
            armed: Mutex::new(None),
        }
    }

    /// Epoch millis of the armed alarm, if any.
    pub fn next_alarm(&self) -> Option<i64> {
        let armed = self.armed.lock().unwrap_or_else(|e| e.into_inner());
        armed
            .as_ref()
            .filter(|(_, timer)| !timer.is_finished())
            .map(|(at, _)| *at)
    }
}

impl AlarmClock for TokioAlarm {
    fn set_alarm(&self, at_ms: i64) {
        let delay_ms = u64::try_from(at_ms.saturating_sub(now_epoch_millis())).unwrap_or(0);
        let trigger_tx = self.trigger_tx.clone();
        let timer = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(delay_ms)).await;
            if trigger_tx.send(Trigger::Alarm).is_err() {
                debug!("trigger channel closed, dropping alarm");
            }
        });

        info!(
            "next stats sync attempt at {} (in {} hours)",
            format_epoch_millis(at_ms),
            delay_ms / 3_600_000
        );

        let mut armed = self.armed.lock().unwrap_or_else(|e| e.into_inner());
        if let Some((_, previous)) = armed.replace((at_ms, timer)) {
            previous.abort();
        }
    }
}

impl Drop for TokioAlarm {
    fn drop(&mut self) {
        let armed = self.armed.get_mut().unwrap_or_else(|e| e.into_inner());
        if let Some((_, timer)) = armed.take() {
            timer.abort();
        }
    }
}
