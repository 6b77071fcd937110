//! Sync policy and dispatch.
//!
//! [`evaluate`] decides, from the checkpoint alone, whether to upload now and
//! which kind of job to send, or when to wake up next. [`Dispatcher`] applies
//! that decision: it gates on connectivity, builds and submits jobs, arms the
//! alarm, and folds job completions back into the checkpoint.

use crate::checkpoint::{Checkpoint, CheckpointPatch, CheckpointStore};
use crate::config::{ConnectivityGate, ScheduleConfig};
use crate::identity::{Connectivity, DeviceIdentity};
use crate::payload::{self, JobKind, PayloadOptions, ReportJob};
use crate::scheduler::platform::{AlarmClock, format_epoch_millis};
use crate::scheduler::shim::{JobCompletion, JobExecutionShim};
use crate::upload::UploadError;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, info, warn};

const HOUR_MS: i64 = 3_600_000;

/// What the dispatcher should do next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// Upload now.
    RunNow(JobKind),
    /// Wake up at this epoch-millis timestamp.
    ScheduleAt(i64),
}

/// Timing and eligibility rules for syncs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncPolicy {
    pub sync_interval_ms: i64,
    pub retry_interval_ms: i64,
    pub offline_recheck_ms: i64,
    pub connectivity_gate: ConnectivityGate,
}

impl Default for SyncPolicy {
    fn default() -> Self {
        Self::from(&ScheduleConfig::default())
    }
}

impl From<&ScheduleConfig> for SyncPolicy {
    fn from(config: &ScheduleConfig) -> Self {
        Self {
            sync_interval_ms: secs_to_ms(config.sync_interval_secs),
            retry_interval_ms: secs_to_ms(config.retry_interval_secs),
            offline_recheck_ms: secs_to_ms(config.offline_recheck_secs),
            connectivity_gate: config.connectivity_gate,
        }
    }
}

fn secs_to_ms(secs: u64) -> i64 {
    i64::try_from(secs.saturating_mul(1000)).unwrap_or(i64::MAX)
}

/// Decide the next step for a device in state `checkpoint`.
///
/// Pure and total. A `last_synced_at` in the future (clock moved backwards)
/// is treated as "synced now", so the wake-up is never more than one
/// interval away.
pub fn evaluate(
    now_ms: i64,
    checkpoint: &Checkpoint,
    current_app_version: &str,
    policy: &SyncPolicy,
) -> Action {
    let Some(last_synced_at) = checkpoint.last_synced_at else {
        return Action::RunNow(JobKind::Report);
    };
    if current_app_version != checkpoint.app_version {
        return Action::RunNow(JobKind::Report);
    }

    let last_synced_at = last_synced_at.min(now_ms);
    if now_ms.saturating_sub(last_synced_at) >= policy.sync_interval_ms {
        if checkpoint.flash_time != 0 {
            Action::RunNow(JobKind::Update)
        } else {
            Action::RunNow(JobKind::Report)
        }
    } else {
        Action::ScheduleAt(last_synced_at.saturating_add(policy.sync_interval_ms))
    }
}

/// Applies [`evaluate`] decisions to the platform and checkpoint.
pub struct Dispatcher {
    store: Arc<CheckpointStore>,
    identity: Arc<dyn DeviceIdentity>,
    connectivity: Arc<dyn Connectivity>,
    shim: Arc<JobExecutionShim>,
    alarm: Arc<dyn AlarmClock>,
    policy: SyncPolicy,
    payload_options: PayloadOptions,
    deferred: AtomicBool,
}

impl Dispatcher {
    pub fn new(
        store: Arc<CheckpointStore>,
        identity: Arc<dyn DeviceIdentity>,
        connectivity: Arc<dyn Connectivity>,
        shim: Arc<JobExecutionShim>,
        alarm: Arc<dyn AlarmClock>,
        policy: SyncPolicy,
    ) -> Self {
        Self {
            store,
            identity,
            connectivity,
            shim,
            alarm,
            policy,
            payload_options: PayloadOptions::default(),
            deferred: AtomicBool::new(false),
        }
    }

    #[must_use]
    pub fn with_payload_options(mut self, options: PayloadOptions) -> Self {
        self.payload_options = options;
        self
    }

    /// Whether the last dispatch was deferred for connectivity.
    pub fn is_deferred(&self) -> bool {
        self.deferred.load(Ordering::SeqCst)
    }

    /// Re-arm from persisted state after a restart.
    pub fn on_boot(&self, now_ms: i64) -> Action {
        debug!("boot trigger");
        self.dispatch(now_ms)
    }

    pub fn on_alarm(&self, now_ms: i64) -> Action {
        debug!("alarm trigger");
        self.dispatch(now_ms)
    }

    /// Re-evaluate, but only if the last dispatch was deferred.
    pub fn on_connectivity_restored(&self, now_ms: i64) -> Option<Action> {
        if !self.deferred.load(Ordering::SeqCst) {
            debug!("connectivity restored, nothing deferred");
            return None;
        }
        info!("connectivity restored, retrying deferred sync");
        Some(self.dispatch(now_ms))
    }

    /// Evaluate and act: submit a job, defer for connectivity, or arm the alarm.
    pub fn dispatch(&self, now_ms: i64) -> Action {
        let checkpoint = self.store.read();
        let action = evaluate(
            now_ms,
            &checkpoint,
            &self.identity.current_app_version(),
            &self.policy,
        );

        match action {
            Action::ScheduleAt(at) => {
                self.deferred.store(false, Ordering::SeqCst);
                self.alarm.set_alarm(at);
                action
            }
            Action::RunNow(kind) => {
                if !self.is_eligible() {
                    info!("{kind} due but connectivity is unavailable, deferring");
                    self.deferred.store(true, Ordering::SeqCst);
                    self.alarm
                        .set_alarm(now_ms.saturating_add(self.policy.offline_recheck_ms));
                    return Action::ScheduleAt(now_ms);
                }
                self.deferred.store(false, Ordering::SeqCst);

                let pending = self.shim.pending_jobs();
                if !pending.is_empty() {
                    debug!("{} stats job(s) already outstanding, not submitting", pending.len());
                    return action;
                }

                match self.submit(kind, checkpoint) {
                    Ok(()) => action,
                    Err(e) => {
                        warn!("cannot submit {kind} job: {e}");
                        let retry_at = now_ms.saturating_add(self.policy.retry_interval_ms);
                        self.alarm.set_alarm(retry_at);
                        Action::ScheduleAt(retry_at)
                    }
                }
            }
        }
    }

    /// Fold a job outcome into the checkpoint and arm the next wake-up.
    ///
    /// Returns `None` for cancelled jobs; the platform re-runs those.
    pub fn on_job_finished(&self, now_ms: i64, completion: &JobCompletion) -> Option<Action> {
        let handle = completion.handle;
        let next = match &completion.result {
            Ok(reply) => {
                let mut patch = CheckpointPatch::default()
                    .synced_at(now_ms)
                    .app_version(self.identity.current_app_version());
                if let Some(flash_time) = reply.flash_time {
                    patch = patch.flash_time(flash_time);
                }
                if reply.malformed {
                    warn!("{handle} succeeded with an unreadable reply, flash time unchanged");
                }

                match self.store.write(patch) {
                    Ok(checkpoint) => {
                        info!("{} {handle} synced (HTTP {})", completion.kind, reply.status);
                        evaluate(
                            now_ms,
                            &checkpoint,
                            &self.identity.current_app_version(),
                            &self.policy,
                        )
                    }
                    Err(e) => {
                        warn!("{handle} synced but checkpoint write failed: {e}");
                        Action::ScheduleAt(now_ms.saturating_add(self.policy.retry_interval_ms))
                    }
                }
            }
            Err(UploadError::Cancelled) => {
                debug!("{handle} cancelled, leaving rescheduling to the platform");
                return None;
            }
            Err(e) => {
                warn!(
                    "{} {handle} failed: {e}; retrying in {} hours",
                    completion.kind,
                    self.policy.retry_interval_ms / HOUR_MS
                );
                Action::ScheduleAt(now_ms.saturating_add(self.policy.retry_interval_ms))
            }
        };

        match next {
            Action::ScheduleAt(at) => {
                debug!("next sync at {}", format_epoch_millis(at));
                self.alarm.set_alarm(at);
            }
            // Only reachable if the interval is shorter than a request;
            // arm an immediate alarm instead of recursing.
            Action::RunNow(_) => self.alarm.set_alarm(now_ms),
        }
        Some(next)
    }

    /// A job was stopped before it completed. Arms a retry unless the
    /// platform still holds work that will wake the agent.
    pub fn on_job_stopped(&self, now_ms: i64) -> Option<Action> {
        let pending = self.shim.pending_jobs();
        if !pending.is_empty() {
            debug!("job stopped, {} still queued", pending.len());
            return None;
        }
        let retry_at = now_ms.saturating_add(self.policy.retry_interval_ms);
        info!(
            "job stopped with nothing queued, next attempt at {}",
            format_epoch_millis(retry_at)
        );
        self.alarm.set_alarm(retry_at);
        Some(Action::ScheduleAt(retry_at))
    }

    fn is_eligible(&self) -> bool {
        if !self.connectivity.is_online() {
            return false;
        }
        match self.policy.connectivity_gate {
            ConnectivityGate::Any => true,
            ConnectivityGate::Cellular => {
                !self.connectivity.is_wifi_only() && self.connectivity.has_cellular_radio()
            }
        }
    }

    fn submit(&self, kind: JobKind, mut checkpoint: Checkpoint) -> crate::error::Result<()> {
        if checkpoint.unique_device_id.is_empty() {
            let device_id = self.identity.unique_device_id();
            if !device_id.trim().is_empty() {
                match self
                    .store
                    .write(CheckpointPatch::default().unique_device_id(device_id))
                {
                    Ok(updated) => checkpoint = updated,
                    Err(e) => warn!("cannot cache device id: {e}"),
                }
            }
        }

        let payload = payload::build(kind, self.identity.as_ref(), &checkpoint, &self.payload_options);
        let job = ReportJob::new(self.store.next_job_id(), kind, payload);
        job.validate()?;
        self.shim.submit(job)?;
        Ok(())
    }
}
