//! Job execution shim.
//!
//! Sits between the platform job facility and the upload worker. Each running
//! job is registered under its handle with a ticket; only the completion that
//! still owns the registry entry is forwarded, so a job stopped mid-flight
//! never reaches the checkpoint. The platform slot stays held until the
//! completion has been applied and [`JobExecutionShim::release`] is called.

use crate::error::Result;
use crate::payload::{JobKind, ReportJob};
use crate::scheduler::platform::{JobConstraints, JobHandle, JobScheduler};
use crate::upload::{ServerReply, UploadError, UploadWorker};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Outcome of one job, forwarded to the dispatcher.
#[derive(Debug, Clone, PartialEq)]
pub struct JobCompletion {
    pub handle: JobHandle,
    pub kind: JobKind,
    pub result: std::result::Result<ServerReply, UploadError>,
    /// Ask the platform to run the job again under its own backoff.
    pub wants_reschedule: bool,
}

struct InFlight {
    ticket: u64,
    cancel: CancellationToken,
}

/// Runs platform-started jobs on the upload worker.
pub struct JobExecutionShim {
    platform: Arc<dyn JobScheduler>,
    worker: Arc<UploadWorker>,
    constraints: JobConstraints,
    registry: Mutex<HashMap<JobHandle, InFlight>>,
    next_ticket: AtomicU64,
    completion_tx: mpsc::UnboundedSender<JobCompletion>,
}

impl JobExecutionShim {
    pub fn new(
        platform: Arc<dyn JobScheduler>,
        worker: UploadWorker,
        constraints: JobConstraints,
        completion_tx: mpsc::UnboundedSender<JobCompletion>,
    ) -> Arc<Self> {
        Arc::new(Self {
            platform,
            worker: Arc::new(worker),
            constraints,
            registry: Mutex::new(HashMap::new()),
            next_ticket: AtomicU64::new(1),
            completion_tx,
        })
    }

    /// Hand `job` to the platform under the shim's constraints.
    ///
    /// # Errors
    ///
    /// Returns the platform's error; nothing is queued in that case.
    pub fn submit(&self, job: ReportJob) -> Result<JobHandle> {
        let kind = job.kind;
        let handle = self.platform.schedule(job, self.constraints)?;
        info!("submitted {kind} {handle}");
        Ok(handle)
    }

    /// Start a worker for `handle`. Returns `false` if one is already running.
    pub fn start(self: &Arc<Self>, handle: JobHandle, job: ReportJob) -> bool {
        let ticket = self.next_ticket.fetch_add(1, Ordering::Relaxed);
        let cancel = CancellationToken::new();
        {
            let mut registry = self.registry.lock().unwrap_or_else(|e| e.into_inner());
            if registry.contains_key(&handle) {
                warn!("{handle} is already running, ignoring start");
                return false;
            }
            registry.insert(
                handle,
                InFlight {
                    ticket,
                    cancel: cancel.clone(),
                },
            );
        }

        debug!("starting {} {handle} (ticket {ticket})", job.kind);
        let shim = Arc::clone(self);
        tokio::spawn(async move {
            let result = shim.worker.run(&job, &cancel).await;
            shim.on_worker_done(handle, ticket, job.kind, result);
        });
        true
    }

    /// Cancel the worker for `handle`. Returns `true` ("reschedule me") if a
    /// worker was running.
    pub fn stop(&self, handle: JobHandle) -> bool {
        let entry = {
            let mut registry = self.registry.lock().unwrap_or_else(|e| e.into_inner());
            registry.remove(&handle)
        };
        match entry {
            Some(in_flight) => {
                in_flight.cancel.cancel();
                info!("stopped {handle}");
                true
            }
            None => false,
        }
    }

    /// Stop every running worker. Returns the handles that were stopped.
    pub fn stop_all(&self) -> Vec<JobHandle> {
        let drained: Vec<(JobHandle, InFlight)> = {
            let mut registry = self.registry.lock().unwrap_or_else(|e| e.into_inner());
            registry.drain().collect()
        };
        drained
            .into_iter()
            .map(|(handle, in_flight)| {
                in_flight.cancel.cancel();
                handle
            })
            .collect()
    }

    /// Worker completion. Returns `true` if the completion was forwarded.
    ///
    /// The platform record is kept; call [`release`](Self::release) once the
    /// completion has been applied.
    pub fn on_worker_done(
        &self,
        handle: JobHandle,
        ticket: u64,
        kind: JobKind,
        result: std::result::Result<ServerReply, UploadError>,
    ) -> bool {
        {
            let mut registry = self.registry.lock().unwrap_or_else(|e| e.into_inner());
            match registry.get(&handle) {
                Some(in_flight) if in_flight.ticket == ticket => {
                    registry.remove(&handle);
                }
                _ => {
                    debug!("dropping stale completion of {handle} (ticket {ticket})");
                    return false;
                }
            }
        }

        let wants_reschedule = matches!(
            result,
            Err(UploadError::Network(_) | UploadError::Status { .. })
        );
        if self
            .completion_tx
            .send(JobCompletion {
                handle,
                kind,
                result,
                wants_reschedule,
            })
            .is_err()
        {
            warn!("completion channel closed, releasing {handle}");
            self.platform.job_finished(handle, wants_reschedule);
        }
        true
    }

    /// Free the platform slot of an applied completion.
    pub fn release(&self, completion: &JobCompletion) {
        self.platform
            .job_finished(completion.handle, completion.wants_reschedule);
    }

    pub fn is_running(&self, handle: JobHandle) -> bool {
        let registry = self.registry.lock().unwrap_or_else(|e| e.into_inner());
        registry.contains_key(&handle)
    }

    pub fn running_count(&self) -> usize {
        let registry = self.registry.lock().unwrap_or_else(|e| e.into_inner());
        registry.len()
    }

    /// Jobs the platform still holds, queued or running.
    pub fn pending_jobs(&self) -> Vec<JobHandle> {
        self.platform.pending()
    }
}
