//! Agent background loop.
//!
//! Wires the checkpoint store, job queue, shim, dispatcher and alarm together
//! and spawns a tokio task that reacts to triggers, platform start/stop
//! requests and job completions. State lives under the configured state
//! directory: `device_stats.json` (checkpoint) and `jobs.json` (job queue).

use crate::checkpoint::CheckpointStore;
use crate::config::StatsConfig;
use crate::error::Result;
use crate::identity::{Connectivity, DeviceIdentity};
use crate::payload::PayloadOptions;
use crate::scheduler::dispatcher::{Dispatcher, SyncPolicy};
use crate::scheduler::platform::{
    AlarmClock, JobConstraints, JobScheduler, LocalJobScheduler, PlatformEvent, TokioAlarm,
    now_epoch_millis,
};
use crate::scheduler::shim::{JobCompletion, JobExecutionShim};
use crate::upload::UploadWorker;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info};

/// File name of the persisted job queue inside the state directory.
pub const JOB_QUEUE_FILE: &str = "jobs.json";

/// External events the agent reacts to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    /// Process start: restore queued jobs and re-arm from the checkpoint.
    Boot,
    /// The sync alarm fired.
    Alarm,
    /// The network came back.
    ConnectivityRestored,
    /// Stop in-flight jobs and exit the loop. Queued jobs stay persisted.
    Shutdown,
}

/// Fully wired statistics agent, ready to [`run`](Self::run).
pub struct StatsAgent {
    store: Arc<CheckpointStore>,
    platform: Arc<LocalJobScheduler>,
    shim: Arc<JobExecutionShim>,
    dispatcher: Arc<Dispatcher>,
    alarm: Arc<TokioAlarm>,
    trigger_tx: mpsc::UnboundedSender<Trigger>,
    trigger_rx: mpsc::UnboundedReceiver<Trigger>,
    platform_rx: mpsc::UnboundedReceiver<PlatformEvent>,
    completion_rx: mpsc::UnboundedReceiver<JobCompletion>,
}

impl StatsAgent {
    /// Build every component from `config`.
    ///
    /// # Errors
    ///
    /// Returns an error if the config is invalid or the HTTP client cannot be
    /// built.
    pub fn from_config(
        config: &StatsConfig,
        identity: Arc<dyn DeviceIdentity>,
        connectivity: Arc<dyn Connectivity>,
    ) -> Result<Self> {
        config.validate()?;
        let state_dir = config.state_dir();
        let schedule = &config.schedule;

        let store = Arc::new(
            CheckpointStore::for_state_dir(&state_dir).with_max_job_id(schedule.max_job_id),
        );

        let (trigger_tx, trigger_rx) = mpsc::unbounded_channel();
        let (platform_tx, platform_rx) = mpsc::unbounded_channel();
        let (completion_tx, completion_rx) = mpsc::unbounded_channel();

        let platform = Arc::new(
            LocalJobScheduler::open(state_dir.join(JOB_QUEUE_FILE), platform_tx)
                .with_backoff(Duration::from_secs(schedule.platform_backoff_secs))
                .with_connectivity(Arc::clone(&connectivity)),
        );
        let alarm = Arc::new(TokioAlarm::new(trigger_tx.clone()));

        let worker = UploadWorker::new(&config.endpoints, &config.upload)?;
        let constraints = JobConstraints {
            network_required: true,
            min_latency_ms: schedule.min_latency_ms,
            persisted: true,
        };
        let shim = JobExecutionShim::new(
            Arc::clone(&platform) as Arc<dyn JobScheduler>,
            worker,
            constraints,
            completion_tx,
        );

        let dispatcher = Arc::new(
            Dispatcher::new(
                Arc::clone(&store),
                identity,
                connectivity,
                Arc::clone(&shim),
                Arc::clone(&alarm) as Arc<dyn AlarmClock>,
                SyncPolicy::from(schedule),
            )
            .with_payload_options(PayloadOptions {
                version_prefix: config.device.version_prefix.clone(),
            }),
        );

        info!("stats agent state in {}", state_dir.display());
        Ok(Self {
            store,
            platform,
            shim,
            dispatcher,
            alarm,
            trigger_tx,
            trigger_rx,
            platform_rx,
            completion_rx,
        })
    }

    /// Sender for [`Trigger`]s; clone freely.
    pub fn triggers(&self) -> mpsc::UnboundedSender<Trigger> {
        self.trigger_tx.clone()
    }

    pub fn store(&self) -> Arc<CheckpointStore> {
        Arc::clone(&self.store)
    }

    pub fn dispatcher(&self) -> Arc<Dispatcher> {
        Arc::clone(&self.dispatcher)
    }

    pub fn shim(&self) -> Arc<JobExecutionShim> {
        Arc::clone(&self.shim)
    }

    pub fn platform(&self) -> Arc<LocalJobScheduler> {
        Arc::clone(&self.platform)
    }

    pub fn alarm(&self) -> Arc<TokioAlarm> {
        Arc::clone(&self.alarm)
    }

    /// Run the agent loop in the background.
    ///
    /// The loop ends on [`Trigger::Shutdown`] or when every event source is
    /// closed.
    pub fn run(self) -> tokio::task::JoinHandle<()> {
        let Self {
            platform,
            shim,
            dispatcher,
            trigger_tx,
            mut trigger_rx,
            mut platform_rx,
            mut completion_rx,
            ..
        } = self;
        // The alarm holds the other trigger sender; keep ours out of the loop
        // so callers dropping theirs can close the channel.
        drop(trigger_tx);

        tokio::spawn(async move {
            info!("stats agent started");
            loop {
                tokio::select! {
                    Some(trigger) = trigger_rx.recv() => {
                        let now = now_epoch_millis();
                        match trigger {
                            Trigger::Boot => {
                                platform.restore();
                                let action = dispatcher.on_boot(now);
                                debug!("boot -> {action:?}");
                            }
                            Trigger::Alarm => {
                                let action = dispatcher.on_alarm(now);
                                debug!("alarm -> {action:?}");
                            }
                            Trigger::ConnectivityRestored => {
                                if let Some(action) = dispatcher.on_connectivity_restored(now) {
                                    debug!("connectivity restored -> {action:?}");
                                }
                            }
                            Trigger::Shutdown => {
                                let stopped = shim.stop_all();
                                if !stopped.is_empty() {
                                    info!("stopped {} in-flight job(s), they stay queued", stopped.len());
                                }
                                break;
                            }
                        }
                    }
                    Some(event) = platform_rx.recv() => {
                        handle_platform_event(&shim, platform.as_ref(), &dispatcher, event);
                    }
                    Some(completion) = completion_rx.recv() => {
                        // The slot stays held until the checkpoint reflects the
                        // outcome, so triggers in between keep coalescing.
                        let action = dispatcher.on_job_finished(now_epoch_millis(), &completion);
                        shim.release(&completion);
                        debug!("{} finished -> {action:?}", completion.handle);
                    }
                    else => break,
                }
            }
            info!("stats agent stopped");
        })
    }
}

fn handle_platform_event(
    shim: &Arc<JobExecutionShim>,
    platform: &dyn JobScheduler,
    dispatcher: &Dispatcher,
    event: PlatformEvent,
) {
    match event {
        PlatformEvent::StartJob { handle, job } => {
            shim.start(handle, job);
        }
        PlatformEvent::StopJob { handle } => {
            // A reclaimed job keeps its record and is re-run under backoff;
            // a cancelled one has none left and the dispatcher arms a retry.
            if shim.stop(handle) {
                platform.job_finished(handle, true);
            }
            if let Some(action) = dispatcher.on_job_stopped(now_epoch_millis()) {
                debug!("{handle} stopped -> {action:?}");
            }
        }
    }
}
