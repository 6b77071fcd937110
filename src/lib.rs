//! Device statistics: periodic anonymized device reporting.
//!
//! A device periodically reports identity and version data to a collector,
//! at most once per sync interval, and again whenever its software version
//! changes. The crate is a scheduling engine around that upload:
//!
//! # Architecture
//!
//! - **Checkpoint**: durable last-sync state, job-id counter and cached ids
//! - **Payload**: report/update field maps built from the identity source
//! - **Dispatcher**: pure sync policy plus connectivity gating and rescheduling
//! - **Job queue**: persisted platform jobs with minimum latency and backoff
//! - **Shim**: runs started jobs on the upload worker, drops stale completions
//! - **Upload worker**: one cancellable HTTP POST per job
//!
//! [`StatsAgent`] wires these together behind a trigger channel.

pub mod checkpoint;
pub mod config;
pub mod error;
pub mod identity;
pub mod payload;
pub mod scheduler;
pub mod stats_dirs;
pub mod upload;

pub use checkpoint::{Checkpoint, CheckpointPatch, CheckpointStore};
pub use config::StatsConfig;
pub use error::{Result, StatsError};
pub use identity::{Connectivity, DeviceIdentity};
pub use payload::{JobKind, ReportJob};
pub use scheduler::{Action, StatsAgent, Trigger};
pub use upload::{ServerReply, UploadError, UploadWorker};
