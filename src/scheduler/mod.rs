//! Sync scheduling.
//!
//! Decides when the device reports, hands jobs to the platform job queue,
//! runs them on the upload worker, and re-arms the alarm from each outcome.

pub mod dispatcher;
pub mod platform;
pub mod runner;
pub mod shim;

pub use dispatcher::{Action, Dispatcher, SyncPolicy, evaluate};
pub use platform::{
    AlarmClock, JobConstraints, JobHandle, JobScheduler, LocalJobScheduler, PlatformEvent,
    TokioAlarm, now_epoch_millis,
};
pub use runner::{StatsAgent, Trigger};
pub use shim::{JobCompletion, JobExecutionShim};
