//! Report and update uploads.
//!
//! One job is one HTTP POST against a fixed collector endpoint. The worker
//! returns a typed result; the caller owns checkpoint writes and
//! rescheduling.

pub mod worker;

pub use worker::{ServerReply, UploadError, UploadWorker};
