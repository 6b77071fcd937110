//! Report job payloads.
//!
//! [`build`] assembles the wire fields for a job from the identity
//! collaborator and the checkpoint. It is pure: the checkpoint is only read.

use crate::checkpoint::Checkpoint;
use crate::error::{Result, StatsError};
use crate::identity::DeviceIdentity;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub const KEY_DEVICE_HASH: &str = "device_hash";
pub const KEY_DEVICE_NAME: &str = "device_name";
pub const KEY_DEVICE_VERSION: &str = "device_version";
pub const KEY_DEVICE_COUNTRY: &str = "device_country";
pub const KEY_DEVICE_CARRIER: &str = "device_carrier";
pub const KEY_DEVICE_CARRIER_ID: &str = "device_carrier_id";
pub const KEY_DEVICE_FLASH_TIME: &str = "device_flash_time";

/// Placeholder for unknown text fields.
pub const UNKNOWN: &str = "Unknown";

/// Placeholder for an unknown carrier id.
pub const UNKNOWN_CARRIER_ID: &str = "0";

const REPORT_FIELDS: &[&str] = &[
    KEY_DEVICE_HASH,
    KEY_DEVICE_NAME,
    KEY_DEVICE_VERSION,
    KEY_DEVICE_COUNTRY,
    KEY_DEVICE_CARRIER,
    KEY_DEVICE_CARRIER_ID,
];

const UPDATE_FIELDS: &[&str] = &[KEY_DEVICE_HASH, KEY_DEVICE_VERSION, KEY_DEVICE_FLASH_TIME];

/// Field name → value, in stable order.
pub type Payload = BTreeMap<String, String>;

/// What a job uploads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    /// Full device-identity report.
    Report,
    /// Lightweight version/flash-time ping.
    Update,
}

impl JobKind {
    /// Fields that must be present for this kind.
    pub fn required_fields(self) -> &'static [&'static str] {
        match self {
            Self::Report => REPORT_FIELDS,
            Self::Update => UPDATE_FIELDS,
        }
    }
}

impl std::fmt::Display for JobKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Report => write!(f, "report"),
            Self::Update => write!(f, "update"),
        }
    }
}

/// One dispatched upload, persisted inside the job queue record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportJob {
    /// Id from the checkpoint's cyclic counter; doubles as the job handle.
    pub job_id: u32,
    pub kind: JobKind,
    pub payload: Payload,
}

impl ReportJob {
    pub fn new(job_id: u32, kind: JobKind, payload: Payload) -> Self {
        Self {
            job_id,
            kind,
            payload,
        }
    }

    /// Check the payload carries every field its kind requires.
    ///
    /// # Errors
    ///
    /// Returns [`StatsError::Payload`] naming the first missing field.
    pub fn validate(&self) -> Result<()> {
        validate(self.kind, &self.payload)
    }
}

/// Options applied while building payloads.
#[derive(Debug, Clone, Default)]
pub struct PayloadOptions {
    /// Versions not starting with this prefix are reported as [`UNKNOWN`].
    pub version_prefix: Option<String>,
}

/// Build the payload for `kind`.
///
/// The cached device id in `checkpoint` wins over the accessor. Empty
/// accessor values become placeholders.
pub fn build(
    kind: JobKind,
    identity: &dyn DeviceIdentity,
    checkpoint: &Checkpoint,
    options: &PayloadOptions,
) -> Payload {
    let device_hash = if checkpoint.unique_device_id.is_empty() {
        or_placeholder(identity.unique_device_id(), UNKNOWN)
    } else {
        checkpoint.unique_device_id.clone()
    };
    let version = reported_version(&identity.os_version(), options.version_prefix.as_deref());

    let mut payload = Payload::new();
    payload.insert(KEY_DEVICE_HASH.to_owned(), device_hash);
    payload.insert(KEY_DEVICE_VERSION.to_owned(), version);

    match kind {
        JobKind::Report => {
            payload.insert(
                KEY_DEVICE_NAME.to_owned(),
                or_placeholder(identity.product_name(), UNKNOWN),
            );
            payload.insert(
                KEY_DEVICE_COUNTRY.to_owned(),
                or_placeholder(identity.country_code(), UNKNOWN),
            );
            payload.insert(
                KEY_DEVICE_CARRIER.to_owned(),
                or_placeholder(identity.carrier_name(), UNKNOWN),
            );
            payload.insert(
                KEY_DEVICE_CARRIER_ID.to_owned(),
                or_placeholder(identity.carrier_id(), UNKNOWN_CARRIER_ID),
            );
        }
        JobKind::Update => {
            payload.insert(
                KEY_DEVICE_FLASH_TIME.to_owned(),
                checkpoint.flash_time.to_string(),
            );
        }
    }

    payload
}

/// Check `payload` carries every field `kind` requires, each non-empty.
///
/// # Errors
///
/// Returns [`StatsError::Payload`] naming the first missing field.
pub fn validate(kind: JobKind, payload: &Payload) -> Result<()> {
    for field in kind.required_fields() {
        match payload.get(*field) {
            Some(value) if !value.is_empty() => {}
            _ => {
                return Err(StatsError::Payload(format!(
                    "{kind} job missing {field}"
                )));
            }
        }
    }
    Ok(())
}

fn reported_version(os_version: &str, prefix: Option<&str>) -> String {
    let trimmed = os_version.trim();
    if trimmed.is_empty() {
        return UNKNOWN.to_owned();
    }
    match prefix {
        Some(prefix) if !trimmed.starts_with(prefix) => UNKNOWN.to_owned(),
        _ => trimmed.to_owned(),
    }
}

fn or_placeholder(value: String, placeholder: &str) -> String {
    if value.trim().is_empty() {
        placeholder.to_owned()
    } else {
        value
    }
}
