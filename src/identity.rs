//! Device identity and connectivity collaborators.
//!
//! The scheduler only consumes these traits. [`ConfiguredIdentity`] and
//! [`ConfiguredConnectivity`] back them with static config values so the
//! agent runs on hosts without a telephony stack.

use crate::config::DeviceConfig;
use sha2::{Digest, Sha256};
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::debug;

/// Machine-id files probed when no explicit device id is configured.
const MACHINE_ID_PATHS: &[&str] = &["/etc/machine-id", "/var/lib/dbus/machine-id"];

/// Source of the identity fields sent in reports.
///
/// Accessors return an empty string when a value is unknown; the payload
/// builder substitutes placeholders.
pub trait DeviceIdentity: Send + Sync {
    fn unique_device_id(&self) -> String;
    fn product_name(&self) -> String;
    fn os_version(&self) -> String;
    fn country_code(&self) -> String;
    fn carrier_name(&self) -> String;
    fn carrier_id(&self) -> String;
    /// Version of the running software; a change forces a full report.
    fn current_app_version(&self) -> String;
}

/// Network state queried before a job is dispatched.
pub trait Connectivity: Send + Sync {
    fn is_online(&self) -> bool;
    /// Device has no mobile data support at all.
    fn is_wifi_only(&self) -> bool;
    fn has_cellular_radio(&self) -> bool;
}

/// Identity taken from [`DeviceConfig`], with a hashed machine id as fallback.
#[derive(Debug, Clone)]
pub struct ConfiguredIdentity {
    device_id: String,
    product_name: String,
    os_version: String,
    country_code: String,
    carrier_name: String,
    carrier_id: String,
    app_version: String,
}

impl ConfiguredIdentity {
    pub fn from_config(config: &DeviceConfig) -> Self {
        let device_id = config
            .unique_id
            .clone()
            .filter(|id| !id.trim().is_empty())
            .or_else(hashed_machine_id)
            .unwrap_or_default();

        Self {
            device_id,
            product_name: config
                .product_name
                .clone()
                .unwrap_or_else(|| std::env::consts::OS.to_owned()),
            os_version: config.os_version.clone().unwrap_or_default(),
            country_code: config.country_code.clone().unwrap_or_default(),
            carrier_name: config.carrier_name.clone().unwrap_or_default(),
            carrier_id: config.carrier_id.clone().unwrap_or_default(),
            app_version: env!("CARGO_PKG_VERSION").to_owned(),
        }
    }

    /// Override the reported app version.
    #[must_use]
    pub fn with_app_version(mut self, version: impl Into<String>) -> Self {
        self.app_version = version.into();
        self
    }
}

impl DeviceIdentity for ConfiguredIdentity {
    fn unique_device_id(&self) -> String {
        self.device_id.clone()
    }

    fn product_name(&self) -> String {
        self.product_name.clone()
    }

    fn os_version(&self) -> String {
        self.os_version.clone()
    }

    fn country_code(&self) -> String {
        self.country_code.clone()
    }

    fn carrier_name(&self) -> String {
        self.carrier_name.clone()
    }

    fn carrier_id(&self) -> String {
        self.carrier_id.clone()
    }

    fn current_app_version(&self) -> String {
        self.app_version.clone()
    }
}

/// Connectivity flags from config; `online` can be flipped at runtime.
#[derive(Debug)]
pub struct ConfiguredConnectivity {
    online: AtomicBool,
    wifi_only: bool,
    cellular_radio: bool,
}

impl ConfiguredConnectivity {
    pub fn from_config(config: &DeviceConfig) -> Self {
        Self {
            online: AtomicBool::new(config.online),
            wifi_only: config.wifi_only,
            cellular_radio: config.cellular_radio,
        }
    }

    /// Update the online flag. Returns the previous value.
    pub fn set_online(&self, online: bool) -> bool {
        self.online.swap(online, Ordering::SeqCst)
    }
}

impl Connectivity for ConfiguredConnectivity {
    fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }

    fn is_wifi_only(&self) -> bool {
        self.wifi_only
    }

    fn has_cellular_radio(&self) -> bool {
        self.cellular_radio
    }
}

/// Anonymized device id: SHA-256 of the first readable machine id.
fn hashed_machine_id() -> Option<String> {
    MACHINE_ID_PATHS.iter().find_map(|path| {
        let raw = std::fs::read_to_string(path).ok()?;
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return None;
        }
        debug!("deriving device id from {path}");
        Some(anonymize(trimmed))
    })
}

fn anonymize(raw_id: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(b"device-stats:");
    hasher.update(raw_id.as_bytes());
    format!("{:x}", hasher.finalize())
}
