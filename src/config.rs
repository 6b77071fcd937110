//! Configuration types for the statistics agent.

use crate::error::{Result, StatsError};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StatsConfig {
    /// Directory for the checkpoint and scheduled job records
    /// (None = [`crate::stats_dirs::data_dir`]).
    pub state_dir: Option<PathBuf>,
    /// Collector endpoints.
    pub endpoints: EndpointConfig,
    /// Sync cadence, retry and job-queue settings.
    pub schedule: ScheduleConfig,
    /// HTTP upload settings.
    pub upload: UploadConfig,
    /// Static device identity and connectivity used by the standalone agent.
    pub device: DeviceConfig,
}

/// Collector endpoint URLs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EndpointConfig {
    /// Full device report endpoint.
    pub report_url: String,
    /// Lightweight version/flash-time update endpoint.
    pub update_url: String,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            report_url: "http://127.0.0.1:8080/submit/flash".to_owned(),
            update_url: "http://127.0.0.1:8080/submit/update".to_owned(),
        }
    }
}

/// Which connectivity conditions make a device eligible to sync.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectivityGate {
    /// Any working network connection.
    #[default]
    Any,
    /// Online, not Wi-Fi-only, and a cellular radio is present.
    Cellular,
}

/// Sync cadence and job-queue settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScheduleConfig {
    /// Interval between successful syncs, in seconds.
    pub sync_interval_secs: u64,
    /// Delay before retrying a failed upload, in seconds.
    pub retry_interval_secs: u64,
    /// Minimum delay between submitting a job and starting it, in milliseconds.
    pub min_latency_ms: u64,
    /// Upper bound of the cyclic job-id counter.
    pub max_job_id: u32,
    /// Delay the job queue waits before re-running a job that asked to be
    /// rescheduled, in seconds.
    pub platform_backoff_secs: u64,
    /// Fallback wake-up while a sync is deferred for connectivity, in seconds.
    pub offline_recheck_secs: u64,
    /// Connectivity eligibility rule.
    pub connectivity_gate: ConnectivityGate,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            sync_interval_secs: 24 * 3600,
            retry_interval_secs: 3 * 3600,
            min_latency_ms: 1000,
            max_job_id: 1000,
            platform_backoff_secs: 30,
            offline_recheck_secs: 15 * 60,
            connectivity_gate: ConnectivityGate::Any,
        }
    }
}

/// How report fields are encoded on the wire.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldEncoding {
    /// `application/x-www-form-urlencoded` request body.
    #[default]
    Form,
    /// URL query parameters with an empty body.
    Query,
}

/// HTTP upload settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UploadConfig {
    /// Connection establishment timeout, in seconds.
    pub connect_timeout_secs: u64,
    /// Whole-request timeout including the response body, in seconds.
    pub request_timeout_secs: u64,
    /// Field encoding.
    pub encoding: FieldEncoding,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            connect_timeout_secs: 60,
            request_timeout_secs: 60,
            encoding: FieldEncoding::Form,
        }
    }
}

/// Static device identity for hosts without a telephony stack.
///
/// Unset fields fall back to placeholders when the payload is built.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    /// Explicit device id. When unset, a SHA-256 hash of the machine id is used.
    pub unique_id: Option<String>,
    /// Product name (defaults to the OS family).
    pub product_name: Option<String>,
    /// OS build/version string.
    pub os_version: Option<String>,
    /// ISO country code.
    pub country_code: Option<String>,
    /// Carrier display name.
    pub carrier_name: Option<String>,
    /// Carrier numeric id (MCC+MNC).
    pub carrier_id: Option<String>,
    /// Only versions starting with this prefix are reported verbatim.
    pub version_prefix: Option<String>,
    /// Whether the device should be treated as online.
    pub online: bool,
    /// Whether the device lacks mobile data support.
    pub wifi_only: bool,
    /// Whether a cellular radio is present.
    pub cellular_radio: bool,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            unique_id: None,
            product_name: None,
            os_version: None,
            country_code: None,
            carrier_name: None,
            carrier_id: None,
            version_prefix: None,
            online: true,
            wifi_only: true,
            cellular_radio: false,
        }
    }
}

impl StatsConfig {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or is not valid TOML.
    pub fn from_file(path: &std::path::Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        toml::from_str(&content).map_err(|e| StatsError::Config(e.to_string()))
    }

    /// Save configuration to a TOML file, creating parent directories as needed.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written or the config cannot be serialized.
    pub fn save_to_file(&self, path: &std::path::Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content =
            toml::to_string_pretty(self).map_err(|e| StatsError::Config(e.to_string()))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Returns the default config file path (`config_dir()/config.toml`).
    pub fn default_config_path() -> PathBuf {
        crate::stats_dirs::config_dir().join("config.toml")
    }

    /// Resolved state directory.
    pub fn state_dir(&self) -> PathBuf {
        self.state_dir
            .clone()
            .unwrap_or_else(crate::stats_dirs::data_dir)
    }

    /// Check values that would otherwise stall or spin the scheduler.
    ///
    /// # Errors
    ///
    /// Returns [`StatsError::Config`] naming the first invalid field.
    pub fn validate(&self) -> Result<()> {
        for (name, url) in [
            ("endpoints.report_url", &self.endpoints.report_url),
            ("endpoints.update_url", &self.endpoints.update_url),
        ] {
            reqwest::Url::parse(url)
                .map_err(|e| StatsError::Config(format!("{name} is not a valid URL: {e}")))?;
        }
        if self.schedule.sync_interval_secs == 0 {
            return Err(StatsError::Config(
                "schedule.sync_interval_secs must be positive".to_owned(),
            ));
        }
        if self.schedule.retry_interval_secs == 0 {
            return Err(StatsError::Config(
                "schedule.retry_interval_secs must be positive".to_owned(),
            ));
        }
        if self.schedule.offline_recheck_secs == 0 {
            return Err(StatsError::Config(
                "schedule.offline_recheck_secs must be positive".to_owned(),
            ));
        }
        if self.schedule.max_job_id == 0 {
            return Err(StatsError::Config(
                "schedule.max_job_id must be at least 1".to_owned(),
            ));
        }
        if self.upload.connect_timeout_secs == 0 || self.upload.request_timeout_secs == 0 {
            return Err(StatsError::Config(
                "upload timeouts must be positive".to_owned(),
            ));
        }
        Ok(())
    }
}
