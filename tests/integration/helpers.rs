//! Shared helpers for integration tests.

use device_stats::checkpoint::{CheckpointPatch, CheckpointStore};
use device_stats::config::{DeviceConfig, EndpointConfig, ScheduleConfig, StatsConfig};
use device_stats::identity::{ConfiguredConnectivity, ConfiguredIdentity};
use device_stats::StatsAgent;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

/// App version reported by every test agent.
pub(crate) const APP_VERSION: &str = "MK71.2-test";

pub(crate) const DAY_MS: i64 = 24 * 3_600_000;

/// Config pointing at `server_uri`, storing state in `state_dir`.
///
/// Jobs start after 10ms; failed jobs are not re-run by the queue within a
/// test's lifetime.
pub(crate) fn test_config(server_uri: &str, state_dir: &Path) -> StatsConfig {
    StatsConfig {
        endpoints: EndpointConfig {
            report_url: format!("{server_uri}/submit/flash"),
            update_url: format!("{server_uri}/submit/update"),
        },
        schedule: ScheduleConfig {
            min_latency_ms: 10,
            platform_backoff_secs: 3600,
            ..Default::default()
        },
        device: DeviceConfig {
            unique_id: Some("device-1".to_owned()),
            product_name: Some("bacon".to_owned()),
            os_version: Some("MK71.2-bacon".to_owned()),
            country_code: Some("nz".to_owned()),
            carrier_name: Some("Spark".to_owned()),
            carrier_id: Some("53005".to_owned()),
            ..Default::default()
        },
        state_dir: Some(state_dir.to_path_buf()),
        ..Default::default()
    }
}

/// Build an agent for `config`. Returns the connectivity so tests can flip it.
pub(crate) fn build_agent(config: &StatsConfig) -> (StatsAgent, Arc<ConfiguredConnectivity>) {
    let identity =
        Arc::new(ConfiguredIdentity::from_config(&config.device).with_app_version(APP_VERSION));
    let connectivity = Arc::new(ConfiguredConnectivity::from_config(&config.device));
    let agent = StatsAgent::from_config(config, identity, connectivity.clone())
        .expect("build stats agent");
    (agent, connectivity)
}

/// Write a checkpoint into `state_dir` before an agent opens it.
pub(crate) fn seed_checkpoint(state_dir: &Path, patch: CheckpointPatch) {
    CheckpointStore::for_state_dir(state_dir)
        .write(patch)
        .expect("seed checkpoint");
}

/// Poll `condition` every 20ms for up to 10s.
pub(crate) async fn wait_for(mut condition: impl FnMut() -> bool) -> bool {
    for _ in 0..500 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    condition()
}
