//! Eligibility under the cellular connectivity gate.

use crate::helpers::{build_agent, test_config};
use device_stats::JobKind;
use device_stats::config::{ConnectivityGate, StatsConfig};
use device_stats::scheduler::{Action, JobScheduler, now_epoch_millis};
use std::path::Path;

const OFFLINE_RECHECK_MS: i64 = 900_000;

fn cellular_config(state_dir: &Path, wifi_only: bool, cellular_radio: bool) -> StatsConfig {
    // Nothing is sent; deferred cases never reach the collector.
    let mut config = test_config("http://127.0.0.1:9", state_dir);
    config.schedule.connectivity_gate = ConnectivityGate::Cellular;
    config.device.online = true;
    config.device.wifi_only = wifi_only;
    config.device.cellular_radio = cellular_radio;
    config
}

#[tokio::test]
async fn wifi_only_device_is_deferred() {
    let dir = tempfile::tempdir().unwrap();
    let (agent, _connectivity) = build_agent(&cellular_config(dir.path(), true, true));
    let dispatcher = agent.dispatcher();
    let platform = agent.platform();
    let alarm = agent.alarm();

    let now = now_epoch_millis();
    assert_eq!(dispatcher.dispatch(now), Action::ScheduleAt(now));
    assert!(dispatcher.is_deferred());
    assert!(platform.pending().is_empty());
    assert_eq!(alarm.next_alarm(), Some(now + OFFLINE_RECHECK_MS));
}

#[tokio::test]
async fn device_without_cellular_radio_is_deferred() {
    let dir = tempfile::tempdir().unwrap();
    let (agent, _connectivity) = build_agent(&cellular_config(dir.path(), false, false));
    let dispatcher = agent.dispatcher();
    let platform = agent.platform();

    let now = now_epoch_millis();
    assert_eq!(dispatcher.dispatch(now), Action::ScheduleAt(now));
    assert!(dispatcher.is_deferred());
    assert!(platform.pending().is_empty());
    assert!(agent.store().read().never_synced());
}

#[tokio::test]
async fn online_device_with_cellular_radio_dispatches() {
    let dir = tempfile::tempdir().unwrap();
    let (agent, _connectivity) = build_agent(&cellular_config(dir.path(), false, true));
    let dispatcher = agent.dispatcher();
    let platform = agent.platform();

    assert_eq!(
        dispatcher.dispatch(now_epoch_millis()),
        Action::RunNow(JobKind::Report)
    );
    assert!(!dispatcher.is_deferred());
    assert_eq!(platform.queued_jobs().len(), 1);
    assert_eq!(platform.queued_jobs()[0].kind, JobKind::Report);
}

#[tokio::test]
async fn offline_device_is_deferred_even_with_cellular_radio() {
    let dir = tempfile::tempdir().unwrap();
    let (agent, connectivity) = build_agent(&cellular_config(dir.path(), false, true));
    connectivity.set_online(false);
    let dispatcher = agent.dispatcher();

    let now = now_epoch_millis();
    assert_eq!(dispatcher.dispatch(now), Action::ScheduleAt(now));
    assert!(dispatcher.is_deferred());
    assert!(agent.platform().pending().is_empty());
}
