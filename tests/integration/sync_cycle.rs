//! End-to-end sync cycles against a mock collector.

use crate::helpers::{APP_VERSION, DAY_MS, build_agent, seed_checkpoint, test_config, wait_for};
use device_stats::checkpoint::CheckpointPatch;
use device_stats::scheduler::{Trigger, now_epoch_millis};
use wiremock::matchers::{body_string_contains, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const RETRY_MS: i64 = 3 * 3_600_000;

#[tokio::test]
async fn first_run_reports_and_schedules_next_day() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/submit/flash"))
        .and(header("accept-charset", "utf-8"))
        .and(body_string_contains("device_hash=device-1"))
        .and(body_string_contains("device_name=bacon"))
        .and(body_string_contains("device_carrier_id=53005"))
        .respond_with(ResponseTemplate::new(200).set_body_string(r#"{"device_flash_time":"42"}"#))
        .expect(1)
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let (agent, _connectivity) = build_agent(&test_config(&server.uri(), dir.path()));
    let store = agent.store();
    let alarm = agent.alarm();
    let platform = agent.platform();
    let triggers = agent.triggers();
    let before = now_epoch_millis();
    let _task = agent.run();

    triggers.send(Trigger::Boot).unwrap();
    assert!(wait_for(|| alarm.next_alarm().is_some()).await);

    let checkpoint = store.read();
    let synced_at = checkpoint.last_synced_at.expect("synced");
    assert!(synced_at >= before);
    assert_eq!(checkpoint.flash_time, 42);
    assert_eq!(checkpoint.app_version, APP_VERSION);
    assert_eq!(checkpoint.unique_device_id, "device-1");
    assert_eq!(checkpoint.last_job_id, 1);
    assert_eq!(alarm.next_alarm(), Some(synced_at + DAY_MS));
    assert!(wait_for(|| platform.queued_jobs().is_empty()).await);
}

#[tokio::test]
async fn overdue_sync_with_flash_time_sends_update() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/submit/update"))
        .and(body_string_contains("device_flash_time=42"))
        .and(body_string_contains("device_version=MK71.2-bacon"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let last_sync = now_epoch_millis() - DAY_MS - 1_000;
    seed_checkpoint(
        dir.path(),
        CheckpointPatch::default()
            .synced_at(last_sync)
            .app_version(APP_VERSION)
            .flash_time(42)
            .unique_device_id("cached-id"),
    );

    let (agent, _connectivity) = build_agent(&test_config(&server.uri(), dir.path()));
    let store = agent.store();
    let triggers = agent.triggers();
    let _task = agent.run();

    triggers.send(Trigger::Alarm).unwrap();
    assert!(wait_for(|| store.read().last_synced_at != Some(last_sync)).await);

    let checkpoint = store.read();
    assert_eq!(checkpoint.flash_time, 42, "empty reply keeps the flash time");
    assert_eq!(checkpoint.unique_device_id, "cached-id");

    let requests = server.received_requests().await.unwrap();
    let body = String::from_utf8_lossy(&requests[0].body);
    assert!(body.contains("device_hash=cached-id"));
    assert!(!body.contains("device_carrier"));
}

#[tokio::test]
async fn server_error_keeps_checkpoint_and_retries_later() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/submit/flash"))
        .respond_with(ResponseTemplate::new(500))
        .expect(1)
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let (agent, _connectivity) = build_agent(&test_config(&server.uri(), dir.path()));
    let store = agent.store();
    let alarm = agent.alarm();
    let triggers = agent.triggers();
    let before = now_epoch_millis();
    let _task = agent.run();

    triggers.send(Trigger::Boot).unwrap();
    assert!(wait_for(|| alarm.next_alarm().is_some()).await);

    let retry_at = alarm.next_alarm().unwrap();
    assert!(retry_at >= before + RETRY_MS);
    assert!(retry_at <= now_epoch_millis() + RETRY_MS);

    let checkpoint = store.read();
    assert!(checkpoint.never_synced());
    assert_eq!(checkpoint.flash_time, 0);
    assert_eq!(checkpoint.app_version, "");
}

#[tokio::test]
async fn offline_defers_until_connectivity_returns() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/submit/flash"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config(&server.uri(), dir.path());
    config.device.online = false;
    let (agent, connectivity) = build_agent(&config);
    let store = agent.store();
    let dispatcher = agent.dispatcher();
    let triggers = agent.triggers();
    let _task = agent.run();

    triggers.send(Trigger::Boot).unwrap();
    assert!(wait_for(|| dispatcher.is_deferred()).await);
    assert_eq!(store.read(), device_stats::Checkpoint::default());

    // Restored connectivity re-runs the deferred sync.
    connectivity.set_online(true);
    triggers.send(Trigger::ConnectivityRestored).unwrap();
    assert!(wait_for(|| !store.read().never_synced()).await);
    assert!(!dispatcher.is_deferred());
}

#[tokio::test]
async fn app_version_change_forces_full_report() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/submit/flash"))
        .respond_with(ResponseTemplate::new(200).set_body_string("not json"))
        .expect(1)
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    seed_checkpoint(
        dir.path(),
        CheckpointPatch::default()
            .synced_at(now_epoch_millis() - 3_600_000)
            .app_version("MK70.0-old")
            .flash_time(42),
    );

    let (agent, _connectivity) = build_agent(&test_config(&server.uri(), dir.path()));
    let store = agent.store();
    let triggers = agent.triggers();
    let _task = agent.run();

    triggers.send(Trigger::Boot).unwrap();
    assert!(wait_for(|| store.read().app_version == APP_VERSION).await);
    assert_eq!(store.read().flash_time, 42, "malformed reply keeps the flash time");
}

#[tokio::test]
async fn recent_sync_only_arms_alarm() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let last_sync = now_epoch_millis() - 3_600_000;
    seed_checkpoint(
        dir.path(),
        CheckpointPatch::default()
            .synced_at(last_sync)
            .app_version(APP_VERSION)
            .flash_time(42),
    );

    let (agent, _connectivity) = build_agent(&test_config(&server.uri(), dir.path()));
    let alarm = agent.alarm();
    let triggers = agent.triggers();
    let _task = agent.run();

    triggers.send(Trigger::Boot).unwrap();
    assert!(wait_for(|| alarm.next_alarm().is_some()).await);
    assert_eq!(alarm.next_alarm(), Some(last_sync + DAY_MS));

    // Re-evaluating yields the same wake-up.
    triggers.send(Trigger::Alarm).unwrap();
    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    assert_eq!(alarm.next_alarm(), Some(last_sync + DAY_MS));
}
