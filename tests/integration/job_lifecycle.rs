//! Job queue, shim and restart behaviour through the running agent.

use crate::helpers::{build_agent, test_config, wait_for};
use device_stats::JobKind;
use device_stats::scheduler::{Action, JobHandle, JobScheduler, Trigger, now_epoch_millis};
use std::time::Duration;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const RETRY_MS: i64 = 3 * 3_600_000;

#[tokio::test]
async fn triggers_during_a_running_job_do_not_duplicate_it() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/submit/flash"))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_millis(500)))
        .expect(1)
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let (agent, _connectivity) = build_agent(&test_config(&server.uri(), dir.path()));
    let store = agent.store();
    let shim = agent.shim();
    let triggers = agent.triggers();
    let _task = agent.run();

    triggers.send(Trigger::Boot).unwrap();
    assert!(wait_for(|| shim.is_running(JobHandle(1))).await);
    triggers.send(Trigger::Alarm).unwrap();
    triggers.send(Trigger::Alarm).unwrap();

    assert!(wait_for(|| !store.read().never_synced()).await);
    assert_eq!(store.read().last_job_id, 1);
}

#[tokio::test]
async fn cancelled_job_never_writes_checkpoint() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(30)))
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let (agent, _connectivity) = build_agent(&test_config(&server.uri(), dir.path()));
    let store = agent.store();
    let shim = agent.shim();
    let platform = agent.platform();
    let alarm = agent.alarm();
    let triggers = agent.triggers();
    let _task = agent.run();

    triggers.send(Trigger::Boot).unwrap();
    assert!(wait_for(|| shim.is_running(JobHandle(1))).await);
    assert_eq!(alarm.next_alarm(), None);

    let before = now_epoch_millis();
    assert!(platform.cancel(JobHandle(1)).unwrap());
    assert!(wait_for(|| !shim.is_running(JobHandle(1))).await);
    // Nothing is queued any more, so the agent must still have a wake-up.
    assert!(wait_for(|| alarm.next_alarm().is_some() || !platform.pending().is_empty()).await);

    assert!(store.read().never_synced());
    assert!(platform.pending().is_empty());
    let retry_at = alarm.next_alarm().unwrap();
    assert!(retry_at >= before + RETRY_MS);
}

#[tokio::test]
async fn reclaimed_job_is_rerun_and_syncs() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(30)))
        .up_to_n_times(1)
        .with_priority(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/submit/flash"))
        .respond_with(ResponseTemplate::new(200).set_body_string(r#"{"device_flash_time":5}"#))
        .expect(1)
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config(&server.uri(), dir.path());
    config.schedule.platform_backoff_secs = 1;
    let (agent, _connectivity) = build_agent(&config);
    let store = agent.store();
    let shim = agent.shim();
    let platform = agent.platform();
    let triggers = agent.triggers();
    let _task = agent.run();

    triggers.send(Trigger::Boot).unwrap();
    assert!(wait_for(|| shim.is_running(JobHandle(1))).await);

    assert!(platform.reclaim(JobHandle(1)));
    assert!(wait_for(|| !store.read().never_synced()).await);

    let checkpoint = store.read();
    assert_eq!(checkpoint.flash_time, 5);
    assert_eq!(checkpoint.last_job_id, 1, "the reclaimed job is re-run, not replaced");
    assert!(wait_for(|| platform.pending().is_empty()).await);
}

#[tokio::test]
async fn trigger_before_completion_is_applied_coalesces() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/submit/flash"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    // Drive the parts by hand without the loop, so the completion stays
    // unapplied while a second trigger is evaluated.
    let dir = tempfile::tempdir().unwrap();
    let (agent, _connectivity) = build_agent(&test_config(&server.uri(), dir.path()));
    let store = agent.store();
    let shim = agent.shim();
    let platform = agent.platform();
    let dispatcher = agent.dispatcher();

    assert_eq!(
        dispatcher.on_boot(now_epoch_millis()),
        Action::RunNow(JobKind::Report)
    );
    let job = platform.queued_jobs().remove(0);
    assert!(shim.start(JobHandle(1), job));
    assert!(wait_for(|| !shim.is_running(JobHandle(1))).await);
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(
        dispatcher.on_alarm(now_epoch_millis()),
        Action::RunNow(JobKind::Report)
    );
    assert_eq!(platform.pending(), vec![JobHandle(1)]);
    assert_eq!(store.read().last_job_id, 1);
    drop(agent);
}

#[tokio::test]
async fn failing_job_is_rerun_by_queue_then_dropped() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(503))
        .expect(3)
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config(&server.uri(), dir.path());
    config.schedule.platform_backoff_secs = 1;
    let (agent, _connectivity) = build_agent(&config);
    let store = agent.store();
    let platform = agent.platform();
    let triggers = agent.triggers();
    let _task = agent.run();

    triggers.send(Trigger::Boot).unwrap();
    assert!(wait_for(|| !platform.pending().is_empty()).await);
    assert!(wait_for(|| platform.pending().is_empty()).await);
    assert!(store.read().never_synced());
}

#[tokio::test]
async fn queued_job_survives_restart() {
    let dir = tempfile::tempdir().unwrap();

    {
        let slow = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(30)))
            .mount(&slow)
            .await;

        let (agent, _connectivity) = build_agent(&test_config(&slow.uri(), dir.path()));
        let shim = agent.shim();
        let triggers = agent.triggers();
        let task = agent.run();

        triggers.send(Trigger::Boot).unwrap();
        assert!(wait_for(|| shim.is_running(JobHandle(1))).await);
        triggers.send(Trigger::Shutdown).unwrap();
        task.await.unwrap();
    }

    let queue = std::fs::read_to_string(dir.path().join("jobs.json")).unwrap();
    assert!(queue.contains("\"job_id\": 1"));

    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/submit/flash"))
        .respond_with(ResponseTemplate::new(200).set_body_string(r#"{"device_flash_time":77}"#))
        .expect(1)
        .mount(&server)
        .await;

    let (agent, _connectivity) = build_agent(&test_config(&server.uri(), dir.path()));
    let store = agent.store();
    let platform = agent.platform();
    let triggers = agent.triggers();
    let _task = agent.run();

    triggers.send(Trigger::Boot).unwrap();
    assert!(wait_for(|| !store.read().never_synced()).await);

    let checkpoint = store.read();
    assert_eq!(checkpoint.flash_time, 77);
    assert_eq!(checkpoint.last_job_id, 1, "restored job is reused, not duplicated");
    assert!(wait_for(|| platform.pending().is_empty()).await);
}
