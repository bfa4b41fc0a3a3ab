//! Cancellation at every stage: queued, running, orphaned

mod common;

use std::time::Duration;

use common::{Harness, SERIAL, android_run, browser_run, fast_config, script_healthy_device};
use uitest_orchestrator::Repository;
use uitest_orchestrator::adb::MockCommandExecutor;
use uitest_orchestrator::agent::mock::MockAgent;
use uitest_orchestrator::events::RunStatus;

fn slow_agent(delay_ms: u64) -> std::sync::Arc<MockAgent> {
    let agent = MockAgent::new();
    agent.set_act_delay(Duration::from_millis(delay_ms));
    agent
}

#[tokio::test]
async fn cancelling_a_running_run_persists_cancelled_and_cleans_up() {
    let harness = Harness::new(fast_config());
    harness.agents.queue_agent(slow_agent(2_000));
    harness.submit(browser_run("r1", "project-a")).await;

    harness.wait_for_status("r1", RunStatus::Running).await;
    harness.orchestrator.queue.cancel("r1", None).await;
    harness.wait_for_status("r1", RunStatus::Cancelled).await;

    let record = harness.repository.run("r1").await.expect("r1 row");
    assert_eq!(record.error.as_deref(), Some("Test was cancelled by user"));
    assert_eq!(record.logs, None, "terminal write clears incremental logs");
    assert!(record.result.is_some(), "buffer serialized into result");
    assert!(record.completed_at.is_some());

    assert_eq!(harness.orchestrator.queue.running_count().await, 0);
    let pages = harness.browser.pages();
    assert!(pages[0].is_closed(), "cleanup drained during cancel");
}

#[tokio::test]
async fn cancelling_a_queued_run_splices_it_out() {
    let harness = Harness::new(fast_config());
    harness.agents.queue_agent(slow_agent(500));
    harness.submit(browser_run("r1", "project-a")).await;
    harness.submit(browser_run("r2", "project-a")).await;

    harness.wait_for_status("r1", RunStatus::Running).await;
    assert_eq!(harness.orchestrator.queue.pending_count().await, 1);

    harness.orchestrator.queue.cancel("r2", None).await;
    harness.wait_for_status("r2", RunStatus::Cancelled).await;
    assert_eq!(harness.orchestrator.queue.pending_count().await, 0);

    // The running run is untouched.
    harness.wait_for_status("r1", RunStatus::Pass).await;
}

#[tokio::test]
async fn cancel_is_idempotent() {
    let harness = Harness::new(fast_config());
    harness.agents.queue_agent(slow_agent(800));
    harness.submit(browser_run("r1", "project-a")).await;
    harness.wait_for_status("r1", RunStatus::Running).await;

    harness.orchestrator.queue.cancel("r1", None).await;
    harness.wait_for_status("r1", RunStatus::Cancelled).await;
    let first = harness.repository.run("r1").await.expect("row");

    harness.orchestrator.queue.cancel("r1", None).await;
    let second = harness.repository.run("r1").await.expect("row");

    assert_eq!(first.status, second.status);
    assert_eq!(first.error, second.error);
    assert_eq!(first.completed_at, second.completed_at);
}

#[tokio::test]
async fn cancelling_a_terminal_run_is_a_noop() {
    let harness = Harness::new(fast_config());
    harness.submit(browser_run("r1", "project-a")).await;
    harness.wait_for_status("r1", RunStatus::Pass).await;

    harness.orchestrator.queue.cancel("r1", None).await;
    assert_eq!(
        harness.repository.run("r1").await.expect("row").status,
        RunStatus::Pass
    );
}

#[tokio::test]
async fn orphaned_active_row_is_force_cancelled() {
    let harness = Harness::new(fast_config());
    harness.repository.insert_run("ghost", "tc-ghost", "project-a").await;
    harness
        .repository
        .update_run_status("ghost", RunStatus::Preparing)
        .await
        .expect("seed status");

    // Never enqueued; the queue knows nothing about it.
    harness.orchestrator.queue.cancel("ghost", None).await;

    let record = harness.repository.run("ghost").await.expect("row");
    assert_eq!(record.status, RunStatus::Cancelled);
    assert_eq!(
        record.error.as_deref(),
        Some("Force cancelled (orphaned run)")
    );
}

#[tokio::test]
async fn cancelled_android_run_leaves_no_acquired_lease() {
    let adb = script_healthy_device(MockCommandExecutor::permissive(), SERIAL);
    let harness = Harness::with_adb(fast_config(), adb);
    harness.agents.queue_agent(slow_agent(2_000));
    harness.submit(android_run("r1", "project-a", SERIAL)).await;

    harness.wait_for_status("r1", RunStatus::Running).await;
    harness.orchestrator.queue.cancel("r1", None).await;
    harness.wait_for_status("r1", RunStatus::Cancelled).await;

    let state = harness
        .orchestrator
        .device_manager
        .physical_lease_state(SERIAL)
        .await;
    assert_ne!(
        state,
        Some(uitest_orchestrator::LeaseState::Acquired),
        "no device stays acquired after cancellation"
    );
}
