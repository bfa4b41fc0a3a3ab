//! Queue admission and ordering

mod common;

use std::time::Duration;

use common::{Harness, browser_run, fast_config};
use uitest_orchestrator::agent::mock::MockAgent;
use uitest_orchestrator::events::RunStatus;

fn slow_agent(delay_ms: u64) -> std::sync::Arc<MockAgent> {
    let agent = MockAgent::new();
    agent.set_act_delay(Duration::from_millis(delay_ms));
    agent
}

#[tokio::test]
async fn fifo_order_with_per_project_limit() {
    let harness = Harness::new(fast_config());
    for _ in 0..3 {
        harness.agents.queue_agent(slow_agent(700));
    }

    // Two runs in project A, one in project B; per-project limit is 1.
    harness.submit(browser_run("r1", "project-a")).await;
    harness.submit(browser_run("r2", "project-a")).await;
    harness.submit(browser_run("r3", "project-b")).await;

    // R1 and R3 run concurrently; R2 is held back by its project.
    harness.wait_for_status("r1", RunStatus::Running).await;
    harness.wait_for_status("r3", RunStatus::Running).await;
    let r2 = harness.repository.run("r2").await.expect("r2 row");
    assert_eq!(r2.status, RunStatus::Queued, "r2 must wait for r1");

    // Once R1 terminates, R2 gets its slot.
    harness.wait_for_status("r1", RunStatus::Pass).await;
    harness.wait_for_status("r2", RunStatus::Pass).await;
    harness.wait_for_status("r3", RunStatus::Pass).await;

    assert_eq!(harness.orchestrator.queue.pending_count().await, 0);
    assert_eq!(harness.orchestrator.queue.running_count().await, 0);
}

#[tokio::test]
async fn global_concurrency_caps_active_runs() {
    let mut config = fast_config();
    config.global_concurrency = 1;
    config.max_concurrent_per_project = 4;
    let harness = Harness::new(config);
    for _ in 0..2 {
        harness.agents.queue_agent(slow_agent(700));
    }

    harness.submit(browser_run("r1", "project-a")).await;
    harness.submit(browser_run("r2", "project-a")).await;

    harness.wait_for_status("r1", RunStatus::Running).await;
    assert_eq!(harness.orchestrator.queue.running_count().await, 1);
    assert_eq!(
        harness.repository.run("r2").await.expect("r2 row").status,
        RunStatus::Queued
    );

    harness.wait_for_status("r2", RunStatus::Pass).await;
}

#[tokio::test]
async fn terminal_run_records_usage_with_project_description() {
    let harness = Harness::new(fast_config());
    harness.submit(browser_run("r1", "project-a")).await;
    harness.wait_for_status("r1", RunStatus::Pass).await;

    // Usage is recorded asynchronously, off the terminal path.
    let deadline = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if !harness.usage.records().is_empty() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await;
    assert!(deadline.is_ok(), "usage was never recorded");

    let records = harness.usage.records();
    assert_eq!(records[0].user_id, "user-1");
    assert_eq!(records[0].run_id, "r1");
    assert_eq!(records[0].description, "Acme Web - Login flow");
    assert!(records[0].action_count >= 1);
}

#[tokio::test]
async fn queue_status_reflects_lifecycle() {
    let harness = Harness::new(fast_config());
    harness.agents.queue_agent(slow_agent(300));
    harness.submit(browser_run("r1", "project-a")).await;

    harness.wait_for_status("r1", RunStatus::Running).await;
    assert_eq!(
        harness.orchestrator.queue.get_status("r1").await,
        Some(RunStatus::Running)
    );

    harness.wait_for_status("r1", RunStatus::Pass).await;
    // Terminal runs leave the in-memory maps; persistence is the source of
    // truth from here on.
    assert_eq!(harness.orchestrator.queue.get_status("r1").await, None);
}
