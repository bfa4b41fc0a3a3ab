//! Restart recovery: no run survives a process boundary in an active state

mod common;

use common::{Harness, fast_config};
use uitest_orchestrator::Repository;
use uitest_orchestrator::events::RunStatus;

#[tokio::test]
async fn startup_rewrites_active_runs_to_fail() {
    let harness = Harness::new(fast_config());

    // Rows left behind by a previous process.
    harness.repository.insert_run("r1", "tc-1", "project-a").await;
    harness.repository.insert_test_case("tc-1", "Checkout", "Acme Web").await;
    harness
        .repository
        .update_run_status("r1", RunStatus::Preparing)
        .await
        .expect("seed");
    harness
        .repository
        .update_run_status("r1", RunStatus::Running)
        .await
        .expect("seed");

    harness.repository.insert_run("r2", "tc-2", "project-a").await;
    harness.repository.insert_test_case("tc-2", "Signup", "Acme Web").await;

    harness.orchestrator.startup().await.expect("startup");

    for run_id in ["r1", "r2"] {
        let record = harness.repository.run(run_id).await.expect("row");
        assert_eq!(record.status, RunStatus::Fail);
        assert_eq!(
            record.error.as_deref(),
            Some("Server restarted while test was in progress")
        );
        assert!(record.completed_at.is_some());
    }
    assert_eq!(
        harness.repository.test_case_status("tc-1").await,
        Some(RunStatus::Fail)
    );
    assert_eq!(
        harness.repository.test_case_status("tc-2").await,
        Some(RunStatus::Fail)
    );

    // No live jobs exist after reconciliation.
    assert_eq!(harness.orchestrator.queue.running_count().await, 0);
    assert_eq!(harness.orchestrator.queue.pending_count().await, 0);

    let stale = harness
        .repository
        .find_stale_active_runs()
        .await
        .expect("query");
    assert!(stale.is_empty(), "no run remains in a non-terminal state");
}

#[tokio::test]
async fn startup_leaves_terminal_rows_alone() {
    let harness = Harness::new(fast_config());
    harness.repository.insert_run("r1", "tc-1", "project-a").await;
    harness
        .repository
        .update_run_terminal(
            "r1",
            uitest_orchestrator::TerminalUpdate {
                status: RunStatus::Pass,
                error: None,
                result_json: "[]".into(),
                logs_cleared: true,
                completed_at: chrono::Utc::now(),
            },
        )
        .await
        .expect("seed terminal");

    harness.orchestrator.startup().await.expect("startup");

    let record = harness.repository.run("r1").await.expect("row");
    assert_eq!(record.status, RunStatus::Pass);
    assert_eq!(record.error, None);
}
