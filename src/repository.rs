//! Persistence contract
//!
//! The control plane owns no storage engine; it calls this trait. All
//! operations are idempotent on `(run_id, target state)`: re-applying a
//! transition the row already has is a no-op, and a terminal row rejects
//! further non-matching transitions.
//!
//! [`MemoryRepository`] is the in-process implementation used by tests and
//! by embedders that bring their own durability elsewhere.

use std::collections::HashMap;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use crate::events::RunStatus;

/// Terminal write for a run: status, error, final event array, cleared
/// incremental logs, completion time.
#[derive(Debug, Clone)]
pub struct TerminalUpdate {
    pub status: RunStatus,
    pub error: Option<String>,
    /// JSON array of every buffered event, written exactly once.
    pub result_json: String,
    /// Whether the incremental `logs` column is nulled by this write.
    pub logs_cleared: bool,
    pub completed_at: DateTime<Utc>,
}

/// A run found in an active state, for startup reconciliation.
#[derive(Debug, Clone)]
pub struct StaleRun {
    pub run_id: String,
    pub test_case_id: String,
    pub status: RunStatus,
}

/// Test-case and project names for usage descriptions.
#[derive(Debug, Clone)]
pub struct TestCaseWithProject {
    pub test_case_id: String,
    pub test_case_name: String,
    pub project_id: String,
    pub project_name: String,
}

#[async_trait]
pub trait Repository: Send + Sync {
    /// Move a run to a non-terminal status. Returns false (and writes
    /// nothing) when the row is already cancelled or terminal.
    async fn update_run_status(&self, run_id: &str, status: RunStatus) -> Result<bool>;

    /// Write the terminal state. Returns false when the row is already
    /// `CANCELLED` and the update is not itself the same cancellation, or
    /// when the row is already terminal.
    async fn update_run_terminal(&self, run_id: &str, update: TerminalUpdate) -> Result<bool>;

    /// Append a newline-delimited JSON chunk to the run's `logs` column.
    async fn append_run_logs(&self, run_id: &str, chunk: &str) -> Result<()>;

    /// Every run whose persisted status is `QUEUED`, `PREPARING`, or
    /// `RUNNING`.
    async fn find_stale_active_runs(&self) -> Result<Vec<StaleRun>>;

    async fn update_test_case_status(&self, test_case_id: &str, status: RunStatus) -> Result<()>;

    async fn find_test_case_with_project_for_run(
        &self,
        run_id: &str,
    ) -> Result<Option<TestCaseWithProject>>;
}

/// One persisted run row.
#[derive(Debug, Clone)]
pub struct RunRecord {
    pub run_id: String,
    pub test_case_id: String,
    pub project_id: String,
    pub status: RunStatus,
    pub error: Option<String>,
    /// Append-only newline-delimited JSON events; nulled on terminal write.
    pub logs: Option<String>,
    /// Final JSON event array, set exactly once.
    pub result: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
struct TestCaseRecord {
    name: String,
    project_name: String,
    status: RunStatus,
}

/// In-memory repository.
#[derive(Default)]
pub struct MemoryRepository {
    runs: RwLock<HashMap<String, RunRecord>>,
    test_cases: RwLock<HashMap<String, TestCaseRecord>>,
}

impl MemoryRepository {
    #[must_use]
    pub fn new() -> std::sync::Arc<Self> {
        std::sync::Arc::new(Self::default())
    }

    /// Seed a run row, as the external API layer does before `Queue::add`.
    pub async fn insert_run(&self, run_id: &str, test_case_id: &str, project_id: &str) {
        self.runs.write().await.insert(
            run_id.to_string(),
            RunRecord {
                run_id: run_id.to_string(),
                test_case_id: test_case_id.to_string(),
                project_id: project_id.to_string(),
                status: RunStatus::Queued,
                error: None,
                logs: Some(String::new()),
                result: None,
                started_at: None,
                completed_at: None,
            },
        );
    }

    /// Seed a test case with the names used in usage descriptions.
    pub async fn insert_test_case(&self, test_case_id: &str, name: &str, project_name: &str) {
        self.test_cases.write().await.insert(
            test_case_id.to_string(),
            TestCaseRecord {
                name: name.to_string(),
                project_name: project_name.to_string(),
                status: RunStatus::Queued,
            },
        );
    }

    pub async fn run(&self, run_id: &str) -> Option<RunRecord> {
        self.runs.read().await.get(run_id).cloned()
    }

    pub async fn test_case_status(&self, test_case_id: &str) -> Option<RunStatus> {
        self.test_cases.read().await.get(test_case_id).map(|tc| tc.status)
    }
}

#[async_trait]
impl Repository for MemoryRepository {
    async fn update_run_status(&self, run_id: &str, status: RunStatus) -> Result<bool> {
        let mut runs = self.runs.write().await;
        let Some(record) = runs.get_mut(run_id) else {
            anyhow::bail!("run {run_id} does not exist");
        };
        if record.status.is_terminal() {
            return Ok(false);
        }
        if record.status == status {
            return Ok(true);
        }
        if status == RunStatus::Preparing && record.started_at.is_none() {
            record.started_at = Some(Utc::now());
        }
        record.status = status;
        Ok(true)
    }

    async fn update_run_terminal(&self, run_id: &str, update: TerminalUpdate) -> Result<bool> {
        let mut runs = self.runs.write().await;
        let Some(record) = runs.get_mut(run_id) else {
            anyhow::bail!("run {run_id} does not exist");
        };
        if record.status.is_terminal() {
            return Ok(false);
        }
        record.status = update.status;
        record.error = update.error;
        record.result = Some(update.result_json);
        if update.logs_cleared {
            record.logs = None;
        }
        record.completed_at = Some(update.completed_at);
        Ok(true)
    }

    async fn append_run_logs(&self, run_id: &str, chunk: &str) -> Result<()> {
        let mut runs = self.runs.write().await;
        let Some(record) = runs.get_mut(run_id) else {
            anyhow::bail!("run {run_id} does not exist");
        };
        match &mut record.logs {
            Some(logs) => logs.push_str(chunk),
            None => record.logs = Some(chunk.to_string()),
        }
        Ok(())
    }

    async fn find_stale_active_runs(&self) -> Result<Vec<StaleRun>> {
        let runs = self.runs.read().await;
        Ok(runs
            .values()
            .filter(|record| !record.status.is_terminal())
            .map(|record| StaleRun {
                run_id: record.run_id.clone(),
                test_case_id: record.test_case_id.clone(),
                status: record.status,
            })
            .collect())
    }

    async fn update_test_case_status(&self, test_case_id: &str, status: RunStatus) -> Result<()> {
        let mut test_cases = self.test_cases.write().await;
        if let Some(record) = test_cases.get_mut(test_case_id) {
            record.status = status;
        }
        Ok(())
    }

    async fn find_test_case_with_project_for_run(
        &self,
        run_id: &str,
    ) -> Result<Option<TestCaseWithProject>> {
        let runs = self.runs.read().await;
        let Some(record) = runs.get(run_id) else {
            return Ok(None);
        };
        let test_cases = self.test_cases.read().await;
        Ok(test_cases
            .get(&record.test_case_id)
            .map(|tc| TestCaseWithProject {
                test_case_id: record.test_case_id.clone(),
                test_case_name: tc.name.clone(),
                project_id: record.project_id.clone(),
                project_name: tc.project_name.clone(),
            }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn status_updates_are_conditional_on_non_terminal_rows() {
        let repo = MemoryRepository::new();
        repo.insert_run("r1", "tc1", "p1").await;

        assert!(repo.update_run_status("r1", RunStatus::Preparing).await.unwrap());
        let record = repo.run("r1").await.unwrap();
        assert_eq!(record.status, RunStatus::Preparing);
        assert!(record.started_at.is_some());

        assert!(
            repo.update_run_terminal(
                "r1",
                TerminalUpdate {
                    status: RunStatus::Cancelled,
                    error: Some("Test was cancelled by user".into()),
                    result_json: "[]".into(),
                    logs_cleared: true,
                    completed_at: Utc::now(),
                },
            )
            .await
            .unwrap()
        );

        // A late PREPARING write against the cancelled row is skipped.
        assert!(!repo.update_run_status("r1", RunStatus::Preparing).await.unwrap());
        // A second terminal write is skipped too.
        assert!(
            !repo
                .update_run_terminal(
                    "r1",
                    TerminalUpdate {
                        status: RunStatus::Fail,
                        error: None,
                        result_json: "[]".into(),
                        logs_cleared: true,
                        completed_at: Utc::now(),
                    },
                )
                .await
                .unwrap()
        );
        assert_eq!(repo.run("r1").await.unwrap().status, RunStatus::Cancelled);
    }

    #[tokio::test]
    async fn terminal_write_clears_logs_and_sets_result() {
        let repo = MemoryRepository::new();
        repo.insert_run("r1", "tc1", "p1").await;
        repo.append_run_logs("r1", "{\"a\":1}\n").await.unwrap();

        repo.update_run_terminal(
            "r1",
            TerminalUpdate {
                status: RunStatus::Pass,
                error: None,
                result_json: "[{\"a\":1}]".into(),
                logs_cleared: true,
                completed_at: Utc::now(),
            },
        )
        .await
        .unwrap();

        let record = repo.run("r1").await.unwrap();
        assert_eq!(record.logs, None);
        assert_eq!(record.result.as_deref(), Some("[{\"a\":1}]"));
        assert!(record.completed_at.is_some());
    }

    #[tokio::test]
    async fn stale_active_runs_exclude_terminal_rows() {
        let repo = MemoryRepository::new();
        repo.insert_run("r1", "tc1", "p1").await;
        repo.insert_run("r2", "tc2", "p1").await;
        repo.update_run_status("r1", RunStatus::Running).await.unwrap();
        repo.update_run_terminal(
            "r2",
            TerminalUpdate {
                status: RunStatus::Pass,
                error: None,
                result_json: "[]".into(),
                logs_cleared: true,
                completed_at: Utc::now(),
            },
        )
        .await
        .unwrap();

        let stale = repo.find_stale_active_runs().await.unwrap();
        assert_eq!(stale.len(), 1);
        assert_eq!(stale[0].run_id, "r1");
    }
}
