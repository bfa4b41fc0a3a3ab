//! Usage accounting contract
//!
//! The queue reports one count per terminal run, best-effort. Failures are
//! logged by the caller and never change a run's outcome.

use anyhow::Result;
use async_trait::async_trait;
use parking_lot::Mutex;

#[async_trait]
pub trait UsageService: Send + Sync {
    async fn record_usage(
        &self,
        user_id: &str,
        action_count: u64,
        description: &str,
        run_id: &str,
    ) -> Result<()>;
}

/// Discards everything. Default when no billing backend is wired.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopUsageService;

#[async_trait]
impl UsageService for NoopUsageService {
    async fn record_usage(&self, _: &str, _: u64, _: &str, _: &str) -> Result<()> {
        Ok(())
    }
}

/// One recorded usage entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UsageRecord {
    pub user_id: String,
    pub action_count: u64,
    pub description: String,
    pub run_id: String,
}

/// Keeps records in memory, for tests.
#[derive(Debug, Default)]
pub struct RecordingUsageService {
    records: Mutex<Vec<UsageRecord>>,
}

impl RecordingUsageService {
    #[must_use]
    pub fn new() -> std::sync::Arc<Self> {
        std::sync::Arc::new(Self::default())
    }

    #[must_use]
    pub fn records(&self) -> Vec<UsageRecord> {
        self.records.lock().clone()
    }
}

#[async_trait]
impl UsageService for RecordingUsageService {
    async fn record_usage(
        &self,
        user_id: &str,
        action_count: u64,
        description: &str,
        run_id: &str,
    ) -> Result<()> {
        self.records.lock().push(UsageRecord {
            user_id: user_id.to_string(),
            action_count,
            description: description.to_string(),
            run_id: run_id.to_string(),
        });
        Ok(())
    }
}
