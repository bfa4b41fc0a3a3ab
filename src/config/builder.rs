//! Builder with validation for [`OrchestratorConfig`]

use std::path::PathBuf;
use std::time::Duration;

use super::types::OrchestratorConfig;

/// Fluent builder over the config defaults.
///
/// `build` rejects configurations a component would misbehave under instead
/// of letting them surface later as stuck queues or unbounded buffers.
#[derive(Debug, Default, Clone)]
pub struct OrchestratorConfigBuilder {
    config: OrchestratorConfig,
}

impl OrchestratorConfigBuilder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn global_concurrency(mut self, limit: usize) -> Self {
        self.config.global_concurrency = limit;
        self
    }

    #[must_use]
    pub fn max_concurrent_per_project(mut self, limit: usize) -> Self {
        self.config.max_concurrent_per_project = limit;
        self
    }

    #[must_use]
    pub fn max_concurrent_emulators(mut self, limit: usize) -> Self {
        self.config.max_concurrent_emulators = limit;
        self
    }

    #[must_use]
    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.config.poll_interval = interval;
        self
    }

    #[must_use]
    pub fn flush_interval(mut self, interval: Duration) -> Self {
        self.config.flush_interval = interval;
        self
    }

    #[must_use]
    pub fn max_events_per_run(mut self, cap: usize) -> Self {
        self.config.max_events_per_run = cap;
        self
    }

    #[must_use]
    pub fn max_screenshots_per_run(mut self, cap: usize) -> Self {
        self.config.max_screenshots_per_run = cap;
        self
    }

    #[must_use]
    pub fn dns_cache_ttl(mut self, ttl: Duration) -> Self {
        self.config.dns_cache_ttl = ttl;
        self
    }

    #[must_use]
    pub fn dns_lookup_timeout(mut self, timeout: Duration) -> Self {
        self.config.dns_lookup_timeout = timeout;
        self
    }

    #[must_use]
    pub fn blocked_request_log_dedup(mut self, window: Duration) -> Self {
        self.config.blocked_request_log_dedup = window;
        self
    }

    #[must_use]
    pub fn test_max_duration(mut self, deadline: Duration) -> Self {
        self.config.test_max_duration = deadline;
        self
    }

    #[must_use]
    pub fn android_op_timeout(mut self, timeout: Duration) -> Self {
        self.config.android_op_timeout = timeout;
        self
    }

    #[must_use]
    pub fn statement_timeout(mut self, timeout: Duration) -> Self {
        self.config.statement_timeout = timeout;
        self
    }

    #[must_use]
    pub fn emulator_boot_timeout(mut self, timeout: Duration) -> Self {
        self.config.emulator_boot_timeout = timeout;
        self
    }

    #[must_use]
    pub fn upload_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.config.upload_root = root.into();
        self
    }

    #[must_use]
    pub fn adb_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.adb_path = path.into();
        self
    }

    #[must_use]
    pub fn emulator_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.emulator_path = path.into();
        self
    }

    #[must_use]
    pub fn headless(mut self, headless: bool) -> Self {
        self.config.headless = headless;
        self
    }

    #[must_use]
    pub fn event_channel_capacity(mut self, capacity: usize) -> Self {
        self.config.event_channel_capacity = capacity;
        self
    }

    /// Validate and produce the config.
    pub fn build(self) -> Result<OrchestratorConfig, String> {
        let config = self.config;
        if config.global_concurrency == 0 {
            return Err("global_concurrency must be at least 1".to_string());
        }
        if config.max_concurrent_per_project == 0 {
            return Err("max_concurrent_per_project must be at least 1".to_string());
        }
        if config.max_events_per_run == 0 {
            return Err("max_events_per_run must be at least 1".to_string());
        }
        if config.max_screenshots_per_run > config.max_events_per_run {
            return Err(
                "max_screenshots_per_run cannot exceed max_events_per_run".to_string(),
            );
        }
        if config.event_channel_capacity == 0 {
            return Err("event_channel_capacity must be at least 1".to_string());
        }
        if config.flush_interval.is_zero() {
            return Err("flush_interval must be non-zero".to_string());
        }
        Ok(config)
    }
}
