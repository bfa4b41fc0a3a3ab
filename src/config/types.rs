//! Orchestrator configuration
//!
//! One knob per field. Durations are `std::time::Duration`; the builder
//! normalizes and validates everything before the config reaches a component.

use std::path::PathBuf;
use std::time::Duration;

/// Configuration shared by the queue, pools, executor, and URL filter.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Maximum number of runs in `PREPARING`/`RUNNING` across all projects.
    pub global_concurrency: usize,
    /// Maximum number of active runs per project.
    pub max_concurrent_per_project: usize,
    /// Global ceiling on booted emulator instances.
    pub max_concurrent_emulators: usize,

    /// Retry interval when queued jobs exist but none is startable.
    pub poll_interval: Duration,
    /// Minimum spacing between incremental log flushes per run.
    pub flush_interval: Duration,
    /// Event buffer cap per run; past it the executor proceeds but the queue
    /// stops appending.
    pub max_events_per_run: usize,
    /// Screenshot sub-cap within the event buffer.
    pub max_screenshots_per_run: usize,

    /// TTL for negative DNS cache entries. Positive answers are never cached.
    pub dns_cache_ttl: Duration,
    /// Deadline for a single DNS resolution; expiry counts as a failure.
    pub dns_lookup_timeout: Duration,
    /// Window in which repeated blocked-request logs for the same
    /// `host:reason` are suppressed.
    pub blocked_request_log_dedup: Duration,

    /// Whole-run deadline, independent of cancellation.
    pub test_max_duration: Duration,
    /// Deadline applied to each agent operation on Android targets.
    pub android_op_timeout: Duration,
    /// Deadline for a single `code` step statement.
    pub statement_timeout: Duration,
    /// How long a launched app may take to reach the foreground.
    pub app_foreground_deadline: Duration,
    /// How long an emulator may take to finish booting.
    pub emulator_boot_timeout: Duration,

    /// Root directory of uploaded test-case files; `code` steps may only
    /// reference files under `<upload_root>/<test_case_id>`.
    pub upload_root: PathBuf,
    /// Path to the `adb` binary.
    pub adb_path: PathBuf,
    /// Path to the `emulator` binary.
    pub emulator_path: PathBuf,
    /// Attempts beyond the first for transient ADB failures.
    pub adb_retries: u32,
    /// Deadline for a single ADB invocation.
    pub adb_timeout: Duration,

    /// Broadcast buffer size per event topic.
    pub event_channel_capacity: usize,
    /// Run browsers headless.
    pub headless: bool,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            global_concurrency: 3,
            max_concurrent_per_project: 1,
            max_concurrent_emulators: 2,
            poll_interval: Duration::from_secs(5),
            flush_interval: Duration::from_secs(1),
            max_events_per_run: 2000,
            max_screenshots_per_run: 200,
            dns_cache_ttl: Duration::from_secs(30),
            dns_lookup_timeout: Duration::from_secs(3),
            blocked_request_log_dedup: Duration::from_secs(10),
            test_max_duration: Duration::from_secs(30 * 60),
            android_op_timeout: Duration::from_secs(120),
            statement_timeout: Duration::from_secs(30),
            app_foreground_deadline: Duration::from_secs(30),
            emulator_boot_timeout: Duration::from_secs(180),
            upload_root: std::env::temp_dir().join("uitest-uploads"),
            adb_path: default_android_tool("platform-tools", "adb"),
            emulator_path: default_android_tool("emulator", "emulator"),
            adb_retries: 2,
            adb_timeout: Duration::from_secs(30),
            event_channel_capacity: 256,
            headless: true,
        }
    }
}

/// Resolve an Android SDK tool: `$ANDROID_HOME/<dir>/<name>` when the SDK
/// root is set, otherwise the bare name for `$PATH` lookup.
fn default_android_tool(dir: &str, name: &str) -> PathBuf {
    for var in ["ANDROID_HOME", "ANDROID_SDK_ROOT"] {
        if let Ok(root) = std::env::var(var) {
            let candidate = PathBuf::from(root).join(dir).join(name);
            if candidate.exists() {
                return candidate;
            }
        }
    }
    PathBuf::from(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = OrchestratorConfig::default();
        assert!(config.global_concurrency >= 1);
        assert!(config.max_concurrent_per_project >= 1);
        assert!(config.max_screenshots_per_run <= config.max_events_per_run);
        assert!(config.dns_lookup_timeout < config.test_max_duration);
    }
}
