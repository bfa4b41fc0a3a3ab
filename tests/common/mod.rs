//! Shared harness for integration tests
//!
//! Builds the full control plane against in-crate mocks: an in-memory
//! repository, a scripted command executor standing in for adb, a mock
//! browser driver, and scripted agents.

// Each test binary uses a different subset of the harness.
#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use uitest_orchestrator::adb::MockCommandExecutor;
use uitest_orchestrator::agent::mock::MockAgentFactory;
use uitest_orchestrator::browser::mock::MockBrowserDriver;
use uitest_orchestrator::events::RunStatus;
use uitest_orchestrator::executor::ResolvedRunConfig;
use uitest_orchestrator::repository::MemoryRepository;
use uitest_orchestrator::usage::RecordingUsageService;
use uitest_orchestrator::{Orchestrator, OrchestratorConfig, OrchestratorConfigBuilder};

pub const APP_ID: &str = "com.example.app";
pub const SERIAL: &str = "emulator-5554";

/// Fully wired orchestrator plus handles to every mock.
pub struct Harness {
    pub orchestrator: Orchestrator,
    pub repository: Arc<MemoryRepository>,
    pub agents: Arc<MockAgentFactory>,
    pub browser: Arc<MockBrowserDriver>,
    pub adb: MockCommandExecutor,
    pub usage: Arc<RecordingUsageService>,
}

/// Initialize test logging once; `RUST_LOG` controls verbosity.
pub fn init_tracing() {
    use std::sync::Once;
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
            )
            .with_test_writer()
            .try_init();
    });
}

impl Harness {
    pub fn new(config: OrchestratorConfig) -> Self {
        Self::with_adb(config, MockCommandExecutor::permissive())
    }

    pub fn with_adb(config: OrchestratorConfig, adb: MockCommandExecutor) -> Self {
        init_tracing();
        let repository = MemoryRepository::new();
        let agents = MockAgentFactory::new();
        let browser = MockBrowserDriver::new();
        let usage = RecordingUsageService::new();

        let orchestrator = Orchestrator::builder()
            .config(config)
            .repository(repository.clone())
            .agent_factory(agents.clone())
            .browser_driver(Arc::new(Arc::clone(&browser)))
            .command_executor(Arc::new(adb.clone()))
            .usage_service(usage.clone())
            .build()
            .expect("harness wiring");

        Self {
            orchestrator,
            repository,
            agents,
            browser,
            adb,
            usage,
        }
    }

    /// Seed repository rows and enqueue the run.
    pub async fn submit(&self, config: ResolvedRunConfig) {
        let run_id = config.run_id.clone();
        self.repository
            .insert_run(&run_id, &config.test_case_id, &config.project_id)
            .await;
        self.repository
            .insert_test_case(&config.test_case_id, "Login flow", "Acme Web")
            .await;
        self.orchestrator.queue.add(&run_id, config).await;
    }

    /// Poll the repository until the run reaches `expected` or the deadline
    /// passes.
    pub async fn wait_for_status(&self, run_id: &str, expected: RunStatus) {
        let deadline = Duration::from_secs(10);
        let poll = async {
            loop {
                if let Some(record) = self.repository.run(run_id).await {
                    if record.status == expected {
                        return;
                    }
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        };
        if tokio::time::timeout(deadline, poll).await.is_err() {
            let actual = self.repository.run(run_id).await.map(|r| r.status);
            panic!("run {run_id} never reached {expected}, last status {actual:?}");
        }
    }

    /// Poll until the run's persisted status is terminal.
    pub async fn wait_for_terminal(&self, run_id: &str) -> RunStatus {
        let deadline = Duration::from_secs(10);
        let poll = async {
            loop {
                if let Some(record) = self.repository.run(run_id).await {
                    if record.status.is_terminal() {
                        return record.status;
                    }
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        };
        match tokio::time::timeout(deadline, poll).await {
            Ok(status) => status,
            Err(_) => panic!("run {run_id} never reached a terminal status"),
        }
    }
}

/// Config tuned for fast tests.
pub fn fast_config() -> OrchestratorConfig {
    OrchestratorConfigBuilder::new()
        .global_concurrency(3)
        .max_concurrent_per_project(1)
        .poll_interval(Duration::from_millis(50))
        .flush_interval(Duration::from_millis(20))
        .test_max_duration(Duration::from_secs(8))
        .upload_root(std::env::temp_dir().join("uitest-harness-uploads"))
        .build()
        .expect("fast config")
}

/// A browser run driven by a prompt.
pub fn browser_run(run_id: &str, project_id: &str) -> ResolvedRunConfig {
    ResolvedRunConfig {
        run_id: run_id.to_string(),
        test_case_id: format!("tc-{run_id}"),
        project_id: project_id.to_string(),
        user_id: Some("user-1".to_string()),
        url: Some("https://example.com/login".to_string()),
        prompt: Some("Open the login form".to_string()),
        steps: Vec::new(),
        targets: Vec::new(),
        ai_api_key: Some("sk-test".to_string()),
        resolved_variables: Default::default(),
        resolved_files: Default::default(),
    }
}

/// An Android run against a connected device.
pub fn android_run(run_id: &str, project_id: &str, serial: &str) -> ResolvedRunConfig {
    use uitest_orchestrator::DeviceSelector;
    use uitest_orchestrator::executor::TargetConfig;

    let mut config = browser_run(run_id, project_id);
    config.url = None;
    config.targets = vec![TargetConfig::android(
        "phone",
        DeviceSelector::ConnectedDevice(serial.to_string()),
        APP_ID,
    )];
    config
}

/// Script the adb responses a healthy connected device needs.
pub fn script_healthy_device(adb: MockCommandExecutor, serial: &str) -> MockCommandExecutor {
    adb.with_success(
        "adb",
        &["devices"],
        &format!("List of devices attached\n{serial}\tdevice\n"),
    )
    .with_success("adb", &["-s", serial, "shell", "echo", "ok"], "ok\n")
    .with_success(
        "adb",
        &["-s", serial, "shell", "pm", "path", APP_ID],
        "package:/data/app/com.example.app/base.apk\n",
    )
    .with_success(
        "adb",
        &["-s", serial, "shell", "dumpsys", "activity", "activities"],
        &format!("  mResumedActivity: ActivityRecord{{abc u0 {APP_ID}/.MainActivity t42}}\n"),
    )
}
