//! Run executor behavior: preconditions, verification, sandbox policy,
//! cancellation, and timeouts

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{APP_ID, SERIAL, script_healthy_device};
use parking_lot::Mutex;
use uitest_orchestrator::adb::MockCommandExecutor;
use uitest_orchestrator::agent::mock::{MockAgent, MockAgentFactory};
use uitest_orchestrator::browser::RequestDecision;
use uitest_orchestrator::browser::mock::MockBrowserDriver;
use uitest_orchestrator::device_pool::DeviceManager;
use uitest_orchestrator::events::{RunEvent, RunEventKind, RunStatus};
use uitest_orchestrator::executor::{
    ResolvedRunConfig, RunExecutor, RunHooks, Step, TargetConfig,
};
use uitest_orchestrator::runtime::CancelToken;
use uitest_orchestrator::url_safety::UrlSafetyFilter;
use uitest_orchestrator::{DeviceSelector, OrchestratorConfig};

struct ExecutorRig {
    executor: Arc<RunExecutor>,
    agents: Arc<MockAgentFactory>,
    browser: Arc<MockBrowserDriver>,
}

fn rig_with(config: OrchestratorConfig, adb: MockCommandExecutor) -> ExecutorRig {
    let config = Arc::new(config);
    let agents = MockAgentFactory::new();
    let browser = MockBrowserDriver::new();
    let device_manager = DeviceManager::new(
        &config,
        Arc::new(adb),
        agents.clone(),
    );
    let executor = Arc::new(RunExecutor::new(
        Arc::clone(&config),
        device_manager,
        Arc::new(Arc::clone(&browser)),
        agents.clone(),
        Arc::new(UrlSafetyFilter::from_config(&config)),
    ));
    ExecutorRig {
        executor,
        agents,
        browser,
    }
}

fn rig() -> ExecutorRig {
    rig_with(common::fast_config(), MockCommandExecutor::permissive())
}

fn web_run(steps: Vec<Step>) -> ResolvedRunConfig {
    let mut config = common::browser_run("r1", "project-a");
    if !steps.is_empty() {
        config.prompt = None;
        config.steps = steps;
    }
    config
}

fn capture_hooks() -> (RunHooks, Arc<Mutex<Vec<RunEvent>>>) {
    let events: Arc<Mutex<Vec<RunEvent>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&events);
    let hooks = RunHooks {
        on_event: Arc::new(move |event| sink.lock().push(event)),
        ..RunHooks::noop()
    };
    (hooks, events)
}

#[tokio::test]
async fn passing_run_counts_actions_and_closes_browser() {
    let rig = rig();
    let outcome = rig
        .executor
        .run(
            Arc::new(web_run(Vec::new())),
            CancelToken::new(),
            RunHooks::noop(),
        )
        .await;

    assert_eq!(outcome.status, RunStatus::Pass);
    assert_eq!(outcome.error, None);
    // One prompt line, one act, one tip.
    assert_eq!(outcome.action_count, 1);

    let pages = rig.browser.pages();
    assert_eq!(pages.len(), 1);
    assert!(pages[0].is_closed(), "cleanup must close the page");
    assert!(pages[0].actions().contains(&"goto https://example.com/login".to_string()));
}

#[tokio::test]
async fn missing_api_key_is_a_config_failure() {
    let rig = rig();
    let mut config = web_run(Vec::new());
    config.ai_api_key = None;

    let outcome = rig
        .executor
        .run(Arc::new(config), CancelToken::new(), RunHooks::noop())
        .await;
    assert_eq!(outcome.status, RunStatus::Fail);
    assert!(outcome.error.expect("error").contains("AI API key"));
}

#[tokio::test]
async fn missing_steps_is_a_config_failure() {
    let rig = rig();
    let mut config = web_run(Vec::new());
    config.prompt = None;

    let outcome = rig
        .executor
        .run(Arc::new(config), CancelToken::new(), RunHooks::noop())
        .await;
    assert_eq!(outcome.status, RunStatus::Fail);
    assert!(outcome.error.expect("error").contains("no steps"));
}

#[tokio::test]
async fn private_target_url_fails_before_setup() {
    let rig = rig();
    let mut config = web_run(Vec::new());
    config.url = Some("http://169.254.169.254/".to_string());

    let outcome = rig
        .executor
        .run(Arc::new(config), CancelToken::new(), RunHooks::noop())
        .await;
    assert_eq!(outcome.status, RunStatus::Fail);
    assert_eq!(rig.browser.launch_count(), 0, "no browser for invalid config");
}

#[tokio::test]
async fn quoted_verification_requires_exact_match() {
    let rig = rig();
    let agent = MockAgent::new();
    // The page shows the text with a trailing exclamation mark.
    agent.answer_query("Order #12345 confirmed", "Order #12345 confirmed!");
    rig.agents.queue_agent(agent);

    let outcome = rig
        .executor
        .run(
            Arc::new(web_run(vec![Step::ai(
                "s1",
                r#"Verify "Order #12345 confirmed""#,
            )])),
            CancelToken::new(),
            RunHooks::noop(),
        )
        .await;

    assert_eq!(outcome.status, RunStatus::Fail);
    let error = outcome.error.expect("mismatch error");
    assert!(error.contains("Order #12345 confirmed!"), "got: {error}");
}

#[tokio::test]
async fn quoted_verification_passes_on_exact_text() {
    let rig = rig();
    let agent = MockAgent::new();
    agent.answer_query("Order #12345 confirmed", "Order #12345 confirmed");
    rig.agents.queue_agent(agent);

    let outcome = rig
        .executor
        .run(
            Arc::new(web_run(vec![Step::ai(
                "s1",
                r#"Verify "Order #12345 confirmed""#,
            )])),
            CancelToken::new(),
            RunHooks::noop(),
        )
        .await;
    assert_eq!(outcome.status, RunStatus::Pass);
}

#[tokio::test]
async fn missing_quoted_text_fails_verification() {
    let rig = rig();
    // Default query answer is NOT_FOUND.
    rig.agents.queue_agent(MockAgent::new());

    let outcome = rig
        .executor
        .run(
            Arc::new(web_run(vec![Step::ai("s1", r#"Verify "Welcome back""#)])),
            CancelToken::new(),
            RunHooks::noop(),
        )
        .await;
    assert_eq!(outcome.status, RunStatus::Fail);
    assert!(outcome.error.expect("error").contains("not found"));
}

#[tokio::test]
async fn code_step_file_escape_fails_before_driver() {
    let rig = rig();
    let outcome = rig
        .executor
        .run(
            Arc::new(web_run(vec![Step::code(
                "s1",
                "page.setInputFiles('#upload', '/etc/passwd')",
            )])),
            CancelToken::new(),
            RunHooks::noop(),
        )
        .await;

    assert_eq!(outcome.status, RunStatus::Fail);
    assert!(
        outcome
            .error
            .expect("error")
            .contains("outside the allowed upload directory")
    );
    let pages = rig.browser.pages();
    assert!(
        pages[0]
            .actions()
            .iter()
            .all(|a| !a.starts_with("set_input_files")),
        "driver must not receive the blocked path"
    );
}

#[tokio::test]
async fn code_step_uploads_file_inside_the_envelope() {
    let upload_root = tempfile::tempdir().expect("tempdir");
    let case_dir = upload_root.path().join("tc-r1");
    std::fs::create_dir_all(&case_dir).expect("case dir");
    let file_path = case_dir.join("invoice.pdf");
    std::fs::write(&file_path, b"%PDF-1.4").expect("seed file");

    let mut config = common::fast_config();
    config.upload_root = upload_root.path().to_path_buf();
    let rig = rig_with(config, MockCommandExecutor::permissive());

    let mut run = web_run(vec![Step::code(
        "s1",
        "page.setInputFiles('#upload', files.invoice)",
    )]);
    run.resolved_files
        .insert("invoice".to_string(), file_path.clone());

    let outcome = rig
        .executor
        .run(Arc::new(run), CancelToken::new(), RunHooks::noop())
        .await;
    assert_eq!(outcome.status, RunStatus::Pass, "error: {:?}", outcome.error);

    let expected = format!("set_input_files #upload {}", file_path.display());
    assert!(rig.browser.pages()[0].actions().contains(&expected));
}

#[tokio::test]
async fn unsafe_code_token_is_a_config_failure() {
    let rig = rig();
    let outcome = rig
        .executor
        .run(
            Arc::new(web_run(vec![Step::code("s1", "process.exit(1)")])),
            CancelToken::new(),
            RunHooks::noop(),
        )
        .await;
    assert_eq!(outcome.status, RunStatus::Fail);
    assert!(outcome.error.expect("error").contains("Unsafe token"));
}

#[tokio::test]
async fn unknown_step_target_is_a_config_failure() {
    let rig = rig();
    let outcome = rig
        .executor
        .run(
            Arc::new(web_run(vec![
                Step::ai("s1", "Click the button").on_target("nope"),
            ])),
            CancelToken::new(),
            RunHooks::noop(),
        )
        .await;
    assert_eq!(outcome.status, RunStatus::Fail);
    assert!(outcome.error.expect("error").contains("Unknown target 'nope'"));
}

#[tokio::test]
async fn cancellation_yields_cancelled_outcome() {
    let rig = rig();
    let agent = MockAgent::new();
    agent.set_act_delay(Duration::from_millis(600));
    rig.agents.queue_agent(agent);

    let token = CancelToken::new();
    let cancel = token.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(150)).await;
        cancel.cancel();
    });

    let outcome = rig
        .executor
        .run(Arc::new(web_run(Vec::new())), token, RunHooks::noop())
        .await;

    assert_eq!(outcome.status, RunStatus::Cancelled);
    assert_eq!(
        outcome.error.as_deref(),
        Some("Test was cancelled by user")
    );
    assert!(rig.browser.pages()[0].is_closed(), "cleanup still runs");
}

#[tokio::test]
async fn global_max_duration_fails_with_timeout_message() {
    let mut config = common::fast_config();
    config.test_max_duration = Duration::from_millis(150);
    let rig = rig_with(config, MockCommandExecutor::permissive());

    let agent = MockAgent::new();
    agent.set_act_delay(Duration::from_secs(2));
    rig.agents.queue_agent(agent);

    let outcome = rig
        .executor
        .run(
            Arc::new(web_run(Vec::new())),
            CancelToken::new(),
            RunHooks::noop(),
        )
        .await;
    assert_eq!(outcome.status, RunStatus::Fail);
    assert!(outcome.error.expect("error").contains("maximum duration"));
}

#[tokio::test]
async fn android_code_step_is_a_config_failure() {
    let adb = script_healthy_device(MockCommandExecutor::permissive(), SERIAL);
    let rig = rig_with(common::fast_config(), adb);

    let mut config = web_run(vec![Step::code("s1", "page.click('#ok')")]);
    config.url = None;
    config.targets = vec![TargetConfig::android(
        "phone",
        DeviceSelector::ConnectedDevice(SERIAL.to_string()),
        APP_ID,
    )];

    let outcome = rig
        .executor
        .run(Arc::new(config), CancelToken::new(), RunHooks::noop())
        .await;
    assert_eq!(outcome.status, RunStatus::Fail);
    assert!(
        outcome
            .error
            .expect("error")
            .contains("not supported on Android")
    );
}

#[tokio::test]
async fn android_first_step_retries_once_after_splash() {
    let adb = script_healthy_device(MockCommandExecutor::permissive(), SERIAL);
    let rig = rig_with(common::fast_config(), adb);

    let agent = MockAgent::new();
    agent.fail_act_times("Tap the login button", "screen is still loading", 1);
    rig.agents.queue_agent(agent.clone());

    let mut config = web_run(vec![Step::ai("s1", "Tap the login button")]);
    config.url = None;
    config.targets = vec![TargetConfig::android(
        "phone",
        DeviceSelector::ConnectedDevice(SERIAL.to_string()),
        APP_ID,
    )];

    let outcome = rig
        .executor
        .run(Arc::new(config), CancelToken::new(), RunHooks::noop())
        .await;

    assert_eq!(outcome.status, RunStatus::Pass, "error: {:?}", outcome.error);
    assert_eq!(agent.calls_containing("act Tap the login button"), 2);
    assert_eq!(agent.calls_containing("wait_for"), 1);
}

#[tokio::test]
async fn blocked_runtime_request_logs_once_and_run_continues() {
    let rig = rig();
    let agent = MockAgent::new();
    agent.set_act_delay(Duration::from_millis(500));
    rig.agents.queue_agent(agent);

    let (hooks, events) = capture_hooks();
    let run_handle = {
        let executor = Arc::clone(&rig.executor);
        let config = Arc::new(web_run(Vec::new()));
        tokio::spawn(async move { executor.run(config, CancelToken::new(), hooks).await })
    };

    // Let setup finish, then drive the interceptor as the page would.
    tokio::time::sleep(Duration::from_millis(200)).await;
    let pages = rig.browser.pages();
    assert_eq!(pages.len(), 1, "page should exist while the run is live");

    let first = pages[0]
        .simulate_request("http://169.254.169.254/latest/meta-data")
        .await
        .expect("interceptor installed");
    assert!(matches!(first, RequestDecision::Block { .. }));
    let second = pages[0]
        .simulate_request("http://169.254.169.254/latest/meta-data")
        .await
        .expect("interceptor installed");
    assert!(matches!(second, RequestDecision::Block { .. }));

    let outcome = run_handle.await.expect("run task");
    assert_eq!(outcome.status, RunStatus::Pass, "the step continues");

    let blocked_logs = events
        .lock()
        .iter()
        .filter(|event| match &event.kind {
            RunEventKind::Log { message, .. } => {
                message.contains("Private network addresses are not allowed")
            }
            _ => false,
        })
        .count();
    assert_eq!(blocked_logs, 1, "duplicate blocked-request logs are deduplicated");
}
