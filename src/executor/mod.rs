//! Run executor
//!
//! Drives one run end to end: validates the resolved configuration, sets up
//! every target (browser contexts, Android leases), executes the steps
//! sequentially, and maps cancellation, timeouts, and errors onto the
//! terminal statuses. Cleanup always runs, exactly once, even when the
//! queue drains it concurrently during cancellation.

mod android;
mod browser_target;
pub mod sandbox;
mod steps;
pub mod types;

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tracing::{info, warn};

use crate::agent::{AgentDriver, AgentFactory};
use crate::browser::{BrowserDriver, BrowserHandle, PageHandle};
use crate::config::OrchestratorConfig;
use crate::device_pool::{AcquiredDevice, DeviceManager, ReleaseOpts};
use crate::error::RunError;
use crate::events::{RunEvent, RunStatus};
use crate::runtime::CancelToken;
use crate::url_safety::{UrlSafetyFilter, validate_target_url};

use android::AndroidTargetSpec;
use browser_target::BrowserTargetSpec;
use steps::StepContext;
use types::{CleanupHandle, EventSink, ScreenshotSource};

pub use types::{
    DEFAULT_TARGET_ID, ResolvedRunConfig, RunHooks, RunOutcome, Step, StepKind, TargetConfig,
    TargetKind,
};

/// A target after setup, ready for steps.
pub(crate) struct PreparedTarget {
    pub id: String,
    pub agent: Arc<dyn AgentDriver>,
    pub shot: ScreenshotSource,
    pub kind: PreparedKind,
}

pub(crate) enum PreparedKind {
    Browser {
        page: Arc<dyn PageHandle>,
        /// URL observed at the end of the previous step; a difference means
        /// a navigation is still settling.
        last_url: tokio::sync::Mutex<String>,
        credentials: (Option<String>, Option<String>),
    },
    Android {
        #[allow(dead_code)]
        device: AcquiredDevice,
        #[allow(dead_code)]
        app_id: String,
    },
}

impl PreparedTarget {
    pub(crate) fn is_android(&self) -> bool {
        matches!(self.kind, PreparedKind::Android { .. })
    }
}

enum CleanupItem {
    Page(Arc<dyn PageHandle>),
    Browser(Arc<dyn BrowserHandle>),
    Device {
        manager: Arc<DeviceManager>,
        device: AcquiredDevice,
        opts: ReleaseOpts,
    },
}

/// Close pages first, then the shared browser, then release device leases.
async fn run_cleanup(items: Vec<CleanupItem>) {
    let mut browsers = Vec::new();
    let mut devices = Vec::new();
    for item in items {
        match item {
            CleanupItem::Page(page) => {
                if let Err(e) = page.close().await {
                    warn!("page close failed during cleanup: {e}");
                }
            }
            CleanupItem::Browser(browser) => browsers.push(browser),
            CleanupItem::Device { .. } => devices.push(item),
        }
    }
    for browser in browsers {
        if let Err(e) = browser.close().await {
            warn!("browser close failed during cleanup: {e}");
        }
    }
    for item in devices {
        if let CleanupItem::Device {
            manager,
            device,
            opts,
        } = item
        {
            manager.release(&device, &opts).await;
        }
    }
}

/// Executes runs. One instance serves the whole process.
pub struct RunExecutor {
    orch: Arc<OrchestratorConfig>,
    device_manager: Arc<DeviceManager>,
    browser_driver: Arc<dyn BrowserDriver>,
    agents: Arc<dyn AgentFactory>,
    url_filter: Arc<UrlSafetyFilter>,
}

impl RunExecutor {
    #[must_use]
    pub fn new(
        orch: Arc<OrchestratorConfig>,
        device_manager: Arc<DeviceManager>,
        browser_driver: Arc<dyn BrowserDriver>,
        agents: Arc<dyn AgentFactory>,
        url_filter: Arc<UrlSafetyFilter>,
    ) -> Self {
        Self {
            orch,
            device_manager,
            browser_driver,
            agents,
            url_filter,
        }
    }

    /// Drive a run to a terminal outcome. Never panics, never retries.
    pub async fn run(
        &self,
        run_cfg: Arc<ResolvedRunConfig>,
        token: CancelToken,
        hooks: RunHooks,
    ) -> RunOutcome {
        let action_count = Arc::new(AtomicU64::new(0));

        let api_key = match preconditions(&run_cfg) {
            Ok(key) => key,
            Err(e) => return outcome_from_error(&e, &action_count),
        };

        let (targets, cleanup_items) = match self
            .setup_targets(&run_cfg, &api_key, &token, &hooks)
            .await
        {
            Ok(setup) => setup,
            Err(e) => return outcome_from_error(&e, &action_count),
        };

        wire_tip_callbacks(&targets, &hooks.on_event, &action_count);

        let cleanup = CleanupHandle::new(run_cleanup(cleanup_items));
        (hooks.on_cleanup)(cleanup.clone());
        (hooks.on_running)().await;

        let steps = run_cfg.effective_steps();
        let ctx = StepContext {
            run: &run_cfg,
            orch: &self.orch,
            targets: &targets,
            emit: &hooks.on_event,
            token: &token,
        };

        let result = tokio::select! {
            biased;
            _ = token.cancelled() => Err(RunError::Cancelled),
            _ = tokio::time::sleep(self.orch.test_max_duration) => Err(RunError::Timeout(format!(
                "Test exceeded the maximum duration of {}s",
                self.orch.test_max_duration.as_secs()
            ))),
            result = async {
                for (index, step) in steps.iter().enumerate() {
                    steps::execute_step(&ctx, index, step).await?;
                }
                Ok(())
            } => result,
        };

        let outcome = match result {
            Ok(()) => {
                capture_all(&targets, &hooks.on_event, "final").await;
                RunOutcome {
                    status: RunStatus::Pass,
                    error: None,
                    action_count: action_count.load(Ordering::Relaxed),
                }
            }
            Err(RunError::Cancelled) => outcome_from_error(&RunError::Cancelled, &action_count),
            Err(e @ RunError::Timeout(_)) => outcome_from_error(&e, &action_count),
            Err(e) => {
                capture_all(&targets, &hooks.on_event, "error state").await;
                outcome_from_error(&e, &action_count)
            }
        };

        cleanup.run().await;
        info!(
            run_id = %run_cfg.run_id,
            status = %outcome.status,
            actions = outcome.action_count,
            "run finished"
        );
        outcome
    }

    /// Set up every target in declaration order. On any failure, everything
    /// prepared so far is rolled back before the error surfaces.
    async fn setup_targets(
        &self,
        run_cfg: &Arc<ResolvedRunConfig>,
        api_key: &str,
        token: &CancelToken,
        hooks: &RunHooks,
    ) -> Result<(Vec<PreparedTarget>, Vec<CleanupItem>), RunError> {
        let mut items: Vec<CleanupItem> = Vec::new();
        let mut prepared: Vec<PreparedTarget> = Vec::new();

        let result = self
            .try_setup(run_cfg, api_key, token, hooks, &mut items, &mut prepared)
            .await;

        match result {
            Ok(()) => Ok((prepared, items)),
            Err(e) => {
                run_cleanup(items).await;
                Err(e)
            }
        }
    }

    async fn try_setup(
        &self,
        run_cfg: &Arc<ResolvedRunConfig>,
        api_key: &str,
        token: &CancelToken,
        hooks: &RunHooks,
        items: &mut Vec<CleanupItem>,
        prepared: &mut Vec<PreparedTarget>,
    ) -> Result<(), RunError> {
        let targets = run_cfg.effective_targets();

        if targets.iter().any(TargetConfig::is_android) {
            (hooks.on_preparing)().await;
        }

        let mut browser: Option<Arc<dyn BrowserHandle>> = None;

        for target in &targets {
            token.check()?;
            match &target.kind {
                TargetKind::Android {
                    device,
                    app_id,
                    clear_app_state,
                    allow_all_permissions,
                    name: _,
                } => {
                    let acquired = android::prepare_android_target(
                        &self.device_manager,
                        &self.agents,
                        &self.orch,
                        &run_cfg.project_id,
                        &run_cfg.run_id,
                        api_key,
                        AndroidTargetSpec {
                            target_id: &target.id,
                            device,
                            app_id,
                            clear_app_state: *clear_app_state,
                            allow_all_permissions: *allow_all_permissions,
                        },
                        token,
                        &hooks.on_event,
                    )
                    .await?;

                    items.push(CleanupItem::Device {
                        manager: Arc::clone(&self.device_manager),
                        device: acquired.clone(),
                        opts: ReleaseOpts {
                            package_name: Some(app_id.clone()),
                            clear_package_data: *clear_app_state,
                        },
                    });
                    prepared.push(PreparedTarget {
                        id: target.id.clone(),
                        agent: Arc::clone(&acquired.agent),
                        shot: ScreenshotSource::Adb(acquired.adb.clone()),
                        kind: PreparedKind::Android {
                            device: acquired,
                            app_id: app_id.clone(),
                        },
                    });
                }
                TargetKind::Browser {
                    url,
                    viewport,
                    username,
                    password,
                } => {
                    let browser_handle = if let Some(handle) = &browser {
                        Arc::clone(handle)
                    } else {
                        let handle = browser_target::launch_shared_browser(
                            &self.browser_driver,
                            &self.orch,
                        )
                        .await?;
                        items.push(CleanupItem::Browser(Arc::clone(&handle)));
                        browser = Some(Arc::clone(&handle));
                        handle
                    };

                    let (page, agent) = browser_target::prepare_browser_target(
                        &browser_handle,
                        &self.agents,
                        &self.url_filter,
                        api_key,
                        BrowserTargetSpec {
                            target_id: &target.id,
                            url: url.as_deref(),
                            viewport: *viewport,
                        },
                        &hooks.on_event,
                    )
                    .await?;

                    let last_url = page.current_url().await.unwrap_or_default();
                    items.push(CleanupItem::Page(Arc::clone(&page)));
                    prepared.push(PreparedTarget {
                        id: target.id.clone(),
                        agent,
                        shot: ScreenshotSource::Page(Arc::clone(&page)),
                        kind: PreparedKind::Browser {
                            page,
                            last_url: tokio::sync::Mutex::new(last_url),
                            credentials: (username.clone(), password.clone()),
                        },
                    });
                }
            }
        }
        Ok(())
    }
}

/// Validate the resolved configuration up front; failures map to terminal
/// `FAIL` without any setup having happened.
fn preconditions(run_cfg: &ResolvedRunConfig) -> Result<String, RunError> {
    let api_key = run_cfg
        .ai_api_key
        .as_deref()
        .map(str::trim)
        .filter(|key| !key.is_empty())
        .ok_or_else(|| RunError::config("No AI API key is configured for this run"))?
        .to_string();

    let targets = run_cfg.effective_targets();
    if targets.is_empty() {
        return Err(RunError::config(
            "Test has no targets: provide a URL or target configurations",
        ));
    }
    if run_cfg.effective_steps().is_empty() {
        return Err(RunError::config(
            "Test has no steps: provide a prompt or steps",
        ));
    }
    for target in &targets {
        if let TargetKind::Browser { url: Some(url), .. } = &target.kind {
            validate_target_url(url)?;
        }
    }
    Ok(api_key)
}

fn wire_tip_callbacks(
    targets: &[PreparedTarget],
    emit: &EventSink,
    action_count: &Arc<AtomicU64>,
) {
    for target in targets {
        let emit = emit.clone();
        let count = Arc::clone(action_count);
        let shot = target.shot.clone();
        let target_id = target.id.clone();
        target.agent.on_task_start_tip(Arc::new(move |tip: String| {
            let emit = emit.clone();
            let count = Arc::clone(&count);
            let shot = shot.clone();
            let target_id = target_id.clone();
            Box::pin(async move {
                count.fetch_add(1, Ordering::Relaxed);
                emit(
                    RunEvent::log(crate::events::LogLevel::Info, tip)
                        .with_browser_id(target_id.clone()),
                );
                if let Ok(src) = shot.capture().await {
                    emit(RunEvent::screenshot(src, "agent tip").with_browser_id(target_id));
                }
            })
        }));
    }
}

async fn capture_all(targets: &[PreparedTarget], emit: &EventSink, label: &str) {
    for target in targets {
        if let Ok(src) = target.shot.capture().await {
            emit(RunEvent::screenshot(src, label).with_browser_id(target.id.clone()));
        }
    }
}

fn outcome_from_error(error: &RunError, action_count: &Arc<AtomicU64>) -> RunOutcome {
    RunOutcome {
        status: error.terminal_status(),
        error: Some(error.to_string()),
        action_count: action_count.load(Ordering::Relaxed),
    }
}
