//! Run configuration snapshot and executor callback types
//!
//! The resolved configuration is an immutable snapshot taken at enqueue
//! time; later edits to the test case never affect an enqueued run.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};

use crate::adb::AdbHandle;
use crate::browser::{PageHandle, Viewport};
use crate::device_pool::DeviceSelector;
use crate::events::{RunEvent, RunStatus};

/// Id given to the implicit browser target of a URL-only test.
pub const DEFAULT_TARGET_ID: &str = "main";

/// A step of a test case. Steps execute strictly sequentially.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Step {
    pub id: String,
    /// Target the step runs against; the first target when unset.
    #[serde(rename = "targetId", skip_serializing_if = "Option::is_none")]
    pub target_id: Option<String>,
    /// Natural-language instruction or automation source, per `kind`.
    pub action: String,
    #[serde(rename = "type")]
    pub kind: StepKind,
    /// File ids this step may reference; narrows the upload-dir envelope.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub files: Option<Vec<String>>,
}

impl Step {
    #[must_use]
    pub fn ai(id: impl Into<String>, action: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            target_id: None,
            action: action.into(),
            kind: StepKind::AiAction,
            files: None,
        }
    }

    #[must_use]
    pub fn code(id: impl Into<String>, source: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            target_id: None,
            action: source.into(),
            kind: StepKind::Code,
            files: None,
        }
    }

    #[must_use]
    pub fn on_target(mut self, target_id: impl Into<String>) -> Self {
        self.target_id = Some(target_id.into());
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StepKind {
    #[serde(rename = "ai-action")]
    AiAction,
    #[serde(rename = "code")]
    Code,
}

/// One endpoint a step runs against.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TargetConfig {
    pub id: String,
    #[serde(flatten)]
    pub kind: TargetKind,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum TargetKind {
    Browser {
        #[serde(skip_serializing_if = "Option::is_none")]
        url: Option<String>,
        #[serde(default)]
        viewport: Viewport,
        #[serde(skip_serializing_if = "Option::is_none")]
        username: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        password: Option<String>,
    },
    Android {
        device: DeviceSelector,
        #[serde(rename = "appId")]
        app_id: String,
        #[serde(default, rename = "clearAppState")]
        clear_app_state: bool,
        #[serde(default, rename = "allowAllPermissions")]
        allow_all_permissions: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        name: Option<String>,
    },
}

impl TargetConfig {
    #[must_use]
    pub fn is_android(&self) -> bool {
        matches!(self.kind, TargetKind::Android { .. })
    }

    #[must_use]
    pub fn browser(id: impl Into<String>, url: Option<String>) -> Self {
        Self {
            id: id.into(),
            kind: TargetKind::Browser {
                url,
                viewport: Viewport::default(),
                username: None,
                password: None,
            },
        }
    }

    #[must_use]
    pub fn android(id: impl Into<String>, device: DeviceSelector, app_id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind: TargetKind::Android {
                device,
                app_id: app_id.into(),
                clear_app_state: false,
                allow_all_permissions: false,
                name: None,
            },
        }
    }
}

/// Immutable snapshot of everything a run needs, taken at enqueue time.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolvedRunConfig {
    pub run_id: String,
    pub test_case_id: String,
    pub project_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    /// Shorthand for a single browser target named `main`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    /// Newline-separated instructions, used when `steps` is empty.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prompt: Option<String>,
    #[serde(default)]
    pub steps: Vec<Step>,
    /// Targets in declaration order; the first is the default.
    #[serde(default, rename = "targetConfigs")]
    pub targets: Vec<TargetConfig>,
    #[serde(rename = "openRouterApiKey", skip_serializing_if = "Option::is_none")]
    pub ai_api_key: Option<String>,
    #[serde(default)]
    pub resolved_variables: HashMap<String, String>,
    /// File id to on-disk path under `<upload_root>/<test_case_id>`.
    #[serde(default)]
    pub resolved_files: HashMap<String, PathBuf>,
}

impl ResolvedRunConfig {
    /// Targets after expanding the URL shorthand.
    #[must_use]
    pub fn effective_targets(&self) -> Vec<TargetConfig> {
        if self.targets.is_empty() {
            match &self.url {
                Some(url) => vec![TargetConfig::browser(DEFAULT_TARGET_ID, Some(url.clone()))],
                None => Vec::new(),
            }
        } else {
            self.targets.clone()
        }
    }

    /// Steps after expanding the prompt shorthand: each non-empty prompt
    /// line becomes an ai-action step against the first target.
    #[must_use]
    pub fn effective_steps(&self) -> Vec<Step> {
        if !self.steps.is_empty() {
            return self.steps.clone();
        }
        match &self.prompt {
            Some(prompt) => prompt
                .lines()
                .map(str::trim)
                .filter(|line| !line.is_empty())
                .enumerate()
                .map(|(i, line)| Step::ai(format!("prompt-{}", i + 1), line))
                .collect(),
            None => Vec::new(),
        }
    }

    /// Device selectors of every Android target, in declaration order.
    #[must_use]
    pub fn android_selectors(&self) -> Vec<DeviceSelector> {
        self.effective_targets()
            .iter()
            .filter_map(|target| match &target.kind {
                TargetKind::Android { device, .. } => Some(device.clone()),
                TargetKind::Browser { .. } => None,
            })
            .collect()
    }

    /// Emulator profiles this run would reserve.
    #[must_use]
    pub fn emulator_profiles(&self) -> Vec<String> {
        self.android_selectors()
            .iter()
            .filter_map(|s| s.emulator_profile().map(str::to_string))
            .collect()
    }
}

/// Terminal result of a run, as returned by the executor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunOutcome {
    pub status: RunStatus,
    pub error: Option<String>,
    /// Agent tips observed; drives usage accounting.
    pub action_count: u64,
}

/// Receives the executor's live events.
pub type EventSink = Arc<dyn Fn(RunEvent) + Send + Sync>;

/// Async lifecycle notification.
pub type LifecycleHook = Arc<dyn Fn() -> BoxFuture<'static, ()> + Send + Sync>;

/// One-shot, idempotent cleanup the queue can drain during cancellation.
#[derive(Clone)]
pub struct CleanupHandle {
    task: Arc<tokio::sync::Mutex<Option<BoxFuture<'static, ()>>>>,
}

impl CleanupHandle {
    #[must_use]
    pub fn new(task: impl std::future::Future<Output = ()> + Send + 'static) -> Self {
        Self {
            task: Arc::new(tokio::sync::Mutex::new(Some(Box::pin(task)))),
        }
    }

    /// Run the cleanup. The second and later calls are no-ops.
    pub async fn run(&self) {
        let task = self.task.lock().await.take();
        if let Some(task) = task {
            task.await;
        }
    }
}

/// Callback bag the queue hands to the executor.
#[derive(Clone)]
pub struct RunHooks {
    pub on_event: EventSink,
    pub on_preparing: LifecycleHook,
    pub on_running: LifecycleHook,
    pub on_cleanup: Arc<dyn Fn(CleanupHandle) + Send + Sync>,
}

impl RunHooks {
    /// Hooks that do nothing, for tests and direct executor use.
    #[must_use]
    pub fn noop() -> Self {
        Self {
            on_event: Arc::new(|_| {}),
            on_preparing: Arc::new(|| Box::pin(async {})),
            on_running: Arc::new(|| Box::pin(async {})),
            on_cleanup: Arc::new(|_| {}),
        }
    }
}

/// Where a target's screenshots come from.
#[derive(Clone)]
pub enum ScreenshotSource {
    Page(Arc<dyn PageHandle>),
    Adb(AdbHandle),
}

impl ScreenshotSource {
    /// Capture as a `data:image/png;base64,...` URL.
    pub async fn capture(&self) -> anyhow::Result<String> {
        match self {
            ScreenshotSource::Page(page) => page.screenshot_data_url().await,
            ScreenshotSource::Adb(adb) => {
                let encoded = adb
                    .shell(
                        &["screencap", "-p", "|", "base64", "-w", "0"],
                        crate::adb::ShellOpts::default(),
                    )
                    .await?;
                let compact: String =
                    encoded.chars().filter(|c| !c.is_whitespace()).collect();
                Ok(format!("data:image/png;base64,{compact}"))
            }
        }
    }
}
