//! Chromium-backed browser driver
//!
//! Finds a system Chrome/Chromium (or downloads a managed build), launches
//! it headless, and adapts pages to [`PageHandle`]. Request interception and
//! console wiring run on background tasks that are aborted when the page
//! closes.

use std::path::PathBuf;
use std::process::Command;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use base64::Engine;
use chromiumoxide::Page;
use chromiumoxide::browser::{Browser, BrowserConfigBuilder, HeadlessMode};
use chromiumoxide::cdp::browser_protocol::page::{
    CaptureScreenshotFormat, CaptureScreenshotParams,
};
use chromiumoxide_cdp::cdp::browser_protocol::dom::SetFileInputFilesParams;
use chromiumoxide_cdp::cdp::browser_protocol::emulation::SetDeviceMetricsOverrideParams;
use chromiumoxide_cdp::cdp::browser_protocol::fetch::{
    self, ContinueRequestParams, EventRequestPaused, FailRequestParams,
};
use chromiumoxide_cdp::cdp::browser_protocol::network::ErrorReason;
use chromiumoxide_cdp::cdp::js_protocol::runtime::EventConsoleApiCalled;
use chromiumoxide::fetcher::{BrowserFetcher, BrowserFetcherOptions};
use futures::StreamExt;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use super::{
    BrowserContextHandle, BrowserDriver, BrowserHandle, BrowserLaunchOpts, ConsoleSink,
    PageHandle, RequestDecision, RequestInterceptor, Viewport,
};

/// Find a Chrome/Chromium executable on the system.
///
/// `CHROMIUM_PATH` overrides all other methods.
pub fn find_browser_executable() -> Result<PathBuf> {
    if let Ok(path) = std::env::var("CHROMIUM_PATH") {
        let path = PathBuf::from(path);
        if path.exists() {
            info!("Using browser from CHROMIUM_PATH: {}", path.display());
            return Ok(path);
        }
        warn!(
            "CHROMIUM_PATH points to non-existent file: {}",
            path.display()
        );
    }

    let paths = if cfg!(target_os = "macos") {
        vec![
            "/Applications/Google Chrome.app/Contents/MacOS/Google Chrome",
            "/Applications/Chromium.app/Contents/MacOS/Chromium",
            "/opt/homebrew/bin/chromium",
        ]
    } else {
        vec![
            "/usr/bin/google-chrome",
            "/usr/bin/google-chrome-stable",
            "/usr/bin/chromium",
            "/usr/bin/chromium-browser",
            "/snap/bin/chromium",
            "/usr/local/bin/chromium",
            "/opt/google/chrome/chrome",
        ]
    };

    for path_str in paths {
        let path = PathBuf::from(path_str);
        if path.exists() {
            info!("Found browser at: {}", path.display());
            return Ok(path);
        }
    }

    if !cfg!(target_os = "windows") {
        for cmd in &["chromium", "chromium-browser", "google-chrome", "chrome"] {
            if let Ok(output) = Command::new("which").arg(cmd).output() {
                if output.status.success() {
                    let path_str = String::from_utf8_lossy(&output.stdout).trim().to_string();
                    if !path_str.is_empty() {
                        return Ok(PathBuf::from(path_str));
                    }
                }
            }
        }
    }

    Err(anyhow!("Chrome/Chromium executable not found"))
}

/// Download a managed Chromium build into a cache directory.
pub async fn download_managed_browser() -> Result<PathBuf> {
    let cache_dir = std::env::temp_dir().join("uitest-chromium");
    std::fs::create_dir_all(&cache_dir).context("Failed to create browser cache directory")?;

    let fetcher = BrowserFetcher::new(
        BrowserFetcherOptions::builder()
            .with_path(&cache_dir)
            .build()
            .context("Failed to build fetcher options")?,
    );
    let revision_info = fetcher.fetch().await.context("Failed to fetch browser")?;
    info!(
        "Downloaded Chromium to: {}",
        revision_info.folder_path.display()
    );
    Ok(revision_info.executable_path)
}

/// Production [`BrowserDriver`].
#[derive(Debug, Default, Clone, Copy)]
pub struct ChromiumDriver;

#[async_trait]
impl BrowserDriver for ChromiumDriver {
    async fn launch(&self, opts: &BrowserLaunchOpts) -> Result<Arc<dyn BrowserHandle>> {
        let chrome_path = match find_browser_executable() {
            Ok(path) => path,
            Err(_) => download_managed_browser().await?,
        };

        let user_data_dir = std::env::temp_dir().join(format!(
            "uitest_chrome_{}_{}",
            std::process::id(),
            uuid::Uuid::new_v4().simple()
        ));
        std::fs::create_dir_all(&user_data_dir)
            .context("Failed to create user data directory")?;

        let mut config_builder = BrowserConfigBuilder::default()
            .request_timeout(opts.timeout)
            .user_data_dir(user_data_dir.clone())
            .chrome_executable(chrome_path);

        if opts.headless {
            config_builder = config_builder.headless_mode(HeadlessMode::default());
        } else {
            config_builder = config_builder.with_head();
        }

        config_builder = config_builder
            .arg("--no-first-run")
            .arg("--no-default-browser-check")
            .arg("--no-sandbox")
            .arg("--disable-infobars")
            .arg("--disable-notifications")
            .arg("--disable-extensions")
            .arg("--disable-background-networking")
            .arg("--mute-audio")
            .arg("--hide-scrollbars");
        for arg in &opts.args {
            config_builder = config_builder.arg(arg.clone());
        }

        let browser_config = config_builder
            .build()
            .map_err(|e| anyhow!("Failed to build browser config: {e}"))?;

        let (browser, mut handler) = Browser::launch(browser_config)
            .await
            .context("Failed to launch browser")?;

        let handler_task = tokio::spawn(async move {
            while let Some(h) = handler.next().await {
                if let Err(e) = h {
                    let message = e.to_string();
                    // Chrome emits CDP events chromiumoxide does not model;
                    // those deserialization errors are noise.
                    let benign = message
                        .contains("data did not match any variant of untagged enum Message")
                        || message.contains("Failed to deserialize WS response");
                    if benign {
                        trace!("suppressed CDP serialization error: {message}");
                    } else {
                        warn!("browser handler error: {message}");
                    }
                }
            }
            debug!("browser handler task completed");
        });

        Ok(Arc::new(ChromiumBrowser {
            browser: Arc::new(tokio::sync::Mutex::new(Some(browser))),
            handler_task: Mutex::new(Some(handler_task)),
            user_data_dir,
        }))
    }
}

struct ChromiumBrowser {
    /// Shared with contexts; a closed slot makes page creation fail instead
    /// of racing the shutdown.
    browser: Arc<tokio::sync::Mutex<Option<Browser>>>,
    handler_task: Mutex<Option<JoinHandle<()>>>,
    user_data_dir: PathBuf,
}

#[async_trait]
impl BrowserHandle for ChromiumBrowser {
    async fn new_context(&self, viewport: Viewport) -> Result<Arc<dyn BrowserContextHandle>> {
        if self.browser.lock().await.is_none() {
            return Err(anyhow!("browser already closed"));
        }
        Ok(Arc::new(ChromiumContext {
            browser: Arc::clone(&self.browser),
            viewport,
        }))
    }

    async fn close(&self) -> Result<()> {
        if let Some(mut browser) = self.browser.lock().await.take() {
            if let Err(e) = browser.close().await {
                warn!("failed to close browser: {e}");
            }
            let _ = browser.wait().await;
        }
        if let Some(task) = self.handler_task.lock().take() {
            task.abort();
        }
        if self.user_data_dir.exists() {
            if let Err(e) = std::fs::remove_dir_all(&self.user_data_dir) {
                warn!(
                    "failed to clean up user data dir {}: {e}",
                    self.user_data_dir.display()
                );
            }
        }
        Ok(())
    }
}

struct ChromiumContext {
    browser: Arc<tokio::sync::Mutex<Option<Browser>>>,
    viewport: Viewport,
}

#[async_trait]
impl BrowserContextHandle for ChromiumContext {
    async fn new_page(&self) -> Result<Arc<dyn PageHandle>> {
        let guard = self.browser.lock().await;
        let browser = guard
            .as_ref()
            .ok_or_else(|| anyhow!("browser already closed"))?;
        let page = browser
            .new_page("about:blank")
            .await
            .context("Failed to open page")?;
        drop(guard);

        let metrics = SetDeviceMetricsOverrideParams::builder()
            .width(i64::from(self.viewport.width))
            .height(i64::from(self.viewport.height))
            .device_scale_factor(1.0)
            .mobile(false)
            .build()
            .map_err(|e| anyhow!("invalid viewport: {e}"))?;
        page.execute(metrics)
            .await
            .context("Failed to apply viewport")?;

        Ok(Arc::new(ChromiumPage {
            page,
            tasks: Mutex::new(Vec::new()),
        }))
    }
}

struct ChromiumPage {
    page: Page,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

#[async_trait]
impl PageHandle for ChromiumPage {
    async fn goto(&self, url: &str) -> Result<()> {
        self.page
            .goto(url)
            .await
            .with_context(|| format!("Failed to navigate to {url}"))?;
        self.page
            .wait_for_navigation()
            .await
            .with_context(|| format!("Navigation to {url} did not complete"))?;
        Ok(())
    }

    async fn current_url(&self) -> Result<String> {
        Ok(self.page.url().await?.unwrap_or_default())
    }

    async fn title(&self) -> Result<String> {
        Ok(self.page.get_title().await?.unwrap_or_default())
    }

    async fn screenshot_data_url(&self) -> Result<String> {
        let params = CaptureScreenshotParams {
            format: Some(CaptureScreenshotFormat::Png),
            ..Default::default()
        };
        let bytes = self
            .page
            .screenshot(params)
            .await
            .map_err(|e| anyhow!("Failed to capture screenshot: {e}"))?;
        let encoded = base64::engine::general_purpose::STANDARD.encode(bytes);
        Ok(format!("data:image/png;base64,{encoded}"))
    }

    async fn click(&self, selector: &str) -> Result<()> {
        let element = self
            .page
            .find_element(selector)
            .await
            .with_context(|| format!("No element matches selector {selector}"))?;
        element.click().await?;
        Ok(())
    }

    async fn type_text(&self, selector: &str, text: &str) -> Result<()> {
        let element = self
            .page
            .find_element(selector)
            .await
            .with_context(|| format!("No element matches selector {selector}"))?;
        element.click().await?;
        element.type_str(text).await?;
        Ok(())
    }

    async fn evaluate(&self, expression: &str) -> Result<serde_json::Value> {
        let result = self
            .page
            .evaluate(expression)
            .await
            .with_context(|| format!("Evaluation failed: {expression}"))?;
        match result.into_value::<serde_json::Value>() {
            Ok(value) => Ok(value),
            Err(_) => Ok(serde_json::Value::Null),
        }
    }

    async fn set_input_files(&self, selector: &str, files: &[PathBuf]) -> Result<()> {
        let element = self
            .page
            .find_element(selector)
            .await
            .with_context(|| format!("No file input matches selector {selector}"))?;
        let file_paths: Vec<String> = files
            .iter()
            .map(|p| p.to_string_lossy().into_owned())
            .collect();
        let params = SetFileInputFilesParams::builder()
            .files(file_paths)
            .backend_node_id(element.backend_node_id)
            .build()
            .map_err(|e| anyhow!("invalid file input params: {e}"))?;
        self.page
            .execute(params)
            .await
            .context("Failed to set input files")?;
        Ok(())
    }

    async fn wait_for_dom_ready(&self, timeout: Duration) -> Result<bool> {
        let poll = async {
            loop {
                if let Ok(value) = self.evaluate("document.readyState").await {
                    if let Some(state) = value.as_str() {
                        if state == "interactive" || state == "complete" {
                            return;
                        }
                    }
                }
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        };
        Ok(tokio::time::timeout(timeout, poll).await.is_ok())
    }

    async fn set_request_interceptor(&self, interceptor: RequestInterceptor) -> Result<()> {
        let mut request_events = self
            .page
            .event_listener::<EventRequestPaused>()
            .await
            .context("Failed to listen for paused requests")?;
        self.page
            .execute(fetch::EnableParams::default())
            .await
            .context("Failed to enable request interception")?;

        let page = self.page.clone();
        let task = tokio::spawn(async move {
            while let Some(event) = request_events.next().await {
                let url = event.request.url.clone();
                let request_id = event.request_id.clone();
                match interceptor(url.clone()).await {
                    RequestDecision::Allow => {
                        let params = ContinueRequestParams::builder()
                            .request_id(request_id)
                            .build();
                        match params {
                            Ok(params) => {
                                if let Err(e) = page.execute(params).await {
                                    trace!("continue request failed for {url}: {e}");
                                }
                            }
                            Err(e) => warn!("continue request params invalid: {e}"),
                        }
                    }
                    RequestDecision::Block { reason } => {
                        debug!(url, reason, "aborting blocked request");
                        let params = FailRequestParams::builder()
                            .request_id(request_id)
                            .error_reason(ErrorReason::BlockedByClient)
                            .build();
                        match params {
                            Ok(params) => {
                                if let Err(e) = page.execute(params).await {
                                    trace!("fail request failed for {url}: {e}");
                                }
                            }
                            Err(e) => warn!("fail request params invalid: {e}"),
                        }
                    }
                }
            }
        });
        self.tasks.lock().push(task);
        Ok(())
    }

    async fn set_console_sink(&self, sink: ConsoleSink) -> Result<()> {
        let mut console_events = self
            .page
            .event_listener::<EventConsoleApiCalled>()
            .await
            .context("Failed to listen for console events")?;

        let task = tokio::spawn(async move {
            while let Some(event) = console_events.next().await {
                let message = event
                    .args
                    .iter()
                    .filter_map(|arg| arg.value.as_ref())
                    .map(|value| match value {
                        serde_json::Value::String(s) => s.clone(),
                        other => other.to_string(),
                    })
                    .collect::<Vec<_>>()
                    .join(" ");
                if !message.is_empty() {
                    let level = format!("{:?}", event.r#type).to_lowercase();
                    sink(level, message);
                }
            }
        });
        self.tasks.lock().push(task);
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        if let Err(e) = self.page.clone().close().await {
            debug!("page close failed: {e}");
        }
        Ok(())
    }
}

impl Drop for ChromiumPage {
    fn drop(&mut self) {
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
    }
}
