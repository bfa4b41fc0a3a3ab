//! Scripted browser driver for tests
//!
//! Records every action, answers `evaluate` from a script table, and lets
//! tests drive the installed request interceptor directly.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use parking_lot::Mutex;

use super::{
    BrowserContextHandle, BrowserDriver, BrowserHandle, BrowserLaunchOpts, ConsoleSink,
    PageHandle, RequestDecision, RequestInterceptor, Viewport,
};

/// Driver that produces [`MockPage`]s.
#[derive(Default)]
pub struct MockBrowserDriver {
    launches: AtomicUsize,
    pages: Mutex<Vec<Arc<MockPage>>>,
}

impl MockBrowserDriver {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    #[must_use]
    pub fn launch_count(&self) -> usize {
        self.launches.load(Ordering::Relaxed)
    }

    /// Every page created through this driver, in creation order.
    #[must_use]
    pub fn pages(&self) -> Vec<Arc<MockPage>> {
        self.pages.lock().clone()
    }
}

#[async_trait]
impl BrowserDriver for Arc<MockBrowserDriver> {
    async fn launch(&self, _opts: &BrowserLaunchOpts) -> Result<Arc<dyn BrowserHandle>> {
        self.launches.fetch_add(1, Ordering::Relaxed);
        Ok(Arc::new(MockBrowser {
            driver: Arc::clone(self),
            closed: AtomicUsize::new(0),
        }))
    }
}

struct MockBrowser {
    driver: Arc<MockBrowserDriver>,
    closed: AtomicUsize,
}

#[async_trait]
impl BrowserHandle for MockBrowser {
    async fn new_context(&self, viewport: Viewport) -> Result<Arc<dyn BrowserContextHandle>> {
        if self.closed.load(Ordering::Relaxed) > 0 {
            return Err(anyhow!("browser already closed"));
        }
        Ok(Arc::new(MockContext {
            driver: Arc::clone(&self.driver),
            viewport,
        }))
    }

    async fn close(&self) -> Result<()> {
        self.closed.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

struct MockContext {
    driver: Arc<MockBrowserDriver>,
    viewport: Viewport,
}

#[async_trait]
impl BrowserContextHandle for MockContext {
    async fn new_page(&self) -> Result<Arc<dyn PageHandle>> {
        let page = Arc::new(MockPage::new(self.viewport));
        self.driver.pages.lock().push(Arc::clone(&page));
        Ok(page)
    }
}

/// Scriptable page.
pub struct MockPage {
    pub viewport: Viewport,
    actions: Mutex<Vec<String>>,
    url: Mutex<String>,
    eval_results: Mutex<HashMap<String, serde_json::Value>>,
    goto_failures: Mutex<HashMap<String, String>>,
    screenshots: AtomicUsize,
    interceptor: Mutex<Option<RequestInterceptor>>,
    console_sink: Mutex<Option<ConsoleSink>>,
    closed: AtomicUsize,
}

impl MockPage {
    #[must_use]
    pub fn new(viewport: Viewport) -> Self {
        Self {
            viewport,
            actions: Mutex::new(Vec::new()),
            url: Mutex::new("about:blank".to_string()),
            eval_results: Mutex::new(HashMap::new()),
            goto_failures: Mutex::new(HashMap::new()),
            screenshots: AtomicUsize::new(0),
            interceptor: Mutex::new(None),
            console_sink: Mutex::new(None),
            closed: AtomicUsize::new(0),
        }
    }

    #[must_use]
    pub fn standalone() -> Arc<Self> {
        Arc::new(Self::new(Viewport::default()))
    }

    /// Script the value `evaluate` returns for an exact expression.
    pub fn script_eval(&self, expression: &str, value: serde_json::Value) {
        self.eval_results
            .lock()
            .insert(expression.to_string(), value);
    }

    /// Make `goto` fail for a specific URL.
    pub fn fail_goto(&self, url: &str, message: &str) {
        self.goto_failures
            .lock()
            .insert(url.to_string(), message.to_string());
    }

    /// Every recorded action, in order.
    #[must_use]
    pub fn actions(&self) -> Vec<String> {
        self.actions.lock().clone()
    }

    #[must_use]
    pub fn screenshot_count(&self) -> usize {
        self.screenshots.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Relaxed) > 0
    }

    fn record(&self, action: String) {
        self.actions.lock().push(action);
    }

    /// Drive the installed interceptor as if the page issued a request.
    pub async fn simulate_request(&self, url: &str) -> Option<RequestDecision> {
        let interceptor = self.interceptor.lock().clone()?;
        Some(interceptor(url.to_string()).await)
    }

    /// Emit a console message through the installed sink.
    pub fn simulate_console(&self, level: &str, message: &str) -> bool {
        if let Some(sink) = self.console_sink.lock().clone() {
            sink(level.to_string(), message.to_string());
            true
        } else {
            false
        }
    }
}

#[async_trait]
impl PageHandle for MockPage {
    async fn goto(&self, url: &str) -> Result<()> {
        self.record(format!("goto {url}"));
        if let Some(message) = self.goto_failures.lock().get(url) {
            return Err(anyhow!(message.clone()));
        }
        *self.url.lock() = url.to_string();
        Ok(())
    }

    async fn current_url(&self) -> Result<String> {
        Ok(self.url.lock().clone())
    }

    async fn title(&self) -> Result<String> {
        Ok("Mock Page".to_string())
    }

    async fn screenshot_data_url(&self) -> Result<String> {
        let n = self.screenshots.fetch_add(1, Ordering::Relaxed);
        Ok(format!("data:image/png;base64,c2hvdC0{n}"))
    }

    async fn click(&self, selector: &str) -> Result<()> {
        self.record(format!("click {selector}"));
        Ok(())
    }

    async fn type_text(&self, selector: &str, text: &str) -> Result<()> {
        self.record(format!("type {selector} {text}"));
        Ok(())
    }

    async fn evaluate(&self, expression: &str) -> Result<serde_json::Value> {
        self.record(format!("evaluate {expression}"));
        Ok(self
            .eval_results
            .lock()
            .get(expression)
            .cloned()
            .unwrap_or(serde_json::Value::Null))
    }

    async fn set_input_files(&self, selector: &str, files: &[PathBuf]) -> Result<()> {
        let joined = files
            .iter()
            .map(|p| p.to_string_lossy().into_owned())
            .collect::<Vec<_>>()
            .join(",");
        self.record(format!("set_input_files {selector} {joined}"));
        Ok(())
    }

    async fn wait_for_dom_ready(&self, _timeout: Duration) -> Result<bool> {
        Ok(true)
    }

    async fn set_request_interceptor(&self, interceptor: RequestInterceptor) -> Result<()> {
        *self.interceptor.lock() = Some(interceptor);
        Ok(())
    }

    async fn set_console_sink(&self, sink: ConsoleSink) -> Result<()> {
        *self.console_sink.lock() = Some(sink);
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.closed.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}
