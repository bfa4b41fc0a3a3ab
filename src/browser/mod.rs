//! Browser driver contract
//!
//! The executor drives browsers only through these traits. The production
//! implementation lives in [`chromium`]; tests use [`mock`].

pub mod chromium;
pub mod mock;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};

/// Viewport applied to a browser context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Viewport {
    pub width: u32,
    pub height: u32,
}

impl Default for Viewport {
    fn default() -> Self {
        Self {
            width: 1280,
            height: 720,
        }
    }
}

/// Options for launching the shared headless browser.
#[derive(Debug, Clone)]
pub struct BrowserLaunchOpts {
    pub headless: bool,
    pub timeout: Duration,
    pub args: Vec<String>,
}

impl Default for BrowserLaunchOpts {
    fn default() -> Self {
        Self {
            headless: true,
            timeout: Duration::from_secs(30),
            args: Vec::new(),
        }
    }
}

/// Verdict of the request interceptor for one outbound request.
#[derive(Debug, Clone)]
pub enum RequestDecision {
    Allow,
    Block { reason: String },
}

/// Async predicate over an outbound request URL.
pub type RequestInterceptor =
    Arc<dyn Fn(String) -> BoxFuture<'static, RequestDecision> + Send + Sync>;

/// Receives console output: `(level, message)`.
pub type ConsoleSink = Arc<dyn Fn(String, String) + Send + Sync>;

/// Launches browsers.
#[async_trait]
pub trait BrowserDriver: Send + Sync {
    async fn launch(&self, opts: &BrowserLaunchOpts) -> Result<Arc<dyn BrowserHandle>>;
}

/// A running browser. One is shared by all browser targets of a run.
#[async_trait]
pub trait BrowserHandle: Send + Sync {
    /// Open an isolated context with the given viewport.
    async fn new_context(&self, viewport: Viewport) -> Result<Arc<dyn BrowserContextHandle>>;

    /// Close the browser and release its resources. Idempotent.
    async fn close(&self) -> Result<()>;
}

/// An isolated browsing context (one per target).
#[async_trait]
pub trait BrowserContextHandle: Send + Sync {
    async fn new_page(&self) -> Result<Arc<dyn PageHandle>>;
}

/// A single page the executor and the code-step sandbox act on.
#[async_trait]
pub trait PageHandle: Send + Sync {
    /// Navigate and wait for the document to be loaded.
    async fn goto(&self, url: &str) -> Result<()>;

    async fn current_url(&self) -> Result<String>;

    async fn title(&self) -> Result<String>;

    /// Capture the viewport as a `data:image/png;base64,...` URL.
    async fn screenshot_data_url(&self) -> Result<String>;

    async fn click(&self, selector: &str) -> Result<()>;

    async fn type_text(&self, selector: &str, text: &str) -> Result<()>;

    /// Evaluate an expression in the page and return its JSON value.
    async fn evaluate(&self, expression: &str) -> Result<serde_json::Value>;

    /// Attach files to a file input. Paths must already be policy-checked.
    async fn set_input_files(&self, selector: &str, files: &[PathBuf]) -> Result<()>;

    /// Wait until `document.readyState` is `interactive` or `complete`.
    /// Returns false when the deadline expires first.
    async fn wait_for_dom_ready(&self, timeout: Duration) -> Result<bool>;

    /// Install the outbound request interceptor for this page.
    async fn set_request_interceptor(&self, interceptor: RequestInterceptor) -> Result<()>;

    /// Wire console output into the run's log stream.
    async fn set_console_sink(&self, sink: ConsoleSink) -> Result<()>;

    async fn close(&self) -> Result<()>;
}
