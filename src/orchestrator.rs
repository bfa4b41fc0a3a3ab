//! Composition root
//!
//! Explicit wiring of the singletons: repository, device manager, event
//! bus, executor, usage service, queue. Lifecycle is `build` →
//! `initialize` once at startup → `startup` for reconciliation →
//! `shutdown` to drain.

use std::sync::Arc;

use anyhow::{Result, anyhow};

use crate::adb::{CommandExecutor, SystemCommandExecutor};
use crate::agent::AgentFactory;
use crate::browser::BrowserDriver;
use crate::browser::chromium::ChromiumDriver;
use crate::config::OrchestratorConfig;
use crate::device_pool::DeviceManager;
use crate::events::EventBus;
use crate::executor::RunExecutor;
use crate::queue::TestQueue;
use crate::repository::Repository;
use crate::url_safety::UrlSafetyFilter;
use crate::usage::{NoopUsageService, UsageService};

/// The assembled control plane.
pub struct Orchestrator {
    pub config: Arc<OrchestratorConfig>,
    pub queue: Arc<TestQueue>,
    pub device_manager: Arc<DeviceManager>,
    pub event_bus: Arc<EventBus>,
    pub repository: Arc<dyn Repository>,
}

impl Orchestrator {
    #[must_use]
    pub fn builder() -> OrchestratorBuilder {
        OrchestratorBuilder::default()
    }

    /// Warm the device pool. Call once at process start.
    pub async fn initialize(&self) -> Result<()> {
        self.device_manager.initialize().await
    }

    /// Reconcile runs left active by a previous process.
    pub async fn startup(&self) -> Result<()> {
        self.queue.startup().await
    }

    /// Abort running jobs and tear the pools down.
    pub async fn shutdown(&self) {
        self.queue.shutdown().await;
        self.device_manager.shutdown().await;
    }
}

/// Builder for [`Orchestrator`]. A repository and an agent factory are
/// required; every other collaborator has a production default.
#[derive(Default)]
pub struct OrchestratorBuilder {
    config: Option<OrchestratorConfig>,
    repository: Option<Arc<dyn Repository>>,
    command_executor: Option<Arc<dyn CommandExecutor>>,
    browser_driver: Option<Arc<dyn BrowserDriver>>,
    agent_factory: Option<Arc<dyn AgentFactory>>,
    usage: Option<Arc<dyn UsageService>>,
}

impl OrchestratorBuilder {
    #[must_use]
    pub fn config(mut self, config: OrchestratorConfig) -> Self {
        self.config = Some(config);
        self
    }

    #[must_use]
    pub fn repository(mut self, repository: Arc<dyn Repository>) -> Self {
        self.repository = Some(repository);
        self
    }

    #[must_use]
    pub fn command_executor(mut self, executor: Arc<dyn CommandExecutor>) -> Self {
        self.command_executor = Some(executor);
        self
    }

    #[must_use]
    pub fn browser_driver(mut self, driver: Arc<dyn BrowserDriver>) -> Self {
        self.browser_driver = Some(driver);
        self
    }

    #[must_use]
    pub fn agent_factory(mut self, factory: Arc<dyn AgentFactory>) -> Self {
        self.agent_factory = Some(factory);
        self
    }

    #[must_use]
    pub fn usage_service(mut self, usage: Arc<dyn UsageService>) -> Self {
        self.usage = Some(usage);
        self
    }

    pub fn build(self) -> Result<Orchestrator> {
        let config = Arc::new(self.config.unwrap_or_default());
        let repository = self
            .repository
            .ok_or_else(|| anyhow!("a repository is required"))?;
        let agent_factory = self
            .agent_factory
            .ok_or_else(|| anyhow!("an agent factory is required"))?;
        let command_executor = self
            .command_executor
            .unwrap_or_else(|| Arc::new(SystemCommandExecutor));
        let browser_driver = self
            .browser_driver
            .unwrap_or_else(|| Arc::new(ChromiumDriver));
        let usage = self.usage.unwrap_or_else(|| Arc::new(NoopUsageService));

        let event_bus = EventBus::new(config.event_channel_capacity);
        let url_filter = Arc::new(UrlSafetyFilter::from_config(&config));
        let device_manager = DeviceManager::new(
            &config,
            Arc::clone(&command_executor),
            Arc::clone(&agent_factory),
        );
        let executor = Arc::new(RunExecutor::new(
            Arc::clone(&config),
            Arc::clone(&device_manager),
            browser_driver,
            agent_factory,
            url_filter,
        ));
        let queue = TestQueue::new(
            Arc::clone(&config),
            Arc::clone(&repository),
            Arc::clone(&device_manager),
            executor,
            Arc::clone(&event_bus),
            usage,
        );

        Ok(Orchestrator {
            config,
            queue,
            device_manager,
            event_bus,
            repository,
        })
    }
}
