//! Execution control plane for AI-driven UI test runs.
//!
//! Clients submit test runs referencing a saved test case; the queue admits
//! them under per-project and per-resource constraints, the executor drives
//! browser and Android targets through AI and code steps, the event bus
//! streams live logs and screenshots to observers, and terminal results are
//! persisted through the repository contract. Resources are released
//! reliably on completion, cancellation, and crash recovery.
//!
//! HTTP handlers, authentication, the AI model behind [`agent::AgentDriver`],
//! and durable storage engines are external collaborators; this crate
//! defines the contracts it drives them through.

pub mod adb;
pub mod agent;
pub mod browser;
pub mod config;
pub mod device_pool;
pub mod error;
pub mod events;
pub mod executor;
pub mod orchestrator;
pub mod queue;
pub mod repository;
pub mod runtime;
pub mod url_safety;
pub mod usage;

pub use adb::{AdbHandle, CommandExecutor, MockCommandExecutor, SystemCommandExecutor};
pub use agent::{AgentDriver, AgentFactory};
pub use browser::{BrowserDriver, PageHandle, Viewport};
pub use config::{OrchestratorConfig, OrchestratorConfigBuilder};
pub use device_pool::{AcquiredDevice, DeviceManager, DeviceSelector, EmulatorPool, LeaseState};
pub use error::RunError;
pub use events::{EventBus, LogLevel, ProjectEvent, RunEvent, RunEventKind, RunStatus};
pub use executor::{
    DEFAULT_TARGET_ID, ResolvedRunConfig, RunExecutor, RunHooks, RunOutcome, Step, StepKind,
    TargetConfig,
};
pub use orchestrator::{Orchestrator, OrchestratorBuilder};
pub use queue::TestQueue;
pub use repository::{MemoryRepository, Repository, TerminalUpdate};
pub use runtime::CancelToken;
pub use url_safety::{UrlSafetyFilter, validate_target_url};
pub use usage::{NoopUsageService, RecordingUsageService, UsageService};
