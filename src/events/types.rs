//! Event and status types shared by the queue, executor, and event bus
//!
//! The serialized form of [`RunEvent`] is identical on the bus and in the
//! persisted `result` column: `{type, data, browserId?, timestamp}`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle state of a run.
///
/// Intermediate states transition strictly forward; terminal states are
/// final. The wire form matches the persisted layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunStatus {
    Queued,
    Preparing,
    Running,
    Pass,
    Fail,
    Cancelled,
}

impl RunStatus {
    /// PASS, FAIL, and CANCELLED are final.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, RunStatus::Pass | RunStatus::Fail | RunStatus::Cancelled)
    }

    /// PREPARING and RUNNING occupy a concurrency slot.
    #[must_use]
    pub fn is_active(&self) -> bool {
        matches!(self, RunStatus::Preparing | RunStatus::Running)
    }

    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Queued => "QUEUED",
            RunStatus::Preparing => "PREPARING",
            RunStatus::Running => "RUNNING",
            RunStatus::Pass => "PASS",
            RunStatus::Fail => "FAIL",
            RunStatus::Cancelled => "CANCELLED",
        }
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Severity of a log event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Info,
    Warn,
    Error,
}

/// Payload of a run event.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "lowercase")]
pub enum RunEventKind {
    Log {
        level: LogLevel,
        message: String,
    },
    /// `src` is a `data:` URL containing a base64-encoded image.
    Screenshot {
        src: String,
        label: String,
    },
    Status {
        status: RunStatus,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
}

/// A single event on a run's live stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunEvent {
    #[serde(flatten)]
    pub kind: RunEventKind,
    #[serde(rename = "browserId", skip_serializing_if = "Option::is_none")]
    pub browser_id: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl RunEvent {
    #[must_use]
    pub fn log(level: LogLevel, message: impl Into<String>) -> Self {
        Self {
            kind: RunEventKind::Log {
                level,
                message: message.into(),
            },
            browser_id: None,
            timestamp: Utc::now(),
        }
    }

    #[must_use]
    pub fn screenshot(src: impl Into<String>, label: impl Into<String>) -> Self {
        Self {
            kind: RunEventKind::Screenshot {
                src: src.into(),
                label: label.into(),
            },
            browser_id: None,
            timestamp: Utc::now(),
        }
    }

    #[must_use]
    pub fn status(status: RunStatus, error: Option<String>) -> Self {
        Self {
            kind: RunEventKind::Status { status, error },
            browser_id: None,
            timestamp: Utc::now(),
        }
    }

    /// Attach the originating target id (browser context or device).
    #[must_use]
    pub fn with_browser_id(mut self, browser_id: impl Into<String>) -> Self {
        self.browser_id = Some(browser_id.into());
        self
    }

    #[must_use]
    pub fn is_screenshot(&self) -> bool {
        matches!(self.kind, RunEventKind::Screenshot { .. })
    }
}

/// Status update fanned out on a project topic.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectEvent {
    #[serde(rename = "type")]
    pub event_type: String,
    pub project_id: String,
    pub test_case_id: String,
    pub run_id: String,
    pub status: RunStatus,
}

impl ProjectEvent {
    #[must_use]
    pub fn test_run_status(
        project_id: impl Into<String>,
        test_case_id: impl Into<String>,
        run_id: impl Into<String>,
        status: RunStatus,
    ) -> Self {
        Self {
            event_type: "test-run-status".to_string(),
            project_id: project_id.into(),
            test_case_id: test_case_id.into(),
            run_id: run_id.into(),
            status,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_and_active_partition_statuses() {
        assert!(RunStatus::Pass.is_terminal());
        assert!(RunStatus::Fail.is_terminal());
        assert!(RunStatus::Cancelled.is_terminal());
        assert!(RunStatus::Preparing.is_active());
        assert!(RunStatus::Running.is_active());
        assert!(!RunStatus::Queued.is_active());
        assert!(!RunStatus::Queued.is_terminal());
    }

    #[test]
    fn log_event_wire_format() {
        let event = RunEvent::log(LogLevel::Info, "navigating");
        let json = serde_json::to_value(&event).expect("serialize");
        assert_eq!(json["type"], "log");
        assert_eq!(json["data"]["level"], "info");
        assert_eq!(json["data"]["message"], "navigating");
        assert!(json.get("browserId").is_none());
        assert!(json["timestamp"].is_string());
    }

    #[test]
    fn screenshot_event_carries_browser_id() {
        let event = RunEvent::screenshot("data:image/png;base64,AAAA", "after step 1")
            .with_browser_id("main");
        let json = serde_json::to_value(&event).expect("serialize");
        assert_eq!(json["type"], "screenshot");
        assert_eq!(json["browserId"], "main");
        assert_eq!(json["data"]["label"], "after step 1");
    }

    #[test]
    fn status_event_round_trips() {
        let event = RunEvent::status(RunStatus::Fail, Some("boom".into()));
        let json = serde_json::to_string(&event).expect("serialize");
        let back: RunEvent = serde_json::from_str(&json).expect("deserialize");
        match back.kind {
            RunEventKind::Status { status, error } => {
                assert_eq!(status, RunStatus::Fail);
                assert_eq!(error.as_deref(), Some("boom"));
            }
            other => panic!("expected status, got {other:?}"),
        }
    }

    #[test]
    fn project_event_wire_format() {
        let event = ProjectEvent::test_run_status("p1", "tc1", "r1", RunStatus::Queued);
        let json = serde_json::to_value(&event).expect("serialize");
        assert_eq!(json["type"], "test-run-status");
        assert_eq!(json["projectId"], "p1");
        assert_eq!(json["status"], "QUEUED");
    }
}
