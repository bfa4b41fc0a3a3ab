//! Error taxonomy for the execution control plane
//!
//! Errors are classified by kind, not by origin: the kind decides the terminal
//! status of the run and whether the queue retries anything (it never does).

use thiserror::Error;

use crate::events::RunStatus;

/// Message persisted on runs that were cancelled by a user.
pub const CANCELLED_BY_USER: &str = "Test was cancelled by user";

/// Message persisted on runs reconciled after a process restart.
pub const SERVER_RESTARTED: &str = "Server restarted while test was in progress";

/// Message persisted when cancelling a run the queue no longer tracks.
pub const ORPHANED_RUN: &str = "Force cancelled (orphaned run)";

/// A failure that terminates a run.
///
/// The variants mirror the failure kinds the queue understands. Everything the
/// executor surfaces is one of these; the queue maps the kind to a terminal
/// status via [`RunError::terminal_status`] and persists the message verbatim.
#[derive(Debug, Error)]
pub enum RunError {
    /// Invalid run configuration: bad URL, missing steps, unknown target,
    /// unsupported step/target combination. Never retried.
    #[error("{0}")]
    Config(String),

    /// The run's cancellation token fired.
    #[error("{CANCELLED_BY_USER}")]
    Cancelled,

    /// A per-operation or whole-run deadline elapsed. Distinct from
    /// cancellation on purpose: the message names the deadline that fired.
    #[error("{0}")]
    Timeout(String),

    /// Device lease failure: serial not connected, unauthorized, already in
    /// use, boot failure, runtime attach failure.
    #[error("{0}")]
    Device(String),

    /// A step failed: action or assertion error, code statement threw,
    /// verification mismatch.
    #[error("{0}")]
    Step(String),

    /// Infrastructure failure outside the run itself (persistence, event
    /// delivery). Logged by the queue; does not change the in-memory outcome.
    #[error("{0}")]
    Infra(String),
}

impl RunError {
    /// Terminal status a run ends in when this error surfaces from the
    /// executor.
    pub fn terminal_status(&self) -> RunStatus {
        match self {
            RunError::Cancelled => RunStatus::Cancelled,
            _ => RunStatus::Fail,
        }
    }

    pub fn config(message: impl Into<String>) -> Self {
        RunError::Config(message.into())
    }

    pub fn device(message: impl Into<String>) -> Self {
        RunError::Device(message.into())
    }

    pub fn step(message: impl Into<String>) -> Self {
        RunError::Step(message.into())
    }
}

impl From<crate::url_safety::UrlPolicyError> for RunError {
    fn from(err: crate::url_safety::UrlPolicyError) -> Self {
        RunError::Config(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancellation_maps_to_cancelled_status() {
        assert_eq!(RunError::Cancelled.terminal_status(), RunStatus::Cancelled);
    }

    #[test]
    fn every_other_kind_maps_to_fail() {
        let errors = [
            RunError::config("bad url"),
            RunError::Timeout("deadline".into()),
            RunError::device("gone"),
            RunError::step("mismatch"),
            RunError::Infra("db down".into()),
        ];
        for err in errors {
            assert_eq!(err.terminal_status(), RunStatus::Fail);
        }
    }

    #[test]
    fn cancelled_message_is_stable() {
        assert_eq!(RunError::Cancelled.to_string(), CANCELLED_BY_USER);
    }

    #[test]
    fn url_policy_errors_become_config_errors() {
        let err = crate::url_safety::validate_target_url("ftp://example.com")
            .expect_err("scheme must be rejected");
        let run_err: RunError = err.into();
        assert!(matches!(run_err, RunError::Config(_)));
        assert_eq!(run_err.terminal_status(), RunStatus::Fail);
    }
}
