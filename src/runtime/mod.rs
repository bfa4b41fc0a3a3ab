//! Async plumbing shared across the control plane
//!
//! Cooperative cancellation and deadline helpers. Every long-running
//! operation in the executor and the device pool threads a [`CancelToken`]
//! through its suspension points.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::sync::Notify;

use crate::error::RunError;

/// Cooperative cancellation token.
///
/// Clones share state: cancelling any clone wakes every waiter on every
/// clone. Cancellation is one-way and idempotent.
#[derive(Clone, Debug, Default)]
pub struct CancelToken {
    inner: Arc<CancelInner>,
}

#[derive(Debug, Default)]
struct CancelInner {
    cancelled: AtomicBool,
    notify: Notify,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fire the token. Safe to call more than once.
    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    /// Resolve once the token fires. Registers the waiter before checking the
    /// flag so a concurrent `cancel` cannot be missed.
    pub async fn cancelled(&self) {
        loop {
            let notified = self.inner.notify.notified();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }

    /// Fail fast with [`RunError::Cancelled`] when the token already fired.
    pub fn check(&self) -> Result<(), RunError> {
        if self.is_cancelled() {
            Err(RunError::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// Bound an operation by a deadline, mapping expiry to [`RunError::Timeout`]
/// with a message naming the operation.
pub async fn with_deadline<F, T>(
    operation: F,
    deadline: Duration,
    operation_name: &str,
) -> Result<T, RunError>
where
    F: Future<Output = Result<T, RunError>>,
{
    match tokio::time::timeout(deadline, operation).await {
        Ok(result) => result,
        Err(_) => Err(RunError::Timeout(format!(
            "{operation_name} timed out after {}s",
            deadline.as_secs()
        ))),
    }
}

/// Bound an operation by a deadline while honoring a cancellation token.
///
/// Cancellation wins over the deadline when both race: an abort at any
/// suspension point reads as `CANCELLED`, never as a timeout.
pub async fn with_deadline_cancellable<F, T>(
    operation: F,
    deadline: Duration,
    operation_name: &str,
    token: &CancelToken,
) -> Result<T, RunError>
where
    F: Future<Output = Result<T, RunError>>,
{
    tokio::select! {
        biased;
        _ = token.cancelled() => Err(RunError::Cancelled),
        result = with_deadline(operation, deadline, operation_name) => result,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn token_starts_unset() {
        let token = CancelToken::new();
        assert!(!token.is_cancelled());
        assert!(token.check().is_ok());
    }

    #[tokio::test]
    async fn cancel_wakes_waiters() {
        let token = CancelToken::new();
        let waiter = token.clone();
        let handle = tokio::spawn(async move { waiter.cancelled().await });
        token.cancel();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("waiter should wake")
            .expect("waiter task should not panic");
        assert!(token.is_cancelled());
    }

    #[tokio::test]
    async fn cancel_is_idempotent() {
        let token = CancelToken::new();
        token.cancel();
        token.cancel();
        assert!(matches!(token.check(), Err(RunError::Cancelled)));
    }

    #[tokio::test]
    async fn deadline_maps_to_timeout_error() {
        let result: Result<(), RunError> = with_deadline(
            async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(())
            },
            Duration::from_millis(20),
            "slow operation",
        )
        .await;
        match result {
            Err(RunError::Timeout(message)) => assert!(message.contains("slow operation")),
            other => panic!("expected timeout, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn cancellation_wins_over_deadline() {
        let token = CancelToken::new();
        token.cancel();
        let result: Result<(), RunError> = with_deadline_cancellable(
            async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(())
            },
            Duration::from_secs(5),
            "slow operation",
            &token,
        )
        .await;
        assert!(matches!(result, Err(RunError::Cancelled)));
    }
}
