//! Event bus error types

use thiserror::Error;

/// Failure while receiving from a subscription.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EventBusError {
    /// The topic was closed: the publisher dropped or the run finished.
    #[error("event topic closed")]
    Closed,

    /// The subscriber fell behind and the broadcast buffer wrapped.
    /// Delivery is best-effort; the skipped count is informational.
    #[error("subscriber lagged, {0} events dropped")]
    Lagged(u64),
}
