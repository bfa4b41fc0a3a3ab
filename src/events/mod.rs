//! Event model and fan-out for run and project observers

pub mod bus;
pub mod errors;
pub mod types;

pub use bus::{BusCounters, BusSnapshot, EventBus, Subscription};
pub use errors::EventBusError;
pub use types::{LogLevel, ProjectEvent, RunEvent, RunEventKind, RunStatus};
