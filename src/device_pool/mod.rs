//! Device leasing: emulator pool and physical devices behind one facade

mod emulator;
mod lease;
mod manager;

pub use emulator::EmulatorPool;
pub use lease::{AcquiredDevice, DeviceKind, DeviceSelector, LeaseState, ReleaseOpts};
pub use manager::DeviceManager;
