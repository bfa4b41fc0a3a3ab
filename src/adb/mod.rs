//! ADB tooling: command execution and the per-serial device handle

mod executor;
mod handle;

pub use executor::mock::MockCommandExecutor;
pub use executor::{CommandExecutor, CommandOutput, SystemCommandExecutor};
pub use handle::{
    AdbHandle, ConnectedDevice, DeviceState, ShellOpts, list_connected_devices,
    parse_device_list,
};
