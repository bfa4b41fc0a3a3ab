//! Device lease model

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::adb::AdbHandle;
use crate::agent::AgentDriver;

/// What backs a lease.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceKind {
    Emulator,
    Physical,
}

/// Lease lifecycle. `Dead` is terminal; a dead lease is never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LeaseState {
    Starting,
    Booting,
    Idle,
    Acquired,
    Cleaning,
    Dead,
}

/// How a run names the device it wants.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DeviceSelector {
    /// Lease any emulator booted from this AVD profile.
    #[serde(rename = "emulatorProfile")]
    EmulatorProfile(String),
    /// Lease the physical (or already-running emulator) device with this
    /// serial.
    #[serde(rename = "connectedDevice")]
    ConnectedDevice(String),
}

impl DeviceSelector {
    #[must_use]
    pub fn emulator_profile(&self) -> Option<&str> {
        match self {
            DeviceSelector::EmulatorProfile(name) => Some(name),
            DeviceSelector::ConnectedDevice(_) => None,
        }
    }

    #[must_use]
    pub fn connected_serial(&self) -> Option<&str> {
        match self {
            DeviceSelector::EmulatorProfile(_) => None,
            DeviceSelector::ConnectedDevice(serial) => Some(serial),
        }
    }
}

impl std::fmt::Display for DeviceSelector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeviceSelector::EmulatorProfile(name) => write!(f, "emulator profile '{name}'"),
            DeviceSelector::ConnectedDevice(serial) => write!(f, "device '{serial}'"),
        }
    }
}

/// A held lease, as handed to the executor.
#[derive(Clone)]
pub struct AcquiredDevice {
    pub lease_id: String,
    pub kind: DeviceKind,
    pub serial: String,
    pub avd_name: Option<String>,
    pub adb: AdbHandle,
    pub agent: Arc<dyn AgentDriver>,
    pub acquired_at: DateTime<Utc>,
}

impl std::fmt::Debug for AcquiredDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AcquiredDevice")
            .field("lease_id", &self.lease_id)
            .field("kind", &self.kind)
            .field("serial", &self.serial)
            .field("avd_name", &self.avd_name)
            .field("acquired_at", &self.acquired_at)
            .finish_non_exhaustive()
    }
}

/// Cleanup requested when releasing a lease.
#[derive(Debug, Clone, Default)]
pub struct ReleaseOpts {
    /// App package to force-stop before recycling the device.
    pub package_name: Option<String>,
    /// Also `pm clear` the package.
    pub clear_package_data: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn selector_wire_format() {
        let profile = DeviceSelector::EmulatorProfile("pixel_7".into());
        let json = serde_json::to_value(&profile).expect("serialize");
        assert_eq!(json, serde_json::json!({"emulatorProfile": "pixel_7"}));

        let device: DeviceSelector =
            serde_json::from_value(serde_json::json!({"connectedDevice": "emulator-5554"}))
                .expect("deserialize");
        assert_eq!(device.connected_serial(), Some("emulator-5554"));
    }
}
