//! Device manager
//!
//! Unified lease API over the emulator pool and physical devices. Enforces
//! mutual exclusion per serial and guarantees cleanup on release; a lease
//! that fails cleanup is discarded, never recycled.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::adb::{AdbHandle, CommandExecutor, DeviceState, list_connected_devices};
use crate::agent::{AgentDriver, AgentFactory};
use crate::config::OrchestratorConfig;
use crate::error::RunError;
use crate::runtime::CancelToken;

use super::emulator::EmulatorPool;
use super::lease::{AcquiredDevice, DeviceKind, DeviceSelector, LeaseState, ReleaseOpts};

struct PhysicalLease {
    lease_id: String,
    state: LeaseState,
    run_id: Option<String>,
    #[allow(dead_code)]
    project_id: Option<String>,
    agent: Option<Arc<dyn AgentDriver>>,
    acquired_at: Option<DateTime<Utc>>,
}

/// Facade the queue and executor lease devices through.
pub struct DeviceManager {
    emulators: Arc<EmulatorPool>,
    physical: Mutex<HashMap<String, PhysicalLease>>,
    executor: Arc<dyn CommandExecutor>,
    agents: Arc<dyn AgentFactory>,
    adb_path: PathBuf,
}

impl DeviceManager {
    #[must_use]
    pub fn new(
        config: &OrchestratorConfig,
        executor: Arc<dyn CommandExecutor>,
        agents: Arc<dyn AgentFactory>,
    ) -> Arc<Self> {
        let emulators = EmulatorPool::new(config, Arc::clone(&executor), Arc::clone(&agents));
        Arc::new(Self {
            emulators,
            physical: Mutex::new(HashMap::new()),
            executor,
            agents,
            adb_path: config.adb_path.clone(),
        })
    }

    #[must_use]
    pub fn emulator_pool(&self) -> &Arc<EmulatorPool> {
        &self.emulators
    }

    fn adb(&self, serial: &str) -> AdbHandle {
        AdbHandle::new(self.adb_path.clone(), serial, Arc::clone(&self.executor))
    }

    pub async fn initialize(&self) -> Result<()> {
        self.emulators.initialize().await
    }

    /// Lease the device a selector names, honoring the run's token.
    pub async fn acquire(
        &self,
        project_id: &str,
        selector: &DeviceSelector,
        run_id: &str,
        token: &CancelToken,
    ) -> Result<AcquiredDevice, RunError> {
        match selector {
            DeviceSelector::EmulatorProfile(profile) => {
                self.emulators.acquire(project_id, profile, run_id, token).await
            }
            DeviceSelector::ConnectedDevice(serial) => {
                self.acquire_physical(project_id, serial, run_id, token).await
            }
        }
    }

    async fn acquire_physical(
        &self,
        project_id: &str,
        serial: &str,
        run_id: &str,
        token: &CancelToken,
    ) -> Result<AcquiredDevice, RunError> {
        token.check()?;

        // Exclusivity check before touching ADB.
        {
            let leases = self.physical.lock().await;
            if let Some(lease) = leases.get(serial) {
                if lease.state == LeaseState::Acquired {
                    return Err(RunError::device(format!(
                        "device {serial} is already in use by another run"
                    )));
                }
            }
        }

        let devices = list_connected_devices(&self.executor, &self.adb_path)
            .await
            .map_err(|e| RunError::device(format!("failed to list devices: {e}")))?;
        let connected = devices.iter().find(|d| d.serial == serial);
        match connected {
            None => {
                return Err(RunError::device(format!("device {serial} is not connected")));
            }
            Some(device) if device.state == DeviceState::Unauthorized => {
                return Err(RunError::device(format!(
                    "device {serial} is unauthorized; accept the debugging prompt on the device"
                )));
            }
            Some(device) if device.state != DeviceState::Device => {
                return Err(RunError::device(format!(
                    "device {serial} is not ready (state {:?})",
                    device.state
                )));
            }
            Some(_) => {}
        }

        let adb = self.adb(serial);

        // Reuse the existing lease when its runtime is still healthy;
        // otherwise discard it and construct a fresh one.
        let existing_agent = {
            let mut leases = self.physical.lock().await;
            match leases.get(serial) {
                Some(lease) if lease.state == LeaseState::Idle => {
                    if adb.health_check().await {
                        lease.agent.clone()
                    } else {
                        debug!(serial, "stale idle lease failed health check, discarding");
                        leases.remove(serial);
                        None
                    }
                }
                _ => None,
            }
        };

        let agent = match existing_agent {
            Some(agent) => agent,
            None => {
                if !adb.health_check().await {
                    return Err(RunError::device(format!(
                        "device {serial} is not responding to adb"
                    )));
                }
                self.agents.android_agent(serial).await.map_err(|e| {
                    RunError::device(format!(
                        "failed to attach agent runtime to {serial}: {e}"
                    ))
                })?
            }
        };

        token.check()?;

        let lease_id = Uuid::new_v4().to_string();
        let acquired_at = Utc::now();
        {
            let mut leases = self.physical.lock().await;
            if let Some(lease) = leases.get(serial) {
                if lease.state == LeaseState::Acquired {
                    return Err(RunError::device(format!(
                        "device {serial} is already in use by another run"
                    )));
                }
            }
            leases.insert(
                serial.to_string(),
                PhysicalLease {
                    lease_id: lease_id.clone(),
                    state: LeaseState::Acquired,
                    run_id: Some(run_id.to_string()),
                    project_id: Some(project_id.to_string()),
                    agent: Some(Arc::clone(&agent)),
                    acquired_at: Some(acquired_at),
                },
            );
        }
        info!(serial, run_id, "physical device acquired");

        Ok(AcquiredDevice {
            lease_id,
            kind: DeviceKind::Physical,
            serial: serial.to_string(),
            avd_name: None,
            adb,
            agent,
            acquired_at,
        })
    }

    /// Release a lease, running cleanup. Cleanup failure discards the lease.
    pub async fn release(&self, device: &AcquiredDevice, opts: &ReleaseOpts) {
        match device.kind {
            DeviceKind::Emulator => self.emulators.release(device, opts).await,
            DeviceKind::Physical => self.release_physical(device, opts).await,
        }
    }

    async fn release_physical(&self, device: &AcquiredDevice, opts: &ReleaseOpts) {
        {
            let mut leases = self.physical.lock().await;
            if let Some(lease) = leases.get_mut(&device.serial) {
                lease.state = LeaseState::Cleaning;
            }
        }

        let mut ok = true;
        if let Some(package) = &opts.package_name {
            if let Err(e) = device.adb.force_stop(package).await {
                warn!(package, "force-stop failed during release: {e}");
                ok = false;
            } else if opts.clear_package_data {
                if let Err(e) = device.adb.clear_package_data(package).await {
                    warn!(package, "pm clear failed during release: {e}");
                    ok = false;
                }
            }
        }
        if ok {
            if let Err(e) = device.adb.press_home().await {
                warn!(serial = %device.serial, "HOME keyevent failed during release: {e}");
                ok = false;
            }
        }
        if ok {
            ok = device.adb.health_check().await;
        }

        let mut leases = self.physical.lock().await;
        if ok {
            if let Some(lease) = leases.get_mut(&device.serial) {
                lease.state = LeaseState::Idle;
                lease.run_id = None;
                lease.acquired_at = None;
            }
            debug!(serial = %device.serial, "physical lease recycled to idle");
        } else {
            warn!(serial = %device.serial, "cleanup failed, discarding physical lease");
            leases.remove(&device.serial);
        }
    }

    /// Whether the batch of selectors can be satisfied right now.
    ///
    /// A serial appearing twice in the batch, or currently acquired, makes
    /// the batch infeasible. Emulator profiles are checked against the pool.
    pub async fn can_acquire_batch_immediately(&self, requests: &[DeviceSelector]) -> bool {
        let mut profiles = Vec::new();
        let mut serials: Vec<&str> = Vec::new();
        for request in requests {
            match request {
                DeviceSelector::EmulatorProfile(profile) => profiles.push(profile.clone()),
                DeviceSelector::ConnectedDevice(serial) => {
                    if serials.contains(&serial.as_str()) {
                        return false;
                    }
                    serials.push(serial.as_str());
                }
            }
        }

        if !serials.is_empty() {
            {
                let leases = self.physical.lock().await;
                for serial in &serials {
                    if let Some(lease) = leases.get(*serial) {
                        if lease.state == LeaseState::Acquired {
                            return false;
                        }
                    }
                }
            }
            let connected = match list_connected_devices(&self.executor, &self.adb_path).await {
                Ok(devices) => devices,
                Err(e) => {
                    warn!("failed to list devices for batch check: {e}");
                    return false;
                }
            };
            for serial in &serials {
                let ready = connected
                    .iter()
                    .any(|d| d.serial == *serial && d.state == DeviceState::Device);
                if !ready {
                    return false;
                }
            }
        }

        if profiles.is_empty() {
            true
        } else {
            self.emulators.can_acquire_batch_immediately(&profiles).await
        }
    }

    /// Stop an emulator instance by lease id. Physical devices cannot be
    /// stopped through the pool API.
    pub async fn stop(&self, id: &str) -> Result<()> {
        if self.emulators.stop(id).await {
            return Ok(());
        }
        let leases = self.physical.lock().await;
        if leases.values().any(|l| l.lease_id == id) {
            anyhow::bail!("stop supports emulators only");
        }
        anyhow::bail!("no emulator instance with id {id}");
    }

    pub async fn stop_connected_emulator(&self, serial: &str) -> Result<()> {
        self.emulators.stop_connected_emulator(serial).await
    }

    pub async fn stop_idle_emulators_for_profiles(&self, profiles: &[String]) {
        self.emulators.stop_idle_emulators_for_profiles(profiles).await;
    }

    /// Installed packages on a device, by serial.
    pub async fn list_installed_packages(&self, serial: &str) -> Result<Vec<String>> {
        self.adb(serial).list_packages().await
    }

    /// Abort everything. Used by the shutdown hook.
    pub async fn shutdown(&self) {
        self.emulators.shutdown().await;
        self.physical.lock().await.clear();
    }

    /// State of the physical lease for a serial, for introspection and tests.
    pub async fn physical_lease_state(&self, serial: &str) -> Option<LeaseState> {
        self.physical.lock().await.get(serial).map(|l| l.state)
    }
}
