//! Emulator pool
//!
//! Starts, tracks, and reuses emulator instances keyed by AVD profile name.
//! Booting is gated by a global ceiling; blocked acquirers wait on a slot
//! notification and observe the run's cancellation token. All state lives
//! behind one mutex; long operations (boot waits, health checks) run with
//! the lock released.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, Notify};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::adb::{AdbHandle, CommandExecutor, ShellOpts, list_connected_devices};
use crate::agent::{AgentDriver, AgentFactory};
use crate::config::OrchestratorConfig;
use crate::error::RunError;
use crate::runtime::CancelToken;

use super::lease::{AcquiredDevice, DeviceKind, LeaseState, ReleaseOpts};

/// First emulator console port. Serials are `emulator-<port>`.
const BASE_CONSOLE_PORT: u16 = 5554;

#[derive(Clone)]
struct EmulatorInstance {
    id: String,
    avd_name: String,
    serial: String,
    state: LeaseState,
    project_id: Option<String>,
    run_id: Option<String>,
    started_at: DateTime<Utc>,
    acquired_at: Option<DateTime<Utc>>,
    agent: Option<Arc<dyn AgentDriver>>,
}

struct PoolState {
    instances: Vec<EmulatorInstance>,
    next_port: u16,
    initialized: bool,
}

/// Pool of emulator instances keyed by AVD profile.
pub struct EmulatorPool {
    adb_path: PathBuf,
    emulator_path: PathBuf,
    max_concurrent: usize,
    boot_timeout: Duration,
    executor: Arc<dyn CommandExecutor>,
    agents: Arc<dyn AgentFactory>,
    state: Mutex<PoolState>,
    slot_freed: Notify,
}

impl EmulatorPool {
    #[must_use]
    pub fn new(
        config: &OrchestratorConfig,
        executor: Arc<dyn CommandExecutor>,
        agents: Arc<dyn AgentFactory>,
    ) -> Arc<Self> {
        Arc::new(Self {
            adb_path: config.adb_path.clone(),
            emulator_path: config.emulator_path.clone(),
            max_concurrent: config.max_concurrent_emulators,
            boot_timeout: config.emulator_boot_timeout,
            executor,
            agents,
            state: Mutex::new(PoolState {
                instances: Vec::new(),
                next_port: BASE_CONSOLE_PORT,
                initialized: false,
            }),
            slot_freed: Notify::new(),
        })
    }

    fn adb(&self, serial: &str) -> AdbHandle {
        AdbHandle::new(self.adb_path.clone(), serial, Arc::clone(&self.executor))
    }

    /// Idempotent warm-up: discover already-running emulator serials and
    /// adopt the healthy ones as `Idle`.
    pub async fn initialize(&self) -> Result<()> {
        {
            let state = self.state.lock().await;
            if state.initialized {
                return Ok(());
            }
        }

        let devices = list_connected_devices(&self.executor, &self.adb_path)
            .await
            .unwrap_or_default();

        let mut adopted = Vec::new();
        for device in devices {
            if !device.serial.starts_with("emulator-") {
                continue;
            }
            let adb = self.adb(&device.serial);
            if !adb.health_check().await {
                debug!(serial = %device.serial, "skipping unhealthy emulator during warm-up");
                continue;
            }
            let avd_name = match adb.shell(&["getprop", "ro.boot.qemu.avd_name"], ShellOpts::quick()).await {
                Ok(output) if !output.trim().is_empty() => output.trim().to_string(),
                _ => {
                    debug!(serial = %device.serial, "could not resolve AVD name, skipping");
                    continue;
                }
            };
            adopted.push((device.serial, avd_name));
        }

        let mut state = self.state.lock().await;
        for (serial, avd_name) in adopted {
            let port = serial
                .strip_prefix("emulator-")
                .and_then(|p| p.parse::<u16>().ok())
                .unwrap_or(BASE_CONSOLE_PORT);
            state.next_port = state.next_port.max(port + 2);
            info!(serial, avd_name, "adopted running emulator as idle");
            state.instances.push(EmulatorInstance {
                id: Uuid::new_v4().to_string(),
                avd_name,
                serial,
                state: LeaseState::Idle,
                project_id: None,
                run_id: None,
                started_at: Utc::now(),
                acquired_at: None,
                agent: None,
            });
        }
        state.initialized = true;
        Ok(())
    }

    /// Whether the requested multiset of profiles can all be leased right
    /// now, without exceeding the global ceiling and without reusing an
    /// instance twice within the batch.
    pub async fn can_acquire_batch_immediately(&self, profiles: &[String]) -> bool {
        let state = self.state.lock().await;
        let mut idle_by_profile: std::collections::HashMap<&str, usize> =
            std::collections::HashMap::new();
        let mut live = 0usize;
        for instance in &state.instances {
            if instance.state != LeaseState::Dead {
                live += 1;
            }
            if instance.state == LeaseState::Idle {
                *idle_by_profile.entry(instance.avd_name.as_str()).or_default() += 1;
            }
        }
        let mut free_slots = self.max_concurrent.saturating_sub(live);

        for profile in profiles {
            let idle = idle_by_profile.entry(profile.as_str()).or_default();
            if *idle > 0 {
                *idle -= 1;
            } else if free_slots > 0 {
                free_slots -= 1;
            } else {
                return false;
            }
        }
        true
    }

    /// Boot a fresh emulator for the profile and wait for it to be ready.
    /// Returns the serial of the new instance, left in `Idle`.
    pub async fn boot(&self, project_id: &str, avd_name: &str) -> Result<String, RunError> {
        let (id, serial) = {
            let mut state = self.state.lock().await;
            let live = state
                .instances
                .iter()
                .filter(|i| i.state != LeaseState::Dead)
                .count();
            if live >= self.max_concurrent {
                return Err(RunError::device(format!(
                    "emulator ceiling of {} reached",
                    self.max_concurrent
                )));
            }
            let port = state.next_port;
            state.next_port += 2;
            let serial = format!("emulator-{port}");
            let id = Uuid::new_v4().to_string();
            state.instances.push(EmulatorInstance {
                id: id.clone(),
                avd_name: avd_name.to_string(),
                serial: serial.clone(),
                state: LeaseState::Starting,
                project_id: Some(project_id.to_string()),
                run_id: None,
                started_at: Utc::now(),
                acquired_at: None,
                agent: None,
            });
            (id, serial)
        };

        match self.boot_and_wait(&id, avd_name, &serial).await {
            Ok(()) => Ok(serial),
            Err(e) => {
                self.discard(&id).await;
                Err(e)
            }
        }
    }

    async fn boot_and_wait(
        &self,
        id: &str,
        avd_name: &str,
        serial: &str,
    ) -> Result<(), RunError> {
        let port = serial.strip_prefix("emulator-").unwrap_or("5554");
        info!(avd_name, serial, "starting emulator");
        let args = [
            "-avd",
            avd_name,
            "-port",
            port,
            "-no-window",
            "-no-audio",
            "-no-boot-anim",
        ];
        self.executor
            .spawn(&self.emulator_path, &args)
            .await
            .map_err(|e| RunError::device(format!("failed to start emulator {avd_name}: {e}")))?;

        self.set_state(id, LeaseState::Booting).await;

        let adb = self.adb(serial);
        let booted = tokio::time::timeout(self.boot_timeout, async {
            loop {
                if let Ok(value) = adb.get_prop("sys.boot_completed").await {
                    if value == "1" {
                        // Boot prop flips before the package manager is
                        // usable; probe it too.
                        if let Ok(output) =
                            adb.shell(&["pm", "path", "android"], ShellOpts::quick()).await
                        {
                            if output.contains("package:") {
                                return;
                            }
                        }
                    }
                }
                tokio::time::sleep(Duration::from_secs(2)).await;
            }
        })
        .await;

        if booted.is_err() {
            return Err(RunError::device(format!(
                "emulator {avd_name} ({serial}) did not finish booting within {}s",
                self.boot_timeout.as_secs()
            )));
        }

        self.set_state(id, LeaseState::Idle).await;
        info!(avd_name, serial, "emulator booted");
        Ok(())
    }

    /// Lease an instance for the profile.
    ///
    /// Prefers a healthy idle instance (discarding unhealthy ones), boots a
    /// fresh one under the ceiling, and otherwise blocks until a slot frees
    /// or the token fires.
    pub async fn acquire(
        &self,
        project_id: &str,
        avd_name: &str,
        run_id: &str,
        token: &CancelToken,
    ) -> Result<AcquiredDevice, RunError> {
        loop {
            token.check()?;

            // Try an idle instance first.
            let candidate = {
                let mut state = self.state.lock().await;
                let found = state
                    .instances
                    .iter_mut()
                    .find(|i| i.state == LeaseState::Idle && i.avd_name == avd_name);
                match found {
                    Some(instance) => {
                        // Claimed while health-checking so no one else grabs it.
                        instance.state = LeaseState::Acquired;
                        instance.run_id = Some(run_id.to_string());
                        instance.project_id = Some(project_id.to_string());
                        instance.acquired_at = Some(Utc::now());
                        Some((instance.id.clone(), instance.serial.clone(), instance.agent.clone()))
                    }
                    None => None,
                }
            };

            if let Some((id, serial, existing_agent)) = candidate {
                let adb = self.adb(&serial);
                if !adb.health_check().await {
                    warn!(serial, "idle emulator failed health check, discarding");
                    self.discard(&id).await;
                    continue;
                }
                return self.finish_acquire(&id, &serial, existing_agent).await;
            }

            // No idle instance: boot one if a slot is free, else wait.
            let can_boot = {
                let state = self.state.lock().await;
                state
                    .instances
                    .iter()
                    .filter(|i| i.state != LeaseState::Dead)
                    .count()
                    < self.max_concurrent
            };

            if can_boot {
                let serial = self.boot(project_id, avd_name).await?;
                let id = {
                    let mut state = self.state.lock().await;
                    match state
                        .instances
                        .iter_mut()
                        .find(|i| i.serial == serial && i.state == LeaseState::Idle)
                    {
                        Some(instance) => {
                            instance.state = LeaseState::Acquired;
                            instance.run_id = Some(run_id.to_string());
                            instance.project_id = Some(project_id.to_string());
                            instance.acquired_at = Some(Utc::now());
                            instance.id.clone()
                        }
                        // Someone stopped it between boot and claim; retry.
                        None => continue,
                    }
                };
                return self.finish_acquire(&id, &serial, None).await;
            }

            debug!(avd_name, run_id, "emulator ceiling reached, waiting for a slot");
            // Timeout fallback: a slot freed between the ceiling check and
            // the waiter registration would otherwise be missed forever.
            let notified = self.slot_freed.notified();
            tokio::select! {
                _ = token.cancelled() => return Err(RunError::Cancelled),
                _ = notified => {}
                _ = tokio::time::sleep(Duration::from_millis(500)) => {}
            }
        }
    }

    async fn finish_acquire(
        &self,
        id: &str,
        serial: &str,
        existing_agent: Option<Arc<dyn AgentDriver>>,
    ) -> Result<AcquiredDevice, RunError> {
        let agent = match existing_agent {
            Some(agent) => agent,
            None => match self.agents.android_agent(serial).await {
                Ok(agent) => {
                    let mut state = self.state.lock().await;
                    if let Some(instance) = state.instances.iter_mut().find(|i| i.id == id) {
                        instance.agent = Some(Arc::clone(&agent));
                    }
                    agent
                }
                Err(e) => {
                    warn!(serial, "agent runtime attach failed: {e}");
                    self.discard(id).await;
                    return Err(RunError::device(format!(
                        "failed to attach agent runtime to {serial}: {e}"
                    )));
                }
            },
        };

        let (avd_name, acquired_at) = {
            let state = self.state.lock().await;
            let instance = state
                .instances
                .iter()
                .find(|i| i.id == id)
                .ok_or_else(|| RunError::device(format!("lease {id} vanished during acquire")))?;
            (
                instance.avd_name.clone(),
                instance.acquired_at.unwrap_or_else(Utc::now),
            )
        };

        Ok(AcquiredDevice {
            lease_id: id.to_string(),
            kind: DeviceKind::Emulator,
            serial: serial.to_string(),
            avd_name: Some(avd_name),
            adb: self.adb(serial),
            agent,
            acquired_at,
        })
    }

    /// Release a lease back to the pool.
    ///
    /// Runs the cleanup sequence (optional force-stop and `pm clear`, HOME
    /// key, health check). Any cleanup failure discards the instance instead
    /// of recycling it.
    pub async fn release(&self, device: &AcquiredDevice, opts: &ReleaseOpts) {
        self.set_state(&device.lease_id, LeaseState::Cleaning).await;

        let cleanup_ok = self.cleanup_device(&device.adb, opts).await;
        if cleanup_ok {
            let mut state = self.state.lock().await;
            if let Some(instance) = state
                .instances
                .iter_mut()
                .find(|i| i.id == device.lease_id)
            {
                instance.state = LeaseState::Idle;
                instance.run_id = None;
                instance.project_id = None;
                instance.acquired_at = None;
            }
            drop(state);
            self.slot_freed.notify_waiters();
            debug!(serial = %device.serial, "emulator recycled to idle");
        } else {
            warn!(serial = %device.serial, "cleanup failed, discarding emulator");
            self.discard(&device.lease_id).await;
        }
    }

    async fn cleanup_device(&self, adb: &AdbHandle, opts: &ReleaseOpts) -> bool {
        if let Some(package) = &opts.package_name {
            if let Err(e) = adb.force_stop(package).await {
                warn!(package, "force-stop failed during release: {e}");
                return false;
            }
            if opts.clear_package_data {
                if let Err(e) = adb.clear_package_data(package).await {
                    warn!(package, "pm clear failed during release: {e}");
                    return false;
                }
            }
        }
        if let Err(e) = adb.press_home().await {
            warn!("HOME keyevent failed during release: {e}");
            return false;
        }
        adb.health_check().await
    }

    /// Terminate an idle (or otherwise non-acquired) emulator by lease id.
    /// Returns false when the id is unknown or the instance is acquired.
    pub async fn stop(&self, id: &str) -> bool {
        let serial = {
            let mut state = self.state.lock().await;
            let Some(pos) = state.instances.iter().position(|i| i.id == id) else {
                return false;
            };
            if state.instances[pos].state == LeaseState::Acquired {
                return false;
            }
            let instance = state.instances.remove(pos);
            instance.serial
        };
        let _ = self.adb(&serial).emulator_kill().await;
        self.slot_freed.notify_waiters();
        true
    }

    /// Terminate idle emulators whose profile is in `profiles`.
    pub async fn stop_idle_emulators_for_profiles(&self, profiles: &[String]) {
        let victims: Vec<(String, String)> = {
            let mut state = self.state.lock().await;
            let mut victims = Vec::new();
            state.instances.retain(|instance| {
                let stop = instance.state == LeaseState::Idle
                    && profiles.iter().any(|p| p == &instance.avd_name);
                if stop {
                    victims.push((instance.id.clone(), instance.serial.clone()));
                }
                !stop
            });
            victims
        };
        for (id, serial) in victims {
            info!(serial, lease_id = %id, "stopping idle emulator");
            let _ = self.adb(&serial).emulator_kill().await;
        }
        self.slot_freed.notify_waiters();
    }

    /// Terminate a tracked emulator by serial, refusing acquired ones.
    pub async fn stop_connected_emulator(&self, serial: &str) -> Result<()> {
        {
            let mut state = self.state.lock().await;
            if let Some(pos) = state.instances.iter().position(|i| i.serial == serial) {
                if state.instances[pos].state == LeaseState::Acquired {
                    anyhow::bail!("emulator {serial} is acquired by a run");
                }
                state.instances.remove(pos);
            }
        }
        self.adb(serial).emulator_kill().await?;
        self.slot_freed.notify_waiters();
        Ok(())
    }

    /// Kill everything. Used by the shutdown hook.
    pub async fn shutdown(&self) {
        let serials: Vec<String> = {
            let mut state = self.state.lock().await;
            let serials = state.instances.iter().map(|i| i.serial.clone()).collect();
            state.instances.clear();
            serials
        };
        for serial in serials {
            let _ = self.adb(&serial).emulator_kill().await;
        }
    }

    async fn set_state(&self, id: &str, new_state: LeaseState) {
        let mut state = self.state.lock().await;
        if let Some(instance) = state.instances.iter_mut().find(|i| i.id == id) {
            instance.state = new_state;
        }
    }

    /// Mark dead and drop. Dead instances are never reused.
    async fn discard(&self, id: &str) {
        let serial = {
            let mut state = self.state.lock().await;
            if let Some(pos) = state.instances.iter().position(|i| i.id == id) {
                state.instances[pos].state = LeaseState::Dead;
                let instance = state.instances.remove(pos);
                Some(instance.serial)
            } else {
                None
            }
        };
        if let Some(serial) = serial {
            let _ = self.adb(&serial).emulator_kill().await;
        }
        self.slot_freed.notify_waiters();
    }

    /// Snapshot of `(profile, state)` pairs, for introspection and tests.
    pub async fn instance_states(&self) -> Vec<(String, LeaseState)> {
        self.state
            .lock()
            .await
            .instances
            .iter()
            .map(|i| (i.avd_name.clone(), i.state))
            .collect()
    }
}
