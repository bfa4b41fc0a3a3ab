//! Android target preparation
//!
//! Acquires the device lease, verifies and prepares the app, launches it,
//! and waits for it to reach the foreground. Any failure after acquisition
//! releases the lease before surfacing.

use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use crate::agent::AgentFactory;
use crate::config::OrchestratorConfig;
use crate::device_pool::{AcquiredDevice, DeviceManager, DeviceSelector, ReleaseOpts};
use crate::error::RunError;
use crate::events::{LogLevel, RunEvent};
use crate::executor::types::EventSink;
use crate::runtime::{CancelToken, with_deadline};

const FOREGROUND_POLL: Duration = Duration::from_secs(1);

pub(crate) struct AndroidTargetSpec<'a> {
    pub target_id: &'a str,
    pub device: &'a DeviceSelector,
    pub app_id: &'a str,
    pub clear_app_state: bool,
    pub allow_all_permissions: bool,
}

/// Acquire and prepare a device for one Android target.
#[allow(clippy::too_many_arguments)]
pub(crate) async fn prepare_android_target(
    manager: &Arc<DeviceManager>,
    agents: &Arc<dyn AgentFactory>,
    orch: &OrchestratorConfig,
    project_id: &str,
    run_id: &str,
    api_key: &str,
    spec: AndroidTargetSpec<'_>,
    token: &CancelToken,
    emit: &EventSink,
) -> Result<AcquiredDevice, RunError> {
    let device = manager
        .acquire(project_id, spec.device, run_id, token)
        .await?;
    info!(
        target = spec.target_id,
        serial = %device.serial,
        "device lease acquired"
    );

    match prepare_acquired(&device, agents, orch, api_key, &spec, emit).await {
        Ok(()) => Ok(device),
        Err(e) => {
            let opts = ReleaseOpts {
                package_name: Some(spec.app_id.to_string()),
                clear_package_data: false,
            };
            manager.release(&device, &opts).await;
            Err(e)
        }
    }
}

async fn prepare_acquired(
    device: &AcquiredDevice,
    agents: &Arc<dyn AgentFactory>,
    orch: &OrchestratorConfig,
    api_key: &str,
    spec: &AndroidTargetSpec<'_>,
    emit: &EventSink,
) -> Result<(), RunError> {
    let app_id = spec.app_id;
    let adb = &device.adb;

    let installed = adb
        .is_package_installed(app_id)
        .await
        .map_err(|e| RunError::device(format!("could not query packages: {e}")))?;
    if !installed {
        return Err(RunError::config(format!(
            "App {app_id} is not installed on device {}",
            device.serial
        )));
    }

    if spec.clear_app_state {
        adb.clear_package_data(app_id)
            .await
            .map_err(|e| RunError::device(format!("failed to clear app data: {e}")))?;
    }

    if spec.allow_all_permissions {
        // Best-effort: individual grant failures are informational.
        match adb.requested_permissions(app_id).await {
            Ok(permissions) => {
                for permission in permissions {
                    if let Err(e) = adb.grant_permission(app_id, &permission).await {
                        emit(
                            RunEvent::log(
                                LogLevel::Warn,
                                format!("Could not grant {permission}: {e}"),
                            )
                            .with_browser_id(spec.target_id.to_string()),
                        );
                    }
                }
            }
            Err(e) => {
                warn!(app_id, "could not enumerate permissions: {e}");
            }
        }
    }

    agents
        .configure_android_agent(&device.agent, api_key)
        .await
        .map_err(|e| RunError::device(format!("failed to configure agent runtime: {e}")))?;

    // Prefer the agent launch; fall back to the monkey launcher intent.
    let launched = with_deadline(
        async {
            device
                .agent
                .launch(app_id)
                .await
                .map_err(|e| RunError::device(e.to_string()))
        },
        Duration::from_secs(30),
        "app launch",
    )
    .await;
    if let Err(e) = launched {
        emit(
            RunEvent::log(
                LogLevel::Info,
                format!("Agent launch failed ({e}), falling back to launcher intent"),
            )
            .with_browser_id(spec.target_id.to_string()),
        );
        adb.monkey_launch(app_id)
            .await
            .map_err(|e| RunError::device(format!("failed to launch {app_id}: {e}")))?;
    }

    wait_for_foreground(device, app_id, orch.app_foreground_deadline).await
}

async fn wait_for_foreground(
    device: &AcquiredDevice,
    app_id: &str,
    deadline: Duration,
) -> Result<(), RunError> {
    let poll = async {
        loop {
            match device.adb.is_package_in_foreground(app_id).await {
                Ok(true) => return,
                Ok(false) | Err(_) => tokio::time::sleep(FOREGROUND_POLL).await,
            }
        }
    };
    if tokio::time::timeout(deadline, poll).await.is_err() {
        return Err(RunError::device(format!(
            "App {app_id} did not reach the foreground within {}s",
            deadline.as_secs()
        )));
    }
    Ok(())
}
