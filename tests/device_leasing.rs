//! Device lease exclusivity and batch feasibility

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{Harness, SERIAL, android_run, fast_config, script_healthy_device};
use uitest_orchestrator::DeviceSelector;
use uitest_orchestrator::adb::MockCommandExecutor;
use uitest_orchestrator::agent::mock::MockAgent;
use uitest_orchestrator::events::RunStatus;
use uitest_orchestrator::runtime::CancelToken;

fn slow_agent(delay_ms: u64) -> Arc<MockAgent> {
    let agent = MockAgent::new();
    agent.set_act_delay(Duration::from_millis(delay_ms));
    agent
}

fn android_harness() -> Harness {
    let adb = script_healthy_device(MockCommandExecutor::permissive(), SERIAL);
    Harness::with_adb(fast_config(), adb)
}

#[tokio::test]
async fn one_lease_per_serial_at_a_time() {
    let harness = android_harness();
    for _ in 0..2 {
        harness.agents.queue_agent(slow_agent(800));
    }

    // Different projects, same physical device.
    harness.submit(android_run("r1", "project-a", SERIAL)).await;
    harness.submit(android_run("r2", "project-b", SERIAL)).await;

    harness.wait_for_status("r1", RunStatus::Running).await;
    assert_eq!(
        harness.repository.run("r2").await.expect("r2 row").status,
        RunStatus::Queued,
        "second run must wait for the serial"
    );

    harness.wait_for_status("r1", RunStatus::Pass).await;
    harness.wait_for_status("r2", RunStatus::Pass).await;

    // The lease ends parked, not acquired.
    let state = harness
        .orchestrator
        .device_manager
        .physical_lease_state(SERIAL)
        .await;
    assert_ne!(state, Some(uitest_orchestrator::LeaseState::Acquired));
}

#[tokio::test]
async fn duplicate_serial_in_batch_is_infeasible() {
    let harness = android_harness();
    let selector = DeviceSelector::ConnectedDevice(SERIAL.to_string());
    let feasible = harness
        .orchestrator
        .device_manager
        .can_acquire_batch_immediately(&[selector.clone(), selector])
        .await;
    assert!(!feasible);
}

#[tokio::test]
async fn single_serial_batch_is_feasible_when_connected() {
    let harness = android_harness();
    let feasible = harness
        .orchestrator
        .device_manager
        .can_acquire_batch_immediately(&[DeviceSelector::ConnectedDevice(SERIAL.to_string())])
        .await;
    assert!(feasible);
}

#[tokio::test]
async fn disconnected_serial_is_rejected() {
    let adb = MockCommandExecutor::permissive()
        .with_success("adb", &["devices"], "List of devices attached\n");
    let harness = Harness::with_adb(fast_config(), adb);

    let token = CancelToken::new();
    let result = harness
        .orchestrator
        .device_manager
        .acquire(
            "project-a",
            &DeviceSelector::ConnectedDevice("R5CT000".to_string()),
            "r1",
            &token,
        )
        .await;
    let err = result.err().expect("must reject disconnected serial");
    assert!(err.to_string().contains("not connected"));
}

#[tokio::test]
async fn unauthorized_serial_is_rejected() {
    let adb = MockCommandExecutor::permissive().with_success(
        "adb",
        &["devices"],
        "List of devices attached\nR5CT000\tunauthorized\n",
    );
    let harness = Harness::with_adb(fast_config(), adb);

    let token = CancelToken::new();
    let result = harness
        .orchestrator
        .device_manager
        .acquire(
            "project-a",
            &DeviceSelector::ConnectedDevice("R5CT000".to_string()),
            "r1",
            &token,
        )
        .await;
    let err = result.err().expect("must reject unauthorized serial");
    assert!(err.to_string().contains("unauthorized"));
}

#[tokio::test]
async fn stop_rejects_physical_leases() {
    let harness = android_harness();
    let token = CancelToken::new();
    let device = harness
        .orchestrator
        .device_manager
        .acquire(
            "project-a",
            &DeviceSelector::ConnectedDevice(SERIAL.to_string()),
            "r1",
            &token,
        )
        .await
        .expect("acquire healthy device");

    let err = harness
        .orchestrator
        .device_manager
        .stop(&device.lease_id)
        .await
        .expect_err("stop must reject physical devices");
    assert!(err.to_string().contains("emulators only"));
}

#[tokio::test]
async fn cancelled_token_aborts_acquire() {
    let harness = android_harness();
    let token = CancelToken::new();
    token.cancel();
    let result = harness
        .orchestrator
        .device_manager
        .acquire(
            "project-a",
            &DeviceSelector::ConnectedDevice(SERIAL.to_string()),
            "r1",
            &token,
        )
        .await;
    assert!(matches!(
        result,
        Err(uitest_orchestrator::RunError::Cancelled)
    ));
}
