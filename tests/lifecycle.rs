mod common;

use common::{MockConductor, app_dna, attached, test_config};
use diorama::conductor::error::{ProvisionError, TransportError};
use diorama::conductor::orchestrator::RunPhase;
use diorama::conductor::types::InstanceConfig;
use diorama::{HarnessError, RunPlan};

fn alice_plan() -> RunPlan {
    RunPlan::new(vec![InstanceConfig::for_agent("alice", app_dna())])
}

#[tokio::test]
async fn run_requires_initialize() {
    let mock = MockConductor::new();
    let mut conductor = attached(&mock, test_config());
    let err = conductor
        .run(&alice_plan(), |_| async { Ok(()) })
        .await
        .expect_err("uninitialized run");
    assert!(matches!(err, HarnessError::NotInitialized));
    assert!(mock.methods().is_empty());
}

#[tokio::test]
async fn initialize_is_idempotent() {
    let mock = MockConductor::new();
    let mut conductor = attached(&mock, test_config());
    conductor.initialize().await.expect("first initialize");
    conductor.initialize().await.expect("second initialize");
    assert_eq!(mock.connects(), vec![common::ADMIN_URL]);
    assert!(conductor.is_initialized());
}

#[tokio::test]
async fn scenario_failure_tears_down_and_keeps_conductor() {
    let mock = MockConductor::new();
    let mut conductor = attached(&mock, test_config());
    conductor.initialize().await.expect("initialize");

    let err = conductor
        .run(&alice_plan(), |_| async { anyhow::bail!("assertion failed: 1 == 2") })
        .await
        .expect_err("scenario failure");
    match err {
        HarnessError::Scenario(inner) => assert_eq!(inner.to_string(), "assertion failed: 1 == 2"),
        other => panic!("unexpected error: {other}"),
    }
    assert!(!conductor.is_aborted());
    assert_eq!(mock.calls_to("remove_interface").len(), 1);

    conductor
        .run(&alice_plan(), |instances| async move {
            anyhow::ensure!(instances["alice"].wire_id() == "alice-1", "nonce not advanced");
            Ok(())
        })
        .await
        .expect("next run");
}

#[tokio::test]
async fn admin_failure_during_setup_aborts_without_cleanup() {
    let mock = MockConductor::new();
    mock.fail_on("add_instance");
    let mut conductor = attached(&mock, test_config());
    conductor.initialize().await.expect("initialize");

    let err = conductor
        .run(&alice_plan(), |_| async { anyhow::bail!("scenario must not run") })
        .await
        .expect_err("setup failure");
    assert!(err.is_abort());
    match err {
        HarnessError::Aborted(inner) => match *inner {
            HarnessError::Provision(ProvisionError::Rpc { method, source }) => {
                assert_eq!(method, "add_instance");
                assert!(matches!(source, TransportError::Rpc { code: -32000, .. }));
            }
            other => panic!("unexpected cause: {other}"),
        },
        other => panic!("unexpected error: {other}"),
    }
    assert!(mock.methods().iter().all(|method| !method.starts_with("remove")));
    assert!(conductor.is_aborted());
    assert!(!conductor.is_initialized());

    let err = conductor
        .run(&alice_plan(), |_| async { Ok(()) })
        .await
        .expect_err("run after abort");
    assert!(matches!(err, HarnessError::Unusable));
}

#[tokio::test]
async fn teardown_failure_aborts() {
    let mock = MockConductor::new();
    mock.fail_on("remove_interface");
    let mut conductor = attached(&mock, test_config());
    conductor.initialize().await.expect("initialize");

    let err = conductor
        .run(&alice_plan(), |_| async { Ok(()) })
        .await
        .expect_err("teardown failure");
    match err {
        HarnessError::Aborted(inner) => assert!(matches!(
            *inner,
            HarnessError::Provision(ProvisionError::Rpc { method: "remove_interface", .. })
        )),
        other => panic!("unexpected error: {other}"),
    }
    assert!(conductor.is_aborted());
}

#[tokio::test]
async fn phase_returns_to_idle_after_run() {
    let mock = MockConductor::new();
    let mut conductor = attached(&mock, test_config());
    conductor.initialize().await.expect("initialize");
    conductor
        .run(&alice_plan(), |_| async { Ok(()) })
        .await
        .expect("run");
    let orchestrator = conductor.orchestrator().expect("orchestrator");
    assert_eq!(orchestrator.phase(), RunPhase::Idle);
    assert!(orchestrator.state().agent("alice").is_some());
    assert!(orchestrator.state().dna("app").is_some());
    assert_eq!(
        orchestrator.state().instance("alice").map(|record| record.wire_id.to_string()),
        Some("alice-0".to_string())
    );
}
