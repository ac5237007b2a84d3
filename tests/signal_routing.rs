mod common;

use common::{MockConductor, RecordingTracker, app_dna, attached, eventually, test_config};
use diorama::RunPlan;
use diorama::conductor::types::{DnaConfig, InstanceConfig};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

fn plan(tracker: Arc<RecordingTracker>) -> RunPlan {
    RunPlan::new(vec![
        InstanceConfig::for_agent("alice", DnaConfig::with_id("dist/alice.dna.json", "alice")),
        InstanceConfig::for_agent("bob", app_dna()),
    ])
    .with_tracker(tracker)
}

#[tokio::test]
async fn consistency_signal_reaches_tracker_with_logical_ids() {
    let mock = MockConductor::new();
    let tracker = Arc::new(RecordingTracker::default());
    let mut conductor = attached(&mock, test_config());
    conductor.initialize().await.expect("initialize");

    let signals = Arc::clone(&mock);
    let observed = Arc::clone(&tracker);
    conductor
        .run(&plan(Arc::clone(&tracker)), |instances| async move {
            signals.emit(json!({
                "signal": {
                    "signal_type": "Consistency",
                    "event": {"Commit": "QmEntry"},
                    "pending": [{"event": {"Hold": "QmEntry"}, "group": "Validators"}],
                },
                "instance_id": "alice-0",
            }));
            anyhow::ensure!(
                eventually(|| !observed.observations.lock().is_empty()).await,
                "no observation"
            );
            anyhow::ensure!(instances["alice"].signals().is_empty(), "consistency buffered");
            Ok(())
        })
        .await
        .expect("run");

    let observations = tracker.observations.lock();
    assert_eq!(observations.len(), 1);
    assert_eq!(observations[0].node, "alice");
    assert_eq!(observations[0].dna, "alice");
    assert_eq!(observations[0].signal["event"], json!("{\"Commit\":\"QmEntry\"}"));
    assert_eq!(
        observations[0].signal["pending"][0]["event"],
        json!("{\"Hold\":\"QmEntry\"}")
    );
}

#[tokio::test]
async fn other_signals_are_buffered_and_survive_teardown() {
    let mock = MockConductor::new();
    let mut conductor = attached(&mock, test_config());
    conductor.initialize().await.expect("initialize");
    let plan = plan(Arc::new(RecordingTracker::default()));

    let signals = Arc::clone(&mock);
    conductor
        .run(&plan, |instances| async move {
            for n in 0..3 {
                signals.emit(json!({
                    "signal": {"signal_type": "User", "name": "ping", "n": n},
                    "instance_id": "bob-0",
                }));
            }
            let bob = &instances["bob"];
            anyhow::ensure!(eventually(|| bob.signals().len() == 3).await, "signals missing");
            let order: Vec<_> = bob.signals().iter().map(|s| s.signal["n"].clone()).collect();
            anyhow::ensure!(order == vec![json!(0), json!(1), json!(2)], "order {order:?}");
            anyhow::ensure!(instances["alice"].signals().is_empty(), "leaked to alice");
            Ok(())
        })
        .await
        .expect("first run");

    conductor
        .run(&plan, |instances| async move {
            anyhow::ensure!(instances["bob"].signals().len() == 3, "buffer not carried over");
            Ok(())
        })
        .await
        .expect("second run");
}

#[tokio::test]
async fn signals_from_a_previous_run_are_dropped() {
    let mock = MockConductor::new();
    let mut conductor = attached(&mock, test_config());
    conductor.initialize().await.expect("initialize");
    let plan = plan(Arc::new(RecordingTracker::default()));

    conductor
        .run(&plan, |_| async { Ok(()) })
        .await
        .expect("first run");

    let signals = Arc::clone(&mock);
    conductor
        .run(&plan, |instances| async move {
            signals.emit(json!({"signal": {"signal_type": "User", "n": 0}, "instance_id": "bob-0"}));
            signals.emit(json!({"signal": {"signal_type": "User", "n": 1}, "instance_id": "bob-1"}));
            let bob = &instances["bob"];
            anyhow::ensure!(eventually(|| !bob.signals().is_empty()).await, "no signal");
            tokio::time::sleep(Duration::from_millis(50)).await;
            let received = bob.signals();
            anyhow::ensure!(received.len() == 1, "stale signal kept");
            anyhow::ensure!(received[0].signal["n"] == json!(1), "wrong signal kept");
            Ok(())
        })
        .await
        .expect("second run");
}

#[tokio::test]
async fn unroutable_signal_stops_routing() {
    let mock = MockConductor::new();
    let mut conductor = attached(&mock, test_config());
    conductor.initialize().await.expect("initialize");

    let signals = Arc::clone(&mock);
    conductor
        .run(&plan(Arc::new(RecordingTracker::default())), |instances| async move {
            signals.emit(json!({"signal": {"signal_type": "Consistency"}, "instance_id": "carol-0"}));
            signals.emit(json!({"signal": {"signal_type": "User"}, "instance_id": "bob-0"}));
            tokio::time::sleep(Duration::from_millis(100)).await;
            anyhow::ensure!(instances["bob"].signals().is_empty(), "routing continued");
            Ok(())
        })
        .await
        .expect("run");
}
