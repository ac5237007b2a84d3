mod common;

use common::{MockConductor, RecordingTracker, app_dna, attached, test_config};
use diorama::conductor::ConsistencyTracker;
use diorama::conductor::types::{BridgeConfig, DnaConfig};
use diorama::scenario::{NetworkModel, ScenarioOutcome};
use diorama::{Decorator, Diorama};
use parking_lot::Mutex;
use serde_json::json;
use std::sync::Arc;

fn suite(mock: &Arc<MockConductor>) -> Diorama {
    Diorama::new(attached(mock, test_config()))
        .agent("alice", app_dna())
        .agent("bob", app_dna())
        .bridge(BridgeConfig::new("bob-bridge", "alice", "bob"))
}

#[tokio::test]
async fn scenarios_run_in_order_and_failures_are_reported() {
    let mock = MockConductor::new();
    let mut diorama = suite(&mock);
    diorama.register("passes", |_, _| async { Ok(()) });
    diorama.register("fails", |_, _| async { anyhow::bail!("expected 2 posts, got 1") });
    diorama.register("passes after failure", |_, instances| async move {
        anyhow::ensure!(instances["alice"].wire_id() == "alice-2", "nonce not advanced");
        Ok(())
    });

    let reports = diorama.run().await.expect("suite");
    let outcomes: Vec<_> = reports
        .iter()
        .map(|report| (report.description.as_str(), report.outcome.clone()))
        .collect();
    assert_eq!(
        outcomes,
        vec![
            ("passes", ScenarioOutcome::Passed),
            ("fails", ScenarioOutcome::Failed("expected 2 posts, got 1".into())),
            ("passes after failure", ScenarioOutcome::Passed),
        ]
    );
    diorama.close().await;
    assert!(!diorama.conductor().is_initialized());
}

#[tokio::test]
async fn only_scenarios_restrict_the_suite() {
    let mock = MockConductor::new();
    let mut diorama = suite(&mock);
    diorama.register("skipped", |_, _| async { Ok(()) });
    diorama.register_only("focused", |_, _| async { Ok(()) });
    diorama.register("also skipped", |_, _| async { Ok(()) });

    let reports = diorama.run().await.expect("suite");
    assert_eq!(reports.len(), 1);
    assert_eq!(reports[0].description, "focused");
    assert!(reports[0].passed());
    assert_eq!(mock.calls_to("start_instance").len(), 2);
}

#[tokio::test]
async fn each_scenario_gets_a_fresh_tracker_and_the_old_one_is_flushed() {
    let mock = MockConductor::new();
    let built: Arc<Mutex<Vec<(NetworkModel, Arc<RecordingTracker>)>>> = Arc::default();
    let factory_log = Arc::clone(&built);
    let mut diorama = suite(&mock)
        .agent("carol", DnaConfig::with_id("dist/chat.dna.json", "chat"))
        .tracker_factory(move |model: &NetworkModel| -> Arc<dyn ConsistencyTracker> {
            let tracker = Arc::new(RecordingTracker::default());
            factory_log.lock().push((model.clone(), Arc::clone(&tracker)));
            tracker
        });
    diorama.register("first", |api, _| async move {
        api.consistent().await;
        Ok(())
    });
    diorama.register("second", |_, _| async { Ok(()) });

    diorama.run().await.expect("suite");

    let built = built.lock();
    assert_eq!(built.len(), 2);
    let (model, first) = &built[0];
    assert_eq!(model["app"], vec!["alice", "bob"]);
    assert_eq!(model["chat"], vec!["carol"]);
    // once from the scenario, once when the second scenario replaced it
    assert_eq!(first.settle_count(), 2);
    assert_eq!(built[1].1.settle_count(), 0);
}

#[tokio::test]
async fn decorators_are_applied_before_the_scenario() {
    let mock = MockConductor::new();
    let tracker = Arc::new(RecordingTracker::default());
    let shared = Arc::clone(&tracker);
    let mut diorama = suite(&mock)
        .decorator(Decorator::CallSync)
        .decorator(Decorator::AgentId)
        .tracker_factory(move |_: &NetworkModel| -> Arc<dyn ConsistencyTracker> {
            Arc::clone(&shared) as Arc<dyn ConsistencyTracker>
        });
    diorama.register("call sync", |_, instances| async move {
        let alice = &instances["alice"];
        anyhow::ensure!(alice.agent_id() == Some("Hcalice"), "agent id missing");
        let result = alice
            .call_sync("blog", "create_post", json!({"content": "hi"}))
            .await?;
        anyhow::ensure!(result["content"] == "hi", "unexpected result {result}");
        Ok(())
    });

    let reports = diorama.run().await.expect("suite");
    assert!(reports[0].passed(), "{:?}", reports[0].outcome);
    assert_eq!(tracker.settle_count(), 1);
}

#[tokio::test]
async fn abort_stops_the_suite() {
    let mock = MockConductor::new();
    mock.fail_on("add_bridge");
    let mut diorama = suite(&mock);
    diorama.register("never runs", |_, _| async { Ok(()) });

    let err = diorama.run().await.expect_err("abort");
    assert!(err.is_abort());
}
