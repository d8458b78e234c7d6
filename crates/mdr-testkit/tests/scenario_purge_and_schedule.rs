//! Scenario: administrative purge and the interval scheduler.

use std::sync::Arc;
use std::time::Duration;

use mdr_db::IngestStore;
use mdr_md::SourceAdapter;
use mdr_runtime::{Orchestrator, OrchestratorConfig};
use mdr_testkit::{fixtures, InMemoryStore, ScriptedSource};
use tokio::sync::watch;

const T: &str = "2024-05-01T00:00:00Z";

fn orchestrator(store: &Arc<InMemoryStore>, sources: &[&Arc<ScriptedSource>]) -> Orchestrator {
    let sources: Vec<Arc<dyn SourceAdapter>> = sources
        .iter()
        .map(|s| Arc::clone(s) as Arc<dyn SourceAdapter>)
        .collect();
    Orchestrator::new(store.clone(), sources, OrchestratorConfig::default())
}

#[tokio::test]
async fn purge_removes_only_the_named_source() {
    let store = Arc::new(InMemoryStore::new());
    let api = Arc::new(ScriptedSource::http("coinpaprika"));
    let csv = Arc::new(ScriptedSource::csv("csv"));
    api.push_ok(vec![fixtures::ticker(
        "btc-bitcoin", "BTC", "Bitcoin", 100.0, None, T,
    )]);
    csv.push_ok(vec![
        fixtures::csv_row("0001", "eth", "3000", T),
        fixtures::csv_row("0002", "sol", "150", T),
    ]);
    let o = orchestrator(&store, &[&api, &csv]);
    o.run_once().await;

    let report = store.purge_source("csv").await.unwrap();
    assert_eq!(report.source, "csv");
    assert_eq!(report.canonical, 2);
    assert_eq!(report.runs, 1);
    assert_eq!(report.checkpoints, 1);
    assert_eq!(report.raw, 2);

    assert!(store.canonical("BTC").is_some());
    assert!(store.canonical("ETH").is_none());
    assert!(store.checkpoint("csv").is_none());
    assert!(store.checkpoint("coinpaprika").is_some());
    assert!(store.runs().iter().all(|r| r.source == "coinpaprika"));

    // Purging again is a no-op, not an error.
    let again = store.purge_source("csv").await.unwrap();
    assert_eq!(
        (again.canonical, again.runs, again.checkpoints, again.raw),
        (0, 0, 0, 0)
    );

    // The next cycle starts from scratch.
    csv.push_ok(vec![fixtures::csv_row("0001", "eth", "3000", T)]);
    o.run_once().await;
    assert_eq!(csv.seen_cursors().last().cloned().flatten(), None);
    assert!(store.canonical("ETH").is_some());
}

#[tokio::test(start_paused = true)]
async fn scheduler_sweeps_on_interval_until_shutdown() {
    let store = Arc::new(InMemoryStore::new());
    let csv = Arc::new(ScriptedSource::csv("csv"));
    let o = orchestrator(&store, &[&csv]);
    let (tx, rx) = watch::channel(false);

    // Ticks at 0s, 60s and 120s; shutdown at 150s.
    tokio::join!(o.run_forever(Duration::from_secs(60), rx), async {
        tokio::time::sleep(Duration::from_secs(150)).await;
        let _ = tx.send(true);
    });

    assert_eq!(store.runs().len(), 3);
    assert_eq!(csv.seen_cursors().len(), 3);
}

#[tokio::test]
async fn scheduler_stops_when_sender_dropped() {
    let store = Arc::new(InMemoryStore::new());
    let o = orchestrator(&store, &[]);
    let (tx, rx) = watch::channel(false);
    drop(tx);

    tokio::time::timeout(
        Duration::from_secs(5),
        o.run_forever(Duration::from_secs(3600), rx),
    )
    .await
    .expect("scheduler must exit once its shutdown sender is gone");
}
