//! Scenario: checkpoints only move forward, and reruns are no-ops.
//!
//! # Invariants under test
//!
//! 1. After any cycle that processed at least one record the new `last_id`
//!    is >= the old one; failed or empty cycles leave it unchanged.
//! 2. Each fetch is handed the committed cursor.
//! 3. Re-delivered content causes no canonical write.

use std::sync::Arc;

use mdr_md::{FetchError, SourceAdapter};
use mdr_runtime::{Orchestrator, OrchestratorConfig};
use mdr_schemas::RunStatus;
use mdr_testkit::{fixtures, InMemoryStore, ScriptedSource};

const T: &str = "2024-05-01T00:00:00Z";

fn orchestrator(store: &Arc<InMemoryStore>, src: &Arc<ScriptedSource>) -> Orchestrator {
    Orchestrator::new(
        store.clone(),
        vec![Arc::clone(src) as Arc<dyn SourceAdapter>],
        OrchestratorConfig::default(),
    )
}

fn cursor(store: &InMemoryStore) -> Option<String> {
    store.checkpoint("csv").and_then(|c| c.last_id)
}

#[tokio::test]
async fn cursor_never_moves_backwards_across_mixed_cycles() {
    let store = Arc::new(InMemoryStore::new());
    let csv = Arc::new(ScriptedSource::csv("csv"));
    let o = orchestrator(&store, &csv);

    csv.push_ok(vec![
        fixtures::csv_row("0002", "eth", "3000", T),
        fixtures::csv_row("0001", "btc", "100", T),
    ]);
    csv.push_ok(vec![]);
    csv.push_err(FetchError::Io("disk unplugged".into()));
    // Only a malformed row: nothing processed, cursor stays.
    csv.push_ok(vec![fixtures::csv_row("0003", "sol", "n/a", T)]);
    csv.push_ok(vec![fixtures::csv_row("0004", "sol", "150", T)]);

    let mut seen = Vec::new();
    for _ in 0..5 {
        o.run_once().await;
        seen.push(cursor(&store));
    }

    assert_eq!(
        seen,
        vec![
            Some("0002".to_string()),
            Some("0002".to_string()),
            Some("0002".to_string()),
            Some("0002".to_string()),
            Some("0004".to_string()),
        ]
    );
    assert!(seen.windows(2).all(|w| w[0] <= w[1]));

    // Each fetch got the cursor committed by the previous cycle.
    assert_eq!(
        csv.seen_cursors(),
        vec![
            None,
            Some("0002".to_string()),
            Some("0002".to_string()),
            Some("0002".to_string()),
            Some("0002".to_string()),
        ]
    );
}

#[tokio::test]
async fn redelivered_content_writes_nothing() {
    let store = Arc::new(InMemoryStore::new());
    let csv = Arc::new(ScriptedSource::csv("csv"));
    let o = orchestrator(&store, &csv);

    csv.push_ok(vec![
        fixtures::csv_row("0001", "btc", "100", T),
        fixtures::csv_row("0002", "eth", "3000", T),
    ]);
    o.run_once().await;
    let writes = store.canonical_write_count();
    let btc = store.canonical("BTC").unwrap();

    // Same rows under new ids; nothing new in them.
    csv.push_ok(vec![
        fixtures::csv_row("0003", "btc", "100", T),
        fixtures::csv_row("0004", "eth", "3000", T),
    ]);
    let out = o.run_once().await;
    assert_eq!(out["csv"].status, RunStatus::Success);
    assert_eq!(out["csv"].processed, 2);
    assert_eq!(store.canonical_write_count(), writes);
    assert_eq!(store.canonical("BTC").unwrap(), btc);
    // The cursor still advances past what was consumed.
    assert_eq!(cursor(&store).as_deref(), Some("0004"));

    // Nothing new at all.
    let out = o.run_once().await;
    assert_eq!((out["csv"].processed, out["csv"].failed), (0, 0));
    assert_eq!(store.canonical_write_count(), writes);
}
