//! Scenario: merge converges regardless of arrival order.
//!
//! # Invariants under test
//!
//! 1. With distinct `created_at`, folding snapshots in any order yields the
//!    same price, attribution and `created_at`.
//! 2. The display name is decided by source priority, not arrival order.
//! 3. Re-applying a snapshot that already won is a content no-op.
//! 4. `ingested_at` is the maximum seen over the fold.

use chrono::{DateTime, TimeZone, Utc};
use mdr_reconcile::{merge, SourcePriority};
use mdr_schemas::{CanonicalRecord, PriceE8};

fn ts(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(1_717_000_000 + secs, 0).unwrap()
}

fn snap(source: &str, name: &str, price: &str, created: i64, ingested: i64) -> CanonicalRecord {
    CanonicalRecord {
        key: "ETH".into(),
        name: Some(name.into()),
        name_source: Some(source.into()),
        price: PriceE8::parse_decimal(price).unwrap(),
        market_cap_usd: None,
        volume_24h_usd: Some(1.0),
        percent_change_24h: None,
        source: source.into(),
        created_at: ts(created),
        ingested_at: ts(ingested),
    }
}

fn fold(order: &[&CanonicalRecord], p: &SourcePriority) -> CanonicalRecord {
    let mut acc: Option<CanonicalRecord> = None;
    for r in order {
        acc = Some(merge(acc.as_ref(), (*r).clone(), p).unwrap());
    }
    acc.unwrap()
}

#[test]
fn every_permutation_converges() {
    let p = SourcePriority::default();
    let a = snap("coinpaprika", "Ethereum", "3000.1", 10, 100);
    let b = snap("coingecko", "ethereum", "3001.25", 30, 50);
    let c = snap("csv", "ETH (file)", "2999", 20, 70);

    let perms: [[&CanonicalRecord; 3]; 6] = [
        [&a, &b, &c],
        [&a, &c, &b],
        [&b, &a, &c],
        [&b, &c, &a],
        [&c, &a, &b],
        [&c, &b, &a],
    ];

    for order in perms.iter() {
        let out = fold(order, &p);
        assert_eq!(out.price, PriceE8::parse_decimal("3001.25").unwrap());
        assert_eq!(out.source, "coingecko");
        assert_eq!(out.created_at, ts(30));
        assert_eq!(out.name.as_deref(), Some("Ethereum"));
        assert_eq!(out.name_source.as_deref(), Some("coinpaprika"), "{order:?}");
        assert_eq!(out.ingested_at, ts(100));
    }
}

#[test]
fn reapplying_winner_changes_nothing() {
    let p = SourcePriority::default();
    let a = snap("coinpaprika", "Ethereum", "3000", 10, 10);
    let b = snap("csv", "x", "3100", 20, 20);
    let once = fold(&[&a, &b], &p);
    let twice = merge(Some(&once), b.clone(), &p).unwrap();
    assert!(twice.same_content(&once));
}
