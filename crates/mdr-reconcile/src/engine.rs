//! Canonical record merge.
//!
//! # Invariants
//!
//! - **Pure**: no IO, no clock reads. The caller supplies both sides.
//! - **Identity preserved**: the result's key is always the existing key.
//! - **Recency for volatile fields**: the side with the strictly later
//!   `created_at` provides the price; on a tie, `incoming` wins.
//! - **Null-coalesce**: a volatile companion field missing on the winning
//!   side is filled from the losing side.
//! - **Priority for static fields**: display name comes from the lower-ranked
//!   name provenance (`name_source`, not the volatile `source`); a missing
//!   name falls back to the other side.
//! - **`ingested_at` never regresses**.

use mdr_schemas::CanonicalRecord;
use thiserror::Error;

use crate::priority::SourcePriority;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MergeError {
    #[error("merge key mismatch: existing={existing} incoming={incoming}")]
    KeyMismatch { existing: String, incoming: String },
}

/// Which side provided the volatile fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VolatileWinner {
    Existing,
    Incoming,
}

/// Decide the volatile-field winner. Ties go to `incoming`.
pub fn volatile_winner(existing: &CanonicalRecord, incoming: &CanonicalRecord) -> VolatileWinner {
    if existing.created_at > incoming.created_at {
        VolatileWinner::Existing
    } else {
        VolatileWinner::Incoming
    }
}

/// Merge `incoming` into `existing` (if any), producing the new canonical record.
pub fn merge(
    existing: Option<&CanonicalRecord>,
    incoming: CanonicalRecord,
    priority: &SourcePriority,
) -> Result<CanonicalRecord, MergeError> {
    let existing = match existing {
        None => return Ok(incoming),
        Some(e) => e,
    };

    if existing.key != incoming.key {
        return Err(MergeError::KeyMismatch {
            existing: existing.key.clone(),
            incoming: incoming.key,
        });
    }

    let (winner, loser) = match volatile_winner(existing, &incoming) {
        VolatileWinner::Existing => (existing, &incoming),
        VolatileWinner::Incoming => (&incoming, existing),
    };

    // Equal rank keeps the existing name.
    let (preferred, other) =
        if priority.rank(incoming.name_origin()) < priority.rank(existing.name_origin()) {
            (&incoming, existing)
        } else {
            (existing, &incoming)
        };
    let named = if preferred.name.is_some() { preferred } else { other };

    Ok(CanonicalRecord {
        key: existing.key.clone(),
        name: named.name.clone(),
        name_source: named.name.as_ref().map(|_| named.name_origin().to_string()),
        price: winner.price,
        market_cap_usd: winner.market_cap_usd.or(loser.market_cap_usd),
        volume_24h_usd: winner.volume_24h_usd.or(loser.volume_24h_usd),
        percent_change_24h: winner.percent_change_24h.or(loser.percent_change_24h),
        source: winner.source.clone(),
        created_at: winner.created_at,
        ingested_at: existing.ingested_at.max(incoming.ingested_at),
    })
}
