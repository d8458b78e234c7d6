//! Static-field source priority table.
//!
//! Maps a source label to a rank; lower rank wins. Labels are compared
//! case-insensitively. Unknown labels get `default_rank`.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

pub const DEFAULT_UNKNOWN_RANK: u32 = 99;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourcePriority {
    ranks: BTreeMap<String, u32>,
    default_rank: u32,
}

impl Default for SourcePriority {
    /// coinpaprika > coingecko > csv.
    fn default() -> Self {
        Self::new(
            [("coinpaprika", 1), ("coingecko", 2), ("csv", 3)],
            DEFAULT_UNKNOWN_RANK,
        )
    }
}

impl SourcePriority {
    pub fn new<I, S>(ranks: I, default_rank: u32) -> Self
    where
        I: IntoIterator<Item = (S, u32)>,
        S: AsRef<str>,
    {
        Self {
            ranks: ranks
                .into_iter()
                .map(|(label, rank)| (label.as_ref().trim().to_ascii_lowercase(), rank))
                .collect(),
            default_rank,
        }
    }

    pub fn rank(&self, source: &str) -> u32 {
        self.ranks
            .get(&source.trim().to_ascii_lowercase())
            .copied()
            .unwrap_or(self.default_rank)
    }

    pub fn default_rank(&self) -> u32 {
        self.default_rank
    }

    /// Configured labels in deterministic order.
    pub fn labels(&self) -> impl Iterator<Item = (&str, u32)> {
        self.ranks.iter().map(|(k, v)| (k.as_str(), *v))
    }
}
