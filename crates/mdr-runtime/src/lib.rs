//! mdr-runtime
//!
//! The [`Orchestrator`] and the wiring that turns a loaded [`IngestConfig`]
//! into adapters.

use std::sync::Arc;

use mdr_config::{IngestConfig, ResolvedSecrets, SourceConfig};
use mdr_db::IngestStore;
use mdr_md::{CsvFileSource, HttpTickerSource, SourceAdapter};
use mdr_schemas::SourceKind;

pub mod orchestrator;

pub use orchestrator::{run_on_interval, Orchestrator, OrchestratorConfig};

/// Build one adapter per configured source, in config order.
pub fn build_sources(cfg: &IngestConfig, secrets: &ResolvedSecrets) -> Vec<Arc<dyn SourceAdapter>> {
    cfg.sources
        .iter()
        .map(|s| build_source(s, secrets))
        .collect()
}

fn build_source(s: &SourceConfig, secrets: &ResolvedSecrets) -> Arc<dyn SourceAdapter> {
    // validate() guarantees base_url / path for the matching kind.
    match s.kind {
        SourceKind::Http => Arc::new(
            HttpTickerSource::new(&s.label, s.base_url.clone().unwrap_or_default())
                .with_api_key(secrets.api_key(&s.label).map(str::to_string))
                .with_limit(s.limit),
        ),
        SourceKind::Csv => Arc::new(CsvFileSource::new(
            &s.label,
            s.path.clone().unwrap_or_default(),
        )),
    }
}

impl Orchestrator {
    /// Orchestrator for every source in `cfg`, with its priority table and timeout.
    pub fn from_config(
        store: Arc<dyn IngestStore>,
        cfg: &IngestConfig,
        secrets: &ResolvedSecrets,
    ) -> Self {
        Orchestrator::new(
            store,
            build_sources(cfg, secrets),
            OrchestratorConfig {
                priority: cfg.source_priority(),
                fetch_timeout: cfg.fetch_timeout(),
            },
        )
    }
}
