use std::sync::Arc;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use mdr_config::LoadedIngestConfig;
use mdr_db::{IngestStore, PgStore};
use mdr_runtime::Orchestrator;
use mdr_schemas::{CanonicalQuery, RunStatus, RunSummary, DEFAULT_PAGE_LIMIT};
use std::collections::BTreeMap;
use tokio::sync::watch;

#[derive(Parser)]
#[command(name = "mdr")]
#[command(about = "Market data reconciliation CLI", long_about = None)]
struct Cli {
    #[command(subcommand)]
    cmd: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Database commands
    Db {
        #[command(subcommand)]
        cmd: DbCmd,
    },

    /// Compute layered config hash + print canonical JSON
    ConfigHash {
        /// Paths in merge order (base -> env -> local overrides)
        #[arg(required = true)]
        paths: Vec<String>,
    },

    /// Ingestion cycles
    Ingest {
        #[command(subcommand)]
        cmd: IngestCmd,
    },

    /// Canonical record queries
    Records {
        #[command(subcommand)]
        cmd: RecordsCmd,
    },

    /// Run ledger queries
    Runs {
        #[command(subcommand)]
        cmd: RunsCmd,
    },

    /// Record counts and last success / failure
    Stats,

    /// Delete every canonical, run, checkpoint and raw row tagged with a source label.
    Purge {
        #[arg(long)]
        source: String,

        /// Acknowledge that the purge is irreversible.
        #[arg(long, default_value_t = false)]
        yes: bool,
    },
}

#[derive(Subcommand)]
enum DbCmd {
    Status,

    /// Apply SQL migrations.
    Migrate,
}

#[derive(Subcommand)]
enum IngestCmd {
    /// One cycle for every configured source; prints one summary per source.
    Once {
        /// Layered config paths in merge order
        #[arg(long = "config", required = true)]
        config_paths: Vec<String>,
    },

    /// Cycle on the configured interval until Ctrl-C.
    Loop {
        #[arg(long = "config", required = true)]
        config_paths: Vec<String>,
    },
}

#[derive(Subcommand)]
enum RecordsCmd {
    /// Print matching canonical records as JSON lines.
    List {
        /// Canonical key (ticker), case-insensitive
        #[arg(long)]
        key: Option<String>,

        /// Attributed source label
        #[arg(long)]
        source: Option<String>,

        /// Inclusive lower bound on created_at (RFC 3339)
        #[arg(long)]
        from: Option<DateTime<Utc>>,

        /// Inclusive upper bound on created_at (RFC 3339)
        #[arg(long)]
        to: Option<DateTime<Utc>>,

        #[arg(long, default_value_t = DEFAULT_PAGE_LIMIT)]
        limit: i64,

        #[arg(long, default_value_t = 0)]
        offset: i64,
    },
}

#[derive(Subcommand)]
enum RunsCmd {
    /// Most recent runs first.
    List {
        #[arg(long)]
        source: Option<String>,

        #[arg(long, default_value_t = 20)]
        limit: i64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::from_filename(".env.local");
    init_tracing();

    let cli = Cli::parse();

    match cli.cmd {
        Commands::Db { cmd } => {
            let pool = mdr_db::connect_from_env().await?;
            match cmd {
                DbCmd::Status => {
                    let s = mdr_db::status(&pool).await?;
                    println!(
                        "db_ok={} has_canonical_table={}",
                        s.ok, s.has_canonical_table
                    );
                }
                DbCmd::Migrate => {
                    mdr_db::migrate(&pool).await?;
                    println!("migrations_applied=true");
                }
            }
        }
        Commands::ConfigHash { paths } => {
            let path_refs: Vec<&str> = paths.iter().map(|s| s.as_str()).collect();
            let loaded = mdr_config::load_layered_yaml(&path_refs)?;
            println!("config_hash={}", loaded.config_hash);
            println!("{}", loaded.canonical_json);
        }
        Commands::Ingest { cmd } => match cmd {
            IngestCmd::Once { config_paths } => {
                let (loaded, orch) = orchestrator_from(&config_paths).await?;
                println!("config_hash={}", loaded.loaded.config_hash);
                let summaries = orch.run_once().await;
                print_summaries(&summaries);
                let failed = summaries
                    .values()
                    .filter(|s| s.status == RunStatus::Failure)
                    .count();
                if failed > 0 {
                    bail!("{failed} source(s) failed; see run ledger");
                }
            }
            IngestCmd::Loop { config_paths } => {
                let (loaded, orch) = orchestrator_from(&config_paths).await?;
                let every = loaded.ingest.schedule_interval();
                println!(
                    "config_hash={} interval_secs={}",
                    loaded.loaded.config_hash,
                    every.as_secs()
                );
                let (tx, rx) = watch::channel(false);
                tokio::spawn(async move {
                    let _ = tokio::signal::ctrl_c().await;
                    tracing::info!("ctrl-c received; stopping after current sweep");
                    let _ = tx.send(true);
                });
                orch.run_forever(every, rx).await;
            }
        },
        Commands::Records { cmd } => match cmd {
            RecordsCmd::List {
                key,
                source,
                from,
                to,
                limit,
                offset,
            } => {
                let store = store_from_env().await?;
                let page = store
                    .list_canonical(&CanonicalQuery {
                        key,
                        source,
                        created_from: from,
                        created_to: to,
                        limit: Some(limit),
                        offset: Some(offset),
                    })
                    .await?;
                for r in &page.records {
                    println!("{}", serde_json::to_string(r)?);
                }
                println!(
                    "total={} returned={} limit={} offset={}",
                    page.total,
                    page.records.len(),
                    page.limit,
                    page.offset
                );
            }
        },
        Commands::Runs { cmd } => match cmd {
            RunsCmd::List { source, limit } => {
                let store = store_from_env().await?;
                for r in store.list_runs(source.as_deref(), limit).await? {
                    println!(
                        "run_id={} source={} status={} started_at={} finished_at={} processed={} failed={} duration_ms={} message={}",
                        r.run_id,
                        r.source,
                        r.status.as_str(),
                        r.started_at.to_rfc3339(),
                        opt_dt(&r.finished_at),
                        r.processed,
                        r.failed,
                        r.duration_ms.map(|d| d.to_string()).unwrap_or_default(),
                        r.message.unwrap_or_default()
                    );
                }
            }
        },
        Commands::Stats => {
            let store = store_from_env().await?;
            let stats = store.stats().await?;
            println!("{}", serde_json::to_string_pretty(&stats)?);
        }
        Commands::Purge { source, yes } => {
            let source = source.trim().to_string();
            if source.is_empty() {
                bail!("--source must not be empty");
            }
            if !yes {
                bail!(
                    "REFUSING PURGE: this deletes all rows for source '{}'. Re-run with: `mdr purge --source {} --yes`",
                    source,
                    source
                );
            }
            let store = store_from_env().await?;
            let r = store.purge_source(&source).await?;
            println!(
                "purged=true source={} canonical={} runs={} checkpoints={} raw={}",
                r.source, r.canonical, r.runs, r.checkpoints, r.raw
            );
        }
    }
    Ok(())
}

/// Logs go to stderr so stdout stays parseable.
fn init_tracing() {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();
}

async fn store_from_env() -> Result<PgStore> {
    let pool = mdr_db::connect_from_env().await?;
    Ok(PgStore::new(pool))
}

async fn orchestrator_from(paths: &[String]) -> Result<(LoadedIngestConfig, Orchestrator)> {
    let path_refs: Vec<&str> = paths.iter().map(|s| s.as_str()).collect();
    let loaded = mdr_config::load_ingest_config(&path_refs)
        .with_context(|| format!("load config from {paths:?}"))?;
    let secrets = mdr_config::resolve_secrets(&loaded.ingest)?;

    let pool = mdr_db::connect_from_env().await?;
    mdr_db::migrate(&pool).await?;
    let store: Arc<dyn IngestStore> = Arc::new(PgStore::new(pool));

    let orch = Orchestrator::from_config(store, &loaded.ingest, &secrets);
    Ok((loaded, orch))
}

fn print_summaries(summaries: &BTreeMap<String, RunSummary>) {
    for (source, s) in summaries {
        println!(
            "source={} status={} processed={} failed={} duration_ms={}{}",
            source,
            s.status.as_str(),
            s.processed,
            s.failed,
            s.duration_ms,
            s.message
                .as_deref()
                .map(|m| format!(" message={m}"))
                .unwrap_or_default()
        );
    }
}

fn opt_dt(dt: &Option<DateTime<Utc>>) -> String {
    dt.as_ref().map(|d| d.to_rfc3339()).unwrap_or_default()
}
