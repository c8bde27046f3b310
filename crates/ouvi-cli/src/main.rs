use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use ouvi_adapters::{RecordSink, RecordSource};
use ouvi_core::columns;
use ouvi_rules::RuleSet;
use ouvi_sync::SyncConfig;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "ouvi-cli")]
#[command(about = "Ouvidoria case reconciliation command-line interface")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Reconcile the latest upstream export into the curated table.
    Run,
    /// Validate rule tables and the configured source without writing.
    Check,
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => {
            let summary = ouvi_sync::run_sync_once_from_env()?;
            println!(
                "run complete: run_id={} appended={} patched={} skipped={} reports={}",
                summary.run_id,
                summary.appended,
                summary.patched_keys,
                summary.skipped_keys,
                summary.reports_dir
            );
        }
        Commands::Check => {
            let config = SyncConfig::from_env();

            let rules = RuleSet::from_workspace_root(&config.workspace_root)
                .or_else(|_| RuleSet::builtin())
                .context("loading rule tables")?;
            info!(default_department = rules.default_department(), "rule tables ok");

            let mut source = ouvi_adapters::JsonFixtureSource::new(config.source_path.clone());
            let export = source
                .list_latest()
                .with_context(|| format!("reading source {}", config.source_path.display()))?;
            anyhow::ensure!(
                export.column_index(columns::PROTOCOL).is_some(),
                "source export has no {:?} column",
                columns::PROTOCOL
            );

            let mut sink = ouvi_adapters::JsonFileSink::new(config.sink_path.clone());
            let curated = sink
                .read_all()
                .with_context(|| format!("reading sink {}", config.sink_path.display()))?;
            if !curated.is_empty() {
                anyhow::ensure!(
                    curated.column_index(columns::PROTOCOL).is_some(),
                    "sink table has rows but no {:?} column",
                    columns::PROTOCOL
                );
            }

            println!(
                "check ok: source_rows={} sink_rows={}",
                export.rows.len(),
                curated.rows.len()
            );
        }
    }

    Ok(())
}
