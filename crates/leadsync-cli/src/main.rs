use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use leadsync_core::PartitionKey;
use leadsync_storage::{DbConfig, PgLeadStore};
use leadsync_sync::warnings::{TracingNotifier, WarningService};
use leadsync_sync::{report_recent_runs, RunConfig, RunSummary, SyncConfig, SyncPipeline};
use tracing::info;
use tracing_subscriber::prelude::*;

#[derive(Debug, Parser)]
#[command(name = "leadsync")]
#[command(about = "Reconcile upstream job estimates with local leads")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one sync pass (dry run unless --live).
    Sync(SyncArgs),
    /// Evaluate salesperson workloads and send warnings.
    Warnings,
    /// Summarize the most recent run reports.
    Report {
        #[arg(long, default_value_t = 5)]
        runs: usize,
    },
    /// Run sync passes on the configured cron schedule until Ctrl-C.
    Schedule(SyncArgs),
}

#[derive(Debug, Default, Args)]
struct SyncArgs {
    /// Apply updates to the database.
    #[arg(long)]
    live: bool,
    /// Only consider estimates created within this many days.
    #[arg(long)]
    days: Option<u32>,
    /// Branch to fetch; repeat for several.
    #[arg(long = "branch")]
    branches: Vec<PartitionKey>,
    #[arg(long)]
    no_name: bool,
    #[arg(long)]
    no_address: bool,
    /// Leave out local leads already marked as matched.
    #[arg(long)]
    skip_matched: bool,
    /// Replay a captured bundle instead of calling the API.
    #[arg(long)]
    fixture: Option<PathBuf>,
}

impl SyncArgs {
    fn apply(&self, run: &mut RunConfig) {
        if self.live {
            run.dry_run = false;
        }
        if let Some(days) = self.days {
            run.lookback_days = days;
        }
        if !self.branches.is_empty() {
            run.branch_ids = self.branches.clone();
        }
        if self.no_name {
            run.match_by_name = false;
        }
        if self.no_address {
            run.match_by_address = false;
        }
        if self.skip_matched {
            run.skip_already_matched = true;
        }
    }
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

fn print_summary(summary: &RunSummary) {
    let tag = if summary.dry_run { "[DRY RUN] " } else { "" };
    for line in &summary.log_messages {
        println!("{tag}{line}");
    }
    for error in &summary.errors {
        eprintln!("{tag}ERROR: {error}");
    }
    println!(
        "{tag}sync complete: run_id={} api_leads={} db_leads={} matches={} updated={} would_update={} status_changes={} errors={}{}",
        summary.run_id,
        summary.api_leads_fetched,
        summary.db_leads_scanned,
        summary.matches_found,
        summary.leads_updated,
        summary.leads_would_update,
        summary.status_changes,
        summary.errors.len(),
        summary
            .report_dir
            .as_deref()
            .map(|d| format!(" reports={d}"))
            .unwrap_or_default()
    );
}

async fn connect_store() -> Result<PgLeadStore> {
    let db = DbConfig::from_env()?;
    PgLeadStore::connect(&db).await
}

fn build_pipeline(
    config: SyncConfig,
    args: &SyncArgs,
    store: &PgLeadStore,
) -> Result<(SyncPipeline, RunConfig)> {
    let mut run = RunConfig::load(&config.workspace_root)?;
    args.apply(&mut run);
    let source = config.lead_source(args.fixture.as_deref())?;
    Ok((SyncPipeline::new(config, source, Arc::new(store.clone())), run))
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    init_tracing();
    let cli = Cli::parse();
    let config = SyncConfig::from_env();

    match cli.command.unwrap_or_else(|| Commands::Sync(SyncArgs::default())) {
        Commands::Sync(args) => {
            let store = connect_store().await?;
            let (pipeline, run) = build_pipeline(config, &args, &store)?;
            let summary = pipeline.run_once(&run).await;
            store.close().await;
            print_summary(&summary?);
        }
        Commands::Warnings => {
            let store = connect_store().await?;
            let service = WarningService::new(Arc::new(store.clone()), Arc::new(TracingNotifier))
                .with_manager(config.manager_recipient());
            let summary = service.run().await;
            store.close().await;

            for line in &summary.log_messages {
                println!("{line}");
            }
            for error in &summary.errors {
                eprintln!("ERROR: {error}");
            }
            println!(
                "warnings complete: checked={} first={} final={} manager_alerts={} congratulations={} errors={}",
                summary.salespeople_checked,
                summary.first_warnings,
                summary.final_warnings,
                summary.manager_alerts,
                summary.congratulations,
                summary.errors.len()
            );
        }
        Commands::Report { runs } => {
            let Some(reports_dir) = &config.reports_dir else {
                bail!("run reports are disabled (LEADSYNC_REPORTS_DIR=off)");
            };
            println!("{}", report_recent_runs(runs, reports_dir)?);
        }
        Commands::Schedule(args) => {
            if !config.scheduler_enabled {
                bail!("scheduler is disabled; set LEADSYNC_SCHEDULER_ENABLED=true");
            }
            let store = connect_store().await?;
            let (pipeline, run) = build_pipeline(config, &args, &store)?;
            let pipeline = Arc::new(pipeline);
            let Some(mut sched) = pipeline.maybe_build_scheduler(run).await? else {
                bail!("scheduler is disabled");
            };
            sched.start().await.context("starting scheduler")?;
            info!(
                cron_1 = %pipeline.config().sync_cron_1,
                cron_2 = %pipeline.config().sync_cron_2,
                "scheduler running; press Ctrl-C to stop"
            );
            tokio::signal::ctrl_c().await.context("waiting for Ctrl-C")?;
            sched.shutdown().await.context("stopping scheduler")?;
            store.close().await;
        }
    }

    Ok(())
}
