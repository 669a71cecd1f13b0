use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use leadsync_adapters::{
    fetch_partition, FixtureLeadSource, JobEstimatesApi, LeadSource, PaginationPolicy,
    DEFAULT_API_BASE_URL,
};
use leadsync_core::{PartitionKey, RemoteLead};
use leadsync_storage::{ConfigError, HttpClientConfig, LeadStore};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::sync::Mutex;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{debug, info, warn};
use uuid::Uuid;

pub mod matching;
pub mod warnings;

use matching::{reconcile, MatchKind, MatchPolicy, MatchedPair};
use warnings::Recipient;

pub const CRATE_NAME: &str = "leadsync-sync";

/// Name of the optional run-defaults file at the workspace root.
pub const RUN_CONFIG_FILE: &str = "leadsync.yaml";

fn env_flag(var: &str) -> bool {
    std::env::var(var)
        .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
        .unwrap_or(false)
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub api_base_url: String,
    pub api_token: Option<String>,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    /// `None` disables run reports.
    pub reports_dir: Option<PathBuf>,
    pub workspace_root: PathBuf,
    pub scheduler_enabled: bool,
    pub sync_cron_1: String,
    pub sync_cron_2: String,
    pub manager_chat_id: Option<String>,
}

impl SyncConfig {
    pub fn from_env() -> Self {
        let workspace_root = std::env::var("LEADSYNC_WORKSPACE_ROOT")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("."));
        let reports_dir = match std::env::var("LEADSYNC_REPORTS_DIR") {
            Ok(v) if v.trim().is_empty() || v == "off" => None,
            Ok(v) => Some(PathBuf::from(v)),
            Err(_) => Some(workspace_root.join("reports")),
        };
        Self {
            api_base_url: std::env::var("PAYLOAD_API_BASE_URL")
                .unwrap_or_else(|_| DEFAULT_API_BASE_URL.to_string()),
            api_token: std::env::var("PAYLOAD_TOKEN")
                .ok()
                .filter(|t| !t.trim().is_empty()),
            user_agent: std::env::var("LEADSYNC_USER_AGENT")
                .unwrap_or_else(|_| "leadsync/0.1".to_string()),
            http_timeout_secs: std::env::var("LEADSYNC_HTTP_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(300),
            reports_dir,
            workspace_root,
            scheduler_enabled: env_flag("LEADSYNC_SCHEDULER_ENABLED"),
            sync_cron_1: std::env::var("SYNC_CRON_1").unwrap_or_else(|_| "0 6 * * *".to_string()),
            sync_cron_2: std::env::var("SYNC_CRON_2").unwrap_or_else(|_| "0 18 * * *".to_string()),
            manager_chat_id: std::env::var("LEADSYNC_MANAGER_CHAT_ID")
                .ok()
                .filter(|c| !c.trim().is_empty()),
        }
    }

    pub fn http_client_config(&self) -> HttpClientConfig {
        HttpClientConfig {
            timeout: Duration::from_secs(self.http_timeout_secs),
            user_agent: Some(self.user_agent.clone()),
            bearer_token: self.api_token.clone(),
            ..Default::default()
        }
    }

    /// The live upstream source. Fails without an API token.
    pub fn job_estimates_api(&self) -> Result<JobEstimatesApi> {
        if self.api_token.is_none() {
            return Err(ConfigError::MissingVar("PAYLOAD_TOKEN").into());
        }
        JobEstimatesApi::new(self.api_base_url.clone(), self.http_client_config())
            .context("building job estimates client")
    }

    /// Replays `fixture` when given, otherwise talks to the upstream API.
    pub fn lead_source(&self, fixture: Option<&Path>) -> Result<Box<dyn LeadSource>> {
        match fixture {
            Some(path) => Ok(Box::new(FixtureLeadSource::from_path(path)?)),
            None => Ok(Box::new(self.job_estimates_api()?)),
        }
    }

    pub fn manager_recipient(&self) -> Option<Recipient> {
        self.manager_chat_id.as_ref().map(|chat_id| Recipient {
            chat_id: chat_id.clone(),
            display_name: "manager".to_string(),
        })
    }
}

/// Per-run knobs. Defaults are the safe manual-run values: dry run on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RunConfig {
    pub lookback_days: u32,
    pub branch_ids: Vec<PartitionKey>,
    pub match_by_name: bool,
    pub match_by_address: bool,
    pub skip_already_matched: bool,
    pub dry_run: bool,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            lookback_days: 30,
            branch_ids: vec![1, 2, 3, 4, 5],
            match_by_name: true,
            match_by_address: true,
            skip_already_matched: false,
            dry_run: true,
        }
    }
}

impl RunConfig {
    /// Defaults overlaid with `leadsync.yaml` from `workspace_root`, if present.
    pub fn load(workspace_root: &Path) -> Result<Self> {
        let path = workspace_root.join(RUN_CONFIG_FILE);
        if !path.exists() {
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(&path)
            .with_context(|| format!("reading {}", path.display()))?;
        serde_yaml::from_str(&raw).with_context(|| format!("parsing {}", path.display()))
    }

    pub fn policy(&self) -> MatchPolicy {
        MatchPolicy {
            match_by_name: self.match_by_name,
            match_by_address: self.match_by_address,
            dry_run: self.dry_run,
        }
    }

    pub fn cutoff(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now - chrono::Duration::days(i64::from(self.lookback_days))
    }
}

/// Outcome of one sync pass.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub dry_run: bool,
    pub api_leads_fetched: usize,
    pub db_leads_scanned: usize,
    pub matches_found: usize,
    pub leads_updated: usize,
    pub leads_would_update: usize,
    pub status_changes: usize,
    pub log_messages: Vec<String>,
    pub errors: Vec<String>,
    #[serde(default)]
    pub report_dir: Option<String>,
}

impl RunSummary {
    pub fn new(dry_run: bool) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            started_at: Utc::now(),
            finished_at: None,
            dry_run,
            api_leads_fetched: 0,
            db_leads_scanned: 0,
            matches_found: 0,
            leads_updated: 0,
            leads_would_update: 0,
            status_changes: 0,
            log_messages: Vec::new(),
            errors: Vec::new(),
            report_dir: None,
        }
    }

    pub fn log(&mut self, message: impl Into<String>) {
        let message = message.into();
        debug!(target: "leadsync::run", run_id = %self.run_id, "{message}");
        self.log_messages.push(message);
    }

    /// Records a scoped failure; the run carries on.
    pub fn error(&mut self, message: impl Into<String>) {
        let message = message.into();
        debug!(target: "leadsync::run", run_id = %self.run_id, error = true, "{message}");
        self.errors.push(message);
    }
}

#[derive(Debug, Serialize)]
struct MatchReportRow<'a> {
    remote_id: i64,
    remote_name: Option<&'a str>,
    local_id: i64,
    local_name: Option<&'a str>,
    kind: MatchKind,
    name_similarity: f64,
    proposal_tm: f64,
    final_proposal_amount: f64,
    status_change: Option<&'static str>,
}

impl<'a> From<&'a MatchedPair> for MatchReportRow<'a> {
    fn from(pair: &'a MatchedPair) -> Self {
        Self {
            remote_id: pair.remote.id,
            remote_name: pair.remote.name.as_deref(),
            local_id: pair.local.id,
            local_name: pair.local.name.as_deref(),
            kind: pair.kind,
            name_similarity: pair.name_similarity,
            proposal_tm: pair.remote.true_cost.amount(),
            final_proposal_amount: pair.remote.total_cost.amount(),
            status_change: pair.status_transition(),
        }
    }
}

pub struct SyncPipeline {
    config: SyncConfig,
    source: Box<dyn LeadSource>,
    store: Arc<dyn LeadStore>,
    pagination: PaginationPolicy,
    /// Held for the duration of a scheduled pass.
    run_guard: Mutex<()>,
}

impl SyncPipeline {
    pub fn new(config: SyncConfig, source: Box<dyn LeadSource>, store: Arc<dyn LeadStore>) -> Self {
        Self {
            config,
            source,
            store,
            pagination: PaginationPolicy::default(),
            run_guard: Mutex::new(()),
        }
    }

    pub fn with_pagination(mut self, pagination: PaginationPolicy) -> Self {
        self.pagination = pagination;
        self
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// One full pass: fetch, read local leads, match, update, report.
    ///
    /// Partition, read, update and report failures end up in `errors`; the
    /// summary of a pass that got this far is always returned.
    pub async fn run_once(&self, run: &RunConfig) -> Result<RunSummary> {
        let mut summary = RunSummary::new(run.dry_run);
        summary.log("Starting lead synchronization process...");
        summary.log(format!(
            "Config: days={}, branches={:?}, name={}, address={}, skip_matched={}, dry_run={}, source={}",
            run.lookback_days,
            run.branch_ids,
            run.match_by_name,
            run.match_by_address,
            run.skip_already_matched,
            run.dry_run,
            self.source.source_id()
        ));
        if run.dry_run {
            summary.log("DRY RUN MODE: No changes will be made to the database.");
        }

        let remote = self.fetch_remote(run, &mut summary).await;
        summary.api_leads_fetched = remote.len();
        if remote.is_empty() {
            summary.log("No API leads fetched. Exiting comparison and update process.");
            return self.finish(summary, &[]).await;
        }
        log_sub_cost_analysis(&remote, &mut summary);

        let local = match self.store.list_local_leads(run.skip_already_matched).await {
            Ok(local) => {
                summary.log(format!(
                    "Fetched {} leads from database{}.",
                    local.len(),
                    if run.skip_already_matched {
                        " (excluding already matched)"
                    } else {
                        ""
                    }
                ));
                local
            }
            Err(err) => {
                summary.error(format!("Error fetching leads from database: {err}"));
                Vec::new()
            }
        };
        summary.db_leads_scanned = local.len();
        if local.is_empty() {
            if run.skip_already_matched {
                summary.log("No DB leads fetched (possibly all were already matched and skipped).");
            } else {
                summary.log("No DB leads fetched. Exiting comparison and update process.");
            }
            return self.finish(summary, &[]).await;
        }

        let matches = reconcile(
            &remote,
            &local,
            &run.policy(),
            self.store.as_ref(),
            &mut summary,
        )
        .await;
        log_totals(run, &mut summary);
        self.finish(summary, &matches).await
    }

    async fn fetch_remote(&self, run: &RunConfig, summary: &mut RunSummary) -> Vec<RemoteLead> {
        let cutoff = run.cutoff(Utc::now());
        summary.log(format!(
            "Fetching leads from API for branches: {}",
            run.branch_ids
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join(", ")
        ));

        let mut seen = HashSet::new();
        let mut duplicates = 0usize;
        let mut remote = Vec::new();
        for &partition in &run.branch_ids {
            let fetch = fetch_partition(self.source.as_ref(), partition, cutoff, &self.pagination).await;
            for message in fetch.log_messages {
                summary.log(message);
            }
            if let Some(err) = fetch.failure {
                summary.error(format!("Failed to fetch leads for branch {partition}: {err}"));
            }
            for lead in fetch.leads {
                // A salesperson in several branches shows up in each partition.
                if seen.insert(lead.id) {
                    remote.push(lead);
                } else {
                    duplicates += 1;
                }
            }
        }
        if duplicates > 0 {
            summary.log(format!(
                "Dropped {duplicates} API leads returned by more than one branch."
            ));
        }
        summary.log(format!(
            "Total API leads fetched across all specified branches: {}",
            remote.len()
        ));
        remote
    }

    async fn finish(&self, mut summary: RunSummary, matches: &[MatchedPair]) -> Result<RunSummary> {
        summary.finished_at = Some(Utc::now());
        if let Some(reports_root) = &self.config.reports_dir {
            match write_reports(reports_root, &summary, matches).await {
                Ok(dir) => summary.report_dir = Some(dir.display().to_string()),
                Err(err) => summary.error(format!("Error writing run report: {err:#}")),
            }
        }
        info!(
            run_id = %summary.run_id,
            matches = summary.matches_found,
            updated = summary.leads_updated,
            errors = summary.errors.len(),
            "sync run finished"
        );
        Ok(summary)
    }

    /// Runs a pass unless another scheduled pass still holds the guard, in
    /// which case `None` is returned and the trigger is skipped.
    pub async fn run_scheduled(&self, run: &RunConfig) -> Option<Result<RunSummary>> {
        let Ok(_guard) = self.run_guard.try_lock() else {
            warn!("previous sync pass still running; skipping this trigger");
            return None;
        };
        Some(self.run_once(run).await)
    }

    /// Registers one sync pass per configured cron expression. `None` when
    /// scheduling is disabled.
    pub async fn maybe_build_scheduler(self: &Arc<Self>, run: RunConfig) -> Result<Option<JobScheduler>> {
        if !self.config.scheduler_enabled {
            return Ok(None);
        }

        let sched = JobScheduler::new().await.context("creating scheduler")?;
        for cron in [&self.config.sync_cron_1, &self.config.sync_cron_2] {
            let pipeline = Arc::clone(self);
            let run = run.clone();
            let job = Job::new_async(cron.as_str(), move |_uuid, _l| {
                let pipeline = Arc::clone(&pipeline);
                let run = run.clone();
                Box::pin(async move {
                    match pipeline.run_scheduled(&run).await {
                        None => {}
                        Some(Ok(summary)) => info!(
                            run_id = %summary.run_id,
                            matches = summary.matches_found,
                            updated = summary.leads_updated,
                            would_update = summary.leads_would_update,
                            errors = summary.errors.len(),
                            "scheduled sync completed"
                        ),
                        Some(Err(err)) => warn!("scheduled sync failed: {err:#}"),
                    }
                })
            })
            .with_context(|| format!("creating scheduler job for cron {cron}"))?;
            sched.add(job).await.context("adding scheduler job")?;
        }
        Ok(Some(sched))
    }
}

fn log_sub_cost_analysis(remote: &[RemoteLead], summary: &mut RunSummary) {
    let with_value = remote
        .iter()
        .filter(|l| l.sub_services_retail_cost.is_present())
        .count();
    let positive = remote
        .iter()
        .filter(|l| l.sub_services_retail_cost.amount() > 0.0)
        .count();
    summary.log(format!(
        "Sub-contractor cost analysis: {with_value} of {} API leads have sub_services_retail_cost, {positive} above zero.",
        remote.len()
    ));
}

fn log_totals(run: &RunConfig, summary: &mut RunSummary) {
    let lines = [
        "--- Synchronization Summary ---".to_string(),
        format!("Total API leads fetched: {}", summary.api_leads_fetched),
        format!(
            "Total DB leads scanned{}: {}",
            if run.skip_already_matched {
                " (excluding already matched)"
            } else {
                ""
            },
            summary.db_leads_scanned
        ),
        format!(
            "Number of API leads that found a match in DB: {}",
            summary.matches_found
        ),
    ];
    for line in lines {
        summary.log(line);
    }

    if run.dry_run {
        summary.log(format!(
            "Number of DB leads that WOULD BE updated (Dry Run): {}",
            summary.leads_would_update
        ));
        summary.log(format!(
            "Number of DB leads that WOULD HAVE status changed (Dry Run): {}",
            summary.status_changes
        ));
    } else {
        summary.log(format!("Number of DB leads updated: {}", summary.leads_updated));
        summary.log(format!(
            "Number of DB leads that HAD status changed: {}",
            summary.status_changes
        ));
    }
    if !summary.errors.is_empty() {
        let count = summary.errors.len();
        summary.log(format!("Encountered {count} errors during the process."));
    }
    summary.log("Lead synchronization process finished.");
}

/// Writes `sync_summary.json` and `sync_brief.md` under
/// `<reports_root>/<run_id>/` and returns that directory.
pub async fn write_reports(
    reports_root: &Path,
    summary: &RunSummary,
    matches: &[MatchedPair],
) -> Result<PathBuf> {
    let reports_dir = reports_root.join(summary.run_id.to_string());
    fs::create_dir_all(&reports_dir)
        .await
        .with_context(|| format!("creating {}", reports_dir.display()))?;

    let rows: Vec<MatchReportRow<'_>> = matches.iter().map(MatchReportRow::from).collect();
    let json = serde_json::to_vec_pretty(&serde_json::json!({
        "summary": summary,
        "matches": rows,
    }))
    .context("serializing sync summary")?;
    fs::write(reports_dir.join("sync_summary.json"), json)
        .await
        .context("writing sync_summary.json")?;

    let mut brief = format!(
        "# Lead Sync Brief\n\n- Run ID: `{}`\n- Mode: {}\n- Started: {}\n- API leads fetched: {}\n- DB leads scanned: {}\n- Matches: {}\n- {}: {}\n- Status changes: {}\n- Errors: {}\n",
        summary.run_id,
        if summary.dry_run { "dry run" } else { "live" },
        summary.started_at,
        summary.api_leads_fetched,
        summary.db_leads_scanned,
        summary.matches_found,
        if summary.dry_run { "Would update" } else { "Updated" },
        if summary.dry_run {
            summary.leads_would_update
        } else {
            summary.leads_updated
        },
        summary.status_changes,
        summary.errors.len(),
    );
    if !rows.is_empty() {
        brief.push_str("\n## Matches\n");
        for row in &rows {
            brief.push_str(&format!(
                "- API {} -> DB {} by {} (name similarity {:.2}, T&M ${:.2}){}\n",
                row.remote_id,
                row.local_id,
                row.kind,
                row.name_similarity,
                row.proposal_tm,
                row.status_change
                    .map(|s| format!(", status -> {s}"))
                    .unwrap_or_default()
            ));
        }
    }
    if !summary.errors.is_empty() {
        brief.push_str("\n## Errors\n");
        for error in &summary.errors {
            brief.push_str(&format!("- {error}\n"));
        }
    }
    fs::write(reports_dir.join("sync_brief.md"), brief)
        .await
        .context("writing sync_brief.md")?;

    Ok(reports_dir)
}

/// Markdown digest of the `runs` most recent reports under `reports_root`.
pub fn report_recent_runs(runs: usize, reports_root: &Path) -> Result<String> {
    let mut summaries = Vec::new();
    for entry in std::fs::read_dir(reports_root)
        .with_context(|| format!("reading {}", reports_root.display()))?
    {
        let entry = entry.with_context(|| format!("reading {}", reports_root.display()))?;
        let summary_path = entry.path().join("sync_summary.json");
        if !summary_path.is_file() {
            continue;
        }
        let raw = std::fs::read_to_string(&summary_path)
            .with_context(|| format!("reading {}", summary_path.display()))?;
        let value: serde_json::Value = serde_json::from_str(&raw)
            .with_context(|| format!("parsing {}", summary_path.display()))?;
        let summary: RunSummary = serde_json::from_value(value["summary"].clone())
            .with_context(|| format!("decoding summary in {}", summary_path.display()))?;
        summaries.push((summary, entry.path()));
    }
    summaries.sort_by(|a, b| b.0.started_at.cmp(&a.0.started_at));

    let mut lines = vec!["# Lead Sync Recent Runs".to_string(), String::new()];
    if summaries.is_empty() {
        lines.push("No runs recorded yet.".to_string());
    }
    for (summary, dir) in summaries.into_iter().take(runs.max(1)) {
        lines.push(format!("## Run `{}`", summary.run_id));
        lines.push(format!("- started: {}", summary.started_at));
        lines.push(format!(
            "- mode: {}",
            if summary.dry_run { "dry run" } else { "live" }
        ));
        lines.push(format!("- api leads: {}", summary.api_leads_fetched));
        lines.push(format!("- db leads scanned: {}", summary.db_leads_scanned));
        lines.push(format!("- matches: {}", summary.matches_found));
        if summary.dry_run {
            lines.push(format!("- would update: {}", summary.leads_would_update));
        } else {
            lines.push(format!("- updated: {}", summary.leads_updated));
        }
        lines.push(format!("- status changes: {}", summary.status_changes));
        lines.push(format!("- errors: {}", summary.errors.len()));
        lines.push(format!("- brief: `{}`", dir.join("sync_brief.md").display()));
        lines.push(String::new());
    }
    Ok(lines.join("\n"))
}
