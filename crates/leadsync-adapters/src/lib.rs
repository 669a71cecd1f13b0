//! Remote lead source contracts, the job-estimates API adapter and the
//! paginated partition fetch loop.

use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use leadsync_core::{PartitionKey, RemoteLead};
use leadsync_storage::{FetchError, HttpClientConfig, HttpFetcher};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::{debug, info};

pub const CRATE_NAME: &str = "leadsync-adapters";

pub const DEFAULT_API_BASE_URL: &str = "https://www.attic-tech.com";
const ESTIMATES_PATH: &str = "/api/job-estimates";

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("{0}")]
    Message(String),
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

/// One page request against a remote lead source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageRequest {
    pub partition: PartitionKey,
    pub created_after: DateTime<Utc>,
    /// 1-based.
    pub page: u32,
    pub limit: u32,
}

/// Page envelope as returned by the upstream (Payload CMS) API.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LeadPage {
    #[serde(default)]
    pub docs: Option<Vec<JsonValue>>,
    #[serde(default)]
    pub total_docs: Option<u64>,
    #[serde(default)]
    pub total_pages: Option<u32>,
    #[serde(default)]
    pub page: Option<u32>,
}

impl LeadPage {
    /// Decodes each doc on its own so one malformed record does not sink
    /// the whole page. Returns the decoded leads and one message per
    /// rejected doc.
    pub fn decode_docs(&self) -> (Vec<RemoteLead>, Vec<String>) {
        let mut leads = Vec::new();
        let mut rejected = Vec::new();
        for (idx, doc) in self.docs.iter().flatten().enumerate() {
            match serde_json::from_value::<RemoteLead>(doc.clone()) {
                Ok(lead) => leads.push(lead),
                Err(err) => rejected.push(format!("doc #{idx}: {err}")),
            }
        }
        (leads, rejected)
    }
}

#[async_trait]
pub trait LeadSource: Send + Sync {
    fn source_id(&self) -> &'static str;

    async fn fetch_page(&self, request: &PageRequest) -> Result<LeadPage, AdapterError>;
}

/// Client for the upstream `/api/job-estimates` collection.
#[derive(Debug)]
pub struct JobEstimatesApi {
    http: HttpFetcher,
    base_url: String,
}

impl JobEstimatesApi {
    pub fn new(base_url: impl Into<String>, http_config: HttpClientConfig) -> anyhow::Result<Self> {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        let http_config = HttpClientConfig {
            referer: http_config
                .referer
                .or_else(|| Some(format!("{base_url}/estimates"))),
            ..http_config
        };
        Ok(Self {
            http: HttpFetcher::new(http_config)?,
            base_url,
        })
    }

    pub fn endpoint(&self) -> String {
        format!("{}{}", self.base_url, ESTIMATES_PATH)
    }

    /// Query string for one page: newest updates first, created after the
    /// cutoff, scoped to the branch through the user relation.
    pub fn query_for(request: &PageRequest) -> Vec<(String, String)> {
        vec![
            ("limit".into(), request.limit.to_string()),
            ("page".into(), request.page.to_string()),
            ("depth".into(), "2".into()),
            ("sort".into(), "-updatedAt".into()),
            (
                "where[createdAt][greater_than]".into(),
                request
                    .created_after
                    .to_rfc3339_opts(SecondsFormat::Millis, true),
            ),
            (
                "where[user.branches.id][in]".into(),
                request.partition.to_string(),
            ),
        ]
    }
}

#[async_trait]
impl LeadSource for JobEstimatesApi {
    fn source_id(&self) -> &'static str {
        "job-estimates-api"
    }

    async fn fetch_page(&self, request: &PageRequest) -> Result<LeadPage, AdapterError> {
        let page = self
            .http
            .get_json::<LeadPage>(self.source_id(), &self.endpoint(), &Self::query_for(request))
            .await?;
        Ok(page)
    }
}

/// Captured upstream records replayed offline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FixtureBundle {
    pub fixture_id: String,
    pub captured_from_url: String,
    pub fetched_at: DateTime<Utc>,
    #[serde(default)]
    pub notes: Option<String>,
    pub docs: Vec<JsonValue>,
}

pub fn load_fixture_bundle(path: impl AsRef<Path>) -> Result<FixtureBundle> {
    let path = path.as_ref();
    let data = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&data).with_context(|| format!("parsing {}", path.display()))
}

/// Serves a fixture bundle the way the upstream does: creation-date filter
/// applied, newest updates first, paged by `limit`. Like the real API, the
/// branch filter is not applied here.
#[derive(Debug, Clone)]
pub struct FixtureLeadSource {
    bundle: FixtureBundle,
}

impl FixtureLeadSource {
    pub fn new(bundle: FixtureBundle) -> Self {
        Self { bundle }
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        Ok(Self::new(load_fixture_bundle(path)?))
    }

    fn created_at(doc: &JsonValue) -> Option<DateTime<Utc>> {
        doc.get("createdAt")
            .and_then(JsonValue::as_str)
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|d| d.with_timezone(&Utc))
    }

    fn updated_at(doc: &JsonValue) -> Option<DateTime<Utc>> {
        doc.get("updatedAt")
            .and_then(JsonValue::as_str)
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|d| d.with_timezone(&Utc))
    }
}

#[async_trait]
impl LeadSource for FixtureLeadSource {
    fn source_id(&self) -> &'static str {
        "fixture"
    }

    async fn fetch_page(&self, request: &PageRequest) -> Result<LeadPage, AdapterError> {
        if request.page == 0 || request.limit == 0 {
            return Err(AdapterError::Message(format!(
                "invalid page request: page={} limit={}",
                request.page, request.limit
            )));
        }

        let mut docs: Vec<&JsonValue> = self
            .bundle
            .docs
            .iter()
            .filter(|doc| Self::created_at(doc).is_some_and(|c| c > request.created_after))
            .collect();
        docs.sort_by(|a, b| Self::updated_at(b).cmp(&Self::updated_at(a)));

        let limit = request.limit as usize;
        let total_docs = docs.len();
        let total_pages = total_docs.div_ceil(limit).max(1) as u32;
        let start = (request.page as usize - 1) * limit;
        let page_docs = docs
            .into_iter()
            .skip(start)
            .take(limit)
            .cloned()
            .collect::<Vec<_>>();

        Ok(LeadPage {
            docs: Some(page_docs),
            total_docs: Some(total_docs as u64),
            total_pages: Some(total_pages),
            page: Some(request.page),
        })
    }
}

#[derive(Debug, Clone, Copy)]
pub struct PaginationPolicy {
    pub page_size: u32,
    /// Hard stop in case the upstream's `totalPages` is wrong.
    pub max_pages: u32,
    /// Pause between consecutive pages of one partition.
    pub page_delay: Duration,
}

impl Default for PaginationPolicy {
    fn default() -> Self {
        Self {
            page_size: 100,
            max_pages: 50,
            page_delay: Duration::from_millis(200),
        }
    }
}

/// Everything one partition fetch produced, including a failure that cut
/// it short. Leads from pages fetched before the failure are kept.
#[derive(Debug)]
pub struct PartitionFetch {
    pub partition: PartitionKey,
    pub leads: Vec<RemoteLead>,
    pub pages_fetched: u32,
    pub total_docs: Option<u64>,
    pub log_messages: Vec<String>,
    pub failure: Option<AdapterError>,
}

/// Pages through `source` for one partition until the last page, an empty
/// page, a failure, or the page cap.
pub async fn fetch_partition(
    source: &dyn LeadSource,
    partition: PartitionKey,
    created_after: DateTime<Utc>,
    policy: &PaginationPolicy,
) -> PartitionFetch {
    let mut out = PartitionFetch {
        partition,
        leads: Vec::new(),
        pages_fetched: 0,
        total_docs: None,
        log_messages: vec![format!(
            "Fetching API leads for Branch ID: {partition} (created since {})",
            created_after.to_rfc3339_opts(SecondsFormat::Millis, true)
        )],
        failure: None,
    };

    let mut page = 1u32;
    loop {
        if page > policy.max_pages {
            out.log_messages.push(format!(
                "Branch {partition} - Stopped at the {} page safety limit.",
                policy.max_pages
            ));
            break;
        }

        let request = PageRequest {
            partition,
            created_after,
            page,
            limit: policy.page_size,
        };
        let result = match source.fetch_page(&request).await {
            Ok(result) => result,
            Err(err) => {
                out.log_messages
                    .push(format!("Branch {partition} - Error fetching page {page}: {err}"));
                out.failure = Some(err);
                break;
            }
        };
        out.pages_fetched += 1;

        let Some(raw_docs) = &result.docs else {
            out.log_messages.push(format!(
                "Branch {partition} - No docs array or unexpected format for page {page}."
            ));
            break;
        };
        let docs_in_page = raw_docs.len();

        let (decoded, rejected) = result.decode_docs();
        for message in rejected {
            out.log_messages.push(format!(
                "Branch {partition} - Page {page}: skipped malformed {message}"
            ));
        }
        // The server-side branch filter goes through a nested relation and
        // is not reliable.
        let kept: Vec<RemoteLead> = decoded
            .into_iter()
            .filter(|lead| lead.belongs_to(partition))
            .collect();
        for lead in &kept {
            debug!(
                partition,
                lead_id = lead.id,
                name = lead.name.as_deref().unwrap_or_default(),
                tm_value = lead.true_cost.amount(),
                "fetched remote lead"
            );
        }
        let kept_count = kept.len();
        out.leads.extend(kept);

        if page == 1 {
            let total = result.total_docs.unwrap_or(kept_count as u64);
            out.total_docs = Some(total);
            out.log_messages.push(format!(
                "Branch {partition} - Total API leads to fetch (matching criteria): {total}"
            ));
        }
        out.log_messages.push(format!(
            "Branch {partition} - Page {page}: Fetched {kept_count} ({docs_in_page} total in page). So far: {}",
            out.leads.len()
        ));

        if docs_in_page == 0 || page >= result.total_pages.unwrap_or(1) {
            break;
        }
        page += 1;
        tokio::time::sleep(policy.page_delay).await;
    }

    out.log_messages.push(format!(
        "Finished API fetch for Branch {partition}. Retrieved {} leads.",
        out.leads.len()
    ));
    info!(
        partition,
        pages = out.pages_fetched,
        leads = out.leads.len(),
        failed = out.failure.is_some(),
        "partition fetch finished"
    );
    out
}
