//! Upstream HTTP fetch utilities and the local lead store.

use std::str::FromStr;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use leadsync_core::{LocalLead, MatchUpdate, SalespersonWorkload, ACTIVE_STATUSES};
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, AUTHORIZATION, REFERER};
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use sqlx::postgres::{PgConnectOptions, PgPoolOptions, PgSslMode};
use sqlx::{PgPool, Row};
use thiserror::Error;
use tracing::{debug, info_span, warn, Instrument};

pub const CRATE_NAME: &str = "leadsync-storage";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub bearer_token: Option<String>,
    pub referer: Option<String>,
    pub backoff: BackoffPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            // The estimates endpoint is slow on wide date ranges.
            timeout: Duration::from_secs(300),
            user_agent: None,
            bearer_token: None,
            referer: None,
            backoff: BackoffPolicy::default(),
        }
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}: {body}")]
    HttpStatus { status: u16, url: String, body: String },
    #[error("invalid JSON from {url}: {source}")]
    Decode {
        url: String,
        #[source]
        source: serde_json::Error,
    },
}

/// JSON-over-HTTPS client with retry for transient upstream failures.
#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    backoff: BackoffPolicy,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, HeaderValue::from_static("application/json"));
        if let Some(token) = &config.bearer_token {
            let mut value = HeaderValue::from_str(&format!("Bearer {token}"))
                .context("building authorization header")?;
            value.set_sensitive(true);
            headers.insert(AUTHORIZATION, value);
        }
        if let Some(referer) = &config.referer {
            headers.insert(
                REFERER,
                HeaderValue::from_str(referer).context("building referer header")?,
            );
        }

        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout)
            .default_headers(headers);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self {
            client,
            backoff: config.backoff,
        })
    }

    /// GET `url` with `query` and decode the body as `T`.
    ///
    /// Server errors, 429s and connection failures are retried with capped
    /// exponential backoff; anything else fails immediately.
    pub async fn get_json<T: DeserializeOwned>(
        &self,
        source_id: &str,
        url: &str,
        query: &[(String, String)],
    ) -> Result<T, FetchError> {
        let span = info_span!("http_fetch", source_id, url);
        self.get_json_inner(url, query).instrument(span).await
    }

    async fn get_json_inner<T: DeserializeOwned>(
        &self,
        url: &str,
        query: &[(String, String)],
    ) -> Result<T, FetchError> {
        let mut attempt = 0usize;
        loop {
            let can_retry = attempt < self.backoff.max_retries;
            match self.client.get(url).query(query).send().await {
                Ok(resp) => {
                    let status = resp.status();
                    let final_url = resp.url().to_string();

                    if status.is_success() {
                        let body = resp.bytes().await?;
                        return serde_json::from_slice(&body).map_err(|source| {
                            FetchError::Decode {
                                url: final_url,
                                source,
                            }
                        });
                    }

                    if classify_status(status) == RetryDisposition::Retryable && can_retry {
                        warn!(%status, attempt, "retryable upstream status");
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        attempt += 1;
                        continue;
                    }

                    let body = resp.text().await.unwrap_or_default();
                    return Err(FetchError::HttpStatus {
                        status: status.as_u16(),
                        url: final_url,
                        body: body.chars().take(200).collect(),
                    });
                }
                Err(err) => {
                    if classify_reqwest_error(&err) == RetryDisposition::Retryable && can_retry {
                        warn!(error = %err, attempt, "retryable request error");
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        attempt += 1;
                        continue;
                    }
                    return Err(FetchError::Request(err));
                }
            }
        }
    }
}

/// Fatal startup configuration problems.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required environment variable {0}")]
    MissingVar(&'static str),
    #[error("invalid value {value:?} for {var}")]
    Invalid { var: &'static str, value: String },
    #[error("insecure SSL configuration in production: certificate validation cannot be disabled")]
    InsecureSsl,
}

/// How the Postgres connection negotiates TLS.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DbSslPolicy {
    /// Leave TLS to whatever `DATABASE_URL` asks for.
    FromUrl,
    VerifyFull,
    /// Encrypted, certificate not validated. Development only.
    AcceptSelfSigned,
}

impl DbSslPolicy {
    /// Resolves the policy from `DB_SSL`, `DB_SSL_ALLOW_SELF_SIGNED` and the
    /// deployment environment name.
    pub fn resolve(
        db_ssl: Option<&str>,
        allow_self_signed: Option<&str>,
        environment: Option<&str>,
    ) -> Result<Self, ConfigError> {
        if db_ssl != Some("true") {
            return Ok(Self::FromUrl);
        }
        if allow_self_signed != Some("true") {
            return Ok(Self::VerifyFull);
        }
        match environment {
            Some("development") => {
                warn!("allowing self-signed database certificates; never use this in production");
                Ok(Self::AcceptSelfSigned)
            }
            Some("production") => Err(ConfigError::InsecureSsl),
            other => {
                warn!(
                    environment = other.unwrap_or("unset"),
                    "DB_SSL_ALLOW_SELF_SIGNED ignored outside development"
                );
                Ok(Self::VerifyFull)
            }
        }
    }

    pub fn ssl_mode(self) -> Option<PgSslMode> {
        match self {
            Self::FromUrl => None,
            Self::VerifyFull => Some(PgSslMode::VerifyFull),
            Self::AcceptSelfSigned => Some(PgSslMode::Require),
        }
    }
}

#[derive(Debug, Clone)]
pub struct DbConfig {
    pub database_url: String,
    pub ssl: DbSslPolicy,
    pub max_connections: u32,
}

impl DbConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let database_url =
            std::env::var("DATABASE_URL").map_err(|_| ConfigError::MissingVar("DATABASE_URL"))?;
        let ssl = DbSslPolicy::resolve(
            std::env::var("DB_SSL").ok().as_deref(),
            std::env::var("DB_SSL_ALLOW_SELF_SIGNED").ok().as_deref(),
            std::env::var("LEADSYNC_ENV").ok().as_deref(),
        )?;
        let max_connections = match std::env::var("DB_MAX_CONNECTIONS") {
            Ok(v) => v.parse().map_err(|_| ConfigError::Invalid {
                var: "DB_MAX_CONNECTIONS",
                value: v,
            })?,
            Err(_) => 5,
        };
        Ok(Self {
            database_url,
            ssl,
            max_connections,
        })
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("lead {0} not found")]
    LeadNotFound(i64),
    #[error("salesperson {0} not found")]
    SalespersonNotFound(i64),
}

#[async_trait]
pub trait LeadStore: Send + Sync {
    /// Local leads ordered by ascending id.
    async fn list_local_leads(&self, exclude_matched: bool) -> Result<Vec<LocalLead>, StoreError>;

    async fn apply_match_update(&self, update: &MatchUpdate) -> Result<(), StoreError>;
}

#[async_trait]
pub trait SalespersonStore: Send + Sync {
    async fn list_workloads(&self) -> Result<Vec<SalespersonWorkload>, StoreError>;

    async fn set_warning_count(&self, salesperson_id: i64, count: i32) -> Result<(), StoreError>;
}

/// Postgres-backed store: leads in `leads_dashboard`, salesperson workloads in
/// the operations tables.
///
/// Every operation checks a connection out of the pool for a single
/// statement; there is no transaction spanning several updates.
#[derive(Debug, Clone)]
pub struct PgLeadStore {
    pool: PgPool,
}

impl PgLeadStore {
    pub async fn connect(config: &DbConfig) -> anyhow::Result<Self> {
        let mut options = PgConnectOptions::from_str(&config.database_url)
            .context("parsing DATABASE_URL")?;
        if let Some(mode) = config.ssl.ssl_mode() {
            options = options.ssl_mode(mode);
        }
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections.max(1))
            .acquire_timeout(Duration::from_secs(10))
            .connect_with(options)
            .await
            .context("connecting to postgres")?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn close(self) {
        self.pool.close().await;
    }
}

const LIST_LEADS_SQL: &str = r#"
    SELECT l.id::int8 AS id,
           l.name,
           l.lead_status_id::int8 AS status_id,
           ls.name AS status_name,
           COALESCE(l.proposal_tm, 0)::float8 AS proposal_tm,
           COALESCE(l.final_proposal_amount, 0)::float8 AS final_proposal_amount,
           COALESCE(l.matched, FALSE) AS matched,
           l.last_update_date::timestamptz AS last_update_date,
           a.street,
           a.city,
           a.state,
           a.zip_code
      FROM leads_dashboard.lead l
      LEFT JOIN leads_dashboard.customer c ON l.customer_id = c.id
      LEFT JOIN leads_dashboard.address a ON c.address_id = a.id
      LEFT JOIN leads_dashboard.lead_status ls ON l.lead_status_id = ls.id
"#;

#[async_trait]
impl LeadStore for PgLeadStore {
    async fn list_local_leads(&self, exclude_matched: bool) -> Result<Vec<LocalLead>, StoreError> {
        let mut sql = LIST_LEADS_SQL.to_string();
        if exclude_matched {
            sql.push_str(" WHERE (l.matched = FALSE OR l.matched IS NULL)");
        }
        sql.push_str(" ORDER BY l.id");

        let rows = sqlx::query(&sql).fetch_all(&self.pool).await?;
        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            out.push(LocalLead {
                id: row.try_get("id")?,
                name: row.try_get("name")?,
                street: row.try_get("street")?,
                city: row.try_get("city")?,
                state: row.try_get("state")?,
                zip: row.try_get("zip_code")?,
                status_id: row.try_get("status_id")?,
                status_name: row.try_get("status_name")?,
                proposal_tm: row.try_get("proposal_tm")?,
                final_proposal_amount: row.try_get("final_proposal_amount")?,
                matched: row.try_get("matched")?,
                last_update_date: row.try_get("last_update_date")?,
            });
        }
        debug!(count = out.len(), exclude_matched, "loaded local leads");
        Ok(out)
    }

    async fn apply_match_update(&self, update: &MatchUpdate) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE leads_dashboard.lead
               SET proposal_tm = $1::float8,
                   final_proposal_amount = $2::float8,
                   lead_status_id = COALESCE(
                       (SELECT ls.id FROM leads_dashboard.lead_status ls WHERE ls.name = $3),
                       lead_status_id
                   ),
                   matched = TRUE,
                   last_update_date = NOW(),
                   updated_at = NOW()
             WHERE id = $4
            "#,
        )
        .bind(update.proposal_tm)
        .bind(update.final_proposal_amount)
        .bind(update.status_name.as_deref())
        .bind(update.local_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::LeadNotFound(update.local_id));
        }
        Ok(())
    }
}

// Salespeople and their estimates live in the public operations schema,
// apart from the `leads_dashboard` lead tables.
const LIST_WORKLOADS_SQL: &str = r#"
    SELECT s.id::int8 AS id,
           COALESCE(s.name, '') AS name,
           s.telegramid::text AS telegramid,
           COALESCE(s.warning_count, 0)::int4 AS warning_count,
           b.name AS branch_name,
           (
             SELECT COUNT(*)
               FROM estimate e
               JOIN status st ON e.status_id = st.id
              WHERE e.salesperson_id = s.id
                AND st.name = ANY($1)
           ) AS active_leads
      FROM salesperson s
      LEFT JOIN branch b ON s.branch_id = b.id
     ORDER BY s.id
"#;

const SET_WARNING_COUNT_SQL: &str = "UPDATE salesperson SET warning_count = $1 WHERE id = $2";

#[async_trait]
impl SalespersonStore for PgLeadStore {
    async fn list_workloads(&self) -> Result<Vec<SalespersonWorkload>, StoreError> {
        let rows = sqlx::query(LIST_WORKLOADS_SQL)
            .bind(&ACTIVE_STATUSES[..])
            .fetch_all(&self.pool)
            .await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            out.push(SalespersonWorkload {
                id: row.try_get("id")?,
                name: row.try_get("name")?,
                chat_id: row.try_get("telegramid")?,
                branch_name: row.try_get("branch_name")?,
                warning_count: row.try_get("warning_count")?,
                active_leads: row.try_get("active_leads")?,
            });
        }
        Ok(out)
    }

    async fn set_warning_count(&self, salesperson_id: i64, count: i32) -> Result<(), StoreError> {
        let result = sqlx::query(SET_WARNING_COUNT_SQL)
            .bind(count)
            .bind(salesperson_id)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::SalespersonNotFound(salesperson_id));
        }
        Ok(())
    }
}
