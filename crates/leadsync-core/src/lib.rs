//! Core domain records shared by the lead sync crates.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value as JsonValue;

pub const CRATE_NAME: &str = "leadsync-core";

/// Branch identifier used to scope a remote fetch.
pub type PartitionKey = i64;

/// Status names shared by the upstream API and the `lead_status` table.
pub const STATUS_SOLD: &str = "Sold";
pub const STATUS_LOST: &str = "Lost";
pub const STATUS_IN_PROGRESS: &str = "In Progress";
pub const STATUS_OPEN: &str = "Open";
pub const STATUS_RELEASED: &str = "Released";
pub const STATUS_SECONDARY_ESTIMATE: &str = "Secondary Estimate";

/// Statuses that count towards a salesperson's active workload.
pub const ACTIVE_STATUSES: [&str; 2] = [STATUS_IN_PROGRESS, STATUS_RELEASED];

/// Maps an upstream status label onto the local status vocabulary.
///
/// Unknown labels map to `None` and never cause a status transition.
pub fn canonical_status(label: &str) -> Option<&'static str> {
    match label.trim() {
        "Sold" => Some(STATUS_SOLD),
        "Lost" => Some(STATUS_LOST),
        "In Progress" => Some(STATUS_IN_PROGRESS),
        "Open" | "Pending" => Some(STATUS_OPEN),
        "Released" => Some(STATUS_RELEASED),
        "Secondary Estimate" => Some(STATUS_SECONDARY_ESTIMATE),
        _ => None,
    }
}

/// Raw monetary value as delivered by the upstream API.
///
/// The API is loose about cost fields: they arrive as numbers, numeric
/// strings, `null`, or not at all.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CostValue(pub Option<JsonValue>);

impl CostValue {
    pub fn from_f64(value: f64) -> Self {
        Self(Some(JsonValue::from(value)))
    }

    /// True when the upstream sent any non-null value.
    pub fn is_present(&self) -> bool {
        !matches!(self.0, None | Some(JsonValue::Null))
    }

    /// Non-negative amount; absent or unparseable values become 0.00.
    pub fn amount(&self) -> f64 {
        let parsed = match &self.0 {
            Some(JsonValue::Number(n)) => n.as_f64(),
            Some(JsonValue::String(s)) => parse_float_prefix(s),
            _ => None,
        };
        match parsed {
            Some(v) if v.is_finite() && v > 0.0 => v,
            _ => 0.0,
        }
    }
}

/// Parses the longest leading decimal literal of `input`, ignoring any
/// trailing garbage (`"12.50 USD"` parses as `12.5`).
pub fn parse_float_prefix(input: &str) -> Option<f64> {
    let s = input.trim_start();
    let bytes = s.as_bytes();
    let mut end = 0;

    if matches!(bytes.first(), Some(b'+') | Some(b'-')) {
        end += 1;
    }
    let int_start = end;
    while end < bytes.len() && bytes[end].is_ascii_digit() {
        end += 1;
    }
    let mut digits = end - int_start;
    if end < bytes.len() && bytes[end] == b'.' {
        let frac_start = end + 1;
        let mut frac_end = frac_start;
        while frac_end < bytes.len() && bytes[frac_end].is_ascii_digit() {
            frac_end += 1;
        }
        digits += frac_end - frac_start;
        end = frac_end;
    }
    if digits == 0 {
        return None;
    }
    if end < bytes.len() && matches!(bytes[end], b'e' | b'E') {
        let mut exp_end = end + 1;
        if matches!(bytes.get(exp_end), Some(b'+') | Some(b'-')) {
            exp_end += 1;
        }
        let exp_digits_start = exp_end;
        while exp_end < bytes.len() && bytes[exp_end].is_ascii_digit() {
            exp_end += 1;
        }
        if exp_end > exp_digits_start {
            end = exp_end;
        }
    }
    s[..end].parse().ok()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Branch {
    pub id: PartitionKey,
    #[serde(default)]
    pub name: Option<String>,
}

/// Branches arrive as objects at `depth >= 1` and as bare ids otherwise.
#[derive(Deserialize)]
#[serde(untagged)]
enum BranchRef {
    Expanded(Branch),
    Id(PartitionKey),
}

fn deserialize_branches<'de, D>(deserializer: D) -> Result<Vec<Branch>, D::Error>
where
    D: Deserializer<'de>,
{
    let refs: Option<Vec<BranchRef>> = Option::deserialize(deserializer)?;
    Ok(refs
        .unwrap_or_default()
        .into_iter()
        .map(|r| match r {
            BranchRef::Expanded(branch) => branch,
            BranchRef::Id(id) => Branch { id, name: None },
        })
        .collect())
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RemoteUser {
    #[serde(default)]
    pub id: Option<i64>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default, deserialize_with = "deserialize_branches")]
    pub branches: Vec<Branch>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum StatusRef {
    Label(String),
    Named { name: Option<String> },
}

fn deserialize_status<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let status: Option<StatusRef> = Option::deserialize(deserializer)?;
    Ok(status.and_then(|s| match s {
        StatusRef::Label(label) => Some(label),
        StatusRef::Named { name } => name,
    }))
}

/// Job estimate as returned by the upstream API.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteLead {
    pub id: i64,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub address: Option<String>,
    #[serde(default, rename = "createdAt")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default, rename = "updatedAt")]
    pub updated_at: Option<DateTime<Utc>>,
    /// Time-and-materials value.
    #[serde(default)]
    pub true_cost: CostValue,
    /// Final proposal amount.
    #[serde(default)]
    pub total_cost: CostValue,
    #[serde(default)]
    pub sub_services_retail_cost: CostValue,
    #[serde(default)]
    pub user: Option<RemoteUser>,
    #[serde(default, deserialize_with = "deserialize_status")]
    pub status: Option<String>,
}

impl RemoteLead {
    /// Whether the lead's user is affiliated with `partition`.
    pub fn belongs_to(&self, partition: PartitionKey) -> bool {
        self.user
            .as_ref()
            .map(|u| u.branches.iter().any(|b| b.id == partition))
            .unwrap_or(false)
    }

    pub fn salesperson_name(&self) -> Option<&str> {
        self.user.as_ref().and_then(|u| u.name.as_deref())
    }
}

/// Lead persisted in the local store.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct LocalLead {
    pub id: i64,
    pub name: Option<String>,
    pub street: Option<String>,
    pub city: Option<String>,
    pub state: Option<String>,
    pub zip: Option<String>,
    pub status_id: Option<i64>,
    pub status_name: Option<String>,
    pub proposal_tm: f64,
    pub final_proposal_amount: f64,
    pub matched: bool,
    pub last_update_date: Option<DateTime<Utc>>,
}

impl LocalLead {
    /// `"street city state"` with missing parts left blank.
    pub fn address_line(&self) -> String {
        format!(
            "{} {} {}",
            self.street.as_deref().unwrap_or_default(),
            self.city.as_deref().unwrap_or_default(),
            self.state.as_deref().unwrap_or_default()
        )
        .trim()
        .to_string()
    }
}

/// Field changes written to a matched local lead.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchUpdate {
    pub local_id: i64,
    pub proposal_tm: f64,
    pub final_proposal_amount: f64,
    /// Target status name, set only when the remote status moved.
    pub status_name: Option<String>,
}

/// A salesperson together with their current active-lead count.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SalespersonWorkload {
    pub id: i64,
    pub name: String,
    pub chat_id: Option<String>,
    pub branch_name: Option<String>,
    pub warning_count: i32,
    pub active_leads: i64,
}
