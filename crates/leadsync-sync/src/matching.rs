//! Name/address matching between upstream estimates and local leads.
//!
//! Matching is first-found, not best-found: for each remote lead, local
//! leads are considered in their input order and the first unconsumed one
//! that matches by name or by address wins. The indexes only narrow the
//! search; they never change which lead is picked.

use std::collections::{HashMap, HashSet};
use std::fmt;

use leadsync_core::{canonical_status, LocalLead, MatchUpdate, RemoteLead};
use leadsync_storage::LeadStore;
use serde::Serialize;
use tracing::debug;

use crate::RunSummary;

const PUNCTUATION: [char; 23] = [
    '.', ',', '/', '#', '!', '$', '%', '^', '&', '*', ';', ':', '{', '}', '=', '-', '_', '`', '~',
    '(', ')', '\'', '"',
];

/// Addresses must be longer than this (in characters) to take part in
/// address matching.
pub const MIN_ADDRESS_CHARS: usize = 5;
const ADDRESS_PREFIX_CHARS: usize = 5;

/// Lowercases, drops punctuation, collapses whitespace and trims.
pub fn normalize(text: &str) -> String {
    let stripped: String = text
        .to_lowercase()
        .chars()
        .filter(|c| !PUNCTUATION.contains(c))
        .collect();
    stripped.split_whitespace().collect::<Vec<_>>().join(" ")
}

pub fn normalize_opt(text: Option<&str>) -> String {
    text.map(normalize).unwrap_or_default()
}

/// Coarse similarity in `[0, 1]`.
///
/// Identical strings score 1, containment scores 0.9, anything else is the
/// share of `a`'s words (duplicates counted) that appear in `b`, over the
/// larger word count. The word score is directional:
/// `similarity(a, b)` and `similarity(b, a)` can differ.
pub fn similarity(a: &str, b: &str) -> f64 {
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }
    let a = a.to_lowercase();
    let b = b.to_lowercase();
    if a == b {
        return 1.0;
    }
    if a.contains(&b) || b.contains(&a) {
        return 0.9;
    }

    let words_a: Vec<&str> = a.split_whitespace().collect();
    let words_b: Vec<&str> = b.split_whitespace().collect();
    let total = words_a.len().max(words_b.len());
    if total == 0 {
        return 0.0;
    }
    let hits = words_a.iter().filter(|w| words_b.contains(w)).count();
    hits as f64 / total as f64
}

/// Length is counted in Unicode scalar values, not UTF-16 code units; the
/// two only differ for characters outside the Basic Multilingual Plane.
fn address_eligible(address: &str) -> bool {
    address.chars().count() > MIN_ADDRESS_CHARS
}

fn address_prefix(address: &str) -> String {
    address.chars().take(ADDRESS_PREFIX_CHARS).collect()
}

fn addresses_overlap(a: &str, b: &str) -> bool {
    a.contains(b) || b.contains(a)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddressEntry {
    /// Position of the lead in the slice the index was built from.
    pub position: usize,
    pub full_address: String,
}

/// Lookup structures over one local lead slice.
#[derive(Debug, Default)]
pub struct LeadIndex {
    names: HashMap<String, Vec<usize>>,
    /// Address-eligible leads in scan order.
    addresses: Vec<AddressEntry>,
    /// First five address characters to offsets into `addresses`.
    address_prefixes: HashMap<String, Vec<usize>>,
}

impl LeadIndex {
    pub fn build(local: &[LocalLead]) -> Self {
        let mut index = Self::default();
        for (position, lead) in local.iter().enumerate() {
            let name = normalize_opt(lead.name.as_deref());
            if !name.is_empty() {
                index.names.entry(name).or_default().push(position);
            }

            let full_address = normalize(&lead.address_line());
            if address_eligible(&full_address) {
                let offset = index.addresses.len();
                index
                    .address_prefixes
                    .entry(address_prefix(&full_address))
                    .or_default()
                    .push(offset);
                index.addresses.push(AddressEntry {
                    position,
                    full_address,
                });
            }
        }
        index
    }

    pub fn unique_names(&self) -> usize {
        self.names.len()
    }

    pub fn address_prefix_count(&self) -> usize {
        self.address_prefixes.len()
    }

    /// Positions of leads whose normalized name equals `normalized_name`.
    pub fn name_candidates(&self, normalized_name: &str) -> &[usize] {
        self.names
            .get(normalized_name)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    /// Indexed addresses sharing the first five characters of `normalized_address`.
    pub fn address_bucket<'a>(
        &'a self,
        normalized_address: &str,
    ) -> impl Iterator<Item = &'a AddressEntry> + 'a {
        self.address_prefixes
            .get(&address_prefix(normalized_address))
            .into_iter()
            .flatten()
            .map(|&offset| &self.addresses[offset])
    }

    pub fn addresses(&self) -> &[AddressEntry] {
        &self.addresses
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct MatchPolicy {
    pub match_by_name: bool,
    pub match_by_address: bool,
    pub dry_run: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum MatchKind {
    Name,
    Address,
}

impl fmt::Display for MatchKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Name => f.write_str("name"),
            Self::Address => f.write_str("address"),
        }
    }
}

/// A remote lead paired with the local lead it was matched to.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MatchedPair {
    pub remote: RemoteLead,
    pub local: LocalLead,
    pub kind: MatchKind,
    pub name_similarity: f64,
}

impl MatchedPair {
    fn new(remote: &RemoteLead, local: &LocalLead, kind: MatchKind) -> Self {
        let name_similarity = similarity(
            &normalize_opt(remote.name.as_deref()),
            &normalize_opt(local.name.as_deref()),
        );
        Self {
            remote: remote.clone(),
            local: local.clone(),
            kind,
            name_similarity,
        }
    }

    /// Local status name the remote status maps to, when it differs from
    /// the current one.
    pub fn status_transition(&self) -> Option<&'static str> {
        let target = canonical_status(self.remote.status.as_deref()?)?;
        match self.local.status_name.as_deref() {
            Some(current) if current.trim().eq_ignore_ascii_case(target) => None,
            _ => Some(target),
        }
    }

    pub fn update(&self) -> MatchUpdate {
        MatchUpdate {
            local_id: self.local.id,
            proposal_tm: self.remote.true_cost.amount(),
            final_proposal_amount: self.remote.total_cost.amount(),
            status_name: self.status_transition().map(str::to_string),
        }
    }
}

/// Finds the earliest unconsumed local lead matching `remote`.
fn find_candidate(
    remote_name: &str,
    remote_address: &str,
    local: &[LocalLead],
    index: &LeadIndex,
    policy: &MatchPolicy,
    consumed: &HashSet<i64>,
) -> Option<(usize, MatchKind)> {
    let available = |position: usize| !consumed.contains(&local[position].id);

    let by_name = if policy.match_by_name && !remote_name.is_empty() {
        index
            .name_candidates(remote_name)
            .iter()
            .copied()
            .find(|&p| available(p))
    } else {
        None
    };

    if !policy.match_by_address || !address_eligible(remote_address) {
        return by_name.map(|p| (p, MatchKind::Name));
    }

    // Same-prefix addresses are the likely hit and give a cheap upper bound
    // for the ordered scan below.
    let mut bound = by_name.unwrap_or(usize::MAX);
    let by_bucket = index
        .address_bucket(remote_address)
        .find(|e| {
            e.position < bound
                && available(e.position)
                && addresses_overlap(remote_address, &e.full_address)
        })
        .map(|e| e.position);
    if let Some(p) = by_bucket {
        bound = p;
    }

    let by_address = index
        .addresses()
        .iter()
        .take_while(|e| e.position < bound)
        .find(|e| available(e.position) && addresses_overlap(remote_address, &e.full_address))
        .map(|e| e.position)
        .or(by_bucket);

    match (by_name, by_address) {
        (Some(n), Some(a)) if a < n => Some((a, MatchKind::Address)),
        (Some(n), _) => Some((n, MatchKind::Name)),
        (None, Some(a)) => Some((a, MatchKind::Address)),
        (None, None) => None,
    }
}

/// Pairs remote leads with local leads using a prebuilt index.
pub fn match_with_index(
    remote: &[RemoteLead],
    local: &[LocalLead],
    index: &LeadIndex,
    policy: &MatchPolicy,
) -> Vec<MatchedPair> {
    let mut consumed: HashSet<i64> = HashSet::new();
    let mut matches = Vec::new();

    for remote_lead in remote {
        let remote_name = normalize_opt(remote_lead.name.as_deref());
        let remote_address = normalize_opt(remote_lead.address.as_deref());

        let Some((position, kind)) = find_candidate(
            &remote_name,
            &remote_address,
            local,
            index,
            policy,
            &consumed,
        ) else {
            continue;
        };

        let local_lead = &local[position];
        consumed.insert(local_lead.id);
        debug!(
            remote_id = remote_lead.id,
            local_id = local_lead.id,
            %kind,
            "matched lead"
        );
        matches.push(MatchedPair::new(remote_lead, local_lead, kind));
    }
    matches
}

/// Pairs remote leads with local leads. Each local lead is used at most once.
pub fn match_leads(
    remote: &[RemoteLead],
    local: &[LocalLead],
    policy: &MatchPolicy,
) -> Vec<MatchedPair> {
    let index = LeadIndex::build(local);
    match_with_index(remote, local, &index, policy)
}

/// Matches, then writes one update per matched local lead unless the
/// policy is a dry run.
///
/// A failed write is recorded in `summary.errors`; the pair stays matched
/// and the run carries on.
pub async fn reconcile(
    remote: &[RemoteLead],
    local: &[LocalLead],
    policy: &MatchPolicy,
    store: &dyn LeadStore,
    summary: &mut RunSummary,
) -> Vec<MatchedPair> {
    summary.log("Creating search indexes for faster matching...");
    let index = LeadIndex::build(local);
    summary.log(format!(
        "Created indexes: {} unique names, {} address prefixes",
        index.unique_names(),
        index.address_prefix_count()
    ));

    summary.log("Starting comparison and update processing...");
    let matches = match_with_index(remote, local, &index, policy);
    summary.matches_found = matches.len();

    for pair in &matches {
        let update = pair.update();
        summary.log(format!(
            "Matched API lead {} ({}) to DB lead {} by {} (name similarity {:.2})",
            pair.remote.id,
            pair.remote.name.as_deref().unwrap_or("unnamed"),
            pair.local.id,
            pair.kind,
            pair.name_similarity
        ));

        if policy.dry_run {
            summary.leads_would_update += 1;
            if update.status_name.is_some() {
                summary.status_changes += 1;
            }
            summary.log(format!(
                "Dry run: would update DB Lead ID {} with T&M value: ${:.2}, final amount: ${:.2}{}",
                update.local_id,
                update.proposal_tm,
                update.final_proposal_amount,
                status_suffix(&update)
            ));
            continue;
        }

        match store.apply_match_update(&update).await {
            Ok(()) => {
                summary.leads_updated += 1;
                if update.status_name.is_some() {
                    summary.status_changes += 1;
                }
                summary.log(format!(
                    "Updated DB Lead ID {} with T&M value: ${:.2}, final amount: ${:.2}{}",
                    update.local_id,
                    update.proposal_tm,
                    update.final_proposal_amount,
                    status_suffix(&update)
                ));
            }
            Err(err) => {
                summary.error(format!(
                    "Error updating DB Lead ID {}: {err}",
                    update.local_id
                ));
            }
        }
    }
    matches
}

fn status_suffix(update: &MatchUpdate) -> String {
    update
        .status_name
        .as_deref()
        .map(|s| format!(", status -> {s}"))
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use leadsync_core::CostValue;
    use leadsync_storage::StoreError;
    use std::sync::Mutex;

    fn remote(id: i64, name: &str, address: &str) -> RemoteLead {
        RemoteLead {
            id,
            name: Some(name.to_string()),
            address: Some(address.to_string()),
            created_at: None,
            updated_at: None,
            true_cost: CostValue::from_f64(1200.0),
            total_cost: CostValue::from_f64(1800.0),
            sub_services_retail_cost: CostValue::default(),
            user: None,
            status: None,
        }
    }

    fn local(id: i64, name: &str, street: &str, city: &str, state: &str) -> LocalLead {
        LocalLead {
            id,
            name: Some(name.to_string()),
            street: Some(street.to_string()),
            city: Some(city.to_string()),
            state: Some(state.to_string()),
            ..LocalLead::default()
        }
    }

    fn both() -> MatchPolicy {
        MatchPolicy {
            match_by_name: true,
            match_by_address: true,
            dry_run: true,
        }
    }

    fn pairs(matches: &[MatchedPair]) -> Vec<(i64, i64, MatchKind)> {
        matches
            .iter()
            .map(|m| (m.remote.id, m.local.id, m.kind))
            .collect()
    }

    /// Straight nested scan, kept as the behavioural reference for the
    /// indexed matcher.
    fn nested_scan(
        remote: &[RemoteLead],
        local: &[LocalLead],
        policy: &MatchPolicy,
    ) -> Vec<(i64, i64, MatchKind)> {
        let mut consumed = HashSet::new();
        let mut out = Vec::new();
        for r in remote {
            let rn = normalize_opt(r.name.as_deref());
            let ra = normalize_opt(r.address.as_deref());
            for l in local {
                if consumed.contains(&l.id) {
                    continue;
                }
                let ln = normalize_opt(l.name.as_deref());
                let la = normalize(&l.address_line());
                let kind = if policy.match_by_name && !rn.is_empty() && !ln.is_empty() && rn == ln
                {
                    Some(MatchKind::Name)
                } else if policy.match_by_address
                    && address_eligible(&ra)
                    && address_eligible(&la)
                    && addresses_overlap(&ra, &la)
                {
                    Some(MatchKind::Address)
                } else {
                    None
                };
                if let Some(kind) = kind {
                    consumed.insert(l.id);
                    out.push((r.id, l.id, kind));
                    break;
                }
            }
        }
        out
    }

    #[derive(Default)]
    struct RecordingStore {
        updates: Mutex<Vec<MatchUpdate>>,
        fail_ids: Vec<i64>,
    }

    #[async_trait]
    impl LeadStore for RecordingStore {
        async fn list_local_leads(&self, _exclude_matched: bool) -> Result<Vec<LocalLead>, StoreError> {
            Ok(Vec::new())
        }

        async fn apply_match_update(&self, update: &MatchUpdate) -> Result<(), StoreError> {
            if self.fail_ids.contains(&update.local_id) {
                return Err(StoreError::LeadNotFound(update.local_id));
            }
            self.updates.lock().unwrap().push(update.clone());
            Ok(())
        }
    }

    #[test]
    fn normalize_strips_punctuation_and_whitespace() {
        assert_eq!(normalize("  John   SMITH. "), "john smith");
        assert_eq!(normalize("O'Brien-Walsh, (Jr.)"), "obrienwalsh jr");
        assert_eq!(normalize("1420 Orchard Ave,\tKent,\nWA"), "1420 orchard ave kent wa");
        assert_eq!(normalize(""), "");
        assert_eq!(normalize_opt(None), "");
    }

    #[test]
    fn normalize_is_idempotent_and_clean() {
        let samples = [
            "John Smith",
            "  john   smith. ",
            "#12-B Main St., Apt {4}",
            "\"Quoted\" `name` ~ with = signs & stuff!",
            "ÉLODIE   SStraße",
            "a_b_c  :;  d",
            "   ",
        ];
        for s in samples {
            let once = normalize(s);
            assert_eq!(normalize(&once), once, "not idempotent for {s:?}");
            assert!(!once.chars().any(|c| PUNCTUATION.contains(&c)), "{once:?}");
            assert!(!once.contains("  "), "{once:?}");
            assert_eq!(once.trim(), once);
        }
    }

    #[test]
    fn similarity_bounds() {
        assert_eq!(similarity("main st", "main st"), 1.0);
        assert_eq!(similarity("Main St", "main st"), 1.0);
        assert_eq!(similarity("", "main st"), 0.0);
        assert_eq!(similarity("main st", ""), 0.0);
        assert_eq!(similarity("123 main st kent", "main st"), 0.9);
        assert_eq!(similarity("oak lane", "pine road"), 0.0);
        assert_eq!(similarity("john a smith", "john b smith"), 2.0 / 3.0);
    }

    #[test]
    fn similarity_word_score_is_directional() {
        // Duplicates in the first argument each count as a hit.
        assert_eq!(similarity("a a b", "a b c"), 1.0);
        assert_eq!(similarity("a b c", "a a b"), 2.0 / 3.0);
    }

    #[test]
    fn index_keeps_name_collisions_in_order() {
        let leads = vec![
            local(10, "John Smith", "", "", ""),
            local(11, "Jane Doe", "", "", ""),
            local(12, "john smith.", "", "", ""),
        ];
        let index = LeadIndex::build(&leads);
        assert_eq!(index.unique_names(), 2);
        assert_eq!(index.name_candidates("john smith"), &[0, 2]);
        assert!(index.name_candidates("nobody").is_empty());
    }

    #[test]
    fn index_skips_short_addresses() {
        let leads = vec![
            local(1, "A", "1 A", "", ""),
            local(2, "B", "12 Main", "Kent", "WA"),
            local(3, "C", "12 Maple", "Kent", "WA"),
            LocalLead {
                id: 4,
                ..LocalLead::default()
            },
        ];
        let index = LeadIndex::build(&leads);
        assert_eq!(index.addresses().len(), 2);
        assert_eq!(index.address_prefix_count(), 1);
        let bucket: Vec<usize> = index
            .address_bucket("12 main kent wa")
            .map(|e| e.position)
            .collect();
        assert_eq!(bucket, vec![1, 2]);
    }

    #[test]
    fn name_match_ignores_case_spacing_and_punctuation() {
        let matches = match_leads(
            &[remote(1, "John Smith", "")],
            &[local(7, "john   smith.", "", "", "")],
            &both(),
        );
        assert_eq!(pairs(&matches), vec![(1, 7, MatchKind::Name)]);
    }

    #[test]
    fn address_match_is_symmetric_containment() {
        let leads = vec![
            local(1, "Unrelated", "1420 Orchard Ave", "Kent", "WA"),
            local(2, "Other", "77 Harbor View Dr", "Everett", "WA"),
        ];
        let matches = match_leads(
            &[
                remote(100, "J. Smith", "1420 Orchard Ave, Kent, WA 98032"),
                remote(101, "M. Gomez", "Harbor View Dr Everett"),
            ],
            &leads,
            &both(),
        );
        assert_eq!(
            pairs(&matches),
            vec![(100, 1, MatchKind::Address), (101, 2, MatchKind::Address)]
        );
    }

    #[test]
    fn first_scanned_lead_wins_on_equal_addresses() {
        let leads = vec![
            local(3, "First", "500 Pine St", "Kent", "WA"),
            local(8, "Second", "500 Pine St", "Kent", "WA"),
        ];
        let matches = match_leads(
            &[remote(1, "Someone Else", "500 Pine St")],
            &leads,
            &both(),
        );
        assert_eq!(pairs(&matches), vec![(1, 3, MatchKind::Address)]);
    }

    #[test]
    fn consumed_lead_is_never_rematched() {
        let leads = vec![local(5, "John Smith", "9 Elm Ct", "Kent", "WA")];
        let matches = match_leads(
            &[
                remote(1, "John Smith", ""),
                remote(2, "John Smith", "9 Elm Ct Kent WA"),
            ],
            &leads,
            &both(),
        );
        assert_eq!(pairs(&matches), vec![(1, 5, MatchKind::Name)]);
    }

    #[test]
    fn earlier_address_match_beats_later_name_match() {
        let leads = vec![
            local(1, "Somebody", "42 Birch Rd", "Kent", "WA"),
            local(2, "John Smith", "", "", ""),
        ];
        let matches = match_leads(&[remote(9, "John Smith", "42 Birch Rd Kent WA")], &leads, &both());
        assert_eq!(pairs(&matches), vec![(9, 1, MatchKind::Address)]);
    }

    #[test]
    fn name_wins_when_same_lead_matches_both_ways() {
        let leads = vec![local(1, "John Smith", "42 Birch Rd", "Kent", "WA")];
        let matches = match_leads(&[remote(9, "John Smith", "42 Birch Rd Kent WA")], &leads, &both());
        assert_eq!(pairs(&matches), vec![(9, 1, MatchKind::Name)]);
    }

    #[test]
    fn policy_flags_disable_each_rule() {
        let leads = vec![local(1, "John Smith", "42 Birch Rd", "Kent", "WA")];
        let by_name = remote(9, "John Smith", "");
        let by_address = remote(10, "Nobody", "42 Birch Rd Kent WA");

        let name_only = MatchPolicy {
            match_by_address: false,
            ..both()
        };
        assert!(match_leads(&[by_address.clone()], &leads, &name_only).is_empty());

        let address_only = MatchPolicy {
            match_by_name: false,
            ..both()
        };
        assert!(match_leads(&[by_name], &leads, &address_only).is_empty());
        assert_eq!(match_leads(&[by_address], &leads, &address_only).len(), 1);
    }

    #[test]
    fn address_length_counts_scalar_values() {
        // Five scalar values, eight UTF-16 code units.
        assert!(!address_eligible("𝔸𝔹𝔺 1"));
        assert!(address_eligible("𝔸𝔹𝔺 12"));
        assert!(!address_eligible("12 ab"));
        assert!(address_eligible("12 abc"));
    }

    #[test]
    fn short_or_missing_values_never_match() {
        let leads = vec![
            local(1, "", "1 A", "", ""),
            LocalLead {
                id: 2,
                ..LocalLead::default()
            },
        ];
        let matches = match_leads(
            &[remote(1, "", "1 A"), remote(2, "", ""), remote(3, "x", "1 a b")],
            &leads,
            &both(),
        );
        assert!(matches.is_empty());
    }

    #[test]
    fn indexed_matcher_agrees_with_nested_scan() {
        let leads = vec![
            local(1, "John Smith", "12 Main St", "Kent", "WA"),
            local(2, "Jane Doe", "500 Pine St", "Kent", "WA"),
            local(3, "John Smith", "7 Cedar Ln", "Auburn", "WA"),
            local(4, "Acme Roofing", "Unit 4 12 Main St", "Kent", "WA"),
            local(5, "Lee Park", "500 Pine St", "Kent", "WA"),
            local(6, "", "88 Rainier Ave S", "Seattle", "WA"),
            local(7, "Sam", "9 Oak", "", ""),
        ];
        let remotes = vec![
            remote(100, "Acme Roofing", "12 Main St Kent WA"),
            remote(101, "john smith", "7 Cedar Ln Auburn"),
            remote(102, "John Smith", ""),
            remote(103, "Unknown", "500 Pine St"),
            remote(104, "Unknown", "500 Pine St Kent WA 98032"),
            remote(105, "Jane Doe", "Main St"),
            remote(106, "Nobody", "Rainier Ave S Seattle"),
            remote(107, "Sam", "9 Oak"),
        ];
        for policy in [
            both(),
            MatchPolicy {
                match_by_name: false,
                ..both()
            },
            MatchPolicy {
                match_by_address: false,
                ..both()
            },
        ] {
            assert_eq!(
                pairs(&match_leads(&remotes, &leads, &policy)),
                nested_scan(&remotes, &leads, &policy),
                "policy {policy:?}"
            );
        }
    }

    #[test]
    fn status_transition_only_when_label_moves() {
        let mut r = remote(1, "A", "");
        let mut l = local(1, "A", "", "", "");
        l.status_name = Some("In Progress".into());

        r.status = Some("In Progress".into());
        assert_eq!(MatchedPair::new(&r, &l, MatchKind::Name).status_transition(), None);

        r.status = Some("Sold".into());
        assert_eq!(
            MatchedPair::new(&r, &l, MatchKind::Name).status_transition(),
            Some("Sold")
        );

        r.status = Some("Mystery".into());
        assert_eq!(MatchedPair::new(&r, &l, MatchKind::Name).status_transition(), None);
    }

    #[test]
    fn update_defaults_unparseable_costs_to_zero() {
        let mut r = remote(1, "A", "");
        r.true_cost = CostValue(Some(serde_json::json!("pending")));
        r.total_cost = CostValue::default();
        let update = MatchedPair::new(&r, &local(4, "A", "", "", ""), MatchKind::Name).update();
        assert_eq!(update.local_id, 4);
        assert_eq!(update.proposal_tm, 0.0);
        assert_eq!(update.final_proposal_amount, 0.0);
    }

    #[tokio::test]
    async fn dry_run_issues_no_writes() {
        let store = RecordingStore::default();
        let mut summary = RunSummary::new(true);
        let mut r = remote(1, "John Smith", "");
        r.status = Some("Sold".into());
        let matches = reconcile(
            &[r],
            &[local(7, "John Smith", "", "", "")],
            &both(),
            &store,
            &mut summary,
        )
        .await;
        assert_eq!(matches.len(), 1);
        assert!(store.updates.lock().unwrap().is_empty());
        assert_eq!(summary.matches_found, 1);
        assert_eq!(summary.leads_updated, 0);
        assert_eq!(summary.leads_would_update, 1);
        assert_eq!(summary.status_changes, 1);
    }

    #[tokio::test]
    async fn live_run_writes_once_per_match_and_survives_failures() {
        let store = RecordingStore {
            fail_ids: vec![2],
            ..RecordingStore::default()
        };
        let live = MatchPolicy {
            dry_run: false,
            ..both()
        };
        let mut summary = RunSummary::new(false);
        let matches = reconcile(
            &[
                remote(10, "Ann Lee", ""),
                remote(11, "Bo Chan", ""),
                remote(12, "Cy Diaz", ""),
            ],
            &[
                local(1, "Ann Lee", "", "", ""),
                local(2, "Bo Chan", "", "", ""),
                local(3, "Cy Diaz", "", "", ""),
            ],
            &live,
            &store,
            &mut summary,
        )
        .await;

        assert_eq!(matches.len(), 3);
        let written: Vec<i64> = store
            .updates
            .lock()
            .unwrap()
            .iter()
            .map(|u| u.local_id)
            .collect();
        assert_eq!(written, vec![1, 3]);
        assert_eq!(summary.leads_updated, 2);
        assert_eq!(summary.leads_would_update, 0);
        assert_eq!(summary.errors.len(), 1);
        assert!(summary.errors[0].contains("DB Lead ID 2"));
    }
}
