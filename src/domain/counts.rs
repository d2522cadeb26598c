//! Population counts returned by the backend, and the bookkeeping that keeps
//! stale or unwanted responses away from the tree.
//!
//! The backend reports counts in a flat map keyed `criteria_count_<id>` and
//! `criteria_ratio_<id>`, where `<id>` is the backend's own identifier for a
//! node. An id remap translates local node ids to backend ids.

use std::{
    collections::HashMap,
    sync::LazyLock,
};

use num_format::{Locale, ToFormattedString};
use regex::Regex;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::NodeId;

const COUNT_PREFIX: &str = "criteria_count_";
const RATIO_PREFIX: &str = "criteria_ratio_";

static STAGE_KEY: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^criteria_(count|ratio)_(-?\d+)$").expect("stage key pattern is valid")
});

/// The displayable count of one node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StageDetails {
    /// Rendered value: a grouped integer for counts, a percentage for ratios.
    pub display: String,
    /// The rounded count. Absent for ratios.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<u64>,
}

/// How counts are rendered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CountFormat {
    /// Whether to insert thousands separators.
    pub group_digits: bool,
}

impl Default for CountFormat {
    fn default() -> Self {
        Self { group_digits: true }
    }
}

/// Resolves the displayable count of `item_id`.
///
/// The id is first translated through `id_remap` (falling back to the id
/// itself). An exact count is preferred over a ratio. Returns `None` when the
/// backend has reported neither, which is expected while counts are loading
/// or suspended.
#[must_use]
pub fn stage_details<S: std::hash::BuildHasher>(
    item_id: NodeId,
    id_remap: &HashMap<NodeId, i64, S>,
    extra: &HashMap<String, String, S>,
    format: CountFormat,
) -> Option<StageDetails> {
    let backend_id = id_remap.get(&item_id).copied().unwrap_or(item_id.get());

    let count = extra
        .get(&format!("{COUNT_PREFIX}{backend_id}"))
        .and_then(|raw| parse_number(raw));
    if let Some(count) = count {
        return Some(format_count(count, format));
    }

    extra
        .get(&format!("{RATIO_PREFIX}{backend_id}"))
        .and_then(|raw| parse_number(raw))
        .map(format_ratio)
}

fn parse_number(raw: &str) -> Option<f64> {
    raw.trim().parse::<f64>().ok().filter(|value| value.is_finite())
}

#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn format_count(count: f64, format: CountFormat) -> StageDetails {
    let value = count.round().max(0.0) as u64;
    let display = if format.group_digits {
        value.to_formatted_string(&Locale::en)
    } else {
        value.to_string()
    };
    StageDetails {
        display,
        value: Some(value),
    }
}

fn format_ratio(ratio: f64) -> StageDetails {
    StageDetails {
        display: format!("{:.0}%", (ratio * 100.0).round()),
        value: None,
    }
}

/// Counts reported by the backend for one revision of the cohort, parsed
/// into typed maps keyed by backend id.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StageCounts {
    revision: u64,
    id_remap: HashMap<NodeId, i64>,
    counts: HashMap<i64, f64>,
    ratios: HashMap<i64, f64>,
}

impl StageCounts {
    /// Parses a backend response computed for `revision`.
    ///
    /// Keys other than `criteria_count_<id>` and `criteria_ratio_<id>`, and
    /// values that are not finite numbers, are skipped.
    #[must_use]
    pub fn from_extra<S: std::hash::BuildHasher>(
        revision: u64,
        id_remap: HashMap<NodeId, i64>,
        extra: &HashMap<String, String, S>,
    ) -> Self {
        let mut counts = HashMap::new();
        let mut ratios = HashMap::new();

        for (key, raw) in extra {
            let Some(captures) = STAGE_KEY.captures(key) else {
                tracing::debug!("Skipping unrecognised count key '{key}'");
                continue;
            };
            let Ok(backend_id) = captures[2].parse::<i64>() else {
                tracing::debug!("Skipping count key '{key}': id out of range");
                continue;
            };
            let Some(value) = parse_number(raw) else {
                tracing::debug!("Skipping count key '{key}': '{raw}' is not a number");
                continue;
            };
            match &captures[1] {
                "count" => counts.insert(backend_id, value),
                _ => ratios.insert(backend_id, value),
            };
        }

        Self {
            revision,
            id_remap,
            counts,
            ratios,
        }
    }

    /// The cohort revision these counts were computed for.
    #[must_use]
    pub const fn revision(&self) -> u64 {
        self.revision
    }

    /// The displayable count of `item_id`, if the backend reported one.
    #[must_use]
    pub fn details(&self, item_id: NodeId, format: CountFormat) -> Option<StageDetails> {
        let backend_id = self
            .id_remap
            .get(&item_id)
            .copied()
            .unwrap_or(item_id.get());
        if let Some(&count) = self.counts.get(&backend_id) {
            return Some(format_count(count, format));
        }
        self.ratios.get(&backend_id).copied().map(format_ratio)
    }

    /// The backend ids that have a count or ratio, sorted.
    #[must_use]
    pub fn backend_ids(&self) -> Vec<i64> {
        let mut ids: Vec<i64> = self.counts.keys().chain(self.ratios.keys()).copied().collect();
        ids.sort_unstable();
        ids.dedup();
        ids
    }
}

/// A request for counts, tagged with the revision it was issued for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CountRequest {
    /// Unique id of the request.
    pub id: Uuid,
    /// The cohort revision the request describes.
    pub revision: u64,
}

/// A backend answer to a [`CountRequest`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CountResponse {
    /// The request being answered.
    #[serde(default)]
    pub request_id: Option<Uuid>,
    /// The cohort revision the counts were computed for, as named by the
    /// query they answer.
    #[serde(default)]
    pub revision: Option<u64>,
    /// Local node id to backend id.
    #[serde(default)]
    pub id_remap: HashMap<NodeId, i64>,
    /// Raw backend counts.
    #[serde(default)]
    pub extra: HashMap<String, String>,
}

/// Tracks in-flight count requests and the suspension flag.
///
/// While suspended (for example while the user fills in a criterion form) no
/// requests are issued and any response that arrives is ignored. Only the
/// latest request is ever honoured.
#[derive(Debug, Default)]
pub struct CountRequests {
    suspended: bool,
    latest: Option<CountRequest>,
}

impl CountRequests {
    /// Stops issuing requests and ignores responses until resumed.
    pub fn suspend(&mut self) {
        if !self.suspended {
            tracing::debug!("Suspending count requests");
        }
        self.suspended = true;
    }

    /// Undoes [`CountRequests::suspend`].
    pub fn resume(&mut self) {
        if self.suspended {
            tracing::debug!("Resuming count requests");
        }
        self.suspended = false;
    }

    /// Whether requests are currently suspended.
    #[must_use]
    pub const fn is_suspended(&self) -> bool {
        self.suspended
    }

    /// The most recently issued request.
    #[must_use]
    pub const fn latest(&self) -> Option<CountRequest> {
        self.latest
    }

    /// Issues a request for `revision`, superseding any in flight.
    ///
    /// Returns `None` while suspended.
    pub fn issue(&mut self, revision: u64) -> Option<CountRequest> {
        if self.suspended {
            tracing::debug!("Not requesting counts for revision {revision}: suspended");
            return None;
        }
        let request = CountRequest {
            id: Uuid::new_v4(),
            revision,
        };
        self.latest = Some(request);
        Some(request)
    }

    /// Turns a response into counts, if it answers the latest request and
    /// requests are not suspended.
    #[must_use]
    pub fn accept(&self, response: CountResponse) -> Option<StageCounts> {
        if self.suspended {
            tracing::debug!("Ignoring count response: suspended");
            return None;
        }
        let Some(latest) = self.latest else {
            tracing::debug!("Ignoring unsolicited count response");
            return None;
        };
        if response.request_id != Some(latest.id) {
            tracing::debug!("Ignoring count response for a superseded request");
            return None;
        }
        Some(StageCounts::from_extra(
            latest.revision,
            response.id_remap,
            &response.extra,
        ))
    }
}

#[cfg(test)]
mod tests {
    use test_case::test_case;

    use super::*;

    fn remap(pairs: &[(i64, i64)]) -> HashMap<NodeId, i64> {
        pairs.iter().map(|&(local, backend)| (NodeId::new(local), backend)).collect()
    }

    fn extra(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|&(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn remapped_count() {
        let details = stage_details(
            NodeId::new(5),
            &remap(&[(5, 105)]),
            &extra(&[("criteria_count_105", "42")]),
            CountFormat::default(),
        );
        assert_eq!(
            details,
            Some(StageDetails {
                display: "42".to_string(),
                value: Some(42)
            })
        );
    }

    #[test]
    fn remapped_ratio() {
        let details = stage_details(
            NodeId::new(5),
            &remap(&[(5, 105)]),
            &extra(&[("criteria_ratio_105", "0.37")]),
            CountFormat::default(),
        )
        .unwrap();
        assert_eq!(details.display, "37%");
        assert_eq!(details.value, None);
    }

    #[test]
    fn count_wins_over_ratio() {
        let details = stage_details(
            NodeId::new(3),
            &HashMap::new(),
            &extra(&[("criteria_ratio_3", "0.5"), ("criteria_count_3", "10")]),
            CountFormat::default(),
        )
        .unwrap();
        assert_eq!(details.value, Some(10));
    }

    #[test]
    fn missing_remap_falls_back_to_local_id() {
        let details = stage_details(
            NodeId::new(-2),
            &remap(&[(5, 105)]),
            &extra(&[("criteria_count_-2", "7")]),
            CountFormat::default(),
        );
        assert_eq!(details.unwrap().display, "7");
    }

    #[test]
    fn absence_is_not_an_error() {
        let details = stage_details(
            NodeId::new(9),
            &HashMap::new(),
            &extra(&[("criteria_count_1", "12")]),
            CountFormat::default(),
        );
        assert_eq!(details, None);
    }

    #[test_case("1234567", true, "1,234,567"; "grouped")]
    #[test_case("1234567", false, "1234567"; "ungrouped")]
    #[test_case("41.6", true, "42"; "rounded")]
    #[test_case("-3", true, "0"; "negative floored")]
    fn count_formatting(raw: &str, group_digits: bool, expected: &str) {
        let details = stage_details(
            NodeId::new(1),
            &HashMap::new(),
            &extra(&[("criteria_count_1", raw)]),
            CountFormat { group_digits },
        )
        .unwrap();
        assert_eq!(details.display, expected);
    }

    #[test_case("0.125", "13%"; "half rounds up")]
    #[test_case("0.005", "1%"; "small half rounds up")]
    #[test_case("0.375", "38%"; "odd half rounds up")]
    #[test_case("0.333", "33%"; "rounds down")]
    fn ratio_formatting(raw: &str, expected: &str) {
        let details = stage_details(
            NodeId::new(1),
            &HashMap::new(),
            &extra(&[("criteria_ratio_1", raw)]),
            CountFormat::default(),
        )
        .unwrap();
        assert_eq!(details.display, expected);
        assert_eq!(details.value, None);
    }

    #[test]
    fn unparseable_count_falls_back_to_ratio() {
        let details = stage_details(
            NodeId::new(1),
            &HashMap::new(),
            &extra(&[("criteria_count_1", "n/a"), ("criteria_ratio_1", "0.125")]),
            CountFormat::default(),
        )
        .unwrap();
        assert_eq!(details.display, "13%");
    }

    #[test]
    fn stage_counts_skip_foreign_keys_and_bad_values() {
        let counts = StageCounts::from_extra(
            3,
            remap(&[]),
            &extra(&[
                ("criteria_count_4", "1"),
                ("criteria_ratio_-1", "0.2"),
                ("criteria_ratio_4", "0.5"),
                ("criteria_count_9", "lots"),
                ("total", "100"),
            ]),
        );
        assert_eq!(counts.backend_ids(), vec![-1, 4]);
        assert_eq!(counts.revision(), 3);
        assert_eq!(
            counts.details(NodeId::new(4), CountFormat::default()).unwrap().value,
            Some(1)
        );
        assert_eq!(
            counts.details(NodeId::new(-1), CountFormat::default()).unwrap().display,
            "20%"
        );
    }

    #[test]
    fn only_latest_request_is_honoured() {
        let mut requests = CountRequests::default();
        let first = requests.issue(1).unwrap();
        let second = requests.issue(2).unwrap();
        assert_ne!(first.id, second.id);

        let stale = CountResponse {
            request_id: Some(first.id),
            ..CountResponse::default()
        };
        assert!(requests.accept(stale).is_none());

        let fresh = CountResponse {
            request_id: Some(second.id),
            extra: extra(&[("criteria_count_0", "5")]),
            ..CountResponse::default()
        };
        let counts = requests.accept(fresh).unwrap();
        assert_eq!(counts.revision(), 2);
        assert_eq!(
            counts.details(NodeId::ROOT, CountFormat::default()).unwrap().value,
            Some(5)
        );
    }

    #[test]
    fn suspension_blocks_requests_and_responses() {
        let mut requests = CountRequests::default();
        let request = requests.issue(1).unwrap();

        requests.suspend();
        assert!(requests.issue(2).is_none());
        let response = CountResponse {
            request_id: Some(request.id),
            ..CountResponse::default()
        };
        assert!(requests.accept(response.clone()).is_none());

        requests.resume();
        assert!(requests.accept(response).is_some());
    }

    #[test]
    fn response_decodes_from_backend_json() {
        let raw = serde_json::json!({
            "requestId": "67e55044-10b1-426f-9247-bb680e5fe0c8",
            "idRemap": { "5": 105 },
            "extra": { "criteria_count_105": "42" }
        });
        let response: CountResponse = serde_json::from_value(raw).unwrap();
        assert_eq!(response.id_remap.get(&NodeId::new(5)), Some(&105));
    }
}
