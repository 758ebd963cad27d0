//! Upstream ads-insights API contract, the Graph-style REST client, and a
//! scripted fixture API for tests.

use std::path::Path;

use adsync_core::{BreakdownType, MetricLevel, SyncError, TimeRange};
use anyhow::Context;
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value as JsonValue;

mod fixture;
mod graph;
pub mod rows;

pub use fixture::{FixtureAdsApi, RecordedCall};
pub use graph::{map_fetch_error, GraphApiConfig, GraphInsightsApi};
pub use rows::{
    parse_demographic_row, parse_metric_row, parse_metric_values, DemographicRow, MetricRow,
    RowError,
};

pub const CRATE_NAME: &str = "adsync-adapters";

/// Fields requested for every insights call.
pub const INSIGHTS_FIELDS: &[&str] = &[
    "account_id",
    "campaign_id",
    "adset_id",
    "ad_id",
    "ad_name",
    "spend",
    "impressions",
    "clicks",
    "reach",
    "actions",
];

#[derive(Debug, Clone, PartialEq)]
pub struct InsightsRequest {
    pub account_id: String,
    pub access_token: String,
    pub time_range: TimeRange,
    pub level: MetricLevel,
    pub breakdown: Option<BreakdownType>,
}

impl InsightsRequest {
    /// Query parameters for one page. The upstream range is inclusive.
    pub fn query(&self, page_size: u32, cursor: Option<&str>) -> Vec<(String, String)> {
        let time_range = serde_json::json!({
            "since": self.time_range.since.format("%Y-%m-%d").to_string(),
            "until": self.time_range.last_day().format("%Y-%m-%d").to_string(),
        });
        let mut query = vec![
            ("fields".to_string(), INSIGHTS_FIELDS.join(",")),
            ("level".to_string(), self.level.as_str().to_string()),
            ("time_range".to_string(), time_range.to_string()),
            ("time_increment".to_string(), "1".to_string()),
            ("limit".to_string(), page_size.to_string()),
        ];
        if let Some(breakdown) = self.breakdown {
            query.push(("breakdowns".to_string(), breakdown.api_param().to_string()));
        }
        if let Some(after) = cursor {
            query.push(("after".to_string(), after.to_string()));
        }
        query
    }
}

/// One page of raw rows. Rows stay as JSON so a malformed row can be skipped
/// without losing the page.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct InsightsPage {
    pub rows: Vec<JsonValue>,
    pub next_cursor: Option<String>,
}

#[async_trait]
pub trait AdsApi: Send + Sync {
    async fn fetch_insights(
        &self,
        request: &InsightsRequest,
        cursor: Option<&str>,
    ) -> Result<InsightsPage, SyncError>;
}

#[derive(Debug, Deserialize)]
struct RawPage {
    #[serde(default)]
    data: Vec<JsonValue>,
    #[serde(default)]
    paging: Option<RawPaging>,
    #[serde(default)]
    error: Option<ApiErrorBody>,
}

#[derive(Debug, Deserialize)]
struct RawPaging {
    #[serde(default)]
    cursors: Option<RawCursors>,
    #[serde(default)]
    next: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawCursors {
    #[serde(default)]
    after: Option<String>,
}

/// The `error` object carried by upstream error responses.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ApiErrorBody {
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub code: Option<i64>,
    #[serde(default)]
    pub error_subcode: Option<i64>,
}

impl ApiErrorBody {
    pub fn from_body(body: &str) -> Option<Self> {
        #[derive(Deserialize)]
        struct Envelope {
            error: ApiErrorBody,
        }
        serde_json::from_str::<Envelope>(body).ok().map(|e| e.error)
    }
}

/// Decode a response body into a page. A `next` link is required for the
/// cursor to count; the last page still carries an `after` cursor.
pub fn parse_insights_body(body: &[u8]) -> Result<InsightsPage, SyncError> {
    let raw: RawPage = serde_json::from_slice(body)
        .map_err(|e| SyncError::PermanentFailure(format!("undecodable insights response: {e}")))?;
    if let Some(error) = raw.error {
        return Err(graph::classify_api_error(None, &error, None));
    }
    let next_cursor = raw.paging.and_then(|p| {
        p.next?;
        p.cursors.and_then(|c| c.after)
    });
    Ok(InsightsPage {
        rows: raw.data,
        next_cursor,
    })
}

/// Load a recorded response body from disk.
pub fn load_insights_fixture(path: impl AsRef<Path>) -> anyhow::Result<InsightsPage> {
    let path = path.as_ref();
    let data = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    parse_insights_body(&data).with_context(|| format!("parsing {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn request(breakdown: Option<BreakdownType>) -> InsightsRequest {
        InsightsRequest {
            account_id: "123".into(),
            access_token: "tok".into(),
            time_range: TimeRange::new(
                NaiveDate::from_ymd_opt(2024, 3, 1).unwrap(),
                NaiveDate::from_ymd_opt(2024, 4, 1).unwrap(),
            )
            .unwrap(),
            level: MetricLevel::Ad,
            breakdown,
        }
    }

    fn param<'a>(query: &'a [(String, String)], key: &str) -> Option<&'a str> {
        query.iter().find(|(k, _)| k == key).map(|(_, v)| v.as_str())
    }

    #[test]
    fn query_sends_inclusive_range_and_cursor() {
        let query = request(Some(BreakdownType::Placement)).query(500, Some("abc"));
        let range: JsonValue = serde_json::from_str(param(&query, "time_range").unwrap()).unwrap();
        assert_eq!(range["since"], "2024-03-01");
        assert_eq!(range["until"], "2024-03-31");
        assert_eq!(param(&query, "breakdowns"), Some("publisher_platform"));
        assert_eq!(param(&query, "after"), Some("abc"));
        assert_eq!(param(&query, "limit"), Some("500"));
        assert_eq!(param(&query, "time_increment"), Some("1"));
    }

    #[test]
    fn query_omits_optional_params() {
        let query = request(None).query(100, None);
        assert!(param(&query, "breakdowns").is_none());
        assert!(param(&query, "after").is_none());
    }

    #[test]
    fn cursor_requires_next_link() {
        let last = br#"{"data": [], "paging": {"cursors": {"before": "a", "after": "b"}}}"#;
        assert_eq!(parse_insights_body(last).unwrap().next_cursor, None);

        let more = br#"{"data": [{}], "paging": {"cursors": {"after": "b"}, "next": "https://x"}}"#;
        let page = parse_insights_body(more).unwrap();
        assert_eq!(page.next_cursor.as_deref(), Some("b"));
        assert_eq!(page.rows.len(), 1);
    }

    #[test]
    fn error_envelope_in_body_is_classified() {
        let body = br#"{"error": {"message": "Invalid OAuth access token", "code": 190}}"#;
        assert!(matches!(parse_insights_body(body), Err(SyncError::Auth(_))));
    }
}
