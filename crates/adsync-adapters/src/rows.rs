//! Parsing of upstream insights rows. Counters arrive as JSON strings
//! ("12.34"), sometimes as numbers; conversions are summed from `actions`.

use adsync_core::{BreakdownType, MetricLevel, MetricValues};
use chrono::NaiveDate;
use serde_json::Value as JsonValue;
use thiserror::Error;

/// Action types counted as conversions when a row has no `conversions` field.
pub const CONVERSION_ACTION_TYPES: &[&str] = &[
    "purchase",
    "offsite_conversion.fb_pixel_purchase",
    "lead",
    "complete_registration",
];

#[derive(Debug, Clone, PartialEq, Error)]
pub enum RowError {
    #[error("row is not a JSON object")]
    NotAnObject,
    #[error("missing field `{0}`")]
    MissingField(&'static str),
    #[error("field `{field}` is not a valid number: {value}")]
    InvalidNumber { field: &'static str, value: String },
    #[error("field `{field}` is not a valid date: {value}")]
    InvalidDate { field: &'static str, value: String },
}

/// One ad-level (or account/campaign/adset-level) daily row.
#[derive(Debug, Clone, PartialEq)]
pub struct MetricRow {
    pub date: NaiveDate,
    /// Id of the entity at the requested level.
    pub entity_id: String,
    pub account_id: String,
    pub campaign_id: Option<String>,
    pub ad_name: Option<String>,
    pub metrics: MetricValues,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DemographicRow {
    pub date_start: NaiveDate,
    pub date_stop: NaiveDate,
    pub breakdown_value: String,
    pub metrics: MetricValues,
}

fn object(row: &JsonValue) -> Result<&serde_json::Map<String, JsonValue>, RowError> {
    row.as_object().ok_or(RowError::NotAnObject)
}

fn text(obj: &serde_json::Map<String, JsonValue>, field: &'static str) -> Option<String> {
    match obj.get(field)? {
        JsonValue::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        JsonValue::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn required_text(
    obj: &serde_json::Map<String, JsonValue>,
    field: &'static str,
) -> Result<String, RowError> {
    text(obj, field).ok_or(RowError::MissingField(field))
}

fn date(obj: &serde_json::Map<String, JsonValue>, field: &'static str) -> Result<NaiveDate, RowError> {
    let raw = required_text(obj, field)?;
    NaiveDate::parse_from_str(&raw, "%Y-%m-%d").map_err(|_| RowError::InvalidDate { field, value: raw })
}

fn number_value(value: &JsonValue, field: &'static str) -> Result<f64, RowError> {
    let parsed = match value {
        JsonValue::Number(n) => n.as_f64(),
        JsonValue::String(s) => s.trim().parse::<f64>().ok(),
        JsonValue::Null => Some(0.0),
        _ => None,
    };
    match parsed {
        Some(v) if v.is_finite() => Ok(v),
        _ => Err(RowError::InvalidNumber {
            field,
            value: value.to_string(),
        }),
    }
}

/// Absent counters are zero; present but unparsable ones are an error.
fn number(obj: &serde_json::Map<String, JsonValue>, field: &'static str) -> Result<f64, RowError> {
    obj.get(field).map_or(Ok(0.0), |v| number_value(v, field))
}

fn count(obj: &serde_json::Map<String, JsonValue>, field: &'static str) -> Result<u64, RowError> {
    let value = number(obj, field)?;
    if value < 0.0 || value.fract() != 0.0 {
        return Err(RowError::InvalidNumber {
            field,
            value: value.to_string(),
        });
    }
    Ok(value as u64)
}

fn conversions(obj: &serde_json::Map<String, JsonValue>) -> Result<f64, RowError> {
    if obj.contains_key("conversions") && !obj["conversions"].is_array() {
        return number(obj, "conversions");
    }
    let mut total = 0.0;
    let Some(actions) = obj.get("actions").and_then(JsonValue::as_array) else {
        return Ok(0.0);
    };
    for action in actions {
        let kind = action.get("action_type").and_then(JsonValue::as_str);
        if kind.is_some_and(|k| CONVERSION_ACTION_TYPES.contains(&k)) {
            total += action
                .get("value")
                .map_or(Ok(0.0), |v| number_value(v, "actions.value"))?;
        }
    }
    Ok(total)
}

pub fn parse_metric_values(row: &JsonValue) -> Result<MetricValues, RowError> {
    let obj = object(row)?;
    Ok(MetricValues {
        spend: number(obj, "spend")?,
        impressions: count(obj, "impressions")?,
        clicks: count(obj, "clicks")?,
        conversions: conversions(obj)?,
        reach: count(obj, "reach")?,
    })
}

fn entity_field(level: MetricLevel) -> &'static str {
    match level {
        MetricLevel::Account => "account_id",
        MetricLevel::Campaign => "campaign_id",
        MetricLevel::AdSet => "adset_id",
        MetricLevel::Ad => "ad_id",
    }
}

pub fn parse_metric_row(row: &JsonValue, level: MetricLevel) -> Result<MetricRow, RowError> {
    let obj = object(row)?;
    Ok(MetricRow {
        date: date(obj, "date_start")?,
        entity_id: required_text(obj, entity_field(level))?,
        account_id: required_text(obj, "account_id")?,
        campaign_id: text(obj, "campaign_id"),
        ad_name: text(obj, "ad_name"),
        metrics: parse_metric_values(row)?,
    })
}

pub fn parse_demographic_row(
    row: &JsonValue,
    breakdown: BreakdownType,
) -> Result<DemographicRow, RowError> {
    let obj = object(row)?;
    let field = breakdown.api_param();
    let breakdown_value = text(obj, field).ok_or(RowError::MissingField(field))?;
    Ok(DemographicRow {
        date_start: date(obj, "date_start")?,
        date_stop: date(obj, "date_stop")?,
        breakdown_value,
        metrics: parse_metric_values(row)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_string_counters_and_action_conversions() {
        let row = json!({
            "date_start": "2024-03-02",
            "date_stop": "2024-03-02",
            "account_id": "123",
            "campaign_id": "c1",
            "ad_id": "a1",
            "ad_name": "Spring promo",
            "spend": "12.50",
            "impressions": "1000",
            "clicks": "25",
            "reach": 800,
            "actions": [
                {"action_type": "link_click", "value": "25"},
                {"action_type": "purchase", "value": "2"},
                {"action_type": "lead", "value": "1"}
            ]
        });
        let parsed = parse_metric_row(&row, MetricLevel::Ad).unwrap();
        assert_eq!(parsed.entity_id, "a1");
        assert_eq!(parsed.metrics.spend, 12.5);
        assert_eq!(parsed.metrics.impressions, 1000);
        assert_eq!(parsed.metrics.reach, 800);
        assert_eq!(parsed.metrics.conversions, 3.0);

        let account = parse_metric_row(&row, MetricLevel::Account).unwrap();
        assert_eq!(account.entity_id, "123");
    }

    #[test]
    fn rejects_garbage_counters_and_missing_ids() {
        let bad_number = json!({
            "date_start": "2024-03-02",
            "account_id": "123",
            "ad_id": "a1",
            "spend": "abc"
        });
        assert!(matches!(
            parse_metric_row(&bad_number, MetricLevel::Ad),
            Err(RowError::InvalidNumber { field: "spend", .. })
        ));

        let missing_ad = json!({"date_start": "2024-03-02", "account_id": "123"});
        assert_eq!(
            parse_metric_row(&missing_ad, MetricLevel::Ad),
            Err(RowError::MissingField("ad_id"))
        );

        let bad_date = json!({"date_start": "03/02/2024", "account_id": "1", "ad_id": "a"});
        assert!(matches!(
            parse_metric_row(&bad_date, MetricLevel::Ad),
            Err(RowError::InvalidDate { .. })
        ));
        assert_eq!(
            parse_metric_row(&json!([1, 2]), MetricLevel::Ad),
            Err(RowError::NotAnObject)
        );
    }

    #[test]
    fn demographic_rows_read_the_breakdown_column() {
        let row = json!({
            "date_start": "2024-03-02",
            "date_stop": "2024-03-02",
            "impression_device": "iphone",
            "spend": "3.00",
            "impressions": "300"
        });
        let parsed = parse_demographic_row(&row, BreakdownType::Device).unwrap();
        assert_eq!(parsed.breakdown_value, "iphone");
        assert_eq!(parsed.metrics.impressions, 300);
        assert!(parse_demographic_row(&row, BreakdownType::Age).is_err());
    }
}
