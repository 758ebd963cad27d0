//! Outbound `dataChanged` hook.

use std::time::Duration;

use adsync_core::{JobKind, TimeRange};
use async_trait::async_trait;
use serde::Serialize;
use tracing::{info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DataChanged {
    pub brand_id: Uuid,
    pub connection_id: Option<Uuid>,
    pub kind: JobKind,
    pub date_range: TimeRange,
}

/// Delivery is best effort: implementations log failures and never fail the
/// job that produced the change.
#[async_trait]
pub trait DataChangeNotifier: Send + Sync {
    async fn data_changed(&self, event: &DataChanged);
}

#[derive(Debug, Default)]
pub struct TracingNotifier;

#[async_trait]
impl DataChangeNotifier for TracingNotifier {
    async fn data_changed(&self, event: &DataChanged) {
        info!(
            brand_id = %event.brand_id,
            kind = %event.kind,
            range = %event.date_range,
            "data changed"
        );
    }
}

#[derive(Debug, Clone)]
pub struct WebhookNotifier {
    client: reqwest::Client,
    url: String,
}

impl WebhookNotifier {
    pub fn new(url: impl Into<String>, timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

#[async_trait]
impl DataChangeNotifier for WebhookNotifier {
    async fn data_changed(&self, event: &DataChanged) {
        let result = self
            .client
            .post(&self.url)
            .json(event)
            .send()
            .await
            .and_then(|r| r.error_for_status());
        if let Err(err) = result {
            warn!(url = %self.url, brand_id = %event.brand_id, error = %err, "dataChanged webhook failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    #[test]
    fn event_serializes_for_webhook_consumers() {
        let event = DataChanged {
            brand_id: Uuid::nil(),
            connection_id: None,
            kind: JobKind::DailyRefresh,
            date_range: TimeRange::single_day(NaiveDate::from_ymd_opt(2024, 2, 29).unwrap()),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["kind"], "daily_refresh");
        assert_eq!(json["date_range"]["since"], "2024-02-29");
        assert_eq!(json["date_range"]["until"], "2024-03-01");
    }

    #[tokio::test]
    async fn unreachable_webhook_does_not_panic() {
        let notifier = WebhookNotifier::new("http://127.0.0.1:9/hook", Duration::from_millis(200)).unwrap();
        notifier
            .data_changed(&DataChanged {
                brand_id: Uuid::new_v4(),
                connection_id: None,
                kind: JobKind::Rollover,
                date_range: TimeRange::single_day(NaiveDate::from_ymd_opt(2024, 1, 1).unwrap()),
            })
            .await;
    }
}
