//! Idempotent writes keyed by natural key. Ratios are recomputed from the raw
//! counters so the stored row depends only on what the upstream reported.

use std::sync::Arc;
use std::time::Duration;

use adsync_core::{
    DailyMetricRecord, DateBucket, DemographicBreakdownRecord, DerivedRatios, Granularity,
    MetricLevel, MetricValues, Result, SyncError, UpsertOutcome,
};
use adsync_storage::MetricStore;

#[derive(Debug, Clone, PartialEq)]
pub enum MetricRecord {
    Daily(DailyMetricRecord),
    Demographic(DemographicBreakdownRecord),
}

#[derive(Clone)]
pub struct UpsertLayer {
    metrics: Arc<dyn MetricStore>,
    timeout: Duration,
}

fn check_values(values: &MetricValues) -> Result<()> {
    for (name, v) in [("spend", values.spend), ("conversions", values.conversions)] {
        if !v.is_finite() || v < 0.0 {
            return Err(SyncError::validation(format!("{name} must be a finite non-negative number, got {v}")));
        }
    }
    Ok(())
}

pub fn validate_daily(record: &DailyMetricRecord) -> Result<()> {
    if record.ad_id.trim().is_empty() || record.account_id.trim().is_empty() {
        return Err(SyncError::validation("metric row has an empty entity or account id"));
    }
    if record.platform.trim().is_empty() {
        return Err(SyncError::validation("metric row has no platform"));
    }
    if record.level == MetricLevel::Account && record.ad_id != record.account_id {
        return Err(SyncError::validation(format!(
            "account-level row must be keyed by the account id, got {}",
            record.ad_id
        )));
    }
    check_values(&record.metrics)
}

pub fn validate_demographic(record: &DemographicBreakdownRecord) -> Result<()> {
    if record.breakdown_value.trim().is_empty() {
        return Err(SyncError::validation("demographic row has an empty breakdown value"));
    }
    if record.date_range_start > record.date_range_end {
        return Err(SyncError::validation("demographic range starts after it ends"));
    }
    let bucket = DateBucket::containing(record.date_range_start, record.granularity);
    let consistent = match record.granularity {
        Granularity::Daily => record.date_range_start == record.date_range_end,
        Granularity::Weekly | Granularity::Monthly => {
            bucket.start == record.date_range_start && bucket.end == record.date_range_end
        }
    };
    if !consistent {
        return Err(SyncError::validation(format!(
            "{} row range {}..={} does not match its bucket",
            record.granularity, record.date_range_start, record.date_range_end
        )));
    }
    check_values(&record.metrics)
}

impl UpsertLayer {
    pub fn new(metrics: Arc<dyn MetricStore>, timeout: Duration) -> Self {
        Self { metrics, timeout }
    }

    /// Insert by natural key, overwriting on conflict.
    pub async fn apply(&self, record: MetricRecord) -> Result<UpsertOutcome> {
        let write = async {
            match record {
                MetricRecord::Daily(mut r) => {
                    validate_daily(&r)?;
                    r.ratios = DerivedRatios::from_values(&r.metrics);
                    self.metrics.upsert_daily_metric(&r).await
                }
                MetricRecord::Demographic(mut r) => {
                    validate_demographic(&r)?;
                    r.ratios = DerivedRatios::from_values(&r.metrics);
                    self.metrics.upsert_demographic(&r).await
                }
            }
        };
        tokio::time::timeout(self.timeout, write)
            .await
            .map_err(|_| SyncError::Timeout(format!("upsert exceeded {:?}", self.timeout)))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use adsync_core::{BreakdownType, DailyMetricKey};
    use adsync_storage::MemoryStore;
    use chrono::{NaiveDate, Utc};
    use uuid::Uuid;

    fn day(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 5, d).unwrap()
    }

    fn daily(brand: Uuid, spend: f64) -> DailyMetricRecord {
        DailyMetricRecord {
            brand_id: brand,
            platform: "meta".into(),
            date: day(6),
            ad_id: "ad-1".into(),
            level: MetricLevel::Ad,
            account_id: "act".into(),
            campaign_id: Some("c".into()),
            ad_name: None,
            metrics: MetricValues {
                spend,
                impressions: 1000,
                clicks: 10,
                conversions: 1.0,
                reach: 900,
            },
            ratios: DerivedRatios::default(),
            updated_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn duplicate_delivery_is_idempotent() {
        let store = Arc::new(MemoryStore::new());
        let layer = UpsertLayer::new(store.clone(), Duration::from_secs(5));
        let brand = Uuid::new_v4();

        let first = layer.apply(MetricRecord::Daily(daily(brand, 5.0))).await.unwrap();
        let second = layer.apply(MetricRecord::Daily(daily(brand, 5.0))).await.unwrap();
        assert_eq!(first, UpsertOutcome::Inserted);
        assert_eq!(second, UpsertOutcome::Updated);
        assert_eq!(store.daily_metric_count().await, 1);

        let key = DailyMetricKey {
            brand_id: brand,
            platform: "meta".into(),
            date: day(6),
            ad_id: "ad-1".into(),
            level: MetricLevel::Ad,
        };
        let stored = store.get_daily_metric(&key).await.unwrap().unwrap();
        assert_eq!(stored.metrics.spend, 5.0);
        assert!((stored.ratios.cpm - 5.0).abs() < 1e-9);
        assert!((stored.ratios.ctr - 1.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn last_write_wins() {
        let store = Arc::new(MemoryStore::new());
        let layer = UpsertLayer::new(store.clone(), Duration::from_secs(5));
        let brand = Uuid::new_v4();
        layer.apply(MetricRecord::Daily(daily(brand, 5.0))).await.unwrap();
        layer.apply(MetricRecord::Daily(daily(brand, 7.5))).await.unwrap();
        let stored = store.get_daily_metric(&daily(brand, 0.0).key()).await.unwrap().unwrap();
        assert_eq!(stored.metrics.spend, 7.5);
    }

    #[tokio::test]
    async fn account_and_ad_levels_never_share_a_key() {
        let store = Arc::new(MemoryStore::new());
        let layer = UpsertLayer::new(store.clone(), Duration::from_secs(5));
        let brand = Uuid::new_v4();
        let mut account = daily(brand, 20.0);
        account.level = MetricLevel::Account;
        account.ad_id = "act".into();
        let mut ad = daily(brand, 5.0);
        ad.ad_id = "act".into();

        layer.apply(MetricRecord::Daily(account)).await.unwrap();
        assert_eq!(
            layer.apply(MetricRecord::Daily(ad)).await.unwrap(),
            UpsertOutcome::Inserted
        );
        assert_eq!(store.daily_metric_count().await, 2);
    }

    #[test]
    fn validation_rejects_inconsistent_rows() {
        let brand = Uuid::new_v4();
        let mut bad = daily(brand, -1.0);
        assert!(validate_daily(&bad).is_err());
        bad.metrics.spend = f64::NAN;
        assert!(validate_daily(&bad).is_err());

        let mut account = daily(brand, 1.0);
        account.level = MetricLevel::Account;
        assert!(validate_daily(&account).is_err());

        let weekly = DemographicBreakdownRecord {
            brand_id: brand,
            platform: "meta".into(),
            date_range_start: day(6),
            date_range_end: day(10),
            granularity: Granularity::Weekly,
            breakdown_type: BreakdownType::Age,
            breakdown_value: "18-24".into(),
            metrics: MetricValues::default(),
            ratios: DerivedRatios::default(),
            updated_at: Utc::now(),
        };
        // 2024-05-06 is a Monday, so the week bucket ends on the 12th.
        assert!(validate_demographic(&weekly).is_err());
        let ok = DemographicBreakdownRecord {
            date_range_end: day(12),
            ..weekly
        };
        assert!(validate_demographic(&ok).is_ok());
    }
}
