//! Demographic rollover: daily rows age into weekly aggregates, weekly into
//! monthly, exactly once per bucket under the ledger.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use adsync_core::{
    BreakdownType, DateBucket, DemographicBreakdownRecord, Granularity, LedgerStatus,
    MetricValues, Result, SyncError, TimeRange,
};
use adsync_storage::{MetricStore, RolloverCommit};
use chrono::{Days, NaiveDate, Utc};
use serde::Serialize;
use tracing::{debug, info, info_span, Instrument};
use uuid::Uuid;

use crate::config::{RetentionPolicy, RolloverSettings};

/// Lifecycle of one brand's rows around a date.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BucketState {
    Collecting,
    RolledToWeekly,
    RolledToMonthly,
    /// Monthly aggregate written and the weekly sources pruned.
    Archived,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct RolloverReport {
    pub buckets_applied: u64,
    pub buckets_skipped: u64,
    pub source_rows: u64,
    pub aggregates: u64,
    pub pruned: u64,
}

impl RolloverReport {
    fn absorb(&mut self, commit: RolloverCommit) {
        match commit {
            RolloverCommit::Applied {
                source_rows,
                aggregates,
                pruned,
            } => {
                self.buckets_applied += 1;
                self.source_rows += source_rows;
                self.aggregates += aggregates;
                self.pruned += pruned;
            }
            RolloverCommit::AlreadyDone | RolloverCommit::NoSource => self.buckets_skipped += 1,
        }
    }

    fn merge(&mut self, other: RolloverReport) {
        self.buckets_applied += other.buckets_applied;
        self.buckets_skipped += other.buckets_skipped;
        self.source_rows += other.source_rows;
        self.aggregates += other.aggregates;
        self.pruned += other.pruned;
    }
}

/// Sum `rows` into one record per `(platform, breakdown type, value)` of
/// `bucket`. Rows are sorted by key first so float sums are reproducible;
/// ratios come from the summed counters.
///
/// Reach counts unique people and cannot be summed across days, so the
/// aggregate keeps the largest daily reach: a lower bound on the bucket's
/// true reach.
pub fn aggregate_bucket(
    rows: &[DemographicBreakdownRecord],
    bucket: DateBucket,
) -> Vec<DemographicBreakdownRecord> {
    let mut sorted: Vec<&DemographicBreakdownRecord> = rows.iter().collect();
    sorted.sort_by(|a, b| a.key().cmp(&b.key()));

    let mut groups: BTreeMap<(String, BreakdownType, String), MetricValues> = BTreeMap::new();
    for row in sorted {
        let group = groups
            .entry((row.platform.clone(), row.breakdown_type, row.breakdown_value.clone()))
            .or_default();
        let reach = group.reach.max(row.metrics.reach);
        group.add(&row.metrics);
        group.reach = reach;
    }

    let brand_id = rows.first().map(|r| r.brand_id).unwrap_or_else(Uuid::nil);
    let now = Utc::now();
    groups
        .into_iter()
        .map(|((platform, breakdown_type, breakdown_value), metrics)| DemographicBreakdownRecord {
            brand_id,
            platform,
            date_range_start: bucket.start,
            date_range_end: bucket.end,
            granularity: bucket.granularity,
            breakdown_type,
            breakdown_value,
            ratios: metrics.ratios(),
            metrics,
            updated_at: now,
        })
        .collect()
}

#[derive(Clone)]
pub struct RolloverManager {
    metrics: Arc<dyn MetricStore>,
    settings: RolloverSettings,
}

impl RolloverManager {
    pub fn new(metrics: Arc<dyn MetricStore>, settings: RolloverSettings) -> Self {
        Self { metrics, settings }
    }

    pub fn settings(&self) -> &RolloverSettings {
        &self.settings
    }

    fn age_threshold(&self, target: Granularity) -> Result<u32> {
        match target {
            Granularity::Weekly => Ok(self.settings.weekly_after_days),
            Granularity::Monthly => Ok(self.settings.monthly_after_days),
            Granularity::Daily => Err(SyncError::validation("rollover target must be weekly or monthly")),
        }
    }

    /// Roll every eligible bucket of `target` for `brand_id`. A bucket is
    /// eligible once it ended more than the configured number of days before
    /// `today`.
    pub async fn run(
        &self,
        brand_id: Uuid,
        target: Granularity,
        today: NaiveDate,
    ) -> Result<RolloverReport> {
        let threshold = self.age_threshold(target)?;
        let Some(source) = target.finer() else {
            return Err(SyncError::validation("rollover target must be weekly or monthly"));
        };
        let cutoff = today
            .checked_sub_days(Days::new(u64::from(threshold)))
            .unwrap_or(NaiveDate::MIN);

        let span = info_span!("rollover", %brand_id, %target, %cutoff);
        async move {
            let dates = self.metrics.demographic_dates(brand_id, source, cutoff).await?;
            let buckets: BTreeSet<(BreakdownType, DateBucket)> = dates
                .into_iter()
                .map(|(breakdown, d)| (breakdown, DateBucket::containing(d, target)))
                .filter(|(_, b)| b.end < cutoff)
                .collect();

            let prune = self.settings.retention == RetentionPolicy::Prune;
            let mut report = RolloverReport::default();
            for (breakdown, bucket) in buckets {
                let commit = self
                    .metrics
                    .commit_rollover(
                        brand_id,
                        breakdown,
                        bucket,
                        prune,
                        &move |rows: &[DemographicBreakdownRecord]| aggregate_bucket(rows, bucket),
                    )
                    .await?;
                debug!(%breakdown, bucket = %bucket.start, ?commit, "rollover bucket");
                report.absorb(commit);
            }
            if report.buckets_applied > 0 {
                info!(
                    applied = report.buckets_applied,
                    source_rows = report.source_rows,
                    pruned = report.pruned,
                    "rollover complete"
                );
            }
            Ok(report)
        }
        .instrument(span)
        .await
    }

    /// Weekly first so the monthly pass sees the freshest weekly rows.
    pub async fn run_all(&self, brand_id: Uuid, today: NaiveDate) -> Result<RolloverReport> {
        let mut report = self.run(brand_id, Granularity::Weekly, today).await?;
        report.merge(self.run(brand_id, Granularity::Monthly, today).await?);
        Ok(report)
    }

    pub async fn bucket_state(
        &self,
        brand_id: Uuid,
        breakdown_type: BreakdownType,
        date: NaiveDate,
    ) -> Result<BucketState> {
        let month = DateBucket::containing(date, Granularity::Monthly);
        let monthly_done = self
            .metrics
            .ledger_entry(brand_id, breakdown_type, month.start, Granularity::Monthly)
            .await?
            .is_some_and(|e| e.status == LedgerStatus::Done);
        if monthly_done {
            let weekly_left = self
                .metrics
                .demographic_records(brand_id, Granularity::Weekly, month.as_range())
                .await?
                .into_iter()
                .any(|r| r.breakdown_type == breakdown_type);
            return Ok(if !weekly_left {
                BucketState::Archived
            } else {
                BucketState::RolledToMonthly
            });
        }
        let week = DateBucket::containing(date, Granularity::Weekly);
        let weekly_done = self
            .metrics
            .ledger_entry(brand_id, breakdown_type, week.start, Granularity::Weekly)
            .await?
            .is_some_and(|e| e.status == LedgerStatus::Done);
        Ok(if weekly_done {
            BucketState::RolledToWeekly
        } else {
            BucketState::Collecting
        })
    }

    /// Rows of `granularity` stored for `range`, for callers reading reports.
    pub async fn records(
        &self,
        brand_id: Uuid,
        granularity: Granularity,
        range: TimeRange,
    ) -> Result<Vec<DemographicBreakdownRecord>> {
        self.metrics
            .demographic_records(brand_id, granularity, range)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use adsync_core::DerivedRatios;
    use adsync_storage::MemoryStore;

    fn d(m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, m, day).unwrap()
    }

    fn daily_row(brand: Uuid, date: NaiveDate, value: &str, spend: f64, impressions: u64) -> DemographicBreakdownRecord {
        dimension_row(brand, BreakdownType::Age, date, value, spend, impressions)
    }

    fn dimension_row(
        brand: Uuid,
        breakdown_type: BreakdownType,
        date: NaiveDate,
        value: &str,
        spend: f64,
        impressions: u64,
    ) -> DemographicBreakdownRecord {
        DemographicBreakdownRecord {
            brand_id: brand,
            platform: "meta".into(),
            date_range_start: date,
            date_range_end: date,
            granularity: Granularity::Daily,
            breakdown_type,
            breakdown_value: value.into(),
            metrics: MetricValues {
                spend,
                impressions,
                clicks: impressions / 100,
                conversions: 0.0,
                reach: impressions / 2,
            },
            ratios: DerivedRatios::default(),
            updated_at: Utc::now(),
        }
    }

    async fn seed_week(store: &MemoryStore, brand: Uuid) {
        // Mon 2024-01-08 .. Sun 2024-01-14
        for day in 8..=14 {
            store
                .upsert_demographic(&daily_row(brand, d(1, day), "18-24", 1.5, 1000))
                .await
                .unwrap();
            store
                .upsert_demographic(&daily_row(brand, d(1, day), "25-34", 2.0, 3000))
                .await
                .unwrap();
        }
    }

    fn manager(store: Arc<MemoryStore>, retention: RetentionPolicy) -> RolloverManager {
        RolloverManager::new(
            store,
            RolloverSettings {
                retention,
                ..Default::default()
            },
        )
    }

    #[tokio::test]
    async fn weekly_rollover_runs_exactly_once() {
        let store = Arc::new(MemoryStore::new());
        let brand = Uuid::new_v4();
        seed_week(&store, brand).await;
        let rollover = manager(store.clone(), RolloverSettings::default().retention);

        let first = rollover.run(brand, Granularity::Weekly, d(2, 1)).await.unwrap();
        assert_eq!(first.buckets_applied, 1);
        assert_eq!(first.source_rows, 14);
        assert_eq!(first.aggregates, 2);

        let second = rollover.run(brand, Granularity::Weekly, d(2, 1)).await.unwrap();
        assert_eq!(second.buckets_applied, 0);
        assert_eq!(store.demographic_count(Granularity::Weekly).await, 2);

        let entry = store
            .ledger_entry(brand, BreakdownType::Age, d(1, 8), Granularity::Weekly)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(entry.status, LedgerStatus::Done);
        assert_eq!(entry.bucket_end, d(1, 14));

        let weekly = rollover
            .records(brand, Granularity::Weekly, TimeRange::new(d(1, 1), d(2, 1)).unwrap())
            .await
            .unwrap();
        let young = weekly.iter().find(|r| r.breakdown_value == "18-24").unwrap();
        assert!((young.metrics.spend - 10.5).abs() < 1e-9);
        assert_eq!(young.metrics.impressions, 7000);
        assert_eq!(young.metrics.reach, 500, "reach is the peak day, not a sum");
        assert!((young.ratios.cpm - 1.5).abs() < 1e-9);
    }

    #[tokio::test]
    async fn young_buckets_keep_collecting() {
        let store = Arc::new(MemoryStore::new());
        let brand = Uuid::new_v4();
        seed_week(&store, brand).await;
        let rollover = manager(store.clone(), RetentionPolicy::Retain);

        // The week ended on the 14th; 14 days later it is not yet eligible.
        let report = rollover.run(brand, Granularity::Weekly, d(1, 28)).await.unwrap();
        assert_eq!(report.buckets_applied, 0);
        assert_eq!(rollover.bucket_state(brand, BreakdownType::Age, d(1, 10)).await.unwrap(), BucketState::Collecting);

        let report = rollover.run(brand, Granularity::Weekly, d(1, 29)).await.unwrap();
        assert_eq!(report.buckets_applied, 1);
        assert_eq!(
            rollover.bucket_state(brand, BreakdownType::Age, d(1, 10)).await.unwrap(),
            BucketState::RolledToWeekly
        );
    }

    #[tokio::test]
    async fn prune_policy_archives_after_monthly() {
        let store = Arc::new(MemoryStore::new());
        let brand = Uuid::new_v4();
        seed_week(&store, brand).await;
        let rollover = manager(store.clone(), RetentionPolicy::Prune);

        let report = rollover.run_all(brand, d(6, 1)).await.unwrap();
        assert_eq!(report.buckets_applied, 2);
        assert_eq!(store.demographic_count(Granularity::Daily).await, 0);
        assert_eq!(store.demographic_count(Granularity::Weekly).await, 0);
        assert_eq!(store.demographic_count(Granularity::Monthly).await, 2);
        assert_eq!(rollover.bucket_state(brand, BreakdownType::Age, d(1, 10)).await.unwrap(), BucketState::Archived);
    }

    #[tokio::test]
    async fn retain_policy_keeps_sources() {
        let store = Arc::new(MemoryStore::new());
        let brand = Uuid::new_v4();
        seed_week(&store, brand).await;
        let rollover = manager(store.clone(), RetentionPolicy::Retain);

        rollover.run_all(brand, d(6, 1)).await.unwrap();
        assert_eq!(store.demographic_count(Granularity::Daily).await, 14);
        assert_eq!(store.demographic_count(Granularity::Weekly).await, 2);
        assert_eq!(
            rollover.bucket_state(brand, BreakdownType::Age, d(1, 10)).await.unwrap(),
            BucketState::RolledToMonthly
        );
    }

    #[tokio::test]
    async fn late_dimension_rolls_up_on_its_own_ledger() {
        let store = Arc::new(MemoryStore::new());
        let brand = Uuid::new_v4();
        seed_week(&store, brand).await;
        let rollover = manager(store.clone(), RetentionPolicy::Prune);

        let first = rollover.run(brand, Granularity::Weekly, d(2, 1)).await.unwrap();
        assert_eq!(first.buckets_applied, 1);

        for day in 8..=14 {
            store
                .upsert_demographic(&dimension_row(brand, BreakdownType::Gender, d(1, day), "female", 1.0, 500))
                .await
                .unwrap();
        }
        let second = rollover.run(brand, Granularity::Weekly, d(2, 1)).await.unwrap();
        assert_eq!(second.buckets_applied, 1);
        assert_eq!(second.source_rows, 7);
        assert_eq!(second.pruned, 7);

        let weekly = rollover
            .records(brand, Granularity::Weekly, TimeRange::new(d(1, 1), d(2, 1)).unwrap())
            .await
            .unwrap();
        let female = weekly
            .iter()
            .find(|r| r.breakdown_type == BreakdownType::Gender)
            .unwrap();
        assert_eq!(female.metrics.impressions, 3500);
        assert_eq!(weekly.len(), 3);
        assert_eq!(store.demographic_count(Granularity::Daily).await, 0);
        assert_eq!(
            rollover.bucket_state(brand, BreakdownType::Gender, d(1, 10)).await.unwrap(),
            BucketState::RolledToWeekly
        );

        let third = rollover.run(brand, Granularity::Weekly, d(2, 1)).await.unwrap();
        assert_eq!(third.buckets_applied, 0);
    }

    #[test]
    fn aggregation_is_order_independent() {
        let brand = Uuid::new_v4();
        let mut rows: Vec<_> = (8..=14)
            .map(|day| daily_row(brand, d(1, day), "18-24", 0.1 * f64::from(day), 1000))
            .collect();
        let bucket = DateBucket::containing(d(1, 8), Granularity::Weekly);
        let forward = aggregate_bucket(&rows, bucket);
        rows.reverse();
        let backward = aggregate_bucket(&rows, bucket);
        assert_eq!(forward[0].metrics, backward[0].metrics);
        assert_eq!(forward[0].ratios, backward[0].ratios);
    }
}
