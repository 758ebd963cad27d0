//! Finds recent days that are missing or drifted from the upstream totals.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use adsync_adapters::{parse_metric_row, AdsApi, InsightsRequest};
use adsync_core::{
    DailyTotals, MetricLevel, PlatformConnection, Result, SyncError, TimeRange,
};
use adsync_storage::{ConnectionStore, MetricStore};
use chrono::{Days, NaiveDate};
use serde::Serialize;
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::backfill::BackfillOrchestrator;
use crate::config::{clamp_lookback, DetectorSettings};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BackfillDecision {
    pub should_backfill: bool,
    pub dates: Vec<NaiveDate>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScanReport {
    pub connection_id: Uuid,
    pub window: TimeRange,
    pub gaps: Vec<NaiveDate>,
    pub stale: Vec<NaiveDate>,
    /// Gap days an earlier sync fetched and upstream had nothing for.
    pub confirmed_empty: Vec<NaiveDate>,
    pub refresh_jobs: Vec<Uuid>,
}

impl ScanReport {
    fn empty(connection_id: Uuid, window: TimeRange) -> Self {
        Self {
            connection_id,
            window,
            gaps: Vec::new(),
            stale: Vec::new(),
            confirmed_empty: Vec::new(),
            refresh_jobs: Vec::new(),
        }
    }
}

/// `lookback` days ending yesterday; today is still accumulating upstream.
pub fn detection_window(today: NaiveDate, lookback: u32) -> TimeRange {
    let yesterday = today.checked_sub_days(Days::new(1)).unwrap_or(today);
    TimeRange::ending_on(yesterday, clamp_lookback(lookback))
}

pub fn find_gaps(window: TimeRange, counts: &BTreeMap<NaiveDate, u64>) -> Vec<NaiveDate> {
    window
        .iter_days()
        .filter(|day| counts.get(day).copied().unwrap_or(0) == 0)
        .collect()
}

pub fn totals_differ(stored: &DailyTotals, fresh: &DailyTotals, epsilon: f64) -> bool {
    (stored.spend - fresh.spend).abs() > epsilon
        || (stored.conversions - fresh.conversions).abs() > epsilon
        || stored.impressions != fresh.impressions
}

/// Days where the two maps disagree. A day absent from one side counts as
/// all zeros.
pub fn find_stale(
    window: TimeRange,
    stored: &BTreeMap<NaiveDate, DailyTotals>,
    fresh: &BTreeMap<NaiveDate, DailyTotals>,
    epsilon: f64,
) -> Vec<NaiveDate> {
    let zero = DailyTotals::default();
    window
        .iter_days()
        .filter(|day| {
            totals_differ(
                stored.get(day).unwrap_or(&zero),
                fresh.get(day).unwrap_or(&zero),
                epsilon,
            )
        })
        .collect()
}

pub fn decide_backfill(gaps: &[NaiveDate], stale: &[NaiveDate]) -> BackfillDecision {
    let dates: Vec<NaiveDate> = gaps
        .iter()
        .chain(stale)
        .copied()
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect();
    BackfillDecision {
        should_backfill: !dates.is_empty(),
        dates,
    }
}

#[derive(Clone)]
pub struct StaleDetector {
    connections: Arc<dyn ConnectionStore>,
    metrics: Arc<dyn MetricStore>,
    api: Arc<dyn AdsApi>,
    orchestrator: BackfillOrchestrator,
    settings: DetectorSettings,
    api_timeout: Duration,
}

impl StaleDetector {
    pub fn new(
        connections: Arc<dyn ConnectionStore>,
        metrics: Arc<dyn MetricStore>,
        api: Arc<dyn AdsApi>,
        orchestrator: BackfillOrchestrator,
        settings: DetectorSettings,
        api_timeout: Duration,
    ) -> Self {
        Self {
            connections,
            metrics,
            api,
            orchestrator,
            settings,
            api_timeout,
        }
    }

    pub fn window(&self, today: NaiveDate, lookback: Option<u32>) -> TimeRange {
        detection_window(today, lookback.unwrap_or(self.settings.lookback_days))
    }

    /// The brand's active connection for `platform`, if any.
    async fn active_connection(
        &self,
        brand_id: Uuid,
        platform: &str,
    ) -> Result<Option<PlatformConnection>> {
        Ok(self
            .connections
            .list_active_connections()
            .await?
            .into_iter()
            .find(|c| c.brand_id == brand_id && c.platform == platform))
    }

    /// Days in the window with no stored rows. Without an active connection
    /// there is nothing to repair.
    pub async fn detect_gaps(
        &self,
        brand_id: Uuid,
        platform: &str,
        lookback: Option<u32>,
        today: NaiveDate,
    ) -> Result<Vec<NaiveDate>> {
        match self.active_connection(brand_id, platform).await? {
            Some(connection) => self.gaps_for(&connection, self.window(today, lookback)).await,
            None => Ok(Vec::new()),
        }
    }

    /// Days whose stored account-level totals drifted from a fresh upstream read.
    pub async fn detect_stale(
        &self,
        brand_id: Uuid,
        platform: &str,
        lookback: Option<u32>,
        today: NaiveDate,
    ) -> Result<Vec<NaiveDate>> {
        match self.active_connection(brand_id, platform).await? {
            Some(connection) => self.stale_for(&connection, self.window(today, lookback)).await,
            None => Ok(Vec::new()),
        }
    }

    async fn gaps_for(
        &self,
        connection: &PlatformConnection,
        window: TimeRange,
    ) -> Result<Vec<NaiveDate>> {
        let counts = self
            .metrics
            .daily_row_counts(connection.brand_id, &connection.platform, window)
            .await?;
        Ok(find_gaps(window, &counts))
    }

    async fn stale_for(
        &self,
        connection: &PlatformConnection,
        window: TimeRange,
    ) -> Result<Vec<NaiveDate>> {
        let fresh = self.fresh_totals(connection, window).await?;
        let stored = self
            .metrics
            .daily_totals(connection.brand_id, &connection.platform, window, MetricLevel::Account)
            .await?;
        Ok(find_stale(window, &stored, &fresh, self.settings.epsilon))
    }

    async fn fresh_totals(
        &self,
        connection: &PlatformConnection,
        window: TimeRange,
    ) -> Result<BTreeMap<NaiveDate, DailyTotals>> {
        let request = InsightsRequest {
            account_id: connection.metadata.ad_account_id.clone(),
            access_token: connection.access_token.clone(),
            time_range: window,
            level: MetricLevel::Account,
            breakdown: None,
        };
        let mut totals: BTreeMap<NaiveDate, DailyTotals> = BTreeMap::new();
        let mut cursor: Option<String> = None;
        loop {
            let page = tokio::time::timeout(
                self.api_timeout,
                self.api.fetch_insights(&request, cursor.as_deref()),
            )
            .await
            .map_err(|_| SyncError::Timeout("stale check insights call".into()))??;
            for raw in &page.rows {
                match parse_metric_row(raw, MetricLevel::Account) {
                    Ok(row) if window.contains(row.date) => {
                        let entry = totals.entry(row.date).or_default();
                        entry.spend += row.metrics.spend;
                        entry.impressions += row.metrics.impressions;
                        entry.conversions += row.metrics.conversions;
                        entry.rows += 1;
                    }
                    Ok(_) => {}
                    Err(err) => warn!(error = %err, "ignoring malformed upstream row"),
                }
            }
            match page.next_cursor {
                Some(next) if cursor.as_deref() != Some(next.as_str()) => cursor = Some(next),
                _ => break,
            }
        }
        Ok(totals)
    }

    /// Detect, decide and queue refresh jobs for one connection. Gap days a
    /// completed sync already fetched are reported as confirmed empty and
    /// not queued again; drifted days always are.
    pub async fn scan_connection(
        &self,
        connection: &PlatformConnection,
        today: NaiveDate,
    ) -> Result<ScanReport> {
        let span = info_span!("scan_connection", connection_id = %connection.id);
        async move {
            let window = self.window(today, None);
            if !connection.is_active() {
                return Ok(ScanReport::empty(connection.id, window));
            }
            let gaps = self.gaps_for(connection, window).await?;
            let stale = self.stale_for(connection, window).await?;
            let synced = self
                .metrics
                .synced_days(connection.brand_id, &connection.platform, window)
                .await?;
            let (confirmed_empty, missing): (Vec<NaiveDate>, Vec<NaiveDate>) =
                gaps.iter().copied().partition(|day| synced.contains(day));
            let decision = decide_backfill(&missing, &stale);
            let refresh_jobs = if decision.should_backfill {
                info!(
                    gaps = missing.len(),
                    stale = stale.len(),
                    "queueing refresh for missing or drifted days"
                );
                self.orchestrator.queue_refresh(connection, &decision.dates).await?
            } else {
                Vec::new()
            };
            Ok(ScanReport {
                connection_id: connection.id,
                window,
                gaps,
                stale,
                confirmed_empty,
                refresh_jobs,
            })
        }
        .instrument(span)
        .await
    }

    /// Scan every active connection; one failing connection does not stop
    /// the others.
    pub async fn scan_all(&self, today: NaiveDate) -> Result<Vec<ScanReport>> {
        let mut reports = Vec::new();
        for connection in self.connections.list_active_connections().await? {
            match self.scan_connection(&connection, today).await {
                Ok(report) => reports.push(report),
                Err(err) => warn!(connection_id = %connection.id, error = %err, "scan failed"),
            }
        }
        Ok(reports)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use adsync_adapters::{FixtureAdsApi, InsightsPage};
    use adsync_core::{
        ConnectionMetadata, ConnectionStatus, DailyMetricRecord, DerivedRatios, JobStatus,
        MetricValues, SyncStatus,
    };
    use adsync_storage::{JobStore, MemoryStore};
    use chrono::Utc;
    use serde_json::json;

    use crate::config::BackfillSettings;
    use crate::queue::JobQueue;

    fn d(day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 5, day).unwrap()
    }

    fn connection() -> PlatformConnection {
        PlatformConnection {
            id: Uuid::new_v4(),
            brand_id: Uuid::new_v4(),
            platform: "meta".into(),
            access_token: "token".into(),
            status: ConnectionStatus::Active,
            sync_status: SyncStatus::Synced,
            metadata: ConnectionMetadata {
                ad_account_id: "act_9".into(),
                extra: Default::default(),
            },
            created_at: Utc::now(),
        }
    }

    fn account_record(conn: &PlatformConnection, date: NaiveDate, spend: f64) -> DailyMetricRecord {
        DailyMetricRecord {
            brand_id: conn.brand_id,
            platform: conn.platform.clone(),
            date,
            ad_id: "9".into(),
            level: MetricLevel::Account,
            account_id: "9".into(),
            campaign_id: None,
            ad_name: None,
            metrics: MetricValues {
                spend,
                impressions: 100,
                clicks: 1,
                conversions: 0.0,
                reach: 50,
            },
            ratios: DerivedRatios::default(),
            updated_at: Utc::now(),
        }
    }

    fn upstream_row(date: NaiveDate, spend: &str) -> serde_json::Value {
        json!({
            "date_start": date.to_string(),
            "date_stop": date.to_string(),
            "account_id": "9",
            "spend": spend,
            "impressions": "100"
        })
    }

    fn detector(store: Arc<MemoryStore>, api: Arc<FixtureAdsApi>) -> StaleDetector {
        let queue = JobQueue::new(store.clone(), 5, Duration::from_secs(60));
        let orchestrator = BackfillOrchestrator::new(
            queue,
            store.clone(),
            store.clone(),
            BackfillSettings::default(),
        );
        StaleDetector::new(
            store.clone(),
            store,
            api,
            orchestrator,
            DetectorSettings {
                lookback_days: 5,
                epsilon: 0.01,
            },
            Duration::from_secs(5),
        )
    }

    #[test]
    fn window_ends_yesterday_and_is_clamped() {
        let window = detection_window(d(10), 5);
        assert_eq!(window, TimeRange::new(d(5), d(10)).unwrap());
        assert_eq!(detection_window(d(10), 0).days(), 1);
        assert_eq!(detection_window(d(10), 400).days(), 90);
    }

    #[test]
    fn gaps_are_exactly_the_empty_days() {
        let window = TimeRange::new(d(1), d(6)).unwrap();
        let counts = BTreeMap::from([(d(1), 3), (d(2), 0), (d(4), 1)]);
        assert_eq!(find_gaps(window, &counts), vec![d(2), d(3), d(5)]);
    }

    #[test]
    fn stale_uses_epsilon_for_money_and_exact_impressions() {
        let stored = DailyTotals {
            spend: 10.0,
            impressions: 100,
            conversions: 1.0,
            rows: 1,
        };
        let close = DailyTotals {
            spend: 10.005,
            ..stored
        };
        assert!(!totals_differ(&stored, &close, 0.01));
        let drifted = DailyTotals {
            spend: 10.5,
            ..stored
        };
        assert!(totals_differ(&stored, &drifted, 0.01));
        let more_impressions = DailyTotals {
            impressions: 101,
            ..stored
        };
        assert!(totals_differ(&stored, &more_impressions, 0.01));
    }

    #[test]
    fn decision_is_sorted_union() {
        let decision = decide_backfill(&[d(4), d(1)], &[d(1), d(3)]);
        assert!(decision.should_backfill);
        assert_eq!(decision.dates, vec![d(1), d(3), d(4)]);
        assert!(!decide_backfill(&[], &[]).should_backfill);
    }

    #[tokio::test]
    async fn inactive_connections_report_nothing() {
        let store = Arc::new(MemoryStore::new());
        let api = Arc::new(FixtureAdsApi::new());
        let detector = detector(store.clone(), api.clone());
        let mut conn = connection();
        conn.status = ConnectionStatus::Inactive;
        store.upsert_connection(&conn).await.unwrap();
        let gaps = detector.detect_gaps(conn.brand_id, "meta", None, d(10)).await.unwrap();
        assert!(gaps.is_empty());
        let stale = detector.detect_stale(conn.brand_id, "meta", None, d(10)).await.unwrap();
        assert!(stale.is_empty());
        let report = detector.scan_connection(&conn, d(10)).await.unwrap();
        assert!(report.gaps.is_empty() && report.refresh_jobs.is_empty());
        assert!(api.calls().await.is_empty());
    }

    #[tokio::test]
    async fn scan_queues_refresh_for_contiguous_runs() {
        let store = Arc::new(MemoryStore::new());
        let conn = connection();
        store.upsert_connection(&conn).await.unwrap();
        // Window is May 5..=9. May 7 is missing, May 9 drifted upstream.
        for (day, spend) in [(5, 1.0), (6, 2.0), (8, 4.0), (9, 5.0)] {
            store.upsert_daily_metric(&account_record(&conn, d(day), spend)).await.unwrap();
        }
        let api = Arc::new(FixtureAdsApi::with_script([
            Ok(InsightsPage {
                rows: vec![upstream_row(d(5), "1.00"), upstream_row(d(6), "2.00")],
                next_cursor: Some("p2".into()),
            }),
            Ok(InsightsPage {
                rows: vec![upstream_row(d(8), "4.00"), upstream_row(d(9), "7.25")],
                next_cursor: None,
            }),
        ]));
        let detector = detector(store.clone(), api);

        let report = detector.scan_connection(&conn, d(10)).await.unwrap();
        assert_eq!(report.gaps, vec![d(7)]);
        assert_eq!(report.stale, vec![d(9)]);
        assert_eq!(report.refresh_jobs.len(), 2);

        let jobs = store.list_jobs(JobStatus::Waiting, 10).await.unwrap();
        let ranges: Vec<TimeRange> = jobs.iter().filter_map(|j| j.time_range()).collect();
        assert_eq!(ranges, vec![TimeRange::single_day(d(7)), TimeRange::single_day(d(9))]);
    }

    #[tokio::test]
    async fn clean_window_queues_nothing() {
        let store = Arc::new(MemoryStore::new());
        let conn = connection();
        for day in 5..=9 {
            store.upsert_daily_metric(&account_record(&conn, d(day), 1.0)).await.unwrap();
        }
        let api = Arc::new(FixtureAdsApi::with_script([Ok(InsightsPage {
            rows: (5..=9).map(|day| upstream_row(d(day), "1.00")).collect(),
            next_cursor: None,
        })]));
        let report = detector(store.clone(), api).scan_connection(&conn, d(10)).await.unwrap();
        assert!(report.gaps.is_empty() && report.stale.is_empty());
        assert!(report.refresh_jobs.is_empty());
        assert_eq!(store.job_count().await, 0);
    }

    #[tokio::test]
    async fn synced_empty_days_are_not_requeued() {
        let store = Arc::new(MemoryStore::new());
        let conn = connection();
        store.upsert_connection(&conn).await.unwrap();
        for day in [5, 6, 8, 9] {
            store.upsert_daily_metric(&account_record(&conn, d(day), 1.0)).await.unwrap();
        }
        // May 7 was fetched in full and upstream had no activity.
        store
            .mark_days_synced(conn.brand_id, "meta", TimeRange::new(d(5), d(10)).unwrap())
            .await
            .unwrap();
        let api = Arc::new(FixtureAdsApi::with_script([Ok(InsightsPage {
            rows: [5, 6, 8, 9].map(|day| upstream_row(d(day), "1.00")).to_vec(),
            next_cursor: None,
        })]));
        let detector = detector(store.clone(), api);

        let gaps = detector.detect_gaps(conn.brand_id, "meta", None, d(10)).await.unwrap();
        assert_eq!(gaps, vec![d(7)]);

        let report = detector.scan_connection(&conn, d(10)).await.unwrap();
        assert_eq!(report.gaps, vec![d(7)]);
        assert_eq!(report.confirmed_empty, vec![d(7)]);
        assert!(report.refresh_jobs.is_empty());
        assert_eq!(store.job_count().await, 0);
    }
}
