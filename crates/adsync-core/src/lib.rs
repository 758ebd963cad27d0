//! Core domain model for adsync: sync jobs, connections, metric rows,
//! rollover ledger and progress state.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

mod error;
mod range;

pub use error::{ErrorClass, Result, SyncError};
pub use range::{
    contiguous_ranges, month_end, month_start, next_day, ChunkSize, DateBucket, TimeRange,
};

pub const CRATE_NAME: &str = "adsync-core";

/// Declares a snake_case string enum with `as_str`, `Display` and `FromStr`.
macro_rules! string_enum {
    ($(#[$meta:meta])* $name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        pub enum $name {
            $(#[serde(rename = $text)] $variant),+
        }

        impl $name {
            pub const ALL: &'static [$name] = &[$($name::$variant),+];

            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $text),+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = SyncError;

            fn from_str(s: &str) -> Result<Self> {
                match s {
                    $($text => Ok($name::$variant),)+
                    other => Err(SyncError::validation(format!(
                        "unknown {} `{}`",
                        stringify!($name),
                        other
                    ))),
                }
            }
        }
    };
}

string_enum!(
    /// Scheduling priority; `High` is dequeued first.
    Priority {
        Low => "low",
        Normal => "normal",
        High => "high",
    }
);

impl Priority {
    pub fn rank(&self) -> i16 {
        match self {
            Self::Low => 0,
            Self::Normal => 1,
            Self::High => 2,
        }
    }

    pub fn from_rank(rank: i16) -> Self {
        match rank {
            i16::MIN..=0 => Self::Low,
            1 => Self::Normal,
            _ => Self::High,
        }
    }
}

impl Default for Priority {
    fn default() -> Self {
        Self::Normal
    }
}

string_enum!(JobKind {
    HistoricalMetrics => "historical_metrics",
    HistoricalDemographics => "historical_demographics",
    DailyRefresh => "daily_refresh",
    Rollover => "rollover",
});

string_enum!(JobStatus {
    Waiting => "waiting",
    Active => "active",
    Completed => "completed",
    Failed => "failed",
    Delayed => "delayed",
});

impl JobStatus {
    pub fn is_pending(&self) -> bool {
        matches!(self, Self::Waiting | Self::Delayed)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

string_enum!(
    /// Aggregation level of a metric row. Part of the natural key so account
    /// summaries and per-ad rows can never share a key.
    MetricLevel {
        Account => "account",
        Campaign => "campaign",
        AdSet => "adset",
        Ad => "ad",
    }
);

string_enum!(
    /// Demographic dimension; the upstream API takes one per request.
    BreakdownType {
        Age => "age",
        Gender => "gender",
        Country => "country",
        Region => "region",
        Device => "device",
        Placement => "placement",
    }
);

impl BreakdownType {
    /// Value passed in the upstream `breakdowns` parameter.
    pub fn api_param(&self) -> &'static str {
        match self {
            Self::Age => "age",
            Self::Gender => "gender",
            Self::Country => "country",
            Self::Region => "region",
            Self::Device => "impression_device",
            Self::Placement => "publisher_platform",
        }
    }
}

string_enum!(Granularity {
    Daily => "daily",
    Weekly => "weekly",
    Monthly => "monthly",
});

impl Granularity {
    /// The coarser granularity this one rolls into.
    pub fn coarser(&self) -> Option<Granularity> {
        match self {
            Self::Daily => Some(Self::Weekly),
            Self::Weekly => Some(Self::Monthly),
            Self::Monthly => None,
        }
    }

    pub fn finer(&self) -> Option<Granularity> {
        match self {
            Self::Daily => None,
            Self::Weekly => Some(Self::Daily),
            Self::Monthly => Some(Self::Weekly),
        }
    }
}

string_enum!(ConnectionStatus {
    Active => "active",
    Inactive => "inactive",
    Disconnected => "disconnected",
});

string_enum!(SyncStatus {
    Idle => "idle",
    Syncing => "syncing",
    Synced => "synced",
    Stalled => "stalled",
    ReconnectRequired => "reconnect_required",
});

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct ConnectionMetadata {
    pub ad_account_id: String,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// An OAuth-linked ad account. Token and metadata are owned by the external
/// auth flow; the core only reads them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlatformConnection {
    pub id: Uuid,
    pub brand_id: Uuid,
    pub platform: String,
    pub access_token: String,
    pub status: ConnectionStatus,
    pub sync_status: SyncStatus,
    pub metadata: ConnectionMetadata,
    pub created_at: DateTime<Utc>,
}

impl PlatformConnection {
    pub fn is_active(&self) -> bool {
        self.status == ConnectionStatus::Active
    }
}

/// Remaining work of a self-continuing demographic backfill stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DemographicStream {
    /// Oldest day the stream must reach.
    pub floor: NaiveDate,
    /// Exclusive upper bound used when the stream moves to its next dimension.
    pub ceiling: NaiveDate,
    /// Dimensions this stream picks up after the current one reaches `floor`.
    #[serde(default)]
    pub queued_breakdowns: Vec<BreakdownType>,
}

/// Kind-specific job payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum JobTask {
    HistoricalMetrics {
        connection_id: Uuid,
        time_range: TimeRange,
        level: MetricLevel,
    },
    HistoricalDemographics {
        connection_id: Uuid,
        time_range: TimeRange,
        breakdown: BreakdownType,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        stream: Option<DemographicStream>,
    },
    DailyRefresh {
        connection_id: Uuid,
        time_range: TimeRange,
    },
    Rollover {
        target: Granularity,
    },
}

impl JobTask {
    pub fn kind(&self) -> JobKind {
        match self {
            Self::HistoricalMetrics { .. } => JobKind::HistoricalMetrics,
            Self::HistoricalDemographics { .. } => JobKind::HistoricalDemographics,
            Self::DailyRefresh { .. } => JobKind::DailyRefresh,
            Self::Rollover { .. } => JobKind::Rollover,
        }
    }

    pub fn connection_id(&self) -> Option<Uuid> {
        match self {
            Self::HistoricalMetrics { connection_id, .. }
            | Self::HistoricalDemographics { connection_id, .. }
            | Self::DailyRefresh { connection_id, .. } => Some(*connection_id),
            Self::Rollover { .. } => None,
        }
    }

    pub fn time_range(&self) -> Option<TimeRange> {
        match self {
            Self::HistoricalMetrics { time_range, .. }
            | Self::HistoricalDemographics { time_range, .. }
            | Self::DailyRefresh { time_range, .. } => Some(*time_range),
            Self::Rollover { .. } => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncJob {
    pub id: Uuid,
    pub brand_id: Uuid,
    pub task: JobTask,
    pub priority: Priority,
    pub status: JobStatus,
    pub attempts: u32,
    pub max_attempts: u32,
    pub run_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Monotonic enqueue order, assigned by the store.
    pub seq: i64,
    pub locked_by: Option<String>,
    pub lease_until: Option<DateTime<Utc>>,
    pub cancel_requested: bool,
    pub last_error: Option<String>,
}

impl SyncJob {
    pub fn new(brand_id: Uuid, task: JobTask, priority: Priority, max_attempts: u32) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            brand_id,
            task,
            priority,
            status: JobStatus::Waiting,
            attempts: 0,
            max_attempts: max_attempts.max(1),
            run_at: now,
            created_at: now,
            updated_at: now,
            seq: 0,
            locked_by: None,
            lease_until: None,
            cancel_requested: false,
            last_error: None,
        }
    }

    pub fn kind(&self) -> JobKind {
        self.task.kind()
    }

    pub fn connection_id(&self) -> Option<Uuid> {
        self.task.connection_id()
    }

    pub fn time_range(&self) -> Option<TimeRange> {
        self.task.time_range()
    }

    /// Ready to be handed to a worker at `now`. Active jobs whose lease ran
    /// out are redelivered.
    pub fn is_ready(&self, now: DateTime<Utc>) -> bool {
        match self.status {
            JobStatus::Waiting | JobStatus::Delayed => self.run_at <= now,
            JobStatus::Active => self.lease_until.is_some_and(|lease| lease <= now),
            JobStatus::Completed | JobStatus::Failed => false,
        }
    }

    /// Counts against the per-connection admission limit at `now`.
    pub fn holds_connection(&self, now: DateTime<Utc>) -> bool {
        self.status == JobStatus::Active && self.lease_until.map_or(true, |lease| lease > now)
    }
}

/// Loosely-typed job request as it arrives from callers; validated into a
/// [`JobTask`] before it reaches the queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobSpec {
    pub kind: JobKind,
    #[serde(default)]
    pub brand_id: Option<Uuid>,
    #[serde(default)]
    pub connection_id: Option<Uuid>,
    #[serde(default)]
    pub time_range: Option<TimeRange>,
    #[serde(default)]
    pub breakdown: Option<BreakdownType>,
    #[serde(default)]
    pub level: Option<MetricLevel>,
    #[serde(default)]
    pub target: Option<Granularity>,
    #[serde(default)]
    pub stream: Option<DemographicStream>,
    #[serde(default)]
    pub priority: Option<Priority>,
    #[serde(default)]
    pub delay_secs: Option<u64>,
    #[serde(default)]
    pub max_attempts: Option<u32>,
}

impl JobSpec {
    pub fn new(kind: JobKind, brand_id: Uuid) -> Self {
        Self {
            kind,
            brand_id: Some(brand_id),
            connection_id: None,
            time_range: None,
            breakdown: None,
            level: None,
            target: None,
            stream: None,
            priority: None,
            delay_secs: None,
            max_attempts: None,
        }
    }

    pub fn historical_metrics(brand_id: Uuid, connection_id: Uuid, range: TimeRange) -> Self {
        Self {
            connection_id: Some(connection_id),
            time_range: Some(range),
            ..Self::new(JobKind::HistoricalMetrics, brand_id)
        }
    }

    pub fn historical_demographics(
        brand_id: Uuid,
        connection_id: Uuid,
        range: TimeRange,
        breakdown: BreakdownType,
    ) -> Self {
        Self {
            connection_id: Some(connection_id),
            time_range: Some(range),
            breakdown: Some(breakdown),
            ..Self::new(JobKind::HistoricalDemographics, brand_id)
        }
    }

    pub fn daily_refresh(brand_id: Uuid, connection_id: Uuid, range: TimeRange) -> Self {
        Self {
            connection_id: Some(connection_id),
            time_range: Some(range),
            ..Self::new(JobKind::DailyRefresh, brand_id)
        }
    }

    pub fn rollover(brand_id: Uuid, target: Granularity) -> Self {
        Self {
            target: Some(target),
            ..Self::new(JobKind::Rollover, brand_id)
        }
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn with_stream(mut self, stream: DemographicStream) -> Self {
        self.stream = Some(stream);
        self
    }

    /// Check the fields required by `kind` and build the typed payload.
    pub fn validate(&self) -> Result<(Uuid, JobTask)> {
        let brand_id = self
            .brand_id
            .ok_or_else(|| SyncError::validation(format!("{} job requires brand_id", self.kind)))?;
        let task = match self.kind {
            JobKind::HistoricalMetrics => JobTask::HistoricalMetrics {
                connection_id: self.require_connection()?,
                time_range: self.require_range()?,
                level: self.level.unwrap_or(MetricLevel::Ad),
            },
            JobKind::HistoricalDemographics => {
                let time_range = self.require_range()?;
                if let Some(stream) = &self.stream {
                    if stream.floor > time_range.since || stream.ceiling < time_range.until {
                        return Err(SyncError::validation(format!(
                            "demographic stream bounds [{}, {}) do not contain {}",
                            stream.floor, stream.ceiling, time_range
                        )));
                    }
                }
                JobTask::HistoricalDemographics {
                    connection_id: self.require_connection()?,
                    time_range,
                    breakdown: self.breakdown.ok_or_else(|| {
                        SyncError::validation("historical_demographics job requires breakdown")
                    })?,
                    stream: self.stream.clone(),
                }
            }
            JobKind::DailyRefresh => JobTask::DailyRefresh {
                connection_id: self.require_connection()?,
                time_range: self.require_range()?,
            },
            JobKind::Rollover => {
                let target = self
                    .target
                    .ok_or_else(|| SyncError::validation("rollover job requires target granularity"))?;
                if target == Granularity::Daily {
                    return Err(SyncError::validation(
                        "rollover target must be weekly or monthly",
                    ));
                }
                JobTask::Rollover { target }
            }
        };
        if self.max_attempts == Some(0) {
            return Err(SyncError::validation("max_attempts must be at least 1"));
        }
        Ok((brand_id, task))
    }

    fn require_connection(&self) -> Result<Uuid> {
        self.connection_id
            .ok_or_else(|| SyncError::validation(format!("{} job requires connection_id", self.kind)))
    }

    fn require_range(&self) -> Result<TimeRange> {
        let range = self
            .time_range
            .ok_or_else(|| SyncError::validation(format!("{} job requires time_range", self.kind)))?;
        range.validate()?;
        Ok(range)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct QueueStats {
    pub waiting: u64,
    pub active: u64,
    pub completed: u64,
    pub failed: u64,
    pub delayed: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", content = "status", rename_all = "snake_case")]
pub enum RemoveOutcome {
    Removed,
    CancellationRequested,
    NotRemovable(JobStatus),
    NotFound,
}

/// Raw counters reported by the upstream API.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
pub struct MetricValues {
    pub spend: f64,
    pub impressions: u64,
    pub clicks: u64,
    pub conversions: f64,
    pub reach: u64,
}

impl MetricValues {
    pub fn add(&mut self, other: &MetricValues) {
        self.spend += other.spend;
        self.impressions += other.impressions;
        self.clicks += other.clicks;
        self.conversions += other.conversions;
        self.reach += other.reach;
    }

    pub fn ratios(&self) -> DerivedRatios {
        DerivedRatios::from_values(self)
    }
}

/// Ratios recomputed from counters; zero when the denominator is zero.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
pub struct DerivedRatios {
    pub ctr: f64,
    pub cpc: f64,
    pub cpm: f64,
}

impl DerivedRatios {
    pub fn from_values(values: &MetricValues) -> Self {
        let ratio = |num: f64, den: u64| if den == 0 { 0.0 } else { num / den as f64 };
        Self {
            ctr: ratio(values.clicks as f64 * 100.0, values.impressions),
            cpc: ratio(values.spend, values.clicks),
            cpm: ratio(values.spend * 1000.0, values.impressions),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DailyMetricKey {
    pub brand_id: Uuid,
    pub platform: String,
    pub date: NaiveDate,
    pub ad_id: String,
    pub level: MetricLevel,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DailyMetricRecord {
    pub brand_id: Uuid,
    pub platform: String,
    pub date: NaiveDate,
    /// Entity id at `level`: the ad account id for account rows, the ad id for ad rows.
    pub ad_id: String,
    pub level: MetricLevel,
    pub account_id: String,
    pub campaign_id: Option<String>,
    pub ad_name: Option<String>,
    pub metrics: MetricValues,
    pub ratios: DerivedRatios,
    pub updated_at: DateTime<Utc>,
}

impl DailyMetricRecord {
    pub fn key(&self) -> DailyMetricKey {
        DailyMetricKey {
            brand_id: self.brand_id,
            platform: self.platform.clone(),
            date: self.date,
            ad_id: self.ad_id.clone(),
            level: self.level,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DemographicKey {
    pub brand_id: Uuid,
    pub platform: String,
    pub date_range_start: NaiveDate,
    pub date_range_end: NaiveDate,
    pub granularity: Granularity,
    pub breakdown_type: BreakdownType,
    pub breakdown_value: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DemographicBreakdownRecord {
    pub brand_id: Uuid,
    pub platform: String,
    /// Inclusive start.
    pub date_range_start: NaiveDate,
    /// Inclusive end.
    pub date_range_end: NaiveDate,
    pub granularity: Granularity,
    pub breakdown_type: BreakdownType,
    pub breakdown_value: String,
    pub metrics: MetricValues,
    pub ratios: DerivedRatios,
    pub updated_at: DateTime<Utc>,
}

impl DemographicBreakdownRecord {
    pub fn key(&self) -> DemographicKey {
        DemographicKey {
            brand_id: self.brand_id,
            platform: self.platform.clone(),
            date_range_start: self.date_range_start,
            date_range_end: self.date_range_end,
            granularity: self.granularity,
            breakdown_type: self.breakdown_type,
            breakdown_value: self.breakdown_value.clone(),
        }
    }
}

/// Per-day sums of one metric level.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
pub struct DailyTotals {
    pub spend: f64,
    pub impressions: u64,
    pub conversions: f64,
    pub rows: u64,
}

string_enum!(LedgerStatus {
    Pending => "pending",
    Done => "done",
});

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RolloverLedgerEntry {
    pub brand_id: Uuid,
    /// Each dimension is rolled on its own, since backfill streams land one
    /// dimension after another.
    pub breakdown_type: BreakdownType,
    pub bucket_start: NaiveDate,
    pub bucket_end: NaiveDate,
    /// Granularity of the aggregate written for this bucket.
    pub granularity: Granularity,
    pub status: LedgerStatus,
    pub source_rows: u64,
    pub completed_at: Option<DateTime<Utc>>,
}

string_enum!(SyncStage {
    Queued => "queued",
    HistoricalMetrics => "historical_metrics",
    HistoricalDemographics => "historical_demographics",
    DailyRefresh => "daily_refresh",
    Complete => "complete",
});

impl From<JobKind> for SyncStage {
    fn from(kind: JobKind) -> Self {
        match kind {
            JobKind::HistoricalMetrics => Self::HistoricalMetrics,
            JobKind::HistoricalDemographics => Self::HistoricalDemographics,
            JobKind::DailyRefresh | JobKind::Rollover => Self::DailyRefresh,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncProgressState {
    pub connection_id: Uuid,
    pub stage: SyncStage,
    pub days_completed: u32,
    pub days_target: u32,
    pub percent: f64,
    pub updated_at: DateTime<Utc>,
}

impl SyncProgressState {
    pub fn percent_of(completed: u32, target: u32) -> f64 {
        if target == 0 {
            return 100.0;
        }
        (f64::from(completed.min(target)) * 100.0 / f64::from(target) * 10.0).round() / 10.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpsertOutcome {
    Inserted,
    Updated,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn range() -> TimeRange {
        TimeRange::new(
            NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(),
            NaiveDate::from_ymd_opt(2024, 2, 1).unwrap(),
        )
        .unwrap()
    }

    #[test]
    fn job_spec_requires_kind_specific_fields() {
        let brand = Uuid::new_v4();
        let conn = Uuid::new_v4();

        let mut spec = JobSpec::historical_demographics(brand, conn, range(), BreakdownType::Age);
        assert!(spec.validate().is_ok());
        spec.breakdown = None;
        assert!(matches!(spec.validate(), Err(SyncError::Validation(_))));

        let mut spec = JobSpec::historical_metrics(brand, conn, range());
        spec.connection_id = None;
        assert!(matches!(spec.validate(), Err(SyncError::Validation(_))));

        let spec = JobSpec::new(JobKind::DailyRefresh, brand);
        assert!(spec.validate().is_err());

        let (_, task) = JobSpec::rollover(brand, Granularity::Weekly).validate().unwrap();
        assert_eq!(task.kind(), JobKind::Rollover);
        assert!(task.connection_id().is_none());
        assert!(JobSpec::rollover(brand, Granularity::Daily).validate().is_err());
    }

    #[test]
    fn job_spec_parses_from_loose_json() {
        let brand = Uuid::new_v4();
        let conn = Uuid::new_v4();
        let raw = serde_json::json!({
            "kind": "daily_refresh",
            "brand_id": brand,
            "connection_id": conn,
            "time_range": {"since": "2024-01-01", "until": "2024-01-04"},
            "priority": "high"
        });
        let spec: JobSpec = serde_json::from_value(raw).unwrap();
        let (brand_id, task) = spec.validate().unwrap();
        assert_eq!(brand_id, brand);
        assert_eq!(task.time_range().unwrap().days(), 3);
        assert_eq!(spec.priority, Some(Priority::High));
    }

    #[test]
    fn task_serializes_with_kind_tag() {
        let task = JobTask::Rollover {
            target: Granularity::Monthly,
        };
        let value = serde_json::to_value(&task).unwrap();
        assert_eq!(value["kind"], "rollover");
        assert_eq!(value["target"], "monthly");
    }

    #[test]
    fn priority_orders_high_first() {
        let mut list = vec![Priority::Low, Priority::High, Priority::Normal];
        list.sort_by_key(|p| std::cmp::Reverse(p.rank()));
        assert_eq!(list, vec![Priority::High, Priority::Normal, Priority::Low]);
        assert_eq!(Priority::from_rank(2), Priority::High);
    }

    #[test]
    fn ratios_guard_zero_denominators() {
        let values = MetricValues {
            spend: 10.0,
            impressions: 2000,
            clicks: 0,
            conversions: 1.0,
            reach: 1500,
        };
        let ratios = values.ratios();
        assert_eq!(ratios.cpc, 0.0);
        assert_eq!(ratios.ctr, 0.0);
        assert!((ratios.cpm - 5.0).abs() < 1e-9);
    }

    #[test]
    fn percent_is_clamped() {
        assert_eq!(SyncProgressState::percent_of(5, 10), 50.0);
        assert_eq!(SyncProgressState::percent_of(15, 10), 100.0);
        assert_eq!(SyncProgressState::percent_of(0, 0), 100.0);
        assert_eq!(SyncProgressState::percent_of(1, 3), 33.3);
    }

    #[test]
    fn string_enums_round_trip_through_str() {
        assert_eq!("adset".parse::<MetricLevel>().unwrap(), MetricLevel::AdSet);
        assert_eq!(BreakdownType::Device.api_param(), "impression_device");
        assert!("weird".parse::<JobStatus>().is_err());
    }
}
