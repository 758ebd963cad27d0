//! Date-range math: half-open sync windows, backfill chunking, rollover buckets.

use std::cmp::{max, min};

use chrono::{Datelike, Days, Months, NaiveDate};
use serde::{Deserialize, Serialize};

use crate::{Granularity, Result, SyncError};

/// Half-open day range `[since, until)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TimeRange {
    pub since: NaiveDate,
    pub until: NaiveDate,
}

impl TimeRange {
    pub fn new(since: NaiveDate, until: NaiveDate) -> Result<Self> {
        let range = Self { since, until };
        range.validate()?;
        Ok(range)
    }

    pub fn single_day(date: NaiveDate) -> Self {
        Self {
            since: date,
            until: next_day(date),
        }
    }

    /// Window of `days` days ending with (and including) `last_day`.
    pub fn ending_on(last_day: NaiveDate, days: u32) -> Self {
        let until = next_day(last_day);
        Self {
            since: until - Days::new(u64::from(days.max(1))),
            until,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.since >= self.until {
            return Err(SyncError::validation(format!(
                "time range is empty: since {} must be before until {}",
                self.since, self.until
            )));
        }
        Ok(())
    }

    pub fn days(&self) -> u32 {
        u32::try_from((self.until - self.since).num_days().max(0)).unwrap_or(u32::MAX)
    }

    pub fn contains(&self, date: NaiveDate) -> bool {
        date >= self.since && date < self.until
    }

    /// Inclusive last day, which is what the upstream `time_range` expects.
    pub fn last_day(&self) -> NaiveDate {
        self.until.pred_opt().unwrap_or(self.since)
    }

    pub fn iter_days(&self) -> impl Iterator<Item = NaiveDate> {
        let until = self.until;
        std::iter::successors(Some(self.since), |d| d.succ_opt()).take_while(move |d| *d < until)
    }

    /// Split into contiguous, non-overlapping chunks, oldest first.
    pub fn chunks(&self, size: ChunkSize) -> Vec<TimeRange> {
        let mut out = Vec::new();
        let mut cursor = self.since;
        while cursor < self.until {
            let boundary = match size {
                ChunkSize::Month => month_start(cursor) + Months::new(1),
                ChunkSize::Days(n) => cursor + Days::new(u64::from(n.max(1))),
            };
            let end = min(boundary, self.until);
            out.push(TimeRange {
                since: cursor,
                until: end,
            });
            cursor = end;
        }
        out
    }

    /// The newest chunk of `[floor, self.since)` aligned like [`TimeRange::chunks`].
    pub fn previous_chunk(&self, floor: NaiveDate, size: ChunkSize) -> Option<TimeRange> {
        if self.since <= floor {
            return None;
        }
        TimeRange {
            since: floor,
            until: self.since,
        }
        .chunks(size)
        .pop()
    }
}

impl std::fmt::Display for TimeRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}, {})", self.since, self.until)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ChunkSize {
    #[default]
    Month,
    Days(u32),
}

/// Inclusive date bucket used by the rollover ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DateBucket {
    pub start: NaiveDate,
    pub end: NaiveDate,
    pub granularity: Granularity,
}

impl DateBucket {
    /// Bucket of `granularity` containing `date`.
    ///
    /// Weekly buckets are ISO weeks clipped to the calendar month, so every
    /// monthly bucket is an exact union of weekly buckets.
    pub fn containing(date: NaiveDate, granularity: Granularity) -> Self {
        let (start, end) = match granularity {
            Granularity::Daily => (date, date),
            Granularity::Weekly => {
                let monday = date - Days::new(u64::from(date.weekday().num_days_from_monday()));
                let sunday = monday + Days::new(6);
                (max(monday, month_start(date)), min(sunday, month_end(date)))
            }
            Granularity::Monthly => (month_start(date), month_end(date)),
        };
        Self {
            start,
            end,
            granularity,
        }
    }

    pub fn contains(&self, date: NaiveDate) -> bool {
        date >= self.start && date <= self.end
    }

    pub fn days(&self) -> u32 {
        u32::try_from((self.end - self.start).num_days() + 1).unwrap_or(0)
    }

    pub fn as_range(&self) -> TimeRange {
        TimeRange {
            since: self.start,
            until: next_day(self.end),
        }
    }
}

pub fn next_day(date: NaiveDate) -> NaiveDate {
    date.succ_opt().unwrap_or(NaiveDate::MAX)
}

pub fn month_start(date: NaiveDate) -> NaiveDate {
    date - Days::new(u64::from(date.day0()))
}

pub fn month_end(date: NaiveDate) -> NaiveDate {
    (month_start(date) + Months::new(1))
        .pred_opt()
        .unwrap_or(date)
}

/// Collapse a set of dates into maximal runs of consecutive days.
pub fn contiguous_ranges(dates: &[NaiveDate]) -> Vec<TimeRange> {
    let mut sorted = dates.to_vec();
    sorted.sort_unstable();
    sorted.dedup();

    let mut out: Vec<TimeRange> = Vec::new();
    for date in sorted {
        match out.last_mut() {
            Some(last) if last.until == date => last.until = next_day(date),
            _ => out.push(TimeRange::single_day(date)),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).unwrap()
    }

    #[test]
    fn monthly_chunks_cover_365_days_exactly() {
        let start = d(2023, 3, 17);
        let range = TimeRange::new(start, start + Days::new(365)).unwrap();
        let chunks = range.chunks(ChunkSize::Month);

        assert_eq!(chunks.first().unwrap().since, range.since);
        assert_eq!(chunks.last().unwrap().until, range.until);
        for pair in chunks.windows(2) {
            assert_eq!(pair[0].until, pair[1].since, "chunks must be contiguous");
            assert!(pair[0].since < pair[0].until);
        }
        let total: u32 = chunks.iter().map(TimeRange::days).sum();
        assert_eq!(total, 365);
        assert_eq!(chunks.len(), 13);
        assert!(chunks.iter().skip(1).all(|c| c.since.day() == 1));
    }

    #[test]
    fn fixed_day_chunks_truncate_last_chunk() {
        let range = TimeRange::new(d(2024, 1, 1), d(2024, 1, 11)).unwrap();
        let chunks = range.chunks(ChunkSize::Days(4));
        let lens: Vec<u32> = chunks.iter().map(TimeRange::days).collect();
        assert_eq!(lens, vec![4, 4, 2]);
    }

    #[test]
    fn empty_range_is_rejected() {
        assert!(TimeRange::new(d(2024, 1, 2), d(2024, 1, 2)).is_err());
        assert!(TimeRange::new(d(2024, 1, 3), d(2024, 1, 2)).is_err());
    }

    #[test]
    fn previous_chunk_walks_back_to_floor() {
        let floor = d(2024, 1, 15);
        let current = TimeRange::new(d(2024, 3, 1), d(2024, 3, 20)).unwrap();
        let prev = current.previous_chunk(floor, ChunkSize::Month).unwrap();
        assert_eq!(prev, TimeRange::new(d(2024, 2, 1), d(2024, 3, 1)).unwrap());
        let prev = prev.previous_chunk(floor, ChunkSize::Month).unwrap();
        assert_eq!(prev, TimeRange::new(floor, d(2024, 2, 1)).unwrap());
        assert!(prev.previous_chunk(floor, ChunkSize::Month).is_none());
    }

    #[test]
    fn weekly_buckets_are_clipped_to_month() {
        // 2024-01-31 is a Wednesday; its ISO week runs Jan 29 - Feb 4.
        let jan = DateBucket::containing(d(2024, 1, 31), Granularity::Weekly);
        assert_eq!((jan.start, jan.end), (d(2024, 1, 29), d(2024, 1, 31)));
        let feb = DateBucket::containing(d(2024, 2, 2), Granularity::Weekly);
        assert_eq!((feb.start, feb.end), (d(2024, 2, 1), d(2024, 2, 4)));
        let month = DateBucket::containing(d(2024, 2, 10), Granularity::Monthly);
        assert_eq!((month.start, month.end), (d(2024, 2, 1), d(2024, 2, 29)));
        assert_eq!(month.days(), 29);
    }

    #[test]
    fn contiguous_ranges_merge_neighbours() {
        let ranges = contiguous_ranges(&[d(2024, 1, 5), d(2024, 1, 3), d(2024, 1, 4), d(2024, 1, 9)]);
        assert_eq!(
            ranges,
            vec![
                TimeRange::new(d(2024, 1, 3), d(2024, 1, 6)).unwrap(),
                TimeRange::single_day(d(2024, 1, 9)),
            ]
        );
    }
}
