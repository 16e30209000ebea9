//! Read-side aggregation over the storage port.
use crate::record::{RecordKind, TrafficRecord};
use crate::store::{StorageError, TrafficStore};
use crate::types::{KindTotals, RepositorySummary, StarSnapshot, now};
use chrono::{DateTime, Duration, NaiveDate, NaiveTime, Utc};
use serde::Serialize;
use std::sync::Arc;

pub const DEFAULT_WINDOW_DAYS: u32 = 14;

/// "Last N days" relative to a query instant. A day is inside the window when
/// its UTC midnight is not older than `now - days`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TrailingWindow {
    pub days: u32,
    pub now: DateTime<Utc>,
}

impl TrailingWindow {
    pub fn new(days: u32, now: DateTime<Utc>) -> Self {
        TrailingWindow { days, now }
    }

    /// Earliest day that falls inside the window.
    /// Windows reaching past the calendar range cover all history.
    pub fn first_day(&self) -> NaiveDate {
        let Some(cutoff) = self
            .now
            .checked_sub_signed(Duration::days(i64::from(self.days)))
        else {
            return NaiveDate::MIN;
        };
        let day = cutoff.date_naive();
        if cutoff.time() == NaiveTime::MIN {
            day
        } else {
            day.succ_opt().unwrap_or(day)
        }
    }

    pub fn contains(&self, day: NaiveDate) -> bool {
        day >= self.first_day()
    }
}

/// Client-side computation of a summary from fetched history. The SQL backend
/// computes the same values with set-based queries.
pub fn aggregate(
    repository_id: &str,
    records: &[TrafficRecord],
    stars: Option<&StarSnapshot>,
    last_sync_at: Option<DateTime<Utc>>,
    window: &TrailingWindow,
) -> RepositorySummary {
    let first_day = window.first_day();
    let mut summary = RepositorySummary {
        repository_id: repository_id.to_string(),
        clones: KindTotals::default(),
        views: KindTotals::default(),
        recent_clones: KindTotals::default(),
        recent_views: KindTotals::default(),
        star_count: stars.map(|s| s.star_count),
        last_sync_at,
        first_collected: None,
    };

    for record in records.iter().filter(|r| r.repository_id == repository_id) {
        let count = u64::from(record.count);
        let uniques = u64::from(record.unique_count);
        let (total, recent) = match record.kind {
            RecordKind::Clone => (&mut summary.clones, &mut summary.recent_clones),
            RecordKind::View => (&mut summary.views, &mut summary.recent_views),
        };
        total.add(count, uniques);
        if record.day >= first_day {
            recent.add(count, uniques);
        }

        summary.first_collected = Some(match summary.first_collected {
            Some(day) => day.min(record.day),
            None => record.day,
        });
    }

    summary
}

/// Totals across every summarized repository.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct OverallTotals {
    pub repositories: usize,
    pub clones: KindTotals,
    pub views: KindTotals,
    pub recent_clones: KindTotals,
    pub recent_views: KindTotals,
    pub stars: u64,
}

impl OverallTotals {
    pub fn from_summaries(summaries: &[RepositorySummary]) -> Self {
        let mut totals = OverallTotals {
            repositories: summaries.len(),
            ..Default::default()
        };
        for s in summaries {
            totals.clones.add(s.clones.count, s.clones.uniques);
            totals.views.add(s.views.count, s.views.uniques);
            totals.recent_clones.add(s.recent_clones.count, s.recent_clones.uniques);
            totals.recent_views.add(s.recent_views.count, s.recent_views.uniques);
            totals.stars += u64::from(s.star_count.unwrap_or(0));
        }
        totals
    }
}

/// Query layer used by the dashboard surface. The trailing window is evaluated
/// against the wall clock at query time.
#[derive(Clone)]
pub struct Stats {
    store: Arc<dyn TrafficStore>,
    window_days: u32,
}

impl Stats {
    pub fn new(store: Arc<dyn TrafficStore>, window_days: u32) -> Self {
        Stats { store, window_days }
    }

    pub fn window_days(&self) -> u32 {
        self.window_days
    }

    fn window_at(&self, now: DateTime<Utc>) -> TrailingWindow {
        TrailingWindow::new(self.window_days, now)
    }

    pub async fn summarize(
        &self,
        repository_id: &str,
        owner: Option<&str>,
    ) -> Result<RepositorySummary, StorageError> {
        self.summarize_at(repository_id, owner, now()).await
    }

    pub async fn summarize_at(
        &self,
        repository_id: &str,
        owner: Option<&str>,
        at: DateTime<Utc>,
    ) -> Result<RepositorySummary, StorageError> {
        self.store
            .summarize(repository_id, owner, &self.window_at(at))
            .await
    }

    pub async fn summarize_all(
        &self,
        owner: Option<&str>,
    ) -> Result<Vec<RepositorySummary>, StorageError> {
        self.summarize_all_at(owner, now()).await
    }

    pub async fn summarize_all_at(
        &self,
        owner: Option<&str>,
        at: DateTime<Utc>,
    ) -> Result<Vec<RepositorySummary>, StorageError> {
        self.store.summarize_all(owner, &self.window_at(at)).await
    }

    pub async fn overall(&self, owner: Option<&str>) -> Result<OverallTotals, StorageError> {
        let summaries = self.summarize_all(owner).await?;
        Ok(OverallTotals::from_summaries(&summaries))
    }

    pub async fn history(
        &self,
        repository_id: &str,
        kind: RecordKind,
        days: usize,
    ) -> Result<Vec<TrafficRecord>, StorageError> {
        self.store.history(repository_id, kind, days).await
    }
}
