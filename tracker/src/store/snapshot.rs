//! Backup/restore document shared by all backends.
use crate::record::{MalformedRecord, RecordKind, TrafficRecord, parse_day};
use crate::types::{OwnerKind, TrackedRepository, format_timestamp, now, parse_timestamp};
use chrono::{DateTime, NaiveDateTime, SubsecRound, Utc};
use serde::{Deserialize, Deserializer, Serialize};

use super::StorageError;

pub const SNAPSHOT_VERSION: &str = "1.0";

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub export_timestamp: String,
    pub version: String,
    #[serde(default)]
    pub clone_history: Vec<HistoryEntry>,
    #[serde(default)]
    pub view_history: Vec<HistoryEntry>,
    #[serde(default)]
    pub tracked_repos: Vec<TrackedRepoEntry>,
    #[serde(default)]
    pub repo_stars: Vec<StarEntry>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub repo: String,
    pub timestamp: String,
    pub count: u32,
    pub uniques: u32,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TrackedRepoEntry {
    pub repo_name: String,
    pub added_at: String,
    #[serde(deserialize_with = "flag")]
    pub is_active: bool,
    #[serde(default)]
    pub owner_type: OwnerKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_sync: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StarEntry {
    pub repo: String,
    pub star_count: u32,
    pub last_updated: String,
}

// Older exports wrote the active flag as 0/1.
fn flag<'de, D>(deserializer: D) -> Result<bool, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Flag {
        Bool(bool),
        Int(i64),
    }

    Ok(match Flag::deserialize(deserializer)? {
        Flag::Bool(b) => b,
        Flag::Int(i) => i != 0,
    })
}

impl Snapshot {
    pub fn new(
        mut records: Vec<TrafficRecord>,
        tracked: &[TrackedRepository],
        stars: Vec<StarEntry>,
    ) -> Self {
        records.sort_by(|a, b| (&a.repository_id, a.day).cmp(&(&b.repository_id, b.day)));

        let history = |kind: RecordKind| {
            records
                .iter()
                .filter(|r| r.kind == kind)
                .map(HistoryEntry::from)
                .collect::<Vec<_>>()
        };

        Snapshot {
            export_timestamp: format_timestamp(&now()),
            version: SNAPSHOT_VERSION.into(),
            clone_history: history(RecordKind::Clone),
            view_history: history(RecordKind::View),
            tracked_repos: tracked.iter().map(TrackedRepoEntry::from).collect(),
            repo_stars: stars,
        }
    }

    /// All history entries converted to validated records.
    pub fn records(&self) -> Result<Vec<TrafficRecord>, StorageError> {
        let clones = self
            .clone_history
            .iter()
            .map(|e| e.to_record(RecordKind::Clone));
        let views = self
            .view_history
            .iter()
            .map(|e| e.to_record(RecordKind::View));

        clones
            .chain(views)
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| StorageError::InvalidData(e.to_string()))
    }

    pub fn tracked(&self) -> Result<Vec<TrackedRepository>, StorageError> {
        self.tracked_repos.iter().map(TrackedRepoEntry::to_tracked).collect()
    }

    pub fn stars(&self) -> Result<Vec<(String, u32, DateTime<Utc>)>, StorageError> {
        self.repo_stars
            .iter()
            .map(|s| {
                Ok((
                    s.repo.clone(),
                    s.star_count,
                    timestamp(&s.last_updated, "last_updated")?,
                ))
            })
            .collect()
    }
}

impl From<&TrafficRecord> for HistoryEntry {
    fn from(record: &TrafficRecord) -> Self {
        HistoryEntry {
            repo: record.repository_id.clone(),
            timestamp: record.timestamp(),
            count: record.count,
            uniques: record.unique_count,
        }
    }
}

impl HistoryEntry {
    pub fn to_record(&self, kind: RecordKind) -> Result<TrafficRecord, MalformedRecord> {
        let day = parse_day(&self.timestamp).ok_or_else(|| MalformedRecord::InvalidField {
            field: "timestamp",
            value: self.timestamp.clone(),
        })?;
        TrafficRecord::new(self.repo.clone(), kind, day, self.count, self.uniques)
    }
}

impl From<&TrackedRepository> for TrackedRepoEntry {
    fn from(repo: &TrackedRepository) -> Self {
        TrackedRepoEntry {
            repo_name: repo.repository_id.clone(),
            added_at: format_timestamp(&repo.added_at),
            is_active: repo.active,
            owner_type: repo.owner_kind,
            last_sync: repo.last_sync_at.as_ref().map(format_timestamp),
            user_id: repo.owning_user_id.clone(),
        }
    }
}

impl TrackedRepoEntry {
    pub fn to_tracked(&self) -> Result<TrackedRepository, StorageError> {
        Ok(TrackedRepository {
            repository_id: self.repo_name.clone(),
            owner_kind: self.owner_type,
            active: self.is_active,
            added_at: timestamp(&self.added_at, "added_at")?,
            last_sync_at: self
                .last_sync
                .as_deref()
                .map(|ts| timestamp(ts, "last_sync"))
                .transpose()?,
            owning_user_id: self.user_id.clone().filter(|u| !u.is_empty()),
        })
    }
}

/// Accepts RFC 3339 and the naive ISO form older exports used (read as UTC).
fn timestamp(value: &str, field: &str) -> Result<DateTime<Utc>, StorageError> {
    parse_timestamp(value)
        .or_else(|| {
            NaiveDateTime::parse_from_str(value, "%Y-%m-%dT%H:%M:%S%.f")
                .ok()
                .map(|naive| naive.and_utc().trunc_subsecs(0))
        })
        .ok_or_else(|| StorageError::InvalidData(format!("invalid {field} timestamp: {value}")))
}
