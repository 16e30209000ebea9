//! Daily traffic records as reported by the upstream traffic API.
use chrono::{DateTime, NaiveDate};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// The two timeseries kept per repository.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordKind {
    #[serde(alias = "clones")]
    Clone,
    #[serde(alias = "views")]
    View,
}

impl RecordKind {
    pub const ALL: [RecordKind; 2] = [RecordKind::Clone, RecordKind::View];

    pub const fn as_str(&self) -> &'static str {
        match self {
            RecordKind::Clone => "clone",
            RecordKind::View => "view",
        }
    }

    /// Table / collection holding this kind of record.
    pub const fn history_name(&self) -> &'static str {
        match self {
            RecordKind::Clone => "clone_history",
            RecordKind::View => "view_history",
        }
    }
}

impl fmt::Display for RecordKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum MalformedRecord {
    #[error("entry is not an object")]
    NotAnObject,

    #[error("missing field `{0}`")]
    MissingField(&'static str),

    #[error("field `{field}` has an invalid value: {value}")]
    InvalidField { field: &'static str, value: String },

    #[error("uniques ({uniques}) exceed count ({count})")]
    UniquesExceedCount { count: u32, uniques: u32 },
}

/// One day of clone or view traffic for a repository.
///
/// Identity is `(repository_id, day, kind)`. `unique_count <= count` holds for
/// every value of this type: the only constructors validate it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct TrafficRecord {
    pub repository_id: String,
    pub kind: RecordKind,
    pub day: NaiveDate,
    pub count: u32,
    pub unique_count: u32,
}

impl TrafficRecord {
    pub fn new<R>(
        repository_id: R,
        kind: RecordKind,
        day: NaiveDate,
        count: u32,
        unique_count: u32,
    ) -> Result<Self, MalformedRecord>
    where
        R: Into<String>,
    {
        if unique_count > count {
            return Err(MalformedRecord::UniquesExceedCount {
                count,
                uniques: unique_count,
            });
        }

        Ok(TrafficRecord {
            repository_id: repository_id.into(),
            kind,
            day,
            count,
            unique_count,
        })
    }

    /// Builds a record from one raw upstream entry `{count, timestamp, uniques}`.
    /// Values are never coerced: anything other than a non-negative integer
    /// count, a parseable timestamp and a non-negative integer uniques is rejected.
    pub fn from_entry(
        repository_id: &str,
        kind: RecordKind,
        entry: &Value,
    ) -> Result<Self, MalformedRecord> {
        let object = entry.as_object().ok_or(MalformedRecord::NotAnObject)?;

        let field = |name: &'static str| {
            object
                .get(name)
                .ok_or(MalformedRecord::MissingField(name))
        };

        let count = counter_value("count", field("count")?)?;
        let uniques = counter_value("uniques", field("uniques")?)?;
        let timestamp = field("timestamp")?;
        let day = timestamp
            .as_str()
            .and_then(parse_day)
            .ok_or_else(|| MalformedRecord::InvalidField {
                field: "timestamp",
                value: timestamp.to_string(),
            })?;

        TrafficRecord::new(repository_id, kind, day, count, uniques)
    }

    /// Upstream timestamp form of `day`, e.g. `2024-01-01T00:00:00Z`.
    pub fn timestamp(&self) -> String {
        format_day_timestamp(self.day)
    }
}

fn counter_value(field: &'static str, value: &Value) -> Result<u32, MalformedRecord> {
    value
        .as_u64()
        .and_then(|v| u32::try_from(v).ok())
        .ok_or_else(|| MalformedRecord::InvalidField {
            field,
            value: value.to_string(),
        })
}

/// Accepts either a plain `YYYY-MM-DD` date or an RFC 3339 instant, whose UTC
/// date is used.
pub fn parse_day(s: &str) -> Option<NaiveDate> {
    if let Ok(day) = NaiveDate::parse_from_str(s, "%Y-%m-%d") {
        return Some(day);
    }
    DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|ts| ts.to_utc().date_naive())
}

pub fn format_day_timestamp(day: NaiveDate) -> String {
    format!("{}T00:00:00Z", day.format("%Y-%m-%d"))
}
