use crate::github::{RepoMetadata, SourceError, TrafficSource};
use crate::record::{RecordKind, TrafficRecord, parse_day};
use crate::store::SqliteStore;
use crate::types::{Credential, parse_timestamp};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use parking_lot::Mutex;
use reqwest::StatusCode;
use serde_json::{Value, json};
use std::collections::HashMap;
use tempfile::TempDir;

pub fn at(ts: &str) -> DateTime<Utc> {
    parse_timestamp(ts).expect("valid timestamp")
}

pub fn day(s: &str) -> NaiveDate {
    parse_day(s).expect("valid day")
}

pub fn record(repo: &str, kind: RecordKind, d: &str, count: u32, uniques: u32) -> TrafficRecord {
    TrafficRecord::new(repo, kind, day(d), count, uniques).expect("valid record")
}

/// A SQLite store in a fresh temp dir. Keep the dir alive for the test.
pub fn sqlite_store() -> (TempDir, SqliteStore) {
    let dir = tempfile::tempdir().expect("create temp dir");
    let store = SqliteStore::new(dir.path().join("stats.db"));
    (dir, store)
}

/// Raw upstream entry as returned by the traffic API.
pub fn entry(d: &str, count: u64, uniques: u64) -> Value {
    json!({ "timestamp": format!("{d}T00:00:00Z"), "count": count, "uniques": uniques })
}

pub enum Fixture {
    Traffic {
        clones: Vec<Value>,
        views: Vec<Value>,
        stars: u32,
    },
    Reject(StatusCode),
    Malformed,
}

/// Scripted traffic source keyed by repository path.
#[derive(Default)]
pub struct StubSource {
    fixtures: Mutex<HashMap<String, Fixture>>,
    calls: Mutex<Vec<String>>,
}

impl StubSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(self, repository_path: &str, fixture: Fixture) -> Self {
        self.set(repository_path, fixture);
        self
    }

    pub fn set(&self, repository_path: &str, fixture: Fixture) {
        self.fixtures
            .lock()
            .insert(repository_path.to_string(), fixture);
    }

    /// Repository paths requested so far, one per call.
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    fn respond<T>(
        &self,
        repository_path: &str,
        pick: impl FnOnce(&Vec<Value>, &Vec<Value>, u32) -> T,
    ) -> Result<T, SourceError> {
        self.calls.lock().push(repository_path.to_string());
        match self.fixtures.lock().get(repository_path) {
            Some(Fixture::Traffic {
                clones,
                views,
                stars,
            }) => Ok(pick(clones, views, *stars)),
            Some(Fixture::Reject(status)) => Err(SourceError::Rejected {
                status: *status,
                path: repository_path.to_string(),
            }),
            Some(Fixture::Malformed) => Err(SourceError::MalformedResponse(format!(
                "{repository_path}: unexpected payload"
            ))),
            None => Err(SourceError::Rejected {
                status: StatusCode::NOT_FOUND,
                path: repository_path.to_string(),
            }),
        }
    }
}

#[async_trait]
impl TrafficSource for StubSource {
    async fn fetch_clones(
        &self,
        repository_path: &str,
        _credential: &Credential,
    ) -> Result<Vec<Value>, SourceError> {
        self.respond(repository_path, |clones, _, _| clones.clone())
    }

    async fn fetch_views(
        &self,
        repository_path: &str,
        _credential: &Credential,
    ) -> Result<Vec<Value>, SourceError> {
        self.respond(repository_path, |_, views, _| views.clone())
    }

    async fn fetch_metadata(
        &self,
        repository_path: &str,
        _credential: &Credential,
    ) -> Result<RepoMetadata, SourceError> {
        self.respond(repository_path, |_, _, star_count| RepoMetadata { star_count })
    }
}
