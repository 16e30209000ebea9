//! Runs one synchronization cycle: fetch, normalize and merge traffic for every
//! tracked repository in the credential's scope.
use crate::github::{SourceError, TrafficSource, resolve_repo_path};
use crate::metrics_defs::{
    SYNC_CYCLE_DURATION, SYNC_RECORD_SKIPPED, SYNC_REPOSITORY_FAILURE, SYNC_REPOSITORY_SUCCESS,
};
use crate::record::{RecordKind, TrafficRecord};
use crate::store::{StorageError, TrafficStore};
use crate::types::{Credential, CredentialError, TrackedRepository, now};
use crate::{counter, histogram};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;
use tokio::sync::{Semaphore, SemaphorePermit};

/// Errors that abort a whole cycle. Per-repository failures never surface
/// here; they are collected in the [`SyncReport`].
#[derive(thiserror::Error, Debug)]
pub enum SyncError {
    #[error("configuration error: {0}")]
    Configuration(#[from] CredentialError),
    #[error("storage unavailable: {0}")]
    StorageUnavailable(#[from] StorageError),
    #[error("sync service is shut down")]
    Closed,
}

#[derive(thiserror::Error, Debug)]
enum RepositoryError {
    #[error(transparent)]
    Source(#[from] SourceError),
    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Where a repository's sync was when it stopped.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RepositoryState {
    Fetching,
    Normalizing,
    Writing,
    Done,
}

impl fmt::Display for RepositoryState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            RepositoryState::Fetching => "fetching",
            RepositoryState::Normalizing => "normalizing",
            RepositoryState::Writing => "writing",
            RepositoryState::Done => "done",
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct RepositoryFailure {
    pub repository_id: String,
    pub state: RepositoryState,
    pub error: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct SyncReport {
    pub attempted: usize,
    pub succeeded: usize,
    pub failures: Vec<RepositoryFailure>,
    /// Upstream entries dropped because they failed validation.
    pub skipped_entries: usize,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    /// Set when a stop was requested before every repository was attempted.
    pub interrupted: bool,
}

impl SyncReport {
    pub fn message(&self) -> String {
        let mut message = format!(
            "synced {} of {} repositories",
            self.succeeded, self.attempted
        );
        if !self.failures.is_empty() {
            message.push_str(&format!(" ({} failed)", self.failures.len()));
        }
        if self.interrupted {
            message.push_str(", interrupted");
        }
        message
    }
}

/// Collapses a cycle result into the `(succeeded, message)` pair callers show
/// to users. Success means the cycle ran to completion.
pub fn outcome(result: &Result<SyncReport, SyncError>) -> (bool, String) {
    match result {
        Ok(report) => (true, report.message()),
        Err(e) => (false, e.to_string()),
    }
}

pub struct Synchronizer {
    store: Arc<dyn TrafficStore>,
    source: Arc<dyn TrafficSource>,
    // Only one cycle runs at a time per store.
    cycle_lock: Semaphore,
    stopping: AtomicBool,
}

impl Synchronizer {
    pub fn new(store: Arc<dyn TrafficStore>, source: Arc<dyn TrafficSource>) -> Self {
        Synchronizer {
            store,
            source,
            cycle_lock: Semaphore::new(1),
            stopping: AtomicBool::new(false),
        }
    }

    pub fn store(&self) -> &Arc<dyn TrafficStore> {
        &self.store
    }

    /// Makes the running cycle, and any later one, stop at the next repository
    /// boundary.
    pub fn request_stop(&self) {
        self.stopping.store(true, Ordering::Relaxed);
    }

    pub async fn run_sync_cycle(&self, credential: &Credential) -> Result<SyncReport, SyncError> {
        credential.validate()?;

        // Hold permit for the duration of the cycle
        let _permit = self.get_permit().await?;
        let started = Instant::now();
        let started_at = now();

        let repositories = self
            .store
            .list_active_repositories(credential.scope())
            .await?;
        tracing::info!(
            repositories = repositories.len(),
            scope = credential.scope().unwrap_or("operator"),
            "starting sync cycle"
        );

        let mut report = SyncReport {
            attempted: 0,
            succeeded: 0,
            failures: Vec::new(),
            skipped_entries: 0,
            started_at,
            finished_at: started_at,
            interrupted: false,
        };

        for repository in &repositories {
            if self.stopping.load(Ordering::Relaxed) {
                tracing::warn!(
                    remaining = repositories.len() - report.attempted,
                    "stop requested, ending sync cycle early"
                );
                report.interrupted = true;
                break;
            }

            report.attempted += 1;
            let mut state = RepositoryState::Fetching;
            match self
                .sync_repository(repository, credential, &mut state, &mut report.skipped_entries)
                .await
            {
                Ok(()) => {
                    counter!(SYNC_REPOSITORY_SUCCESS).increment(1);
                    report.succeeded += 1;
                }
                Err(e) => {
                    tracing::error!(
                        repository = %repository.repository_id,
                        %state,
                        error = %e,
                        "failed to sync repository"
                    );
                    counter!(SYNC_REPOSITORY_FAILURE).increment(1);
                    report.failures.push(RepositoryFailure {
                        repository_id: repository.repository_id.clone(),
                        state,
                        error: e.to_string(),
                    });
                }
            }
        }

        report.finished_at = now();
        histogram!(SYNC_CYCLE_DURATION).record(started.elapsed().as_secs_f64());
        tracing::info!(
            attempted = report.attempted,
            succeeded = report.succeeded,
            failed = report.failures.len(),
            skipped_entries = report.skipped_entries,
            "sync cycle complete"
        );

        Ok(report)
    }

    async fn sync_repository(
        &self,
        repository: &TrackedRepository,
        credential: &Credential,
        state: &mut RepositoryState,
        skipped: &mut usize,
    ) -> Result<(), RepositoryError> {
        let repository_id = repository.repository_id.as_str();
        let path = resolve_repo_path(repository_id, repository.owner_kind, credential);

        let clones = self.source.fetch_clones(&path, credential).await?;
        let views = self.source.fetch_views(&path, credential).await?;
        let metadata = self.source.fetch_metadata(&path, credential).await?;

        *state = RepositoryState::Normalizing;
        let clones = normalize(repository_id, RecordKind::Clone, &clones, skipped);
        let views = normalize(repository_id, RecordKind::View, &views, skipped);

        *state = RepositoryState::Writing;
        self.store
            .merge_write_records(repository_id, RecordKind::Clone, &clones)
            .await?;
        self.store
            .merge_write_records(repository_id, RecordKind::View, &views)
            .await?;
        self.store
            .write_star_snapshot(repository_id, metadata.star_count)
            .await?;
        self.store
            .mark_synced(repository_id, credential.scope())
            .await?;
        *state = RepositoryState::Done;

        tracing::debug!(
            repository = repository_id,
            path,
            clones = clones.len(),
            views = views.len(),
            stars = metadata.star_count,
            "synced repository"
        );
        Ok(())
    }

    /// Guard that ensures only one cycle is in progress at a time.
    async fn get_permit(&self) -> Result<SemaphorePermit<'_>, SyncError> {
        self.cycle_lock.acquire().await.map_err(|_| SyncError::Closed)
    }
}

/// Converts raw entries, skipping (and logging) the ones that fail validation.
fn normalize(
    repository_id: &str,
    kind: RecordKind,
    entries: &[Value],
    skipped: &mut usize,
) -> Vec<TrafficRecord> {
    let mut records = Vec::with_capacity(entries.len());
    for entry in entries {
        match TrafficRecord::from_entry(repository_id, kind, entry) {
            Ok(record) => records.push(record),
            Err(e) => {
                tracing::warn!(
                    repository = repository_id,
                    %kind,
                    error = %e,
                    %entry,
                    "skipping malformed traffic entry"
                );
                counter!(SYNC_RECORD_SKIPPED).increment(1);
                *skipped += 1;
            }
        }
    }
    records
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{DocumentStore, MemoryDocuments};
    use crate::testutils::{Fixture, StubSource, entry, record, sqlite_store};
    use crate::types::OwnerKind;
    use reqwest::StatusCode;
    use serde_json::json;

    fn credential() -> Credential {
        Credential::new("octocat", "t0ken")
    }

    fn traffic(clones: Vec<Value>, views: Vec<Value>, stars: u32) -> Fixture {
        Fixture::Traffic {
            clones,
            views,
            stars,
        }
    }

    fn memory_store() -> Arc<dyn TrafficStore> {
        Arc::new(DocumentStore::new(MemoryDocuments::new()))
    }

    #[tokio::test]
    async fn test_fault_isolation() {
        let (_dir, store) = sqlite_store();
        store.setup().await.unwrap();
        let store: Arc<dyn TrafficStore> = Arc::new(store);
        for repo in ["one", "two", "three"] {
            assert!(store.track_repository(repo, OwnerKind::Individual, None).await);
        }

        let source = StubSource::new()
            .with("octocat/one", traffic(vec![entry("2024-01-01", 5, 3)], vec![], 1))
            .with("octocat/two", Fixture::Reject(StatusCode::FORBIDDEN))
            .with("octocat/three", traffic(vec![], vec![entry("2024-01-01", 2, 2)], 3));

        let sync = Synchronizer::new(store.clone(), Arc::new(source));
        let result = sync.run_sync_cycle(&credential()).await;
        let (succeeded, message) = outcome(&result);
        assert!(succeeded);
        assert_eq!(message, "synced 2 of 3 repositories (1 failed)");

        let report = result.unwrap();
        assert_eq!(report.attempted, 3);
        assert_eq!(report.succeeded, 2);
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].repository_id, "two");
        assert_eq!(report.failures[0].state, RepositoryState::Fetching);
        assert!(!report.interrupted);

        let synced: Vec<_> = store
            .list_active_repositories(None)
            .await
            .unwrap()
            .into_iter()
            .map(|r| (r.repository_id, r.last_sync_at.is_some()))
            .collect();
        assert_eq!(
            synced,
            vec![
                ("one".to_string(), true),
                ("three".to_string(), true),
                ("two".to_string(), false)
            ]
        );
        assert_eq!(store.star_snapshot("three").await.unwrap().unwrap().star_count, 3);
    }

    #[tokio::test]
    async fn test_malformed_entries_skipped() {
        let store = memory_store();
        assert!(store.track_repository("acme/web", OwnerKind::Organization, None).await);

        let clones = vec![
            entry("2024-01-01", 5, 3),
            entry("2024-01-02", 1, 4),
            json!({ "count": 1, "uniques": 1 }),
            json!("garbage"),
        ];
        let source = StubSource::new().with("acme/web", traffic(clones, vec![], 0));

        let sync = Synchronizer::new(store.clone(), Arc::new(source));
        let report = sync.run_sync_cycle(&credential()).await.unwrap();
        assert_eq!(report.succeeded, 1);
        assert_eq!(report.skipped_entries, 3);

        let history = store.history("acme/web", RecordKind::Clone, 30).await.unwrap();
        assert_eq!(history, vec![record("acme/web", RecordKind::Clone, "2024-01-01", 5, 3)]);
    }

    #[tokio::test]
    async fn test_malformed_response_is_per_repository() {
        let store = memory_store();
        assert!(store.track_repository("bad", OwnerKind::Individual, None).await);
        assert!(store.track_repository("good", OwnerKind::Individual, None).await);
        let source = StubSource::new()
            .with("octocat/bad", Fixture::Malformed)
            .with("octocat/good", traffic(vec![], vec![], 0));

        let report = Synchronizer::new(store, Arc::new(source))
            .run_sync_cycle(&credential())
            .await
            .unwrap();
        assert_eq!(report.succeeded, 1);
        assert_eq!(report.failures[0].repository_id, "bad");
    }

    #[tokio::test]
    async fn test_missing_credential_aborts() {
        let store = memory_store();
        assert!(store.track_repository("one", OwnerKind::Individual, None).await);
        let source = Arc::new(StubSource::new());

        let sync = Synchronizer::new(store, source.clone());
        let result = sync.run_sync_cycle(&Credential::new("octocat", "")).await;
        assert!(matches!(
            result,
            Err(SyncError::Configuration(CredentialError::MissingToken))
        ));
        assert!(!outcome(&result).0);
        assert!(source.calls().is_empty());
    }

    #[tokio::test]
    async fn test_resync_upserts() {
        let store = memory_store();
        assert!(store.track_repository("one", OwnerKind::Individual, None).await);
        let source = Arc::new(StubSource::new().with(
            "octocat/one",
            traffic(vec![entry("2024-01-01", 5, 3)], vec![], 1),
        ));
        let sync = Synchronizer::new(store.clone(), source.clone());
        sync.run_sync_cycle(&credential()).await.unwrap();

        // Upstream corrected the day retroactively
        source.set(
            "octocat/one",
            traffic(
                vec![entry("2024-01-01", 8, 4), entry("2024-01-02", 1, 1)],
                vec![],
                2,
            ),
        );
        sync.run_sync_cycle(&credential()).await.unwrap();

        let history = store.history("one", RecordKind::Clone, 30).await.unwrap();
        assert_eq!(
            history,
            vec![
                record("one", RecordKind::Clone, "2024-01-01", 8, 4),
                record("one", RecordKind::Clone, "2024-01-02", 1, 1),
            ]
        );
        assert_eq!(store.star_snapshot("one").await.unwrap().unwrap().star_count, 2);
    }

    #[tokio::test]
    async fn test_user_scope() {
        let store = memory_store();
        assert!(store.track_repository("mine", OwnerKind::Individual, Some("u1")).await);
        assert!(store.track_repository("theirs", OwnerKind::Individual, Some("u2")).await);
        let source = Arc::new(StubSource::new().with("octocat/mine", traffic(vec![], vec![], 0)));

        let sync = Synchronizer::new(store.clone(), source.clone());
        let report = sync
            .run_sync_cycle(&credential().with_scope("u1"))
            .await
            .unwrap();
        assert_eq!(report.attempted, 1);
        assert!(source.calls().iter().all(|path| path == "octocat/mine"));

        let mine = store.list_active_repositories(Some("u1")).await.unwrap();
        assert!(mine[0].last_sync_at.is_some());
    }

    #[tokio::test]
    async fn test_stop_requested() {
        let store = memory_store();
        assert!(store.track_repository("one", OwnerKind::Individual, None).await);
        let sync = Synchronizer::new(store, Arc::new(StubSource::new()));
        sync.request_stop();

        let report = sync.run_sync_cycle(&credential()).await.unwrap();
        assert!(report.interrupted);
        assert_eq!(report.attempted, 0);
        assert_eq!(report.message(), "synced 0 of 0 repositories, interrupted");
    }
}
