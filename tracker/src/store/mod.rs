//! Storage port for tracked repositories, traffic history and star counts,
//! with an embedded SQL backend and a document-store backend.
pub mod document;
pub mod firestore;
pub mod snapshot;
pub mod sqlite;

use crate::config::{DEFAULT_DATABASE_PATH, StorageType};
use crate::counter;
use crate::metrics_defs::STORAGE_FALLBACK;
use crate::record::{RecordKind, TrafficRecord};
use crate::summary::TrailingWindow;
use crate::types::{OwnerKind, RepositorySummary, StarSnapshot, TrackedRepository};
use async_trait::async_trait;
use std::fs::{self, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

pub use document::{DocumentClient, DocumentError, DocumentStore, MemoryDocuments};
pub use firestore::FirestoreDocuments;
pub use snapshot::Snapshot;
pub use sqlite::SqliteStore;

#[derive(thiserror::Error, Debug)]
pub enum StorageError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("document store error: {0}")]
    Documents(#[from] DocumentError),

    #[error("storage location {path:?} is not writable: {source}")]
    Unwritable { path: PathBuf, source: io::Error },

    #[error("invalid stored data: {0}")]
    InvalidData(String),
}

/// Persistence contract shared by every backend. Both implementations must
/// return identical summaries for the same logical state.
///
/// `owner` scopes tracked repositories to a user in multi-user mode; None is
/// the single-operator scope. History and star rows are keyed by repository
/// only.
#[async_trait]
pub trait TrafficStore: Send + Sync {
    fn backend(&self) -> &'static str;

    /// Idempotently creates the schema. Never touches data.
    async fn setup(&self) -> Result<(), StorageError>;

    async fn list_active_repositories(
        &self,
        owner: Option<&str>,
    ) -> Result<Vec<TrackedRepository>, StorageError>;

    /// Upserts the tracked row, reactivating it if it was untracked. Returns
    /// false only when the write failed.
    async fn track_repository(
        &self,
        repository_id: &str,
        owner_kind: OwnerKind,
        owner: Option<&str>,
    ) -> bool;

    /// Soft-deactivates the tracked row. History is kept.
    async fn untrack_repository(&self, repository_id: &str, owner: Option<&str>) -> bool;

    /// Upserts keyed by `(repository, day, kind)`: incoming records replace
    /// stored ones. The whole batch commits atomically.
    async fn merge_write_records(
        &self,
        repository_id: &str,
        kind: RecordKind,
        records: &[TrafficRecord],
    ) -> Result<(), StorageError>;

    async fn write_star_snapshot(
        &self,
        repository_id: &str,
        star_count: u32,
    ) -> Result<(), StorageError>;

    async fn mark_synced(&self, repository_id: &str, owner: Option<&str>)
    -> Result<(), StorageError>;

    /// Most recent `days` records of one kind, oldest first.
    async fn history(
        &self,
        repository_id: &str,
        kind: RecordKind,
        days: usize,
    ) -> Result<Vec<TrafficRecord>, StorageError>;

    async fn star_snapshot(&self, repository_id: &str)
    -> Result<Option<StarSnapshot>, StorageError>;

    async fn summarize(
        &self,
        repository_id: &str,
        owner: Option<&str>,
        window: &TrailingWindow,
    ) -> Result<RepositorySummary, StorageError>;

    /// Summaries of every active repository in scope, ordered by repository id.
    async fn summarize_all(
        &self,
        owner: Option<&str>,
        window: &TrailingWindow,
    ) -> Result<Vec<RepositorySummary>, StorageError>;

    async fn export_all(&self) -> Result<Snapshot, StorageError>;

    /// With `replace_existing` every collection is cleared first; otherwise
    /// history is inserted only where absent and tracked/star rows are
    /// overwritten. Returns false on any failure, leaving the store unchanged.
    async fn import_all(&self, snapshot: &Snapshot, replace_existing: bool) -> bool;
}

/// Rejects record batches that do not belong to the target repository/kind.
pub(crate) fn check_batch(
    repository_id: &str,
    kind: RecordKind,
    records: &[TrafficRecord],
) -> Result<(), StorageError> {
    match records
        .iter()
        .find(|r| r.repository_id != repository_id || r.kind != kind)
    {
        Some(r) => Err(StorageError::InvalidData(format!(
            "{} record for {} in {} batch for {}",
            r.kind, r.repository_id, kind, repository_id
        ))),
        None => Ok(()),
    }
}

/// Location the embedded database resolved to at startup.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SqliteLocation {
    pub path: PathBuf,
    pub is_fallback: bool,
}

/// Picks the configured database path if it is writable, otherwise the
/// fallback path.
pub fn resolve_sqlite_location(
    path: &Path,
    fallback_path: Option<&Path>,
) -> Result<SqliteLocation, StorageError> {
    let primary_err = match ensure_writable(path) {
        Ok(()) => {
            return Ok(SqliteLocation {
                path: path.to_path_buf(),
                is_fallback: false,
            });
        }
        Err(e) => e,
    };

    let fallback = fallback_path
        .map(Path::to_path_buf)
        .unwrap_or_else(|| default_fallback_path(path));

    tracing::warn!(
        path = ?path,
        fallback = ?fallback,
        error = %primary_err,
        "database path is not writable, using fallback location"
    );
    counter!(STORAGE_FALLBACK).increment(1);

    ensure_writable(&fallback).map_err(|source| StorageError::Unwritable {
        path: fallback.clone(),
        source,
    })?;

    Ok(SqliteLocation {
        path: fallback,
        is_fallback: true,
    })
}

fn default_fallback_path(path: &Path) -> PathBuf {
    let filename = path
        .file_name()
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_DATABASE_PATH));
    std::env::temp_dir().join(filename)
}

fn ensure_writable(path: &Path) -> io::Result<()> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent)?;
    }
    OpenOptions::new().create(true).append(true).open(path)?;
    Ok(())
}

/// Opens the configured backend and ensures its schema exists. If the
/// document store cannot be set up, falls back to the embedded database at
/// its default location.
pub async fn open(storage: &StorageType) -> Result<Arc<dyn TrafficStore>, StorageError> {
    match storage {
        StorageType::Sqlite {
            path,
            fallback_path,
        } => open_sqlite(path, fallback_path.as_deref()).await,
        StorageType::Firestore {
            project_id,
            database,
            endpoint,
            token_env,
        } => {
            let token = token_env.as_deref().and_then(|key| std::env::var(key).ok());
            let documents =
                FirestoreDocuments::new(project_id, database, endpoint.clone(), token)?;
            let store = DocumentStore::new(documents);

            match store.setup().await {
                Ok(()) => {
                    tracing::info!(project_id = %project_id, "using firestore storage");
                    Ok(Arc::new(store))
                }
                Err(e) => {
                    tracing::warn!(
                        error = %e,
                        "failed to initialize firestore, falling back to sqlite"
                    );
                    counter!(STORAGE_FALLBACK).increment(1);
                    open_sqlite(Path::new(DEFAULT_DATABASE_PATH), None).await
                }
            }
        }
    }
}

async fn open_sqlite(
    path: &Path,
    fallback_path: Option<&Path>,
) -> Result<Arc<dyn TrafficStore>, StorageError> {
    let location = resolve_sqlite_location(path, fallback_path)?;
    let store = SqliteStore::new(location.path.clone());
    store.setup().await?;
    tracing::info!(path = ?location.path, fallback = location.is_fallback, "using sqlite storage");
    Ok(Arc::new(store))
}
