//! Document-store backend. Documents are flat JSON maps; aggregation happens
//! client-side after fetching a repository's history.
use super::snapshot::{Snapshot, StarEntry};
use super::{StorageError, TrafficStore, check_batch};
use crate::record::{RecordKind, TrafficRecord, parse_day};
use crate::summary::{TrailingWindow, aggregate};
use crate::types::{
    OwnerKind, RepositorySummary, StarSnapshot, TrackedRepository, format_timestamp, now,
    parse_timestamp,
};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use parking_lot::RwLock;
use serde_json::{Map, Value, json};
use std::collections::{BTreeMap, BTreeSet, HashMap};

pub type Document = Map<String, Value>;

const TRACKED: &str = "tracked_repos";
const STARS: &str = "repo_stars";

#[derive(thiserror::Error, Debug)]
pub enum DocumentError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("document service returned {status}: {body}")]
    Status {
        status: reqwest::StatusCode,
        body: String,
    },

    #[error("malformed document: {0}")]
    Malformed(String),
}

#[derive(Clone, Debug, PartialEq)]
pub enum DocumentWrite {
    Set {
        collection: &'static str,
        id: String,
        document: Document,
    },
    /// Overwrites only the given fields of an existing document. Fails with
    /// a not-found status when the document is absent.
    Update {
        collection: &'static str,
        id: String,
        fields: Document,
    },
    Delete {
        collection: &'static str,
        id: String,
    },
}

/// Minimal document database access used by [`DocumentStore`].
#[async_trait]
pub trait DocumentClient: Send + Sync {
    fn name(&self) -> &'static str;

    async fn get(&self, collection: &str, id: &str) -> Result<Option<Document>, DocumentError>;

    async fn list(&self, collection: &str) -> Result<Vec<(String, Document)>, DocumentError>;

    /// Documents whose `field` equals `value`.
    async fn find(
        &self,
        collection: &str,
        field: &str,
        value: &Value,
    ) -> Result<Vec<(String, Document)>, DocumentError>;

    /// Applies every write or none of them. A document may appear at most
    /// once per commit.
    async fn commit(&self, writes: Vec<DocumentWrite>) -> Result<(), DocumentError>;
}

/// In-process document database.
#[derive(Default)]
pub struct MemoryDocuments {
    collections: RwLock<HashMap<String, BTreeMap<String, Document>>>,
}

impl MemoryDocuments {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DocumentClient for MemoryDocuments {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn get(&self, collection: &str, id: &str) -> Result<Option<Document>, DocumentError> {
        let guard = self.collections.read();
        Ok(guard.get(collection).and_then(|docs| docs.get(id)).cloned())
    }

    async fn list(&self, collection: &str) -> Result<Vec<(String, Document)>, DocumentError> {
        let guard = self.collections.read();
        Ok(guard
            .get(collection)
            .map(|docs| docs.iter().map(|(id, doc)| (id.clone(), doc.clone())).collect())
            .unwrap_or_default())
    }

    async fn find(
        &self,
        collection: &str,
        field: &str,
        value: &Value,
    ) -> Result<Vec<(String, Document)>, DocumentError> {
        let guard = self.collections.read();
        Ok(guard
            .get(collection)
            .map(|docs| {
                docs.iter()
                    .filter(|(_, doc)| doc.get(field) == Some(value))
                    .map(|(id, doc)| (id.clone(), doc.clone()))
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn commit(&self, writes: Vec<DocumentWrite>) -> Result<(), DocumentError> {
        let mut guard = self.collections.write();

        // Preconditions are checked up front so a failed commit writes nothing
        for write in &writes {
            if let DocumentWrite::Update { collection, id, .. } = write
                && !guard.get(*collection).is_some_and(|docs| docs.contains_key(id))
            {
                return Err(DocumentError::Status {
                    status: reqwest::StatusCode::NOT_FOUND,
                    body: format!("no document {collection}/{id}"),
                });
            }
        }

        for write in writes {
            match write {
                DocumentWrite::Set {
                    collection,
                    id,
                    document,
                } => {
                    guard
                        .entry(collection.to_string())
                        .or_default()
                        .insert(id, document);
                }
                DocumentWrite::Update {
                    collection,
                    id,
                    fields,
                } => {
                    if let Some(doc) = guard
                        .get_mut(collection)
                        .and_then(|docs| docs.get_mut(&id))
                    {
                        doc.extend(fields);
                    }
                }
                DocumentWrite::Delete { collection, id } => {
                    if let Some(docs) = guard.get_mut(collection) {
                        docs.remove(&id);
                    }
                }
            }
        }
        Ok(())
    }
}

/// Escapes the characters used as separators in document ids.
fn encode(s: &str) -> String {
    s.replace('%', "%25").replace('/', "%2F").replace('_', "%5F")
}

fn day_key(day: NaiveDate) -> String {
    day.format("%Y-%m-%d").to_string()
}

fn history_id(repository_id: &str, day: NaiveDate) -> String {
    format!("{}_{}", encode(repository_id), day_key(day))
}

fn tracked_id(repository_id: &str, owner: Option<&str>) -> String {
    match owner.filter(|o| !o.is_empty()) {
        Some(owner) => format!("{}__{}", encode(owner), encode(repository_id)),
        None => encode(repository_id),
    }
}

fn malformed(field: &str, doc: &Document) -> StorageError {
    StorageError::InvalidData(format!(
        "document field `{field}` missing or invalid: {}",
        Value::Object(doc.clone())
    ))
}

fn str_field<'a>(doc: &'a Document, field: &str) -> Result<&'a str, StorageError> {
    doc.get(field)
        .and_then(Value::as_str)
        .ok_or_else(|| malformed(field, doc))
}

fn opt_str_field<'a>(doc: &'a Document, field: &str) -> Result<Option<&'a str>, StorageError> {
    match doc.get(field) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => Ok(Some(s)),
        Some(_) => Err(malformed(field, doc)),
    }
}

fn u32_field(doc: &Document, field: &str) -> Result<u32, StorageError> {
    doc.get(field)
        .and_then(Value::as_u64)
        .and_then(|v| u32::try_from(v).ok())
        .ok_or_else(|| malformed(field, doc))
}

fn timestamp_field(doc: &Document, field: &str) -> Result<DateTime<Utc>, StorageError> {
    parse_timestamp(str_field(doc, field)?).ok_or_else(|| malformed(field, doc))
}

fn record_document(record: &TrafficRecord) -> Document {
    let mut doc = Document::new();
    doc.insert("repo".into(), json!(record.repository_id));
    doc.insert("day".into(), json!(day_key(record.day)));
    doc.insert("count".into(), json!(record.count));
    doc.insert("uniques".into(), json!(record.unique_count));
    doc
}

fn document_record(kind: RecordKind, doc: &Document) -> Result<TrafficRecord, StorageError> {
    let day = parse_day(str_field(doc, "day")?).ok_or_else(|| malformed("day", doc))?;
    TrafficRecord::new(
        str_field(doc, "repo")?,
        kind,
        day,
        u32_field(doc, "count")?,
        u32_field(doc, "uniques")?,
    )
    .map_err(|e| StorageError::InvalidData(e.to_string()))
}

fn tracked_document(repo: &TrackedRepository) -> Document {
    let mut doc = Document::new();
    doc.insert("repo_name".into(), json!(repo.repository_id));
    doc.insert(
        "user_id".into(),
        json!(repo.owning_user_id.as_deref().unwrap_or("")),
    );
    doc.insert("added_at".into(), json!(format_timestamp(&repo.added_at)));
    doc.insert("is_active".into(), json!(repo.active));
    doc.insert(
        "last_sync".into(),
        repo.last_sync_at
            .as_ref()
            .map(|ts| json!(format_timestamp(ts)))
            .unwrap_or(Value::Null),
    );
    doc.insert("owner_type".into(), json!(repo.owner_kind.as_str()));
    doc
}

fn document_tracked(doc: &Document) -> Result<TrackedRepository, StorageError> {
    Ok(TrackedRepository {
        repository_id: str_field(doc, "repo_name")?.to_string(),
        owner_kind: OwnerKind::from_stored(opt_str_field(doc, "owner_type")?.unwrap_or("")),
        active: doc
            .get("is_active")
            .and_then(Value::as_bool)
            .ok_or_else(|| malformed("is_active", doc))?,
        added_at: timestamp_field(doc, "added_at")?,
        last_sync_at: opt_str_field(doc, "last_sync")?
            .map(|ts| parse_timestamp(ts).ok_or_else(|| malformed("last_sync", doc)))
            .transpose()?,
        owning_user_id: opt_str_field(doc, "user_id")?
            .filter(|u| !u.is_empty())
            .map(str::to_string),
    })
}

fn star_document(repository_id: &str, star_count: u32, observed_at: &DateTime<Utc>) -> Document {
    let mut doc = Document::new();
    doc.insert("repo".into(), json!(repository_id));
    doc.insert("star_count".into(), json!(star_count));
    doc.insert("last_updated".into(), json!(format_timestamp(observed_at)));
    doc
}

fn document_star(doc: &Document) -> Result<StarSnapshot, StorageError> {
    Ok(StarSnapshot {
        repository_id: str_field(doc, "repo")?.to_string(),
        star_count: u32_field(doc, "star_count")?,
        observed_at: timestamp_field(doc, "last_updated")?,
    })
}

/// [`TrafficStore`] over any [`DocumentClient`].
pub struct DocumentStore<C> {
    client: C,
}

impl<C: DocumentClient> DocumentStore<C> {
    pub fn new(client: C) -> Self {
        DocumentStore { client }
    }

    async fn put_tracked(&self, repo: &TrackedRepository) -> Result<(), StorageError> {
        self.client
            .commit(vec![DocumentWrite::Set {
                collection: TRACKED,
                id: tracked_id(&repo.repository_id, repo.owning_user_id.as_deref()),
                document: tracked_document(repo),
            }])
            .await?;
        Ok(())
    }

    /// Writes only `fields` so concurrent changes to other fields survive.
    /// Missing documents are left alone.
    async fn update_tracked(
        &self,
        repository_id: &str,
        owner: Option<&str>,
        fields: Document,
    ) -> Result<bool, StorageError> {
        let id = tracked_id(repository_id, owner);
        if self.client.get(TRACKED, &id).await?.is_none() {
            return Ok(false);
        }
        self.client
            .commit(vec![DocumentWrite::Update {
                collection: TRACKED,
                id,
                fields,
            }])
            .await?;
        Ok(true)
    }

    async fn upsert_tracked(
        &self,
        repository_id: &str,
        owner_kind: OwnerKind,
        owner: Option<&str>,
    ) -> Result<(), StorageError> {
        let mut fields = Document::new();
        fields.insert("is_active".into(), json!(true));
        fields.insert("owner_type".into(), json!(owner_kind.as_str()));
        if self.update_tracked(repository_id, owner, fields).await? {
            return Ok(());
        }

        self.put_tracked(&TrackedRepository {
            repository_id: repository_id.to_string(),
            owner_kind,
            active: true,
            added_at: now(),
            last_sync_at: None,
            owning_user_id: owner.filter(|o| !o.is_empty()).map(str::to_string),
        })
        .await
    }

    async fn deactivate(
        &self,
        repository_id: &str,
        owner: Option<&str>,
    ) -> Result<(), StorageError> {
        let mut fields = Document::new();
        fields.insert("is_active".into(), json!(false));
        self.update_tracked(repository_id, owner, fields).await?;
        Ok(())
    }

    async fn records(
        &self,
        repository_id: &str,
        kind: RecordKind,
    ) -> Result<Vec<TrafficRecord>, StorageError> {
        let mut records = self
            .client
            .find(kind.history_name(), "repo", &json!(repository_id))
            .await?
            .iter()
            .map(|(_, doc)| document_record(kind, doc))
            .collect::<Result<Vec<_>, _>>()?;
        records.sort_by_key(|r| r.day);
        Ok(records)
    }

    async fn import(
        &self,
        snapshot: &Snapshot,
        replace_existing: bool,
    ) -> Result<(), StorageError> {
        // Validate everything before writing
        let records = snapshot.records()?;
        let tracked = snapshot.tracked()?;
        let stars = snapshot.stars()?;

        let mut incoming: BTreeMap<(&'static str, String), Document> = BTreeMap::new();
        for record in &records {
            incoming.insert(
                (
                    record.kind.history_name(),
                    history_id(&record.repository_id, record.day),
                ),
                record_document(record),
            );
        }

        let mut existing = BTreeSet::new();
        let mut collections = RecordKind::ALL.map(|k| k.history_name()).to_vec();
        collections.extend([TRACKED, STARS]);
        for collection in collections {
            for (id, _) in self.client.list(collection).await? {
                existing.insert((collection, id));
            }
        }

        // Without replace, history already present wins over the snapshot
        if !replace_existing {
            incoming.retain(|key, _| !existing.contains(key));
        }

        for repo in &tracked {
            incoming.insert(
                (
                    TRACKED,
                    tracked_id(&repo.repository_id, repo.owning_user_id.as_deref()),
                ),
                tracked_document(repo),
            );
        }
        for (repo, star_count, observed_at) in &stars {
            incoming.insert(
                (STARS, encode(repo)),
                star_document(repo, *star_count, observed_at),
            );
        }

        let mut writes = Vec::new();
        if replace_existing {
            writes.extend(
                existing
                    .into_iter()
                    .filter(|key| !incoming.contains_key(key))
                    .map(|(collection, id)| DocumentWrite::Delete { collection, id }),
            );
        }
        writes.extend(
            incoming
                .into_iter()
                .map(|((collection, id), document)| DocumentWrite::Set {
                    collection,
                    id,
                    document,
                }),
        );

        let writes_len = writes.len();
        self.client.commit(writes).await?;

        tracing::info!(
            records = records.len(),
            tracked = tracked.len(),
            stars = stars.len(),
            writes = writes_len,
            replace_existing,
            "document import complete"
        );
        Ok(())
    }
}

#[async_trait]
impl<C: DocumentClient + 'static> TrafficStore for DocumentStore<C> {
    fn backend(&self) -> &'static str {
        self.client.name()
    }

    /// Collections need no schema; this only verifies the store is reachable.
    async fn setup(&self) -> Result<(), StorageError> {
        self.client.get(TRACKED, "setup-probe").await?;
        Ok(())
    }

    async fn list_active_repositories(
        &self,
        owner: Option<&str>,
    ) -> Result<Vec<TrackedRepository>, StorageError> {
        let owner = owner.filter(|o| !o.is_empty());
        let docs = match owner {
            Some(owner) => self.client.find(TRACKED, "user_id", &json!(owner)).await?,
            // Older operator documents have no user_id field at all
            None => self.client.list(TRACKED).await?,
        };

        let mut repos = Vec::new();
        for (_, doc) in docs {
            let repo = document_tracked(&doc)?;
            if repo.active && repo.owning_user_id.as_deref() == owner {
                repos.push(repo);
            }
        }
        repos.sort_by(|a, b| a.repository_id.cmp(&b.repository_id));
        Ok(repos)
    }

    async fn track_repository(
        &self,
        repository_id: &str,
        owner_kind: OwnerKind,
        owner: Option<&str>,
    ) -> bool {
        match self.upsert_tracked(repository_id, owner_kind, owner).await {
            Ok(()) => {
                tracing::info!(
                    repository = repository_id,
                    owner_type = owner_kind.as_str(),
                    "tracking repository"
                );
                true
            }
            Err(e) => {
                tracing::error!(
                    repository = repository_id,
                    error = %e,
                    "failed to track repository"
                );
                false
            }
        }
    }

    async fn untrack_repository(&self, repository_id: &str, owner: Option<&str>) -> bool {
        match self.deactivate(repository_id, owner).await {
            Ok(()) => {
                tracing::info!(repository = repository_id, "untracked repository");
                true
            }
            Err(e) => {
                tracing::error!(
                    repository = repository_id,
                    error = %e,
                    "failed to untrack repository"
                );
                false
            }
        }
    }

    async fn merge_write_records(
        &self,
        repository_id: &str,
        kind: RecordKind,
        records: &[TrafficRecord],
    ) -> Result<(), StorageError> {
        check_batch(repository_id, kind, records)?;
        if records.is_empty() {
            return Ok(());
        }

        // Later entries for the same day win, as with sequential upserts
        let by_id: BTreeMap<String, Document> = records
            .iter()
            .map(|r| (history_id(repository_id, r.day), record_document(r)))
            .collect();

        let writes = by_id
            .into_iter()
            .map(|(id, document)| DocumentWrite::Set {
                collection: kind.history_name(),
                id,
                document,
            })
            .collect();
        self.client.commit(writes).await?;

        tracing::debug!(
            repository = repository_id,
            %kind,
            records = records.len(),
            "merged records"
        );
        Ok(())
    }

    async fn write_star_snapshot(
        &self,
        repository_id: &str,
        star_count: u32,
    ) -> Result<(), StorageError> {
        self.client
            .commit(vec![DocumentWrite::Set {
                collection: STARS,
                id: encode(repository_id),
                document: star_document(repository_id, star_count, &now()),
            }])
            .await?;
        Ok(())
    }

    async fn mark_synced(
        &self,
        repository_id: &str,
        owner: Option<&str>,
    ) -> Result<(), StorageError> {
        let mut fields = Document::new();
        fields.insert("last_sync".into(), json!(format_timestamp(&now())));
        self.update_tracked(repository_id, owner, fields).await?;
        Ok(())
    }

    async fn history(
        &self,
        repository_id: &str,
        kind: RecordKind,
        days: usize,
    ) -> Result<Vec<TrafficRecord>, StorageError> {
        let mut records = self.records(repository_id, kind).await?;
        let skip = records.len().saturating_sub(days);
        Ok(records.split_off(skip))
    }

    async fn star_snapshot(
        &self,
        repository_id: &str,
    ) -> Result<Option<StarSnapshot>, StorageError> {
        self.client
            .get(STARS, &encode(repository_id))
            .await?
            .map(|doc| document_star(&doc))
            .transpose()
    }

    async fn summarize(
        &self,
        repository_id: &str,
        owner: Option<&str>,
        window: &TrailingWindow,
    ) -> Result<RepositorySummary, StorageError> {
        let mut records = self.records(repository_id, RecordKind::Clone).await?;
        records.extend(self.records(repository_id, RecordKind::View).await?);
        let stars = self.star_snapshot(repository_id).await?;
        let last_sync_at = self
            .tracked(repository_id, owner)
            .await?
            .and_then(|t| t.last_sync_at);

        Ok(aggregate(
            repository_id,
            &records,
            stars.as_ref(),
            last_sync_at,
            window,
        ))
    }

    async fn summarize_all(
        &self,
        owner: Option<&str>,
        window: &TrailingWindow,
    ) -> Result<Vec<RepositorySummary>, StorageError> {
        let mut summaries = Vec::new();
        for repo in self.list_active_repositories(owner).await? {
            summaries.push(self.summarize(&repo.repository_id, owner, window).await?);
        }
        Ok(summaries)
    }

    async fn export_all(&self) -> Result<Snapshot, StorageError> {
        let mut records = Vec::new();
        for kind in RecordKind::ALL {
            for (_, doc) in self.client.list(kind.history_name()).await? {
                records.push(document_record(kind, &doc)?);
            }
        }

        let tracked = self
            .client
            .list(TRACKED)
            .await?
            .iter()
            .map(|(_, doc)| document_tracked(doc))
            .collect::<Result<Vec<_>, _>>()?;

        let mut stars = Vec::new();
        for (_, doc) in self.client.list(STARS).await? {
            let star = document_star(&doc)?;
            stars.push(StarEntry {
                repo: star.repository_id,
                star_count: star.star_count,
                last_updated: format_timestamp(&star.observed_at),
            });
        }
        stars.sort_by(|a, b| a.repo.cmp(&b.repo));

        let snapshot = Snapshot::new(records, &tracked, stars);
        tracing::info!(
            clone_records = snapshot.clone_history.len(),
            view_records = snapshot.view_history.len(),
            tracked = snapshot.tracked_repos.len(),
            stars = snapshot.repo_stars.len(),
            "exported document store"
        );
        Ok(snapshot)
    }

    async fn import_all(&self, snapshot: &Snapshot, replace_existing: bool) -> bool {
        match self.import(snapshot, replace_existing).await {
            Ok(()) => true,
            Err(e) => {
                tracing::error!(error = %e, "failed to import snapshot");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::snapshot::HistoryEntry;
    use crate::testutils::{at, day, record};
    use reqwest::StatusCode;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};

    fn store() -> DocumentStore<MemoryDocuments> {
        DocumentStore::new(MemoryDocuments::new())
    }

    #[test]
    fn test_document_ids() {
        assert_eq!(history_id("acme/web_app", day("2024-01-02")), "acme%2Fweb%5Fapp_2024-01-02");
        assert_ne!(tracked_id("a%2Fb", None), tracked_id("a/b", None));
        assert_ne!(tracked_id("a__b", None), tracked_id("b", Some("a")));
        assert_eq!(tracked_id("repo", Some("")), tracked_id("repo", None));
    }

    #[tokio::test]
    async fn test_memory_documents() {
        let docs = MemoryDocuments::new();
        let doc = |n: i64| Map::from_iter([("n".to_string(), json!(n))]);
        docs.commit(vec![
            DocumentWrite::Set {
                collection: "c",
                id: "a".into(),
                document: doc(1),
            },
            DocumentWrite::Set {
                collection: "c",
                id: "b".into(),
                document: doc(2),
            },
            DocumentWrite::Delete {
                collection: "missing",
                id: "x".into(),
            },
        ])
        .await
        .unwrap();

        assert_eq!(docs.get("c", "a").await.unwrap(), Some(doc(1)));
        assert_eq!(docs.get("c", "z").await.unwrap(), None);
        assert_eq!(docs.find("c", "n", &json!(2)).await.unwrap(), vec![("b".into(), doc(2))]);

        docs.commit(vec![DocumentWrite::Delete {
            collection: "c",
            id: "a".into(),
        }])
        .await
        .unwrap();
        assert_eq!(docs.list("c").await.unwrap().len(), 1);
        assert_eq!(docs.name(), "memory");
    }

    #[tokio::test]
    async fn test_merge_last_write_wins() {
        let store = store();
        store
            .merge_write_records(
                "repo",
                RecordKind::Clone,
                &[
                    record("repo", RecordKind::Clone, "2024-01-01", 5, 3),
                    record("repo", RecordKind::Clone, "2024-01-01", 8, 4),
                ],
            )
            .await
            .unwrap();

        let history = store.history("repo", RecordKind::Clone, 14).await.unwrap();
        assert_eq!(history, vec![record("repo", RecordKind::Clone, "2024-01-01", 8, 4)]);
    }

    #[tokio::test]
    async fn test_retrack_keeps_metadata() {
        let store = store();
        assert!(store.track_repository("repo", OwnerKind::Individual, None).await);
        store.mark_synced("repo", None).await.unwrap();
        let before = store.list_active_repositories(None).await.unwrap();

        assert!(store.untrack_repository("repo", None).await);
        assert!(store.list_active_repositories(None).await.unwrap().is_empty());
        assert!(store.track_repository("repo", OwnerKind::Organization, None).await);

        let after = store.list_active_repositories(None).await.unwrap();
        assert_eq!(after.len(), 1);
        assert_eq!(after[0].added_at, before[0].added_at);
        assert_eq!(after[0].last_sync_at, before[0].last_sync_at);
        assert_eq!(after[0].owner_kind, OwnerKind::Organization);

        // Marking an untracked-and-never-tracked repository is a no-op
        store.mark_synced("other", None).await.unwrap();
        assert_eq!(store.export_all().await.unwrap().tracked_repos.len(), 1);
    }

    #[tokio::test]
    async fn test_import_modes() {
        let store = store();
        store
            .merge_write_records(
                "repo",
                RecordKind::View,
                &[record("repo", RecordKind::View, "2024-01-01", 5, 3)],
            )
            .await
            .unwrap();
        assert!(store.track_repository("old", OwnerKind::Individual, None).await);

        let mut snapshot = Snapshot::new(vec![], &[], vec![]);
        snapshot.view_history = vec![
            HistoryEntry {
                repo: "repo".into(),
                timestamp: "2024-01-01".into(),
                count: 50,
                uniques: 1,
            },
            HistoryEntry {
                repo: "repo".into(),
                timestamp: "2024-01-02".into(),
                count: 6,
                uniques: 1,
            },
        ];

        assert!(store.import_all(&snapshot, false).await);
        let counts: Vec<_> = store
            .history("repo", RecordKind::View, 14)
            .await
            .unwrap()
            .iter()
            .map(|r| r.count)
            .collect();
        assert_eq!(counts, vec![5, 6]);
        assert_eq!(store.list_active_repositories(None).await.unwrap().len(), 1);

        assert!(store.import_all(&snapshot, true).await);
        let counts: Vec<_> = store
            .history("repo", RecordKind::View, 14)
            .await
            .unwrap()
            .iter()
            .map(|r| r.count)
            .collect();
        assert_eq!(counts, vec![50, 6]);
        assert!(store.list_active_repositories(None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_invalid_import_is_atomic() {
        let store = store();
        assert!(store.track_repository("repo", OwnerKind::Individual, None).await);

        let mut snapshot = Snapshot::new(vec![], &[], vec![]);
        snapshot.clone_history.push(HistoryEntry {
            repo: "repo".into(),
            timestamp: "yesterday".into(),
            count: 1,
            uniques: 1,
        });

        assert!(!store.import_all(&snapshot, true).await);
        assert_eq!(store.list_active_repositories(None).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_summarize_unknown_repository() {
        let store = store();
        let window = TrailingWindow::new(14, at("2024-01-10T00:00:00Z"));
        let summary = store.summarize("nobody/nothing", None, &window).await.unwrap();
        assert_eq!(summary.clones.count, 0);
        assert_eq!(summary.star_count, None);
        assert_eq!(summary.first_collected, None);
    }

    #[tokio::test]
    async fn test_malformed_document_surfaces() {
        let docs = MemoryDocuments::new();
        docs.commit(vec![DocumentWrite::Set {
            collection: "clone_history",
            id: "repo_2024-01-01".into(),
            document: Map::from_iter([
                ("repo".to_string(), json!("repo")),
                ("day".to_string(), json!("2024-01-01")),
                ("count".to_string(), json!("many")),
            ]),
        }])
        .await
        .unwrap();

        let store = DocumentStore::new(docs);
        assert!(matches!(
            store.history("repo", RecordKind::Clone, 14).await,
            Err(StorageError::InvalidData(_))
        ));
    }

    /// Lets several stores share one in-process database.
    struct Shared(Arc<MemoryDocuments>);

    #[async_trait]
    impl DocumentClient for Shared {
        fn name(&self) -> &'static str {
            self.0.name()
        }

        async fn get(&self, collection: &str, id: &str) -> Result<Option<Document>, DocumentError> {
            self.0.get(collection, id).await
        }

        async fn list(&self, collection: &str) -> Result<Vec<(String, Document)>, DocumentError> {
            self.0.list(collection).await
        }

        async fn find(
            &self,
            collection: &str,
            field: &str,
            value: &Value,
        ) -> Result<Vec<(String, Document)>, DocumentError> {
            self.0.find(collection, field, value).await
        }

        async fn commit(&self, writes: Vec<DocumentWrite>) -> Result<(), DocumentError> {
            self.0.commit(writes).await
        }
    }

    /// Untracks `repo` through another store right after the first read of a
    /// tracked document, before the caller gets to write.
    struct UntrackAfterRead {
        docs: Arc<MemoryDocuments>,
        other: DocumentStore<Shared>,
        armed: AtomicBool,
    }

    #[async_trait]
    impl DocumentClient for UntrackAfterRead {
        fn name(&self) -> &'static str {
            "interleaved"
        }

        async fn get(&self, collection: &str, id: &str) -> Result<Option<Document>, DocumentError> {
            let doc = self.docs.get(collection, id).await?;
            if collection == TRACKED && self.armed.swap(false, Ordering::SeqCst) {
                assert!(self.other.untrack_repository("repo", None).await);
            }
            Ok(doc)
        }

        async fn list(&self, collection: &str) -> Result<Vec<(String, Document)>, DocumentError> {
            self.docs.list(collection).await
        }

        async fn find(
            &self,
            collection: &str,
            field: &str,
            value: &Value,
        ) -> Result<Vec<(String, Document)>, DocumentError> {
            self.docs.find(collection, field, value).await
        }

        async fn commit(&self, writes: Vec<DocumentWrite>) -> Result<(), DocumentError> {
            self.docs.commit(writes).await
        }
    }

    #[tokio::test]
    async fn test_untrack_during_mark_synced_sticks() {
        let docs = Arc::new(MemoryDocuments::new());
        let store = DocumentStore::new(Shared(docs.clone()));
        assert!(store.track_repository("repo", OwnerKind::Individual, None).await);

        let syncing = DocumentStore::new(UntrackAfterRead {
            docs: docs.clone(),
            other: DocumentStore::new(Shared(docs.clone())),
            armed: AtomicBool::new(true),
        });
        syncing.mark_synced("repo", None).await.unwrap();

        assert!(store.list_active_repositories(None).await.unwrap().is_empty());
        let doc = docs.get(TRACKED, "repo").await.unwrap().unwrap();
        assert_eq!(doc["is_active"], json!(false));
        assert!(doc["last_sync"].is_string());
    }

    #[tokio::test]
    async fn test_field_update_requires_document() {
        let docs = MemoryDocuments::new();
        let fields = Map::from_iter([("n".to_string(), json!(2))]);
        let err = docs
            .commit(vec![
                DocumentWrite::Set {
                    collection: "c",
                    id: "a".into(),
                    document: Map::from_iter([("m".to_string(), json!(1))]),
                },
                DocumentWrite::Update {
                    collection: "c",
                    id: "b".into(),
                    fields: fields.clone(),
                },
            ])
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            DocumentError::Status {
                status: StatusCode::NOT_FOUND,
                ..
            }
        ));
        assert!(docs.list("c").await.unwrap().is_empty());

        docs.commit(vec![DocumentWrite::Set {
            collection: "c",
            id: "b".into(),
            document: Map::from_iter([("m".to_string(), json!(1))]),
        }])
        .await
        .unwrap();
        docs.commit(vec![DocumentWrite::Update {
            collection: "c",
            id: "b".into(),
            fields,
        }])
        .await
        .unwrap();
        assert_eq!(
            docs.get("c", "b").await.unwrap(),
            Some(Map::from_iter([
                ("m".to_string(), json!(1)),
                ("n".to_string(), json!(2)),
            ]))
        );
    }

    #[tokio::test]
    async fn test_operator_scope_includes_documents_without_user() {
        let docs = MemoryDocuments::new();
        docs.commit(vec![DocumentWrite::Set {
            collection: TRACKED,
            id: "legacy".into(),
            document: Map::from_iter([
                ("repo_name".to_string(), json!("legacy")),
                ("added_at".to_string(), json!("2023-05-01T00:00:00Z")),
                ("is_active".to_string(), json!(true)),
            ]),
        }])
        .await
        .unwrap();

        let store = DocumentStore::new(docs);
        assert!(store.track_repository("scoped", OwnerKind::Individual, Some("u1")).await);

        let operator = store.list_active_repositories(None).await.unwrap();
        assert_eq!(operator.len(), 1);
        assert_eq!(operator[0].repository_id, "legacy");
        assert_eq!(operator[0].owner_kind, OwnerKind::Individual);

        let user = store.list_active_repositories(Some("u1")).await.unwrap();
        assert_eq!(user.len(), 1);
        assert_eq!(user[0].repository_id, "scoped");
    }
}
