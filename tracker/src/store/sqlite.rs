//! Embedded SQLite backend. Aggregates are computed in SQL.
use super::snapshot::{Snapshot, StarEntry};
use super::{StorageError, TrafficStore, check_batch};
use crate::record::{RecordKind, TrafficRecord, parse_day};
use crate::summary::TrailingWindow;
use crate::types::{
    KindTotals, OwnerKind, RepositorySummary, StarSnapshot, TrackedRepository, format_timestamp,
    now, parse_timestamp,
};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteConnection};
use sqlx::{ConnectOptions, Connection};
use std::path::{Path, PathBuf};
use std::time::Duration;

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS clone_history (
        repo TEXT NOT NULL,
        day TEXT NOT NULL,
        count INTEGER NOT NULL,
        uniques INTEGER NOT NULL,
        PRIMARY KEY (repo, day)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS view_history (
        repo TEXT NOT NULL,
        day TEXT NOT NULL,
        count INTEGER NOT NULL,
        uniques INTEGER NOT NULL,
        PRIMARY KEY (repo, day)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS tracked_repos (
        repo_name TEXT NOT NULL,
        user_id TEXT NOT NULL DEFAULT '',
        added_at TEXT NOT NULL,
        is_active INTEGER NOT NULL DEFAULT 1,
        last_sync TEXT,
        owner_type TEXT NOT NULL DEFAULT 'user',
        PRIMARY KEY (repo_name, user_id)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS repo_stars (
        repo TEXT PRIMARY KEY,
        star_count INTEGER NOT NULL,
        last_updated TEXT NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_tracked_repos_user ON tracked_repos(user_id, is_active)",
];

/// `{repos}` is replaced by a subquery yielding the repositories to summarize.
/// ?1 is the first day of the trailing window, ?2 the user scope.
const SUMMARY_SQL: &str = r#"
WITH clones AS (
    SELECT repo,
        SUM(count) AS total,
        SUM(uniques) AS total_uniques,
        SUM(CASE WHEN day >= ?1 THEN count ELSE 0 END) AS recent,
        SUM(CASE WHEN day >= ?1 THEN uniques ELSE 0 END) AS recent_uniques,
        MIN(day) AS first_day
    FROM clone_history
    GROUP BY repo
), views AS (
    SELECT repo,
        SUM(count) AS total,
        SUM(uniques) AS total_uniques,
        SUM(CASE WHEN day >= ?1 THEN count ELSE 0 END) AS recent,
        SUM(CASE WHEN day >= ?1 THEN uniques ELSE 0 END) AS recent_uniques,
        MIN(day) AS first_day
    FROM view_history
    GROUP BY repo
)
SELECT
    r.repo AS repo,
    COALESCE(c.total, 0) AS clones,
    COALESCE(c.total_uniques, 0) AS unique_clones,
    COALESCE(c.recent, 0) AS recent_clones,
    COALESCE(c.recent_uniques, 0) AS recent_unique_clones,
    COALESCE(v.total, 0) AS views,
    COALESCE(v.total_uniques, 0) AS unique_views,
    COALESCE(v.recent, 0) AS recent_views,
    COALESCE(v.recent_uniques, 0) AS recent_unique_views,
    s.star_count AS star_count,
    t.last_sync AS last_sync,
    c.first_day AS first_clone_day,
    v.first_day AS first_view_day
FROM ({repos}) r
LEFT JOIN clones c ON c.repo = r.repo
LEFT JOIN views v ON v.repo = r.repo
LEFT JOIN repo_stars s ON s.repo = r.repo
LEFT JOIN tracked_repos t ON t.repo_name = r.repo AND t.user_id = ?2
ORDER BY r.repo
"#;

const ACTIVE_REPOS: &str =
    "SELECT repo_name AS repo FROM tracked_repos WHERE user_id = ?2 AND is_active = 1";
const SINGLE_REPO: &str = "SELECT ?3 AS repo";

#[derive(sqlx::FromRow)]
struct TrackedRow {
    repo_name: String,
    user_id: String,
    added_at: String,
    is_active: bool,
    last_sync: Option<String>,
    owner_type: String,
}

impl TrackedRow {
    fn into_tracked(self) -> Result<TrackedRepository, StorageError> {
        Ok(TrackedRepository {
            added_at: stored_timestamp(&self.added_at)?,
            last_sync_at: self.last_sync.as_deref().map(stored_timestamp).transpose()?,
            owner_kind: OwnerKind::from_stored(&self.owner_type),
            active: self.is_active,
            owning_user_id: Some(self.user_id).filter(|u| !u.is_empty()),
            repository_id: self.repo_name,
        })
    }
}

#[derive(sqlx::FromRow)]
struct HistoryRow {
    repo: String,
    day: String,
    count: i64,
    uniques: i64,
}

impl HistoryRow {
    fn into_record(self, kind: RecordKind) -> Result<TrafficRecord, StorageError> {
        let day = stored_day(&self.day)?;
        let count = u32::try_from(self.count).map_err(|_| invalid("count", self.count))?;
        let uniques = u32::try_from(self.uniques).map_err(|_| invalid("uniques", self.uniques))?;
        TrafficRecord::new(self.repo, kind, day, count, uniques)
            .map_err(|e| StorageError::InvalidData(e.to_string()))
    }
}

#[derive(sqlx::FromRow)]
struct SummaryRow {
    repo: String,
    clones: i64,
    unique_clones: i64,
    recent_clones: i64,
    recent_unique_clones: i64,
    views: i64,
    unique_views: i64,
    recent_views: i64,
    recent_unique_views: i64,
    star_count: Option<i64>,
    last_sync: Option<String>,
    first_clone_day: Option<String>,
    first_view_day: Option<String>,
}

impl SummaryRow {
    fn into_summary(self) -> Result<RepositorySummary, StorageError> {
        let first_clone = self.first_clone_day.as_deref().map(stored_day).transpose()?;
        let first_view = self.first_view_day.as_deref().map(stored_day).transpose()?;

        Ok(RepositorySummary {
            clones: totals(self.clones, self.unique_clones)?,
            views: totals(self.views, self.unique_views)?,
            recent_clones: totals(self.recent_clones, self.recent_unique_clones)?,
            recent_views: totals(self.recent_views, self.recent_unique_views)?,
            star_count: self
                .star_count
                .map(|s| u32::try_from(s).map_err(|_| invalid("star_count", s)))
                .transpose()?,
            last_sync_at: self.last_sync.as_deref().map(stored_timestamp).transpose()?,
            first_collected: match (first_clone, first_view) {
                (Some(a), Some(b)) => Some(a.min(b)),
                (a, b) => a.or(b),
            },
            repository_id: self.repo,
        })
    }
}

fn totals(count: i64, uniques: i64) -> Result<KindTotals, StorageError> {
    Ok(KindTotals {
        count: u64::try_from(count).map_err(|_| invalid("count", count))?,
        uniques: u64::try_from(uniques).map_err(|_| invalid("uniques", uniques))?,
    })
}

fn invalid(field: &str, value: impl std::fmt::Display) -> StorageError {
    StorageError::InvalidData(format!("{field} out of range: {value}"))
}

fn stored_timestamp(value: &str) -> Result<DateTime<Utc>, StorageError> {
    parse_timestamp(value).ok_or_else(|| invalid("timestamp", value))
}

fn stored_day(value: &str) -> Result<NaiveDate, StorageError> {
    parse_day(value).ok_or_else(|| invalid("day", value))
}

fn day_key(day: NaiveDate) -> String {
    day.format("%Y-%m-%d").to_string()
}

fn scope(owner: Option<&str>) -> &str {
    owner.unwrap_or("")
}

pub struct SqliteStore {
    path: PathBuf,
    options: SqliteConnectOptions,
}

impl SqliteStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let options = SqliteConnectOptions::new()
            .filename(&path)
            .create_if_missing(true)
            .busy_timeout(Duration::from_secs(30));

        SqliteStore { path, options }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Every operation uses its own short-lived connection.
    async fn connect(&self) -> Result<SqliteConnection, StorageError> {
        Ok(self.options.connect().await?)
    }

    async fn upsert_tracked(
        &self,
        repository_id: &str,
        owner_kind: OwnerKind,
        owner: Option<&str>,
    ) -> Result<(), StorageError> {
        let mut conn = self.connect().await?;
        sqlx::query(
            r#"
            INSERT INTO tracked_repos (repo_name, user_id, added_at, is_active, owner_type)
            VALUES (?, ?, ?, 1, ?)
            ON CONFLICT (repo_name, user_id) DO UPDATE SET
                is_active = 1,
                owner_type = excluded.owner_type
            "#,
        )
        .bind(repository_id)
        .bind(scope(owner))
        .bind(format_timestamp(&now()))
        .bind(owner_kind.as_str())
        .execute(&mut conn)
        .await?;
        Ok(())
    }

    async fn deactivate(
        &self,
        repository_id: &str,
        owner: Option<&str>,
    ) -> Result<(), StorageError> {
        let mut conn = self.connect().await?;
        sqlx::query("UPDATE tracked_repos SET is_active = 0 WHERE repo_name = ? AND user_id = ?")
            .bind(repository_id)
            .bind(scope(owner))
            .execute(&mut conn)
            .await?;
        Ok(())
    }

    async fn all_records(
        &self,
        conn: &mut SqliteConnection,
    ) -> Result<Vec<TrafficRecord>, StorageError> {
        let mut records = Vec::new();
        for kind in RecordKind::ALL {
            let rows: Vec<HistoryRow> = sqlx::query_as(&format!(
                "SELECT repo, day, count, uniques FROM {} ORDER BY repo, day",
                kind.history_name()
            ))
            .fetch_all(&mut *conn)
            .await?;

            for row in rows {
                records.push(row.into_record(kind)?);
            }
        }
        Ok(records)
    }

    async fn summaries(
        &self,
        repos: &str,
        repository_id: Option<&str>,
        owner: Option<&str>,
        window: &TrailingWindow,
    ) -> Result<Vec<RepositorySummary>, StorageError> {
        let mut conn = self.connect().await?;
        let sql = SUMMARY_SQL.replace("{repos}", repos);

        let mut query = sqlx::query_as::<_, SummaryRow>(&sql)
            .bind(day_key(window.first_day()))
            .bind(scope(owner));
        if let Some(repository_id) = repository_id {
            query = query.bind(repository_id);
        }

        query
            .fetch_all(&mut conn)
            .await?
            .into_iter()
            .map(SummaryRow::into_summary)
            .collect()
    }

    async fn import(
        &self,
        snapshot: &Snapshot,
        replace_existing: bool,
    ) -> Result<(), StorageError> {
        // Validate everything before touching the database
        let records = snapshot.records()?;
        let tracked = snapshot.tracked()?;
        let stars = snapshot.stars()?;

        let mut conn = self.connect().await?;
        let mut tx = conn.begin().await?;

        if replace_existing {
            for table in ["clone_history", "view_history", "tracked_repos", "repo_stars"] {
                sqlx::query(&format!("DELETE FROM {table}"))
                    .execute(&mut *tx)
                    .await?;
            }
        }

        for record in &records {
            sqlx::query(&format!(
                "INSERT INTO {} (repo, day, count, uniques) VALUES (?, ?, ?, ?) \
                 ON CONFLICT (repo, day) DO NOTHING",
                record.kind.history_name()
            ))
            .bind(&record.repository_id)
            .bind(day_key(record.day))
            .bind(record.count)
            .bind(record.unique_count)
            .execute(&mut *tx)
            .await?;
        }

        for repo in &tracked {
            sqlx::query(
                r#"
                INSERT INTO tracked_repos
                    (repo_name, user_id, added_at, is_active, last_sync, owner_type)
                VALUES (?, ?, ?, ?, ?, ?)
                ON CONFLICT (repo_name, user_id) DO UPDATE SET
                    added_at = excluded.added_at,
                    is_active = excluded.is_active,
                    last_sync = excluded.last_sync,
                    owner_type = excluded.owner_type
                "#,
            )
            .bind(&repo.repository_id)
            .bind(scope(repo.owning_user_id.as_deref()))
            .bind(format_timestamp(&repo.added_at))
            .bind(repo.active)
            .bind(repo.last_sync_at.as_ref().map(format_timestamp))
            .bind(repo.owner_kind.as_str())
            .execute(&mut *tx)
            .await?;
        }

        for (repo, star_count, last_updated) in &stars {
            sqlx::query(
                r#"
                INSERT INTO repo_stars (repo, star_count, last_updated) VALUES (?, ?, ?)
                ON CONFLICT (repo) DO UPDATE SET
                    star_count = excluded.star_count,
                    last_updated = excluded.last_updated
                "#,
            )
            .bind(repo)
            .bind(*star_count)
            .bind(format_timestamp(last_updated))
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;

        tracing::info!(
            records = records.len(),
            tracked = tracked.len(),
            stars = stars.len(),
            replace_existing,
            "sqlite import complete"
        );
        Ok(())
    }
}

#[async_trait]
impl TrafficStore for SqliteStore {
    fn backend(&self) -> &'static str {
        "sqlite"
    }

    async fn setup(&self) -> Result<(), StorageError> {
        let mut conn = self.connect().await?;
        for statement in SCHEMA {
            sqlx::query(statement).execute(&mut conn).await?;
        }
        tracing::debug!(path = ?self.path, "sqlite schema ready");
        Ok(())
    }

    async fn list_active_repositories(
        &self,
        owner: Option<&str>,
    ) -> Result<Vec<TrackedRepository>, StorageError> {
        let mut conn = self.connect().await?;
        let rows: Vec<TrackedRow> = sqlx::query_as(
            r#"
            SELECT repo_name, user_id, added_at, is_active, last_sync, owner_type
            FROM tracked_repos
            WHERE user_id = ? AND is_active = 1
            ORDER BY repo_name
            "#,
        )
        .bind(scope(owner))
        .fetch_all(&mut conn)
        .await?;

        rows.into_iter().map(TrackedRow::into_tracked).collect()
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

        let sql = format!(
            r#"
            INSERT INTO {} (repo, day, count, uniques) VALUES (?, ?, ?, ?)
            ON CONFLICT (repo, day) DO UPDATE SET
                count = excluded.count,
                uniques = excluded.uniques
            "#,
            kind.history_name()
        );

        let mut conn = self.connect().await?;
        let mut tx = conn.begin().await?;
        for record in records {
            sqlx::query(&sql)
                .bind(repository_id)
                .bind(day_key(record.day))
                .bind(record.count)
                .bind(record.unique_count)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;

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
        let mut conn = self.connect().await?;
        sqlx::query(
            r#"
            INSERT INTO repo_stars (repo, star_count, last_updated) VALUES (?, ?, ?)
            ON CONFLICT (repo) DO UPDATE SET
                star_count = excluded.star_count,
                last_updated = excluded.last_updated
            "#,
        )
        .bind(repository_id)
        .bind(star_count)
        .bind(format_timestamp(&now()))
        .execute(&mut conn)
        .await?;
        Ok(())
    }

    async fn mark_synced(
        &self,
        repository_id: &str,
        owner: Option<&str>,
    ) -> Result<(), StorageError> {
        let mut conn = self.connect().await?;
        sqlx::query("UPDATE tracked_repos SET last_sync = ? WHERE repo_name = ? AND user_id = ?")
            .bind(format_timestamp(&now()))
            .bind(repository_id)
            .bind(scope(owner))
            .execute(&mut conn)
            .await?;
        Ok(())
    }

    async fn history(
        &self,
        repository_id: &str,
        kind: RecordKind,
        days: usize,
    ) -> Result<Vec<TrafficRecord>, StorageError> {
        let mut conn = self.connect().await?;
        let rows: Vec<HistoryRow> = sqlx::query_as(&format!(
            "SELECT repo, day, count, uniques FROM {} WHERE repo = ? ORDER BY day DESC LIMIT ?",
            kind.history_name()
        ))
        .bind(repository_id)
        .bind(i64::try_from(days).unwrap_or(i64::MAX))
        .fetch_all(&mut conn)
        .await?;

        let mut records = rows
            .into_iter()
            .map(|row| row.into_record(kind))
            .collect::<Result<Vec<_>, _>>()?;
        records.reverse();
        Ok(records)
    }

    async fn star_snapshot(
        &self,
        repository_id: &str,
    ) -> Result<Option<StarSnapshot>, StorageError> {
        let mut conn = self.connect().await?;
        let row: Option<(i64, String)> =
            sqlx::query_as("SELECT star_count, last_updated FROM repo_stars WHERE repo = ?")
                .bind(repository_id)
                .fetch_optional(&mut conn)
                .await?;

        row.map(|(star_count, last_updated)| {
            Ok(StarSnapshot {
                repository_id: repository_id.to_string(),
                star_count: u32::try_from(star_count)
                    .map_err(|_| invalid("star_count", star_count))?,
                observed_at: stored_timestamp(&last_updated)?,
            })
        })
        .transpose()
    }

    async fn summarize(
        &self,
        repository_id: &str,
        owner: Option<&str>,
        window: &TrailingWindow,
    ) -> Result<RepositorySummary, StorageError> {
        self.summaries(SINGLE_REPO, Some(repository_id), owner, window)
            .await?
            .pop()
            .ok_or_else(|| StorageError::InvalidData(format!("no summary row for {repository_id}")))
    }

    async fn summarize_all(
        &self,
        owner: Option<&str>,
        window: &TrailingWindow,
    ) -> Result<Vec<RepositorySummary>, StorageError> {
        self.summaries(ACTIVE_REPOS, None, owner, window).await
    }

    async fn export_all(&self) -> Result<Snapshot, StorageError> {
        let mut conn = self.connect().await?;
        let records = self.all_records(&mut conn).await?;

        let tracked = sqlx::query_as::<_, TrackedRow>(
            "SELECT repo_name, user_id, added_at, is_active, last_sync, owner_type \
             FROM tracked_repos ORDER BY user_id, repo_name",
        )
        .fetch_all(&mut conn)
        .await?
        .into_iter()
        .map(TrackedRow::into_tracked)
        .collect::<Result<Vec<_>, _>>()?;

        let stars = sqlx::query_as::<_, (String, i64, String)>(
            "SELECT repo, star_count, last_updated FROM repo_stars ORDER BY repo",
        )
        .fetch_all(&mut conn)
        .await?
        .into_iter()
        .map(|(repo, star_count, last_updated)| {
            Ok(StarEntry {
                repo,
                star_count: u32::try_from(star_count)
                    .map_err(|_| invalid("star_count", star_count))?,
                last_updated,
            })
        })
        .collect::<Result<Vec<_>, StorageError>>()?;

        let snapshot = Snapshot::new(records, &tracked, stars);
        tracing::info!(
            clone_records = snapshot.clone_history.len(),
            view_records = snapshot.view_history.len(),
            tracked = snapshot.tracked_repos.len(),
            stars = snapshot.repo_stars.len(),
            "exported sqlite store"
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
