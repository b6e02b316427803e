//! Path-keyed item storage: the `ItemStore` seam, a SQLite backend and an in-memory backend.

use std::collections::{BTreeMap, BTreeSet};
use std::ops::{Deref, DerefMut};
use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use marksync_core::{ItemKind, ItemRow, StoredItem};
use serde::Serialize;
use sqlx::migrate::{MigrateError, Migrator};
use sqlx::pool::PoolConnection;
use sqlx::sqlite::{SqliteConnectOptions, SqliteConnection, SqlitePoolOptions, SqliteRow};
use sqlx::{QueryBuilder, Row, Sqlite, SqlitePool, Transaction};
use thiserror::Error;
use tracing::debug;

pub const CRATE_NAME: &str = "marksync-storage";

pub static MIGRATOR: Migrator = sqlx::migrate!("./migrations");

const ITEM_COLUMNS: &str =
    "id, name, kind, url, date_added, parent_id, source, path, parent_path, synced_at";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("storage unavailable at {url}: {source}")]
    Unavailable {
        url: String,
        #[source]
        source: sqlx::Error,
    },
    #[error("running migrations: {0}")]
    Migration(#[from] MigrateError),
    #[error("{op} failed for {path}: {source}")]
    Operation {
        op: &'static str,
        path: String,
        #[source]
        source: sqlx::Error,
    },
    #[error("{op} rejected for {path}: {reason}")]
    Rejected {
        op: &'static str,
        path: String,
        reason: String,
    },
    #[error("{0} requires an open transaction")]
    NoTransaction(&'static str),
    #[error("a transaction is already open")]
    TransactionOpen,
}

impl StoreError {
    fn op(op: &'static str, path: impl Into<String>) -> impl FnOnce(sqlx::Error) -> Self {
        let path = path.into();
        move |source| Self::Operation { op, path, source }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Inserted,
    Updated,
    Unchanged,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpsertResult {
    pub id: i64,
    pub outcome: UpsertOutcome,
}

/// Row counts and last sync time for one `source` label.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SourceStats {
    pub source: String,
    pub items: i64,
    pub links: i64,
    pub folders: i64,
    pub last_synced: DateTime<Utc>,
}

/// Storage collaborator of the sync engine.
///
/// Operations run inside the open transaction when there is one, otherwise each
/// statement commits on its own.
#[async_trait]
pub trait ItemStore: Send {
    async fn begin(&mut self) -> Result<(), StoreError>;

    async fn commit(&mut self) -> Result<(), StoreError>;

    async fn rollback(&mut self) -> Result<(), StoreError>;

    async fn select_paths_by_scope(&mut self, labels: &[String]) -> Result<BTreeSet<String>, StoreError>;

    async fn find_id_by_path(&mut self, path: &str) -> Result<Option<i64>, StoreError>;

    /// Writes `row` keyed by its path, touching the stored row only when a field differs.
    async fn upsert_by_path(
        &mut self,
        row: &ItemRow,
        synced_at: DateTime<Utc>,
    ) -> Result<UpsertResult, StoreError>;

    /// Returns whether a row was removed; a path that is already gone is not an error.
    async fn delete_by_path(&mut self, path: &str, labels: &[String]) -> Result<bool, StoreError>;

    /// Stored rows in scope, ordered by source then path.
    async fn list_items(&mut self, labels: &[String]) -> Result<Vec<StoredItem>, StoreError>;
}

pub struct SqliteItemStore {
    pool: SqlitePool,
    tx: Option<Transaction<'static, Sqlite>>,
}

enum Conn<'a> {
    Tx(&'a mut SqliteConnection),
    Pooled(PoolConnection<Sqlite>),
}

impl Deref for Conn<'_> {
    type Target = SqliteConnection;

    fn deref(&self) -> &SqliteConnection {
        match self {
            Conn::Tx(conn) => conn,
            Conn::Pooled(conn) => conn,
        }
    }
}

impl DerefMut for Conn<'_> {
    fn deref_mut(&mut self) -> &mut SqliteConnection {
        match self {
            Conn::Tx(conn) => conn,
            Conn::Pooled(conn) => conn,
        }
    }
}

impl SqliteItemStore {
    /// Opens (creating if missing) the database at `database_url` and applies migrations.
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let unavailable = |source| StoreError::Unavailable {
            url: database_url.to_string(),
            source,
        };
        let options = SqliteConnectOptions::from_str(database_url)
            .map_err(unavailable)?
            .create_if_missing(true)
            .foreign_keys(true)
            .busy_timeout(std::time::Duration::from_secs(5));
        // One connection: runs are sequential and `sqlite::memory:` is per-connection.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await
            .map_err(|source| StoreError::Unavailable {
                url: database_url.to_string(),
                source,
            })?;
        MIGRATOR.run(&pool).await?;
        Ok(Self { pool, tx: None })
    }

    pub async fn in_memory() -> Result<Self, StoreError> {
        Self::connect("sqlite::memory:").await
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Every `source` label present in the table, sorted.
    pub async fn distinct_sources(&mut self) -> Result<Vec<String>, StoreError> {
        let mut conn = self.conn("distinct_sources").await?;
        sqlx::query_scalar::<_, String>("SELECT DISTINCT source FROM items ORDER BY source")
            .fetch_all(&mut *conn)
            .await
            .map_err(StoreError::op("distinct_sources", "<all>"))
    }

    /// Per-source totals, sorted by source. Sources with no rows are absent.
    pub async fn source_stats(&mut self) -> Result<Vec<SourceStats>, StoreError> {
        let mut conn = self.conn("source_stats").await?;
        let rows = sqlx::query(
            r#"
            SELECT source,
                   COUNT(*) AS items,
                   SUM(CASE WHEN kind = 'url' THEN 1 ELSE 0 END) AS links,
                   MAX(synced_at) AS last_synced
              FROM items
             GROUP BY source
             ORDER BY source
            "#,
        )
        .fetch_all(&mut *conn)
        .await
        .map_err(StoreError::op("source_stats", "<all>"))?;
        rows.iter()
            .map(|row| {
                let items: i64 = row.try_get("items")?;
                let links: i64 = row.try_get("links")?;
                Ok(SourceStats {
                    source: row.try_get("source")?,
                    items,
                    links,
                    folders: items - links,
                    last_synced: row.try_get("last_synced")?,
                })
            })
            .collect::<Result<Vec<_>, sqlx::Error>>()
            .map_err(StoreError::op("source_stats", "<all>"))
    }

    async fn conn(&mut self, op: &'static str) -> Result<Conn<'_>, StoreError> {
        match self.tx.as_mut() {
            Some(tx) => Ok(Conn::Tx(&mut **tx)),
            None => {
                let pooled = self.pool.acquire().await.map_err(StoreError::op(op, "<pool>"))?;
                Ok(Conn::Pooled(pooled))
            }
        }
    }

    async fn fetch_by_path(&mut self, path: &str) -> Result<Option<StoredItem>, StoreError> {
        let mut conn = self.conn("fetch_by_path").await?;
        let row = sqlx::query(&format!("SELECT {ITEM_COLUMNS} FROM items WHERE path = ?1"))
            .bind(path)
            .fetch_optional(&mut *conn)
            .await
            .map_err(StoreError::op("fetch_by_path", path))?;
        row.map(|r| item_from_row(&r))
            .transpose()
            .map_err(StoreError::op("fetch_by_path", path))
    }
}

fn item_from_row(row: &SqliteRow) -> Result<StoredItem, sqlx::Error> {
    let kind: String = row.try_get("kind")?;
    let kind = ItemKind::parse(&kind).ok_or_else(|| sqlx::Error::ColumnDecode {
        index: "kind".to_string(),
        source: format!("unknown item kind {kind:?}").into(),
    })?;
    Ok(StoredItem {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        kind,
        url: row.try_get("url")?,
        date_added: row.try_get("date_added")?,
        parent_id: row.try_get("parent_id")?,
        source: row.try_get("source")?,
        path: row.try_get("path")?,
        parent_path: row.try_get("parent_path")?,
        synced_at: row.try_get("synced_at")?,
    })
}

fn push_label_list(builder: &mut QueryBuilder<'_, Sqlite>, labels: &[String]) {
    builder.push("(");
    let mut separated = builder.separated(", ");
    for label in labels {
        separated.push_bind(label.clone());
    }
    separated.push_unseparated(")");
}

#[async_trait]
impl ItemStore for SqliteItemStore {
    async fn begin(&mut self) -> Result<(), StoreError> {
        if self.tx.is_some() {
            return Err(StoreError::TransactionOpen);
        }
        let tx = self
            .pool
            .begin()
            .await
            .map_err(StoreError::op("begin", "<transaction>"))?;
        self.tx = Some(tx);
        Ok(())
    }

    async fn commit(&mut self) -> Result<(), StoreError> {
        let tx = self.tx.take().ok_or(StoreError::NoTransaction("commit"))?;
        tx.commit()
            .await
            .map_err(StoreError::op("commit", "<transaction>"))
    }

    async fn rollback(&mut self) -> Result<(), StoreError> {
        let tx = self.tx.take().ok_or(StoreError::NoTransaction("rollback"))?;
        tx.rollback()
            .await
            .map_err(StoreError::op("rollback", "<transaction>"))
    }

    async fn select_paths_by_scope(&mut self, labels: &[String]) -> Result<BTreeSet<String>, StoreError> {
        if labels.is_empty() {
            return Ok(BTreeSet::new());
        }
        let mut builder = QueryBuilder::<Sqlite>::new("SELECT path FROM items WHERE source IN ");
        push_label_list(&mut builder, labels);
        let mut conn = self.conn("select_paths_by_scope").await?;
        let rows = builder
            .build()
            .fetch_all(&mut *conn)
            .await
            .map_err(StoreError::op("select_paths_by_scope", labels.join(",")))?;
        rows.iter()
            .map(|row| row.try_get::<String, _>("path"))
            .collect::<Result<BTreeSet<_>, _>>()
            .map_err(StoreError::op("select_paths_by_scope", labels.join(",")))
    }

    async fn find_id_by_path(&mut self, path: &str) -> Result<Option<i64>, StoreError> {
        let mut conn = self.conn("find_id_by_path").await?;
        sqlx::query_scalar::<_, i64>("SELECT id FROM items WHERE path = ?1")
            .bind(path)
            .fetch_optional(&mut *conn)
            .await
            .map_err(StoreError::op("find_id_by_path", path))
    }

    async fn upsert_by_path(
        &mut self,
        row: &ItemRow,
        synced_at: DateTime<Utc>,
    ) -> Result<UpsertResult, StoreError> {
        if let Some(existing) = self.fetch_by_path(&row.path).await? {
            if existing.matches_row(row) {
                return Ok(UpsertResult {
                    id: existing.id,
                    outcome: UpsertOutcome::Unchanged,
                });
            }
            let mut conn = self.conn("update").await?;
            sqlx::query(
                r#"
                UPDATE items
                   SET name = ?1, kind = ?2, url = ?3, date_added = ?4, parent_id = ?5,
                       source = ?6, parent_path = ?7, synced_at = ?8
                 WHERE id = ?9
                "#,
            )
            .bind(&row.name)
            .bind(row.kind.as_str())
            .bind(&row.url)
            .bind(row.date_added)
            .bind(row.parent_id)
            .bind(&row.source)
            .bind(&row.parent_path)
            .bind(synced_at)
            .bind(existing.id)
            .execute(&mut *conn)
            .await
            .map_err(StoreError::op("update", &row.path))?;
            debug!(path = %row.path, id = existing.id, "updated item");
            return Ok(UpsertResult {
                id: existing.id,
                outcome: UpsertOutcome::Updated,
            });
        }

        let mut conn = self.conn("insert").await?;
        let id = sqlx::query_scalar::<_, i64>(
            r#"
            INSERT INTO items (name, kind, url, date_added, parent_id, source, path, parent_path, synced_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
            ON CONFLICT(path) DO UPDATE SET
                name = excluded.name,
                kind = excluded.kind,
                url = excluded.url,
                date_added = excluded.date_added,
                parent_id = excluded.parent_id,
                source = excluded.source,
                parent_path = excluded.parent_path,
                synced_at = excluded.synced_at
            RETURNING id
            "#,
        )
        .bind(&row.name)
        .bind(row.kind.as_str())
        .bind(&row.url)
        .bind(row.date_added)
        .bind(row.parent_id)
        .bind(&row.source)
        .bind(&row.path)
        .bind(&row.parent_path)
        .bind(synced_at)
        .fetch_one(&mut *conn)
        .await
        .map_err(StoreError::op("insert", &row.path))?;
        debug!(path = %row.path, id, "inserted item");
        Ok(UpsertResult {
            id,
            outcome: UpsertOutcome::Inserted,
        })
    }

    async fn delete_by_path(&mut self, path: &str, labels: &[String]) -> Result<bool, StoreError> {
        if labels.is_empty() {
            return Ok(false);
        }
        let mut builder = QueryBuilder::<Sqlite>::new("DELETE FROM items WHERE path = ");
        builder.push_bind(path.to_string());
        builder.push(" AND source IN ");
        push_label_list(&mut builder, labels);
        let mut conn = self.conn("delete").await?;
        let result = builder
            .build()
            .execute(&mut *conn)
            .await
            .map_err(StoreError::op("delete", path))?;
        Ok(result.rows_affected() > 0)
    }

    async fn list_items(&mut self, labels: &[String]) -> Result<Vec<StoredItem>, StoreError> {
        if labels.is_empty() {
            return Ok(Vec::new());
        }
        let mut builder =
            QueryBuilder::<Sqlite>::new(format!("SELECT {ITEM_COLUMNS} FROM items WHERE source IN "));
        push_label_list(&mut builder, labels);
        builder.push(" ORDER BY source, path");
        let mut conn = self.conn("list_items").await?;
        let rows = builder
            .build()
            .fetch_all(&mut *conn)
            .await
            .map_err(StoreError::op("list_items", labels.join(",")))?;
        rows.iter()
            .map(item_from_row)
            .collect::<Result<Vec<_>, _>>()
            .map_err(StoreError::op("list_items", labels.join(",")))
    }
}

/// Map-backed store with the same transaction and cascade semantics as the SQLite one.
///
/// Used for dry runs (seeded from the real store) and for injecting storage faults in tests.
#[derive(Debug, Default, Clone)]
pub struct MemoryItemStore {
    rows: BTreeMap<String, StoredItem>,
    next_id: i64,
    snapshot: Option<(BTreeMap<String, StoredItem>, i64)>,
    fail_upserts: BTreeSet<String>,
    fail_deletes: BTreeSet<String>,
    hidden_from_lookup: BTreeSet<String>,
    fail_next_commit: bool,
}

impl MemoryItemStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_items(items: impl IntoIterator<Item = StoredItem>) -> Self {
        let rows: BTreeMap<_, _> = items
            .into_iter()
            .map(|item| (item.path.clone(), item))
            .collect();
        let next_id = rows.values().map(|item| item.id).max().unwrap_or(0);
        Self {
            rows,
            next_id,
            ..Self::default()
        }
    }

    pub fn fail_upsert_for(&mut self, path: impl Into<String>) {
        self.fail_upserts.insert(path.into());
    }

    pub fn fail_delete_for(&mut self, path: impl Into<String>) {
        self.fail_deletes.insert(path.into());
    }

    /// Makes `find_id_by_path` miss a path that is still stored.
    pub fn hide_from_lookup(&mut self, path: impl Into<String>) {
        self.hidden_from_lookup.insert(path.into());
    }

    pub fn fail_next_commit(&mut self) {
        self.fail_next_commit = true;
    }

    pub fn get(&self, path: &str) -> Option<&StoredItem> {
        self.rows.get(path)
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn items(&self) -> impl Iterator<Item = &StoredItem> {
        self.rows.values()
    }

    fn remove_cascade(&mut self, id: i64) {
        let children: Vec<i64> = self
            .rows
            .values()
            .filter(|item| item.parent_id == Some(id))
            .map(|item| item.id)
            .collect();
        for child in children {
            self.remove_cascade(child);
        }
        self.rows.retain(|_, item| item.id != id);
    }
}

#[async_trait]
impl ItemStore for MemoryItemStore {
    async fn begin(&mut self) -> Result<(), StoreError> {
        if self.snapshot.is_some() {
            return Err(StoreError::TransactionOpen);
        }
        self.snapshot = Some((self.rows.clone(), self.next_id));
        Ok(())
    }

    async fn commit(&mut self) -> Result<(), StoreError> {
        let (rows, next_id) = self.snapshot.take().ok_or(StoreError::NoTransaction("commit"))?;
        if std::mem::take(&mut self.fail_next_commit) {
            self.rows = rows;
            self.next_id = next_id;
            return Err(StoreError::Rejected {
                op: "commit",
                path: "<transaction>".to_string(),
                reason: "injected commit failure".to_string(),
            });
        }
        Ok(())
    }

    async fn rollback(&mut self) -> Result<(), StoreError> {
        let (rows, next_id) = self
            .snapshot
            .take()
            .ok_or(StoreError::NoTransaction("rollback"))?;
        self.rows = rows;
        self.next_id = next_id;
        Ok(())
    }

    async fn select_paths_by_scope(&mut self, labels: &[String]) -> Result<BTreeSet<String>, StoreError> {
        Ok(self
            .rows
            .values()
            .filter(|item| labels.contains(&item.source))
            .map(|item| item.path.clone())
            .collect())
    }

    async fn find_id_by_path(&mut self, path: &str) -> Result<Option<i64>, StoreError> {
        if self.hidden_from_lookup.contains(path) {
            return Ok(None);
        }
        Ok(self.rows.get(path).map(|item| item.id))
    }

    async fn upsert_by_path(
        &mut self,
        row: &ItemRow,
        synced_at: DateTime<Utc>,
    ) -> Result<UpsertResult, StoreError> {
        if self.fail_upserts.contains(&row.path) {
            return Err(StoreError::Rejected {
                op: "upsert",
                path: row.path.clone(),
                reason: "injected upsert failure".to_string(),
            });
        }
        if let Some(existing) = self.rows.get_mut(&row.path) {
            if existing.matches_row(row) {
                return Ok(UpsertResult {
                    id: existing.id,
                    outcome: UpsertOutcome::Unchanged,
                });
            }
            existing.name = row.name.clone();
            existing.kind = row.kind;
            existing.url = row.url.clone();
            existing.date_added = row.date_added;
            existing.parent_id = row.parent_id;
            existing.source = row.source.clone();
            existing.parent_path = row.parent_path.clone();
            existing.synced_at = synced_at;
            return Ok(UpsertResult {
                id: existing.id,
                outcome: UpsertOutcome::Updated,
            });
        }
        self.next_id += 1;
        let id = self.next_id;
        self.rows.insert(
            row.path.clone(),
            StoredItem {
                id,
                name: row.name.clone(),
                kind: row.kind,
                url: row.url.clone(),
                date_added: row.date_added,
                parent_id: row.parent_id,
                source: row.source.clone(),
                path: row.path.clone(),
                parent_path: row.parent_path.clone(),
                synced_at,
            },
        );
        Ok(UpsertResult {
            id,
            outcome: UpsertOutcome::Inserted,
        })
    }

    async fn delete_by_path(&mut self, path: &str, labels: &[String]) -> Result<bool, StoreError> {
        if self.fail_deletes.contains(path) {
            return Err(StoreError::Rejected {
                op: "delete",
                path: path.to_string(),
                reason: "injected delete failure".to_string(),
            });
        }
        let Some(id) = self
            .rows
            .get(path)
            .filter(|item| labels.contains(&item.source))
            .map(|item| item.id)
        else {
            return Ok(false);
        };
        self.remove_cascade(id);
        Ok(true)
    }

    async fn list_items(&mut self, labels: &[String]) -> Result<Vec<StoredItem>, StoreError> {
        let mut items: Vec<_> = self
            .rows
            .values()
            .filter(|item| labels.contains(&item.source))
            .cloned()
            .collect();
        items.sort_by(|a, b| a.source.cmp(&b.source).then_with(|| a.path.cmp(&b.path)));
        Ok(items)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use marksync_core::{compute_path, TreeNode};
    use tempfile::tempdir;

    fn synced_at() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 2, 24, 12, 0, 0).single().expect("ts")
    }

    fn labels(values: &[&str]) -> Vec<String> {
        values.iter().map(|v| v.to_string()).collect()
    }

    async fn seed_folder_and_link(store: &mut impl ItemStore) -> (i64, i64) {
        let folder = TreeNode::folder("AI", vec![]);
        let folder_row = ItemRow::from_node(&folder, None, None, "bookmark_bar");
        let folder_id = store
            .upsert_by_path(&folder_row, synced_at())
            .await
            .expect("folder")
            .id;
        let link = TreeNode::link("X", "http://x");
        let link_row = ItemRow::from_node(&link, Some(folder_id), Some("AI"), "bookmark_bar");
        let link_id = store
            .upsert_by_path(&link_row, synced_at())
            .await
            .expect("link")
            .id;
        (folder_id, link_id)
    }

    #[tokio::test]
    async fn sqlite_upsert_reports_insert_then_unchanged_then_update() {
        let mut store = SqliteItemStore::in_memory().await.expect("store");
        let link = TreeNode::link("X", "http://x");
        let mut row = ItemRow::from_node(&link, None, None, "bookmark_bar");

        let first = store.upsert_by_path(&row, synced_at()).await.expect("insert");
        assert_eq!(first.outcome, UpsertOutcome::Inserted);

        let second = store.upsert_by_path(&row, synced_at()).await.expect("same");
        assert_eq!(second.outcome, UpsertOutcome::Unchanged);
        assert_eq!(second.id, first.id);

        row.url = Some("http://x2".to_string());
        let third = store.upsert_by_path(&row, synced_at()).await.expect("update");
        assert_eq!(third.outcome, UpsertOutcome::Updated);
        assert_eq!(third.id, first.id);

        let items = store.list_items(&labels(&["bookmark_bar"])).await.expect("list");
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].url.as_deref(), Some("http://x2"));
        assert_eq!(items[0].synced_at, synced_at());
    }

    #[tokio::test]
    async fn sqlite_scope_queries_only_see_requested_sources() {
        let mut store = SqliteItemStore::in_memory().await.expect("store");
        seed_folder_and_link(&mut store).await;
        let other = TreeNode::link("Y", "http://y");
        store
            .upsert_by_path(&ItemRow::from_node(&other, None, None, "other"), synced_at())
            .await
            .expect("other");

        assert_eq!(
            store.distinct_sources().await.expect("sources"),
            labels(&["bookmark_bar", "other"])
        );

        let scoped = store
            .select_paths_by_scope(&labels(&["bookmark_bar"]))
            .await
            .expect("paths");
        assert_eq!(
            scoped.into_iter().collect::<Vec<_>>(),
            vec!["AI".to_string(), compute_path(Some("AI"), "X")]
        );

        assert!(!store
            .delete_by_path("Y", &labels(&["bookmark_bar"]))
            .await
            .expect("out of scope delete"));
        assert!(store.delete_by_path("Y", &labels(&["other"])).await.expect("delete"));
        assert!(!store.delete_by_path("Y", &labels(&["other"])).await.expect("gone"));
    }

    #[tokio::test]
    async fn sqlite_rollback_discards_transaction_writes() {
        let mut store = SqliteItemStore::in_memory().await.expect("store");
        store.begin().await.expect("begin");
        seed_folder_and_link(&mut store).await;
        assert!(store.find_id_by_path("AI>>X").await.expect("lookup").is_some());
        store.rollback().await.expect("rollback");
        assert_eq!(store.find_id_by_path("AI>>X").await.expect("lookup"), None);

        store.begin().await.expect("begin");
        let (folder_id, _) = seed_folder_and_link(&mut store).await;
        store.commit().await.expect("commit");
        assert_eq!(store.find_id_by_path("AI").await.expect("lookup"), Some(folder_id));
    }

    #[tokio::test]
    async fn sqlite_deleting_a_folder_cascades_to_children() {
        let mut store = SqliteItemStore::in_memory().await.expect("store");
        seed_folder_and_link(&mut store).await;
        assert!(store
            .delete_by_path("AI", &labels(&["bookmark_bar"]))
            .await
            .expect("delete"));
        assert!(!store
            .delete_by_path("AI>>X", &labels(&["bookmark_bar"]))
            .await
            .expect("already gone"));
    }

    #[tokio::test]
    async fn unopenable_database_is_unavailable() {
        let dir = tempdir().expect("tempdir");
        let url = format!(
            "sqlite://{}",
            dir.path().join("missing").join("nested").join("bookmarks.db").display()
        );
        let err = match SqliteItemStore::connect(&url).await {
            Ok(_) => panic!("connect should fail for a missing parent directory"),
            Err(err) => err,
        };
        assert!(matches!(err, StoreError::Unavailable { .. }), "{err:?}");
        assert!(!dir.path().join("missing").exists());
    }

    #[tokio::test]
    async fn source_stats_count_rows_per_source() {
        let mut store = SqliteItemStore::in_memory().await.expect("store");
        assert!(store.source_stats().await.expect("empty stats").is_empty());

        seed_folder_and_link(&mut store).await;
        let stats = store.source_stats().await.expect("stats");
        assert_eq!(stats.len(), 1);
        assert_eq!(stats[0].source, "bookmark_bar");
        assert_eq!((stats[0].items, stats[0].links, stats[0].folders), (2, 1, 1));
        assert_eq!(stats[0].last_synced, synced_at());
    }

    #[tokio::test]
    async fn sqlite_file_database_persists_between_connections() {
        let dir = tempdir().expect("tempdir");
        let url = format!("sqlite://{}", dir.path().join("bookmarks.db").display());
        {
            let mut store = SqliteItemStore::connect(&url).await.expect("store");
            seed_folder_and_link(&mut store).await;
            store.pool().close().await;
        }
        let mut reopened = SqliteItemStore::connect(&url).await.expect("reopen");
        let paths = reopened
            .select_paths_by_scope(&labels(&["bookmark_bar"]))
            .await
            .expect("paths");
        assert_eq!(paths.len(), 2);
    }

    #[tokio::test]
    async fn memory_store_mirrors_transaction_and_cascade_semantics() {
        let mut store = MemoryItemStore::new();
        store.begin().await.expect("begin");
        seed_folder_and_link(&mut store).await;
        store.rollback().await.expect("rollback");
        assert!(store.is_empty());

        seed_folder_and_link(&mut store).await;
        assert_eq!(store.len(), 2);
        assert!(store
            .delete_by_path("AI", &labels(&["bookmark_bar"]))
            .await
            .expect("delete"));
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn memory_store_injected_commit_failure_restores_snapshot() {
        let mut store = MemoryItemStore::new();
        store.fail_next_commit();
        store.begin().await.expect("begin");
        seed_folder_and_link(&mut store).await;
        assert!(store.commit().await.is_err());
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn memory_store_seeded_from_items_continues_ids() {
        let mut seed = MemoryItemStore::new();
        let (_, link_id) = seed_folder_and_link(&mut seed).await;
        let items = seed.list_items(&labels(&["bookmark_bar"])).await.expect("list");

        let mut store = MemoryItemStore::from_items(items);
        let extra = TreeNode::link("Z", "http://z");
        let result = store
            .upsert_by_path(&ItemRow::from_node(&extra, None, None, "other"), synced_at())
            .await
            .expect("insert");
        assert!(result.id > link_id);
    }
}
