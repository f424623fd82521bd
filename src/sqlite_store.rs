//! SQLite-backed [`Store`] implementation.
//!
//! Two tables: `collections` (name, kind, created_at) and `items`. An item
//! row either owns its bytes or carries the id of the earlier row with the
//! same content hash in `copy_id`; reads join through that reference so
//! callers never see it.

use async_trait::async_trait;
use sqlx::sqlite::SqliteRow;
use sqlx::{QueryBuilder, Row, Sqlite, SqlitePool};
use std::ops::Bound;

use mobility_harvester_core::models::{content_hash, CollectionInfo, PayloadKind, StoredItem};
use mobility_harvester_core::store::{ItemQuery, Order, Store, StoreError, StoreReceipt};

/// SQLite implementation of the [`Store`] trait.
///
/// Cloning the pool is cheap; every runner shares the one built in `main`.
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn collection_kind(&self, name: &str) -> Result<Option<PayloadKind>, StoreError> {
        let kind: Option<String> = sqlx::query_scalar("SELECT kind FROM collections WHERE name = ?")
            .bind(name)
            .fetch_optional(&self.pool)
            .await
            .map_err(StoreError::backend)?;
        kind.map(|k| k.parse().map_err(StoreError::from))
            .transpose()
    }
}

fn write_error(err: sqlx::Error, collection: &str, timestamp: i64) -> StoreError {
    match &err {
        sqlx::Error::Database(db) if db.is_unique_violation() => StoreError::Conflict {
            collection: collection.to_string(),
            timestamp,
        },
        _ => StoreError::backend(err),
    }
}

fn push_bound(qb: &mut QueryBuilder<'_, Sqlite>, bound: Bound<i64>, strict: &str, inclusive: &str) {
    match bound {
        Bound::Included(ts) => {
            qb.push(format!(" AND i.timestamp {inclusive} ")).push_bind(ts);
        }
        Bound::Excluded(ts) => {
            qb.push(format!(" AND i.timestamp {strict} ")).push_bind(ts);
        }
        Bound::Unbounded => {}
    }
}

#[async_trait]
impl Store for SqliteStore {
    async fn create_collection(&self, name: &str, kind: PayloadKind) -> Result<(), StoreError> {
        sqlx::query("INSERT OR IGNORE INTO collections (name, kind, created_at) VALUES (?, ?, ?)")
            .bind(name)
            .bind(kind.as_str())
            .bind(chrono::Utc::now().timestamp())
            .execute(&self.pool)
            .await
            .map_err(StoreError::backend)?;

        match self.collection_kind(name).await? {
            Some(existing) if existing != kind => Err(StoreError::KindMismatch {
                collection: name.to_string(),
                expected: existing,
                actual: kind,
            }),
            Some(_) => Ok(()),
            None => Err(StoreError::UnknownCollection(name.to_string())),
        }
    }

    async fn store(
        &self,
        collection: &str,
        timestamp: i64,
        kind: PayloadKind,
        data: Option<&[u8]>,
        create_if_missing: bool,
    ) -> Result<StoreReceipt, StoreError> {
        match self.collection_kind(collection).await? {
            None if create_if_missing => self.create_collection(collection, kind).await?,
            None => return Err(StoreError::UnknownCollection(collection.to_string())),
            Some(existing) if existing != kind => {
                return Err(StoreError::KindMismatch {
                    collection: collection.to_string(),
                    expected: existing,
                    actual: kind,
                })
            }
            Some(_) => {}
        }

        let hash = data.map(content_hash);
        let mut tx = self.pool.begin().await.map_err(StoreError::backend)?;

        let owner: Option<i64> = match &hash {
            Some(h) => sqlx::query_scalar(
                "SELECT id FROM items WHERE collection = ? AND hash = ? AND copy_id IS NULL LIMIT 1",
            )
            .bind(collection)
            .bind(h)
            .fetch_optional(&mut *tx)
            .await
            .map_err(StoreError::backend)?,
            None => None,
        };

        let stored_bytes = if owner.is_some() { None } else { data };
        let result = sqlx::query(
            "INSERT INTO items (collection, timestamp, data, hash, copy_id) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(collection)
        .bind(timestamp)
        .bind(stored_bytes)
        .bind(&hash)
        .bind(owner)
        .execute(&mut *tx)
        .await
        .map_err(|e| write_error(e, collection, timestamp))?;

        tx.commit().await.map_err(StoreError::backend)?;

        Ok(StoreReceipt {
            id: result.last_insert_rowid(),
            deduplicated: owner.is_some(),
        })
    }

    async fn query(
        &self,
        collection: &str,
        query: &ItemQuery,
    ) -> Result<Vec<StoredItem>, StoreError> {
        let Some(kind) = self.collection_kind(collection).await? else {
            return Ok(Vec::new());
        };
        if query.is_empty_range() {
            return Ok(Vec::new());
        }

        let data_column = if query.skip_data {
            "NULL"
        } else {
            "COALESCE(o.data, i.data)"
        };
        let mut qb: QueryBuilder<'_, Sqlite> = QueryBuilder::new(format!(
            "SELECT i.id, i.timestamp, i.hash, {data_column} AS data \
             FROM items i LEFT JOIN items o ON i.copy_id = o.id \
             WHERE i.collection = "
        ));
        qb.push_bind(collection);
        push_bound(&mut qb, query.lower, ">", ">=");
        push_bound(&mut qb, query.upper, "<", "<=");
        qb.push(match query.order {
            Order::Ascending => " ORDER BY i.timestamp ASC",
            Order::Descending => " ORDER BY i.timestamp DESC",
        });
        if let Some(limit) = query.limit {
            qb.push(" LIMIT ").push_bind(i64::from(limit));
        }

        let rows = qb
            .build()
            .fetch_all(&self.pool)
            .await
            .map_err(StoreError::backend)?;

        rows.iter()
            .map(|row: &SqliteRow| {
                Ok(StoredItem {
                    id: row.try_get("id").map_err(StoreError::backend)?,
                    collection: collection.to_string(),
                    timestamp: row.try_get("timestamp").map_err(StoreError::backend)?,
                    kind,
                    hash: row.try_get("hash").map_err(StoreError::backend)?,
                    data: row.try_get("data").map_err(StoreError::backend)?,
                })
            })
            .collect()
    }

    async fn collections(&self) -> Result<Vec<CollectionInfo>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT c.name, c.kind,
                   MIN(i.timestamp) AS min_ts,
                   MAX(i.timestamp) AS max_ts,
                   COUNT(i.id) AS count,
                   COALESCE(SUM(CASE WHEN i.data IS NOT NULL THEN 1 ELSE 0 END), 0) AS blobs
            FROM collections c
            LEFT JOIN items i ON i.collection = c.name
            GROUP BY c.name, c.kind
            ORDER BY c.name
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(StoreError::backend)?;

        rows.iter()
            .map(|row| {
                let kind: String = row.try_get("kind").map_err(StoreError::backend)?;
                Ok(CollectionInfo {
                    name: row.try_get("name").map_err(StoreError::backend)?,
                    kind: kind.parse()?,
                    min_timestamp: row.try_get("min_ts").map_err(StoreError::backend)?,
                    max_timestamp: row.try_get("max_ts").map_err(StoreError::backend)?,
                    count: row.try_get("count").map_err(StoreError::backend)?,
                    blobs: row.try_get("blobs").map_err(StoreError::backend)?,
                })
            })
            .collect()
    }
}
