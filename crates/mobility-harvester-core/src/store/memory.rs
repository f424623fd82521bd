//! In-memory [`Store`] implementation for tests and embedding.
//!
//! Mirrors the SQLite schema: every collection keeps its rows in a
//! `BTreeMap` keyed by timestamp, and a hash index pointing at the row that
//! owns each distinct payload. Copies hold the owner's id, never the bytes.

use std::collections::{BTreeMap, HashMap};
use std::sync::{PoisonError, RwLock};

use async_trait::async_trait;

use crate::models::{content_hash, CollectionInfo, PayloadKind, StoredItem};

use super::{ItemQuery, Order, Store, StoreError, StoreReceipt};

struct Row {
    id: i64,
    hash: Option<String>,
    data: Option<Vec<u8>>,
    copy_id: Option<i64>,
}

struct Collection {
    kind: PayloadKind,
    rows: BTreeMap<i64, Row>,
    by_hash: HashMap<String, i64>,
    timestamp_by_id: HashMap<i64, i64>,
}

impl Collection {
    fn new(kind: PayloadKind) -> Self {
        Self {
            kind,
            rows: BTreeMap::new(),
            by_hash: HashMap::new(),
            timestamp_by_id: HashMap::new(),
        }
    }

    fn materialize(&self, row: &Row) -> Option<Vec<u8>> {
        match row.copy_id {
            Some(owner) => self
                .timestamp_by_id
                .get(&owner)
                .and_then(|ts| self.rows.get(ts))
                .and_then(|owner_row| owner_row.data.clone()),
            None => row.data.clone(),
        }
    }
}

#[derive(Default)]
struct Inner {
    collections: BTreeMap<String, Collection>,
    next_id: i64,
}

/// In-memory store. Cheap to construct; one per test.
#[derive(Default)]
pub struct InMemoryStore {
    inner: RwLock<Inner>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Store for InMemoryStore {
    async fn create_collection(&self, name: &str, kind: PayloadKind) -> Result<(), StoreError> {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        match inner.collections.get(name) {
            Some(existing) if existing.kind != kind => Err(StoreError::KindMismatch {
                collection: name.to_string(),
                expected: existing.kind,
                actual: kind,
            }),
            Some(_) => Ok(()),
            None => {
                inner
                    .collections
                    .insert(name.to_string(), Collection::new(kind));
                Ok(())
            }
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
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        inner.next_id += 1;
        let id = inner.next_id;

        if !inner.collections.contains_key(collection) {
            if !create_if_missing {
                return Err(StoreError::UnknownCollection(collection.to_string()));
            }
            inner
                .collections
                .insert(collection.to_string(), Collection::new(kind));
        }
        let coll = inner
            .collections
            .get_mut(collection)
            .ok_or_else(|| StoreError::UnknownCollection(collection.to_string()))?;

        if coll.kind != kind {
            return Err(StoreError::KindMismatch {
                collection: collection.to_string(),
                expected: coll.kind,
                actual: kind,
            });
        }
        if coll.rows.contains_key(&timestamp) {
            return Err(StoreError::Conflict {
                collection: collection.to_string(),
                timestamp,
            });
        }

        let hash = data.map(content_hash);
        let owner = hash.as_ref().and_then(|h| coll.by_hash.get(h).copied());
        let row = match owner {
            Some(owner_id) => Row {
                id,
                hash: hash.clone(),
                data: None,
                copy_id: Some(owner_id),
            },
            None => {
                if let Some(h) = &hash {
                    coll.by_hash.insert(h.clone(), id);
                }
                Row {
                    id,
                    hash: hash.clone(),
                    data: data.map(<[u8]>::to_vec),
                    copy_id: None,
                }
            }
        };
        coll.timestamp_by_id.insert(id, timestamp);
        coll.rows.insert(timestamp, row);

        Ok(StoreReceipt {
            id,
            deduplicated: owner.is_some(),
        })
    }

    async fn query(
        &self,
        collection: &str,
        query: &ItemQuery,
    ) -> Result<Vec<StoredItem>, StoreError> {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        let Some(coll) = inner.collections.get(collection) else {
            return Ok(Vec::new());
        };
        // `BTreeMap::range` panics on inverted bounds.
        if query.is_empty_range() {
            return Ok(Vec::new());
        }

        let range = coll.rows.range((query.lower, query.upper));
        let to_item = |(ts, row): (&i64, &Row)| StoredItem {
            id: row.id,
            collection: collection.to_string(),
            timestamp: *ts,
            kind: coll.kind,
            hash: row.hash.clone(),
            data: if query.skip_data {
                None
            } else {
                coll.materialize(row)
            },
        };
        let limit = query.limit.map_or(usize::MAX, |l| l as usize);
        let items = match query.order {
            Order::Ascending => range.take(limit).map(to_item).collect(),
            Order::Descending => range.rev().take(limit).map(to_item).collect(),
        };
        Ok(items)
    }

    async fn collections(&self) -> Result<Vec<CollectionInfo>, StoreError> {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        Ok(inner
            .collections
            .iter()
            .map(|(name, coll)| CollectionInfo {
                name: name.clone(),
                kind: coll.kind,
                min_timestamp: coll.rows.keys().next().copied(),
                max_timestamp: coll.rows.keys().next_back().copied(),
                count: coll.rows.len() as i64,
                blobs: coll.rows.values().filter(|r| r.data.is_some()).count() as i64,
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Payload;
    use serde_json::json;

    #[tokio::test]
    async fn test_identical_payloads_are_stored_once() {
        let store = InMemoryStore::new();
        let payload = Payload::Json(json!({"vehicles": 3}));

        let first = store
            .store_payload("positions", 10, PayloadKind::Json, Some(&payload))
            .await
            .unwrap();
        let second = store
            .store_payload("positions", 20, PayloadKind::Json, Some(&payload))
            .await
            .unwrap();
        assert!(!first.deduplicated);
        assert!(second.deduplicated);

        let info = store.collections().await.unwrap();
        assert_eq!(info[0].count, 2);
        assert_eq!(info[0].blobs, 1);

        let rows = store.query("positions", &ItemQuery::all()).await.unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].payload().unwrap(), Some(payload.clone()));
        assert_eq!(rows[1].payload().unwrap(), Some(payload));
    }

    #[tokio::test]
    async fn test_second_write_at_same_timestamp_conflicts() {
        let store = InMemoryStore::new();
        store
            .store("c", 5, PayloadKind::Text, Some(b"a"), true)
            .await
            .unwrap();
        let err = store
            .store("c", 5, PayloadKind::Text, Some(b"b"), true)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Conflict { timestamp: 5, .. }));

        let rows = store.query("c", &ItemQuery::all()).await.unwrap();
        assert_eq!(rows[0].data.as_deref(), Some(&b"a"[..]));
    }

    #[tokio::test]
    async fn test_unknown_collection_without_create() {
        let store = InMemoryStore::new();
        let err = store
            .store("missing", 1, PayloadKind::Json, None, false)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::UnknownCollection(_)));
        assert!(store
            .query("missing", &ItemQuery::all())
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_kind_mismatch_is_rejected() {
        let store = InMemoryStore::new();
        store
            .create_collection("c", PayloadKind::Json)
            .await
            .unwrap();
        let err = store
            .store("c", 1, PayloadKind::Text, Some(b"x"), true)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::KindMismatch { .. }));
    }

    #[tokio::test]
    async fn test_bounds_order_and_limit() {
        let store = InMemoryStore::new();
        for ts in [10, 20, 30, 40] {
            store
                .store("c", ts, PayloadKind::Text, Some(ts.to_string().as_bytes()), true)
                .await
                .unwrap();
        }

        let after = store
            .query("c", &ItemQuery::all().after(20))
            .await
            .unwrap();
        assert_eq!(
            after.iter().map(|r| r.timestamp).collect::<Vec<_>>(),
            vec![30, 40]
        );

        let latest_two = store
            .query("c", &ItemQuery::all().until(30).descending().limit(2))
            .await
            .unwrap();
        assert_eq!(
            latest_two.iter().map(|r| r.timestamp).collect::<Vec<_>>(),
            vec![30, 20]
        );

        let window = store
            .query("c", &ItemQuery::all().since(20).before(40).skip_data())
            .await
            .unwrap();
        assert_eq!(window.len(), 2);
        assert!(window.iter().all(|r| r.data.is_none()));

        let empty = store
            .query("c", &ItemQuery::all().after(30).before(30))
            .await
            .unwrap();
        assert!(empty.is_empty());
    }

    #[tokio::test]
    async fn test_empty_result_is_persisted() {
        let store = InMemoryStore::new();
        store
            .store_payload("h", 7, PayloadKind::Json, None)
            .await
            .unwrap();
        let latest = store.latest("h").await.unwrap().unwrap();
        assert_eq!(latest.timestamp, 7);
        assert_eq!(latest.hash, None);
    }
}
