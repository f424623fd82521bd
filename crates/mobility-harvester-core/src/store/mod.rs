//! Storage abstraction for Mobility Harvester.
//!
//! The [`Store`] trait is an append-only, timestamp-keyed log of opaque
//! payload bytes, grouped in named collections. Two guarantees hold for
//! every backend:
//!
//! - **Uniqueness**: at most one item per `(collection, timestamp)`; a
//!   second write to the same key fails with [`StoreError::Conflict`].
//! - **Content deduplication**: bytes whose hash was already stored in the
//!   collection are not written again; the new row references the earlier
//!   one, and reads resolve that reference transparently.
//!
//! Implementations must be `Send + Sync`; every runner holds the same store
//! handle behind an `Arc`.

pub mod memory;

use std::ops::Bound;

use async_trait::async_trait;
use thiserror::Error;

use crate::models::{CollectionInfo, Payload, PayloadError, PayloadKind, StoredItem};

/// Errors returned by [`Store`] implementations.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("unknown collection '{0}'")]
    UnknownCollection(String),
    #[error("an item already exists in '{collection}' at timestamp {timestamp}")]
    Conflict { collection: String, timestamp: i64 },
    #[error("collection '{collection}' holds {expected} payloads, refusing {actual}")]
    KindMismatch {
        collection: String,
        expected: PayloadKind,
        actual: PayloadKind,
    },
    #[error(transparent)]
    Payload(#[from] PayloadError),
    #[error("storage backend error: {0}")]
    Backend(#[source] Box<dyn std::error::Error + Send + Sync>),
}

impl StoreError {
    pub fn backend(err: impl std::error::Error + Send + Sync + 'static) -> Self {
        StoreError::Backend(Box::new(err))
    }
}

/// Result ordering by timestamp.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Order {
    #[default]
    Ascending,
    Descending,
}

/// A time-range read over one collection.
///
/// Built with the chained helpers:
///
/// ```rust
/// use mobility_harvester_core::store::ItemQuery;
///
/// // The five rows strictly after t=100, oldest first.
/// let q = ItemQuery::all().after(100).limit(5);
/// assert!(!q.contains(100));
/// assert!(q.contains(101));
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct ItemQuery {
    pub lower: Bound<i64>,
    pub upper: Bound<i64>,
    pub order: Order,
    pub limit: Option<u32>,
    pub skip_data: bool,
}

impl ItemQuery {
    pub fn all() -> Self {
        Self {
            lower: Bound::Unbounded,
            upper: Bound::Unbounded,
            order: Order::Ascending,
            limit: None,
            skip_data: false,
        }
    }

    /// Timestamps strictly greater than `ts`.
    pub fn after(mut self, ts: i64) -> Self {
        self.lower = Bound::Excluded(ts);
        self
    }

    /// Timestamps greater than or equal to `ts`.
    pub fn since(mut self, ts: i64) -> Self {
        self.lower = Bound::Included(ts);
        self
    }

    /// Timestamps strictly lower than `ts`.
    pub fn before(mut self, ts: i64) -> Self {
        self.upper = Bound::Excluded(ts);
        self
    }

    /// Timestamps lower than or equal to `ts`.
    pub fn until(mut self, ts: i64) -> Self {
        self.upper = Bound::Included(ts);
        self
    }

    pub fn descending(mut self) -> Self {
        self.order = Order::Descending;
        self
    }

    pub fn limit(mut self, limit: u32) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Return row metadata only; `data` is left `None`.
    pub fn skip_data(mut self) -> Self {
        self.skip_data = true;
        self
    }

    /// True when no timestamp can satisfy both bounds.
    pub fn is_empty_range(&self) -> bool {
        match (self.lower, self.upper) {
            (Bound::Included(lo), Bound::Included(hi)) => lo > hi,
            (Bound::Included(lo), Bound::Excluded(hi))
            | (Bound::Excluded(lo), Bound::Included(hi))
            | (Bound::Excluded(lo), Bound::Excluded(hi)) => lo >= hi,
            _ => false,
        }
    }

    pub fn contains(&self, ts: i64) -> bool {
        let lower_ok = match self.lower {
            Bound::Included(lo) => ts >= lo,
            Bound::Excluded(lo) => ts > lo,
            Bound::Unbounded => true,
        };
        let upper_ok = match self.upper {
            Bound::Included(hi) => ts <= hi,
            Bound::Excluded(hi) => ts < hi,
            Bound::Unbounded => true,
        };
        lower_ok && upper_ok
    }
}

impl Default for ItemQuery {
    fn default() -> Self {
        Self::all()
    }
}

/// Outcome of a successful write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreReceipt {
    pub id: i64,
    /// True when the bytes were already present and the row references them.
    pub deduplicated: bool,
}

/// Abstract storage backend.
///
/// | Method | Purpose |
/// |--------|---------|
/// | [`create_collection`](Store::create_collection) | Declare a collection and its payload kind |
/// | [`store`](Store::store) | Append one item, deduplicating its bytes |
/// | [`query`](Store::query) | Time-range read with copies resolved |
/// | [`collections`](Store::collections) | List collections with bounds and counts |
#[async_trait]
pub trait Store: Send + Sync {
    /// Create the collection if it does not exist.
    ///
    /// Fails with [`StoreError::KindMismatch`] when it exists with another kind.
    async fn create_collection(&self, name: &str, kind: PayloadKind) -> Result<(), StoreError>;

    /// Append an item. `data == None` records a "computed but empty" result.
    async fn store(
        &self,
        collection: &str,
        timestamp: i64,
        kind: PayloadKind,
        data: Option<&[u8]>,
        create_if_missing: bool,
    ) -> Result<StoreReceipt, StoreError>;

    /// Read items. An unknown collection reads as empty.
    async fn query(&self, collection: &str, query: &ItemQuery)
        -> Result<Vec<StoredItem>, StoreError>;

    async fn collections(&self) -> Result<Vec<CollectionInfo>, StoreError>;

    /// Encode and append a typed payload, creating the collection if needed.
    async fn store_payload(
        &self,
        collection: &str,
        timestamp: i64,
        kind: PayloadKind,
        payload: Option<&Payload>,
    ) -> Result<StoreReceipt, StoreError> {
        if let Some(payload) = payload {
            payload.expect_kind(kind)?;
        }
        let bytes = payload.map(Payload::to_bytes);
        self.store(collection, timestamp, kind, bytes.as_deref(), true)
            .await
    }

    /// Most recent item of a collection, without its data.
    async fn latest(&self, collection: &str) -> Result<Option<StoredItem>, StoreError> {
        let rows = self
            .query(collection, &ItemQuery::all().descending().limit(1).skip_data())
            .await?;
        Ok(rows.into_iter().next())
    }

    /// Oldest item of a collection, without its data.
    async fn earliest(&self, collection: &str) -> Result<Option<StoredItem>, StoreError> {
        let rows = self
            .query(collection, &ItemQuery::all().limit(1).skip_data())
            .await?;
        Ok(rows.into_iter().next())
    }
}
