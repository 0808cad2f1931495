//! In-process document store.
//!
//! Every collection keeps a change log alongside its documents so
//! [`MemoryChangeFeed`] can replay writes in order. Entries every open feed
//! has committed past are dropped; with no feed open the log is kept whole.
//! Used by the test suites and by single-process local runs of the worker.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use serde_json::Value;

use crate::document::{ConditionalWrite, DocumentStore, StoredDocument, Version};
use crate::error::StoreError;
use crate::feed::ChangeFeed;

#[derive(Default)]
struct Collection {
    docs: HashMap<(String, String), StoredDocument>,
    /// (sequence number, document as written)
    log: Vec<(u64, StoredDocument)>,
    /// Committed sequence number of each open feed, by feed id.
    cursors: HashMap<u64, u64>,
}

impl Collection {
    fn compact(&mut self) {
        if let Some(floor) = self.cursors.values().copied().min() {
            self.log.retain(|(seq, _)| *seq > floor);
        }
    }
}

#[derive(Default)]
struct State {
    collections: HashMap<String, Collection>,
    next_seq: u64,
    next_feed: u64,
}

impl State {
    fn write(&mut self, collection: &str, id: &str, partition: &str, body: Value) -> Version {
        self.next_seq += 1;
        let seq = self.next_seq;
        let doc = StoredDocument {
            id: id.to_string(),
            partition: partition.to_string(),
            version: Version::new(format!("\"{seq:016x}\"")),
            body,
        };
        let coll = self.collections.entry(collection.to_string()).or_default();
        coll.log.push((seq, doc.clone()));
        coll.docs.insert((partition.to_string(), id.to_string()), doc.clone());
        doc.version
    }

    fn current(&self, collection: &str, id: &str, partition: &str) -> Option<&StoredDocument> {
        self.collections
            .get(collection)?
            .docs
            .get(&(partition.to_string(), id.to_string()))
    }
}

/// Thread-safe in-memory [`DocumentStore`].
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<State>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Number of live documents in a collection.
    pub fn count(&self, collection: &str) -> usize {
        self.state()
            .collections
            .get(collection)
            .map_or(0, |c| c.docs.len())
    }

    /// Snapshot of all live documents in a collection (unordered).
    pub fn documents(&self, collection: &str) -> Vec<StoredDocument> {
        self.state()
            .collections
            .get(collection)
            .map(|c| c.docs.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Change log entries still retained for `collection`.
    pub fn log_len(&self, collection: &str) -> usize {
        self.state()
            .collections
            .get(collection)
            .map_or(0, |c| c.log.len())
    }

    /// Writes to `collection` with a sequence number above `after`, oldest first.
    ///
    /// Returns the documents together with the sequence number of the last one.
    pub fn changes_since(
        &self,
        collection: &str,
        after: u64,
        max_items: usize,
    ) -> (Vec<StoredDocument>, Option<u64>) {
        let state = self.state();
        let Some(coll) = state.collections.get(collection) else {
            return (Vec::new(), None);
        };
        let entries: Vec<&(u64, StoredDocument)> = coll
            .log
            .iter()
            .filter(|(seq, _)| *seq > after)
            .take(max_items)
            .collect();
        let last = entries.last().map(|(seq, _)| *seq);
        (entries.into_iter().map(|(_, d)| d.clone()).collect(), last)
    }

    /// Start a change feed over `collection` from the oldest retained
    /// log entry.
    pub fn change_feed(self: &Arc<Self>, collection: &str) -> MemoryChangeFeed {
        let mut state = self.state();
        state.next_feed += 1;
        let id = state.next_feed;
        state
            .collections
            .entry(collection.to_string())
            .or_default()
            .cursors
            .insert(id, 0);
        MemoryChangeFeed {
            store: Arc::clone(self),
            id,
            collection: collection.to_string(),
            cursor: Mutex::new(Cursor::default()),
        }
    }

    fn advance_feed(&self, collection: &str, feed: u64, committed: u64) {
        let mut state = self.state();
        if let Some(coll) = state.collections.get_mut(collection) {
            coll.cursors.insert(feed, committed);
            coll.compact();
        }
    }

    fn close_feed(&self, collection: &str, feed: u64) {
        let mut state = self.state();
        if let Some(coll) = state.collections.get_mut(collection) {
            coll.cursors.remove(&feed);
            coll.compact();
        }
    }
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn read(
        &self,
        collection: &str,
        id: &str,
        partition: &str,
    ) -> Result<Option<StoredDocument>, StoreError> {
        Ok(self.state().current(collection, id, partition).cloned())
    }

    async fn replace_if_match(
        &self,
        collection: &str,
        id: &str,
        partition: &str,
        body: Value,
        expected: Option<&Version>,
    ) -> Result<ConditionalWrite, StoreError> {
        let mut state = self.state();
        let stored = state.current(collection, id, partition).map(|d| &d.version);
        if stored != expected {
            return Ok(ConditionalWrite::VersionConflict);
        }
        Ok(ConditionalWrite::Written(state.write(collection, id, partition, body)))
    }

    async fn upsert(
        &self,
        collection: &str,
        id: &str,
        partition: &str,
        body: Value,
    ) -> Result<Version, StoreError> {
        Ok(self.state().write(collection, id, partition, body))
    }

    async fn insert(
        &self,
        collection: &str,
        id: &str,
        partition: &str,
        body: Value,
    ) -> Result<Version, StoreError> {
        let mut state = self.state();
        if state.current(collection, id, partition).is_some() {
            return Err(StoreError::AlreadyExists {
                collection: collection.to_string(),
                id: id.to_string(),
            });
        }
        Ok(state.write(collection, id, partition, body))
    }
}

#[derive(Debug, Default)]
struct Cursor {
    committed: u64,
    pending: Option<u64>,
}

/// Change feed over one [`MemoryStore`] collection.
pub struct MemoryChangeFeed {
    store: Arc<MemoryStore>,
    id: u64,
    collection: String,
    cursor: Mutex<Cursor>,
}

impl MemoryChangeFeed {
    fn cursor(&self) -> MutexGuard<'_, Cursor> {
        self.cursor.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl ChangeFeed for MemoryChangeFeed {
    async fn poll(&self, max_items: usize) -> Result<Vec<StoredDocument>, StoreError> {
        let mut cursor = self.cursor();
        let (docs, last) = self
            .store
            .changes_since(&self.collection, cursor.committed, max_items);
        cursor.pending = last;
        Ok(docs)
    }

    async fn commit(&self) -> Result<(), StoreError> {
        let mut cursor = self.cursor();
        if let Some(seq) = cursor.pending.take() {
            cursor.committed = seq;
            self.store.advance_feed(&self.collection, self.id, seq);
        }
        Ok(())
    }
}

impl Drop for MemoryChangeFeed {
    fn drop(&mut self) {
        self.store.close_feed(&self.collection, self.id);
    }
}
