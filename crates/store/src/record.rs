//! Typed record access on top of a [`DocumentStore`].

use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;

use etl_core::{Lease, OrchestrationRun, SourceRecord, TransformedRecord};

use crate::document::{ConditionalWrite, DocumentStore, StoredDocument, Version};
use crate::error::StoreError;

/// A document type bound to one collection.
pub trait StoredRecord: Serialize + DeserializeOwned + Send + Sync {
    const COLLECTION: &'static str;

    fn store_id(&self) -> String;

    fn store_partition(&self) -> String;
}

impl StoredRecord for Lease {
    const COLLECTION: &'static str = "orchestrationLease";

    fn store_id(&self) -> String {
        self.id.clone()
    }

    fn store_partition(&self) -> String {
        self.id.clone()
    }
}

impl StoredRecord for OrchestrationRun {
    const COLLECTION: &'static str = "orchestrationRuns";

    fn store_id(&self) -> String {
        self.id.to_string()
    }

    fn store_partition(&self) -> String {
        self.id.to_string()
    }
}

impl StoredRecord for SourceRecord {
    const COLLECTION: &'static str = "extracted";

    fn store_id(&self) -> String {
        self.id.to_string()
    }

    fn store_partition(&self) -> String {
        self.partition_key().to_string()
    }
}

impl StoredRecord for TransformedRecord {
    const COLLECTION: &'static str = "transformed";

    fn store_id(&self) -> String {
        self.id.to_string()
    }

    fn store_partition(&self) -> String {
        self.id.to_string()
    }
}

/// A record together with the version it was read at.
#[derive(Debug, Clone, PartialEq)]
pub struct Versioned<T> {
    pub value: T,
    pub version: Version,
}

impl<T: StoredRecord> Versioned<T> {
    pub fn decode(doc: StoredDocument) -> Result<Self, StoreError> {
        Ok(Self {
            value: serde_json::from_value(doc.body)?,
            version: doc.version,
        })
    }
}

/// Shared, typed handle to the document store.
///
/// Created once per process and cloned into every component.
#[derive(Clone)]
pub struct RecordStore {
    documents: Arc<dyn DocumentStore>,
}

impl RecordStore {
    pub fn new(documents: Arc<dyn DocumentStore>) -> Self {
        Self { documents }
    }

    pub fn documents(&self) -> &Arc<dyn DocumentStore> {
        &self.documents
    }

    /// Point read by id and partition key.
    pub async fn read<T: StoredRecord>(
        &self,
        id: &str,
        partition: &str,
    ) -> Result<Option<Versioned<T>>, StoreError> {
        match self.documents.read(T::COLLECTION, id, partition).await? {
            Some(doc) => Ok(Some(Versioned::decode(doc)?)),
            None => Ok(None),
        }
    }

    /// Compare-and-swap write against the version last read.
    pub async fn write_if_match<T: StoredRecord>(
        &self,
        record: &T,
        expected: Option<&Version>,
    ) -> Result<ConditionalWrite, StoreError> {
        let body = serde_json::to_value(record)?;
        self.documents
            .replace_if_match(
                T::COLLECTION,
                &record.store_id(),
                &record.store_partition(),
                body,
                expected,
            )
            .await
    }

    pub async fn upsert<T: StoredRecord>(&self, record: &T) -> Result<Version, StoreError> {
        let body = serde_json::to_value(record)?;
        self.documents
            .upsert(T::COLLECTION, &record.store_id(), &record.store_partition(), body)
            .await
    }

    pub async fn insert<T: StoredRecord>(&self, record: &T) -> Result<Version, StoreError> {
        let body = serde_json::to_value(record)?;
        self.documents
            .insert(T::COLLECTION, &record.store_id(), &record.store_partition(), body)
            .await
    }
}

impl std::fmt::Debug for RecordStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecordStore").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryStore;
    use etl_core::LEASE_ID;

    fn store() -> RecordStore {
        RecordStore::new(Arc::new(MemoryStore::new()))
    }

    #[tokio::test]
    async fn read_missing_is_none() {
        let store = store();
        let lease = store.read::<Lease>(LEASE_ID, LEASE_ID).await.unwrap();
        assert!(lease.is_none());
    }

    #[tokio::test]
    async fn conditional_create_then_replace() {
        let store = store();
        let mut lease = Lease::default();

        let first = store.write_if_match(&lease, None).await.unwrap();
        let ConditionalWrite::Written(v1) = first else {
            panic!("expected first create to win");
        };

        // A second "create" against the same id loses.
        let again = store.write_if_match(&lease, None).await.unwrap();
        assert_eq!(again, ConditionalWrite::VersionConflict);

        lease.locked = true;
        let second = store.write_if_match(&lease, Some(&v1)).await.unwrap();
        assert!(second.is_written());

        // The old version is now stale.
        let stale = store.write_if_match(&lease, Some(&v1)).await.unwrap();
        assert_eq!(stale, ConditionalWrite::VersionConflict);

        let read = store.read::<Lease>(LEASE_ID, LEASE_ID).await.unwrap().unwrap();
        assert!(read.value.locked);
        assert_ne!(read.version, v1);
    }

    #[tokio::test]
    async fn source_records_route_by_logical_partition() {
        let store = store();
        let record = SourceRecord {
            id: uuid::Uuid::new_v4(),
            name: "n".into(),
            logical_partition: "Partition_A".into(),
            ..SourceRecord::default()
        };
        store.insert(&record).await.unwrap();

        let id = record.id.to_string();
        assert!(store.read::<SourceRecord>(&id, "Partition_B").await.unwrap().is_none());
        let found = store.read::<SourceRecord>(&id, "Partition_A").await.unwrap().unwrap();
        assert_eq!(found.value, record);
    }

    #[tokio::test]
    async fn insert_rejects_duplicate_id() {
        let store = store();
        let run = OrchestrationRun::new(None, None, false, true, "w", "ok");
        store.insert(&run).await.unwrap();
        let err = store.insert(&run).await.unwrap_err();
        assert!(matches!(err, StoreError::AlreadyExists { .. }));
    }
}
