//! Untyped document access with optimistic concurrency.

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::StoreError;

/// Opaque version tag assigned by the store on every successful write.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Version(String);

impl Version {
    pub fn new(tag: impl Into<String>) -> Self {
        Self(tag.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Outcome of a compare-and-swap write.
///
/// Losing the race is an expected result, not an error: failures other than
/// a version mismatch come back as `Err(StoreError)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConditionalWrite {
    Written(Version),
    VersionConflict,
}

impl ConditionalWrite {
    pub fn is_written(&self) -> bool {
        matches!(self, ConditionalWrite::Written(_))
    }
}

/// A document as held by the store.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredDocument {
    pub id: String,
    pub partition: String,
    pub version: Version,
    pub body: Value,
}

/// Backend for a partitioned document collection store.
///
/// Implementations must make [`replace_if_match`](DocumentStore::replace_if_match)
/// atomic: the stored version is compared and replaced in one step.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Point read. `Ok(None)` when the document does not exist.
    async fn read(
        &self,
        collection: &str,
        id: &str,
        partition: &str,
    ) -> Result<Option<StoredDocument>, StoreError>;

    /// Write only if the stored version still equals `expected`.
    ///
    /// `expected = None` means the document must not exist yet.
    async fn replace_if_match(
        &self,
        collection: &str,
        id: &str,
        partition: &str,
        body: Value,
        expected: Option<&Version>,
    ) -> Result<ConditionalWrite, StoreError>;

    /// Unconditional create-or-overwrite.
    async fn upsert(
        &self,
        collection: &str,
        id: &str,
        partition: &str,
        body: Value,
    ) -> Result<Version, StoreError>;

    /// Create a new document; fails with [`StoreError::AlreadyExists`] if the
    /// id is taken within the partition.
    async fn insert(
        &self,
        collection: &str,
        id: &str,
        partition: &str,
        body: Value,
    ) -> Result<Version, StoreError>;
}
