//! Change feed consumer trait.

use async_trait::async_trait;

use crate::document::StoredDocument;
use crate::error::StoreError;

/// Ordered stream of newly written documents in one collection.
///
/// Delivery is at-least-once: [`poll`](ChangeFeed::poll) always starts after
/// the last committed checkpoint, so a batch that is never committed comes
/// back on the next poll.
#[async_trait]
pub trait ChangeFeed: Send + Sync {
    /// Return up to `max_items` documents in write order.
    ///
    /// Returns an empty vec if nothing new was written.
    async fn poll(&self, max_items: usize) -> Result<Vec<StoredDocument>, StoreError>;

    /// Advance the checkpoint past the most recently polled batch.
    async fn commit(&self) -> Result<(), StoreError>;
}
