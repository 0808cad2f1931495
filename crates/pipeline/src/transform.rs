//! Change-feed consumer that derives transformed records.
//!
//! Batches are committed on the feed only after every write in them has
//! landed, so a crash mid-batch redelivers it. Writes are upserts keyed by
//! the source id, which makes redelivery harmless.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::Notify;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use etl_core::config::TransformConfig;
use etl_core::{SourceRecord, TransformedRecord};
use etl_store::{ChangeFeed, RecordStore, StoredDocument};

use crate::error::PipelineError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransformSummary {
    pub batch_id: Uuid,
    pub transformed: usize,
    pub skipped: usize,
}

pub struct TransformWorker {
    store: RecordStore,
    feed: Arc<dyn ChangeFeed>,
    location: String,
    batch_size: usize,
    poll_interval: Duration,
}

impl TransformWorker {
    pub fn new(
        store: RecordStore,
        feed: Arc<dyn ChangeFeed>,
        location: impl Into<String>,
        config: &TransformConfig,
    ) -> Self {
        Self {
            store,
            feed,
            location: location.into(),
            batch_size: config.batch_size.max(1),
            poll_interval: config.poll_interval,
        }
    }

    /// Transform one delivered batch, in delivery order.
    ///
    /// Each record is stamped with its 1-based arrival position in the
    /// batch; skipped documents still take up their slot.
    pub async fn process_batch(
        &self,
        documents: &[StoredDocument],
    ) -> Result<TransformSummary, PipelineError> {
        let batch_id = Uuid::new_v4();
        info!(%batch_id, documents = documents.len(), "transforming documents");

        let mut transformed = 0;
        let mut skipped = 0;
        for (index, doc) in documents.iter().enumerate() {
            let source: SourceRecord = match serde_json::from_value(doc.body.clone()) {
                Ok(source) => source,
                Err(e) => {
                    warn!(document_id = %doc.id, error = %e, "skipping document that is not a source record");
                    skipped += 1;
                    continue;
                }
            };
            debug!(id = %source.id, "transforming item");
            let record = TransformedRecord::from_source(
                &source,
                index + 1,
                batch_id,
                &self.location,
                Utc::now(),
            );
            self.store.upsert(&record).await?;
            transformed += 1;
        }

        info!(%batch_id, transformed, skipped, "transformed documents");
        Ok(TransformSummary {
            batch_id,
            transformed,
            skipped,
        })
    }

    /// Poll the feed once. `None` when there was nothing to do.
    pub async fn poll_once(&self) -> Result<Option<TransformSummary>, PipelineError> {
        let documents = self.feed.poll(self.batch_size).await?;
        if documents.is_empty() {
            return Ok(None);
        }
        let summary = self.process_batch(&documents).await?;
        self.feed.commit().await?;
        Ok(Some(summary))
    }

    /// Consume the feed until `shutdown` is notified.
    pub async fn run(&self, shutdown: Arc<Notify>) {
        info!(
            location = %self.location,
            batch_size = self.batch_size,
            "transform worker started"
        );
        loop {
            let idle = tokio::select! {
                _ = shutdown.notified() => break,
                polled = self.poll_once() => match polled {
                    Ok(summary) => summary.is_none(),
                    Err(e) => {
                        error!(error = %e, "transform batch failed, it will be redelivered");
                        true
                    }
                },
            };
            if idle {
                tokio::select! {
                    _ = shutdown.notified() => break,
                    _ = tokio::time::sleep(self.poll_interval) => {}
                }
            }
        }
        info!("transform worker stopped");
    }
}
