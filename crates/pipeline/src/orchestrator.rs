//! One orchestration attempt: lease → extract → save → release.
//!
//! Once the lease is granted, release always runs, whatever happened in
//! between, and every release appends a run audit entry.

use std::sync::Arc;

use tracing::{debug, error, info, warn};
use uuid::Uuid;

use etl_core::config::Config;
use etl_core::{OrchestrationRun, SourceRecord};
use etl_store::RecordStore;

use crate::error::{PipelineError, Stage};
use crate::fetcher::{FetchError, HttpSourceFetcher, SourceFetcher};
use crate::lease::{Acquisition, LeaseManager};
use crate::recorder::RunRecorder;

/// How an orchestration attempt ended.
#[derive(Debug, Clone, PartialEq)]
pub enum RunOutcome {
    /// Another worker holds the lease; nothing was written.
    Skipped(Acquisition),
    /// Records were extracted and saved (possibly zero of them).
    Completed { saved: usize, run: OrchestrationRun },
    /// The source yielded no batch; the attempt is recorded as failed.
    SourceUnavailable { reason: String, run: OrchestrationRun },
}

impl RunOutcome {
    pub fn run(&self) -> Option<&OrchestrationRun> {
        match self {
            RunOutcome::Skipped(_) => None,
            RunOutcome::Completed { run, .. } | RunOutcome::SourceUnavailable { run, .. } => {
                Some(run)
            }
        }
    }
}

enum Extraction {
    Saved(usize),
    NoBatch(FetchError),
}

fn enter(stage: Stage) {
    debug!(%stage, "orchestration stage");
}

pub struct Orchestrator {
    lease: LeaseManager,
    fetcher: Arc<dyn SourceFetcher>,
    store: RecordStore,
    recorder: RunRecorder,
}

impl Orchestrator {
    pub fn new(store: RecordStore, fetcher: Arc<dyn SourceFetcher>, lease: LeaseManager) -> Self {
        Self {
            lease,
            fetcher,
            recorder: RunRecorder::new(store.clone()),
            store,
        }
    }

    /// Wire an orchestrator against the configured HTTP source.
    pub fn from_config(config: &Config, store: RecordStore) -> Result<Self, PipelineError> {
        let fetcher = HttpSourceFetcher::new(&config.source)?;
        let lease = LeaseManager::new(store.clone(), config.worker.location(), config.lease.timeout)?;
        Ok(Self::new(store, Arc::new(fetcher), lease))
    }

    pub fn lease(&self) -> &LeaseManager {
        &self.lease
    }

    pub async fn run(&self) -> Result<RunOutcome, PipelineError> {
        enter(Stage::LeaseRequested);
        let acquisition = self.lease.acquire().await?;
        if !acquisition.is_granted() {
            enter(Stage::LeaseDenied);
            info!(?acquisition, "orchestration lease already in place, skipping execution");
            enter(Stage::Idle);
            return Ok(RunOutcome::Skipped(acquisition));
        }
        enter(Stage::LeaseGranted);

        match self.extract_and_save().await {
            Ok(Extraction::Saved(saved)) => {
                let info = format!(
                    "Successfully extracted and saved {saved} documents. \
                     Documents will be processed automatically by the transform worker."
                );
                let run = self.release(true, &info).await?;
                Ok(RunOutcome::Completed { saved, run })
            }
            Ok(Extraction::NoBatch(e)) => {
                warn!(error = %e, "no batch retrieved from source");
                let reason = e.to_string();
                let info = format!("Unable to retrieve data from source: {reason}");
                let run = self.release(false, &info).await?;
                Ok(RunOutcome::SourceUnavailable { reason, run })
            }
            Err(e) => {
                error!(error = %e, "orchestration execution failed");
                let info = format!("There were errors while executing the orchestration: {e}");
                if let Err(release_err) = self.release(false, &info).await {
                    error!(error = %release_err, "failed to release lease after orchestration failure");
                }
                Err(e)
            }
        }
    }

    /// Release the lease and record the attempt.
    pub async fn release(
        &self,
        succeeded: bool,
        additional_info: &str,
    ) -> Result<OrchestrationRun, PipelineError> {
        enter(Stage::Releasing);
        let released = self.lease.release().await?;
        let run = self.recorder.record(&released, succeeded, additional_info).await?;
        enter(Stage::Idle);
        Ok(run)
    }

    async fn extract_and_save(&self) -> Result<Extraction, PipelineError> {
        enter(Stage::Extracting);
        let records = match self.fetcher.fetch().await {
            Ok(records) => records,
            Err(e) => return Ok(Extraction::NoBatch(e)),
        };
        enter(Stage::Saving);
        self.save(records).await.map(Extraction::Saved)
    }

    async fn save(&self, records: Vec<SourceRecord>) -> Result<usize, PipelineError> {
        info!(records = records.len(), "saving extracted records");
        let mut saved = 0;
        for mut record in records {
            record.id = Uuid::new_v4();
            debug!(id = %record.id, name = %record.name, "saving record");
            self.store
                .insert(&record)
                .await
                .map_err(|source| PipelineError::Stage {
                    stage: Stage::Saving,
                    source,
                })?;
            saved += 1;
        }
        info!(saved, "saved extracted records");
        Ok(saved)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::time::Duration;

    use async_trait::async_trait;
    use etl_core::{Lease, LEASE_ID};
    use etl_store::{MemoryStore, StoredRecord};

    use super::*;

    struct FixedSource(Mutex<Option<Result<Vec<SourceRecord>, FetchError>>>);

    impl FixedSource {
        fn new(result: Result<Vec<SourceRecord>, FetchError>) -> Arc<Self> {
            Arc::new(Self(Mutex::new(Some(result))))
        }
    }

    #[async_trait]
    impl SourceFetcher for FixedSource {
        async fn fetch(&self) -> Result<Vec<SourceRecord>, FetchError> {
            self.0.lock().unwrap().take().unwrap_or_else(|| Ok(Vec::new()))
        }
    }

    fn orchestrator(source: Arc<dyn SourceFetcher>) -> (Orchestrator, Arc<MemoryStore>) {
        let memory = Arc::new(MemoryStore::new());
        let store = RecordStore::new(memory.clone());
        let lease = LeaseManager::new(store.clone(), "west", Duration::from_secs(300)).unwrap();
        (Orchestrator::new(store, source, lease), memory)
    }

    fn record(name: &str) -> SourceRecord {
        SourceRecord {
            name: name.into(),
            logical_partition: "Partition_B".into(),
            ..SourceRecord::default()
        }
    }

    #[tokio::test]
    async fn saves_every_record_with_a_fresh_id() {
        let (orch, memory) = orchestrator(FixedSource::new(Ok(vec![record("a"), record("b")])));
        let outcome = orch.run().await.unwrap();

        let RunOutcome::Completed { saved, run } = outcome else {
            panic!("expected completion, got {outcome:?}");
        };
        assert_eq!(saved, 2);
        assert!(run.succeeded);
        assert!(run.additional_info.contains("saved 2 documents"));

        let docs = memory.documents(SourceRecord::COLLECTION);
        assert_eq!(docs.len(), 2);
        assert!(docs.iter().all(|d| d.id != Uuid::nil().to_string()));
        assert!(docs.iter().all(|d| d.partition == "Partition_B"));
    }

    #[tokio::test]
    async fn empty_batch_is_a_successful_run() {
        let (orch, memory) = orchestrator(FixedSource::new(Ok(Vec::new())));
        let outcome = orch.run().await.unwrap();
        assert!(matches!(outcome, RunOutcome::Completed { saved: 0, .. }));
        assert_eq!(memory.count(OrchestrationRun::COLLECTION), 1);
    }

    #[tokio::test]
    async fn source_failure_still_releases_and_records() {
        let err = FetchError::Status {
            url: "http://source.local".into(),
            status: 503,
        };
        let (orch, memory) = orchestrator(FixedSource::new(Err(err)));
        let outcome = orch.run().await.unwrap();

        let RunOutcome::SourceUnavailable { reason, run } = outcome else {
            panic!("expected source failure, got {outcome:?}");
        };
        assert!(reason.contains("503"));
        assert!(!run.succeeded);
        assert_eq!(memory.count(SourceRecord::COLLECTION), 0);

        let lease = orch
            .store
            .read::<Lease>(LEASE_ID, LEASE_ID)
            .await
            .unwrap()
            .unwrap();
        assert!(!lease.value.locked);
    }

    #[tokio::test]
    async fn run_twice_reacquires_released_lease() {
        let (orch, memory) = orchestrator(FixedSource::new(Ok(vec![record("a")])));
        orch.run().await.unwrap();
        let second = orch.run().await.unwrap();
        assert!(matches!(second, RunOutcome::Completed { saved: 0, .. }));
        assert_eq!(memory.count(OrchestrationRun::COLLECTION), 2);
    }
}
