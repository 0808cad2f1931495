use tracing::info;

use etl_core::OrchestrationRun;
use etl_store::RecordStore;

use crate::error::PipelineError;
use crate::lease::LeaseRelease;

/// Appends one audit entry per orchestration attempt.
#[derive(Debug, Clone)]
pub struct RunRecorder {
    store: RecordStore,
}

impl RunRecorder {
    pub fn new(store: RecordStore) -> Self {
        Self { store }
    }

    pub async fn record(
        &self,
        release: &LeaseRelease,
        succeeded: bool,
        additional_info: &str,
    ) -> Result<OrchestrationRun, PipelineError> {
        let run = OrchestrationRun::new(
            release.start_time,
            release.end_time,
            release.forced,
            succeeded,
            release.worker.clone(),
            additional_info,
        );
        self.store.insert(&run).await?;
        info!(
            run_id = %run.id,
            worker = %run.worker,
            succeeded,
            forced_lease = run.forced_lease,
            duration_secs = run.duration,
            "orchestration run recorded"
        );
        Ok(run)
    }
}
