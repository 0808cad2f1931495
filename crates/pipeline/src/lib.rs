pub mod error;
pub mod fetcher;
pub mod lease;
pub mod orchestrator;
pub mod recorder;
pub mod transform;
pub mod trigger;

pub use error::{PipelineError, Stage};
pub use fetcher::{FetchError, HttpSourceFetcher, SourceFetcher};
pub use lease::{Acquisition, LeaseManager, LeaseRelease};
pub use orchestrator::{Orchestrator, RunOutcome};
pub use recorder::RunRecorder;
pub use transform::{TransformSummary, TransformWorker};
pub use trigger::{fire, ScheduleTrigger, TimerTick};
