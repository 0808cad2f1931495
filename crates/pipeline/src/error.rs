use std::fmt;

use thiserror::Error;

use etl_core::EtlError;
use etl_store::StoreError;

use crate::fetcher::FetchError;

/// Orchestration state machine.
///
/// `Idle → LeaseRequested → LeaseDenied → Idle`, or
/// `Idle → LeaseRequested → LeaseGranted → Extracting → Saving → Releasing → Idle`.
/// A failure while extracting or saving jumps straight to `Releasing`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Idle,
    LeaseRequested,
    LeaseDenied,
    LeaseGranted,
    Extracting,
    Saving,
    Releasing,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Idle => "idle",
            Stage::LeaseRequested => "lease_requested",
            Stage::LeaseDenied => "lease_denied",
            Stage::LeaseGranted => "lease_granted",
            Stage::Extracting => "extracting",
            Stage::Saving => "saving",
            Stage::Releasing => "releasing",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("{stage} failed: {source}")]
    Stage {
        stage: Stage,
        #[source]
        source: StoreError,
    },

    #[error("source error: {0}")]
    Fetch(#[from] FetchError),

    #[error("invalid lease settings: {0}")]
    Config(#[from] EtlError),

    #[error("lease document {0} does not exist")]
    LeaseMissing(String),

    /// The lease changed between our read and our release write. Only a
    /// forced takeover by another holder can cause this, which means the
    /// lease duration is shorter than the run actually took.
    #[error("lease held by {holder:?} was modified by another process during release")]
    ReleaseConflict { holder: String },
}
