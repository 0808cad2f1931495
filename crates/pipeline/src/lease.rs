//! Singleton distributed lease.
//!
//! One document (`LEASE_ID` in the `orchestrationLease` collection) decides
//! which worker may run an orchestration. Every state change is a
//! compare-and-swap against the version observed on read, so of several
//! concurrent contenders exactly one write lands. Losers are told so and do
//! not retry within the same trigger.

use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, error, info, warn};

use etl_core::schedule::lease_duration;
use etl_core::{Lease, LEASE_ID};
use etl_store::{ConditionalWrite, RecordStore, Versioned};

use crate::error::PipelineError;

/// Result of one acquisition attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Acquisition {
    /// This worker now holds the lease. `takeover` is set when a stale
    /// holder was evicted.
    Granted { takeover: bool },
    /// Another holder's lease is still valid.
    Held {
        worker: String,
        until: Option<DateTime<Utc>>,
    },
    /// The lease looked free but another contender's write landed first.
    LostRace,
}

impl Acquisition {
    pub fn is_granted(&self) -> bool {
        matches!(self, Acquisition::Granted { .. })
    }

    pub fn is_takeover(&self) -> bool {
        matches!(self, Acquisition::Granted { takeover: true })
    }
}

/// Lease fields captured at release, used for the run audit entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaseRelease {
    /// False when the lease was not held and nothing was written.
    pub released: bool,
    pub forced: bool,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub worker: String,
}

impl LeaseRelease {
    fn from_lease(lease: &Lease, released: bool, forced: bool) -> Self {
        Self {
            released,
            forced,
            start_time: lease.start_time,
            end_time: lease.end_time,
            worker: lease.worker.clone(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct LeaseManager {
    store: RecordStore,
    worker: String,
    duration: chrono::Duration,
}

impl LeaseManager {
    /// Fails when `timeout` is zero or longer than
    /// [`etl_core::schedule::MAX_LEASE_DURATION`].
    pub fn new(
        store: RecordStore,
        worker: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, PipelineError> {
        Ok(Self {
            store,
            worker: worker.into(),
            duration: lease_duration(timeout)?,
        })
    }

    pub fn worker(&self) -> &str {
        &self.worker
    }

    pub fn duration(&self) -> chrono::Duration {
        self.duration
    }

    pub async fn acquire(&self) -> Result<Acquisition, PipelineError> {
        self.acquire_at(Utc::now()).await
    }

    /// Try to take the lease as of `now`.
    ///
    /// A missing lease document is created by this write (create-if-absent),
    /// so the very first acquisition is also race-free.
    pub async fn acquire_at(&self, now: DateTime<Utc>) -> Result<Acquisition, PipelineError> {
        let (mut lease, version) = match self.store.read::<Lease>(LEASE_ID, LEASE_ID).await? {
            Some(Versioned { value, version }) => (value, Some(version)),
            None => {
                info!("lease document does not exist yet, creating it");
                (Lease::default(), None)
            }
        };

        if !lease.is_available(now) {
            debug!(
                holder = %lease.worker,
                until = ?lease.lease_timeout,
                "lease is held and still valid"
            );
            return Ok(Acquisition::Held {
                worker: lease.worker,
                until: lease.lease_timeout,
            });
        }

        let takeover = lease.is_stale(now);
        if takeover {
            warn!(
                previous_holder = %lease.worker,
                expired_at = ?lease.lease_timeout,
                "previous lease timed out, taking it over"
            );
        }
        lease.take(&self.worker, now, self.duration);

        match self.store.write_if_match(&lease, version.as_ref()).await {
            Ok(ConditionalWrite::Written(_)) => {
                info!(
                    worker = %self.worker,
                    until = ?lease.lease_timeout,
                    takeover,
                    "lease acquired"
                );
                Ok(Acquisition::Granted { takeover })
            }
            Ok(ConditionalWrite::VersionConflict) => {
                info!(worker = %self.worker, "lease taken by another contender first");
                Ok(Acquisition::LostRace)
            }
            Err(e) => {
                error!(error = %e, "failed to write lease");
                Err(e.into())
            }
        }
    }

    pub async fn release(&self) -> Result<LeaseRelease, PipelineError> {
        self.release_at(Utc::now()).await
    }

    /// Unlock the lease as of `now`.
    ///
    /// Releasing a lease that is not held writes nothing and reports the
    /// lease's existing fields with `released == false`.
    pub async fn release_at(&self, now: DateTime<Utc>) -> Result<LeaseRelease, PipelineError> {
        let Some(Versioned { value: mut lease, version }) =
            self.store.read::<Lease>(LEASE_ID, LEASE_ID).await?
        else {
            error!("lease document is missing at release");
            return Err(PipelineError::LeaseMissing(LEASE_ID.to_string()));
        };

        let Some(forced) = lease.free(now) else {
            warn!(holder = %lease.worker, "lease is not held, nothing to release");
            let forced = lease.last_lease_timed_out;
            return Ok(LeaseRelease::from_lease(&lease, false, forced));
        };

        match self.store.write_if_match(&lease, Some(&version)).await? {
            ConditionalWrite::Written(_) => {
                info!(worker = %lease.worker, forced, "lease released");
                Ok(LeaseRelease::from_lease(&lease, true, forced))
            }
            ConditionalWrite::VersionConflict => {
                error!(holder = %lease.worker, "lease changed underneath us during release");
                Err(PipelineError::ReleaseConflict {
                    holder: lease.worker,
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::TimeZone;
    use etl_core::EtlError;
    use etl_store::MemoryStore;

    use super::*;

    fn manager(worker: &str) -> (LeaseManager, RecordStore) {
        let store = RecordStore::new(Arc::new(MemoryStore::new()));
        let lease = LeaseManager::new(store.clone(), worker, Duration::from_secs(300)).unwrap();
        (lease, store)
    }

    fn at(h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, h, m, 0).unwrap()
    }

    async fn stored(store: &RecordStore) -> Lease {
        store
            .read::<Lease>(LEASE_ID, LEASE_ID)
            .await
            .unwrap()
            .unwrap()
            .value
    }

    #[tokio::test]
    async fn first_acquire_creates_the_lease() {
        let (lease, store) = manager("west");
        let got = lease.acquire_at(at(10, 0)).await.unwrap();
        assert_eq!(got, Acquisition::Granted { takeover: false });

        let doc = stored(&store).await;
        assert!(doc.locked);
        assert_eq!(doc.worker, "west");
        assert_eq!(doc.start_time, Some(at(10, 0)));
        assert_eq!(doc.lease_timeout, Some(at(10, 5)));
        assert!(!doc.last_lease_timed_out);
    }

    #[tokio::test]
    async fn valid_lease_is_not_taken() {
        let (first, store) = manager("west");
        first.acquire_at(at(10, 0)).await.unwrap();

        let second = LeaseManager::new(store.clone(), "east", Duration::from_secs(300)).unwrap();
        let got = second.acquire_at(at(10, 4)).await.unwrap();
        assert_eq!(
            got,
            Acquisition::Held {
                worker: "west".into(),
                until: Some(at(10, 5)),
            }
        );
        assert_eq!(stored(&store).await.worker, "west");
    }

    #[tokio::test]
    async fn stale_lease_is_taken_over_and_flag_cleared_on_release() {
        let (first, store) = manager("west");
        first.acquire_at(at(10, 0)).await.unwrap();

        let second = LeaseManager::new(store.clone(), "east", Duration::from_secs(300)).unwrap();
        let got = second.acquire_at(at(10, 6)).await.unwrap();
        assert!(got.is_takeover());

        let doc = stored(&store).await;
        assert!(doc.last_lease_timed_out);
        assert_eq!(doc.worker, "east");
        assert_eq!(doc.end_time, Some(at(10, 6)));

        let released = second.release_at(at(10, 7)).await.unwrap();
        assert!(released.released);
        assert!(released.forced);
        assert_eq!(released.start_time, Some(at(10, 6)));
        assert_eq!(released.end_time, Some(at(10, 7)));

        let doc = stored(&store).await;
        assert!(!doc.locked);
        assert!(!doc.last_lease_timed_out);
    }

    #[tokio::test]
    async fn release_of_unlocked_lease_writes_nothing() {
        let (lease, store) = manager("west");
        lease.acquire_at(at(10, 0)).await.unwrap();
        lease.release_at(at(10, 1)).await.unwrap();
        let before = store.read::<Lease>(LEASE_ID, LEASE_ID).await.unwrap().unwrap();

        let again = lease.release_at(at(10, 2)).await.unwrap();
        assert!(!again.released);
        assert_eq!(again.end_time, Some(at(10, 1)));

        let after = store.read::<Lease>(LEASE_ID, LEASE_ID).await.unwrap().unwrap();
        assert_eq!(after.version, before.version);
        assert_eq!(after.value.end_time, Some(at(10, 1)));
    }

    #[tokio::test]
    async fn release_without_lease_document_fails() {
        let (lease, _) = manager("west");
        let err = lease.release_at(at(10, 0)).await.unwrap_err();
        assert!(matches!(err, PipelineError::LeaseMissing(_)));
    }

    #[test]
    fn out_of_range_timeout_is_rejected() {
        let store = RecordStore::new(Arc::new(MemoryStore::new()));
        let err = LeaseManager::new(store.clone(), "west", Duration::from_secs(u64::MAX)).unwrap_err();
        assert!(matches!(err, PipelineError::Config(EtlError::LeaseTimeout(_))));
        assert!(LeaseManager::new(store, "west", Duration::ZERO).is_err());
    }

    #[tokio::test]
    async fn lease_at_exact_deadline_is_still_held() {
        let (first, store) = manager("west");
        first.acquire_at(at(10, 0)).await.unwrap();
        let second = LeaseManager::new(store, "east", Duration::from_secs(300)).unwrap();
        let got = second.acquire_at(at(10, 5)).await.unwrap();
        assert!(matches!(got, Acquisition::Held { .. }));
    }
}
