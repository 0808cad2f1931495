//! Cron-driven orchestration trigger.
//!
//! Sleeps until the next fire time of the configured schedule, then spawns
//! an orchestration attempt as its own task so a slow run never delays the
//! next tick. Overlapping attempts are harmless: the lease lets at most one
//! of them do any work.
//!
//! On shutdown no new attempts start, and attempts already running get a
//! grace period to release the lease and record themselves.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use cron::Schedule;
use tokio::sync::Notify;
use tokio::task::JoinSet;
use tracing::{error, info, warn};

use etl_core::schedule::parse_cron;
use etl_core::EtlError;

use crate::orchestrator::{Orchestrator, RunOutcome};

/// How late a tick may fire before it is reported as past due.
const PAST_DUE_TOLERANCE: Duration = Duration::from_secs(1);

const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerTick {
    pub scheduled_at: DateTime<Utc>,
    pub fired_at: DateTime<Utc>,
    pub past_due: bool,
}

impl TimerTick {
    pub fn new(scheduled_at: DateTime<Utc>, fired_at: DateTime<Utc>) -> Self {
        let late = (fired_at - scheduled_at).to_std().unwrap_or(Duration::ZERO);
        Self {
            scheduled_at,
            fired_at,
            past_due: late > PAST_DUE_TOLERANCE,
        }
    }
}

pub struct ScheduleTrigger {
    expr: String,
    schedule: Schedule,
    shutdown_grace: Duration,
}

impl ScheduleTrigger {
    pub fn new(expr: &str) -> Result<Self, EtlError> {
        Ok(Self {
            expr: expr.to_string(),
            schedule: parse_cron(expr)?,
            shutdown_grace: DEFAULT_SHUTDOWN_GRACE,
        })
    }

    /// How long [`run`](Self::run) waits for in-flight attempts after
    /// shutdown is signalled.
    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }

    /// First fire time strictly after `after`.
    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.schedule.after(&after).next()
    }

    /// Fire `orchestrator` on every tick until `shutdown` is notified.
    ///
    /// Ticks missed while the process was stalled are not replayed; the
    /// next one fires immediately and is flagged past due. Returns once every
    /// attempt started here has finished, or the shutdown grace ran out.
    pub async fn run(&self, orchestrator: Arc<Orchestrator>, shutdown: Arc<Notify>) {
        info!(schedule = %self.expr, "orchestration trigger started");
        let mut runs = JoinSet::new();
        let mut last = Utc::now();
        loop {
            let Some(next) = self.next_after(last) else {
                warn!(schedule = %self.expr, "schedule has no upcoming fire times");
                break;
            };
            let wait = (next - Utc::now()).to_std().unwrap_or(Duration::ZERO);
            tokio::select! {
                _ = shutdown.notified() => break,
                _ = tokio::time::sleep(wait) => {}
            }
            while let Some(joined) = runs.try_join_next() {
                log_join(joined);
            }

            let tick = TimerTick::new(next, Utc::now());
            last = next.max(tick.fired_at);
            let orchestrator = Arc::clone(&orchestrator);
            runs.spawn(async move { fire(&orchestrator, tick).await });
        }

        self.drain(&mut runs).await;
        info!("orchestration trigger stopped");
    }

    async fn drain(&self, runs: &mut JoinSet<()>) {
        if runs.is_empty() {
            return;
        }
        info!(in_flight = runs.len(), "waiting for running orchestrations");
        let finished = tokio::time::timeout(self.shutdown_grace, async {
            while let Some(joined) = runs.join_next().await {
                log_join(joined);
            }
        })
        .await;
        if finished.is_err() {
            warn!(
                in_flight = runs.len(),
                grace_secs = self.shutdown_grace.as_secs(),
                "orchestrations still running after shutdown grace, abandoning them"
            );
            runs.abort_all();
        }
    }
}

fn log_join(joined: Result<(), tokio::task::JoinError>) {
    if let Err(e) = joined {
        error!(error = %e, "orchestration task panicked or was cancelled");
    }
}

/// Run one orchestration attempt for `tick`, logging how it ended.
pub async fn fire(orchestrator: &Orchestrator, tick: TimerTick) {
    if tick.past_due {
        warn!(scheduled_at = %tick.scheduled_at, "timer is running late");
    }
    info!(fired_at = %tick.fired_at, "starting orchestration");

    match orchestrator.run().await {
        Ok(RunOutcome::Skipped(_)) => info!("orchestration skipped"),
        Ok(RunOutcome::Completed { saved, run }) => {
            info!(saved, run_id = %run.id, "orchestration completed")
        }
        Ok(RunOutcome::SourceUnavailable { reason, run }) => {
            warn!(%reason, run_id = %run.id, "orchestration finished without source data")
        }
        Err(e) => error!(error = %e, "orchestration failed"),
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use chrono::TimeZone;
    use etl_core::{Lease, OrchestrationRun, SourceRecord, LEASE_ID};
    use etl_store::{MemoryStore, RecordStore, StoredRecord};

    use super::*;
    use crate::fetcher::{FetchError, SourceFetcher};
    use crate::lease::LeaseManager;

    /// Source that takes a while to answer with one record.
    struct SlowSource(Duration);

    #[async_trait]
    impl SourceFetcher for SlowSource {
        async fn fetch(&self) -> Result<Vec<SourceRecord>, FetchError> {
            tokio::time::sleep(self.0).await;
            Ok(vec![SourceRecord {
                name: "slow".into(),
                ..SourceRecord::default()
            }])
        }
    }

    fn slow_orchestrator(memory: &Arc<MemoryStore>, delay: Duration) -> Arc<Orchestrator> {
        let store = RecordStore::new(memory.clone());
        let lease = LeaseManager::new(store.clone(), "westeurope", Duration::from_secs(300)).unwrap();
        Arc::new(Orchestrator::new(store, Arc::new(SlowSource(delay)), lease))
    }

    async fn lease_locked(memory: &Arc<MemoryStore>) -> bool {
        RecordStore::new(memory.clone())
            .read::<Lease>(LEASE_ID, LEASE_ID)
            .await
            .unwrap()
            .is_some_and(|l| l.value.locked)
    }

    fn at(h: u32, m: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, h, m, s).unwrap()
    }

    #[test]
    fn on_time_tick_is_not_past_due() {
        let tick = TimerTick::new(at(10, 0, 0), at(10, 0, 1));
        assert!(!tick.past_due);
    }

    #[test]
    fn late_tick_is_past_due() {
        let tick = TimerTick::new(at(10, 0, 0), at(10, 0, 5));
        assert!(tick.past_due);
    }

    #[test]
    fn early_wakeup_is_not_past_due() {
        let tick = TimerTick::new(at(10, 0, 1), at(10, 0, 0));
        assert!(!tick.past_due);
    }

    #[test]
    fn default_schedule_fires_every_two_minutes() {
        let trigger = ScheduleTrigger::new("0 */2 * * * *").unwrap();
        assert_eq!(trigger.next_after(at(10, 0, 0)), Some(at(10, 2, 0)));
        assert_eq!(trigger.next_after(at(10, 1, 30)), Some(at(10, 2, 0)));
    }

    #[test]
    fn five_field_expression_is_accepted() {
        let trigger = ScheduleTrigger::new("*/5 * * * *").unwrap();
        assert_eq!(trigger.next_after(at(10, 3, 0)), Some(at(10, 5, 0)));
    }

    #[test]
    fn invalid_expression_is_rejected() {
        assert!(ScheduleTrigger::new("every tuesday").is_err());
    }

    #[tokio::test]
    async fn shutdown_waits_for_the_running_orchestration() {
        let memory = Arc::new(MemoryStore::new());
        let orchestrator = slow_orchestrator(&memory, Duration::from_millis(1500));
        let trigger = Arc::new(
            ScheduleTrigger::new("* * * * * *")
                .unwrap()
                .with_shutdown_grace(Duration::from_secs(10)),
        );
        let shutdown = Arc::new(Notify::new());

        let handle = tokio::spawn({
            let trigger = Arc::clone(&trigger);
            let shutdown = Arc::clone(&shutdown);
            async move { trigger.run(orchestrator, shutdown).await }
        });

        tokio::time::timeout(Duration::from_secs(5), async {
            while !lease_locked(&memory).await {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
        shutdown.notify_one();
        tokio::time::timeout(Duration::from_secs(10), handle)
            .await
            .unwrap()
            .unwrap();

        assert!(!lease_locked(&memory).await);
        assert_eq!(memory.count(OrchestrationRun::COLLECTION), 1);
        assert_eq!(memory.count(SourceRecord::COLLECTION), 1);
    }

    #[tokio::test]
    async fn shutdown_grace_bounds_the_wait() {
        let memory = Arc::new(MemoryStore::new());
        let orchestrator = slow_orchestrator(&memory, Duration::from_secs(30));
        let trigger = Arc::new(
            ScheduleTrigger::new("* * * * * *")
                .unwrap()
                .with_shutdown_grace(Duration::from_millis(200)),
        );
        let shutdown = Arc::new(Notify::new());

        let handle = tokio::spawn({
            let trigger = Arc::clone(&trigger);
            let shutdown = Arc::clone(&shutdown);
            async move { trigger.run(orchestrator, shutdown).await }
        });

        tokio::time::timeout(Duration::from_secs(5), async {
            while !lease_locked(&memory).await {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
        shutdown.notify_one();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();

        assert_eq!(memory.count(OrchestrationRun::COLLECTION), 0);
    }
}
