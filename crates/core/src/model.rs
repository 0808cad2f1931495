//! Documents persisted by the pipeline.
//!
//! All types serialize as camelCase JSON with the identity field named `id`,
//! which is the shape the document store and the external source exchange.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use uuid::Uuid;

/// Fixed identity (and partition) key of the singleton lease document.
pub const LEASE_ID: &str = "OrchestrationLeaseId";

/// Partition used for source records that arrive without one.
pub const DEFAULT_PARTITION: &str = "_default";

// ── Lease ─────────────────────────────────────────────────────

/// The singleton lease that grants one orchestration run exclusive access.
///
/// The version token is not part of the document body; the store hands it
/// back alongside the lease on every read and write.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Lease {
    pub id: String,
    #[serde(default)]
    pub locked: bool,
    #[serde(default)]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub end_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub lease_timeout: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_lease_timed_out: bool,
    #[serde(default)]
    pub worker: String,
}

impl Default for Lease {
    fn default() -> Self {
        Self {
            id: LEASE_ID.to_string(),
            locked: false,
            start_time: None,
            end_time: None,
            lease_timeout: None,
            last_lease_timed_out: false,
            worker: String::new(),
        }
    }
}

impl Lease {
    /// A held lease whose deadline has passed (or was never set).
    pub fn is_stale(&self, now: DateTime<Utc>) -> bool {
        self.locked && self.lease_timeout.map_or(true, |deadline| now > deadline)
    }

    /// Whether a new holder may take the lease at `now`.
    pub fn is_available(&self, now: DateTime<Utc>) -> bool {
        !self.locked || self.is_stale(now)
    }

    /// Take the lease for `worker` until `now + duration`.
    ///
    /// Taking a stale lease closes the abandoned period and marks the
    /// takeover so the audit record can report it.
    pub fn take(&mut self, worker: &str, now: DateTime<Utc>, duration: Duration) {
        if self.is_stale(now) {
            self.last_lease_timed_out = true;
            self.end_time = Some(now);
        }
        self.locked = true;
        self.worker = worker.to_string();
        self.start_time = Some(now);
        self.lease_timeout = Some(now + duration);
    }

    /// Release a held lease. Returns the takeover flag observed before it
    /// was cleared, or `None` if the lease was not held.
    pub fn free(&mut self, now: DateTime<Utc>) -> Option<bool> {
        if !self.locked {
            return None;
        }
        let forced = self.last_lease_timed_out;
        self.locked = false;
        self.end_time = Some(now);
        self.last_lease_timed_out = false;
        Some(forced)
    }
}

// ── Orchestration run (audit) ─────────────────────────────────

/// Append-only audit entry, one per completed orchestration attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrchestrationRun {
    pub id: Uuid,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    /// Length of the holding period in seconds.
    pub duration: f64,
    pub forced_lease: bool,
    pub succeeded: bool,
    pub worker: String,
    pub additional_info: String,
}

impl OrchestrationRun {
    pub fn new(
        start_time: Option<DateTime<Utc>>,
        end_time: Option<DateTime<Utc>>,
        forced_lease: bool,
        succeeded: bool,
        worker: impl Into<String>,
        additional_info: impl Into<String>,
    ) -> Self {
        let duration = match (start_time, end_time) {
            (Some(start), Some(end)) => (end - start).num_milliseconds() as f64 / 1000.0,
            _ => 0.0,
        };
        Self {
            id: Uuid::new_v4(),
            start_time,
            end_time,
            duration,
            forced_lease,
            succeeded,
            worker: worker.into(),
            additional_info: additional_info.into(),
        }
    }
}

// ── Source record ─────────────────────────────────────────────

/// One item of the batch returned by the external source.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceRecord {
    #[serde(default, deserialize_with = "nullable")]
    pub id: Uuid,
    #[serde(default, deserialize_with = "nullable")]
    pub date: String,
    #[serde(default, deserialize_with = "nullable")]
    pub desc: String,
    #[serde(default, deserialize_with = "nullable")]
    pub done: String,
    #[serde(default, deserialize_with = "nullable")]
    pub name: String,
    #[serde(default, deserialize_with = "nullable")]
    pub pr: String,
    #[serde(default, deserialize_with = "nullable")]
    pub logical_partition: String,
}

/// Source payloads may carry explicit nulls for any field.
fn nullable<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

impl SourceRecord {
    pub fn partition_key(&self) -> &str {
        if self.logical_partition.trim().is_empty() {
            DEFAULT_PARTITION
        } else {
            &self.logical_partition
        }
    }
}

// ── Transformed record ────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransformedRecord {
    pub id: Uuid,
    pub source_date: String,
    #[serde(rename = "transformTimeStamp")]
    pub transform_timestamp: DateTime<Utc>,
    pub description: String,
    pub done: String,
    pub name: String,
    pub pr: String,
    pub additional_data: String,
    pub transform_batch: Uuid,
    pub update_location: String,
}

impl TransformedRecord {
    /// Derive the enriched form of `source`.
    ///
    /// `position` is the 1-based index of the record within its batch.
    pub fn from_source(
        source: &SourceRecord,
        position: usize,
        batch: Uuid,
        location: &str,
        at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: source.id,
            source_date: source.date.clone(),
            transform_timestamp: at,
            description: or_placeholder(&source.desc, "Description", source.id),
            done: source.done.clone(),
            name: or_placeholder(&source.name, "Name", source.id),
            pr: source.pr.clone(),
            additional_data: format!("Data added from transform function [{position}]"),
            transform_batch: batch,
            update_location: location.to_string(),
        }
    }
}

fn or_placeholder(value: &str, field: &str, id: Uuid) -> String {
    if value.trim().is_empty() {
        format!("Empty {field} in source for item {id}")
    } else {
        value.to_string()
    }
}
