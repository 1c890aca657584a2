pub mod snapshot;

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;

use crate::source::EventRecord;
use crate::target::{EventId, MonitorTarget};

pub use self::snapshot::{EventSnapshot, TargetSnapshot};

/// Mutable counters guarded by a single lock.
///
/// Every update touches count, timestamp list and total together, so a
/// reader holding the lock can never see one without the others.
#[derive(Debug)]
struct Counters {
    occurrences: HashMap<EventId, u64>,
    timestamps: HashMap<EventId, Vec<DateTime<Utc>>>,
    total_processed: u64,
    latest_start: DateTime<Utc>,
    failure_count: u64,
    last_error: Option<String>,
}

/// Accumulated statistics for one target's whole lineage of workers.
///
/// Exactly one worker writes at a time; the supervisor moves the `Arc` from
/// a dead worker to its replacement, so counters survive every respawn.
#[derive(Debug)]
pub struct AggregatedState {
    target: Arc<MonitorTarget>,
    initial_start: DateTime<Utc>,
    counters: Mutex<Counters>,
}

impl AggregatedState {
    /// Creates empty state for a target whose first execution starts at `now`.
    pub fn new(target: Arc<MonitorTarget>, now: DateTime<Utc>) -> Self {
        let capacity = target.event_ids().len();
        Self {
            target,
            initial_start: now,
            counters: Mutex::new(Counters {
                occurrences: HashMap::with_capacity(capacity),
                timestamps: HashMap::with_capacity(capacity),
                total_processed: 0,
                latest_start: now,
                failure_count: 0,
                last_error: None,
            }),
        }
    }

    pub fn target(&self) -> &Arc<MonitorTarget> {
        &self.target
    }

    pub fn initial_start(&self) -> DateTime<Utc> {
        self.initial_start
    }

    /// Start time of the current (or most recent) execution.
    pub fn latest_start(&self) -> DateTime<Utc> {
        self.counters.lock().latest_start
    }

    /// Returns true if `record` is monitored and was generated strictly
    /// after the current execution started.
    pub fn accepts(&self, record: &EventRecord) -> bool {
        self.target.monitors(record.id) && record.generated_at > self.latest_start()
    }

    /// Counts one occurrence of `id` generated at `generated_at`.
    ///
    /// Only the owning worker calls this. Returns false, without touching
    /// any counter, if `id` is not monitored.
    pub fn record(&self, id: EventId, generated_at: DateTime<Utc>) -> bool {
        if !self.target.monitors(id) {
            return false;
        }

        let mut counters = self.counters.lock();
        *counters.occurrences.entry(id).or_insert(0) += 1;
        counters.timestamps.entry(id).or_default().push(generated_at);
        counters.total_processed += 1;
        true
    }

    /// Marks the start of a new execution and returns its start time.
    ///
    /// The returned time is strictly later than the previous execution's,
    /// even if the wall clock stalled or stepped backwards.
    pub fn begin_execution(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        let mut counters = self.counters.lock();
        let floor = counters.latest_start + Duration::microseconds(1);
        counters.latest_start = now.max(floor);
        counters.latest_start
    }

    /// Records one worker death and the reason for it.
    pub fn record_failure(&self, reason: impl Into<String>) {
        let mut counters = self.counters.lock();
        counters.failure_count += 1;
        counters.last_error = Some(reason.into());
    }

    pub fn failure_count(&self) -> u64 {
        self.counters.lock().failure_count
    }

    /// Takes an atomic copy of all counters.
    pub fn snapshot(&self) -> TargetSnapshot {
        let counters = self.counters.lock();

        let events = self
            .target
            .event_ids()
            .iter()
            .map(|&id| EventSnapshot {
                id,
                count: counters.occurrences.get(&id).copied().unwrap_or(0),
                description: self.target.description(id).map(str::to_owned),
                timestamps: counters.timestamps.get(&id).cloned().unwrap_or_default(),
            })
            .collect();

        TargetSnapshot {
            key: self.target.key().clone(),
            initial_start: self.initial_start,
            latest_start: counters.latest_start,
            total_processed: counters.total_processed,
            failure_count: counters.failure_count,
            last_error: counters.last_error.clone(),
            events,
        }
    }
}
