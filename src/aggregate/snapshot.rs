use chrono::{DateTime, Utc};

use crate::target::{EventId, TargetKey};

/// Point-in-time counters for one monitored identifier.
#[derive(Debug, Clone, PartialEq)]
pub struct EventSnapshot {
    pub id: EventId,
    pub count: u64,
    pub description: Option<String>,
    /// Generation times in detection order.
    pub timestamps: Vec<DateTime<Utc>>,
}

/// Immutable copy of a target's aggregated state.
///
/// Produced under the state lock, so counts, timestamps and totals always
/// agree with each other.
#[derive(Debug, Clone, PartialEq)]
pub struct TargetSnapshot {
    pub key: TargetKey,
    pub initial_start: DateTime<Utc>,
    pub latest_start: DateTime<Utc>,
    pub total_processed: u64,
    pub failure_count: u64,
    pub last_error: Option<String>,
    /// One entry per monitored identifier, in configuration order.
    pub events: Vec<EventSnapshot>,
}

impl TargetSnapshot {
    /// Count recorded for `id`; zero for identifiers never seen or not monitored.
    pub fn count(&self, id: EventId) -> u64 {
        self.event(id).map_or(0, |e| e.count)
    }

    pub fn event(&self, id: EventId) -> Option<&EventSnapshot> {
        self.events.iter().find(|e| e.id == id)
    }

    /// Sum of per-identifier counts.
    pub fn counted(&self) -> u64 {
        self.events.iter().map(|e| e.count).sum()
    }
}
