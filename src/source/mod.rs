pub mod file;

use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::target::{EventId, MonitorTarget, TargetKey};

/// One record read from an event log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventRecord {
    pub id: EventId,
    pub generated_at: DateTime<Utc>,
}

impl EventRecord {
    pub fn new(id: EventId, generated_at: DateTime<Utc>) -> Self {
        Self { id, generated_at }
    }
}

/// Failures at the event log boundary.
///
/// All of them are fatal for the current worker and recoverable for the
/// target: the supervisor respawns after the retry delay.
#[derive(Error, Debug)]
pub enum SourceError {
    #[error("opening {} log on {}: {reason}", .target.log_name, .target.host)]
    Open { target: TargetKey, reason: String },

    #[error("reading {} log on {}: {reason}", .target.log_name, .target.host)]
    Read { target: TargetKey, reason: String },

    #[error("{} log on {} closed", .target.log_name, .target.host)]
    Closed { target: TargetKey },
}

/// Opens event logs for reading.
pub trait EventSource: Send + Sync + 'static {
    type Reader: EventReader;

    /// Open the target's log, positioned after the newest existing record.
    fn open(
        &self,
        target: &MonitorTarget,
    ) -> impl std::future::Future<Output = Result<Self::Reader, SourceError>> + Send;
}

/// Forward-only, sequential reader over one event log.
pub trait EventReader: Send + 'static {
    /// Wait for and return the next batch of records. May return an empty
    /// batch when nothing new arrived within the source's poll window.
    fn read_next(
        &mut self,
    ) -> impl std::future::Future<Output = Result<Vec<EventRecord>, SourceError>> + Send;
}
