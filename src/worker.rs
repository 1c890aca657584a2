use std::sync::Arc;

use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::aggregate::AggregatedState;
use crate::export::health::HealthMetrics;
use crate::source::{EventReader, EventSource, SourceError};

/// Result a worker task finishes with. Workers only ever finish by failing.
pub type WorkerOutcome = Result<(), SourceError>;

/// Spawns the poll loop for `state`'s target as its own task.
pub fn spawn<S: EventSource>(
    source: Arc<S>,
    state: Arc<AggregatedState>,
    health: Arc<HealthMetrics>,
) -> JoinHandle<WorkerOutcome> {
    tokio::spawn(async move { run(source.as_ref(), &state, &health).await })
}

/// Polls the target's event log and counts accepted records into `state`.
///
/// Runs until the source fails to open or read. The failure is recorded in
/// `state` before returning, so the supervisor only needs to notice that the
/// task has finished.
pub async fn run<S: EventSource>(
    source: &S,
    state: &AggregatedState,
    health: &HealthMetrics,
) -> WorkerOutcome {
    let target = Arc::clone(state.target());
    let started = state.latest_start();

    let mut reader = match source.open(&target).await {
        Ok(reader) => reader,
        Err(e) => {
            warn!(error = %e, "failed to open event log");
            state.record_failure(e.to_string());
            return Err(e);
        }
    };

    info!(
        host = target.host(),
        log = target.log_name(),
        since = %started,
        "worker started",
    );

    loop {
        let batch = match reader.read_next().await {
            Ok(batch) => batch,
            Err(e) => {
                warn!(error = %e, "failed to read event log");
                state.record_failure(e.to_string());
                return Err(e);
            }
        };

        for record in batch {
            if !state.accepts(&record) {
                health.records_ignored.inc();
                continue;
            }

            state.record(record.id, record.generated_at);
            health.records_accepted.inc();

            info!(
                host = target.host(),
                log = target.log_name(),
                event_id = record.id,
                description = target.description(record.id).unwrap_or("-"),
                generated_at = %record.generated_at,
                "event",
            );
        }
    }
}
