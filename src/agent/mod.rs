pub mod registry;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use chrono::Utc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::aggregate::{AggregatedState, TargetSnapshot};
use crate::config::Settings;
use crate::export::health::HealthMetrics;
use crate::export::{SnapshotExporter, TargetStatus};
use crate::source::EventSource;
use crate::target::{MonitorTarget, TargetKey};
use crate::worker;

use self::registry::{ActiveWorker, Ledger, PendingWorker, Registry};

/// Timing knobs of the control loop.
///
/// Respawn and export deadlines are only checked once per tick, so both
/// fire up to one `tick_interval` late.
#[derive(Debug, Clone, Copy)]
pub struct SupervisorSettings {
    pub tick_interval: Duration,
    pub retry_delay: Duration,
    pub export_interval: Duration,
}

impl From<&Settings> for SupervisorSettings {
    fn from(settings: &Settings) -> Self {
        Self {
            tick_interval: settings.tick_interval,
            retry_delay: settings.retry_delay,
            export_interval: settings.export_interval,
        }
    }
}

/// Owns one worker per target, respawns dead workers after the retry delay
/// and periodically exports every target's counters.
pub struct Supervisor<S: EventSource> {
    source: Arc<S>,
    settings: SupervisorSettings,
    registry: Registry,
    ledger: Ledger,
    exporter: SnapshotExporter,
    health: Arc<HealthMetrics>,
    last_export: Instant,
}

impl<S: EventSource> Supervisor<S> {
    /// Creates the aggregate for every target and spawns its first worker.
    ///
    /// Must be called from within a tokio runtime. Fails if two targets
    /// share an identity.
    pub fn start(
        targets: Vec<MonitorTarget>,
        source: Arc<S>,
        settings: SupervisorSettings,
        exporter: SnapshotExporter,
        health: Arc<HealthMetrics>,
    ) -> Result<Self> {
        let now = Utc::now();
        let mut registry = Registry::default();

        for target in targets {
            let key = target.key().clone();
            if registry.status(&key).is_some() {
                bail!("target {key} configured more than once");
            }

            let state = Arc::new(AggregatedState::new(Arc::new(target), now));
            let task = worker::spawn(Arc::clone(&source), Arc::clone(&state), Arc::clone(&health));
            registry.active.insert(key, ActiveWorker { state, task });
        }

        info!(
            targets = registry.active_len(),
            tick_interval = ?settings.tick_interval,
            retry_delay = ?settings.retry_delay,
            export_interval = ?settings.export_interval,
            output_dir = %exporter.output_dir().display(),
            "supervisor started",
        );

        let supervisor = Self {
            source,
            settings,
            registry,
            ledger: Ledger::default(),
            exporter,
            health,
            last_export: Instant::now(),
        };
        supervisor.publish();

        Ok(supervisor)
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn status(&self, key: &TargetKey) -> Option<TargetStatus> {
        self.registry.status(key)
    }

    pub fn snapshot(&self, key: &TargetKey) -> Option<TargetSnapshot> {
        self.registry.state(key).map(|s| s.snapshot())
    }

    /// Handle on the statuses published at the end of every tick.
    pub fn ledger(&self) -> Ledger {
        self.ledger.clone()
    }

    /// Runs the control loop until `shutdown` is cancelled, then writes a
    /// final snapshot of all targets.
    pub async fn run(mut self, shutdown: CancellationToken) -> Result<PathBuf> {
        let mut ticker = tokio::time::interval(self.settings.tick_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        // The first tick completes immediately.
        ticker.tick().await;

        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => self.tick(Instant::now()).await,
            }
        }

        self.shutdown().await
    }

    /// One pass of the control loop as of `now`.
    ///
    /// 1. Dead workers move to pending respawn at `now + retry_delay`.
    /// 2. Pending targets get their one-time failure notice; those whose
    ///    restart time has come get a fresh worker with the same aggregate.
    /// 3. If the export interval elapsed, all targets are exported.
    pub async fn tick(&mut self, now: Instant) {
        self.reap(now).await;
        self.respawn_due(now);
        self.publish();

        if now.saturating_duration_since(self.last_export) >= self.settings.export_interval {
            if let Err(e) = self.export().await {
                error!(error = %format!("{e:#}"), "periodic export failed, will retry next interval");
            }
            self.last_export = now;
        }
    }

    /// Writes the final snapshot. Workers are left running detached; their
    /// in-flight reads are not interrupted.
    pub async fn shutdown(self) -> Result<PathBuf> {
        info!(
            active = self.registry.active_len(),
            pending = self.registry.pending_len(),
            "supervisor stopping, writing final snapshot",
        );

        self.export().await
    }

    async fn reap(&mut self, now: Instant) {
        for key in self.registry.finished() {
            let Some(ActiveWorker { state, task }) = self.registry.active.remove(&key) else {
                continue;
            };

            // Workers record their own source failures; anything else ending
            // the task is recorded here so each death counts exactly once.
            match task.await {
                Ok(Err(_)) => {}
                Ok(Ok(())) => state.record_failure("worker exited unexpectedly"),
                Err(e) => state.record_failure(format!("worker task aborted: {e}")),
            }
            self.health.worker_failures.inc();

            self.registry.pending.insert(
                key,
                PendingWorker {
                    state,
                    restart_at: now + self.settings.retry_delay,
                    notice_emitted: false,
                },
            );
        }
    }

    fn respawn_due(&mut self, now: Instant) {
        for (key, pending) in self.registry.pending.iter_mut() {
            if pending.notice_emitted {
                continue;
            }
            let snap = pending.state.snapshot();
            warn!(
                worker = %key,
                failures = snap.failure_count,
                error = snap.last_error.as_deref().unwrap_or("-"),
                retry_in = ?self.settings.retry_delay,
                "worker failed, will attempt restart",
            );
            pending.notice_emitted = true;
        }

        for key in self.registry.due(now) {
            let Some(PendingWorker { state, .. }) = self.registry.pending.remove(&key) else {
                continue;
            };

            let started = state.begin_execution(Utc::now());
            info!(worker = %key, since = %started, "attempting restart");

            let task = worker::spawn(
                Arc::clone(&self.source),
                Arc::clone(&state),
                Arc::clone(&self.health),
            );
            self.health.worker_respawns.inc();
            self.registry.active.insert(key, ActiveWorker { state, task });
        }
    }

    async fn export(&self) -> Result<PathBuf> {
        export_counted(&self.exporter, &self.health, &self.registry.snapshots()).await
    }

    fn publish(&self) {
        self.ledger.publish(&self.registry);
        self.health
            .active_workers
            .set(self.registry.active_len() as f64);
        self.health
            .pending_respawns
            .set(self.registry.pending_len() as f64);
    }
}

/// Runs `supervisor` on its own task until `shutdown` is cancelled.
///
/// If the task dies instead of returning, every target's counters are
/// still exported with the status from the supervisor's last tick.
pub async fn run_guarded<S: EventSource>(
    supervisor: Supervisor<S>,
    shutdown: CancellationToken,
) -> Result<PathBuf> {
    let ledger = supervisor.ledger();
    let exporter = supervisor.exporter.clone();
    let health = Arc::clone(&supervisor.health);

    let task = tokio::spawn(supervisor.run(shutdown));
    recover(task, &ledger, &exporter, &health).await
}

async fn recover(
    task: JoinHandle<Result<PathBuf>>,
    ledger: &Ledger,
    exporter: &SnapshotExporter,
    health: &HealthMetrics,
) -> Result<PathBuf> {
    match task.await {
        Ok(result) => result,
        Err(e) => {
            error!(
                error = %e,
                targets = ledger.len(),
                "supervisor task died, exporting last known state",
            );
            export_counted(exporter, health, &ledger.snapshots()).await
        }
    }
}

async fn export_counted(
    exporter: &SnapshotExporter,
    health: &HealthMetrics,
    targets: &[(TargetStatus, TargetSnapshot)],
) -> Result<PathBuf> {
    let result = exporter.export(targets).await;
    match &result {
        Ok(_) => health.exports.inc(),
        Err(_) => health.export_errors.inc(),
    }
    result
}
