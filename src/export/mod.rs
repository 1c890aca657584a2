pub mod health;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::info;

use crate::aggregate::TargetSnapshot;
use crate::target::EventId;

/// Lifecycle state of a target at export time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetStatus {
    /// A worker is currently polling the log.
    Active,
    /// The last worker died; a replacement is scheduled.
    PendingRespawn,
}

/// Exported counters for one identifier.
#[derive(Debug, Serialize)]
pub struct EventReport {
    #[serde(rename = "Total")]
    pub total: u64,
    #[serde(rename = "Description")]
    pub description: Option<String>,
    #[serde(rename = "Timestamps")]
    pub timestamps: Vec<f64>,
}

/// Exported state of one (host, log) target.
#[derive(Debug, Serialize)]
pub struct TargetReport {
    #[serde(rename = "Start Timestamp")]
    pub start: f64,
    #[serde(rename = "Initial Start Timestamp")]
    pub initial_start: f64,
    #[serde(rename = "End Timestamp")]
    pub end: f64,
    #[serde(rename = "Total Processed Events")]
    pub total_processed: u64,
    #[serde(rename = "Failures")]
    pub failures: u64,
    #[serde(rename = "Status")]
    pub status: TargetStatus,
    #[serde(rename = "Last Error")]
    pub last_error: Option<String>,
    #[serde(rename = "Event IDs")]
    pub event_ids: BTreeMap<EventId, EventReport>,
}

/// host -> log name -> report.
pub type HostReports = BTreeMap<String, BTreeMap<String, TargetReport>>;

/// Full export document: a single export marker key over all targets.
pub type SnapshotDocument = BTreeMap<String, HostReports>;

/// Seconds since the Unix epoch with microsecond precision.
pub fn epoch_secs(t: DateTime<Utc>) -> f64 {
    t.timestamp_micros() as f64 / 1_000_000.0
}

/// Builds the export document for `targets` as of `exported_at`.
pub fn compose(targets: &[(TargetStatus, TargetSnapshot)], exported_at: DateTime<Utc>) -> SnapshotDocument {
    let end = epoch_secs(exported_at);
    let mut hosts = HostReports::new();

    for (status, snap) in targets {
        let event_ids = snap
            .events
            .iter()
            .map(|event| {
                let report = EventReport {
                    total: event.count,
                    description: event.description.clone(),
                    timestamps: event.timestamps.iter().copied().map(epoch_secs).collect(),
                };
                (event.id, report)
            })
            .collect();

        let report = TargetReport {
            start: epoch_secs(snap.latest_start),
            initial_start: epoch_secs(snap.initial_start),
            end,
            total_processed: snap.total_processed,
            failures: snap.failure_count,
            status: *status,
            last_error: snap.last_error.clone(),
            event_ids,
        };

        hosts
            .entry(snap.key.host.clone())
            .or_default()
            .insert(snap.key.log_name.clone(), report);
    }

    let mut document = SnapshotDocument::new();
    document.insert(export_marker(exported_at), hosts);
    document
}

fn export_marker(exported_at: DateTime<Utc>) -> String {
    format!("export-{}", exported_at.format("%Y-%m-%dT%H:%M:%S%.6fZ"))
}

/// Writes snapshot documents as uniquely named JSON files.
///
/// Clones share one sequence counter, so file names stay unique across them.
#[derive(Debug, Clone)]
pub struct SnapshotExporter {
    output_dir: PathBuf,
    sequence: Arc<AtomicU64>,
}

impl SnapshotExporter {
    /// Creates an exporter writing into `output_dir`.
    pub fn new(output_dir: impl Into<PathBuf>) -> Self {
        Self {
            output_dir: output_dir.into(),
            sequence: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    /// Serializes `targets` and writes them to a new file, returning its path.
    ///
    /// The document is written to a hidden temp file first and renamed into
    /// place, so readers never observe a partial snapshot.
    pub async fn export(&self, targets: &[(TargetStatus, TargetSnapshot)]) -> Result<PathBuf> {
        let exported_at = Utc::now();
        let document = compose(targets, exported_at);
        let body = serde_json::to_vec_pretty(&document).context("serializing snapshot")?;

        let sequence = self.sequence.fetch_add(1, Ordering::Relaxed) + 1;
        let file_name = format!(
            "eventwatch_{}_{sequence}.json",
            exported_at.format("%Y%m%dT%H%M%S%.6fZ"),
        );
        let path = self.output_dir.join(&file_name);
        let tmp_path = self.output_dir.join(format!(".{file_name}.tmp"));

        tokio::fs::write(&tmp_path, &body)
            .await
            .with_context(|| format!("writing {}", tmp_path.display()))?;

        if let Err(e) = tokio::fs::rename(&tmp_path, &path).await {
            let _ = tokio::fs::remove_file(&tmp_path).await;
            return Err(e).with_context(|| format!("renaming snapshot to {}", path.display()));
        }

        info!(
            path = %path.display(),
            targets = targets.len(),
            bytes = body.len(),
            "exported snapshot",
        );

        Ok(path)
    }
}
