use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use tokio::time::Instant;

use eventwatch::agent::{Supervisor, SupervisorSettings};
use eventwatch::export::health::HealthMetrics;
use eventwatch::export::{SnapshotExporter, TargetStatus};
use eventwatch::source::{EventReader, EventRecord, EventSource, SourceError};
use eventwatch::target::{EventId, MonitorTarget, TargetKey};

const RETRY: Duration = Duration::from_secs(300);
const EXPORT_EVERY: Duration = Duration::from_secs(60);

/// One step of a scripted reader.
#[derive(Clone)]
enum Step {
    /// Emit records generated `ms` milliseconds after the log was opened.
    Emit(Vec<(EventId, i64)>),
    /// Hand back every record this target has delivered so far.
    RedeliverAll,
    /// Fail the read.
    Fail(&'static str),
}

/// What happens the next time a target's log is opened.
#[derive(Clone)]
enum Session {
    OpenFails(&'static str),
    /// Runs the steps, then blocks forever.
    Steps(Vec<Step>),
}

/// Event source driven by a per-target script of sessions.
#[derive(Default)]
struct Scripted {
    sessions: Mutex<HashMap<TargetKey, VecDeque<Session>>>,
    delivered: Arc<Mutex<HashMap<TargetKey, Vec<EventRecord>>>>,
}

impl Scripted {
    fn with(mut self, key: &TargetKey, sessions: Vec<Session>) -> Self {
        self.sessions.get_mut().insert(key.clone(), sessions.into());
        self
    }
}

struct ScriptedReader {
    key: TargetKey,
    opened_at: chrono::DateTime<Utc>,
    steps: VecDeque<Step>,
    delivered: Arc<Mutex<HashMap<TargetKey, Vec<EventRecord>>>>,
}

impl EventSource for Scripted {
    type Reader = ScriptedReader;

    async fn open(&self, target: &MonitorTarget) -> Result<ScriptedReader, SourceError> {
        let key = target.key().clone();
        let session = self
            .sessions
            .lock()
            .get_mut(&key)
            .and_then(|sessions| sessions.pop_front());

        let steps = match session {
            Some(Session::OpenFails(reason)) => {
                return Err(SourceError::Open {
                    target: key,
                    reason: reason.to_string(),
                })
            }
            Some(Session::Steps(steps)) => steps.into(),
            None => VecDeque::new(),
        };

        Ok(ScriptedReader {
            key,
            opened_at: Utc::now(),
            steps,
            delivered: Arc::clone(&self.delivered),
        })
    }
}

impl EventReader for ScriptedReader {
    async fn read_next(&mut self) -> Result<Vec<EventRecord>, SourceError> {
        match self.steps.pop_front() {
            Some(Step::Emit(records)) => {
                let batch: Vec<EventRecord> = records
                    .into_iter()
                    .map(|(id, ms)| {
                        EventRecord::new(id, self.opened_at + chrono::Duration::milliseconds(ms))
                    })
                    .collect();
                self.delivered
                    .lock()
                    .entry(self.key.clone())
                    .or_default()
                    .extend(batch.iter().copied());
                Ok(batch)
            }
            Some(Step::RedeliverAll) => Ok(self
                .delivered
                .lock()
                .get(&self.key)
                .cloned()
                .unwrap_or_default()),
            Some(Step::Fail(reason)) => Err(SourceError::Read {
                target: self.key.clone(),
                reason: reason.to_string(),
            }),
            None => std::future::pending().await,
        }
    }
}

fn target(host: &str, log: &str, ids: Vec<EventId>) -> MonitorTarget {
    let descriptions = HashMap::from([(1111, "Service started".to_string())]);
    MonitorTarget::new(TargetKey::new(host, log), ids, descriptions).unwrap()
}

fn start(
    targets: Vec<MonitorTarget>,
    source: Scripted,
    dir: &tempfile::TempDir,
) -> Supervisor<Scripted> {
    Supervisor::start(
        targets,
        Arc::new(source),
        SupervisorSettings {
            tick_interval: Duration::from_secs(1),
            retry_delay: RETRY,
            export_interval: EXPORT_EVERY,
        },
        SnapshotExporter::new(dir.path()),
        Arc::new(HealthMetrics::new("").unwrap()),
    )
    .unwrap()
}

/// Ticks at `now` until `done` holds, giving workers time to run in between.
async fn settle<F>(sup: &mut Supervisor<Scripted>, now: Instant, done: F)
where
    F: Fn(&Supervisor<Scripted>) -> bool,
{
    for _ in 0..500 {
        sup.tick(now).await;
        if done(sup) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
    panic!("supervisor did not settle");
}

fn exported_files(dir: &tempfile::TempDir) -> Vec<PathBuf> {
    let mut files: Vec<PathBuf> = std::fs::read_dir(dir.path())
        .unwrap()
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| p.extension().is_some_and(|ext| ext == "json"))
        .collect();
    files.sort();
    files
}

fn read_export(path: &PathBuf) -> serde_json::Value {
    let body = std::fs::read_to_string(path).unwrap();
    let json: serde_json::Value = serde_json::from_str(&body).unwrap();
    let obj = json.as_object().unwrap();
    assert_eq!(obj.len(), 1);
    obj.values().next().unwrap().clone()
}

#[tokio::test]
async fn test_only_monitored_ids_are_counted() {
    let dir = tempfile::tempdir().unwrap();
    let key = TargetKey::new("srv01", "System");
    let source = Scripted::default().with(
        &key,
        vec![Session::Steps(vec![Step::Emit(vec![
            (1111, 1),
            (9999, 2),
            (2222, 3),
        ])])],
    );

    let mut sup = start(vec![target("srv01", "System", vec![1111, 2222])], source, &dir);
    settle(&mut sup, Instant::now(), |s| {
        s.snapshot(&key).unwrap().total_processed == 2
    })
    .await;

    let snap = sup.snapshot(&key).unwrap();
    assert_eq!(snap.count(1111), 1);
    assert_eq!(snap.count(2222), 1);
    assert!(snap.event(9999).is_none());
    assert_eq!(snap.failure_count, 0);
    assert_eq!(sup.status(&key), Some(TargetStatus::Active));
}

#[tokio::test]
async fn test_respawn_waits_for_retry_delay_and_keeps_counts() {
    let dir = tempfile::tempdir().unwrap();
    let key = TargetKey::new("srv01", "System");
    let source = Scripted::default().with(
        &key,
        vec![
            Session::Steps(vec![
                Step::Emit(vec![(1111, 1), (1111, 2)]),
                Step::Fail("connection reset"),
            ]),
            Session::Steps(vec![Step::Emit(vec![(2222, 1)])]),
        ],
    );

    let mut sup = start(vec![target("srv01", "System", vec![1111, 2222])], source, &dir);
    let t0 = Instant::now();

    settle(&mut sup, t0, |s| s.registry().pending_len() == 1).await;
    let before = sup.snapshot(&key).unwrap();
    assert_eq!(before.failure_count, 1);
    assert_eq!(before.count(1111), 2);
    assert!(before.last_error.unwrap().contains("connection reset"));

    // Four minutes in: still waiting.
    sup.tick(t0 + Duration::from_secs(240)).await;
    assert_eq!(sup.status(&key), Some(TargetStatus::PendingRespawn));

    // Five minutes in: a fresh worker takes over the same aggregate.
    let t1 = t0 + RETRY;
    sup.tick(t1).await;
    assert_eq!(sup.status(&key), Some(TargetStatus::Active));

    settle(&mut sup, t1, |s| s.snapshot(&key).unwrap().total_processed == 3).await;
    let after = sup.snapshot(&key).unwrap();
    assert_eq!(after.count(1111), 2);
    assert_eq!(after.count(2222), 1);
    assert_eq!(after.failure_count, 1);
    assert_eq!(after.initial_start, before.initial_start);
    assert!(after.latest_start > before.latest_start);
}

#[tokio::test]
async fn test_redelivered_records_are_not_recounted() {
    let dir = tempfile::tempdir().unwrap();
    let key = TargetKey::new("srv01", "System");
    let source = Scripted::default().with(
        &key,
        vec![
            Session::Steps(vec![Step::Emit(vec![(1111, 1)]), Step::Fail("RPC failed")]),
            Session::Steps(vec![Step::RedeliverAll, Step::Emit(vec![(1111, 5)])]),
        ],
    );

    let mut sup = start(vec![target("srv01", "System", vec![1111])], source, &dir);
    let t0 = Instant::now();

    settle(&mut sup, t0, |s| s.registry().pending_len() == 1).await;
    assert_eq!(sup.snapshot(&key).unwrap().count(1111), 1);

    // The first record must predate the restart.
    tokio::time::sleep(Duration::from_millis(5)).await;

    let t1 = t0 + RETRY;
    settle(&mut sup, t1, |s| s.snapshot(&key).unwrap().count(1111) == 2).await;

    // Give a stray recount the chance to show up.
    sup.tick(t1).await;
    tokio::time::sleep(Duration::from_millis(5)).await;

    let snap = sup.snapshot(&key).unwrap();
    assert_eq!(snap.count(1111), 2);
    assert_eq!(snap.total_processed, 2);
    assert_eq!(snap.event(1111).unwrap().timestamps.len(), 2);
}

#[tokio::test]
async fn test_periodic_export_covers_active_and_pending_targets() {
    let dir = tempfile::tempdir().unwrap();
    let healthy = TargetKey::new("dc01", "System");
    let broken = TargetKey::new("dc02", "Security");
    let source = Scripted::default()
        .with(
            &healthy,
            vec![Session::Steps(vec![Step::Emit(vec![(1111, 1)])])],
        )
        .with(&broken, vec![Session::OpenFails("access denied")]);

    let mut sup = start(
        vec![
            target("dc01", "System", vec![1111]),
            target("dc02", "Security", vec![4624]),
        ],
        source,
        &dir,
    );
    let t0 = Instant::now();

    settle(&mut sup, t0, |s| {
        s.registry().pending_len() == 1 && s.snapshot(&healthy).unwrap().total_processed == 1
    })
    .await;
    assert!(exported_files(&dir).is_empty());

    sup.tick(t0 + EXPORT_EVERY + Duration::from_secs(1)).await;

    let files = exported_files(&dir);
    assert_eq!(files.len(), 1);
    let hosts = read_export(&files[0]);

    let system = &hosts["dc01"]["System"];
    assert_eq!(system["Status"], "active");
    assert_eq!(system["Total Processed Events"], 1);
    assert_eq!(system["Failures"], 0);
    assert_eq!(system["Event IDs"]["1111"]["Total"], 1);
    assert_eq!(system["Event IDs"]["1111"]["Description"], "Service started");
    assert_eq!(
        system["Event IDs"]["1111"]["Timestamps"]
            .as_array()
            .unwrap()
            .len(),
        1
    );

    let security = &hosts["dc02"]["Security"];
    assert_eq!(security["Status"], "pending_respawn");
    assert_eq!(security["Failures"], 1);
    assert!(security["Last Error"]
        .as_str()
        .unwrap()
        .contains("access denied"));
    assert_eq!(security["Total Processed Events"], 0);
}

#[tokio::test]
async fn test_final_snapshot_with_no_events() {
    let dir = tempfile::tempdir().unwrap();
    let key = TargetKey::new("srv01", "Application");
    let source = Scripted::default().with(&key, vec![Session::Steps(vec![])]);

    let sup = start(
        vec![target("srv01", "Application", vec![1111, 2222])],
        source,
        &dir,
    );
    let path = sup.shutdown().await.unwrap();

    let hosts = read_export(&path);
    let report = &hosts["srv01"]["Application"];
    assert_eq!(report["Total Processed Events"], 0);
    assert_eq!(report["Failures"], 0);
    assert!(report["Last Error"].is_null());
    for id in ["1111", "2222"] {
        assert_eq!(report["Event IDs"][id]["Total"], 0);
        assert_eq!(report["Event IDs"][id]["Timestamps"], serde_json::json!([]));
    }
    assert!(report["Start Timestamp"].as_f64().unwrap() <= report["End Timestamp"].as_f64().unwrap());
}
