//! Event logs exported as JSON lines on the local filesystem.
//!
//! Layout: `<root>/<host>/<log_name>.jsonl`, one record per line:
//! `{"id": 4624, "generated_at": 1760000000.25}` where `generated_at` is
//! seconds since the Unix epoch. Readers start at end-of-file and only see
//! records appended after they opened the log.

use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Deserialize;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tracing::{debug, warn};

use super::{EventReader, EventRecord, EventSource, SourceError};
use crate::target::{EventId, MonitorTarget, TargetKey};

/// Longest unterminated line kept between reads.
const MAX_PARTIAL_LINE: usize = 1024 * 1024;

/// Wire shape of one log line.
#[derive(Debug, Deserialize)]
struct RawRecord {
    id: EventId,
    generated_at: f64,
}

/// Opens `<root>/<host>/<log>.jsonl` files.
#[derive(Debug, Clone)]
pub struct FileEventSource {
    root: PathBuf,
    poll_interval: Duration,
}

impl FileEventSource {
    /// Creates a source rooted at `root` that waits `poll_interval` between
    /// checks for appended data.
    pub fn new(root: impl Into<PathBuf>, poll_interval: Duration) -> Self {
        Self {
            root: root.into(),
            poll_interval,
        }
    }

    /// Path of the file backing `key`.
    pub fn log_path(&self, key: &TargetKey) -> PathBuf {
        self.root
            .join(&key.host)
            .join(format!("{}.jsonl", key.log_name))
    }
}

impl EventSource for FileEventSource {
    type Reader = FileEventReader;

    async fn open(&self, target: &MonitorTarget) -> Result<FileEventReader, SourceError> {
        let key = target.key().clone();
        let path = self.log_path(&key);

        let open_err = |reason: String| SourceError::Open {
            target: key.clone(),
            reason,
        };

        let mut file = File::open(&path)
            .await
            .map_err(|e| open_err(format!("{}: {e}", path.display())))?;
        let position = file
            .seek(SeekFrom::End(0))
            .await
            .map_err(|e| open_err(format!("seeking {}: {e}", path.display())))?;

        debug!(path = %path.display(), position, "opened event log file");

        Ok(FileEventReader {
            key,
            path,
            file,
            position,
            pending: Vec::new(),
            poll_interval: self.poll_interval,
        })
    }
}

/// Tails one JSON-lines log file.
#[derive(Debug)]
pub struct FileEventReader {
    key: TargetKey,
    path: PathBuf,
    file: File,
    position: u64,
    /// Bytes of a trailing line not yet terminated by a newline.
    pending: Vec<u8>,
    poll_interval: Duration,
}

impl FileEventReader {
    fn read_err(&self, reason: String) -> SourceError {
        SourceError::Read {
            target: self.key.clone(),
            reason,
        }
    }

    /// Reads whatever was appended since the last call.
    async fn read_appended(&mut self) -> Result<usize, SourceError> {
        let len = match tokio::fs::metadata(&self.path).await {
            Ok(meta) => meta.len(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(SourceError::Closed {
                    target: self.key.clone(),
                });
            }
            Err(e) => return Err(self.read_err(format!("{}: {e}", self.path.display()))),
        };

        if len < self.position {
            return Err(self.read_err(format!(
                "{} shrank from {} to {len} bytes",
                self.path.display(),
                self.position,
            )));
        }

        if len == self.position {
            return Ok(0);
        }

        let result = self.file.read_to_end(&mut self.pending).await;
        let read = result.map_err(|e| self.read_err(format!("{}: {e}", self.path.display())))?;
        self.position += read as u64;

        Ok(read)
    }
}

impl EventReader for FileEventReader {
    async fn read_next(&mut self) -> Result<Vec<EventRecord>, SourceError> {
        if self.read_appended().await? == 0 {
            tokio::time::sleep(self.poll_interval).await;
            return Ok(Vec::new());
        }

        let records = drain_complete_lines(&mut self.pending, &self.path);
        if self.pending.len() > MAX_PARTIAL_LINE {
            return Err(self.read_err(format!(
                "{}: unterminated line longer than {MAX_PARTIAL_LINE} bytes",
                self.path.display(),
            )));
        }

        Ok(records)
    }
}

/// Parses every newline-terminated line out of `buf`, leaving any partial
/// trailing line in place.
fn drain_complete_lines(buf: &mut Vec<u8>, path: &Path) -> Vec<EventRecord> {
    let Some(last_newline) = buf.iter().rposition(|&b| b == b'\n') else {
        return Vec::new();
    };

    let complete: Vec<u8> = buf.drain(..=last_newline).collect();
    let mut records = Vec::new();

    for line in complete.split(|&b| b == b'\n') {
        let line = line.trim_ascii();
        if line.is_empty() {
            continue;
        }

        match parse_line(line) {
            Some(record) => records.push(record),
            None => warn!(
                path = %path.display(),
                line = %String::from_utf8_lossy(line),
                "skipping malformed event record",
            ),
        }
    }

    records
}

fn parse_line(line: &[u8]) -> Option<EventRecord> {
    let raw: RawRecord = serde_json::from_slice(line).ok()?;
    if !raw.generated_at.is_finite() {
        return None;
    }

    let micros = (raw.generated_at * 1_000_000.0).round() as i64;
    let generated_at = DateTime::<Utc>::from_timestamp_micros(micros)?;

    Some(EventRecord::new(raw.id, generated_at))
}
