//! Schema-versioned, asynchronous snapshot persistence (§4.6).
//!
//! Writes are fire-and-forget from the mutator's perspective: a per-room
//! `watch` channel always holds the most recently requested snapshot, and a
//! single background task per room drains it and writes to disk, so rapid
//! successive mutations coalesce into the latest state rather than queuing
//! one write per mutation.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use crate::error::{CoreError, CoreResult};
use crate::model::{now_ms, Operation, Stroke};
use crate::room::RoomSnapshot;

const SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SnapshotRecord {
    version: u32,
    room_id: String,
    strokes: Vec<Stroke>,
    operation_history: Vec<Operation>,
    undone_operations: Vec<Operation>,
    timestamp: i64,
}

pub struct PersistenceLayer {
    dir: PathBuf,
    writers: Mutex<HashMap<String, watch::Sender<Option<SnapshotRecord>>>>,
}

impl PersistenceLayer {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            writers: Mutex::new(HashMap::new()),
        }
    }

    fn path_for(&self, code: &str) -> PathBuf {
        self.dir.join(format!("{code}.json"))
    }

    fn tmp_path_for(&self, code: &str) -> PathBuf {
        self.dir.join(format!("{code}.json.tmp"))
    }

    /// Loads a room's snapshot from disk. `Ok(None)` means no snapshot file
    /// exists (a true cold miss); corrupt or schema-mismatched files are
    /// treated the same way a missing file is, per the read-failure policy,
    /// after logging a warning.
    pub async fn load(&self, code: &str) -> CoreResult<Option<RoomSnapshot>> {
        let path = self.path_for(code);
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => {
                log::warn!("persistence read failed for room {code}: {err}");
                return Ok(None);
            }
        };

        let record: SnapshotRecord = match serde_json::from_slice(&bytes) {
            Ok(record) => record,
            Err(err) => {
                log::warn!("corrupt snapshot for room {code}: {err}");
                return Ok(None);
            }
        };

        if record.version != SCHEMA_VERSION {
            log::warn!(
                "snapshot schema mismatch for room {code}: got version {}, expected {}",
                record.version,
                SCHEMA_VERSION
            );
            return Ok(None);
        }

        Ok(Some(RoomSnapshot {
            strokes: record.strokes,
            operation_history: record.operation_history,
            undone_operations: record.undone_operations,
        }))
    }

    /// Schedules a fire-and-forget write. Returns immediately; the caller
    /// never awaits disk I/O on the mutation path.
    pub fn schedule_write(&self, code: &str, snapshot: RoomSnapshot) {
        let record = self.to_record(code, snapshot);
        let mut writers = self.writers.lock();
        if let Some(tx) = writers.get(code) {
            let _ = tx.send(Some(record));
            return;
        }

        let (tx, mut rx) = watch::channel(Some(record));
        writers.insert(code.to_string(), tx);
        drop(writers);

        let dir = self.dir.clone();
        let path = dir.join(format!("{code}.json"));
        let tmp_path = dir.join(format!("{code}.json.tmp"));
        let code = code.to_string();

        tokio::spawn(async move {
            loop {
                let record = rx.borrow_and_update().clone();
                if let Some(record) = record {
                    if let Err(err) =
                        write_atomic(&dir, &tmp_path, &path, &record).await
                    {
                        log::error!("persistence write failed for room {code}: {err}");
                    }
                }
                if rx.changed().await.is_err() {
                    break;
                }
            }
        });
    }

    /// Writes the snapshot to disk and awaits completion; used for the
    /// registry's final save before evicting an empty room.
    pub async fn write_now(&self, code: &str, snapshot: RoomSnapshot) -> CoreResult<()> {
        let record = self.to_record(code, snapshot);
        let path = self.path_for(code);
        let tmp_path = self.tmp_path_for(code);
        write_atomic(&self.dir, &tmp_path, &path, &record)
            .await
            .map_err(|e| CoreError::persistence(e.to_string()))
    }

    fn to_record(&self, code: &str, snapshot: RoomSnapshot) -> SnapshotRecord {
        SnapshotRecord {
            version: SCHEMA_VERSION,
            room_id: code.to_string(),
            strokes: snapshot.strokes,
            operation_history: snapshot.operation_history,
            undone_operations: snapshot.undone_operations,
            timestamp: now_ms(),
        }
    }
}

async fn write_atomic(
    dir: &Path,
    tmp_path: &Path,
    final_path: &Path,
    record: &SnapshotRecord,
) -> std::io::Result<()> {
    tokio::fs::create_dir_all(dir).await?;
    let body = serde_json::to_vec(record).expect("snapshot record always serializes");
    tokio::fs::write(tmp_path, body).await?;
    tokio::fs::rename(tmp_path, final_path).await
}
