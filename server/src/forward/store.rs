//! Durable store for port-forward session rows.
//!
//! Rows live in memory behind an `RwLock` and every mutation is appended as a
//! full-row JSON line to `forwards.jsonl`. On open the log is replayed (last
//! line per id wins) and rewritten compacted via temp-file-then-rename, so a
//! crash mid-compaction leaves the previous log intact.
//!
//! ## Concurrency
//!
//! Writers take the row lock, mutate, then take the log lock *before*
//! releasing the row lock. Log order therefore matches in-memory order, while
//! readers are never blocked on disk I/O.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use tokio::fs;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::{Mutex, RwLock};
use tracing::{error, info, warn};

use super::session::{ForwardParams, ForwardSession, ForwardStatus, SessionUpdate};
use crate::error::StoreError;

/// File name of the append-only log inside the data directory.
pub const STORE_FILE: &str = "forwards.jsonl";

struct StoreLog {
    file: fs::File,
    fsync: bool,
    /// Writes allowed before every append fails.
    #[cfg(test)]
    writes_left: Option<usize>,
}

/// Session store. Share it behind an `Arc`.
pub struct SessionStore {
    rows: RwLock<HashMap<String, ForwardSession>>,
    /// `None` for in-memory stores.
    log: Option<Mutex<StoreLog>>,
}

impl SessionStore {
    /// A store that keeps rows in memory only.
    pub fn in_memory() -> Self {
        Self {
            rows: RwLock::new(HashMap::new()),
            log: None,
        }
    }

    /// Open (or create) the store under `data_dir`, replaying and compacting
    /// any existing log.
    pub async fn open(data_dir: &Path, fsync: bool) -> Result<Self, StoreError> {
        fs::create_dir_all(data_dir).await?;
        let path = data_dir.join(STORE_FILE);

        let rows = replay(&path).await?;
        compact(&path, &rows).await?;

        let file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;

        info!(
            "Session store opened at {} ({} row(s))",
            path.display(),
            rows.len()
        );
        Ok(Self {
            rows: RwLock::new(rows),
            log: Some(Mutex::new(StoreLog {
                file,
                fsync,
                #[cfg(test)]
                writes_left: None,
            })),
        })
    }

    /// A store backed by `/dev/null` whose appends start failing after
    /// `writes` successful ones. Rows still change in memory.
    #[cfg(test)]
    pub(crate) async fn failing_after(writes: usize) -> Self {
        let file = fs::OpenOptions::new()
            .append(true)
            .open("/dev/null")
            .await
            .unwrap();
        Self {
            rows: RwLock::new(HashMap::new()),
            log: Some(Mutex::new(StoreLog {
                file,
                fsync: false,
                writes_left: Some(writes),
            })),
        }
    }

    /// Read every row from an existing log without opening it for writing.
    pub async fn read_only(data_dir: &Path) -> Result<Self, StoreError> {
        let rows = replay(&data_dir.join(STORE_FILE)).await?;
        Ok(Self {
            rows: RwLock::new(rows),
            log: None,
        })
    }

    /// Create a new `starting` row for `params`.
    pub async fn create(&self, params: ForwardParams) -> Result<ForwardSession, StoreError> {
        self.insert(ForwardSession::starting(params)).await
    }

    /// Insert a fully-built row (used when the caller needs the id before the
    /// row exists).
    pub async fn insert(&self, session: ForwardSession) -> Result<ForwardSession, StoreError> {
        let mut rows = self.rows.write().await;
        rows.insert(session.id.clone(), session.clone());
        self.append(rows, &session).await?;
        Ok(session)
    }

    /// Apply `update` to row `id` and return the resulting row.
    ///
    /// A status transition the state machine forbids is not an error: the row
    /// is returned unchanged and nothing is written.
    pub async fn update(
        &self,
        id: &str,
        update: &SessionUpdate,
    ) -> Result<ForwardSession, StoreError> {
        let mut rows = self.rows.write().await;
        let row = rows
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        let before = row.clone();
        if !row.apply(update) || *row == before {
            return Ok(before);
        }
        let updated = row.clone();
        self.append(rows, &updated).await?;
        Ok(updated)
    }

    pub async fn get(&self, id: &str) -> Option<ForwardSession> {
        self.rows.read().await.get(id).cloned()
    }

    /// Rows in `starting`/`active`, optionally filtered by context, oldest
    /// first.
    pub async fn find_active_by_context(&self, context: Option<&str>) -> Vec<ForwardSession> {
        let rows = self.rows.read().await;
        let mut out: Vec<ForwardSession> = rows
            .values()
            .filter(|s| s.status.is_live() && matches_context(s, context))
            .cloned()
            .collect();
        out.sort_by_key(|s| s.created_at);
        out
    }

    /// Every row for `context` (or all contexts), newest first.
    pub async fn history(&self, context: Option<&str>) -> Vec<ForwardSession> {
        let rows = self.rows.read().await;
        let mut out: Vec<ForwardSession> = rows
            .values()
            .filter(|s| matches_context(s, context))
            .cloned()
            .collect();
        out.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        out
    }

    /// Force every `starting`/`active` row (optionally within one context) to
    /// `stopped`. Returns the ids that changed.
    pub async fn mark_all_active_stopped(
        &self,
        context: Option<&str>,
    ) -> Result<Vec<String>, StoreError> {
        let ids: Vec<String> = self
            .find_active_by_context(context)
            .await
            .into_iter()
            .map(|s| s.id)
            .collect();
        let mut changed = Vec::with_capacity(ids.len());
        let stop = SessionUpdate::status(ForwardStatus::Stopped);
        for id in ids {
            let row = self.update(&id, &stop).await?;
            if row.status == ForwardStatus::Stopped {
                changed.push(id);
            }
        }
        Ok(changed)
    }

    /// Append `row` to the log, releasing the row lock once the log lock is
    /// held.
    async fn append<G>(&self, rows_guard: G, row: &ForwardSession) -> Result<(), StoreError> {
        let Some(ref log) = self.log else {
            return Ok(());
        };
        let mut log = log.lock().await;
        drop(rows_guard);

        #[cfg(test)]
        if let Some(left) = log.writes_left.as_mut() {
            if *left == 0 {
                return Err(StoreError::Io(std::io::Error::other("disk full")));
            }
            *left -= 1;
        }

        let mut line = serde_json::to_string(row)?;
        line.push('\n');
        let result = async {
            log.file.write_all(line.as_bytes()).await?;
            log.file.flush().await?;
            if log.fsync {
                log.file.sync_data().await?;
            }
            Ok::<_, std::io::Error>(())
        }
        .await;
        if let Err(ref e) = result {
            error!("Session store write failed for {}: {e}", row.id);
        }
        result.map_err(StoreError::from)
    }
}

fn matches_context(session: &ForwardSession, context: Option<&str>) -> bool {
    context.is_none_or(|c| session.params.context == c)
}

/// Replay a log file into a row map. A missing file is an empty store.
async fn replay(path: &Path) -> Result<HashMap<String, ForwardSession>, StoreError> {
    let mut rows = HashMap::new();
    let file = match fs::File::open(path).await {
        Ok(f) => f,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(rows),
        Err(e) => return Err(e.into()),
    };
    let mut lines = BufReader::new(file).lines();
    let mut line_no = 0usize;
    while let Some(line) = lines.next_line().await? {
        line_no += 1;
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<ForwardSession>(&line) {
            Ok(row) => {
                rows.insert(row.id.clone(), row);
            }
            Err(e) => {
                warn!("Skipping corrupt store line {line_no}: {e}");
            }
        }
    }
    Ok(rows)
}

/// Rewrite the log with exactly one line per row, atomically.
async fn compact(path: &Path, rows: &HashMap<String, ForwardSession>) -> Result<(), StoreError> {
    let mut ordered: Vec<&ForwardSession> = rows.values().collect();
    ordered.sort_by_key(|s| s.created_at);

    let mut buf = String::new();
    for row in ordered {
        buf.push_str(&serde_json::to_string(row)?);
        buf.push('\n');
    }

    let temp = temp_path(path);
    let mut file = fs::File::create(&temp).await?;
    file.write_all(buf.as_bytes()).await?;
    file.sync_all().await?;
    drop(file);
    if let Err(e) = fs::rename(&temp, path).await {
        let _ = fs::remove_file(&temp).await;
        return Err(e.into());
    }
    Ok(())
}

fn temp_path(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or(STORE_FILE);
    path.with_file_name(format!(".{name}.tmp.{}", std::process::id()))
}
