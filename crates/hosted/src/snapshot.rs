//! SQLite snapshotter.
//!
//! Produces a consistent copy of a live SQLite database into a sidecar file
//! using the engine's incremental backup API. The source stays open
//! read-write elsewhere; the copy proceeds in bounded page batches with a
//! short pause between steps so writers are never blocked for long. If a
//! writer interrupts the copy the engine restarts it from the beginning,
//! which is expected and only logged.
//!
//! The destination runs with `synchronous=OFF` and `journal_mode=OFF`: the
//! copy does not need to survive an OS crash, the source remains canonical.

use rusqlite::backup::{Backup, StepResult};
use rusqlite::{Connection, ErrorCode, OpenFlags};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::warn;

/// Pages copied per backup step (4 KiB pages; ~4 MiB per step).
pub const PAGES_PER_STEP: std::os::raw::c_int = 1024;

/// Pause between steps, yielding the write lock.
const STEP_PAUSE: Duration = Duration::from_millis(10);

/// Minimum interval between repeats of the same log message.
const LOG_THROTTLE: Duration = Duration::from_secs(1);

/// Snapshot errors.
#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("backup task aborted: {0}")]
    Aborted(String),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProgressAction {
    Open,
    Step,
    Close,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProgressPhase {
    Before,
    After,
}

/// Observability event for tests; production callers pass no hook.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ProgressEvent {
    pub action: ProgressAction,
    pub phase: ProgressPhase,
}

/// Test hook invoked around open/step/close transitions.
pub type ProgressHook = Box<dyn FnMut(ProgressEvent) + Send>;

/// Deduplicating log throttle: the same message is emitted at most once
/// per second.
struct LogThrottle {
    last: HashMap<String, Instant>,
}

impl LogThrottle {
    fn new() -> Self {
        Self {
            last: HashMap::new(),
        }
    }

    fn warn(&mut self, message: &str) {
        let now = Instant::now();
        let due = self
            .last
            .get(message)
            .map(|at| now.duration_since(*at) >= LOG_THROTTLE)
            .unwrap_or(true);
        if due {
            self.last.insert(message.to_string(), now);
            warn!("{message}");
        }
    }
}

/// Copy the live database at `src` into `dest`.
///
/// Runs on the blocking thread pool; any stale or partial file at `dest`
/// is removed, including on failure.
pub async fn backup_sqlite_database(
    src: impl AsRef<Path>,
    dest: impl AsRef<Path>,
    progress: Option<ProgressHook>,
) -> Result<(), SnapshotError> {
    let src: PathBuf = src.as_ref().to_path_buf();
    let dest: PathBuf = dest.as_ref().to_path_buf();
    tokio::task::spawn_blocking(move || backup_sync(&src, &dest, progress))
        .await
        .map_err(|e| SnapshotError::Aborted(e.to_string()))?
}

fn backup_sync(
    src: &Path,
    dest: &Path,
    mut progress: Option<ProgressHook>,
) -> Result<(), SnapshotError> {
    match std::fs::remove_file(dest) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(SnapshotError::Io(e)),
    }

    let result = run_backup(src, dest, &mut progress);
    if result.is_err() {
        let _ = std::fs::remove_file(dest);
    }
    result
}

fn emit(progress: &mut Option<ProgressHook>, action: ProgressAction, phase: ProgressPhase) {
    if let Some(hook) = progress {
        hook(ProgressEvent { action, phase });
    }
}

fn is_transient(err: &rusqlite::Error) -> bool {
    matches!(
        err.sqlite_error_code(),
        Some(ErrorCode::DatabaseBusy) | Some(ErrorCode::DatabaseLocked)
    )
}

fn run_backup(
    src: &Path,
    dest: &Path,
    progress: &mut Option<ProgressHook>,
) -> Result<(), SnapshotError> {
    let mut throttle = LogThrottle::new();

    emit(progress, ProgressAction::Open, ProgressPhase::Before);
    let src_conn = Connection::open_with_flags(src, OpenFlags::SQLITE_OPEN_READ_ONLY)?;
    let mut dest_conn = Connection::open(dest)?;
    dest_conn.pragma_update(None, "synchronous", "OFF")?;
    dest_conn.pragma_update(None, "journal_mode", "OFF")?;
    emit(progress, ProgressAction::Open, ProgressPhase::After);

    {
        let backup = Backup::new(&src_conn, &mut dest_conn)?;
        let mut prev_remaining: Option<std::os::raw::c_int> = None;

        loop {
            emit(progress, ProgressAction::Step, ProgressPhase::Before);
            let step = backup.step(PAGES_PER_STEP);
            emit(progress, ProgressAction::Step, ProgressPhase::After);

            match step {
                Ok(StepResult::Done) => break,
                Ok(StepResult::More) => {}
                Ok(StepResult::Busy) => throttle.warn("sqlite backup: source busy"),
                Ok(StepResult::Locked) => throttle.warn("sqlite backup: source locked"),
                Err(e) if is_transient(&e) => throttle.warn(&format!("sqlite backup: {e}")),
                Err(e) => return Err(SnapshotError::Sqlite(e)),
                Ok(_) => {}
            }

            // A writer changed the source mid-copy; the engine restarted
            // the backup. Visible as `remaining` growing between steps.
            let state = backup.progress();
            if let Some(prev) = prev_remaining {
                if state.remaining > prev {
                    throttle.warn("sqlite backup restarted");
                }
            }
            prev_remaining = Some(state.remaining);

            std::thread::sleep(STEP_PAUSE);
        }
    }

    emit(progress, ProgressAction::Close, ProgressPhase::Before);
    dest_conn.close().map_err(|(_, e)| SnapshotError::Sqlite(e))?;
    emit(progress, ProgressAction::Close, ProgressPhase::After);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    fn create_doc(path: &Path, rows: usize) {
        let conn = Connection::open(path).unwrap();
        conn.execute_batch(
            "CREATE TABLE records (id INTEGER PRIMARY KEY, body TEXT NOT NULL);",
        )
        .unwrap();
        for i in 0..rows {
            conn.execute(
                "INSERT INTO records (body) VALUES (?1)",
                [format!("row {i}")],
            )
            .unwrap();
        }
    }

    fn count_rows(path: &Path) -> i64 {
        let conn = Connection::open_with_flags(path, OpenFlags::SQLITE_OPEN_READ_ONLY).unwrap();
        conn.query_row("SELECT COUNT(*) FROM records", [], |row| row.get(0))
            .unwrap()
    }

    #[tokio::test]
    async fn test_backup_copies_all_rows() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("doc.grist");
        let dest = dir.path().join("doc.grist-backup");
        create_doc(&src, 100);

        backup_sqlite_database(&src, &dest, None).await.unwrap();
        assert_eq!(count_rows(&dest), 100);
    }

    #[tokio::test]
    async fn test_backup_replaces_stale_dest() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("doc.grist");
        let dest = dir.path().join("doc.grist-backup");
        create_doc(&src, 5);
        std::fs::write(&dest, b"not a database").unwrap();

        backup_sqlite_database(&src, &dest, None).await.unwrap();
        assert_eq!(count_rows(&dest), 5);
    }

    #[tokio::test]
    async fn test_backup_source_stays_writable() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("doc.grist");
        let dest = dir.path().join("doc.grist-backup");
        create_doc(&src, 10);

        backup_sqlite_database(&src, &dest, None).await.unwrap();

        // The source connection was opened read-only; writes afterwards work.
        let conn = Connection::open(&src).unwrap();
        conn.execute("INSERT INTO records (body) VALUES ('after')", [])
            .unwrap();
        assert_eq!(count_rows(&src), 11);
        assert_eq!(count_rows(&dest), 10);
    }

    #[tokio::test]
    async fn test_backup_missing_source_cleans_partial_dest() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("missing.grist");
        let dest = dir.path().join("missing.grist-backup");

        let result = backup_sqlite_database(&src, &dest, None).await;
        assert!(result.is_err());
        assert!(!dest.exists(), "partial destination must be removed");
    }

    #[tokio::test]
    async fn test_progress_events_bracket_the_copy() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("doc.grist");
        let dest = dir.path().join("doc.grist-backup");
        create_doc(&src, 20);

        let events: Arc<Mutex<Vec<ProgressEvent>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = events.clone();
        let hook: ProgressHook = Box::new(move |event| sink.lock().unwrap().push(event));

        backup_sqlite_database(&src, &dest, Some(hook)).await.unwrap();

        let events = events.lock().unwrap();
        assert_eq!(
            events.first().copied(),
            Some(ProgressEvent {
                action: ProgressAction::Open,
                phase: ProgressPhase::Before
            })
        );
        assert_eq!(
            events.last().copied(),
            Some(ProgressEvent {
                action: ProgressAction::Close,
                phase: ProgressPhase::After
            })
        );
        assert!(events.iter().any(|e| e.action == ProgressAction::Step));
    }
}
