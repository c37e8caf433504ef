pub mod schema;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, SecondsFormat, Utc};
use parking_lot::Mutex;
use rusqlite::{Connection, OptionalExtension};
use thiserror::Error;

use crate::core::validate_size;
use crate::core::window::Sample;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("corrupt snapshot: {0}")]
    Corrupt(String),
    #[error("{}: {source}", path.display())]
    Io { path: PathBuf, source: std::io::Error },
    #[error("snapshot task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

/// Metadata written alongside every snapshot.
#[derive(Debug, Clone, PartialEq)]
pub struct SnapshotInfo {
    pub saved_at: DateTime<Utc>,
    pub sample_count: usize,
}

pub struct Database {
    conn: Connection,
}

impl Database {
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;
        schema::migrate(&conn)?;
        Ok(Self { conn })
    }

    /// Replace the stored snapshot with `samples` in a single transaction.
    pub fn save_samples(&self, samples: &[Sample], saved_at: DateTime<Utc>) -> Result<(), StoreError> {
        let tx = self.conn.unchecked_transaction()?;
        tx.execute("DELETE FROM samples", [])?;
        {
            let mut stmt = tx.prepare_cached("INSERT INTO samples (seq, size, observed_at) VALUES (?1, ?2, ?3)")?;
            for (seq, sample) in samples.iter().enumerate() {
                stmt.execute(rusqlite::params![
                    seq as i64,
                    sample.size,
                    sample.observed_at.to_rfc3339_opts(SecondsFormat::Nanos, true),
                ])?;
            }
        }
        tx.execute(
            "INSERT INTO snapshot_meta (id, saved_at, sample_count) VALUES (1, ?1, ?2)
             ON CONFLICT(id) DO UPDATE SET saved_at = excluded.saved_at, sample_count = excluded.sample_count",
            rusqlite::params![saved_at.to_rfc3339_opts(SecondsFormat::Nanos, true), samples.len() as i64],
        )?;
        tx.commit()?;
        Ok(())
    }

    pub fn snapshot_info(&self) -> Result<Option<SnapshotInfo>, StoreError> {
        let row = self
            .conn
            .query_row("SELECT saved_at, sample_count FROM snapshot_meta WHERE id = 1", [], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
            })
            .optional()?;

        let Some((saved_at, count)) = row else {
            return Ok(None);
        };
        Ok(Some(SnapshotInfo {
            saved_at: parse_timestamp(&saved_at)?,
            sample_count: usize::try_from(count)
                .map_err(|_| StoreError::Corrupt(format!("negative sample count {count}")))?,
        }))
    }

    /// Samples in insertion order. Empty when no snapshot was ever written.
    pub fn load_samples(&self) -> Result<Vec<Sample>, StoreError> {
        let Some(info) = self.snapshot_info()? else {
            return Ok(Vec::new());
        };

        let mut stmt = self
            .conn
            .prepare("SELECT seq, size, observed_at FROM samples ORDER BY seq")?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, Option<f64>>(1)?,
                row.get::<_, String>(2)?,
            ))
        })?;

        let mut samples = Vec::with_capacity(info.sample_count);
        for row in rows {
            let (seq, size, observed_at) = row?;
            let size = size
                .ok_or_else(|| StoreError::Corrupt(format!("row {seq}: missing size")))
                .and_then(|s| {
                    validate_size(s).map_err(|e| StoreError::Corrupt(format!("row {seq}: {e}")))
                })?;
            let observed_at = parse_timestamp(&observed_at)
                .map_err(|e| StoreError::Corrupt(format!("row {seq}: {e}")))?;
            samples.push(Sample::new(size, observed_at));
        }

        if samples.len() != info.sample_count {
            return Err(StoreError::Corrupt(format!(
                "expected {} samples, found {}",
                info.sample_count,
                samples.len()
            )));
        }
        Ok(samples)
    }
}

fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| StoreError::Corrupt(format!("bad timestamp {raw:?}: {e}")))
}

/// Thread-safe handle to the window snapshot.
#[derive(Clone)]
pub struct SnapshotStore {
    inner: Arc<Mutex<Database>>,
    path: PathBuf,
}

impl SnapshotStore {
    /// Open (creating parent directories and schema as needed).
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|source| StoreError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        let db = Database::open(path)?;
        Ok(Self {
            inner: Arc::new(Mutex::new(db)),
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn save(&self, samples: &[Sample]) -> Result<(), StoreError> {
        self.inner.lock().save_samples(samples, Utc::now())
    }

    pub fn load(&self) -> Result<Vec<Sample>, StoreError> {
        self.inner.lock().load_samples()
    }

    pub fn info(&self) -> Result<Option<SnapshotInfo>, StoreError> {
        self.inner.lock().snapshot_info()
    }

    /// Save on the blocking pool so async callers never stall on disk I/O.
    pub async fn save_owned(&self, samples: Vec<Sample>) -> Result<(), StoreError> {
        let store = self.clone();
        tokio::task::spawn_blocking(move || store.save(&samples)).await?
    }

    /// Move an unreadable database (and its WAL files) aside so a fresh one
    /// can be created. Returns where the main file went.
    pub fn quarantine(path: &Path) -> Result<PathBuf, StoreError> {
        let suffix = format!("corrupt-{}", Utc::now().timestamp());
        let target = path.with_extension(format!(
            "{}.{suffix}",
            path.extension().and_then(|e| e.to_str()).unwrap_or("db")
        ));
        for (from, to) in [
            (path.to_path_buf(), target.clone()),
            (sidecar(path, "-wal"), sidecar(&target, "-wal")),
            (sidecar(path, "-shm"), sidecar(&target, "-shm")),
        ] {
            if from.exists() {
                std::fs::rename(&from, &to).map_err(|source| StoreError::Io { path: from.clone(), source })?;
            }
        }
        Ok(target)
    }
}

fn sidecar(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(suffix);
    PathBuf::from(name)
}
