use chrono::{DateTime, Local};
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Local wall-clock time with microseconds, e.g. `2024-03-01 09:15:02.123456`.
/// Sorts lexicographically in time order.
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.6f";

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS users (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        name TEXT NOT NULL,
        created_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP
    );
    CREATE TABLE IF NOT EXISTS detections (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        user_id INTEGER,
        detection_time TIMESTAMP,
        FOREIGN KEY (user_id) REFERENCES users (id)
    );
    CREATE INDEX IF NOT EXISTS idx_detections_time ON detections(detection_time);
";

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("cannot create database directory {path}: {source}")]
    Directory {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("identity name must not be empty")]
    EmptyName,
}

/// One row of the recent-detections view.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RecentDetection {
    pub name: String,
    pub detection_time: String,
}

/// A row of the `users` table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Identity {
    pub id: i64,
    pub name: String,
    pub created_at: String,
}

/// Default database location: `$XDG_DATA_HOME/facelog/FaceBase.db`.
pub fn default_db_path() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            PathBuf::from(home).join(".local/share")
        })
        .join("facelog")
        .join("FaceBase.db")
}

/// Handle to the event database.
///
/// Holds only the path; every operation opens its own connection, so a
/// `Store` can be cloned freely into request handlers and session threads.
#[derive(Debug, Clone)]
pub struct Store {
    path: PathBuf,
}

impl Store {
    /// Open (creating if needed) the database and ensure both tables exist.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|source| StoreError::Directory {
                path: parent.display().to_string(),
                source,
            })?;
        }

        let store = Self { path };
        let conn = store.connect()?;
        let mode: String =
            conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
        conn.execute_batch(SCHEMA)?;

        tracing::info!(path = %store.path.display(), journal_mode = %mode, "event store ready");
        Ok(store)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn connect(&self) -> Result<Connection, StoreError> {
        let conn = Connection::open(&self.path)?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        // Detections may outlive or precede their identity row.
        conn.pragma_update(None, "foreign_keys", false)?;
        Ok(conn)
    }

    /// Append one detection event. Returns the new row id.
    pub fn record(&self, identity_id: i64, at: DateTime<Local>) -> Result<i64, StoreError> {
        let conn = self.connect()?;
        conn.execute(
            "INSERT INTO detections (user_id, detection_time) VALUES (?1, ?2)",
            params![identity_id, at.format(TIMESTAMP_FORMAT).to_string()],
        )?;
        let id = conn.last_insert_rowid();
        tracing::debug!(identity_id, row = id, "detection recorded");
        Ok(id)
    }

    /// The `limit` most recent detections joined with identity names, newest
    /// first. Events whose identity row is gone are not listed.
    pub fn recent(&self, limit: usize) -> Result<Vec<RecentDetection>, StoreError> {
        let conn = self.connect()?;
        let mut stmt = conn.prepare(
            "SELECT users.name, detections.detection_time
             FROM detections
             JOIN users ON detections.user_id = users.id
             ORDER BY detections.detection_time DESC, detections.id DESC
             LIMIT ?1",
        )?;
        let rows = stmt.query_map(params![limit as i64], |row| {
            Ok(RecentDetection {
                name: row.get(0)?,
                detection_time: row.get(1)?,
            })
        })?;
        let out = rows.collect::<Result<Vec<_>, _>>()?;
        Ok(out)
    }

    pub fn identity_name(&self, id: i64) -> Result<Option<String>, StoreError> {
        let conn = self.connect()?;
        let name = conn
            .query_row("SELECT name FROM users WHERE id = ?1", params![id], |row| {
                row.get(0)
            })
            .optional()?;
        Ok(name)
    }

    /// Insert an identity row. Its id is the label to train the model with.
    pub fn add_identity(&self, name: &str) -> Result<i64, StoreError> {
        let name = name.trim();
        if name.is_empty() {
            return Err(StoreError::EmptyName);
        }
        let conn = self.connect()?;
        conn.execute("INSERT INTO users (name) VALUES (?1)", params![name])?;
        let id = conn.last_insert_rowid();
        tracing::info!(id, name, "identity added");
        Ok(id)
    }

    pub fn identities(&self) -> Result<Vec<Identity>, StoreError> {
        let conn = self.connect()?;
        let mut stmt = conn.prepare(
            "SELECT id, name, COALESCE(CAST(created_at AS TEXT), '') FROM users ORDER BY id",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(Identity {
                id: row.get(0)?,
                name: row.get(1)?,
                created_at: row.get(2)?,
            })
        })?;
        let out = rows.collect::<Result<Vec<_>, _>>()?;
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn temp_store() -> (tempfile::TempDir, Store) {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path().join("db").join("FaceBase.db")).unwrap();
        (dir, store)
    }

    fn at(secs: u32) -> DateTime<Local> {
        Local.with_ymd_and_hms(2024, 3, 1, 9, 0, secs).unwrap()
    }

    #[test]
    fn test_open_is_idempotent() {
        let (dir, store) = temp_store();
        store.add_identity("Alice").unwrap();
        let reopened = Store::open(store.path()).unwrap();
        assert_eq!(reopened.identities().unwrap().len(), 1);
        drop(dir);
    }

    #[test]
    fn test_recent_empty() {
        let (_dir, store) = temp_store();
        assert!(store.recent(10).unwrap().is_empty());
    }

    #[test]
    fn test_recent_newest_first_and_limited() {
        let (_dir, store) = temp_store();
        let alice = store.add_identity("Alice").unwrap();
        let bob = store.add_identity("Bob").unwrap();
        for s in 0..12 {
            let id = if s % 2 == 0 { alice } else { bob };
            store.record(id, at(s)).unwrap();
        }

        let recent = store.recent(10).unwrap();
        assert_eq!(recent.len(), 10);
        assert_eq!(recent[0].name, "Bob");
        assert_eq!(recent[0].detection_time, "2024-03-01 09:00:11.000000");
        assert_eq!(recent[9].detection_time, "2024-03-01 09:00:02.000000");
        assert!(recent
            .windows(2)
            .all(|w| w[0].detection_time >= w[1].detection_time));
    }

    #[test]
    fn test_same_timestamp_breaks_tie_by_insertion() {
        let (_dir, store) = temp_store();
        let alice = store.add_identity("Alice").unwrap();
        let bob = store.add_identity("Bob").unwrap();
        store.record(alice, at(5)).unwrap();
        store.record(bob, at(5)).unwrap();
        let recent = store.recent(10).unwrap();
        assert_eq!(recent[0].name, "Bob");
        assert_eq!(recent[1].name, "Alice");
    }

    #[test]
    fn test_orphan_detection_excluded() {
        let (_dir, store) = temp_store();
        let alice = store.add_identity("Alice").unwrap();
        store.record(alice, at(1)).unwrap();
        store.record(999, at(2)).unwrap();
        let recent = store.recent(10).unwrap();
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].name, "Alice");
    }

    #[test]
    fn test_every_record_is_a_row() {
        let (_dir, store) = temp_store();
        let alice = store.add_identity("Alice").unwrap();
        let first = store.record(alice, at(1)).unwrap();
        let second = store.record(alice, at(1)).unwrap();
        assert_ne!(first, second);
        assert_eq!(store.recent(10).unwrap().len(), 2);
    }

    #[test]
    fn test_identity_lookup() {
        let (_dir, store) = temp_store();
        let id = store.add_identity("  Alice ").unwrap();
        assert_eq!(store.identity_name(id).unwrap().as_deref(), Some("Alice"));
        assert_eq!(store.identity_name(id + 100).unwrap(), None);
        let all = store.identities().unwrap();
        assert_eq!(all[0].id, id);
        assert!(!all[0].created_at.is_empty());
    }

    #[test]
    fn test_add_identity_rejects_empty_name() {
        let (_dir, store) = temp_store();
        assert!(matches!(store.add_identity("   "), Err(StoreError::EmptyName)));
    }

    #[test]
    fn test_unusable_path_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        // A directory where the database file should be.
        assert!(Store::open(dir.path()).is_err());
    }

    #[test]
    fn test_operations_fail_after_database_is_replaced() {
        let (dir, store) = temp_store();
        let path = store.path().to_path_buf();
        std::fs::remove_file(&path).unwrap();
        std::fs::create_dir(&path).unwrap();
        assert!(store.record(1, at(0)).is_err());
        assert!(store.recent(10).is_err());
        drop(dir);
    }
}
