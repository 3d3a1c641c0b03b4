use anyhow::{anyhow, Context, Result};
use rusqlite::{Connection, Transaction, TransactionBehavior};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Shared SQLite handle for the subscriber store and the stats ledger.
pub struct Database {
    conn: Mutex<Connection>,
    path: PathBuf,
}

pub fn default_path() -> Result<PathBuf> {
    // Use XDG data directory or fallback
    if let Some(proj_dirs) = directories::ProjectDirs::from("", "", "boardwatch") {
        Ok(proj_dirs.data_dir().join("boardwatch.db"))
    } else {
        Ok(PathBuf::from("boardwatch.db"))
    }
}

impl Database {
    /// Opens (creating if needed) the database and applies the schema.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).with_context(|| {
                    format!("Failed to create database directory {}", parent.display())
                })?;
            }
        }
        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open database at {}", path.display()))?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        let db = Self {
            conn: Mutex::new(conn),
            path: path.to_path_buf(),
        };
        db.init()?;
        Ok(db)
    }

    pub fn path(&self) -> &PathBuf {
        &self.path
    }

    pub fn init(&self) -> Result<()> {
        let conn = self.lock()?;
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS subscribers (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                email TEXT NOT NULL UNIQUE,
                unsubscribe_token TEXT NOT NULL UNIQUE,
                preference TEXT NOT NULL DEFAULT 'both' CHECK (preference IN ('internship', 'fulltime', 'both')),
                active INTEGER NOT NULL DEFAULT 1,
                confirmed INTEGER NOT NULL DEFAULT 0,
                subscribed_at TEXT NOT NULL DEFAULT (datetime('now'))
            );

            CREATE TABLE IF NOT EXISTS stats_snapshots (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                recorded_at TEXT NOT NULL DEFAULT (datetime('now')),
                jobs_on_board INTEGER NOT NULL,
                new_jobs_found INTEGER NOT NULL,
                active_subscribers INTEGER NOT NULL,
                total_jobs_ever INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_subscribers_active ON subscribers(active, confirmed);
            "#,
        )
        .context("Failed to apply database schema")?;
        Ok(())
    }

    /// Runs `f` inside one `BEGIN IMMEDIATE` transaction; commits on `Ok`.
    ///
    /// Taking the write lock up front makes read-check-then-write sequences
    /// atomic against other processes sharing the file.
    pub fn with_tx<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Transaction) -> Result<T>,
    {
        let mut conn = self.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let value = f(&tx)?;
        tx.commit()?;
        Ok(value)
    }

    pub fn with_conn<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> Result<T>,
    {
        let conn = self.lock()?;
        f(&conn)
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| anyhow!("Database connection lock poisoned"))
    }
}
