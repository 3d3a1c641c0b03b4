use anyhow::Result;
use rusqlite::{params, OptionalExtension};
use std::sync::Arc;
use tracing::{error, info};

use crate::db::Database;
use crate::models::StatsEntry;

pub const DEFAULT_HISTORY_LIMIT: usize = 500;

/// Append-only per-run statistics. Observability only: a failed write never
/// fails the run.
pub trait StatsLedger: Send + Sync {
    fn record(&self, jobs_on_board: usize, new_jobs_found: usize, active_subscribers: usize) -> bool;

    /// Most recent entries first.
    fn history(&self, limit: usize) -> Result<Vec<StatsEntry>>;
}

pub struct SqliteStatsLedger {
    db: Arc<Database>,
}

impl SqliteStatsLedger {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    fn try_record(&self, jobs_on_board: i64, new_jobs_found: i64, active_subscribers: i64) -> Result<i64> {
        self.db.with_tx(|tx| {
            let previous: Option<i64> = tx
                .query_row(
                    "SELECT total_jobs_ever FROM stats_snapshots ORDER BY id DESC LIMIT 1",
                    [],
                    |row| row.get(0),
                )
                .optional()?;

            let total_jobs_ever = match previous {
                Some(total) => total + new_jobs_found,
                // First entry seeds from the current board.
                None => jobs_on_board,
            };

            tx.execute(
                "INSERT INTO stats_snapshots (jobs_on_board, new_jobs_found, active_subscribers, total_jobs_ever)
                 VALUES (?1, ?2, ?3, ?4)",
                params![jobs_on_board, new_jobs_found, active_subscribers, total_jobs_ever],
            )?;
            Ok(total_jobs_ever)
        })
    }
}

impl StatsLedger for SqliteStatsLedger {
    fn record(&self, jobs_on_board: usize, new_jobs_found: usize, active_subscribers: usize) -> bool {
        match self.try_record(jobs_on_board as i64, new_jobs_found as i64, active_subscribers as i64) {
            Ok(total_jobs_ever) => {
                info!(
                    "Stats snapshot recorded: board={} new={} subs={} total_ever={}",
                    jobs_on_board, new_jobs_found, active_subscribers, total_jobs_ever
                );
                true
            }
            Err(e) => {
                error!("Failed to record stats snapshot: {:#}", e);
                false
            }
        }
    }

    fn history(&self, limit: usize) -> Result<Vec<StatsEntry>> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, recorded_at, jobs_on_board, new_jobs_found, active_subscribers, total_jobs_ever
                 FROM stats_snapshots ORDER BY id DESC LIMIT ?1",
            )?;
            let rows = stmt.query_map([limit as i64], |row| {
                Ok(StatsEntry {
                    id: row.get(0)?,
                    recorded_at: row.get(1)?,
                    jobs_on_board: row.get(2)?,
                    new_jobs_found: row.get(3)?,
                    active_subscribers: row.get(4)?,
                    total_jobs_ever: row.get(5)?,
                })
            })?;
            Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
        })
    }
}
