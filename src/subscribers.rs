//! Subscriber lifecycle: pending, active (confirmed), inactive.

use anyhow::{anyhow, Result};
use regex::Regex;
use rusqlite::{params, OptionalExtension};
use std::sync::Arc;
use tracing::{error, info};
use uuid::Uuid;

use crate::db::Database;
use crate::models::{AddOutcome, Preference, Subscriber};

pub const MSG_ALREADY_SUBSCRIBED: &str = "Already subscribed!";
pub const MSG_CHECK_EMAIL: &str = "Check your email to confirm your subscription.";
pub const MSG_SUBSCRIBE_FAILED: &str = "Failed to subscribe. Please try again.";

/// Storage contract shared by the pipeline (read side) and the web layer.
pub trait SubscriberStore: Send + Sync {
    /// Subscribe or re-subscribe. Never errors; storage failures come back
    /// as `ok == false`.
    fn add(&self, email: &str, preference: Preference) -> AddOutcome;

    /// Marks the pending subscriber holding `token` as confirmed.
    fn confirm(&self, token: &str) -> Result<bool>;

    /// Deactivates the active subscriber holding `token`. `Ok(false)` when the
    /// token is unknown or already removed.
    fn remove(&self, token: &str) -> Result<bool>;

    fn list_active_confirmed(&self) -> Result<Vec<Subscriber>>;

    fn count_active_confirmed(&self) -> Result<usize> {
        Ok(self.list_active_confirmed()?.len())
    }

    /// Admin hard delete.
    fn delete_by_email(&self, email: &str) -> Result<bool>;
}

/// Trims and lowercases, then checks the address shape.
pub fn validate_email(raw: &str) -> Result<String> {
    let email = raw.trim().to_lowercase();
    if email.is_empty() {
        return Err(anyhow!("Email is required"));
    }
    let re = Regex::new(r"^[^@\s]+@[^@\s]+\.[^@\s]+$")?;
    if !re.is_match(&email) {
        return Err(anyhow!("Invalid email address"));
    }
    Ok(email)
}

fn new_token() -> String {
    Uuid::new_v4().to_string()
}

#[derive(Clone)]
pub struct SqliteSubscriberStore {
    db: Arc<Database>,
}

impl SqliteSubscriberStore {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    fn try_add(&self, email: &str, preference: Preference) -> Result<AddOutcome> {
        let email = email.trim().to_lowercase();
        let token = new_token();

        self.db.with_tx(|tx| {
            let existing: Option<(bool, bool)> = tx
                .query_row(
                    "SELECT active, confirmed FROM subscribers WHERE email = ?1",
                    [&email],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .optional()?;

            match existing {
                Some((true, true)) => {
                    return Ok(AddOutcome {
                        ok: true,
                        message: MSG_ALREADY_SUBSCRIBED.to_string(),
                        token: None,
                        needs_confirm: false,
                    });
                }
                Some((true, false)) => {
                    // Pending: reissue the token so only the latest link confirms.
                    tx.execute(
                        "UPDATE subscribers SET unsubscribe_token = ?1, preference = ?2 WHERE email = ?3",
                        params![token, preference.as_str(), email],
                    )?;
                }
                Some((false, _)) => {
                    tx.execute(
                        "UPDATE subscribers
                         SET active = 1, confirmed = 0, unsubscribe_token = ?1, preference = ?2,
                             subscribed_at = datetime('now')
                         WHERE email = ?3",
                        params![token, preference.as_str(), email],
                    )?;
                }
                None => {
                    tx.execute(
                        "INSERT INTO subscribers (email, unsubscribe_token, preference, active, confirmed)
                         VALUES (?1, ?2, ?3, 1, 0)",
                        params![email, token, preference.as_str()],
                    )?;
                }
            }

            Ok(AddOutcome {
                ok: true,
                message: MSG_CHECK_EMAIL.to_string(),
                token: Some(token.clone()),
                needs_confirm: true,
            })
        })
    }

    fn row_to_subscriber(row: &rusqlite::Row) -> rusqlite::Result<Subscriber> {
        let preference: Option<String> = row.get(2)?;
        Ok(Subscriber {
            email: row.get(0)?,
            unsubscribe_token: row.get(1)?,
            preference: Preference::from_stored(preference.as_deref()),
            active: row.get(3)?,
            confirmed: row.get(4)?,
            subscribed_at: row.get(5)?,
        })
    }
}

impl SubscriberStore for SqliteSubscriberStore {
    fn add(&self, email: &str, preference: Preference) -> AddOutcome {
        match self.try_add(email, preference) {
            Ok(outcome) => {
                if outcome.needs_confirm {
                    info!("Subscriber {} pending confirmation ({})", email, preference.as_str());
                }
                outcome
            }
            Err(e) => {
                error!("Failed to add subscriber {}: {:#}", email, e);
                AddOutcome {
                    ok: false,
                    message: MSG_SUBSCRIBE_FAILED.to_string(),
                    token: None,
                    needs_confirm: false,
                }
            }
        }
    }

    fn confirm(&self, token: &str) -> Result<bool> {
        self.db.with_tx(|tx| {
            let updated = tx.execute(
                "UPDATE subscribers SET confirmed = 1
                 WHERE unsubscribe_token = ?1 AND active = 1 AND confirmed = 0",
                [token],
            )?;
            Ok(updated > 0)
        })
    }

    fn remove(&self, token: &str) -> Result<bool> {
        self.db.with_tx(|tx| {
            let updated = tx.execute(
                "UPDATE subscribers SET active = 0 WHERE unsubscribe_token = ?1 AND active = 1",
                [token],
            )?;
            Ok(updated > 0)
        })
    }

    fn list_active_confirmed(&self) -> Result<Vec<Subscriber>> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT email, unsubscribe_token, preference, active, confirmed, subscribed_at
                 FROM subscribers WHERE active = 1 AND confirmed = 1 ORDER BY id",
            )?;
            let rows = stmt.query_map([], Self::row_to_subscriber)?;
            Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
        })
    }

    fn count_active_confirmed(&self) -> Result<usize> {
        self.db.with_conn(|conn| {
            let count: i64 = conn.query_row(
                "SELECT COUNT(*) FROM subscribers WHERE active = 1 AND confirmed = 1",
                [],
                |row| row.get(0),
            )?;
            Ok(count as usize)
        })
    }

    fn delete_by_email(&self, email: &str) -> Result<bool> {
        let email = email.trim().to_lowercase();
        self.db.with_tx(|tx| {
            let deleted = tx.execute("DELETE FROM subscribers WHERE email = ?1", [&email])?;
            Ok(deleted > 0)
        })
    }
}
