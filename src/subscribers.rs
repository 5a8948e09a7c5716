use crate::db::Db;
use anyhow::{Context, Result};
use chrono::Utc;
use rusqlite::{params, OptionalExtension};

#[derive(Debug, Clone)]
pub struct Subscriber {
    pub id: i64,
    pub email: String,
    pub confirmed: bool,
    pub blacklisted: bool,
    pub disabled: bool,
    pub bounce_count: i64,
}

/// Subscriber, audit-history and blacklist state. Nothing here ever clears
/// the `blacklisted` flag; blacklisted subscribers stay blacklisted.
#[derive(Clone)]
pub struct SubscriberStore {
    db: Db,
}

fn map_subscriber(row: &rusqlite::Row<'_>) -> rusqlite::Result<Subscriber> {
    Ok(Subscriber {
        id: row.get(0)?,
        email: row.get(1)?,
        confirmed: row.get::<_, i64>(2)? != 0,
        blacklisted: row.get::<_, i64>(3)? != 0,
        disabled: row.get::<_, i64>(4)? != 0,
        bounce_count: row.get(5)?,
    })
}

const SUBSCRIBER_COLUMNS: &str = "id, email, confirmed, blacklisted, disabled, bounce_count";

impl SubscriberStore {
    pub fn new(db: Db) -> Self {
        SubscriberStore { db }
    }

    pub fn insert(&self, email: &str, confirmed: bool) -> Result<i64> {
        self.db
            .execute(
                "INSERT INTO subscriber (email, confirmed) VALUES (?, ?)",
                params![email, confirmed as i64],
            )
            .with_context(|| format!("Failed to insert subscriber {email}"))?;
        Ok(self.db.last_insert_rowid())
    }

    pub fn find(&self, id: i64) -> Result<Option<Subscriber>> {
        let subscriber = self
            .db
            .query_row(
                &format!("SELECT {SUBSCRIBER_COLUMNS} FROM subscriber WHERE id = ?"),
                params![id],
                map_subscriber,
            )
            .optional()?;
        Ok(subscriber)
    }

    pub fn find_by_email(&self, email: &str) -> Result<Option<Subscriber>> {
        let subscriber = self
            .db
            .query_row(
                &format!("SELECT {SUBSCRIBER_COLUMNS} FROM subscriber WHERE email = ?"),
                params![email],
                map_subscriber,
            )
            .optional()?;
        Ok(subscriber)
    }

    /// Add an email to the blacklist table with the given reason and flag the
    /// matching subscriber row, if any.
    pub fn blacklist_email(&self, email: &str, reason: &str) -> Result<()> {
        self.db.execute(
            "INSERT OR IGNORE INTO blacklist (email, reason, added) VALUES (?, ?, ?)",
            params![email, reason, Utc::now().to_rfc3339()],
        )?;
        self.db.execute(
            "UPDATE subscriber SET blacklisted = 1 WHERE email = ?",
            params![email],
        )?;
        Ok(())
    }

    pub fn set_blacklisted(&self, id: i64) -> Result<()> {
        self.db
            .execute("UPDATE subscriber SET blacklisted = 1 WHERE id = ?", params![id])?;
        Ok(())
    }

    pub fn set_confirmed(&self, id: i64) -> Result<()> {
        self.db
            .execute("UPDATE subscriber SET confirmed = 1 WHERE id = ?", params![id])?;
        Ok(())
    }

    pub fn set_unconfirmed(&self, id: i64) -> Result<()> {
        self.db
            .execute("UPDATE subscriber SET confirmed = 0 WHERE id = ?", params![id])?;
        Ok(())
    }

    pub fn increment_bounce_count(&self, id: i64) -> Result<()> {
        self.db.execute(
            "UPDATE subscriber SET bounce_count = bounce_count + 1 WHERE id = ?",
            params![id],
        )?;
        Ok(())
    }

    pub fn decrement_bounce_count(&self, id: i64) -> Result<()> {
        self.db.execute(
            "UPDATE subscriber SET bounce_count = MAX(bounce_count - 1, 0) WHERE id = ?",
            params![id],
        )?;
        Ok(())
    }

    pub fn delete(&self, id: i64) -> Result<()> {
        self.db
            .execute("DELETE FROM subscriber WHERE id = ?", params![id])?;
        self.db
            .execute("DELETE FROM subscriber_history WHERE subscriber_id = ?", params![id])?;
        Ok(())
    }

    pub fn add_history(&self, id: i64, summary: &str, detail: &str) -> Result<()> {
        self.db.execute(
            "INSERT INTO subscriber_history (subscriber_id, summary, detail, created)
             VALUES (?, ?, ?, ?)",
            params![id, summary, detail, Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    pub fn history_count(&self, id: i64) -> Result<u64> {
        let count: i64 = self.db.query_row(
            "SELECT COUNT(*) FROM subscriber_history WHERE subscriber_id = ?",
            params![id],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }

    pub fn is_blacklisted_email(&self, email: &str) -> Result<bool> {
        let count: i64 = self.db.query_row(
            "SELECT COUNT(*) FROM blacklist WHERE email = ?",
            params![email],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    /// Confirmed, non-blacklisted subscribers whose bounce count has reached
    /// the consecutive-bounce threshold.
    pub fn over_bounce_threshold(&self, threshold: u32) -> Result<Vec<Subscriber>> {
        let mut stmt = self.db.prepare(&format!(
            "SELECT {SUBSCRIBER_COLUMNS} FROM subscriber
             WHERE bounce_count >= ? AND confirmed = 1 AND blacklisted = 0
             ORDER BY id ASC"
        ))?;
        let rows = stmt
            .query_map(params![threshold], map_subscriber)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }
}
