use crate::db::Db;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::params;

/// One downloaded bounce notification, immutable once created.
#[derive(Debug, Clone)]
pub struct Bounce {
    pub id: i64,
    pub header: String,
    pub data: String,
    pub created: String,
}

/// One row of the classification batch: a bounce joined with its
/// outbound-message/subscriber linkage.
#[derive(Debug, Clone)]
pub struct BounceBatchRow {
    pub link_id: i64,
    pub user_id: i64,
    pub message_id: i64,
    pub bounce: Bounce,
}

#[derive(Clone)]
pub struct BounceStore {
    db: Db,
}

impl BounceStore {
    pub fn new(db: Db) -> Self {
        BounceStore { db }
    }

    pub fn insert(&self, header: &str, data: &str, created: DateTime<Utc>) -> Result<i64> {
        self.db
            .execute(
                "INSERT INTO bounce (header, data, created) VALUES (?, ?, ?)",
                params![header, data, created.to_rfc3339()],
            )
            .context("Failed to insert bounce")?;
        Ok(self.db.last_insert_rowid())
    }

    /// Record the outbound message/subscriber pairing a bounce originated from.
    pub fn link_to_message(&self, bounce_id: i64, user_id: i64, message_id: i64) -> Result<i64> {
        self.db.execute(
            "INSERT INTO bounce_link (bounce_id, user_id, message_id) VALUES (?, ?, ?)",
            params![bounce_id, user_id, message_id],
        )?;
        Ok(self.db.last_insert_rowid())
    }

    /// Linked bounces that no rule has matched yet.
    pub fn count_unclassified(&self) -> Result<u64> {
        let count: i64 = self.db.query_row(
            "SELECT COUNT(*) FROM bounce_link bl
             WHERE NOT EXISTS (SELECT 1 FROM rule_match rm WHERE rm.bounce_id = bl.bounce_id)",
            [],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }

    /// Fetch up to `batch_size` unclassified rows strictly after `from_link_id`,
    /// ordered by ascending link id. An empty batch means the caller is done.
    pub fn fetch_batch(&self, from_link_id: i64, batch_size: usize) -> Result<Vec<BounceBatchRow>> {
        let mut stmt = self.db.prepare(
            "SELECT bl.id, bl.user_id, bl.message_id, b.id, b.header, b.data, b.created
             FROM bounce_link bl
             JOIN bounce b ON b.id = bl.bounce_id
             WHERE bl.id > ?
               AND NOT EXISTS (SELECT 1 FROM rule_match rm WHERE rm.bounce_id = bl.bounce_id)
             ORDER BY bl.id ASC
             LIMIT ?",
        )?;
        let rows = stmt
            .query_map(params![from_link_id, batch_size as i64], |row| {
                Ok(BounceBatchRow {
                    link_id: row.get(0)?,
                    user_id: row.get(1)?,
                    message_id: row.get(2)?,
                    bounce: Bounce {
                        id: row.get(3)?,
                        header: row.get(4)?,
                        data: row.get(5)?,
                        created: row.get(6)?,
                    },
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn find(&self, bounce_id: i64) -> Result<Option<Bounce>> {
        use rusqlite::OptionalExtension;
        let bounce = self
            .db
            .query_row(
                "SELECT id, header, data, created FROM bounce WHERE id = ?",
                params![bounce_id],
                |row| {
                    Ok(Bounce {
                        id: row.get(0)?,
                        header: row.get(1)?,
                        data: row.get(2)?,
                        created: row.get(3)?,
                    })
                },
            )
            .optional()?;
        Ok(bounce)
    }

    /// Remove a fully resolved bounce along with its linkage rows.
    pub fn delete(&self, bounce_id: i64) -> Result<()> {
        self.db
            .execute("DELETE FROM bounce WHERE id = ?", params![bounce_id])?;
        self.db
            .execute("DELETE FROM bounce_link WHERE bounce_id = ?", params![bounce_id])?;
        self.db
            .execute("DELETE FROM rule_match WHERE bounce_id = ?", params![bounce_id])?;
        Ok(())
    }

    /// Bounces no rule ever matched, including ones that never got a linkage.
    pub fn unmatched_bounces(&self) -> Result<Vec<Bounce>> {
        let mut stmt = self.db.prepare(
            "SELECT id, header, data, created FROM bounce b
             WHERE NOT EXISTS (SELECT 1 FROM rule_match rm WHERE rm.bounce_id = b.id)
             ORDER BY id ASC",
        )?;
        let rows = stmt
            .query_map([], |row| {
                Ok(Bounce {
                    id: row.get(0)?,
                    header: row.get(1)?,
                    data: row.get(2)?,
                    created: row.get(3)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Delete every bounce that could not be classified at all. Returns the
    /// number of bounces removed.
    pub fn purge_unmatched(&self) -> Result<u64> {
        let removed = self.db.execute(
            "DELETE FROM bounce
             WHERE NOT EXISTS (SELECT 1 FROM rule_match rm WHERE rm.bounce_id = bounce.id)",
            [],
        )?;
        self.db.execute(
            "DELETE FROM bounce_link
             WHERE NOT EXISTS (SELECT 1 FROM bounce b WHERE b.id = bounce_link.bounce_id)",
            [],
        )?;
        Ok(removed as u64)
    }

    pub fn has_link(&self, bounce_id: i64) -> Result<bool> {
        let count: i64 = self.db.query_row(
            "SELECT COUNT(*) FROM bounce_link WHERE bounce_id = ?",
            params![bounce_id],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }
}
