use crate::db::Db;
use anyhow::{Context, Result};
use chrono::Utc;
use rusqlite::{params, OptionalExtension};

/// Named mutual-exclusion lock backed by the `process_lock` table.
///
/// At most one live handle exists per name. A lock row whose recorded pid is
/// no longer alive is treated as stale and reclaimed with a warning, so a
/// crashed run does not require `force` to recover from.
///
/// Forced takeover is an operator escape hatch, not a safe operation: it
/// SIGTERMs the recorded holder and steals the row without any proof that the
/// other run was quiescent.
pub struct LockService {
    db: Db,
}

/// Handle for a successfully acquired lock. Released explicitly via
/// [`LockGuard::release`] or implicitly on drop, whichever comes first, so
/// the lock is freed even when an error unwinds out of the run.
pub struct LockGuard {
    db: Db,
    name: String,
    pid: u32,
    released: bool,
}

impl LockService {
    pub fn new(db: Db) -> Self {
        LockService { db }
    }

    /// Try to acquire `name`. Returns `Ok(None)` when another run holds the
    /// lock (and, with `force`, when the takeover itself failed); lock
    /// contention is expected and not an error.
    pub fn acquire(&self, name: &str, force: bool) -> Result<Option<LockGuard>> {
        let own_pid = std::process::id();
        let now = Utc::now().to_rfc3339();

        let inserted = self
            .db
            .execute(
                "INSERT OR IGNORE INTO process_lock (name, pid, started) VALUES (?, ?, ?)",
                params![name, own_pid, now],
            )
            .with_context(|| format!("Failed to acquire lock '{name}'"))?;
        if inserted == 1 {
            log::debug!("Acquired lock '{name}' (pid {own_pid})");
            return Ok(Some(self.guard(name, own_pid)));
        }

        let holder: Option<i64> = self
            .db
            .query_row(
                "SELECT pid FROM process_lock WHERE name = ?",
                params![name],
                |row| row.get(0),
            )
            .optional()?;
        let holder = match holder {
            Some(pid) => pid,
            // Row vanished between the insert and the read; retry once.
            None => return self.acquire(name, force),
        };

        if !pid_alive(holder) {
            log::warn!("Reclaiming stale lock '{name}' held by dead pid {holder}");
            self.take_over(name, own_pid)?;
            return Ok(Some(self.guard(name, own_pid)));
        }

        if force {
            log::warn!("Forcing takeover of lock '{name}' held by pid {holder}");
            if !terminate(holder) {
                log::error!("Failed to terminate lock holder pid {holder}");
                return Ok(None);
            }
            self.take_over(name, own_pid)?;
            return Ok(Some(self.guard(name, own_pid)));
        }

        log::info!("Lock '{name}' is held by pid {holder}");
        Ok(None)
    }

    fn take_over(&self, name: &str, own_pid: u32) -> Result<()> {
        self.db.execute(
            "UPDATE process_lock SET pid = ?, started = ? WHERE name = ?",
            params![own_pid, Utc::now().to_rfc3339(), name],
        )?;
        Ok(())
    }

    fn guard(&self, name: &str, pid: u32) -> LockGuard {
        LockGuard {
            db: self.db.clone(),
            name: name.to_string(),
            pid,
            released: false,
        }
    }
}

impl LockGuard {
    /// Release the lock. Safe to call at most once; the drop path is a no-op
    /// afterwards.
    pub fn release(mut self) {
        self.do_release();
    }

    fn do_release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        let result = self.db.execute(
            "DELETE FROM process_lock WHERE name = ? AND pid = ?",
            params![self.name, self.pid],
        );
        match result {
            Ok(_) => log::debug!("Released lock '{}'", self.name),
            Err(e) => log::error!("Failed to release lock '{}': {e}", self.name),
        }
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        self.do_release();
    }
}

#[cfg(unix)]
fn pid_alive(pid: i64) -> bool {
    if pid <= 0 {
        return false;
    }
    // Signal 0 probes for existence without delivering anything.
    unsafe { libc::kill(pid as libc::pid_t, 0) == 0 }
}

#[cfg(not(unix))]
fn pid_alive(_pid: i64) -> bool {
    // No cheap liveness probe; assume the holder is alive.
    true
}

#[cfg(unix)]
fn terminate(pid: i64) -> bool {
    if pid <= 0 {
        return false;
    }
    unsafe { libc::kill(pid as libc::pid_t, libc::SIGTERM) == 0 }
}

#[cfg(not(unix))]
fn terminate(_pid: i64) -> bool {
    false
}
