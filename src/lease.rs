use anyhow::Result;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, warn};

use crate::db::Database;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaseMode {
    /// Ingestion. Any number of shared holders may run together.
    Shared,
    /// Maintenance that rewrites job ownership or status.
    Exclusive,
}

impl LeaseMode {
    pub fn as_str(self) -> &'static str {
        match self {
            LeaseMode::Shared => "shared",
            LeaseMode::Exclusive => "exclusive",
        }
    }
}

impl fmt::Display for LeaseMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

#[derive(Debug, Error)]
pub enum LeaseError {
    #[error("user #{user_id} is busy: another sweep is running (wanted {mode} access)")]
    Busy { user_id: i64, mode: LeaseMode },
}

#[derive(Debug, Clone)]
pub struct LeaseConfig {
    /// How long to wait for a conflicting lease to go away.
    pub wait: Duration,
    pub poll: Duration,
    /// Leases not renewed for this long are treated as left by a dead process.
    pub stale_after: Duration,
}

impl Default for LeaseConfig {
    fn default() -> Self {
        Self {
            wait: Duration::from_secs(60),
            poll: Duration::from_millis(250),
            stale_after: Duration::from_secs(600),
        }
    }
}

/// Per-user sweep locks stored in the database, so every process working on
/// the same data directory sees them. Crawls hold shared leases; the
/// cleaning sweep and rule changes hold an exclusive one.
#[derive(Debug, Clone, Default)]
pub struct UserLocks {
    config: LeaseConfig,
}

static NEXT_HOLDER: AtomicU64 = AtomicU64::new(0);

fn next_holder() -> String {
    format!("{}-{}", std::process::id(), NEXT_HOLDER.fetch_add(1, Ordering::Relaxed))
}

impl UserLocks {
    pub fn new(config: LeaseConfig) -> Self {
        Self { config }
    }

    pub fn shared<'a>(&self, db: &'a Database, user_id: i64) -> Result<Lease<'a>> {
        self.acquire(db, user_id, LeaseMode::Shared)
    }

    pub fn exclusive<'a>(&self, db: &'a Database, user_id: i64) -> Result<Lease<'a>> {
        self.acquire(db, user_id, LeaseMode::Exclusive)
    }

    fn acquire<'a>(&self, db: &'a Database, user_id: i64, mode: LeaseMode) -> Result<Lease<'a>> {
        let holder = next_holder();
        let deadline = Instant::now() + self.config.wait;
        loop {
            if db.try_acquire_lease(user_id, &holder, mode, self.config.stale_after)? {
                debug!(user_id, holder = %holder, mode = %mode, "acquired sweep lease");
                return Ok(Lease {
                    db,
                    user_id,
                    holder,
                    mode,
                });
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(LeaseError::Busy { user_id, mode }.into());
            }
            thread::sleep(self.config.poll.min(deadline - now));
        }
    }
}

/// A held sweep lease. Released when dropped.
pub struct Lease<'a> {
    db: &'a Database,
    user_id: i64,
    holder: String,
    mode: LeaseMode,
}

impl Lease<'_> {
    /// Mark the lease as still in use. Long sweeps call this as they go.
    pub fn renew(&self) -> Result<()> {
        if !self.db.renew_lease(self.user_id, &self.holder)? {
            warn!(user_id = self.user_id, holder = %self.holder, "sweep lease expired while held");
        }
        Ok(())
    }
}

impl Drop for Lease<'_> {
    fn drop(&mut self) {
        match self.db.release_lease(self.user_id, &self.holder) {
            Ok(()) => debug!(user_id = self.user_id, holder = %self.holder, mode = %self.mode, "released sweep lease"),
            Err(e) => warn!(user_id = self.user_id, holder = %self.holder, error = %e, "failed to release sweep lease"),
        }
    }
}
