use anyhow::{anyhow, Context, Result};
use rusqlite::{params, Connection, OptionalExtension, Row, TransactionBehavior};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use crate::identity::fuzzy_key;
use crate::lease::LeaseMode;
use crate::models::{BlacklistRule, Job, Listing, ListingKey, Location, PageCount, RuleKind, SearchQuery, User};
use crate::sources::Site;
use crate::status::{Action, JobStatus, TransitionError};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS users (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    username TEXT NOT NULL UNIQUE
);

CREATE TABLE IF NOT EXISTS jobs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    user_id INTEGER NOT NULL REFERENCES users(id),
    title TEXT NOT NULL,
    company TEXT NOT NULL,
    fuzzy_key TEXT NOT NULL,
    status TEXT NOT NULL DEFAULT 'new' CHECK (status IN (
        'new', 'blacklist', 'easy_filter', 'interested', 'not_interested',
        'liked', 'applied', 'complete'
    )),
    created_at TEXT NOT NULL DEFAULT (datetime('now')),
    updated_at TEXT NOT NULL DEFAULT (datetime('now')),
    UNIQUE (user_id, fuzzy_key)
);

CREATE TABLE IF NOT EXISTS listings (
    id TEXT NOT NULL,
    site TEXT NOT NULL,
    job_id INTEGER NOT NULL REFERENCES jobs(id),
    summary TEXT NOT NULL DEFAULT '',
    first_seen TEXT NOT NULL DEFAULT (datetime('now')),
    PRIMARY KEY (id, site)
);

CREATE TABLE IF NOT EXISTS page_counts (
    site TEXT NOT NULL,
    query TEXT NOT NULL,
    pages INTEGER NOT NULL DEFAULT 1,
    PRIMARY KEY (site, query)
);

CREATE TABLE IF NOT EXISTS blacklist_rules (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    user_id INTEGER NOT NULL REFERENCES users(id),
    term TEXT NOT NULL,
    kind TEXT NOT NULL CHECK (kind IN ('title', 'company'))
);

CREATE TABLE IF NOT EXISTS search_queries (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    user_id INTEGER NOT NULL REFERENCES users(id),
    term TEXT NOT NULL,
    remote INTEGER NOT NULL DEFAULT 0,
    location TEXT
);

CREATE TABLE IF NOT EXISTS search_query_sites (
    query_id INTEGER NOT NULL REFERENCES search_queries(id) ON DELETE CASCADE,
    site TEXT NOT NULL,
    PRIMARY KEY (query_id, site)
);

CREATE TABLE IF NOT EXISTS sweep_locks (
    user_id INTEGER NOT NULL REFERENCES users(id),
    holder TEXT NOT NULL,
    mode TEXT NOT NULL CHECK (mode IN ('shared', 'exclusive')),
    acquired_at TEXT NOT NULL DEFAULT (datetime('now')),
    renewed_at TEXT NOT NULL DEFAULT (datetime('now')),
    PRIMARY KEY (user_id, holder)
);

CREATE INDEX IF NOT EXISTS idx_jobs_user_status ON jobs(user_id, status);
CREATE INDEX IF NOT EXISTS idx_listings_job ON listings(job_id);
CREATE INDEX IF NOT EXISTS idx_rules_user ON blacklist_rules(user_id);
"#;

const JOB_COLUMNS: &str =
    "id, user_id, title, company, fuzzy_key, status, created_at, updated_at";

/// Shared handle to the job store. The connection sits behind a mutex so
/// crawl threads can share one `Database`.
pub struct Database {
    conn: Mutex<Connection>,
    path: Option<PathBuf>,
}

impl Database {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open database at {}", path.display()))?;
        conn.busy_timeout(Duration::from_secs(10))?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        Ok(Self {
            conn: Mutex::new(conn),
            path: Some(path.to_path_buf()),
        })
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        let db = Self {
            conn: Mutex::new(conn),
            path: None,
        };
        db.init()?;
        Ok(db)
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| anyhow!("database connection lock poisoned"))
    }

    pub fn init(&self) -> Result<()> {
        self.conn()?.execute_batch(SCHEMA)?;
        Ok(())
    }

    pub fn ensure_initialized(&self) -> Result<()> {
        let tables: i64 = self.conn()?.query_row(
            "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name='jobs'",
            [],
            |row| row.get(0),
        )?;
        if tables == 0 {
            return Err(anyhow!("Database not initialized. Run 'jobsweep init' first."));
        }
        Ok(())
    }

    // --- User operations ---

    pub fn get_or_create_user(&self, username: &str) -> Result<User> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO users (username) VALUES (?1) ON CONFLICT(username) DO NOTHING",
            [username],
        )?;
        let id = conn.query_row(
            "SELECT id FROM users WHERE username = ?1",
            [username],
            |row| row.get(0),
        )?;
        Ok(User {
            id,
            username: username.to_string(),
        })
    }

    // --- Sweep leases ---

    /// Record a lease for `holder` unless a live lease of another holder
    /// conflicts with `mode`. Leases not renewed within `stale_after` are
    /// dropped first.
    pub fn try_acquire_lease(
        &self,
        user_id: i64,
        holder: &str,
        mode: LeaseMode,
        stale_after: Duration,
    ) -> Result<bool> {
        let mut conn = self.conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        tx.execute(
            "DELETE FROM sweep_locks WHERE renewed_at < datetime('now', ?1)",
            [format!("-{} seconds", stale_after.as_secs())],
        )?;
        let conflicts: i64 = tx.query_row(
            "SELECT COUNT(*) FROM sweep_locks
             WHERE user_id = ?1 AND holder != ?2 AND (?3 = 'exclusive' OR mode = 'exclusive')",
            params![user_id, holder, mode.as_str()],
            |row| row.get(0),
        )?;
        let acquired = conflicts == 0;
        if acquired {
            tx.execute(
                "INSERT INTO sweep_locks (user_id, holder, mode) VALUES (?1, ?2, ?3)
                 ON CONFLICT(user_id, holder) DO UPDATE SET mode = excluded.mode, renewed_at = datetime('now')",
                params![user_id, holder, mode.as_str()],
            )?;
        }
        tx.commit()?;
        Ok(acquired)
    }

    /// False when the lease is gone, e.g. reclaimed as stale.
    pub fn renew_lease(&self, user_id: i64, holder: &str) -> Result<bool> {
        let updated = self.conn()?.execute(
            "UPDATE sweep_locks SET renewed_at = datetime('now') WHERE user_id = ?1 AND holder = ?2",
            params![user_id, holder],
        )?;
        Ok(updated == 1)
    }

    pub fn release_lease(&self, user_id: i64, holder: &str) -> Result<()> {
        self.conn()?.execute(
            "DELETE FROM sweep_locks WHERE user_id = ?1 AND holder = ?2",
            params![user_id, holder],
        )?;
        Ok(())
    }

    // --- Job operations ---

    pub fn find_job_by_key(&self, user_id: i64, key: &str) -> Result<Option<i64>> {
        let id = self
            .conn()?
            .query_row(
                "SELECT id FROM jobs WHERE user_id = ?1 AND fuzzy_key = ?2",
                params![user_id, key],
                |row| row.get(0),
            )
            .optional()?;
        Ok(id)
    }

    /// Attach to the user's job with the same fuzzy key, or create it.
    /// Returns the job and whether this call created it. A concurrent
    /// writer that wins the insert is picked up by the re-select.
    pub fn resolve_or_create_job(&self, user_id: i64, title: &str, company: &str) -> Result<(Job, bool)> {
        let key = fuzzy_key(title, company);
        let conn = self.conn()?;

        let inserted = conn.execute(
            "INSERT INTO jobs (user_id, title, company, fuzzy_key) VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(user_id, fuzzy_key) DO NOTHING",
            params![user_id, title, company, key],
        )?;

        let job = conn.query_row(
            &format!("SELECT {JOB_COLUMNS} FROM jobs WHERE user_id = ?1 AND fuzzy_key = ?2"),
            params![user_id, key],
            Self::row_to_job,
        )?;
        Ok((job, inserted == 1))
    }

    pub fn get_job(&self, id: i64) -> Result<Option<Job>> {
        let job = self
            .conn()?
            .query_row(
                &format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = ?1"),
                [id],
                Self::row_to_job,
            )
            .optional()?;
        Ok(job)
    }

    /// Jobs for a user, newest first. `complete` jobs are hidden unless
    /// asked for by status or `include_complete`.
    pub fn list_jobs(&self, user_id: i64, status: Option<JobStatus>, include_complete: bool) -> Result<Vec<Job>> {
        let conn = self.conn()?;
        let rows = match status {
            Some(status) => {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {JOB_COLUMNS} FROM jobs WHERE user_id = ?1 AND status = ?2
                     ORDER BY created_at DESC, id DESC"
                ))?;
                stmt.query_map(params![user_id, status.as_str()], Self::row_to_job)?
                    .collect::<Result<Vec<_>, _>>()
            }
            None => {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {JOB_COLUMNS} FROM jobs WHERE user_id = ?1 AND (?2 OR status != 'complete')
                     ORDER BY created_at DESC, id DESC"
                ))?;
                stmt.query_map(params![user_id, include_complete], Self::row_to_job)?
                    .collect::<Result<Vec<_>, _>>()
            }
        };
        rows.context("Failed to list jobs")
    }

    pub fn stage_counts(&self, user_id: i64) -> Result<Vec<(JobStatus, i64)>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT status, COUNT(*) FROM jobs WHERE user_id = ?1 GROUP BY status",
        )?;
        let rows = stmt.query_map([user_id], |row| Ok((parse_column(row, 0)?, row.get(1)?)))?;
        let mut counts = rows
            .collect::<Result<Vec<(JobStatus, i64)>, _>>()
            .context("Failed to count jobs")?;
        counts.sort_by_key(|(status, _)| *status);
        Ok(counts)
    }

    /// The only way a job's status changes outside of a merge. Illegal
    /// requests come back as a `TransitionError` and leave the row alone.
    pub fn transition(&self, job_id: i64, action: Action) -> Result<JobStatus> {
        let conn = self.conn()?;
        let current: Option<JobStatus> = conn
            .query_row("SELECT status FROM jobs WHERE id = ?1", [job_id], |row| parse_column(row, 0))
            .optional()?;
        let current = current.ok_or(TransitionError::NotFound { job_id })?;
        let next = current.apply(job_id, action)?;

        let updated = conn.execute(
            "UPDATE jobs SET status = ?1, updated_at = datetime('now') WHERE id = ?2 AND status = ?3",
            params![next.as_str(), job_id, current.as_str()],
        )?;
        if updated == 0 {
            return Err(TransitionError::Stale {
                job_id,
                expected: current,
            }
            .into());
        }
        Ok(next)
    }

    /// Fold `absorbed` into `survivor`: re-point their listings, set the
    /// survivor's status, delete the absorbed jobs. Returns listings moved.
    pub fn absorb_jobs(&self, survivor: i64, absorbed: &[i64], status: JobStatus) -> Result<usize> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let mut moved = 0;
        for loser in absorbed {
            moved += tx.execute(
                "UPDATE listings SET job_id = ?1 WHERE job_id = ?2",
                params![survivor, loser],
            )?;
            tx.execute("DELETE FROM jobs WHERE id = ?1", [loser])?;
        }
        tx.execute(
            "UPDATE jobs SET status = ?1, updated_at = datetime('now') WHERE id = ?2",
            params![status.as_str(), survivor],
        )?;
        tx.commit()?;
        Ok(moved)
    }

    fn row_to_job(row: &Row) -> rusqlite::Result<Job> {
        Ok(Job::from_parts(
            row.get(0)?,
            row.get(1)?,
            row.get(2)?,
            row.get(3)?,
            row.get(4)?,
            parse_column(row, 5)?,
            row.get(6)?,
            row.get(7)?,
        ))
    }

    // --- Listing operations ---

    pub fn get_listing(&self, key: &ListingKey) -> Result<Option<Listing>> {
        let listing = self
            .conn()?
            .query_row(
                "SELECT id, site, job_id, summary, first_seen FROM listings WHERE id = ?1 AND site = ?2",
                params![key.id, key.site.as_str()],
                Self::row_to_listing,
            )
            .optional()?;
        Ok(listing)
    }

    /// Records a listing unless `(id, site)` is already known. Returns true
    /// when a row was created.
    pub fn insert_listing(&self, key: &ListingKey, job_id: i64) -> Result<bool> {
        let inserted = self.conn()?.execute(
            "INSERT INTO listings (id, site, job_id) VALUES (?1, ?2, ?3)
             ON CONFLICT(id, site) DO NOTHING",
            params![key.id, key.site.as_str(), job_id],
        )?;
        Ok(inserted == 1)
    }

    pub fn listings_for_job(&self, job_id: i64) -> Result<Vec<Listing>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, site, job_id, summary, first_seen FROM listings WHERE job_id = ?1
             ORDER BY first_seen, site, id",
        )?;
        let rows = stmt.query_map([job_id], Self::row_to_listing)?;
        rows.collect::<Result<Vec<_>, _>>()
            .context("Failed to list listings")
    }

    /// Listings whose job is in one of `statuses`, optionally only those
    /// with a summary in `summaries`.
    pub fn listings_by_job_status(
        &self,
        user_id: Option<i64>,
        statuses: &[JobStatus],
        summaries: Option<&[&str]>,
    ) -> Result<Vec<Listing>> {
        let status_list = sql_list(statuses.iter().map(|s| s.as_str()));
        let mut sql = format!(
            "SELECT l.id, l.site, l.job_id, l.summary, l.first_seen
             FROM listings l JOIN jobs j ON l.job_id = j.id
             WHERE j.status IN ({status_list}) AND (?1 IS NULL OR j.user_id = ?1)"
        );
        if let Some(summaries) = summaries {
            sql.push_str(&format!(
                " AND l.summary IN ({})",
                sql_list(summaries.iter().copied())
            ));
        }
        sql.push_str(" ORDER BY l.first_seen, l.site, l.id");

        let conn = self.conn()?;
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map([user_id], Self::row_to_listing)?;
        rows.collect::<Result<Vec<_>, _>>()
            .context("Failed to list listings")
    }

    /// Jobs (of the given statuses) that still have a listing without a summary.
    pub fn jobs_missing_summary(&self, user_id: i64, statuses: &[JobStatus]) -> Result<Vec<Job>> {
        let status_list = sql_list(statuses.iter().map(|s| s.as_str()));
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {columns} FROM jobs j
             WHERE j.user_id = ?1 AND j.status IN ({status_list})
               AND EXISTS (SELECT 1 FROM listings l WHERE l.job_id = j.id AND l.summary IN ('', 'N/A'))
             ORDER BY j.id",
            columns = JOB_COLUMNS
                .split(", ")
                .map(|c| format!("j.{c}"))
                .collect::<Vec<_>>()
                .join(", "),
        ))?;
        let rows = stmt.query_map([user_id], Self::row_to_job)?;
        rows.collect::<Result<Vec<_>, _>>()
            .context("Failed to list jobs missing summaries")
    }

    pub fn set_listing_summary(&self, key: &ListingKey, summary: &str) -> Result<()> {
        self.conn()?.execute(
            "UPDATE listings SET summary = ?1 WHERE id = ?2 AND site = ?3",
            params![summary, key.id, key.site.as_str()],
        )?;
        Ok(())
    }

    fn row_to_listing(row: &Row) -> rusqlite::Result<Listing> {
        Ok(Listing {
            id: row.get(0)?,
            site: parse_column(row, 1)?,
            job_id: row.get(2)?,
            summary: row.get(3)?,
            first_seen: row.get(4)?,
        })
    }

    // --- Page count operations ---

    pub fn get_page_count(&self, site: Site, query: &str) -> Result<Option<u32>> {
        let pages = self
            .conn()?
            .query_row(
                "SELECT pages FROM page_counts WHERE site = ?1 AND query = ?2",
                params![site.as_str(), query],
                |row| row.get(0),
            )
            .optional()?;
        Ok(pages)
    }

    pub fn list_page_counts(&self) -> Result<Vec<PageCount>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare("SELECT site, query, pages FROM page_counts ORDER BY query, site")?;
        let rows = stmt.query_map([], |row| {
            Ok(PageCount {
                site: parse_column(row, 0)?,
                query: row.get(1)?,
                pages: row.get(2)?,
            })
        })?;
        rows.collect::<Result<Vec<_>, _>>()
            .context("Failed to list page counts")
    }

    pub fn upsert_page_count(&self, site: Site, query: &str, pages: u32) -> Result<()> {
        self.conn()?.execute(
            "INSERT INTO page_counts (site, query, pages) VALUES (?1, ?2, ?3)
             ON CONFLICT(site, query) DO UPDATE SET pages = excluded.pages",
            params![site.as_str(), query, pages],
        )?;
        Ok(())
    }

    // --- Blacklist rule operations ---

    pub fn add_rule(&self, user_id: i64, kind: RuleKind, term: &str) -> Result<i64> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO blacklist_rules (user_id, term, kind) VALUES (?1, ?2, ?3)",
            params![user_id, term, kind.as_str()],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn delete_rule(&self, user_id: i64, rule_id: i64) -> Result<bool> {
        let deleted = self.conn()?.execute(
            "DELETE FROM blacklist_rules WHERE id = ?1 AND user_id = ?2",
            params![rule_id, user_id],
        )?;
        Ok(deleted == 1)
    }

    pub fn list_rules(&self, user_id: i64) -> Result<Vec<BlacklistRule>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, user_id, term, kind FROM blacklist_rules WHERE user_id = ?1 ORDER BY id",
        )?;
        let rows = stmt.query_map([user_id], |row| {
            Ok(BlacklistRule {
                id: row.get(0)?,
                user_id: row.get(1)?,
                term: row.get(2)?,
                kind: parse_column(row, 3)?,
            })
        })?;
        rows.collect::<Result<Vec<_>, _>>()
            .context("Failed to list blacklist rules")
    }

    // --- Search query operations ---

    pub fn add_query(
        &self,
        user_id: i64,
        term: &str,
        remote: bool,
        location: Option<Location>,
        sites: &[Site],
    ) -> Result<i64> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT INTO search_queries (user_id, term, remote, location) VALUES (?1, ?2, ?3, ?4)",
            params![user_id, term, remote, location.map(|l| l.as_str())],
        )?;
        let query_id = tx.last_insert_rowid();
        for site in sites {
            tx.execute(
                "INSERT OR IGNORE INTO search_query_sites (query_id, site) VALUES (?1, ?2)",
                params![query_id, site.as_str()],
            )?;
        }
        tx.commit()?;
        Ok(query_id)
    }

    pub fn delete_query(&self, user_id: i64, query_id: i64) -> Result<bool> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        tx.execute(
            "DELETE FROM search_query_sites WHERE query_id IN
             (SELECT id FROM search_queries WHERE id = ?1 AND user_id = ?2)",
            params![query_id, user_id],
        )?;
        let deleted = tx.execute(
            "DELETE FROM search_queries WHERE id = ?1 AND user_id = ?2",
            params![query_id, user_id],
        )?;
        tx.commit()?;
        Ok(deleted == 1)
    }

    /// Saved queries with their site sets; all users when `user_id` is None.
    pub fn list_queries(&self, user_id: Option<i64>) -> Result<Vec<SearchQuery>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, user_id, term, remote, location FROM search_queries
             WHERE ?1 IS NULL OR user_id = ?1 ORDER BY id",
        )?;
        let mut queries = stmt
            .query_map([user_id], |row| {
                let location: Option<String> = row.get(4)?;
                let location = location
                    .map(|l| {
                        Location::from_str(&l).map_err(|e| {
                            rusqlite::Error::FromSqlConversionFailure(
                                4,
                                rusqlite::types::Type::Text,
                                e.into(),
                            )
                        })
                    })
                    .transpose()?;
                Ok(SearchQuery {
                    id: row.get(0)?,
                    user_id: row.get(1)?,
                    term: row.get(2)?,
                    remote: row.get(3)?,
                    location,
                    sites: Vec::new(),
                })
            })?
            .collect::<Result<Vec<_>, _>>()
            .context("Failed to list search queries")?;

        let mut site_stmt =
            conn.prepare("SELECT site FROM search_query_sites WHERE query_id = ?1 ORDER BY site")?;
        for query in &mut queries {
            query.sites = site_stmt
                .query_map([query.id], |row| parse_column(row, 0))?
                .collect::<Result<Vec<Site>, _>>()?;
        }
        Ok(queries)
    }
}

fn parse_column<T>(row: &Row, idx: usize) -> rusqlite::Result<T>
where
    T: FromStr<Err = anyhow::Error>,
{
    let raw: String = row.get(idx)?;
    raw.parse().map_err(|e: anyhow::Error| {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, e.into())
    })
}

/// Quoted SQL list of known-safe identifiers (status names, summary markers).
fn sql_list<'a>(items: impl Iterator<Item = &'a str>) -> String {
    items
        .map(|item| format!("'{}'", item.replace('\'', "''")))
        .collect::<Vec<_>>()
        .join(", ")
}
