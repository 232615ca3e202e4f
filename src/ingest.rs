use anyhow::{anyhow, Result};
use rand::Rng;
use std::thread;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::blacklist;
use crate::db::Database;
use crate::estimator::{CrawlProgress, PageCountEstimator};
use crate::identity::{self, fuzzy_key};
use crate::lease::UserLocks;
use crate::models::{ListingKey, SearchQuery};
use crate::sources::{RawPosting, Site, SourceAdapter, SourceError};
use crate::storage::DescriptionStore;

/// Bounded retries with exponential backoff and jitter for one page or
/// listing fetch.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
        }
    }

    /// Delay before retry number `attempt` (1-based): base * 2^(attempt-1),
    /// plus up to half the base again as jitter.
    pub fn delay(&self, attempt: u32) -> Duration {
        let base_ms = self.base_delay.as_millis() as u64;
        let backoff = base_ms.saturating_mul(1 << attempt.saturating_sub(1).min(16));
        let jitter = rand::thread_rng().gen_range(0..=base_ms / 2);
        Duration::from_millis(backoff.saturating_add(jitter))
    }

    /// Run `op` until it succeeds, fails with a non-retryable error, or the
    /// attempts run out. The last error is returned.
    pub fn run<T>(&self, what: &str, mut op: impl FnMut() -> Result<T, SourceError>) -> Result<T, SourceError> {
        let mut attempt = 1;
        loop {
            match op() {
                Ok(value) => return Ok(value),
                Err(e) if e.is_retryable() && attempt < self.max_attempts => {
                    let delay = self.delay(attempt);
                    debug!(what, attempt, ?delay, error = %e, "retrying");
                    thread::sleep(delay);
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct CrawlConfig {
    pub retry: RetryPolicy,
    /// Consecutive skipped pages that end a crawl early.
    pub max_failed_pages: u32,
}

impl Default for CrawlConfig {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::new(3, Duration::from_millis(500)),
            max_failed_pages: 3,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CrawlOutcome {
    /// Stopped at the first empty page.
    Completed,
    /// The source cannot run this query.
    Unsupported,
    /// The query was rejected before any request.
    Invalid,
    /// Too many consecutive pages failed.
    Aborted,
}

#[derive(Debug, Clone)]
pub struct CrawlReport {
    pub site: Site,
    pub query_id: i64,
    pub signature: String,
    pub outcome: CrawlOutcome,
    pub estimated: u32,
    pub horizon: u32,
    pub pages_walked: u32,
    pub pages_skipped: u32,
    pub jobs_created: usize,
    pub listings_created: usize,
    pub blacklisted: usize,
    pub descriptions: BackfillReport,
}

impl CrawlReport {
    fn new(site: Site, query: &SearchQuery, estimated: u32) -> Self {
        Self {
            site,
            query_id: query.id,
            signature: query.signature(),
            outcome: CrawlOutcome::Completed,
            estimated,
            horizon: estimated,
            pages_walked: 0,
            pages_skipped: 0,
            jobs_created: 0,
            listings_created: 0,
            blacklisted: 0,
            descriptions: BackfillReport::default(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BackfillReport {
    pub fetched: usize,
    pub already_stored: usize,
    pub empty: usize,
    pub failed: usize,
}

impl BackfillReport {
    pub fn absorb(&mut self, other: &BackfillReport) {
        self.fetched += other.fetched;
        self.already_stored += other.already_stored;
        self.empty += other.empty;
        self.failed += other.failed;
    }
}

/// Fetch and store the body of every listing in `keys` that has no stored
/// description yet. Failures are counted and logged, never returned.
pub fn backfill_descriptions(
    source: &dyn SourceAdapter,
    store: &dyn DescriptionStore,
    retry: &RetryPolicy,
    keys: &[ListingKey],
) -> BackfillReport {
    let mut report = BackfillReport::default();
    for key in keys {
        match store.exists(key) {
            Ok(true) => {
                report.already_stored += 1;
                continue;
            }
            Ok(false) => {}
            Err(e) => {
                warn!(listing = %key, error = %e, "description storage unavailable");
                report.failed += 1;
                continue;
            }
        }

        let body = match retry.run(&key.to_string(), || source.fetch_body(&key.id)) {
            Ok(body) => body,
            Err(e) => {
                warn!(listing = %key, error = %e, "failed to fetch description");
                report.failed += 1;
                continue;
            }
        };
        if body.trim().is_empty() {
            debug!(listing = %key, "empty description, not stored");
            report.empty += 1;
            continue;
        }
        match store.write(key, &body) {
            Ok(()) => report.fetched += 1,
            Err(e) => {
                warn!(listing = %key, error = %e, "failed to store description");
                report.failed += 1;
            }
        }
    }
    report
}

/// Turns crawls of saved queries into Job and Listing records.
pub struct Coordinator<'a> {
    db: &'a Database,
    store: &'a dyn DescriptionStore,
    locks: &'a UserLocks,
    config: CrawlConfig,
}

impl<'a> Coordinator<'a> {
    pub fn new(db: &'a Database, store: &'a dyn DescriptionStore, locks: &'a UserLocks, config: CrawlConfig) -> Self {
        Self {
            db,
            store,
            locks,
            config,
        }
    }

    /// Walk one (source, query) pair from page 0 until the first empty page.
    pub fn crawl(&self, source: &dyn SourceAdapter, query: &SearchQuery) -> Result<CrawlReport> {
        let lease = self.locks.shared(self.db, query.user_id)?;

        let site = source.site();
        let estimator = PageCountEstimator::new(self.db);
        let estimated = estimator.estimate(site, query)?;
        let mut progress = CrawlProgress::new(estimated);
        let mut report = CrawlReport::new(site, query, estimated);
        let mut created = Vec::new();
        let mut last_full_page = 0;
        let mut consecutive_failures = 0;
        let mut page = 0;

        loop {
            let what = format!("{} page {}", site, page);
            match self.config.retry.run(&what, || source.fetch_page(query, page)) {
                Ok(postings) if postings.is_empty() => break,
                Ok(postings) => {
                    consecutive_failures = 0;
                    last_full_page = page;
                    self.ingest_page(site, query, &postings, &mut report, &mut created)?;
                    progress.advance();
                    report.pages_walked += 1;
                    lease.renew()?;
                    debug!(
                        site = %site,
                        query = %report.signature,
                        page,
                        postings = postings.len(),
                        horizon = progress.horizon,
                        "crawled page"
                    );
                }
                Err(SourceError::NotSupported { feature, .. }) => {
                    debug!(site = %site, query = %report.signature, feature, "query not supported, skipping");
                    report.outcome = CrawlOutcome::Unsupported;
                    break;
                }
                Err(SourceError::InvalidQuery(reason)) => {
                    warn!(site = %site, query = %report.signature, reason = %reason, "invalid query, skipping");
                    report.outcome = CrawlOutcome::Invalid;
                    break;
                }
                Err(e) => {
                    warn!(site = %site, query = %report.signature, page, error = %e, "skipping page");
                    report.pages_skipped += 1;
                    consecutive_failures += 1;
                    progress.advance();
                    if consecutive_failures >= self.config.max_failed_pages {
                        report.outcome = CrawlOutcome::Aborted;
                        break;
                    }
                }
            }
            page += 1;
        }
        report.horizon = progress.horizon;

        if report.outcome == CrawlOutcome::Completed {
            estimator.record(site, query, last_full_page)?;
        }

        report.descriptions = backfill_descriptions(source, self.store, &self.config.retry, &created);

        info!(
            site = %site,
            query = %report.signature,
            query_id = report.query_id,
            outcome = ?report.outcome,
            estimated = report.estimated,
            pages = report.pages_walked,
            widened = progress.widened,
            skipped = report.pages_skipped,
            jobs = report.jobs_created,
            listings = report.listings_created,
            blacklisted = report.blacklisted,
            "crawl finished"
        );
        Ok(report)
    }

    fn ingest_page(
        &self,
        site: Site,
        query: &SearchQuery,
        postings: &[RawPosting],
        report: &mut CrawlReport,
        created: &mut Vec<ListingKey>,
    ) -> Result<()> {
        for posting in postings {
            if posting.listing_id.trim().is_empty() {
                continue;
            }
            let key = ListingKey::new(site, &posting.listing_id);

            if let Some(existing) = self.db.get_listing(&key)? {
                if let Some(owner) = self.db.get_job(existing.job_id)? {
                    if owner.fuzzy_key != fuzzy_key(&posting.title, &posting.company) {
                        debug!(listing = %key, job_id = owner.id, "known listing changed title, left for the merge sweep");
                    }
                }
                continue;
            }

            let job_id = match identity::resolve(self.db, query.user_id, &posting.title, &posting.company)? {
                Some(id) => id,
                None => {
                    // A concurrent crawl may have created it since the lookup
                    let (job, created) =
                        self.db.resolve_or_create_job(query.user_id, &posting.title, &posting.company)?;
                    if created {
                        report.jobs_created += 1;
                        if blacklist::classify(self.db, &job)? {
                            report.blacklisted += 1;
                        }
                    }
                    job.id
                }
            };
            if self.db.insert_listing(&key, job_id)? {
                report.listings_created += 1;
                created.push(key);
            }
        }
        Ok(())
    }

    /// Crawl every query against every source it names, one thread per
    /// source. Queries for a source run in order on that source's thread.
    pub fn sweep(&self, sources: &[&dyn SourceAdapter], queries: &[SearchQuery]) -> Result<Vec<CrawlReport>> {
        let results: Vec<Result<Vec<CrawlReport>>> = thread::scope(|scope| {
            let handles: Vec<_> = sources
                .iter()
                .map(|&source| {
                    scope.spawn(move || {
                        queries
                            .iter()
                            .filter(|query| query.sites.contains(&source.site()))
                            .map(|query| self.crawl(source, query))
                            .collect::<Result<Vec<_>>>()
                    })
                })
                .collect();
            handles
                .into_iter()
                .map(|handle| handle.join().unwrap_or_else(|_| Err(anyhow!("crawl thread panicked"))))
                .collect()
        });

        let mut reports = Vec::new();
        for result in results {
            reports.extend(result?);
        }
        Ok(reports)
    }
}
