use anyhow::Result;
use std::collections::BTreeMap;
use tracing::{info, warn};

use crate::blacklist::{self, ReapplyReport};
use crate::db::Database;
use crate::identity::{self, MergeReport};
use crate::ingest::{backfill_descriptions, BackfillReport, RetryPolicy};
use crate::lease::UserLocks;
use crate::models::ListingKey;
use crate::sources::{Site, SourceAdapter};
use crate::status::JobStatus;
use crate::storage::DescriptionStore;

/// Statuses whose listings should always have a stored description.
const NEEDS_DESCRIPTION: [JobStatus; 2] = [JobStatus::New, JobStatus::Interested];

#[derive(Debug, Clone)]
pub struct CleanConfig {
    pub similarity_threshold: f64,
    pub retry: RetryPolicy,
}

#[derive(Debug, Default)]
pub struct CleanReport {
    pub merged: MergeReport,
    pub reapplied: ReapplyReport,
    pub descriptions: BackfillReport,
    pub still_missing: usize,
}

/// Maintenance for one user: merge near-duplicate jobs, re-run blacklist
/// rules, and backfill missing descriptions. Holds the user's exclusive
/// sweep lease throughout, so no crawl for that user runs alongside it.
pub fn clean_user(
    db: &Database,
    store: &dyn DescriptionStore,
    sources: &[&dyn SourceAdapter],
    locks: &UserLocks,
    config: &CleanConfig,
    user_id: i64,
) -> Result<CleanReport> {
    let lease = locks.exclusive(db, user_id)?;

    let merged = identity::merge_duplicates(db, user_id, config.similarity_threshold)?;
    let reapplied = blacklist::reapply(db, user_id)?;

    let mut by_site: BTreeMap<Site, Vec<ListingKey>> = BTreeMap::new();
    for listing in db.listings_by_job_status(Some(user_id), &NEEDS_DESCRIPTION, None)? {
        by_site.entry(listing.site).or_default().push(listing.key());
    }

    let mut descriptions = BackfillReport::default();
    for (site, keys) in &by_site {
        match sources.iter().find(|source| source.site() == *site) {
            Some(source) => {
                descriptions.absorb(&backfill_descriptions(*source, store, &config.retry, keys));
                lease.renew()?;
            }
            None => warn!(site = %site, listings = keys.len(), "no source available for backfill"),
        }
    }

    let still_missing = by_site
        .values()
        .flatten()
        .filter(|key| !matches!(store.exists(key), Ok(true)))
        .count();

    info!(
        user_id,
        merged = merged.jobs_absorbed,
        blacklisted = reapplied.blacklisted,
        restored = reapplied.restored,
        fetched = descriptions.fetched,
        still_missing,
        "clean finished"
    );
    Ok(CleanReport {
        merged,
        reapplied,
        descriptions,
        still_missing,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingest::fake::FakeSource;
    use crate::lease::{LeaseConfig, LeaseError};
    use crate::models::RuleKind;
    use crate::status::Action;
    use crate::storage::memory::MemoryStore;
    use std::time::Duration;

    fn config() -> CleanConfig {
        CleanConfig {
            similarity_threshold: 0.9,
            retry: RetryPolicy::new(2, Duration::ZERO),
        }
    }

    #[test]
    fn test_clean_merges_reapplies_and_backfills() {
        let db = Database::open_in_memory().unwrap();
        let user = db.get_or_create_user("josh").unwrap();
        let store = MemoryStore::default();
        let locks = UserLocks::default();

        let (a, _) = db.resolve_or_create_job(user.id, "Backend Engineer", "Acme Corp").unwrap();
        let (b, _) = db.resolve_or_create_job(user.id, "Backend Engineers", "Acme Corp").unwrap();
        let (c, _) = db.resolve_or_create_job(user.id, "Senior Designer", "Globex").unwrap();
        let (d, _) = db.resolve_or_create_job(user.id, "Data Analyst", "Initech").unwrap();
        db.transition(b.id, Action::Accept).unwrap();
        db.transition(d.id, Action::Accept).unwrap();
        db.insert_listing(&ListingKey::new(Site::Seek, "1"), a.id).unwrap();
        db.insert_listing(&ListingKey::new(Site::Seek, "2"), b.id).unwrap();
        db.insert_listing(&ListingKey::new(Site::Seek, "3"), c.id).unwrap();
        db.insert_listing(&ListingKey::new(Site::Jora, "4"), d.id).unwrap();
        db.add_rule(user.id, RuleKind::Title, "senior").unwrap();

        let seek = FakeSource::new(Site::Seek, vec![])
            .with_body("1", "Build APIs.")
            .with_body("2", "Build more APIs.")
            .with_body("3", "Draw things.");

        let report = clean_user(&db, &store, &[&seek], &locks, &config(), user.id).unwrap();

        assert_eq!(report.merged.jobs_absorbed, 1);
        assert_eq!(report.merged.listings_moved, 1);
        assert_eq!(report.reapplied.blacklisted, 1);
        assert_eq!(report.descriptions.fetched, 2);
        // Jora has no source here
        assert_eq!(report.still_missing, 1);

        let survivor = db.get_job(a.id).unwrap().unwrap();
        assert_eq!(survivor.status(), JobStatus::Interested);
        assert!(db.get_job(b.id).unwrap().is_none());
        assert_eq!(db.listings_for_job(a.id).unwrap().len(), 2);
        assert_eq!(db.get_job(c.id).unwrap().unwrap().status(), JobStatus::Blacklist);
        // Blacklisted listings are not backfilled
        assert!(!store.exists(&ListingKey::new(Site::Seek, "3")).unwrap());
    }

    #[test]
    fn test_clean_is_repeatable() {
        let db = Database::open_in_memory().unwrap();
        let user = db.get_or_create_user("josh").unwrap();
        let store = MemoryStore::default();
        let locks = UserLocks::default();
        let (a, _) = db.resolve_or_create_job(user.id, "Backend Engineer", "Acme").unwrap();
        db.insert_listing(&ListingKey::new(Site::Seek, "1"), a.id).unwrap();
        let seek = FakeSource::new(Site::Seek, vec![]).with_body("1", "Build APIs.");

        clean_user(&db, &store, &[&seek], &locks, &config(), user.id).unwrap();
        let second = clean_user(&db, &store, &[&seek], &locks, &config(), user.id).unwrap();

        assert_eq!(second.merged.groups, 0);
        assert_eq!(second.reapplied, ReapplyReport::default());
        assert_eq!(second.descriptions.fetched, 0);
        assert_eq!(second.descriptions.already_stored, 1);
        assert_eq!(second.still_missing, 0);
    }

    #[test]
    fn test_clean_releases_user_lock() {
        let db = Database::open_in_memory().unwrap();
        let user = db.get_or_create_user("josh").unwrap();
        let locks = UserLocks::default();

        clean_user(&db, &MemoryStore::default(), &[], &locks, &config(), user.id).unwrap();
        let no_wait = UserLocks::new(LeaseConfig {
            wait: Duration::ZERO,
            ..LeaseConfig::default()
        });
        no_wait.exclusive(&db, user.id).unwrap();
    }

    #[test]
    fn test_clean_refused_while_crawl_runs() {
        let db = Database::open_in_memory().unwrap();
        let user = db.get_or_create_user("josh").unwrap();
        db.resolve_or_create_job(user.id, "Backend Engineer", "Acme Corp").unwrap();
        db.resolve_or_create_job(user.id, "Backend Engineers", "Acme Corp").unwrap();
        let locks = UserLocks::new(LeaseConfig {
            wait: Duration::ZERO,
            ..LeaseConfig::default()
        });

        let crawl = locks.shared(&db, user.id).unwrap();
        let err = clean_user(&db, &MemoryStore::default(), &[], &locks, &config(), user.id).unwrap_err();
        assert!(matches!(err.downcast_ref::<LeaseError>(), Some(LeaseError::Busy { .. })));
        assert_eq!(db.list_jobs(user.id, None, true).unwrap().len(), 2);

        drop(crawl);
        let report = clean_user(&db, &MemoryStore::default(), &[], &locks, &config(), user.id).unwrap();
        assert_eq!(report.merged.jobs_absorbed, 1);
    }
}
