use anyhow::Result;
use std::cmp::Reverse;
use std::collections::HashMap;
use tracing::{debug, info};

use crate::db::Database;
use crate::models::Job;
use crate::status::JobStatus;

/// Lowercase and drop everything that is not a letter or digit.
pub fn normalize(s: &str) -> String {
    s.to_lowercase().chars().filter(|c| c.is_alphanumeric()).collect()
}

/// O(1) identity key for a posting: `normalizedTitle-normalizedCompany`.
pub fn fuzzy_key(title: &str, company: &str) -> String {
    format!("{}-{}", normalize(title), normalize(company))
}

/// Id of the user's existing job with the same fuzzy key, if any.
pub fn resolve(db: &Database, user_id: i64, title: &str, company: &str) -> Result<Option<i64>> {
    db.find_job_by_key(user_id, &fuzzy_key(title, company))
}

pub fn similarity(a: &str, b: &str) -> f64 {
    strsim::normalized_levenshtein(&a.trim().to_lowercase(), &b.trim().to_lowercase())
}

#[derive(Debug, Clone, PartialEq)]
pub struct DuplicateGroup {
    pub survivor: i64,
    pub absorbed: Vec<i64>,
    pub status: JobStatus,
}

#[derive(Debug, Default)]
pub struct MergeReport {
    pub groups: usize,
    pub jobs_absorbed: usize,
    pub listings_moved: usize,
}

/// Pairwise title and company comparison across one user's jobs.
///
/// Each group is anchored on its lowest id: a job joins the group only when
/// both its title and its company clear `threshold` against the anchor
/// itself, so a chain of near-misses never pulls unrelated jobs together.
pub fn find_duplicate_groups(jobs: &[Job], threshold: f64) -> Vec<DuplicateGroup> {
    let mut ordered: Vec<&Job> = jobs.iter().collect();
    ordered.sort_by_key(|job| job.id);

    let mut taken = vec![false; ordered.len()];
    let mut groups = Vec::new();

    for i in 0..ordered.len() {
        if taken[i] {
            continue;
        }
        let anchor = ordered[i];
        let mut members = vec![anchor];

        for j in (i + 1)..ordered.len() {
            if taken[j] {
                continue;
            }
            let other = ordered[j];
            if similarity(&anchor.title, &other.title) > threshold
                && similarity(&anchor.company, &other.company) > threshold
            {
                taken[j] = true;
                members.push(other);
            }
        }

        if members.len() > 1 {
            let statuses: Vec<JobStatus> = members.iter().map(|job| job.status()).collect();
            groups.push(DuplicateGroup {
                survivor: anchor.id,
                absorbed: members[1..].iter().map(|job| job.id).collect(),
                status: merged_status(&statuses),
            });
        }
    }

    groups
}

/// Most common status in a duplicate group; ties go to the status with the
/// stronger merge precedence.
pub fn merged_status(statuses: &[JobStatus]) -> JobStatus {
    let mut counts: HashMap<JobStatus, usize> = HashMap::new();
    for status in statuses {
        *counts.entry(*status).or_default() += 1;
    }

    counts
        .into_iter()
        .max_by_key(|(status, count)| (*count, Reverse(status.merge_precedence())))
        .map(|(status, _)| status)
        .unwrap_or(JobStatus::New)
}

/// Similarity sweep for one user. Only run from maintenance, never while
/// that user's crawls are active.
pub fn merge_duplicates(db: &Database, user_id: i64, threshold: f64) -> Result<MergeReport> {
    let jobs = db.list_jobs(user_id, None, true)?;
    let groups = find_duplicate_groups(&jobs, threshold);

    let mut report = MergeReport::default();
    for group in &groups {
        debug!(
            survivor = group.survivor,
            absorbed = ?group.absorbed,
            status = %group.status,
            "merging duplicate jobs"
        );
        report.listings_moved += db.absorb_jobs(group.survivor, &group.absorbed, group.status)?;
        report.jobs_absorbed += group.absorbed.len();
        report.groups += 1;
    }

    if report.groups > 0 {
        info!(
            user_id,
            groups = report.groups,
            absorbed = report.jobs_absorbed,
            "merged duplicate jobs"
        );
    }
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ListingKey;
    use crate::sources::Site;
    use crate::status::Action;

    fn job(id: i64, title: &str, company: &str, status: JobStatus) -> Job {
        Job::from_parts(
            id,
            1,
            title.to_string(),
            company.to_string(),
            fuzzy_key(title, company),
            status,
            String::new(),
            String::new(),
        )
    }

    #[test]
    fn test_fuzzy_key_ignores_case_and_punctuation() {
        assert_eq!(
            fuzzy_key("Software Engineer!", "Acme Pty Ltd"),
            fuzzy_key("software engineer", "acmeptyltd")
        );
        assert_eq!(
            fuzzy_key("Backend Engineer", "Acme"),
            fuzzy_key("backend-engineer", "ACME")
        );
        assert_eq!(fuzzy_key("Dev (C#/.NET)", "Foo Pty. Ltd."), "devcnet-fooptyltd");
    }

    #[test]
    fn test_fuzzy_key_keeps_title_and_company_apart() {
        assert_ne!(fuzzy_key("ab", "c"), fuzzy_key("a", "bc"));
    }

    #[test]
    fn test_similarity_bounds() {
        assert_eq!(similarity("Backend Engineer", "backend engineer"), 1.0);
        assert!(similarity("Backend Engineer", "Nurse") < 0.5);
    }

    #[test]
    fn test_find_duplicate_groups_requires_both_fields() {
        let jobs = vec![
            job(1, "Graduate Software Engineer", "Acme Corporation", JobStatus::New),
            job(2, "Graduate Software Engineers", "Acme Corporation", JobStatus::Interested),
            // Same title, different employer
            job(3, "Graduate Software Engineer", "Globex", JobStatus::New),
        ];
        let groups = find_duplicate_groups(&jobs, 0.9);
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].survivor, 1);
        assert_eq!(groups[0].absorbed, vec![2]);
    }

    #[test]
    fn test_find_duplicate_groups_none_for_unrelated() {
        let jobs = vec![
            job(1, "Backend Engineer", "Acme", JobStatus::New),
            job(2, "Frontend Developer", "Acme", JobStatus::New),
        ];
        assert!(find_duplicate_groups(&jobs, 0.9).is_empty());
    }

    #[test]
    fn test_merged_status_majority() {
        let statuses = [JobStatus::New, JobStatus::NotInterested, JobStatus::NotInterested];
        assert_eq!(merged_status(&statuses), JobStatus::NotInterested);
    }

    #[test]
    fn test_merged_status_tie_break() {
        assert_eq!(
            merged_status(&[JobStatus::Interested, JobStatus::Applied]),
            JobStatus::Applied
        );
        assert_eq!(
            merged_status(&[JobStatus::Liked, JobStatus::Interested]),
            JobStatus::Liked
        );
        assert_eq!(
            merged_status(&[JobStatus::New, JobStatus::Interested]),
            JobStatus::Interested
        );
    }

    #[test]
    fn test_resolve_finds_existing_job() {
        let db = Database::open_in_memory().unwrap();
        let user = db.get_or_create_user("josh").unwrap();
        let (created, _) = db
            .resolve_or_create_job(user.id, "Backend Engineer", "Acme Pty Ltd")
            .unwrap();

        let found = resolve(&db, user.id, "backend engineer", "Acme Pty. Ltd.").unwrap();
        assert_eq!(found, Some(created.id));
        assert_eq!(resolve(&db, user.id, "Frontend", "Acme").unwrap(), None);

        // Keys are per user
        let other = db.get_or_create_user("sam").unwrap();
        assert_eq!(resolve(&db, other.id, "Backend Engineer", "Acme Pty Ltd").unwrap(), None);
    }

    #[test]
    fn test_merge_duplicates_moves_listings_and_deletes_losers() {
        let db = Database::open_in_memory().unwrap();
        let user = db.get_or_create_user("josh").unwrap();
        let (a, _) = db
            .resolve_or_create_job(user.id, "Graduate Software Engineer", "Acme Corporation")
            .unwrap();
        let (b, _) = db
            .resolve_or_create_job(user.id, "Graduate Software Engineers", "Acme Corporation")
            .unwrap();
        let (c, _) = db
            .resolve_or_create_job(user.id, "Graduate Software Engineerss", "Acme Corporation")
            .unwrap();
        db.insert_listing(&ListingKey::new(Site::Seek, "1"), a.id).unwrap();
        db.insert_listing(&ListingKey::new(Site::Jora, "2"), b.id).unwrap();
        db.insert_listing(&ListingKey::new(Site::Indeed, "3"), c.id).unwrap();
        db.transition(b.id, Action::Accept).unwrap();
        db.transition(c.id, Action::Accept).unwrap();

        let report = merge_duplicates(&db, user.id, 0.9).unwrap();
        assert_eq!(report.groups, 1);
        assert_eq!(report.jobs_absorbed, 2);
        assert_eq!(report.listings_moved, 2);

        let survivor = db.get_job(a.id).unwrap().unwrap();
        assert_eq!(survivor.status(), JobStatus::Interested);
        assert!(db.get_job(b.id).unwrap().is_none());
        assert!(db.get_job(c.id).unwrap().is_none());
        assert_eq!(db.listings_for_job(a.id).unwrap().len(), 3);
    }
}
