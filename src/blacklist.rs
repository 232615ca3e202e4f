use anyhow::Result;
use tracing::{debug, info};

use crate::db::Database;
use crate::lease::UserLocks;
use crate::models::{BlacklistRule, Job, RuleKind};
use crate::status::{Action, JobStatus};

/// Title rules are case-insensitive substrings; company rules must equal the
/// company exactly.
pub fn rule_matches(rule: &BlacklistRule, job: &Job) -> bool {
    match rule.kind {
        RuleKind::Title => job.title.to_lowercase().contains(&rule.term.to_lowercase()),
        RuleKind::Company => job.company == rule.term,
    }
}

pub fn any_rule_matches(rules: &[BlacklistRule], job: &Job) -> bool {
    rules.iter().any(|rule| rule_matches(rule, job))
}

/// Stamp `job` as blacklisted if one of its owner's rules matches.
///
/// Only a `new` job is moved. Returns true when the job is (now) excluded
/// because of a matching rule, so a second call with the same rules gives
/// the same answer and changes nothing.
pub fn classify(db: &Database, job: &Job) -> Result<bool> {
    let rules = db.list_rules(job.user_id)?;
    classify_with(db, job, &rules)
}

fn classify_with(db: &Database, job: &Job, rules: &[BlacklistRule]) -> Result<bool> {
    if !any_rule_matches(rules, job) {
        return Ok(false);
    }
    match job.status() {
        JobStatus::New => {
            db.transition(job.id, Action::Blacklist)?;
            debug!(job_id = job.id, title = %job.title, "blacklisted job");
            Ok(true)
        }
        status => Ok(status.is_blacklisted()),
    }
}

#[derive(Debug, Default, PartialEq, Eq)]
pub struct ReapplyReport {
    pub blacklisted: usize,
    pub restored: usize,
}

/// Re-run the user's rules over every `new` and blacklisted job. Jobs the
/// user has already moved past triage are left alone.
pub fn reapply(db: &Database, user_id: i64) -> Result<ReapplyReport> {
    let rules = db.list_rules(user_id)?;
    let mut report = ReapplyReport::default();

    for job in db.list_jobs(user_id, Some(JobStatus::New), false)? {
        if classify_with(db, &job, &rules)? {
            report.blacklisted += 1;
        }
    }

    for status in [JobStatus::Blacklist, JobStatus::EasyFilter] {
        for job in db.list_jobs(user_id, Some(status), false)? {
            if !any_rule_matches(&rules, &job) {
                db.transition(job.id, Action::Restore)?;
                debug!(job_id = job.id, title = %job.title, "restored job");
                report.restored += 1;
            }
        }
    }

    if report.blacklisted > 0 || report.restored > 0 {
        info!(
            user_id,
            blacklisted = report.blacklisted,
            restored = report.restored,
            "reapplied blacklist"
        );
    }
    Ok(report)
}

/// Add a rule and immediately apply it to the user's triage queue. Runs
/// under the user's exclusive sweep lease.
pub fn add_rule(
    db: &Database,
    locks: &UserLocks,
    user_id: i64,
    kind: RuleKind,
    term: &str,
) -> Result<(i64, ReapplyReport)> {
    let term = term.trim();
    anyhow::ensure!(!term.is_empty(), "Blacklist term cannot be empty");
    let _lease = locks.exclusive(db, user_id)?;
    let id = db.add_rule(user_id, kind, term)?;
    Ok((id, reapply(db, user_id)?))
}

/// Delete a rule; jobs it was holding back return to `new`. `None` when the
/// user owns no such rule.
pub fn delete_rule(db: &Database, locks: &UserLocks, user_id: i64, rule_id: i64) -> Result<Option<ReapplyReport>> {
    let _lease = locks.exclusive(db, user_id)?;
    if !db.delete_rule(user_id, rule_id)? {
        return Ok(None);
    }
    Ok(Some(reapply(db, user_id)?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lease::{LeaseConfig, LeaseError};
    use std::thread;
    use std::time::Duration;

    fn setup() -> (Database, i64) {
        let db = Database::open_in_memory().unwrap();
        let user = db.get_or_create_user("josh").unwrap();
        (db, user.id)
    }

    fn job(db: &Database, user_id: i64, title: &str, company: &str) -> Job {
        db.resolve_or_create_job(user_id, title, company).unwrap().0
    }

    fn status_of(db: &Database, id: i64) -> JobStatus {
        db.get_job(id).unwrap().unwrap().status()
    }

    #[test]
    fn test_title_rule_is_case_insensitive_substring() {
        let rule = BlacklistRule {
            id: 1,
            user_id: 1,
            term: "SENIOR".to_string(),
            kind: RuleKind::Title,
        };
        let (db, user_id) = setup();
        assert!(rule_matches(&rule, &job(&db, user_id, "Senior Backend Engineer", "Acme")));
        assert!(!rule_matches(&rule, &job(&db, user_id, "Backend Engineer", "Senior Living")));
    }

    #[test]
    fn test_company_rule_is_exact_and_case_sensitive() {
        let rule = BlacklistRule {
            id: 1,
            user_id: 1,
            term: "Acme".to_string(),
            kind: RuleKind::Company,
        };
        let (db, user_id) = setup();
        assert!(rule_matches(&rule, &job(&db, user_id, "Engineer", "Acme")));
        assert!(!rule_matches(&rule, &job(&db, user_id, "Engineer", "ACME Pty")));
        assert!(!rule_matches(&rule, &job(&db, user_id, "Tester", "acme")));
    }

    #[test]
    fn test_classify_is_idempotent() {
        let (db, user_id) = setup();
        db.add_rule(user_id, RuleKind::Title, "senior").unwrap();
        let j = job(&db, user_id, "Senior Backend Engineer", "Acme");

        assert!(classify(&db, &j).unwrap());
        assert_eq!(status_of(&db, j.id), JobStatus::Blacklist);

        let reloaded = db.get_job(j.id).unwrap().unwrap();
        assert!(classify(&db, &reloaded).unwrap());
        assert_eq!(status_of(&db, j.id), JobStatus::Blacklist);
    }

    #[test]
    fn test_classify_without_match_leaves_new() {
        let (db, user_id) = setup();
        db.add_rule(user_id, RuleKind::Title, "senior").unwrap();
        let j = job(&db, user_id, "Backend Engineer", "Acme");
        assert!(!classify(&db, &j).unwrap());
        assert_eq!(status_of(&db, j.id), JobStatus::New);
    }

    #[test]
    fn test_classify_never_overrides_user_decision() {
        let (db, user_id) = setup();
        let j = job(&db, user_id, "Senior Backend Engineer", "Acme");
        db.transition(j.id, Action::Accept).unwrap();
        db.add_rule(user_id, RuleKind::Title, "senior").unwrap();

        let reloaded = db.get_job(j.id).unwrap().unwrap();
        assert!(!classify(&db, &reloaded).unwrap());
        assert_eq!(status_of(&db, j.id), JobStatus::Interested);
    }

    #[test]
    fn test_rules_of_other_users_do_not_apply() {
        let (db, user_id) = setup();
        let sam = db.get_or_create_user("sam").unwrap();
        db.add_rule(sam.id, RuleKind::Title, "senior").unwrap();
        let j = job(&db, user_id, "Senior Backend Engineer", "Acme");
        assert!(!classify(&db, &j).unwrap());
    }

    #[test]
    fn test_deleting_rule_restores_job() {
        let (db, user_id) = setup();
        let (rule_id, report) = add_rule(&db, &UserLocks::default(), user_id, RuleKind::Title, "senior").unwrap();
        assert_eq!(report, ReapplyReport::default());

        let j = job(&db, user_id, "Senior Backend Engineer", "Acme");
        assert!(classify(&db, &j).unwrap());
        assert_eq!(status_of(&db, j.id), JobStatus::Blacklist);

        let report = delete_rule(&db, &UserLocks::default(), user_id, rule_id).unwrap().unwrap();
        assert_eq!(report.restored, 1);
        assert_eq!(status_of(&db, j.id), JobStatus::New);
    }

    #[test]
    fn test_adding_rule_blacklists_existing_new_jobs_only() {
        let (db, user_id) = setup();
        let fresh = job(&db, user_id, "Senior Backend Engineer", "Acme");
        let liked = job(&db, user_id, "Senior Frontend Engineer", "Acme");
        db.transition(liked.id, Action::Accept).unwrap();
        db.transition(liked.id, Action::Accept).unwrap();

        let (_, report) = add_rule(&db, &UserLocks::default(), user_id, RuleKind::Title, "senior").unwrap();
        assert_eq!(report.blacklisted, 1);
        assert_eq!(status_of(&db, fresh.id), JobStatus::Blacklist);
        assert_eq!(status_of(&db, liked.id), JobStatus::Liked);
    }

    #[test]
    fn test_reapply_keeps_blacklist_while_another_rule_matches() {
        let (db, user_id) = setup();
        let senior = db.add_rule(user_id, RuleKind::Title, "senior").unwrap();
        db.add_rule(user_id, RuleKind::Company, "Acme").unwrap();
        let j = job(&db, user_id, "Senior Backend Engineer", "Acme");
        classify(&db, &j).unwrap();

        delete_rule(&db, &UserLocks::default(), user_id, senior).unwrap().unwrap();
        assert_eq!(status_of(&db, j.id), JobStatus::Blacklist);
    }

    #[test]
    fn test_reapply_twice_is_stable() {
        let (db, user_id) = setup();
        db.add_rule(user_id, RuleKind::Title, "senior").unwrap();
        job(&db, user_id, "Senior Backend Engineer", "Acme");
        job(&db, user_id, "Backend Engineer", "Acme");

        let first = reapply(&db, user_id).unwrap();
        assert_eq!(first.blacklisted, 1);
        let second = reapply(&db, user_id).unwrap();
        // Already-blacklisted jobs are no longer `new`, so nothing moves
        assert_eq!(second, ReapplyReport::default());
    }

    #[test]
    fn test_delete_unknown_rule() {
        let (db, user_id) = setup();
        assert!(delete_rule(&db, &UserLocks::default(), user_id, 42).unwrap().is_none());
    }

    #[test]
    fn test_add_rule_rejects_blank_term() {
        let (db, user_id) = setup();
        assert!(add_rule(&db, &UserLocks::default(), user_id, RuleKind::Title, "  ").is_err());
    }

    #[test]
    fn test_rule_change_refused_while_crawl_holds_lease() {
        let (db, user_id) = setup();
        let fresh = job(&db, user_id, "Senior Backend Engineer", "Acme");
        let locks = UserLocks::new(LeaseConfig {
            wait: Duration::ZERO,
            ..LeaseConfig::default()
        });

        let crawl = locks.shared(&db, user_id).unwrap();
        let err = add_rule(&db, &locks, user_id, RuleKind::Title, "senior").unwrap_err();
        assert!(matches!(err.downcast_ref::<LeaseError>(), Some(LeaseError::Busy { .. })));
        assert!(db.list_rules(user_id).unwrap().is_empty());
        assert_eq!(status_of(&db, fresh.id), JobStatus::New);

        drop(crawl);
        let (rule_id, report) = add_rule(&db, &locks, user_id, RuleKind::Title, "senior").unwrap();
        assert_eq!(report.blacklisted, 1);

        let _crawl = locks.shared(&db, user_id).unwrap();
        assert!(delete_rule(&db, &locks, user_id, rule_id).is_err());
        assert_eq!(status_of(&db, fresh.id), JobStatus::Blacklist);
    }

    #[test]
    fn test_rule_change_waits_for_crawl_to_finish() {
        let (db, user_id) = setup();
        let fresh = job(&db, user_id, "Senior Backend Engineer", "Acme");
        let locks = UserLocks::new(LeaseConfig {
            wait: Duration::from_secs(5),
            poll: Duration::from_millis(10),
            ..LeaseConfig::default()
        });

        let crawl = locks.shared(&db, user_id).unwrap();
        thread::scope(|scope| {
            scope.spawn(move || {
                thread::sleep(Duration::from_millis(100));
                drop(crawl);
            });
            add_rule(&db, &locks, user_id, RuleKind::Title, "senior").unwrap();
        });
        assert_eq!(status_of(&db, fresh.id), JobStatus::Blacklist);
    }
}
