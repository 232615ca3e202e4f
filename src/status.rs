use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Review stage of a job. Only `JobStatus::apply` decides what comes next.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    New,
    Blacklist,
    /// Older term-filter status. Behaves exactly like `Blacklist`.
    EasyFilter,
    Interested,
    NotInterested,
    Liked,
    Applied,
    Complete,
}

/// What a caller (or the blacklist classifier) asks to happen to a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    /// Keep the job moving: triage -> reading -> applying.
    Accept,
    /// Drop the job at triage, reading or before applying.
    Reject,
    /// The application has been submitted.
    MarkApplied,
    /// Hide a finished application.
    Archive,
    /// A blacklist rule matched.
    Blacklist,
    /// No blacklist rule matches anymore.
    Restore,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TransitionError {
    #[error("job #{job_id}: cannot {action} from status '{from}'")]
    Illegal {
        job_id: i64,
        from: JobStatus,
        action: Action,
    },

    #[error("job #{job_id} not found")]
    NotFound { job_id: i64 },

    #[error("job #{job_id} changed status concurrently (expected '{expected}')")]
    Stale { job_id: i64, expected: JobStatus },
}

impl JobStatus {
    pub const ALL: [JobStatus; 8] = [
        JobStatus::New,
        JobStatus::Blacklist,
        JobStatus::EasyFilter,
        JobStatus::Interested,
        JobStatus::NotInterested,
        JobStatus::Liked,
        JobStatus::Applied,
        JobStatus::Complete,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::New => "new",
            JobStatus::Blacklist => "blacklist",
            JobStatus::EasyFilter => "easy_filter",
            JobStatus::Interested => "interested",
            JobStatus::NotInterested => "not_interested",
            JobStatus::Liked => "liked",
            JobStatus::Applied => "applied",
            JobStatus::Complete => "complete",
        }
    }

    pub fn is_blacklisted(&self) -> bool {
        matches!(self, JobStatus::Blacklist | JobStatus::EasyFilter)
    }

    /// The edge table. Returns the next status, or `None` when `action` has
    /// no outgoing edge from `self`.
    pub fn next(self, action: Action) -> Option<JobStatus> {
        use Action::*;
        use JobStatus::*;

        match (self, action) {
            (New, Accept) => Some(Interested),
            (New, Reject) => Some(NotInterested),
            (New, Action::Blacklist) => Some(JobStatus::Blacklist),
            (JobStatus::Blacklist | EasyFilter, Restore) => Some(New),
            (Interested, Accept) => Some(Liked),
            (Interested, Reject) => Some(NotInterested),
            (Liked, MarkApplied) => Some(Applied),
            (Liked, Reject) => Some(NotInterested),
            (Applied, Archive) => Some(Complete),
            _ => None,
        }
    }

    pub fn apply(self, job_id: i64, action: Action) -> Result<JobStatus, TransitionError> {
        self.next(action).ok_or(TransitionError::Illegal {
            job_id,
            from: self,
            action,
        })
    }

    /// Tie-break order used when merging duplicate jobs: applied, liked and
    /// interested win over everything else; the rest fall back to
    /// declaration order.
    pub fn merge_precedence(&self) -> u8 {
        match self {
            JobStatus::Applied => 0,
            JobStatus::Liked => 1,
            JobStatus::Interested => 2,
            other => 3 + *other as u8,
        }
    }

    /// Reader-facing name of the review stage a status belongs to.
    pub fn stage(&self) -> Option<&'static str> {
        match self {
            JobStatus::New => Some("triage"),
            JobStatus::Interested => Some("reading"),
            JobStatus::Liked => Some("applying"),
            JobStatus::Applied => Some("applied"),
            _ => None,
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        JobStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| anyhow::anyhow!("Unknown status '{}'", s))
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Action::Accept => "accept",
            Action::Reject => "reject",
            Action::MarkApplied => "mark applied",
            Action::Archive => "archive",
            Action::Blacklist => "blacklist",
            Action::Restore => "restore",
        };
        f.pad(name)
    }
}
