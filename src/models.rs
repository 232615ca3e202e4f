use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::sources::Site;
use crate::status::JobStatus;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: i64,
    pub username: String,
}

/// A canonical opening, deduplicated across sources.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: i64,
    pub user_id: i64,
    pub title: String,
    pub company: String,
    pub fuzzy_key: String,
    status: JobStatus, // changed only through Database::transition
    pub created_at: String,
    pub updated_at: String,
}

impl Job {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn from_parts(
        id: i64,
        user_id: i64,
        title: String,
        company: String,
        fuzzy_key: String,
        status: JobStatus,
        created_at: String,
        updated_at: String,
    ) -> Self {
        Self {
            id,
            user_id,
            title,
            company,
            fuzzy_key,
            status,
            created_at,
            updated_at,
        }
    }

    pub fn status(&self) -> JobStatus {
        self.status
    }
}

/// One source's posting of a job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Listing {
    pub id: String,
    pub site: Site,
    pub job_id: i64,
    pub summary: String,
    pub first_seen: String,
}

impl Listing {
    pub fn key(&self) -> ListingKey {
        ListingKey::new(self.site, &self.id)
    }
}

/// `(site, id)`: the global identity of a listing.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ListingKey {
    pub site: Site,
    pub id: String,
}

impl ListingKey {
    pub fn new(site: Site, id: &str) -> Self {
        Self {
            site,
            id: id.to_string(),
        }
    }
}

impl fmt::Display for ListingKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.site, self.id)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PageCount {
    pub site: Site,
    pub query: String,
    pub pages: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleKind {
    /// Case-insensitive substring of the title.
    Title,
    /// Case-sensitive exact company name.
    Company,
}

impl RuleKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RuleKind::Title => "title",
            RuleKind::Company => "company",
        }
    }
}

impl FromStr for RuleKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s {
            "title" => Ok(RuleKind::Title),
            "company" => Ok(RuleKind::Company),
            _ => Err(anyhow::anyhow!("Unknown rule type '{}' (expected title or company)", s)),
        }
    }
}

impl fmt::Display for RuleKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlacklistRule {
    pub id: i64,
    pub user_id: i64,
    pub term: String,
    pub kind: RuleKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Location {
    Australia,
    Brisbane,
    Melbourne,
    Sydney,
    Adelaide,
    Perth,
    Darwin,
    Hobart,
}

impl Location {
    pub const ALL: [Location; 8] = [
        Location::Australia,
        Location::Brisbane,
        Location::Melbourne,
        Location::Sydney,
        Location::Adelaide,
        Location::Perth,
        Location::Darwin,
        Location::Hobart,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Location::Australia => "Australia",
            Location::Brisbane => "Brisbane",
            Location::Melbourne => "Melbourne",
            Location::Sydney => "Sydney",
            Location::Adelaide => "Adelaide",
            Location::Perth => "Perth",
            Location::Darwin => "Darwin",
            Location::Hobart => "Hobart",
        }
    }
}

impl FromStr for Location {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        Location::ALL
            .into_iter()
            .find(|l| l.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| anyhow::anyhow!("Unknown location '{}'", s))
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

/// A saved search, run against each of its sites on every sweep.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchQuery {
    pub id: i64,
    pub user_id: i64,
    pub term: String,
    pub remote: bool,
    pub location: Option<Location>,
    pub sites: Vec<Site>,
}

impl SearchQuery {
    /// Deterministic page-count key: `term[, Location][, Remote]`.
    pub fn signature(&self) -> String {
        let mut signature = self.term.trim().to_string();
        if let Some(location) = self.location {
            signature.push_str(", ");
            signature.push_str(location.as_str());
        }
        if self.remote {
            signature.push_str(", Remote");
        }
        signature
    }
}
