//! Job boards. Every board is a `Site` variant behind the one
//! `SourceAdapter` capability; the crawl loop never knows which it talks to.

mod indeed;
mod jora;
mod linkedin;
mod seek;

use anyhow::{anyhow, Context, Result};
use reqwest::Url;
use scraper::{Html, Selector};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

use crate::models::{Location, SearchQuery};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Site {
    Seek,
    Jora,
    LinkedIn,
    Indeed,
}

impl Site {
    pub const ALL: [Site; 4] = [Site::Seek, Site::Jora, Site::LinkedIn, Site::Indeed];

    pub fn as_str(&self) -> &'static str {
        match self {
            Site::Seek => "seek",
            Site::Jora => "jora",
            Site::LinkedIn => "linkedin",
            Site::Indeed => "indeed",
        }
    }

    /// Search-results URL for one page of a query.
    pub fn search_url(&self, params: &SearchParams) -> Result<Url, SourceError> {
        match self {
            Site::Seek => seek::search_url(params),
            Site::Jora => jora::search_url(params),
            Site::LinkedIn => linkedin::search_url(params),
            Site::Indeed => indeed::search_url(params),
        }
    }

    pub fn listing_url(&self, listing_id: &str) -> Result<Url, SourceError> {
        if listing_id.trim().is_empty() {
            return Err(SourceError::InvalidQuery("empty listing id".to_string()));
        }
        match self {
            Site::Seek => seek::listing_url(listing_id),
            Site::Jora => jora::listing_url(listing_id),
            Site::LinkedIn => linkedin::listing_url(listing_id),
            Site::Indeed => indeed::listing_url(listing_id),
        }
    }

    fn parse_results(&self, html: &Html, params: &SearchParams) -> Result<Vec<RawPosting>, SourceError> {
        match self {
            Site::Seek => seek::parse_results(html),
            Site::Jora => jora::parse_results(html, params.page),
            Site::LinkedIn => linkedin::parse_results(html),
            Site::Indeed => indeed::parse_results(html, params.page),
        }
    }

    fn parse_description(&self, html: &Html) -> Option<String> {
        match self {
            Site::Seek => seek::parse_description(html),
            Site::Jora => jora::parse_description(html),
            Site::LinkedIn => linkedin::parse_description(html),
            Site::Indeed => indeed::parse_description(html),
        }
    }
}

impl fmt::Display for Site {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

impl FromStr for Site {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        Site::ALL
            .into_iter()
            .find(|site| site.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| anyhow!("Unknown site '{}'. Available: seek, jora, linkedin, indeed", s))
    }
}

/// One posting as it appears on a results page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawPosting {
    pub listing_id: String,
    pub title: String,
    pub company: String,
}

impl RawPosting {
    pub fn new(listing_id: impl Into<String>, title: impl Into<String>, company: impl Into<String>) -> Self {
        Self {
            listing_id: listing_id.into(),
            title: title.into(),
            company: company.into(),
        }
    }
}

#[derive(Debug, Error)]
pub enum SourceError {
    /// Network failure, timeout, rate limit or anti-bot page. Worth retrying.
    #[error("transient failure: {0}")]
    Transient(String),

    #[error("{site} does not support {feature}")]
    NotSupported { site: Site, feature: &'static str },

    #[error("invalid query: {0}")]
    InvalidQuery(String),

    /// The page came back but did not look like the board's layout.
    #[error("unrecognised page layout: {0}")]
    Layout(String),
}

impl SourceError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, SourceError::Transient(_) | SourceError::Layout(_))
    }
}

impl From<reqwest::Error> for SourceError {
    fn from(e: reqwest::Error) -> Self {
        SourceError::Transient(e.to_string())
    }
}

/// Board-facing view of a query: checked once, then substituted into URLs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchParams {
    pub term: String,
    pub location: Location,
    pub remote: bool,
    pub page: u32,
}

const MAX_TERM_LEN: usize = 200;

impl SearchParams {
    pub fn new(query: &SearchQuery, page: u32) -> Result<Self, SourceError> {
        let term = query.term.trim();
        if term.is_empty() {
            return Err(SourceError::InvalidQuery("empty search term".to_string()));
        }
        if term.len() > MAX_TERM_LEN {
            return Err(SourceError::InvalidQuery(format!(
                "search term longer than {} characters",
                MAX_TERM_LEN
            )));
        }
        if term.chars().any(|c| c.is_control()) {
            return Err(SourceError::InvalidQuery(
                "search term contains control characters".to_string(),
            ));
        }
        Ok(Self {
            term: term.to_string(),
            location: query.location.unwrap_or(Location::Australia),
            remote: query.remote,
            page,
        })
    }

    /// Term as space-separated words; saved terms often use `-` as a separator.
    pub fn words(&self) -> String {
        self.term
            .split(|c: char| c == '-' || c.is_whitespace())
            .filter(|w| !w.is_empty())
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// The narrow contract the coordinator crawls through.
pub trait SourceAdapter: Send + Sync {
    fn site(&self) -> Site;

    /// Postings on page `page_index` (0-based). Empty means no more results.
    fn fetch_page(&self, query: &SearchQuery, page_index: u32) -> Result<Vec<RawPosting>, SourceError>;

    /// Plain-text body of one listing.
    fn fetch_body(&self, listing_id: &str) -> Result<String, SourceError>;
}

/// HTTP adapter for a `Site`. Constructed per sweep and handed to the
/// coordinator; nothing is shared between sweeps.
pub struct WebSource {
    site: Site,
    client: reqwest::blocking::Client,
}

const USER_AGENT: &str =
    "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0 Safari/537.36";

impl WebSource {
    pub fn new(site: Site, timeout: Duration) -> Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .user_agent(USER_AGENT)
            .timeout(timeout)
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self { site, client })
    }

    pub fn all(timeout: Duration) -> Result<Vec<WebSource>> {
        Site::ALL.into_iter().map(|site| Self::new(site, timeout)).collect()
    }

    fn get_document(&self, url: Url) -> Result<Html, SourceError> {
        let response = self.client.get(url.clone()).send()?;
        let status = response.status();
        if status.as_u16() == 429 || status.is_server_error() {
            return Err(SourceError::Transient(format!("{} returned {}", url, status)));
        }
        let body = response.text()?;
        let html = Html::parse_document(&body);
        if is_challenge_page(&html) {
            return Err(SourceError::Transient(format!("{} served an anti-bot challenge", url)));
        }
        if !status.is_success() {
            return Err(SourceError::Layout(format!("{} returned {}", url, status)));
        }
        Ok(html)
    }
}

impl SourceAdapter for WebSource {
    fn site(&self) -> Site {
        self.site
    }

    fn fetch_page(&self, query: &SearchQuery, page_index: u32) -> Result<Vec<RawPosting>, SourceError> {
        let params = SearchParams::new(query, page_index)?;
        let url = self.site.search_url(&params)?;
        let html = self.get_document(url)?;
        self.site.parse_results(&html, &params)
    }

    fn fetch_body(&self, listing_id: &str) -> Result<String, SourceError> {
        let url = self.site.listing_url(listing_id)?;
        let html = self.get_document(url)?;
        self.site
            .parse_description(&html)
            .ok_or_else(|| SourceError::Layout(format!("no description for {} {}", self.site, listing_id)))
    }
}

fn is_challenge_page(html: &Html) -> bool {
    let Ok(title) = selector("title") else {
        return false;
    };
    html.select(&title)
        .next()
        .map(|t| t.text().collect::<String>().trim() == "Just a moment...")
        .unwrap_or(false)
}

fn parse_url(raw: &str) -> Result<Url, SourceError> {
    Url::parse(raw).map_err(|e| SourceError::InvalidQuery(format!("{raw}: {e}")))
}

/// `base` with one more path segment, percent-encoded.
fn url_with_segment(base: &str, segment: &str) -> Result<Url, SourceError> {
    let mut url = parse_url(base)?;
    url.path_segments_mut()
        .map_err(|_| SourceError::InvalidQuery(format!("{base} cannot take a path")))?
        .pop_if_empty()
        .push(segment);
    Ok(url)
}

fn selector(css: &str) -> Result<Selector, SourceError> {
    Selector::parse(css).map_err(|e| SourceError::Layout(format!("bad selector {css:?}: {e}")))
}

fn element_text(element: scraper::ElementRef) -> String {
    element
        .text()
        .collect::<Vec<_>>()
        .join(" ")
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// Last path segment of a link, without query string or fragment.
fn id_from_href(href: &str) -> Option<String> {
    let path = href.split(['?', '#']).next()?;
    let id = path.trim_end_matches('/').rsplit('/').next()?;
    if id.is_empty() { None } else { Some(id.to_string()) }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn query(term: &str) -> SearchQuery {
        SearchQuery {
            id: 1,
            user_id: 1,
            term: term.to_string(),
            remote: false,
            location: None,
            sites: vec![],
        }
    }

    #[test]
    fn test_site_parse() {
        assert_eq!("LinkedIn".parse::<Site>().unwrap(), Site::LinkedIn);
        assert_eq!("seek".parse::<Site>().unwrap(), Site::Seek);
        assert!("monster".parse::<Site>().is_err());
    }

    #[test]
    fn test_search_params_validation() {
        assert!(matches!(SearchParams::new(&query("  "), 0), Err(SourceError::InvalidQuery(_))));
        assert!(matches!(
            SearchParams::new(&query("rust\ndeveloper"), 0),
            Err(SourceError::InvalidQuery(_))
        ));
        assert!(SearchParams::new(&query(&"a".repeat(201)), 0).is_err());

        let params = SearchParams::new(&query(" software-engineer "), 2).unwrap();
        assert_eq!(params.term, "software-engineer");
        assert_eq!(params.location, Location::Australia);
        assert_eq!(params.page, 2);
        assert_eq!(params.words(), "software engineer");
    }

    #[test]
    fn test_id_from_href() {
        assert_eq!(id_from_href("/job/81234567?type=standard"), Some("81234567".to_string()));
        assert_eq!(id_from_href("https://au.jora.com/job/abc123/?sp=serp"), Some("abc123".to_string()));
        assert_eq!(id_from_href(""), None);
    }

    #[test]
    fn test_retryable_classification() {
        assert!(SourceError::Transient("timeout".into()).is_retryable());
        assert!(SourceError::Layout("missing cards".into()).is_retryable());
        assert!(!SourceError::NotSupported { site: Site::Jora, feature: "remote filter" }.is_retryable());
        assert!(!SourceError::InvalidQuery("empty".into()).is_retryable());
    }

    #[test]
    fn test_challenge_page_detection() {
        let html = Html::parse_document("<html><head><title>Just a moment...</title></head></html>");
        assert!(is_challenge_page(&html));
        let html = Html::parse_document("<html><head><title>Jobs</title></head></html>");
        assert!(!is_challenge_page(&html));
    }

    #[test]
    #[ignore] // Requires network access
    fn test_fetch_live_seek_page() {
        let source = WebSource::new(Site::Seek, Duration::from_secs(30)).unwrap();
        let result = source.fetch_page(&query("software engineer"), 0);
        assert!(result.is_ok() || result.unwrap_err().is_retryable());
    }
}
