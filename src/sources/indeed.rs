use reqwest::Url;
use scraper::Html;

use super::{element_text, parse_url, selector, RawPosting, SearchParams, SourceError};
use crate::models::Location;

const SEARCH_URL: &str = "https://au.indeed.com/jobs";
const LISTING_URL: &str = "https://au.indeed.com/viewjob";
const RESULTS_PER_PAGE: u32 = 10;
const REMOTE_FILTER: &str = "0kf:attr(DSQF7);";

fn location_param(location: Location) -> &'static str {
    match location {
        Location::Australia => "Australia",
        Location::Brisbane => "Brisbane QLD",
        Location::Melbourne => "Melbourne VIC",
        Location::Sydney => "Sydney NSW",
        Location::Adelaide => "Adelaide SA",
        Location::Perth => "Perth WA",
        Location::Darwin => "Darwin NT",
        Location::Hobart => "Hobart TAS",
    }
}

pub(super) fn search_url(params: &SearchParams) -> Result<Url, SourceError> {
    let mut url = parse_url(SEARCH_URL)?;
    {
        let mut query = url.query_pairs_mut();
        query
            .append_pair("q", &params.words())
            .append_pair("l", location_param(params.location))
            .append_pair("start", &(params.page * RESULTS_PER_PAGE).to_string());
        if params.remote {
            query.append_pair("sc", REMOTE_FILTER);
        }
    }
    Ok(url)
}

pub(super) fn listing_url(listing_id: &str) -> Result<Url, SourceError> {
    let mut url = parse_url(LISTING_URL)?;
    url.query_pairs_mut().append_pair("jk", listing_id);
    Ok(url)
}

/// Indeed answers out-of-range offsets with its last page, so results only
/// count when the highlighted page number is past the requested index.
pub(super) fn parse_results(html: &Html, page: u32) -> Result<Vec<RawPosting>, SourceError> {
    let current = selector("a[data-testid='pagination-page-current']")?;
    let current_page = html
        .select(&current)
        .next()
        .and_then(|e| element_text(e).parse::<u32>().ok());
    match current_page {
        Some(shown) if shown > page => {}
        _ => return Ok(Vec::new()),
    }

    let card = selector("td.resultContent")?;
    let link = selector("a")?;
    let company = selector("span[data-testid='company-name']")?;

    let mut postings = Vec::new();
    for element in html.select(&card) {
        let Some(anchor) = element.select(&link).next() else {
            continue;
        };
        // ids look like `job_5d3a1b2c3d4e5f60`
        let Some(listing_id) = anchor
            .value()
            .attr("id")
            .and_then(|id| id.split_once('_'))
            .map(|(_, id)| id.to_string())
        else {
            continue;
        };
        postings.push(RawPosting::new(
            listing_id,
            element_text(anchor),
            element.select(&company).next().map(element_text).unwrap_or_default(),
        ));
    }
    Ok(postings)
}

pub(super) fn parse_description(html: &Html) -> Option<String> {
    let description = selector("div.jobsearch-JobComponent-description").ok()?;
    html.select(&description)
        .next()
        .map(|e| e.text().collect::<Vec<_>>().join("\n").trim().to_string())
        .filter(|text| !text.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn results_page(current: u32) -> String {
        format!(
            r#"<table><tr><td class="resultContent">
                 <h2><a id="job_5d3a1b2c3d4e5f60" href="/rc/clk?jk=5d3a1b2c3d4e5f60">Backend Engineer</a></h2>
                 <span data-testid="company-name">Acme Pty Ltd</span>
               </td></tr></table>
               <nav><a data-testid="pagination-page-current">{current}</a></nav>"#
        )
    }

    #[test]
    fn test_search_url() {
        let params = SearchParams {
            term: "rust".to_string(),
            location: Location::Australia,
            remote: true,
            page: 1,
        };
        assert_eq!(
            search_url(&params).unwrap().as_str(),
            "https://au.indeed.com/jobs?q=rust&l=Australia&start=10&sc=0kf%3Aattr%28DSQF7%29%3B"
        );
    }

    #[test]
    fn test_listing_url() {
        assert_eq!(
            listing_url("5d3a1b2c3d4e5f60").unwrap().as_str(),
            "https://au.indeed.com/viewjob?jk=5d3a1b2c3d4e5f60"
        );
    }

    #[test]
    fn test_parse_results() {
        let html = Html::parse_document(&results_page(1));
        assert_eq!(
            parse_results(&html, 0).unwrap(),
            vec![RawPosting::new("5d3a1b2c3d4e5f60", "Backend Engineer", "Acme Pty Ltd")]
        );
    }

    #[test]
    fn test_parse_results_repeated_last_page() {
        // Asking for index 3 but Indeed still highlights page 3
        let html = Html::parse_document(&results_page(3));
        assert!(parse_results(&html, 3).unwrap().is_empty());
    }

    #[test]
    fn test_parse_results_without_pagination() {
        let html = Html::parse_document("<p>No jobs found</p>");
        assert!(parse_results(&html, 0).unwrap().is_empty());
    }
}
