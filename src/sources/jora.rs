use regex::Regex;
use reqwest::Url;
use scraper::Html;

use super::{element_text, id_from_href, parse_url, selector, url_with_segment, RawPosting, SearchParams, Site, SourceError};
use crate::models::Location;

const SEARCH_URL: &str = "https://au.jora.com/j";
const LISTING_URL: &str = "https://au.jora.com/job/";
const END_OF_RESULTS: &str = "We have looked through all the results for you";

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
    if params.remote {
        return Err(SourceError::NotSupported {
            site: Site::Jora,
            feature: "remote filter",
        });
    }
    let mut url = parse_url(SEARCH_URL)?;
    url.query_pairs_mut()
        .append_pair("q", &params.words())
        .append_pair("l", location_param(params.location))
        .append_pair("p", &(params.page + 1).to_string());
    Ok(url)
}

pub(super) fn listing_url(listing_id: &str) -> Result<Url, SourceError> {
    url_with_segment(LISTING_URL, listing_id)
}

/// Jora keeps serving the last page for indexes past the end, so the page
/// counter decides when results are exhausted.
pub(super) fn parse_results(html: &Html, page: u32) -> Result<Vec<RawPosting>, SourceError> {
    let body_text = html.root_element().text().collect::<String>();
    if body_text.contains(END_OF_RESULTS) {
        return Ok(Vec::new());
    }

    let counter = selector("div.search-results-page-number")?;
    let Some(counter) = html.select(&counter).next() else {
        return Ok(Vec::new());
    };
    let digits = Regex::new(r"\d+").map_err(|e| SourceError::Layout(e.to_string()))?;
    let counter_text = element_text(counter);
    let last_page: u32 = digits
        .find_iter(&counter_text)
        .last()
        .and_then(|m| m.as_str().parse().ok())
        .ok_or_else(|| SourceError::Layout(format!("page counter '{}'", counter_text)))?;
    if page + 1 > last_page {
        return Ok(Vec::new());
    }

    let card = selector("div.job-card")?;
    let link = selector("a.job-link")?;
    let company = selector(".job-company")?;

    let mut postings = Vec::new();
    for element in html.select(&card) {
        let Some(anchor) = element.select(&link).next() else {
            continue;
        };
        let Some(listing_id) = anchor.value().attr("href").and_then(id_from_href) else {
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
    let container = selector("div#job-description-container").ok()?;
    html.select(&container)
        .next()
        .map(|e| e.text().collect::<Vec<_>>().join("\n").trim().to_string())
        .filter(|text| !text.is_empty())
}
