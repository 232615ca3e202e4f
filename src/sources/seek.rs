use reqwest::Url;
use scraper::Html;

use super::{element_text, id_from_href, selector, url_with_segment, RawPosting, SearchParams, SourceError};
use crate::models::Location;

const BASE_URL: &str = "https://www.seek.com.au/";
const LISTING_URL: &str = "https://www.seek.com.au/job/";

fn location_segment(location: Location) -> Option<&'static str> {
    match location {
        Location::Australia => None,
        Location::Brisbane => Some("in-All-Brisbane-QLD"),
        Location::Melbourne => Some("in-All-Melbourne-VIC"),
        Location::Sydney => Some("in-All-Sydney-NSW"),
        Location::Adelaide => Some("in-All-Adelaide-SA"),
        Location::Perth => Some("in-All-Perth-WA"),
        Location::Darwin => Some("in-All-Darwin-NT"),
        Location::Hobart => Some("in-All-Hobart-TAS"),
    }
}

pub(super) fn search_url(params: &SearchParams) -> Result<Url, SourceError> {
    let slug = params.words().replace(' ', "-");
    let mut url = url_with_segment(BASE_URL, &format!("{slug}-jobs"))?;
    if let Some(segment) = location_segment(params.location) {
        url = url_with_segment(url.as_str(), segment)?;
    }
    {
        let mut query = url.query_pairs_mut();
        // Seek pages are 1-based
        query.append_pair("page", &(params.page + 1).to_string());
        if params.remote {
            query.append_pair("workarrangement", "2");
        }
    }
    Ok(url)
}

pub(super) fn listing_url(listing_id: &str) -> Result<Url, SourceError> {
    url_with_segment(LISTING_URL, listing_id)
}

pub(super) fn parse_results(html: &Html) -> Result<Vec<RawPosting>, SourceError> {
    let card = selector("article[data-automation='normalJob']")?;
    let title = selector("a[data-automation='jobTitle']")?;
    let company = selector("a[data-automation='jobCompany']")?;

    let mut postings = Vec::new();
    for element in html.select(&card) {
        let Some(link) = element.select(&title).next() else {
            continue;
        };
        let Some(listing_id) = link.value().attr("href").and_then(id_from_href) else {
            continue;
        };
        let company = element
            .select(&company)
            .next()
            .map(element_text)
            .unwrap_or_default();
        postings.push(RawPosting::new(listing_id, element_text(link), company));
    }
    Ok(postings)
}

pub(super) fn parse_description(html: &Html) -> Option<String> {
    let details = selector("div[data-automation='jobAdDetails']").ok()?;
    html.select(&details)
        .next()
        .map(|e| e.text().collect::<Vec<_>>().join("\n").trim().to_string())
        .filter(|text| !text.is_empty())
}
