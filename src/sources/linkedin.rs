use reqwest::Url;
use scraper::Html;

use super::{element_text, id_from_href, parse_url, selector, url_with_segment, RawPosting, SearchParams, SourceError};
use crate::models::Location;

const SEARCH_URL: &str = "https://www.linkedin.com/jobs-guest/jobs/api/seeMoreJobPostings/search";
const LISTING_URL: &str = "https://au.linkedin.com/jobs/view/";
const RESULTS_PER_PAGE: u32 = 10;
const REMOTE_WORKPLACE_TYPE: &str = "2";

/// LinkedIn geo ids. Opaque numbers with no meaning outside LinkedIn.
fn geo_id(location: Location) -> &'static str {
    match location {
        Location::Australia => "101452733",
        Location::Brisbane => "104468365",
        Location::Melbourne => "100992797",
        Location::Sydney => "104769905",
        Location::Adelaide => "107042567",
        Location::Perth => "103392068",
        Location::Darwin => "102342003",
        Location::Hobart => "101413980",
    }
}

pub(super) fn search_url(params: &SearchParams) -> Result<Url, SourceError> {
    let mut url = parse_url(SEARCH_URL)?;
    {
        let mut query = url.query_pairs_mut();
        query
            .append_pair("keywords", &params.words())
            .append_pair("start", &(params.page * RESULTS_PER_PAGE).to_string())
            .append_pair("geoId", geo_id(params.location));
        if params.remote {
            query.append_pair("f_WT", REMOTE_WORKPLACE_TYPE);
        }
    }
    Ok(url)
}

pub(super) fn listing_url(listing_id: &str) -> Result<Url, SourceError> {
    url_with_segment(LISTING_URL, listing_id)
}

pub(super) fn parse_results(html: &Html) -> Result<Vec<RawPosting>, SourceError> {
    let card = selector("li")?;
    let link = selector("a")?;
    let title = selector("h3")?;
    let company = selector("h4")?;

    let mut postings = Vec::new();
    for element in html.select(&card) {
        let mut links = element.select(&link);
        let Some(first) = links.next() else {
            continue;
        };
        let href = first.value().attr("href").unwrap_or("");
        // Promoted cards and sign-in prompts link elsewhere
        if !href.contains("linkedin.com/jobs/view/") {
            continue;
        }
        let Some(listing_id) = id_from_href(href) else {
            continue;
        };
        let title = element
            .select(&title)
            .next()
            .map(element_text)
            .unwrap_or_else(|| element_text(first));
        let company = element
            .select(&company)
            .next()
            .map(element_text)
            .or_else(|| links.next().map(element_text))
            .unwrap_or_default();
        postings.push(RawPosting::new(listing_id, title, company));
    }
    Ok(postings)
}

pub(super) fn parse_description(html: &Html) -> Option<String> {
    let markup = selector("div.show-more-less-html__markup").ok()?;
    html.select(&markup)
        .next()
        .map(|e| e.text().collect::<Vec<_>>().join("\n").trim().to_string())
        .filter(|text| !text.is_empty())
}
