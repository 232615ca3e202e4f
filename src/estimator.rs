use anyhow::Result;

use crate::db::Database;
use crate::models::SearchQuery;
use crate::sources::Site;

/// Depth assumed for a (site, query) pair that has never been crawled.
pub const DEFAULT_PAGES: u32 = 1;

/// Remembers how deep each (site, query) crawl went last time.
pub struct PageCountEstimator<'a> {
    db: &'a Database,
}

impl<'a> PageCountEstimator<'a> {
    pub fn new(db: &'a Database) -> Self {
        Self { db }
    }

    pub fn estimate(&self, site: Site, query: &SearchQuery) -> Result<u32> {
        Ok(self
            .db
            .get_page_count(site, &query.signature())?
            .unwrap_or(DEFAULT_PAGES))
    }

    pub fn record(&self, site: Site, query: &SearchQuery, observed: u32) -> Result<()> {
        self.db.upsert_page_count(site, &query.signature(), observed)
    }
}

/// Reporting horizon for one crawl. Starts at the estimate and widens a page
/// at a time once the crawl walks past it. It never stops the crawl.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CrawlProgress {
    pub horizon: u32,
    pub done: u32,
    pub widened: u32,
}

impl CrawlProgress {
    pub fn new(estimate: u32) -> Self {
        Self {
            horizon: estimate.max(1),
            done: 0,
            widened: 0,
        }
    }

    /// Count one finished page.
    pub fn advance(&mut self) {
        self.done += 1;
        if self.done > self.horizon {
            self.horizon += 1;
            self.widened += 1;
        }
    }
}
