//! One complete collection run.

use crate::cursor::{ChangeCursorTracker, RunMode, Strategy};
use crate::enumerate::{CatalogEnumerator, EnumerationSettings, EnumerationSource, Halt};
use crate::error::{ErrorKind, Result};
use crate::fetch::{FetchSettings, FetchStats, ProductBatchFetcher};
use crate::listing::AppListing;
use exn::ResultExt;
use picsmap_index::{DepotIndex, DepotIndexBuilder, PersistenceMerger, merge};
use picsmap_protocol::{CatalogClient, ChangeNumber};
use std::sync::Arc;
use tracing::instrument;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncSettings {
    pub enumeration: EnumerationSettings,
    pub fetch: FetchSettings,
    /// Use the full listing for full runs. When off, a full run walks the
    /// change feed window instead.
    pub bootstrap_from_full_listing: bool,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            enumeration: EnumerationSettings::default(),
            fetch: FetchSettings::default(),
            bootstrap_from_full_listing: true,
        }
    }
}

/// What a run did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunSummary {
    pub strategy: Strategy,
    pub source: EnumerationSource,
    pub halt: Halt,
    pub work_list: usize,
    pub fetch: FetchStats,
    pub depots: usize,
    pub mappings: usize,
    pub apps: usize,
    pub prior_cursor: ChangeNumber,
    pub cursor: ChangeNumber,
}

/// Drives enumeration, fetching and persistence over an established session.
pub struct Collector {
    client: CatalogClient,
    listing: Arc<dyn AppListing>,
    merger: PersistenceMerger,
    settings: SyncSettings,
}

impl Collector {
    pub fn new(
        client: CatalogClient,
        listing: Arc<dyn AppListing>,
        merger: PersistenceMerger,
        settings: SyncSettings,
    ) -> Self {
        Self {
            client,
            listing,
            merger,
            settings,
        }
    }

    /// Load the previous index, collect what changed, merge and save.
    ///
    /// Nothing is written if enumeration fails, so the previous cursor stays
    /// in place for the next run.
    #[instrument(skip(self), fields(output = %self.merger.path().display()))]
    pub async fn run(&self, mode: RunMode) -> Result<RunSummary> {
        let prior = self.merger.load().await;
        let stored = prior.as_ref().map(|prior| prior.cursor);
        let mut tracker = ChangeCursorTracker::resolve(mode, stored).with_window(self.settings.enumeration.window);
        let prior_cursor = tracker.last_seen();
        tracing::info!(strategy = %tracker.strategy(), cursor = prior_cursor, "starting collection");

        let current = ChangeCursorTracker::remote_cursor(&self.client).await;
        let enumerator = CatalogEnumerator::new(
            self.client.clone(),
            self.listing.clone(),
            self.settings.enumeration.clone(),
        );
        let enumeration = if tracker.needs_full_listing() && self.settings.bootstrap_from_full_listing {
            tracing::info!("full run, using the full catalog listing");
            enumerator.full_listing(current).await?
        } else {
            let start = tracker.decide_starting_point(current);
            enumerator.enumerate(start, current).await?
        };

        let index = Arc::new(DepotIndex::new());
        let builder = Arc::new(DepotIndexBuilder::new(index.clone()));
        let fetcher = ProductBatchFetcher::new(self.client.clone(), builder, self.settings.fetch.clone());
        let fetch = fetcher.fetch(&enumeration.apps).await;

        let cursor = tracker.advance(enumeration.cursor);
        let live = index.snapshot();
        let combined = match prior {
            Some(prior) => merge(prior.snapshot, live),
            None => live,
        };
        self.merger.save(&combined, cursor).await.or_raise(|| ErrorKind::Persist)?;

        let summary = RunSummary {
            strategy: tracker.strategy(),
            source: enumeration.source,
            halt: enumeration.halt,
            work_list: enumeration.apps.len(),
            fetch,
            depots: combined.depots.len(),
            mappings: combined.mapping_count(),
            apps: combined.names.len(),
            prior_cursor,
            cursor,
        };
        tracing::info!(
            mappings = summary.mappings,
            depots = summary.depots,
            apps = summary.apps,
            batches_ok = summary.fetch.batches_ok,
            batches_failed = summary.fetch.batches_failed,
            fetched = summary.fetch.apps_fetched,
            sub_products = summary.fetch.sub_products_fetched,
            cursor,
            "collection complete"
        );
        Ok(summary)
    }
}
