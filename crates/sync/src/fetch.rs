//! Batched two-phase product info fetching.
//!
//! Each batch asks for access tokens first, then for product info with
//! whatever tokens were granted. Batches run strictly one after another; a
//! failed batch is logged and skipped, and nothing from it reaches the index.

use crate::error::{ErrorKind, Result};
use exn::ResultExt;
use picsmap_index::{AppOrigin, DepotIndexBuilder};
use picsmap_protocol::messages::ProductRequest;
use picsmap_protocol::{AppId, CatalogClient};
use std::sync::Arc;
use std::time::Duration;
use tracing::instrument;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchSettings {
    pub batch_size: usize,
    pub batch_delay: Duration,
    /// Log progress every this many batches.
    pub progress_every: usize,
    /// Run a supplementary round for sub-products of the work list.
    pub discover_sub_products: bool,
}

impl Default for FetchSettings {
    fn default() -> Self {
        Self {
            batch_size: 200,
            batch_delay: Duration::from_millis(150),
            progress_every: 10,
            discover_sub_products: true,
        }
    }
}

/// Running totals of a fetch. Abandoned batches contribute nothing except
/// to `batches_failed`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FetchStats {
    pub batches_ok: usize,
    pub batches_failed: usize,
    pub apps_fetched: usize,
    pub sub_products_fetched: usize,
    /// Apps the catalog reported as unknown.
    pub unknown_apps: usize,
    pub tokens_denied: usize,
    pub depots_mapped: usize,
    pub self_references_rejected: usize,
}

impl FetchStats {
    fn absorb(&mut self, batch: &BatchOutcome) {
        self.batches_ok += 1;
        self.apps_fetched += batch.apps;
        self.unknown_apps += batch.unknown_apps;
        self.tokens_denied += batch.tokens_denied;
        self.depots_mapped += batch.mapped;
        self.self_references_rejected += batch.rejected;
    }
}

#[derive(Debug, Default)]
struct BatchOutcome {
    apps: usize,
    unknown_apps: usize,
    tokens_denied: usize,
    mapped: usize,
    rejected: usize,
    sub_products: Vec<AppId>,
}

pub struct ProductBatchFetcher {
    client: CatalogClient,
    builder: Arc<DepotIndexBuilder>,
    settings: FetchSettings,
}

impl ProductBatchFetcher {
    pub fn new(client: CatalogClient, builder: Arc<DepotIndexBuilder>, settings: FetchSettings) -> Self {
        Self {
            client,
            builder,
            settings,
        }
    }

    /// Fetch every app of `work_list` into the index, followed by one round
    /// for sub-products they declare that weren't already in the list.
    #[instrument(skip_all, fields(apps = work_list.len()))]
    pub async fn fetch(&self, work_list: &[AppId]) -> FetchStats {
        self.builder.mark_known(work_list.iter().copied());
        let mut stats = FetchStats::default();
        let sub_products = self.run_round(work_list, AppOrigin::WorkList, &mut stats).await;

        if self.settings.discover_sub_products && !sub_products.is_empty() {
            tracing::info!(count = sub_products.len(), "fetching discovered sub-products");
            let before = stats.apps_fetched;
            self.run_round(&sub_products, AppOrigin::SubProduct, &mut stats).await;
            stats.sub_products_fetched = stats.apps_fetched - before;
        }
        stats
    }

    /// Returns the new sub-products discovered during the round.
    async fn run_round(&self, apps: &[AppId], origin: AppOrigin, stats: &mut FetchStats) -> Vec<AppId> {
        let batch_size = self.settings.batch_size.max(1);
        let total = apps.len().div_ceil(batch_size);
        let mut discovered = Vec::new();

        for (i, batch) in apps.chunks(batch_size).enumerate() {
            if i > 0 && !self.settings.batch_delay.is_zero() {
                tokio::time::sleep(self.settings.batch_delay).await;
            }
            match self.fetch_batch(batch, origin).await {
                Ok(mut outcome) => {
                    stats.absorb(&outcome);
                    discovered.append(&mut outcome.sub_products);
                },
                Err(e) => {
                    stats.batches_failed += 1;
                    tracing::warn!(batch = i + 1, size = batch.len(), "abandoning batch: {e:?}");
                },
            }

            let done = i + 1;
            if done % self.settings.progress_every.max(1) == 0 || done == total {
                tracing::info!(
                    batch = done,
                    total,
                    percent = done * 100 / total,
                    mappings = self.builder.index().mapping_count(),
                    "fetch progress"
                );
            }
        }

        discovered.sort_unstable();
        discovered.dedup();
        discovered
    }

    async fn fetch_batch(&self, batch: &[AppId], origin: AppOrigin) -> Result<BatchOutcome> {
        let tokens = self.client.access_tokens(batch).await.or_raise(|| ErrorKind::Catalog)?;
        if !tokens.denied.is_empty() {
            tracing::debug!(denied = ?tokens.denied, "access tokens denied");
        }
        let requests = batch
            .iter()
            .map(|app| ProductRequest {
                app_id: *app,
                access_token: tokens.app_tokens.get(app).copied(),
            })
            .collect();
        let parts = self.client.product_info(requests).await.or_raise(|| ErrorKind::Catalog)?;

        let mut outcome = BatchOutcome {
            tokens_denied: tokens.denied.len(),
            ..BatchOutcome::default()
        };
        for part in &parts {
            outcome.unknown_apps += part.unknown_apps.len();
            for (app, tree) in &part.apps {
                let report = self.builder.process_app(*app, tree, origin);
                outcome.apps += 1;
                outcome.mapped += report.mapped;
                outcome.rejected += report.rejected;
                outcome.sub_products.extend(report.new_sub_products);
            }
        }
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use picsmap_index::DepotIndex;
    use picsmap_protocol::messages::{AccessTokensResponse, ProductInfoPart, Request, Response};
    use picsmap_protocol::transport::MockTransport;
    use picsmap_protocol::{KeyValue, Session, Timeouts};
    use serde_json::json;
    use std::collections::{BTreeMap, BTreeSet};

    fn settings(batch_size: usize) -> FetchSettings {
        FetchSettings {
            batch_size,
            batch_delay: Duration::ZERO,
            ..FetchSettings::default()
        }
    }

    fn tokens_for(apps: &[AppId]) -> Response {
        Response::AccessTokens(AccessTokensResponse {
            app_tokens: apps.iter().map(|app| (*app, u64::from(*app) * 1000)).collect(),
            denied: Vec::new(),
        })
    }

    /// One part per requested app; app `n` owns depot `n + 1`.
    fn product_info(requests: &[ProductRequest], metadata: impl Fn(AppId) -> serde_json::Value) -> Vec<Response> {
        let count = requests.len();
        requests
            .iter()
            .enumerate()
            .map(|(i, request)| {
                Response::ProductInfo(ProductInfoPart {
                    apps: BTreeMap::from([(request.app_id, KeyValue::from_json("appinfo", &metadata(request.app_id)))]),
                    unknown_apps: Vec::new(),
                    response_pending: i + 1 < count,
                })
            })
            .collect()
    }

    fn game(app: AppId) -> serde_json::Value {
        json!({ "common": { "name": format!("Game {app}"), "type": "Game" }, "depots": { (app + 1).to_string(): {} } })
    }

    fn fetcher(session: &Session, batch_size: usize) -> ProductBatchFetcher {
        let builder = Arc::new(DepotIndexBuilder::new(Arc::new(DepotIndex::new())));
        ProductBatchFetcher::new(session.client().clone(), builder, settings(batch_size))
    }

    #[tokio::test]
    async fn test_batches_request_tokens_before_product_info() {
        let transport = Arc::new(MockTransport::logged_on(|request| match request {
            Request::AccessTokens { apps } => vec![tokens_for(apps)],
            Request::ProductInfo { apps } => product_info(apps, game),
            _ => vec![],
        }));
        let session = Session::establish(transport.clone(), Timeouts::default()).await.unwrap();
        let fetcher = fetcher(&session, 2);
        let stats = fetcher.fetch(&[10, 20, 30, 40, 50]).await;
        assert_eq!(stats.batches_ok, 3);
        assert_eq!(stats.apps_fetched, 5);
        assert_eq!(stats.depots_mapped, 5);
        assert_eq!(fetcher.builder.index().apps_for(31), Some(BTreeSet::from([30])));

        let requests: Vec<_> = transport.requests().into_iter().filter(|r| *r != Request::LogOnAnonymous).collect();
        assert_eq!(requests.len(), 6);
        assert_eq!(requests[0], Request::AccessTokens { apps: vec![10, 20] });
        assert_eq!(
            requests[1],
            Request::ProductInfo {
                apps: vec![
                    ProductRequest { app_id: 10, access_token: Some(10_000) },
                    ProductRequest { app_id: 20, access_token: Some(20_000) },
                ]
            }
        );
        assert_eq!(requests[4], Request::AccessTokens { apps: vec![50] });
        session.close().await;
    }

    #[tokio::test]
    async fn test_failed_batch_is_skipped() {
        let transport = Arc::new(MockTransport::logged_on(|request| match request {
            Request::AccessTokens { apps } => vec![tokens_for(apps)],
            // The middle batch gets an answer of the wrong kind.
            Request::ProductInfo { apps } if apps[0].app_id == 30 => vec![tokens_for(&[])],
            Request::ProductInfo { apps } => product_info(apps, game),
            _ => vec![],
        }));
        let session = Session::establish(transport, Timeouts::default()).await.unwrap();
        let fetcher = fetcher(&session, 2);
        let stats = fetcher.fetch(&[10, 20, 30, 40, 50]).await;
        assert_eq!(stats.batches_ok, 2);
        assert_eq!(stats.batches_failed, 1);
        assert_eq!(stats.apps_fetched, 3);
        let index = fetcher.builder.index();
        assert_eq!(index.apps_for(31), None);
        assert_eq!(index.apps_for(41), None);
        assert!(index.apps_for(51).is_some());
        session.close().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_unanswered_batch_times_out_and_run_continues() {
        let transport = Arc::new(MockTransport::logged_on(|request| match request {
            Request::AccessTokens { apps } if apps.contains(&10) => vec![],
            Request::AccessTokens { apps } => vec![tokens_for(apps)],
            Request::ProductInfo { apps } => product_info(apps, game),
            _ => vec![],
        }));
        let timeouts = Timeouts {
            call: Duration::from_secs(5),
            ..Timeouts::default()
        };
        let session = Session::establish(transport, timeouts).await.unwrap();
        let fetcher = fetcher(&session, 1);
        let stats = fetcher.fetch(&[10, 20]).await;
        assert_eq!(stats.batches_failed, 1);
        assert_eq!(stats.batches_ok, 1);
        assert!(fetcher.builder.index().apps_for(21).is_some());
        session.close().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_batch_delay_only_between_batches() {
        let transport = Arc::new(MockTransport::logged_on(|request| match request {
            Request::AccessTokens { apps } => vec![tokens_for(apps)],
            Request::ProductInfo { apps } => product_info(apps, game),
            _ => vec![],
        }));
        let session = Session::establish(transport, Timeouts::default()).await.unwrap();
        let builder = Arc::new(DepotIndexBuilder::new(Arc::new(DepotIndex::new())));
        let settings = FetchSettings {
            batch_size: 2,
            batch_delay: Duration::from_millis(150),
            ..FetchSettings::default()
        };
        let fetcher = ProductBatchFetcher::new(session.client().clone(), builder, settings);

        let started = tokio::time::Instant::now();
        let stats = fetcher.fetch(&[10, 20, 30, 40, 50]).await;
        assert_eq!(stats.batches_ok, 3);
        // Three batches, two gaps.
        assert_eq!(started.elapsed(), Duration::from_millis(300));
        session.close().await;
    }

    #[tokio::test]
    async fn test_sub_products_fetched_in_one_extra_round() {
        let transport = Arc::new(MockTransport::logged_on(|request| match request {
            Request::AccessTokens { apps } => vec![tokens_for(apps)],
            Request::ProductInfo { apps } => product_info(apps, |app| match app {
                1 => json!({
                    "common": { "name": "Base", "type": "Game", "listofdlc": "2,100,101" },
                    "depots": { "5": {} }
                }),
                // A sub-product whose own sub-products must not be followed.
                100 => json!({
                    "common": { "name": "Expansion", "type": "DLC", "listofdlc": "200" },
                    "depots": { "100": {} }
                }),
                other => json!({ "common": { "name": format!("App {other}"), "type": "DLC" } }),
            }),
            _ => vec![],
        }));
        let session = Session::establish(transport.clone(), Timeouts::default()).await.unwrap();
        let fetcher = fetcher(&session, 200);
        let stats = fetcher.fetch(&[1, 2]).await;
        assert_eq!(stats.apps_fetched, 4);
        assert_eq!(stats.sub_products_fetched, 2);
        assert_eq!(fetcher.builder.index().apps_for(100), Some(BTreeSet::from([100])));

        let fetched: Vec<AppId> = transport
            .requests()
            .into_iter()
            .filter_map(|request| match request {
                Request::ProductInfo { apps } => Some(apps.into_iter().map(|a| a.app_id).collect::<Vec<_>>()),
                _ => None,
            })
            .flatten()
            .collect();
        assert_eq!(fetched, vec![1, 2, 100, 101]);
        session.close().await;
    }

    #[tokio::test]
    async fn test_denied_tokens_and_unknown_apps_are_counted() {
        let transport = Arc::new(MockTransport::logged_on(|request| match request {
            Request::AccessTokens { apps } => vec![Response::AccessTokens(AccessTokensResponse {
                app_tokens: BTreeMap::new(),
                denied: apps.clone(),
            })],
            Request::ProductInfo { apps } => {
                assert!(apps.iter().all(|a| a.access_token.is_none()));
                vec![Response::ProductInfo(ProductInfoPart {
                    apps: BTreeMap::from([(7, KeyValue::from_json("appinfo", &game(7)))]),
                    unknown_apps: vec![8],
                    response_pending: false,
                })]
            },
            _ => vec![],
        }));
        let session = Session::establish(transport, Timeouts::default()).await.unwrap();
        let fetcher = fetcher(&session, 200);
        let stats = fetcher.fetch(&[7, 8]).await;
        assert_eq!(stats.tokens_denied, 2);
        assert_eq!(stats.unknown_apps, 1);
        assert_eq!(stats.apps_fetched, 1);
        session.close().await;
    }
}
