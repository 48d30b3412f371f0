//! Full catalog listings, used when the change feed can't serve a diff.

use crate::error::{ErrorKind, Result};
use async_trait::async_trait;
use exn::ResultExt;
use picsmap_protocol::AppId;
use serde::Deserialize;
use std::time::Duration;

/// A source of every app id the catalog knows about.
#[async_trait]
pub trait AppListing: Send + Sync {
    fn name(&self) -> &str;

    /// All known app ids, sorted and deduplicated.
    async fn list_apps(&self) -> Result<Vec<AppId>>;
}

/// The public web API app list.
#[derive(Debug, Clone)]
pub struct WebApiListing {
    client: reqwest::Client,
    url: String,
}

impl WebApiListing {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let url = url.into();
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .or_raise(|| ErrorKind::Listing(format!("could not build HTTP client for {url}")))?;
        Ok(Self { client, url })
    }
}

#[async_trait]
impl AppListing for WebApiListing {
    fn name(&self) -> &str {
        &self.url
    }

    #[tracing::instrument(skip(self), fields(url = %self.url))]
    async fn list_apps(&self) -> Result<Vec<AppId>> {
        let failed = || ErrorKind::Listing(self.url.clone());
        let response = self
            .client
            .get(&self.url)
            .send()
            .await
            .or_raise(failed)?
            .error_for_status()
            .or_raise(failed)?;
        let body = response.bytes().await.or_raise(failed)?;
        let apps = parse_app_list(&body).or_raise(failed)?;
        tracing::info!(apps = apps.len(), "retrieved full catalog listing");
        Ok(apps)
    }
}

#[derive(Deserialize)]
struct AppListEnvelope {
    applist: AppList,
}

#[derive(Deserialize)]
struct AppList {
    #[serde(default)]
    apps: Vec<AppListEntry>,
}

#[derive(Deserialize)]
struct AppListEntry {
    #[serde(default)]
    appid: serde_json::Value,
}

/// Parse `{"applist": {"apps": [{"appid": 10, ...}, ...]}}`. Entries without a
/// usable 32-bit id are skipped.
fn parse_app_list(body: &[u8]) -> std::result::Result<Vec<AppId>, serde_json::Error> {
    let envelope: AppListEnvelope = serde_json::from_slice(body)?;
    let mut apps: Vec<AppId> = envelope
        .applist
        .apps
        .into_iter()
        .filter_map(|entry| entry.appid.as_u64())
        .filter_map(|id| AppId::try_from(id).ok())
        .collect();
    apps.sort_unstable();
    apps.dedup();
    Ok(apps)
}

/// A fixed listing.
#[derive(Debug, Clone, Default)]
pub struct StaticListing {
    apps: Vec<AppId>,
}

impl StaticListing {
    pub fn new(apps: impl IntoIterator<Item = AppId>) -> Self {
        let mut apps: Vec<AppId> = apps.into_iter().collect();
        apps.sort_unstable();
        apps.dedup();
        Self { apps }
    }
}

#[async_trait]
impl AppListing for StaticListing {
    fn name(&self) -> &str {
        "static"
    }

    async fn list_apps(&self) -> Result<Vec<AppId>> {
        Ok(self.apps.clone())
    }
}
