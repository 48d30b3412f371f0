//! Turning the change feed into a work list.

use crate::cursor::DEFAULT_WINDOW;
use crate::error::Result;
use crate::listing::AppListing;
use picsmap_protocol::{AppId, CatalogClient, ChangeNumber};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::instrument;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnumerationSettings {
    /// Changes to look back over when there is no usable history.
    pub window: u32,
    /// Stop collecting once this many distinct apps are known.
    pub max_apps: usize,
    /// Consecutive full-update signals tolerated before switching to the full listing.
    pub max_full_update_signals: u32,
    pub poll_delay: Duration,
    /// Cursor step taken when the feed reports no progress and no changes.
    pub stall_step: u32,
    pub stall_delay: Duration,
    pub full_update_delay: Duration,
}

impl Default for EnumerationSettings {
    fn default() -> Self {
        Self {
            window: DEFAULT_WINDOW,
            max_apps: 500_000,
            max_full_update_signals: 3,
            poll_delay: Duration::from_millis(100),
            stall_step: 500,
            stall_delay: Duration::from_millis(100),
            full_update_delay: Duration::from_secs(1),
        }
    }
}

/// Where a work list came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, derive_more::Display)]
pub enum EnumerationSource {
    #[display("change feed")]
    ChangeFeed,
    #[display("full listing")]
    FullListing,
}

/// Why change-feed enumeration stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Halt {
    /// The cursor caught up with the remote's current change number.
    CaughtUp,
    /// The app cap was hit.
    Capped,
    /// A changes call failed; the cursor stays at the last answered point.
    Interrupted,
    /// The full listing replaced the change feed.
    FullListing,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Enumeration {
    /// Sorted, deduplicated.
    pub apps: Vec<AppId>,
    /// The point of the change feed this work list covers up to.
    pub cursor: ChangeNumber,
    pub source: EnumerationSource,
    pub halt: Halt,
    /// Changes calls answered.
    pub rounds: usize,
}

/// Walks the change feed from a starting cursor up to the remote's current
/// change number.
pub struct CatalogEnumerator {
    client: CatalogClient,
    listing: Arc<dyn AppListing>,
    settings: EnumerationSettings,
}

impl CatalogEnumerator {
    pub fn new(client: CatalogClient, listing: Arc<dyn AppListing>, settings: EnumerationSettings) -> Self {
        Self {
            client,
            listing,
            settings,
        }
    }

    /// Every app the full listing knows about, covering the feed up to `current`.
    #[instrument(skip(self), fields(listing = self.listing.name()))]
    pub async fn full_listing(&self, current: ChangeNumber) -> Result<Enumeration> {
        let apps = self.listing.list_apps().await?;
        Ok(Enumeration {
            apps,
            cursor: current,
            source: EnumerationSource::FullListing,
            halt: Halt::FullListing,
            rounds: 0,
        })
    }

    /// Collect every app changed between `start` and `current`.
    ///
    /// Falls back to [`full_listing`](Self::full_listing) once the feed has
    /// asked for a full update too many times in a row. A failed changes call
    /// ends enumeration early with what was gathered so far; only a failing
    /// full listing is an error.
    #[instrument(skip(self))]
    pub async fn enumerate(&self, start: ChangeNumber, current: ChangeNumber) -> Result<Enumeration> {
        let settings = &self.settings;
        let mut since = start;
        let mut apps = BTreeSet::new();
        let mut signals = 0u32;
        let mut rounds = 0usize;
        let mut halt = Halt::CaughtUp;
        tracing::info!(from = start, to = current, "enumerating changes");

        while since < current {
            let changes = match self.client.changes_since(since).await {
                Ok(changes) => changes,
                Err(e) => {
                    tracing::warn!(since, "changes request failed, stopping enumeration: {e:?}");
                    halt = Halt::Interrupted;
                    break;
                },
            };
            rounds += 1;

            if changes.requires_full() {
                signals += 1;
                tracing::warn!(since, signals, "change feed requires a full update");
                if signals >= settings.max_full_update_signals {
                    tracing::info!("falling back to the full catalog listing");
                    return self.full_listing(current).await.map(|listing| Enumeration { rounds, ..listing });
                }
                sleep(settings.full_update_delay).await;
                continue;
            }
            signals = 0;

            let count = changes.app_changes.len();
            apps.extend(changes.app_changes.keys().copied());
            let mut last = changes.last_change_number;
            if last <= since {
                if count == 0 {
                    since = since.saturating_add(settings.stall_step).min(current);
                    tracing::debug!(since, "no progress reported, stepping forward");
                    if since < current {
                        sleep(settings.stall_delay).await;
                    }
                    continue;
                }
                let step = u32::try_from(count).unwrap_or(u32::MAX).max(1);
                last = current.min(since.saturating_add(step));
            }
            since = last;
            tracing::debug!(since, changed = count, total = apps.len(), "enumeration round");

            if apps.len() >= settings.max_apps {
                tracing::warn!(apps = apps.len(), "app cap reached, stopping enumeration");
                halt = Halt::Capped;
                break;
            }
            if since < current {
                sleep(settings.poll_delay).await;
            }
        }

        tracing::info!(apps = apps.len(), cursor = since, rounds, "enumeration finished");
        Ok(Enumeration {
            apps: apps.into_iter().collect(),
            cursor: since,
            source: EnumerationSource::ChangeFeed,
            halt,
            rounds,
        })
    }
}

async fn sleep(delay: Duration) {
    if !delay.is_zero() {
        tokio::time::sleep(delay).await;
    }
}
