//! Shared in-memory index.
//!
//! [`DepotIndex`] is written from whichever task happens to be processing
//! product info, so every table is a [`DashMap`] and every mutation is a
//! single-key upsert. [`IndexSnapshot`] is the plain, ordered copy taken once
//! collection is over and handed to the [merger](crate::persist).

use dashmap::DashMap;
use picsmap_protocol::{AppId, DepotId};
use std::collections::{BTreeMap, BTreeSet};
use time::OffsetDateTime;

/// Display name used for an app whose real name is unknown.
pub fn placeholder_name(app: AppId) -> String {
    format!("App {app}")
}

/// `true` if `name` is exactly the synthesized placeholder for `app`.
pub fn is_placeholder(app: AppId, name: &str) -> bool {
    name.strip_prefix("App ").and_then(|rest| rest.parse::<AppId>().ok()) == Some(app)
}

/// How an owner was determined for a depot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ownership {
    /// Named by the depot's own metadata; always authoritative.
    Declared,
    /// Assumed to be the app whose metadata listed the depot.
    Defaulted,
}

#[derive(Debug, Default)]
pub struct DepotIndex {
    depots: DashMap<DepotId, BTreeSet<AppId>>,
    names: DashMap<AppId, String>,
    owners: DashMap<DepotId, AppId>,
}

impl DepotIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that `depot` belongs to `owner`.
    ///
    /// Owners accumulate as a set. A declared owner replaces whatever owner
    /// was recorded before; a defaulted one only fills a gap.
    pub fn add_mapping(&self, depot: DepotId, owner: AppId, ownership: Ownership) {
        self.depots.entry(depot).or_default().insert(owner);
        match ownership {
            Ownership::Declared => {
                self.owners.insert(depot, owner);
            },
            Ownership::Defaulted => {
                self.owners.entry(depot).or_insert(owner);
            },
        }
    }

    /// Record a name learned from the app's own metadata.
    pub fn set_name(&self, app: AppId, name: impl Into<String>) {
        self.names.insert(app, name.into());
    }

    /// Record the placeholder name for `app` unless a name is already known.
    pub fn ensure_named(&self, app: AppId) {
        self.names.entry(app).or_insert_with(|| placeholder_name(app));
    }

    pub fn name(&self, app: AppId) -> Option<String> {
        self.names.get(&app).map(|name| name.clone())
    }

    pub fn owner(&self, depot: DepotId) -> Option<AppId> {
        self.owners.get(&depot).map(|owner| *owner)
    }

    pub fn apps_for(&self, depot: DepotId) -> Option<BTreeSet<AppId>> {
        self.depots.get(&depot).map(|apps| apps.clone())
    }

    /// Number of distinct depots.
    pub fn depot_count(&self) -> usize {
        self.depots.len()
    }

    /// Number of depot→app pairs.
    pub fn mapping_count(&self) -> usize {
        self.depots.iter().map(|entry| entry.value().len()).sum()
    }

    pub fn app_name_count(&self) -> usize {
        self.names.len()
    }

    /// Ordered copy of the current state.
    pub fn snapshot(&self) -> IndexSnapshot {
        let depots = self
            .depots
            .iter()
            .map(|entry| {
                let depot = *entry.key();
                let record = DepotRecord {
                    apps: entry.value().clone(),
                    owner: self.owner(depot),
                    discovered_at: None,
                };
                (depot, record)
            })
            .collect();
        let names = self.names.iter().map(|entry| (*entry.key(), entry.value().clone())).collect();
        IndexSnapshot { depots, names }
    }
}

/// Everything known about one depot.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DepotRecord {
    pub apps: BTreeSet<AppId>,
    /// Always a member of `apps` when set.
    pub owner: Option<AppId>,
    /// When the depot first appeared in a persisted index; `None` until saved.
    pub discovered_at: Option<OffsetDateTime>,
}

impl DepotRecord {
    pub fn new(apps: impl IntoIterator<Item = AppId>, owner: Option<AppId>) -> Self {
        let apps: BTreeSet<AppId> = apps.into_iter().collect();
        let owner = owner.filter(|owner| apps.contains(owner));
        Self {
            apps,
            owner,
            discovered_at: None,
        }
    }

    /// App ids with the owner (if known and present) first, the rest in
    /// ascending order.
    pub fn ordered_apps(&self) -> Vec<AppId> {
        let owner = self.owner.filter(|owner| self.apps.contains(owner));
        owner
            .into_iter()
            .chain(self.apps.iter().copied().filter(|app| Some(*app) != owner))
            .collect()
    }
}

/// Plain ordered copy of an index, used for reconciliation and persistence.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IndexSnapshot {
    pub depots: BTreeMap<DepotId, DepotRecord>,
    pub names: BTreeMap<AppId, String>,
}

impl IndexSnapshot {
    /// Sum of per-depot app set sizes.
    pub fn mapping_count(&self) -> usize {
        self.depots.values().map(|record| record.apps.len()).sum()
    }

    /// Name for `app`, or its placeholder.
    pub fn display_name(&self, app: AppId) -> String {
        self.names.get(&app).cloned().unwrap_or_else(|| placeholder_name(app))
    }
}
