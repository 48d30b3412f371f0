//! Turning product metadata trees into depot mappings.
//!
//! Parsing and applying are separate steps: [`ParsedApp::parse`] is pure and
//! fallible, [`DepotIndexBuilder::apply`] only performs upserts. An app whose
//! tree is malformed is therefore either applied completely or not at all.

use crate::error::{ErrorKind, Result};
use crate::index::{DepotIndex, Ownership};
use dashmap::DashSet;
use picsmap_protocol::{AppId, DepotId, KeyValue};
use std::sync::Arc;

/// Type tag (compared ignoring case) of sub-products.
pub const SUB_PRODUCT_TYPE: &str = "DLC";

/// Where an app being processed came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppOrigin {
    /// Part of the enumerated work list; its sub-products are discovered.
    WorkList,
    /// Discovered through a parent's sub-product list; not scanned further.
    SubProduct,
}

/// A depot entry as declared in an app's metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DepotRef {
    pub depot: DepotId,
    /// Owner named by `depotfromapp`, if any.
    pub declared_owner: Option<AppId>,
}

/// The parts of an app's metadata tree the index cares about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedApp {
    pub app: AppId,
    pub name: Option<String>,
    pub app_type: Option<String>,
    pub sub_products: Vec<AppId>,
    pub depots: Vec<DepotRef>,
}

impl ParsedApp {
    /// Parse an app's metadata. The tree may or may not be wrapped in an
    /// `appinfo` section.
    pub fn parse(app: AppId, tree: &KeyValue) -> Result<Self> {
        if tree.is_leaf() && tree.value.is_some() {
            exn::bail!(ErrorKind::MalformedApp {
                app,
                reason: "metadata is a scalar, not a tree",
            });
        }
        let root = tree.get("appinfo").unwrap_or(tree);
        let common = root.get("common");
        let field = |name: &str| {
            common
                .and_then(|common| common.get(name))
                .or_else(|| root.get(name))
                .and_then(KeyValue::as_str)
                .map(str::trim)
                .filter(|value| !value.is_empty())
                .map(str::to_string)
        };
        let name = field("name");
        let app_type = field("type");

        let sub_products = [
            root.path(["extended", "listofdlc"]),
            common.and_then(|c| c.get("listofdlc")),
            root.get("listofdlc"),
        ]
        .into_iter()
        .flatten()
        .find_map(KeyValue::as_str)
        .map(|list| parse_id_list(list, app))
        .unwrap_or_default();

        let depots = match root.get("depots") {
            None => Vec::new(),
            Some(section) if section.is_leaf() && section.value.is_some() => {
                exn::bail!(ErrorKind::MalformedApp {
                    app,
                    reason: "depots is a scalar, not a section",
                });
            },
            Some(section) => section
                .children
                .iter()
                .filter_map(|child| {
                    // Sibling keys such as `branches` or `baselanguages` are not depots.
                    let depot = child.name.parse::<DepotId>().ok()?;
                    let declared_owner = child.get("depotfromapp").and_then(KeyValue::as_u32);
                    Some(DepotRef { depot, declared_owner })
                })
                .collect(),
        };

        Ok(Self {
            app,
            name,
            app_type,
            sub_products,
            depots,
        })
    }

    pub fn is_sub_product(&self) -> bool {
        self.app_type.as_deref().is_some_and(|kind| kind.eq_ignore_ascii_case(SUB_PRODUCT_TYPE))
    }
}

/// Comma separated ids, skipping anything unparsable and the app itself.
fn parse_id_list(list: &str, app: AppId) -> Vec<AppId> {
    let mut ids: Vec<AppId> =
        list.split(',').filter_map(|id| id.trim().parse::<AppId>().ok()).filter(|id| *id != app).collect();
    ids.sort_unstable();
    ids.dedup();
    ids
}

/// Outcome of applying one app to the index.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AppReport {
    pub mapped: usize,
    /// Depots skipped as spurious self-references.
    pub rejected: usize,
    /// Sub-products not seen before, to be fetched in a supplementary round.
    pub new_sub_products: Vec<AppId>,
}

/// Applies product metadata to a shared [`DepotIndex`].
///
/// Also remembers which app ids are already scheduled or processed, so that
/// a sub-product listed by many parents is only handed back once.
#[derive(Debug)]
pub struct DepotIndexBuilder {
    index: Arc<DepotIndex>,
    known: DashSet<AppId>,
}

impl DepotIndexBuilder {
    pub fn new(index: Arc<DepotIndex>) -> Self {
        Self {
            index,
            known: DashSet::new(),
        }
    }

    pub fn index(&self) -> &Arc<DepotIndex> {
        &self.index
    }

    /// Mark apps as already scheduled for fetching.
    pub fn mark_known(&self, apps: impl IntoIterator<Item = AppId>) {
        for app in apps {
            self.known.insert(app);
        }
    }

    /// Parse and apply one app. A malformed tree is logged and skipped; it
    /// never affects other apps.
    pub fn process_app(&self, app: AppId, tree: &KeyValue, origin: AppOrigin) -> AppReport {
        match ParsedApp::parse(app, tree) {
            Ok(parsed) => self.apply(&parsed, origin),
            Err(e) => {
                let kind: &ErrorKind = &e;
                tracing::warn!(app, error = %kind, "skipping app with malformed metadata");
                AppReport::default()
            },
        }
    }

    pub fn apply(&self, parsed: &ParsedApp, origin: AppOrigin) -> AppReport {
        let app = parsed.app;
        self.known.insert(app);
        match &parsed.name {
            Some(name) => self.index.set_name(app, name.as_str()),
            None => self.index.ensure_named(app),
        }

        let is_sub_product = parsed.is_sub_product();
        let mut report = AppReport::default();
        for depot_ref in &parsed.depots {
            let (owner, ownership) = match depot_ref.declared_owner {
                Some(owner) => (owner, Ownership::Declared),
                None => (app, Ownership::Defaulted),
            };
            // Depot ids coinciding with the owner's app id are only genuine
            // for sub-products.
            if depot_ref.depot == owner && !is_sub_product {
                tracing::trace!(app, depot = depot_ref.depot, "rejecting self-referencing depot");
                report.rejected += 1;
                continue;
            }
            self.index.add_mapping(depot_ref.depot, owner, ownership);
            if ownership == Ownership::Declared {
                self.index.ensure_named(owner);
            }
            report.mapped += 1;
        }

        if origin == AppOrigin::WorkList {
            report.new_sub_products = parsed.sub_products.iter().copied().filter(|id| self.known.insert(*id)).collect();
        }
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use serde_json::json;
    use std::collections::BTreeSet;

    fn tree(value: serde_json::Value) -> KeyValue {
        KeyValue::from_json("", &value)
    }

    fn builder() -> DepotIndexBuilder {
        DepotIndexBuilder::new(Arc::new(DepotIndex::new()))
    }

    #[test]
    fn test_self_reference_rejected_for_games() {
        let builder = builder();
        let metadata = tree(json!({
            "appinfo": {
                "common": { "name": "Some Game", "type": "Game" },
                "depots": { "100": {}, "101": {} }
            }
        }));
        let report = builder.process_app(100, &metadata, AppOrigin::WorkList);
        assert_eq!(report.rejected, 1);
        assert_eq!(report.mapped, 1);
        assert_eq!(builder.index().apps_for(100), None);
        assert_eq!(builder.index().apps_for(101), Some(BTreeSet::from([100])));
    }

    #[test]
    fn test_self_reference_accepted_for_sub_products() {
        let builder = builder();
        let metadata = tree(json!({
            "common": { "name": "Soundtrack", "type": "DLC" },
            "depots": { "200": {} }
        }));
        let report = builder.process_app(200, &metadata, AppOrigin::SubProduct);
        assert_eq!(report.mapped, 1);
        assert!(builder.index().apps_for(200).unwrap().contains(&200));
    }

    #[test]
    fn test_declared_owner_with_placeholder_name() {
        let builder = builder();
        let metadata = tree(json!({
            "common": { "name": "Parent", "type": "game" },
            "depots": { "55": { "depotfromapp": "42" } }
        }));
        builder.process_app(10, &metadata, AppOrigin::WorkList);
        let index = builder.index();
        assert_eq!(index.owner(55), Some(42));
        assert!(index.apps_for(55).unwrap().contains(&42));
        assert_eq!(index.name(42).as_deref(), Some("App 42"));
        assert_eq!(index.name(10).as_deref(), Some("Parent"));
    }

    #[test]
    fn test_declared_owner_equal_to_depot_is_rejected_for_games() {
        let builder = builder();
        let metadata = tree(json!({
            "common": { "type": "Game" },
            "depots": { "77": { "depotfromapp": "77" } }
        }));
        let report = builder.process_app(10, &metadata, AppOrigin::WorkList);
        assert_eq!(report.rejected, 1);
        assert_eq!(builder.index().depot_count(), 0);
    }

    #[test]
    fn test_sub_products_are_returned_once() {
        let builder = builder();
        builder.mark_known([1, 2]);
        let first = tree(json!({ "common": { "type": "Game" }, "extended": { "listofdlc": "2, 30,31,abc,30" } }));
        let second = tree(json!({ "common": { "type": "Game" }, "extended": { "listofdlc": "31,32" } }));
        assert_eq!(builder.process_app(1, &first, AppOrigin::WorkList).new_sub_products, vec![30, 31]);
        assert_eq!(builder.process_app(3, &second, AppOrigin::WorkList).new_sub_products, vec![32]);
    }

    #[test]
    fn test_sub_products_of_sub_products_are_not_scanned() {
        let builder = builder();
        let metadata = tree(json!({ "common": { "type": "DLC", "listofdlc": "900" } }));
        let report = builder.process_app(30, &metadata, AppOrigin::SubProduct);
        assert!(report.new_sub_products.is_empty());
    }

    #[test]
    fn test_missing_name_falls_back_to_placeholder() {
        let builder = builder();
        builder.process_app(5, &tree(json!({ "depots": { "6": {} } })), AppOrigin::WorkList);
        assert_eq!(builder.index().name(5).as_deref(), Some("App 5"));
        assert_eq!(builder.index().apps_for(6), Some(BTreeSet::from([5])));
    }

    #[test]
    fn test_non_numeric_depot_keys_are_ignored() {
        let parsed = ParsedApp::parse(
            1,
            &tree(json!({
                "depots": { "branches": { "public": { "buildid": "1" } }, "baselanguages": "english", "2": {} }
            })),
        )
        .unwrap();
        assert_eq!(parsed.depots, vec![DepotRef { depot: 2, declared_owner: None }]);
    }

    #[rstest]
    #[case(json!("just a string"))]
    #[case(json!({ "depots": "oops" }))]
    fn test_malformed_metadata(#[case] raw: serde_json::Value) {
        let err = ParsedApp::parse(9, &tree(raw)).unwrap_err();
        assert!(matches!(&*err, ErrorKind::MalformedApp { app: 9, .. }));
    }

    #[test]
    fn test_malformed_app_does_not_touch_index() {
        let builder = builder();
        let metadata = tree(json!({ "common": { "name": "X" }, "depots": "oops" }));
        let report = builder.process_app(9, &metadata, AppOrigin::WorkList);
        assert_eq!(report, AppReport::default());
        assert_eq!(builder.index().name(9), None);
    }

    #[rstest]
    #[case("dlc", true)]
    #[case("DLC", true)]
    #[case("Game", false)]
    #[case("Music", false)]
    fn test_sub_product_type(#[case] kind: &str, #[case] expected: bool) {
        let parsed = ParsedApp::parse(1, &tree(json!({ "common": { "type": kind } }))).unwrap();
        assert_eq!(parsed.is_sub_product(), expected);
    }
}
