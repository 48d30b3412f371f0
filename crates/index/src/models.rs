//! On-disk shape of the persisted index.
//!
//! Pretty-printed JSON with camelCase keys. `appIds` and `appNames` are
//! parallel arrays: index `i` of both refers to the same app.

use picsmap_protocol::{AppId, ChangeNumber, DepotId};
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::BTreeMap;
use time::OffsetDateTime;

pub const SCHEMA_VERSION: &str = "1.0";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistedIndex {
    #[serde(default)]
    pub metadata: PersistedMetadata,
    #[serde(default, deserialize_with = "numeric_keys")]
    pub depot_mappings: BTreeMap<DepotId, PersistedDepot>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistedMetadata {
    #[serde(with = "time::serde::rfc3339")]
    pub last_updated: OffsetDateTime,
    pub total_mappings: u64,
    pub version: String,
    #[serde(with = "time::serde::rfc3339")]
    pub next_update_due: OffsetDateTime,
    #[serde(default)]
    pub last_change_number: ChangeNumber,
}

impl Default for PersistedMetadata {
    fn default() -> Self {
        Self {
            last_updated: OffsetDateTime::UNIX_EPOCH,
            total_mappings: 0,
            version: SCHEMA_VERSION.to_string(),
            next_update_due: OffsetDateTime::UNIX_EPOCH,
            last_change_number: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistedDepot {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner_id: Option<AppId>,
    #[serde(default)]
    pub app_ids: Vec<AppId>,
    #[serde(default)]
    pub app_names: Vec<String>,
    #[serde(default)]
    pub source: String,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub discovered_at: Option<OffsetDateTime>,
}

/// Depot ids are stored as JSON object keys; keys that aren't valid ids are
/// dropped rather than failing the whole file.
fn numeric_keys<'de, D: Deserializer<'de>>(deserializer: D) -> Result<BTreeMap<DepotId, PersistedDepot>, D::Error> {
    let raw = BTreeMap::<String, PersistedDepot>::deserialize(deserializer)?;
    Ok(raw
        .into_iter()
        .filter_map(|(key, depot)| match key.trim().parse::<DepotId>() {
            Ok(id) => Some((id, depot)),
            Err(_) => {
                tracing::debug!(key, "ignoring non-numeric depot key");
                None
            },
        })
        .collect())
}
