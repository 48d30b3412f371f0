//! Loading, reconciling and saving the persisted index.
//!
//! The file is read once at startup and written once at the end of a run.
//! Reconciliation never loses information: app sets are unioned, names are
//! only ever filled in, and an owner is only replaced by one discovered in
//! the current run.

use crate::error::{ErrorKind, Result};
use crate::index::{DepotRecord, IndexSnapshot, is_placeholder};
use crate::models::{PersistedDepot, PersistedIndex, PersistedMetadata, SCHEMA_VERSION};
use exn::ResultExt;
use picsmap_protocol::ChangeNumber;
use std::collections::btree_map::Entry;
use std::io::Write;
use std::path::{Path, PathBuf};
use time::{Duration, OffsetDateTime};
use tracing::instrument;

pub const DEFAULT_SOURCE: &str = "pics";
pub const DEFAULT_UPDATE_INTERVAL: Duration = Duration::days(2);

/// State recovered from a previous run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PriorIndex {
    pub snapshot: IndexSnapshot,
    pub cursor: ChangeNumber,
}

impl From<PersistedIndex> for PriorIndex {
    fn from(persisted: PersistedIndex) -> Self {
        let mut snapshot = IndexSnapshot::default();
        for (depot, entry) in persisted.depot_mappings {
            if entry.app_ids.is_empty() {
                continue;
            }
            // Files written before owners were tracked list the owner first.
            let owner = entry.owner_id.filter(|owner| entry.app_ids.contains(owner)).or(entry.app_ids.first().copied());
            for (app, name) in entry.app_ids.iter().zip(&entry.app_names) {
                insert_name(&mut snapshot, *app, name);
            }
            let mut record = DepotRecord::new(entry.app_ids, owner);
            record.discovered_at = entry.discovered_at;
            snapshot.depots.insert(depot, record);
        }
        Self {
            snapshot,
            cursor: persisted.metadata.last_change_number,
        }
    }
}

/// Insert-if-absent, except that a placeholder yields to a real name.
fn insert_name(snapshot: &mut IndexSnapshot, app: u32, name: &str) {
    match snapshot.names.entry(app) {
        Entry::Vacant(slot) => {
            slot.insert(name.to_string());
        },
        Entry::Occupied(mut slot) => {
            if is_placeholder(app, slot.get()) && !is_placeholder(app, name) {
                slot.insert(name.to_string());
            }
        },
    }
}

/// Combine a prior index with the state gathered this run.
pub fn merge(prior: IndexSnapshot, live: IndexSnapshot) -> IndexSnapshot {
    let mut combined = prior;
    for (depot, live_record) in live.depots {
        match combined.depots.entry(depot) {
            Entry::Vacant(slot) => {
                slot.insert(live_record);
            },
            Entry::Occupied(mut slot) => {
                let record = slot.get_mut();
                record.apps.extend(live_record.apps);
                record.owner = live_record.owner.or(record.owner);
                record.discovered_at = record.discovered_at.or(live_record.discovered_at);
            },
        }
    }
    for (app, name) in &live.names {
        insert_name(&mut combined, *app, name);
    }
    combined
}

/// Reads and writes the persisted index file.
#[derive(Debug, Clone)]
pub struct PersistenceMerger {
    path: PathBuf,
    source: String,
    update_interval: Duration,
}

impl PersistenceMerger {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            source: DEFAULT_SOURCE.to_string(),
            update_interval: DEFAULT_UPDATE_INTERVAL,
        }
    }

    /// Provenance tag written on every depot entry.
    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = source.into();
        self
    }

    /// Distance between `lastUpdated` and `nextUpdateDue`.
    pub fn with_update_interval(mut self, interval: Duration) -> Self {
        self.update_interval = interval;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the prior index. A missing file is `Ok(None)`.
    pub async fn try_load(&self) -> Result<Option<PriorIndex>> {
        let bytes = match tokio::fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e).or_raise(|| ErrorKind::Io(self.path.clone())),
        };
        let persisted: PersistedIndex =
            serde_json::from_slice(&bytes).or_raise(|| ErrorKind::Deserialize(self.path.clone()))?;
        Ok(Some(persisted.into()))
    }

    /// Read the prior index, treating any failure as "no prior data".
    #[instrument(skip(self), fields(path = %self.path.display()))]
    pub async fn load(&self) -> Option<PriorIndex> {
        match self.try_load().await {
            Ok(Some(prior)) => {
                tracing::info!(
                    depots = prior.snapshot.depots.len(),
                    mappings = prior.snapshot.mapping_count(),
                    cursor = prior.cursor,
                    "loaded existing index"
                );
                Some(prior)
            },
            Ok(None) => {
                tracing::info!("no existing index found");
                None
            },
            Err(e) => {
                tracing::warn!("ignoring unreadable index: {e:?}");
                None
            },
        }
    }

    /// Build the on-disk representation of `snapshot` as of `now`.
    pub fn to_persisted(&self, snapshot: &IndexSnapshot, cursor: ChangeNumber, now: OffsetDateTime) -> PersistedIndex {
        let depot_mappings = snapshot
            .depots
            .iter()
            .filter(|(_, record)| !record.apps.is_empty())
            .map(|(depot, record)| {
                let app_ids = record.ordered_apps();
                let app_names = app_ids.iter().map(|app| snapshot.display_name(*app)).collect();
                let entry = PersistedDepot {
                    owner_id: record.owner,
                    app_ids,
                    app_names,
                    source: self.source.clone(),
                    discovered_at: Some(record.discovered_at.unwrap_or(now)),
                };
                (*depot, entry)
            })
            .collect();
        PersistedIndex {
            metadata: PersistedMetadata {
                last_updated: now,
                total_mappings: snapshot.mapping_count() as u64,
                version: SCHEMA_VERSION.to_string(),
                next_update_due: now + self.update_interval,
                last_change_number: cursor,
            },
            depot_mappings,
        }
    }

    /// Write `snapshot` with `cursor` as the resume point.
    pub async fn save(&self, snapshot: &IndexSnapshot, cursor: ChangeNumber) -> Result<PersistedMetadata> {
        self.save_at(snapshot, cursor, OffsetDateTime::now_utc()).await
    }

    /// Write through a temporary file in the same directory, so readers see
    /// either the old or the new index.
    #[instrument(skip(self, snapshot, now), fields(path = %self.path.display()))]
    pub async fn save_at(
        &self,
        snapshot: &IndexSnapshot,
        cursor: ChangeNumber,
        now: OffsetDateTime,
    ) -> Result<PersistedMetadata> {
        let persisted = self.to_persisted(snapshot, cursor, now);
        let json = serde_json::to_vec_pretty(&persisted).or_raise(|| ErrorKind::Serialize)?;
        let path = self.path.clone();
        let result = tokio::task::spawn_blocking(move || write_atomically(&path, &json)).await;
        result.or_raise(|| ErrorKind::Io(self.path.clone()))??;
        tracing::info!(
            depots = persisted.depot_mappings.len(),
            total_mappings = persisted.metadata.total_mappings,
            cursor,
            "saved index"
        );
        Ok(persisted.metadata)
    }
}

fn write_atomically(path: &Path, contents: &[u8]) -> Result<()> {
    let directory = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };
    let io_error = || ErrorKind::Io(path.to_path_buf());
    std::fs::create_dir_all(&directory).or_raise(io_error)?;
    let mut file = tempfile::NamedTempFile::new_in(&directory).or_raise(io_error)?;
    file.write_all(contents).or_raise(io_error)?;
    file.as_file().sync_all().or_raise(io_error)?;
    file.persist(path).or_raise(io_error)?;
    Ok(())
}
