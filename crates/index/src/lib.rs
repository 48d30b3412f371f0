//! Depot → app index.
//!
//! - [`DepotIndex`]: the concurrent in-memory index filled while product info
//!   arrives.
//! - [`DepotIndexBuilder`]: turns an app's metadata tree into index upserts,
//!   rejecting spurious self-references and collecting sub-products.
//! - [`PersistenceMerger`]: loads a previous run's file, reconciles it with
//!   the live index and writes the result atomically.

mod builder;
pub mod error;
mod index;
pub mod models;
mod persist;

pub use builder::{AppOrigin, AppReport, DepotIndexBuilder, DepotRef, ParsedApp, SUB_PRODUCT_TYPE};
pub use index::{DepotIndex, DepotRecord, IndexSnapshot, Ownership, is_placeholder, placeholder_name};
pub use persist::{DEFAULT_SOURCE, DEFAULT_UPDATE_INTERVAL, PersistenceMerger, PriorIndex, merge};
