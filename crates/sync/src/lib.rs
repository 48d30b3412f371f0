//! Synchronizing the depot index with the catalog.
//!
//! A run resolves its mode from the persisted cursor ([`ChangeCursorTracker`]),
//! turns the change feed (or the full listing) into a work list
//! ([`CatalogEnumerator`]), fetches product info for it in throttled batches
//! ([`ProductBatchFetcher`]) and hands the result to the index crate for
//! merging and saving. [`Collector`] strings those steps together.

mod collect;
mod cursor;
mod enumerate;
pub mod error;
mod fetch;
mod listing;

pub use collect::{Collector, RunSummary, SyncSettings};
pub use cursor::{ChangeCursorTracker, DEFAULT_WINDOW, RunMode, Strategy};
pub use enumerate::{CatalogEnumerator, Enumeration, EnumerationSettings, EnumerationSource, Halt};
pub use fetch::{FetchSettings, FetchStats, ProductBatchFetcher};
pub use listing::{AppListing, StaticListing, WebApiListing};
