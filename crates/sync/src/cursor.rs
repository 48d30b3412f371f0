//! Run mode resolution and the change cursor.

use picsmap_protocol::{CatalogClient, ChangeNumber};

/// How far back a run without usable history looks into the change feed.
pub const DEFAULT_WINDOW: u32 = 50_000;

/// Mode requested by the user.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RunMode {
    /// Rebuild from the full catalog.
    Full,
    /// Only look at changes since the persisted cursor.
    Incremental,
    /// Incremental if a previous run left a cursor behind, full otherwise.
    #[default]
    Auto,
}

/// Mode a run actually executes in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, derive_more::Display)]
pub enum Strategy {
    #[display("full")]
    Full,
    #[display("incremental")]
    Incremental,
}

/// Owns the last-seen change number for the duration of a run.
///
/// The cursor only moves forward: [`advance`](Self::advance) ignores any value
/// below the current one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeCursorTracker {
    last_seen: ChangeNumber,
    strategy: Strategy,
    window: u32,
}

impl ChangeCursorTracker {
    /// `prior` is the cursor of the persisted index, if one was loaded.
    pub fn resolve(mode: RunMode, prior: Option<ChangeNumber>) -> Self {
        let last_seen = prior.unwrap_or(0);
        let strategy = match mode {
            RunMode::Full => Strategy::Full,
            RunMode::Incremental => Strategy::Incremental,
            RunMode::Auto if last_seen > 0 => Strategy::Incremental,
            RunMode::Auto => Strategy::Full,
        };
        Self {
            last_seen,
            strategy,
            window: DEFAULT_WINDOW,
        }
    }

    pub fn with_window(mut self, window: u32) -> Self {
        self.window = window;
        self
    }

    pub fn last_seen(&self) -> ChangeNumber {
        self.last_seen
    }

    pub fn strategy(&self) -> Strategy {
        self.strategy
    }

    pub fn is_incremental(&self) -> bool {
        self.strategy == Strategy::Incremental
    }

    /// A full run rebuilds from the full listing whatever cursor is stored;
    /// the change feed only covers a bounded window.
    pub fn needs_full_listing(&self) -> bool {
        self.strategy == Strategy::Full
    }

    /// Where change enumeration begins, given the remote's current cursor.
    pub fn decide_starting_point(&self, current: ChangeNumber) -> ChangeNumber {
        if self.is_incremental() && self.last_seen > 0 {
            self.last_seen
        } else {
            current.saturating_sub(self.window)
        }
    }

    /// Move the cursor forward to `reached`; never backwards.
    pub fn advance(&mut self, reached: ChangeNumber) -> ChangeNumber {
        self.last_seen = self.last_seen.max(reached);
        self.last_seen
    }

    /// The catalog's current change number, or 0 if it can't be obtained.
    pub async fn remote_cursor(client: &CatalogClient) -> ChangeNumber {
        match client.current_change_number().await {
            Ok(current) => current,
            Err(e) => {
                tracing::warn!("could not obtain current change number, assuming 0: {e:?}");
                0
            },
        }
    }
}
