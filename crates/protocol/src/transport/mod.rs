//! Transport trait and implementations.
//!
//! A transport moves [`Envelope`]s to and from the catalog. It knows nothing
//! about correlation: the [`Dispatcher`](crate::Dispatcher) owns the
//! receiving half exclusively and routes every inbound frame to the request
//! it answers.

mod line;
#[cfg(any(test, feature = "mock"))]
mod mock;

pub use self::line::LineTransport;
#[cfg(any(test, feature = "mock"))]
pub use self::mock::MockTransport;
use crate::error::Result;
use crate::messages::{Envelope, Request, Response};
use async_trait::async_trait;
use std::sync::Arc;

/// Bidirectional link to the catalog.
///
/// `send` may be called concurrently from any task. `recv` is only ever
/// called by the dispatcher's pump task.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Name of the transport, for logging only.
    fn name(&self) -> &str;

    /// Write one request frame.
    async fn send(&self, frame: Envelope<Request>) -> Result<()>;

    /// Wait for the next inbound frame. `Ok(None)` means the link was closed
    /// by the remote end.
    async fn recv(&self) -> Result<Option<Envelope<Response>>>;
}

pub type TransportHandle = Arc<dyn Transport>;
