//! Client side of the catalog's product-info protocol.
//!
//! The crate is layered bottom-up:
//! - [`messages`] and [`KeyValue`]: the wire model,
//! - [`transport`]: moving frames over a link,
//! - [`Dispatcher`]: correlating responses with requests by [`JobId`](messages::JobId),
//! - [`CatalogClient`] and [`Session`]: typed calls and the logon handshake.

mod client;
mod dispatch;
pub mod error;
mod keyvalue;
pub mod messages;
pub mod transport;

pub use crate::client::{CatalogClient, Session, Timeouts};
pub use crate::dispatch::Dispatcher;
pub use crate::keyvalue::KeyValue;
pub use crate::messages::{AppId, ChangeNumber, DepotId};
pub use crate::transport::{Transport, TransportHandle};
