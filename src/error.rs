//! Top-level error kinds of the binary.

use derive_more::{Display, Error};

pub type Error = exn::Exn<ErrorKind>;
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Display, Error)]
pub enum ErrorKind {
    #[display("configuration error")]
    Config,
    #[display("could not establish a catalog session")]
    Session,
    #[display("collection failed")]
    Collect,
    #[display("interrupted")]
    Interrupted,
}
