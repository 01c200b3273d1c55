//! cirrus server and client library.
//!
//! Serves one document backend over a local Unix socket so that several
//! processes can share it through the same `get`/`set`/`delete`/`query`
//! contract.

pub mod client;
pub mod error;
pub mod protocol;
pub mod server;

pub use client::CirrusClient;
pub use error::ClientError;
pub use server::CirrusServer;
