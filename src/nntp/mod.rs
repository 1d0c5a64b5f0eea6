//! NNTP client layer
//!
//! - [`connection`] - one stateful connection: commands, auth, streamed bodies
//! - [`body`] - terminator scanning, dot-unescaping, bounded body streams
//! - [`response`] - status-line parsing
//! - [`pool`] - per-provider bounded pool with FIFO-fair leasing

pub mod body;
pub mod connection;
pub mod pool;
pub mod response;

#[cfg(test)]
pub(crate) mod test_server;

pub use body::{BodyStream, DotDecoder, TransferOutcome};
pub use connection::{ConnectionState, NntpConnection, header};
pub use pool::{PooledConnection, ProviderPool};
pub use response::{GroupInfo, NntpResponse};
