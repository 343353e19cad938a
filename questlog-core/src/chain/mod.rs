//! Chain side of the pipeline.
//!
//! - `transport`: the node connection the watcher is generic over
//! - `json_rpc`: HTTP JSON-RPC implementation of the transport
//! - `watcher`: block tracking, reorg detection and the reconnect loop

pub mod json_rpc;
pub mod transport;
pub mod watcher;

#[cfg(test)]
pub(crate) mod testing;

pub use json_rpc::JsonRpcTransport;
pub use transport::{BlockHeader, ChainTransport, TransportError};
pub use watcher::{
    ChainWatcher, ConnectionState, WatcherCommand, WatcherError, WatcherHandle,
};
