//! Network layer for the playback proxy
//!
//! Async HTTP/1.1 serving with bounded concurrency on the client side and
//! a pooled hyper client on the origin side.

mod client;
mod connection_pool;
pub mod http;
mod server;

pub use client::{strip_hop_by_hop, ForwardRequest, OriginClient};
pub use connection_pool::{ConnectionGuard, ConnectionPool};
pub use server::ProxyServer;

/// Graceful shutdown timeout
pub const SHUTDOWN_TIMEOUT_MS: u64 = 5000;
