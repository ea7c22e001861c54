//! Intercepting proxy engine
//!
//! Terminates client HTTP, dispatches each request on its correct leg
//! (plain forward or MITM bridge) and emits one transcript record per
//! completed exchange.

mod bridge;
mod exchange;
mod http1;
mod server;

pub use bridge::LeafResolver;
pub use http1::is_hop_by_hop;
pub use server::ProxyServer;
