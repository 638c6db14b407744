//! Multi-protocol L7 reverse proxy / agent: accepts WebSocket, TCP, and UDP
//! connections, pairs each with a load-balanced destination, and relays
//! traffic between the two until either side closes.

pub mod channel;
pub mod config;
pub mod error;
pub mod extension;
pub mod loadbalance;
pub mod router;
pub mod service;
pub mod transport;
pub mod upstream;

pub use error::{ProxyError, Result};
pub use service::Service;
