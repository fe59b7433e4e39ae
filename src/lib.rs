//! # Fanout
//!
//! `fanout` is a topic-based broadcast server. WebSocket clients join topics
//! and receive every message published to them; producers publish through the
//! [`broker::Broker`] handle or a programmatic [`client::Client`]. Delivery is
//! in-process by default, or spread across nodes through Redis pub/sub.
//!
//! ## Core Modules
//!
//! - `broker`: message envelope, topic registry and the local/Redis broker.
//! - `client`: channel-backed programmatic client.
//! - `config`: settings loading.
//! - `resp`: minimal RESP2 client used by the Redis broker.
//! - `service`: lifecycle facade tying the broker to the WebSocket listener.
//! - `transport`: WebSocket command protocol, sessions and accept loop.
//! - `utils`: error types and logging setup.

pub mod broker;
pub mod client;
pub mod config;
pub mod resp;
pub mod service;
pub mod transport;
pub mod utils;

pub use broker::{Broker, Message};
pub use service::Service;
