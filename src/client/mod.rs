//! The `client` module provides programmatic access to the broker.
//!
//! A `Client` is a subscriber without a socket: messages for the topics it
//! connects are pushed onto a channel owned by the caller, and it can publish
//! through the same broker. Embedding code uses it to produce and consume
//! broadcasts in-process.

pub mod pubsub_client;
pub use pubsub_client::Client;
