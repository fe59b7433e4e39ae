//! Minimal RESP2 client plumbing used by the Redis broker.
//!
//! Only what pub/sub needs: encoding commands, decoding replies and push
//! messages, and a buffered TCP connection.

mod connection;
mod frame;

pub use connection::Connection;
pub use frame::Frame;

#[cfg(test)]
pub(crate) mod mock_server;
