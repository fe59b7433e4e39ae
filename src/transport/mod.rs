//! The `transport` module is responsible for handling network communication
//! with clients via WebSockets.
//!
//! It defines the command protocol used between clients and the server, the
//! per-connection `Session` that turns commands into broker operations and
//! broker messages into outbound frames, and the accept loop that performs the
//! upgrade on the configured path.

pub mod message;
pub mod session;
pub mod websocket;

pub use session::Session;


#[cfg(test)]
mod websocket_tests;
