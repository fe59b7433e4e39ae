//! The `error` module defines the error types used across `fanout`.
//!
//! Errors are split by origin so callers can tell systemic failures (the
//! Redis backend, the listener) from per-call mistakes (an empty topic).
//! Malformed payloads and malformed client commands are not errors at all:
//! they are dropped and logged where they are detected.

/// Errors raised while decoding RESP frames.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("incomplete frame")]
    Incomplete,
    #[error("invalid frame type byte: {0:#x}")]
    InvalidFrameType(u8),
    #[error("invalid integer: {0}")]
    InvalidInteger(String),
    #[error("invalid bulk length: {0}")]
    InvalidBulkLength(i64),
    #[error("frame exceeds maximum size ({0} bytes)")]
    FrameTooLarge(usize),
    #[error("invalid encoding: {0}")]
    InvalidEncoding(String),
}

/// Errors raised by the Redis backend.
#[derive(Debug, thiserror::Error)]
pub enum RedisError {
    #[error("unable to connect to {addr}: {source}")]
    Connect {
        addr: String,
        #[source]
        source: std::io::Error,
    },
    #[error("timed out connecting to {0}")]
    Timeout(String),
    #[error("timed out waiting for {0}")]
    ReplyTimeout(String),
    #[error("connection closed by server")]
    ConnectionClosed,
    #[error("i/o: {0}")]
    Io(#[from] std::io::Error),
    #[error("protocol: {0}")]
    Protocol(#[from] ProtocolError),
    #[error("server replied with error: {0}")]
    Server(String),
    #[error("unexpected reply: {0}")]
    UnexpectedReply(String),
}

/// Top-level error of the broadcast engine.
#[derive(Debug, thiserror::Error)]
pub enum BroadcastError {
    #[error("configuration: {0}")]
    Config(#[from] config::ConfigError),
    #[error("redis: {0}")]
    Redis(#[from] RedisError),
    #[error("i/o: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("message topic must not be empty")]
    EmptyTopic,
    #[error("broker has not been started")]
    NotStarted,
    #[error("broker is closed")]
    Closed,
    #[error("broker lost its backend connection")]
    BackendLost,
}

pub type BroadcastResult<T> = Result<T, BroadcastError>;
