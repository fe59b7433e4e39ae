//! The `utils` module provides the pieces shared by every other module of
//! `fanout`: the error taxonomy and the tracing setup.

pub mod error;
pub mod logging;
