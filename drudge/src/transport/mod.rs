//! Transport layer for drudge.
//!
//! Currently provides the local Unix socket front end. Each connection carries
//! exactly one request and one response.

pub mod ipc;

pub use ipc::{Server, ServerError, serve, shutdown_signal};
