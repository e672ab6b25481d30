//! Unix socket transport.

mod handlers;
mod server;

pub use server::{Server, ServerError, serve, shutdown_signal};
