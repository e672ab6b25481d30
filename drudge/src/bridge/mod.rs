//! IPC bridge: wire protocol and codec.
//!
//! # Architecture
//!
//! - **protocol**: Message types (Request/Response for clients,
//!   SessionRequest/SessionResponse for session subprocesses)
//! - **codec**: JSON framing codec for AsyncRead/AsyncWrite

pub mod codec;
pub mod protocol;
