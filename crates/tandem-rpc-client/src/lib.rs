//! # RPC Client
//!
//! A JSON-RPC 2.0 connection client for any full-duplex byte channel:
//! in-process pipes, TCP streams, or anything else implementing tokio's
//! `AsyncRead`/`AsyncWrite`.
//!
//! Each [`RpcClient`] owns one connection: a background receive loop
//! reassembles inbound bytes into discrete messages (no framing delimiter
//! needed), responses are correlated back to in-flight calls by id, and
//! inbound requests/notifications are surfaced through observer lists that
//! a server layer can subscribe to.

pub mod client;
pub mod config;
pub mod correlation;
pub mod error;
pub mod prelude;

pub use client::RpcClient;
pub use config::ClientConfig;
pub use correlation::{CorrelationTable, POLL_INTERVAL};
pub use error::{ClientError, ClientResult};
