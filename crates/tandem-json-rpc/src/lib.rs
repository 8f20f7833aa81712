//! # JSON-RPC 2.0 Message Model
//!
//! A pure, transport-agnostic JSON-RPC 2.0 message model plus delimiter-free
//! stream reassembly. This crate provides the wire types, their validity
//! rules, lazy params/result decoding, and the token-level machinery that
//! recovers discrete messages from a raw byte stream.
//!
//! ## Features
//! - Full JSON-RPC 2.0 wire compliance for requests, notifications,
//!   responses and errors
//! - Lazy, memoized params/result decoding (decode-once on first access)
//! - Streaming message reassembly with no framing delimiter required
//! - Transport agnostic (works over any `AsyncBufRead` byte source)

pub mod error;
pub mod lazy;
pub mod request;
pub mod response;
pub mod stream;
pub mod types;

// Re-export main types
pub use error::{InvalidMessage, JsonRpcError, JsonRpcErrorCode, JsonRpcErrorObject};
pub use lazy::LazyValue;
pub use request::JsonRpcRequest;
pub use response::JsonRpcResponse;
pub use stream::{JsonToken, JsonTokenizer, MessageReassembler, StreamError};
pub use types::JsonRpcVersion;

/// Method names with this prefix are reserved by the JSON-RPC 2.0
/// specification and may not appear in an allow-list.
pub const RESERVED_METHOD_PREFIX: &str = "rpc.";
