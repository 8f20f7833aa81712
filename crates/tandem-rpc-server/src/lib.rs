//! # RPC Server
//!
//! A JSON-RPC 2.0 server layered on top of the connection client. The
//! caller supplies connected duplex streams; the server dispatches inbound
//! calls and notifications against a shared handler registry, filtered by a
//! per-connection stack of execution contexts.
//!
//! Handlers come in two flavors: untyped ones receive the raw parameter
//! payload, typed ones declare a parameter type and get decode failures
//! turned into `InvalidParams` responses automatically. Several handlers may
//! share a method name; all of them run for each inbound message.

pub mod context;
pub mod prelude;
pub mod registry;
pub mod server;

pub use context::{ExecutionContext, ExecutionContextStack, StateTransition};
pub use registry::{HandlerEntry, HandlerError, HandlerOutcome, HandlerRegistry, RpcHandler};
pub use server::{RpcServer, RpcServerBuilder};
