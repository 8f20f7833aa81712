//! Convenience re-exports for server consumers.

pub use crate::context::{ExecutionContextStack, StateTransition};
pub use crate::registry::{HandlerError, HandlerOutcome, HandlerRegistry, RpcHandler};
pub use crate::server::{RpcServer, RpcServerBuilder};

pub use tandem_json_rpc::{JsonRpcError, JsonRpcRequest, JsonRpcResponse, LazyValue};
pub use tandem_rpc_client::{ClientConfig, RpcClient};

pub use async_trait::async_trait;
pub use futures::future::BoxFuture;
