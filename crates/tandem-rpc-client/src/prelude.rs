//! Convenience re-exports for client consumers.

pub use crate::client::RpcClient;
pub use crate::config::ClientConfig;
pub use crate::error::{ClientError, ClientResult};

pub use tandem_json_rpc::{
    JsonRpcError, JsonRpcErrorCode, JsonRpcErrorObject, JsonRpcRequest, JsonRpcResponse,
};

pub use tokio_util::sync::CancellationToken;
