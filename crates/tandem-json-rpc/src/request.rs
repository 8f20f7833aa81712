use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::InvalidMessage;
use crate::lazy::LazyValue;
use crate::types::JsonRpcVersion;

/// A JSON-RPC request. An absent `id` makes it a notification: no response
/// is ever produced for it.
///
/// `params` is kept as raw JSON text and decoded on first access only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcRequest {
    #[serde(rename = "jsonrpc")]
    pub version: JsonRpcVersion,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<LazyValue>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<u64>,
}

impl JsonRpcRequest {
    pub fn new(method: impl Into<String>, params: Option<Value>, id: Option<u64>) -> Self {
        Self {
            version: JsonRpcVersion::V2_0,
            method: method.into(),
            params: params.map(LazyValue::from),
            id,
        }
    }

    /// A call: carries an id and expects exactly one response.
    pub fn call(method: impl Into<String>, params: Option<Value>, id: u64) -> Self {
        Self::new(method, params, Some(id))
    }

    /// A notification: no id, no reply path.
    pub fn notification(method: impl Into<String>, params: Option<Value>) -> Self {
        Self::new(method, params, None)
    }

    pub fn is_notification(&self) -> bool {
        self.id.is_none()
    }

    /// Parse text as a request. Returns `None` when the text is not a
    /// structurally valid request (missing method, wrong jsonrpc value).
    pub fn parse(text: &str) -> Option<Self> {
        let request: Self = serde_json::from_str(text).ok()?;
        request.validate().ok()?;
        Some(request)
    }

    /// Enforce required-field invariants, naming the offending field.
    pub fn validate(&self) -> Result<(), InvalidMessage> {
        if self.method.is_empty() {
            return Err(InvalidMessage::MissingField("method"));
        }
        Ok(())
    }

    /// Decode `params` into a concrete type. The underlying text is decoded
    /// at most once; repeated access reuses the memoized tree.
    pub fn params_as<T: DeserializeOwned>(&self) -> Result<Option<T>, serde_json::Error> {
        self.params.as_ref().map(|p| p.decode()).transpose()
    }
}
