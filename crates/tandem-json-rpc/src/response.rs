use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{InvalidMessage, JsonRpcError, JsonRpcErrorCode, JsonRpcErrorObject};
use crate::lazy::LazyValue;
use crate::types::JsonRpcVersion;

/// A JSON-RPC response: exactly one of `result` or `error` is present.
///
/// `result` is kept as raw JSON text and decoded lazily, like request params.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcResponse {
    #[serde(rename = "jsonrpc")]
    pub version: JsonRpcVersion,
    pub id: Option<u64>,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "present_result"
    )]
    pub result: Option<LazyValue>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcErrorObject>,
}

/// `result` distinguishes "field absent" from "field null": a null result
/// is still a success response, so a present field always yields `Some`.
fn present_result<'de, D>(deserializer: D) -> Result<Option<LazyValue>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    LazyValue::deserialize(deserializer).map(Some)
}

impl JsonRpcResponse {
    pub fn success(id: u64, result: Value) -> Self {
        Self {
            version: JsonRpcVersion::V2_0,
            id: Some(id),
            result: Some(LazyValue::from(result)),
            error: None,
        }
    }

    pub fn error(id: Option<u64>, error: JsonRpcErrorObject) -> Self {
        Self {
            version: JsonRpcVersion::V2_0,
            id,
            result: None,
            error: Some(error),
        }
    }

    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }

    /// Parse text as a response. Returns `None` when the text is not a
    /// structurally valid response (wrong jsonrpc value, result/error shape
    /// violations, out-of-range or id-violating error codes).
    pub fn parse(text: &str) -> Option<Self> {
        let response: Self = serde_json::from_str(text).ok()?;
        response.validate().ok()?;
        Some(response)
    }

    /// Enforce the response invariants, naming the violated rule.
    pub fn validate(&self) -> Result<(), InvalidMessage> {
        match (&self.result, &self.error) {
            (Some(_), Some(_)) => return Err(InvalidMessage::ResultAndError),
            (None, None) => return Err(InvalidMessage::NeitherResultNorError),
            _ => {}
        }
        if let Some(error) = &self.error {
            if JsonRpcErrorCode::from_code(error.code).is_none() {
                return Err(InvalidMessage::CodeOutOfRange(error.code));
            }
            if error.requires_null_id() && self.id.is_some() {
                return Err(InvalidMessage::IdMustBeNull(error.code));
            }
        }
        Ok(())
    }

    /// Decode `result` into a concrete type; `None` for error responses.
    /// The text is decoded at most once.
    pub fn result_as<T: DeserializeOwned>(&self) -> Result<Option<T>, serde_json::Error> {
        self.result.as_ref().map(|r| r.decode()).transpose()
    }
}

impl From<JsonRpcError> for JsonRpcResponse {
    fn from(error: JsonRpcError) -> Self {
        Self::error(error.id, error.error)
    }
}
