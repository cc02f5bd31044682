//! JSON-RPC style envelope types.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::{OrchestratorError, Result};

pub const JSONRPC_VERSION: &str = "2.0";

/// A single request envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jsonrpc: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<Value>,
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl RpcRequest {
    pub fn new(method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: Some(JSONRPC_VERSION.to_string()),
            id: None,
            method: method.into(),
            params,
        }
    }

    pub fn with_id(mut self, id: impl Into<Value>) -> Self {
        self.id = Some(id.into());
        self
    }

    /// Reject envelopes no backend could make sense of.
    pub fn validate(&self) -> Result<()> {
        if self.method.trim().is_empty() {
            return Err(OrchestratorError::Validation("method must not be empty".into()));
        }
        if let Some(version) = &self.jsonrpc {
            if version != JSONRPC_VERSION {
                return Err(OrchestratorError::Validation(format!(
                    "unsupported jsonrpc version '{}'",
                    version
                )));
            }
        }
        if let Some(params) = &self.params {
            if !(params.is_object() || params.is_array() || params.is_null()) {
                return Err(OrchestratorError::Validation(
                    "params must be an object or an array".into(),
                ));
            }
        }
        Ok(())
    }

    /// Replace the id with a fresh correlation id, returning the caller's id.
    pub fn tag(&mut self) -> (String, Option<Value>) {
        let correlation_id = Uuid::new_v4().to_string();
        let original = self.id.replace(Value::String(correlation_id.clone()));
        if self.jsonrpc.is_none() {
            self.jsonrpc = Some(JSONRPC_VERSION.to_string());
        }
        (correlation_id, original)
    }
}

/// Error object carried inside a response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcError {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// A single response envelope.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct RpcResponse {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jsonrpc: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
}

impl RpcResponse {
    pub fn success(id: Option<Value>, result: Value) -> Self {
        Self {
            jsonrpc: Some(JSONRPC_VERSION.to_string()),
            id,
            result: Some(result),
            error: None,
        }
    }

    pub fn failure(id: Option<Value>, error: RpcError) -> Self {
        Self {
            jsonrpc: Some(JSONRPC_VERSION.to_string()),
            id,
            result: None,
            error: Some(error),
        }
    }

    /// The id as a correlation key, if it has one.
    pub fn correlation_key(&self) -> Option<String> {
        self.id.as_ref().map(id_key)
    }

    /// Collapse into the result value, turning an error envelope into `Rpc`.
    pub fn into_result(self) -> Result<Value> {
        match self.error {
            Some(err) => Err(err.into()),
            None => Ok(self.result.unwrap_or(Value::Null)),
        }
    }
}

/// Normalise an id value into a map key. String ids are used verbatim.
pub fn id_key(id: &Value) -> String {
    match id {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn validate_rejects_empty_method_and_scalar_params() {
        assert!(RpcRequest::new("", None).validate().is_err());
        assert!(RpcRequest::new("tools/call", Some(json!(3))).validate().is_err());
        assert!(RpcRequest::new("tools/call", Some(json!({"name": "x"})))
            .validate()
            .is_ok());
    }

    #[test]
    fn tag_preserves_caller_id() {
        let mut req = RpcRequest::new("ping", None).with_id(7);
        let (cid, original) = req.tag();
        assert_eq!(original, Some(json!(7)));
        assert_eq!(req.id, Some(Value::String(cid)));
    }

    #[test]
    fn response_with_unknown_fields_parses() {
        let resp: RpcResponse =
            serde_json::from_str(r#"{"jsonrpc":"2.0","id":"a","method":"echo","result":1}"#)
                .unwrap();
        assert_eq!(resp.correlation_key().as_deref(), Some("a"));
        assert_eq!(resp.into_result().unwrap(), json!(1));
    }

    #[test]
    fn error_envelope_becomes_rpc_error() {
        let resp = RpcResponse::failure(
            None,
            RpcError {
                code: -1,
                message: "boom".into(),
                data: None,
            },
        );
        assert!(matches!(resp.into_result(), Err(OrchestratorError::Rpc { code: -1, .. })));
    }
}
