//! JSON-RPC 2.0 envelope types and request validation
//!
//! The envelope is hand-written rather than taken from an MCP SDK so the
//! id fallback (`0` for unusable ids, `null` for parse errors) and the error
//! codes stay exactly under our control.

use serde::Serialize;
use serde_json::Value;

use crate::errors::AppError;

pub const JSONRPC_VERSION: &str = "2.0";

pub const PARSE_ERROR: i32 = -32700;
pub const INVALID_REQUEST: i32 = -32600;
pub const METHOD_NOT_FOUND: i32 = -32601;
pub const INVALID_PARAMS: i32 = -32602;
pub const INTERNAL_ERROR: i32 = -32603;

/// A validated request
#[derive(Debug, Clone, PartialEq)]
pub struct RpcRequest {
    /// Number or string
    pub id: Value,
    pub method: String,
    pub params: Option<Value>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct RpcResponse {
    pub jsonrpc: &'static str,
    pub id: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct RpcError {
    pub code: i32,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl RpcError {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }
}

impl RpcResponse {
    pub fn success(id: Value, result: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION,
            id,
            result: Some(result),
            error: None,
        }
    }

    pub fn failure(id: Value, error: RpcError) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION,
            id,
            result: None,
            error: Some(error),
        }
    }

    /// Response for input that is not valid JSON; the id is unknown
    pub fn parse_error() -> Self {
        Self::failure(Value::Null, RpcError::new(PARSE_ERROR, "Parse error"))
    }
}

/// Id a response to `value` carries: the request id when usable, else `0`
pub fn response_id(value: &Value) -> Value {
    match value.get("id") {
        Some(id @ (Value::Number(_) | Value::String(_))) => id.clone(),
        _ => Value::from(0),
    }
}

/// Check the envelope shape of a parsed JSON value
///
/// Failures are returned as ready-to-send responses. When the request
/// carries no usable id the response uses id `0`.
pub fn validate(value: Value) -> Result<RpcRequest, RpcResponse> {
    let Value::Object(mut object) = value else {
        return Err(invalid_request(Value::from(0), "request must be a JSON object"));
    };

    let id = match object.remove("id") {
        Some(id @ (Value::Number(_) | Value::String(_))) => id,
        _ => return Err(invalid_request(Value::from(0), "id must be a number or string")),
    };

    if object.get("jsonrpc").and_then(Value::as_str) != Some(JSONRPC_VERSION) {
        return Err(invalid_request(id, "jsonrpc must be \"2.0\""));
    }

    let method = match object.remove("method") {
        Some(Value::String(method)) if !method.is_empty() => method,
        _ => return Err(invalid_request(id, "method must be a non-empty string")),
    };

    let params = match object.remove("params") {
        None | Some(Value::Null) => None,
        Some(params @ (Value::Object(_) | Value::Array(_))) => Some(params),
        Some(_) => return Err(invalid_request(id, "params must be an object or array")),
    };

    Ok(RpcRequest { id, method, params })
}

fn invalid_request(id: Value, reason: &str) -> RpcResponse {
    RpcResponse::failure(id, AppError::Protocol(reason.to_owned()).to_rpc_error())
}
