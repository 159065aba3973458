//! Application error model with JSON-RPC error mapping
//!
//! Defines a typed error hierarchy using `thiserror` for internal error handling,
//! and maps each variant to a JSON-RPC error object for protocol compliance.

use serde_json::{Value, json};
use thiserror::Error;

use crate::rpc::{INTERNAL_ERROR, INVALID_PARAMS, INVALID_REQUEST, RpcError};

/// Application error type
///
/// Covers every failure the mail accounts server may encounter, from
/// credential handling through provider I/O.
#[derive(Debug, Error)]
pub enum AppError {
    /// Invalid user input (validation failed, malformed tool arguments)
    #[error("invalid input: {0}")]
    InvalidInput(String),
    /// Missing or invalid configuration (secret key, account settings)
    #[error("configuration error: {0}")]
    Configuration(String),
    /// Ciphertext could not be decrypted; the cause is only logged
    #[error("failed to decrypt secret")]
    Decryption,
    /// Unknown account identity or family mismatch
    #[error("account not found: {0}")]
    AccountNotFound(String),
    /// Authentication failure (bad credentials, revoked token)
    #[error("authentication failed: {0}")]
    AuthFailed(String),
    /// Operation timeout (TCP connect, TLS handshake, HTTP request)
    #[error("operation timed out: {0}")]
    Timeout(String),
    /// Opaque failure reported by a provider handler
    #[error("provider error: {0}")]
    Provider(String),
    /// Malformed or unrecognized JSON-RPC input
    #[error("protocol error: {0}")]
    Protocol(String),
    /// Internal error (unexpected failure, external crate error)
    #[error("internal error: {0}")]
    Internal(String),
}

impl AppError {
    /// Convenience constructor for `InvalidInput`
    pub fn invalid(msg: impl Into<String>) -> Self {
        Self::InvalidInput(msg.into())
    }

    /// Stable machine-readable error kind
    pub fn kind(&self) -> &'static str {
        match self {
            Self::InvalidInput(_) => "invalid_input",
            Self::Configuration(_) => "configuration",
            Self::Decryption => "decryption",
            Self::AccountNotFound(_) => "account_not_found",
            Self::AuthFailed(_) => "auth_failed",
            Self::Timeout(_) => "timeout",
            Self::Provider(_) => "provider",
            Self::Protocol(_) => "protocol",
            Self::Internal(_) => "internal",
        }
    }

    /// Convert a request-level failure to a JSON-RPC error object
    ///
    /// Input validation failures map to `invalid params` and envelope
    /// failures to `invalid request`; every other variant is reported as a
    /// generic execution failure. The underlying message is attached as
    /// diagnostic data.
    pub fn to_rpc_error(&self) -> RpcError {
        let error = match self {
            Self::InvalidInput(_) => RpcError::new(INVALID_PARAMS, "Invalid params"),
            Self::Protocol(_) => RpcError::new(INVALID_REQUEST, "Invalid Request"),
            _ => return self.to_execution_error(),
        };
        error.with_data(self.diagnostic())
    }

    /// Convert a failure raised while a tool runs against its handler
    ///
    /// Always `Tool execution failed`, whatever the variant; the kind stays
    /// visible in the diagnostic data.
    pub fn to_execution_error(&self) -> RpcError {
        RpcError::new(INTERNAL_ERROR, "Tool execution failed").with_data(self.diagnostic())
    }

    fn diagnostic(&self) -> Value {
        json!({ "code": self.kind(), "message": self.to_string() })
    }
}

/// Type alias for fallible return values
pub type AppResult<T> = Result<T, AppError>;
