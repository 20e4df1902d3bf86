use crate::resilience::ResilienceError;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::fmt;
use thiserror::Error;

/// EIP-1193 provider codes and JSON-RPC 2.0 codes used across the crate.
pub mod codes {
    pub const USER_REJECTED: i64 = 4001;
    pub const UNAUTHORIZED: i64 = 4100;
    pub const UNSUPPORTED_METHOD: i64 = 4200;
    pub const DISCONNECTED: i64 = 4900;
    pub const INVALID_REQUEST: i64 = -32600;
    pub const INVALID_PARAMS: i64 = -32602;
    pub const INTERNAL: i64 = -32603;
}

/// An error object as it travels over the wire: inside a `failure` envelope from the wallet,
/// inside a JSON-RPC `error` member from a chain endpoint, or back to the dapp.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcErrorObject {
    pub code: i64,
    pub message: String,
    #[serde(skip_serializing_if = "Value::is_null", default)]
    pub data: Value,
}

impl RpcErrorObject {
    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: Value::Null,
        }
    }
}

impl fmt::Display for RpcErrorObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (code {})", self.message, self.code)
    }
}

#[derive(Debug, Error, Clone)]
pub enum SignerError {
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("unsupported method: {0}")]
    UnsupportedMethod(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("invalid params: {0}")]
    InvalidParams(String),

    #[error("internal error: {0}")]
    Internal(String),

    #[error("no shared secret: peer public key has not been imported")]
    NoSharedSecret,

    #[error("decryption failed: {0}")]
    DecryptionFailed(String),

    /// A `failure` returned by the wallet. Surfaced verbatim.
    #[error("{0}")]
    Protocol(RpcErrorObject),

    /// A JSON-RPC error returned by a chain, bundler, or wallet RPC endpoint.
    #[error("{0}")]
    Rpc(RpcErrorObject),

    #[error("transport error: {0}")]
    Transport(String),

    #[error(transparent)]
    Resilience(#[from] ResilienceError),
}

impl SignerError {
    pub fn unauthorized(reason: impl Into<String>) -> Self {
        Self::Unauthorized(reason.into())
    }

    pub fn internal(reason: impl Into<String>) -> Self {
        Self::Internal(reason.into())
    }

    pub fn invalid_params(reason: impl Into<String>) -> Self {
        Self::InvalidParams(reason.into())
    }

    pub fn code(&self) -> i64 {
        match self {
            Self::Resilience(ResilienceError::Actionable(e)) => e.code(),
            Self::Unauthorized(_) | Self::NoSharedSecret => codes::UNAUTHORIZED,
            Self::UnsupportedMethod(_) => codes::UNSUPPORTED_METHOD,
            Self::InvalidRequest(_) => codes::INVALID_REQUEST,
            Self::InvalidParams(_) => codes::INVALID_PARAMS,
            Self::Protocol(e) | Self::Rpc(e) => e.code,
            Self::Internal(_)
            | Self::DecryptionFailed(_)
            | Self::Transport(_)
            | Self::Resilience(_) => codes::INTERNAL,
        }
    }

    pub fn is_unauthorized(&self) -> bool {
        self.code() == codes::UNAUTHORIZED
    }

    pub const fn is_transport(&self) -> bool {
        matches!(self, Self::Transport(_))
    }

    /// The wallet/bundler error object, if this error carries one.
    pub fn rpc_error(&self) -> Option<&RpcErrorObject> {
        match self {
            Self::Protocol(e) | Self::Rpc(e) => Some(e),
            Self::Resilience(ResilienceError::Actionable(e)) => e.rpc_error(),
            _ => None,
        }
    }

    /// `data` of an actionable insufficient-balance error (`data.type == "INSUFFICIENT_FUNDS"`).
    pub fn insufficient_balance_data(&self) -> Option<&Value> {
        let data = &self.rpc_error()?.data;
        (data.get("type").and_then(Value::as_str) == Some("INSUFFICIENT_FUNDS")).then_some(data)
    }

    /// Serializable form handed back to dapp callers.
    pub fn to_rpc_error(&self) -> RpcErrorObject {
        match self {
            Self::Protocol(e) | Self::Rpc(e) => e.clone(),
            Self::Resilience(ResilienceError::Actionable(e)) => e.to_rpc_error(),
            Self::Resilience(r) => RpcErrorObject {
                code: codes::INTERNAL,
                message: r.to_string(),
                data: json!({ "code": r.code(), "details": r.details() }),
            },
            other => RpcErrorObject::new(other.code(), other.to_string()),
        }
    }
}

impl From<reqwest::Error> for SignerError {
    fn from(e: reqwest::Error) -> Self {
        Self::Transport(e.to_string())
    }
}

impl From<serde_json::Error> for SignerError {
    fn from(e: serde_json::Error) -> Self {
        Self::Internal(format!("json: {e}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_follow_provider_conventions() {
        assert_eq!(SignerError::unauthorized("x").code(), 4100);
        assert_eq!(SignerError::NoSharedSecret.code(), 4100);
        assert_eq!(SignerError::invalid_params("x").code(), -32602);
        assert_eq!(
            SignerError::Protocol(RpcErrorObject::new(4001, "User rejected")).code(),
            4001
        );
        assert!(SignerError::Transport("reset".into()).is_transport());
    }

    #[test]
    fn protocol_failure_round_trips_verbatim() {
        let failure = RpcErrorObject {
            code: 4001,
            message: "User rejected the request".into(),
            data: json!({ "reason": "popup closed" }),
        };
        let err = SignerError::Protocol(failure.clone());
        assert_eq!(err.to_rpc_error(), failure);
    }

    #[test]
    fn detects_insufficient_funds_shape() {
        let err = SignerError::Rpc(RpcErrorObject {
            code: -32090,
            message: "insufficient balance".into(),
            data: json!({ "type": "INSUFFICIENT_FUNDS", "required": {} }),
        });
        assert!(err.insufficient_balance_data().is_some());
        let other = SignerError::Rpc(RpcErrorObject::new(-32000, "execution reverted"));
        assert!(other.insufficient_balance_data().is_none());
    }
}
