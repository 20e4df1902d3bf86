//! Envelopes exchanged with the wallet popup.
//!
//! A request carries either a plaintext `handshake` or an `encrypted` payload. A response
//! carries either an `encrypted` payload or a plaintext `failure`.

use crate::{crypto::EncryptedData, errors::RpcErrorObject, types::RequestArguments};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RequestContent {
    Handshake(RequestArguments),
    Encrypted(EncryptedData),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RpcRequestMessage {
    pub id: Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    /// Hex SPKI public key of the dapp session.
    pub sender: String,
    pub content: RequestContent,
    pub timestamp: DateTime<Utc>,
}

impl RpcRequestMessage {
    pub fn new(sender: String, correlation_id: Option<String>, content: RequestContent) -> Self {
        Self {
            id: Uuid::new_v4(),
            correlation_id,
            sender,
            content,
            timestamp: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ResponseContent {
    Encrypted(EncryptedData),
    Failure(RpcErrorObject),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RpcResponseMessage {
    pub id: Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    pub request_id: Uuid,
    /// Hex SPKI public key of the wallet.
    pub sender: String,
    pub content: ResponseContent,
    pub timestamp: DateTime<Utc>,
}

/// Plaintext of an `encrypted` request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EncryptedRequest {
    pub action: RequestArguments,
    pub chain_id: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ResponseResult {
    Value(Value),
    Error(RpcErrorObject),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct ResponseData {
    /// Chain id (decimal string) to RPC URL.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chains: Option<BTreeMap<String, String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub capabilities: Option<Map<String, Value>>,
}

/// Plaintext of an `encrypted` response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcResponse {
    pub result: ResponseResult,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<ResponseData>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn handshake_envelope_shape() -> eyre::Result<()> {
        let msg = RpcRequestMessage::new(
            "3059".into(),
            Some("c-1".into()),
            RequestContent::Handshake(RequestArguments::new("eth_requestAccounts", json!([]))),
        );
        let v = serde_json::to_value(&msg)?;
        assert_eq!(v["content"]["handshake"]["method"], "eth_requestAccounts");
        assert_eq!(v["correlationId"], "c-1");
        assert!(v["timestamp"].is_string());
        Ok(())
    }

    #[test]
    fn response_content_variants() -> eyre::Result<()> {
        let failure: ResponseContent =
            serde_json::from_value(json!({ "failure": { "code": 4001, "message": "no" } }))?;
        assert!(matches!(failure, ResponseContent::Failure(ref e) if e.code == 4001));

        let res: RpcResponse = serde_json::from_value(json!({
            "result": { "value": ["0x1111111111111111111111111111111111111111"] },
            "data": { "chains": { "8453": "https://mainnet.base.org" } }
        }))?;
        assert!(matches!(res.result, ResponseResult::Value(_)));
        let chains = res.data.and_then(|d| d.chains).unwrap_or_default();
        assert_eq!(
            chains.get("8453").map(String::as_str),
            Some("https://mainnet.base.org")
        );
        Ok(())
    }
}
