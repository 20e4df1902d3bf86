use crate::errors::SignerError;
pub use alloy::primitives::Address;
use alloy::primitives::{Bytes, U256};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::str::FromStr as _;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NativeCurrency {
    pub name: Option<String>,
    pub symbol: Option<String>,
    pub decimal: Option<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Chain {
    pub id: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rpc_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub native_currency: Option<NativeCurrency>,
}

impl Chain {
    pub const fn bare(id: u64) -> Self {
        Self {
            id,
            rpc_url: None,
            native_currency: None,
        }
    }
}

/// An app-scoped account. Undeployed accounts carry the factory call that creates them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubAccount {
    pub address: Address,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub factory: Option<Address>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub factory_data: Option<Bytes>,
}

impl SubAccount {
    /// Parse a sub-account object returned by the wallet or an RPC endpoint.
    pub fn from_value(v: &Value) -> Result<Self, SignerError> {
        let sub: Self = serde_json::from_value(v.clone())
            .map_err(|e| SignerError::internal(format!("invalid sub account response: {e}")))?;
        if sub.factory.is_some() != sub.factory_data.is_some() {
            return Err(SignerError::internal(
                "invalid sub account response: factory and factoryData must come together",
            ));
        }
        Ok(sub)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PermissionDetails {
    pub account: Address,
    pub spender: Address,
    pub token: Address,
    pub allowance: String,
    pub period: u64,
    pub start: u64,
    pub end: u64,
    pub salt: String,
    #[serde(default)]
    pub extra_data: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SpendPermission {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<u64>,
    pub permission_hash: String,
    pub signature: String,
    pub chain_id: u64,
    pub permission: PermissionDetails,
}

impl SpendPermission {
    pub fn validate(&self) -> Result<(), SignerError> {
        let p = &self.permission;
        if p.start > p.end {
            return Err(SignerError::invalid_params(format!(
                "spend permission start {} is after end {}",
                p.start, p.end
            )));
        }
        if p.period == 0 {
            return Err(SignerError::invalid_params("spend permission period must be > 0"));
        }
        U256::from_str(&p.allowance).map_err(|e| {
            SignerError::invalid_params(format!("invalid allowance {}: {e}", p.allowance))
        })?;
        Ok(())
    }
}

/// One EIP-1193 `request` call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestArguments {
    pub method: String,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub params: Value,
}

impl RequestArguments {
    pub fn new(method: impl Into<String>, params: Value) -> Self {
        Self {
            method: method.into(),
            params,
        }
    }

    pub fn param(&self, index: usize) -> Option<&Value> {
        self.params.as_array().and_then(|a| a.get(index))
    }

    pub fn param_mut(&mut self, index: usize) -> Option<&mut Value> {
        self.params.as_array_mut().and_then(|a| a.get_mut(index))
    }

    /// The `from` of the first param object, as used by sending and `wallet_*` methods.
    pub fn from_address(&self) -> Option<Address> {
        self.param(0)
            .and_then(|p| p.get("from"))
            .and_then(Value::as_str)
            .and_then(|s| Address::from_str(s).ok())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct AppMetadata {
    pub app_name: String,
    pub app_logo_url: Option<String>,
    pub app_chain_ids: Vec<u64>,
}

pub fn parse_address(s: &str) -> Option<Address> {
    Address::from_str(s.trim()).ok()
}

/// Parse a `0x`-prefixed hex quantity or a plain decimal string.
pub fn parse_u64(s: &str) -> Option<u64> {
    let s = s.trim();
    match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(h) if !h.is_empty() => u64::from_str_radix(h, 16).ok(),
        Some(_) => None,
        None => s.parse().ok(),
    }
}

/// Chain ids arrive both as JSON numbers and as hex/decimal strings.
pub fn value_to_u64(v: &Value) -> Option<u64> {
    v.as_u64().or_else(|| v.as_str().and_then(parse_u64))
}

pub fn to_hex_quantity(n: u64) -> String {
    format!("0x{n:x}")
}

/// Insert `addr` at the front, dropping any later copy.
pub fn prepend_without_duplicates(list: &mut Vec<Address>, addr: Address) {
    list.retain(|a| *a != addr);
    list.insert(0, addr);
}

/// Append `addr` unless it is already present.
pub fn append_without_duplicates(list: &mut Vec<Address>, addr: Address) {
    if !list.contains(&addr) {
        list.push(addr);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const A: &str = "0x1111111111111111111111111111111111111111";
    const B: &str = "0x2222222222222222222222222222222222222222";

    fn addr(s: &str) -> eyre::Result<Address> {
        parse_address(s).ok_or_else(|| eyre::eyre!("bad address {s}"))
    }

    #[test]
    fn account_set_stays_duplicate_free() -> eyre::Result<()> {
        let (a, b) = (addr(A)?, addr(B)?);
        let mut list = vec![a, b];
        prepend_without_duplicates(&mut list, b);
        assert_eq!(list, vec![b, a]);
        append_without_duplicates(&mut list, b);
        assert_eq!(list, vec![b, a]);
        Ok(())
    }

    #[test]
    fn hex_and_decimal_quantities() {
        assert_eq!(parse_u64("0x2105"), Some(8453));
        assert_eq!(parse_u64("8453"), Some(8453));
        assert_eq!(parse_u64("0x"), None);
        assert_eq!(parse_u64("zz"), None);
        assert_eq!(value_to_u64(&json!(10)), Some(10));
        assert_eq!(to_hex_quantity(8453), "0x2105");
    }

    #[test]
    fn sub_account_requires_factory_pair() -> eyre::Result<()> {
        let ok = SubAccount::from_value(&json!({
            "address": A,
            "factory": B,
            "factoryData": "0xabcd",
        }))?;
        assert_eq!(ok.factory, Some(addr(B)?));
        assert!(SubAccount::from_value(&json!({ "address": A, "factory": B })).is_err());
        assert!(SubAccount::from_value(&json!({ "address": "nope" })).is_err());
        Ok(())
    }

    #[test]
    fn spend_permission_window() -> eyre::Result<()> {
        let mut p: SpendPermission = serde_json::from_value(json!({
            "permissionHash": "0xabc",
            "signature": "0xdef",
            "chainId": 8453,
            "permission": {
                "account": A, "spender": B, "token": A,
                "allowance": "1000000", "period": 86400,
                "start": 10, "end": 20, "salt": "0x1", "extraData": "0x"
            }
        }))?;
        p.validate()?;
        p.permission.start = 30;
        assert!(p.validate().is_err());
        p.permission.start = 10;
        p.permission.period = 0;
        assert!(p.validate().is_err());
        Ok(())
    }

    #[test]
    fn reads_from_param() -> eyre::Result<()> {
        let args = RequestArguments::new("eth_sendTransaction", json!([{ "from": A }]));
        assert_eq!(args.from_address(), Some(addr(A)?));
        assert_eq!(RequestArguments::new("x", json!([])).from_address(), None);
        Ok(())
    }
}
