//! Local signer bound to one sub-account.
//!
//! Messages are signed by the owner key over a replay-safe hash and wrapped with the owner
//! index. Transactions become ERC-4337 v0.6 user operations submitted through the chain's
//! bundler endpoint, with every submission wrapped in the resilience engine.

use crate::{
    chain_client::{ChainClient, ChainClientPool},
    contracts::{
        compute_eip1559_fees, replay_safe_hash, wrap_signature, Call, CoinbaseSmartWallet,
        EntryPoint, UserOperation, ENTRY_POINT_V06,
    },
    errors::SignerError,
    method::Method,
    resilience::{
        send_with_resilience, ResilienceConfig, ResilientSend, RetryEvent, SendReceipt,
        WaitStatus,
    },
    signer::owner::OwnerAccount,
    types::{to_hex_quantity, RequestArguments, SubAccount},
};
use alloy::{
    dyn_abi::TypedData,
    primitives::{aliases::U192, eip191_hash_message, Address, Bytes, B256, U256},
    sol_types::{SolCall as _, SolValue as _},
};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::{str::FromStr as _, sync::Arc, time::Duration};
use tracing::{debug, info, warn};

/// ERC-6492 suffix for signatures from accounts that are not deployed yet.
const ERC6492_MAGIC: [u8; 32] = [
    0x64, 0x92, 0x64, 0x92, 0x64, 0x92, 0x64, 0x92, 0x64, 0x92, 0x64, 0x92, 0x64, 0x92, 0x64, 0x92,
    0x64, 0x92, 0x64, 0x92, 0x64, 0x92, 0x64, 0x92, 0x64, 0x92, 0x64, 0x92, 0x64, 0x92, 0x64, 0x92,
];

const GAS_BPS_ONE: u64 = 10_000;

pub struct SubAccountSigner {
    pub sub: SubAccount,
    pub owner: Arc<dyn OwnerAccount>,
    pub owner_index: u64,
    pub chain_id: u64,
    pub client: Arc<ChainClient>,
    pub pool: Arc<ChainClientPool>,
    /// Appended to the data of every call.
    pub data_suffix: Option<Bytes>,
    pub resilience: ResilienceConfig,
    pub receipt_poll_interval: Duration,
}

impl std::fmt::Debug for SubAccountSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubAccountSigner")
            .field("sub", &self.sub.address)
            .field("owner", &self.owner.address())
            .field("owner_index", &self.owner_index)
            .field("chain_id", &self.chain_id)
            .finish_non_exhaustive()
    }
}

fn param_str<'a>(args: &'a RequestArguments, index: usize, what: &str) -> Result<&'a str, SignerError> {
    args.param(index)
        .and_then(Value::as_str)
        .ok_or_else(|| SignerError::invalid_params(format!("{}: missing {what}", args.method)))
}

fn parse_quantity(v: Option<&Value>) -> Result<U256, SignerError> {
    match v {
        None | Some(Value::Null) => Ok(U256::ZERO),
        Some(Value::Number(n)) => n
            .as_u64()
            .map(U256::from)
            .ok_or_else(|| SignerError::invalid_params(format!("invalid quantity {n}"))),
        Some(Value::String(s)) => U256::from_str(s)
            .map_err(|e| SignerError::invalid_params(format!("invalid quantity {s}: {e}"))),
        Some(other) => Err(SignerError::invalid_params(format!("invalid quantity {other}"))),
    }
}

fn parse_call(v: &Value) -> Result<Call, SignerError> {
    let to = v
        .get("to")
        .and_then(Value::as_str)
        .and_then(|s| Address::from_str(s).ok())
        .ok_or_else(|| SignerError::invalid_params("call is missing a valid `to`"))?;
    let data = match v.get("data").and_then(Value::as_str) {
        Some(s) => Bytes::from_str(s)
            .map_err(|e| SignerError::invalid_params(format!("invalid call data: {e}")))?,
        None => Bytes::new(),
    };
    Ok(Call {
        target: to,
        value: parse_quantity(v.get("value"))?,
        data,
    })
}

/// Calls of an `eth_sendTransaction` or `wallet_sendCalls` request.
pub fn calls_from_request(args: &RequestArguments) -> Result<Vec<Call>, SignerError> {
    let first = args
        .param(0)
        .ok_or_else(|| SignerError::invalid_params(format!("{}: missing params", args.method)))?;
    match Method::parse(&args.method) {
        Method::EthSendTransaction => Ok(vec![parse_call(first)?]),
        Method::WalletSendCalls => {
            let calls = first
                .get("calls")
                .and_then(Value::as_array)
                .ok_or_else(|| SignerError::invalid_params("wallet_sendCalls: missing calls"))?;
            if calls.is_empty() {
                return Err(SignerError::invalid_params("wallet_sendCalls: no calls"));
            }
            calls.iter().map(parse_call).collect()
        }
        other => Err(SignerError::UnsupportedMethod(other.to_string())),
    }
}

/// `executeBatch` call data for `calls`, with `suffix` appended to each call's data.
pub fn execute_batch_data(calls: Vec<Call>, suffix: Option<&Bytes>) -> Bytes {
    let calls = calls
        .into_iter()
        .map(|mut c| {
            if let Some(s) = suffix {
                let mut data = c.data.to_vec();
                data.extend_from_slice(s);
                c.data = data.into();
            }
            c
        })
        .collect();
    CoinbaseSmartWallet::executeBatchCall { calls }.abi_encode().into()
}

fn scale_gas(v: U256, bps: u64) -> U256 {
    v.saturating_mul(U256::from(bps)) / U256::from(GAS_BPS_ONE)
}

fn value_u256(v: &Value, key: &str) -> Result<U256, SignerError> {
    parse_quantity(v.get(key))
        .map_err(|e| SignerError::internal(format!("bundler returned bad {key}: {e}")))
}

fn value_u128(v: &Value) -> Result<u128, SignerError> {
    let n = parse_quantity(Some(v))?;
    u128::try_from(n).map_err(|e| SignerError::internal(format!("fee out of range: {e}")))
}

impl SubAccountSigner {
    pub async fn request(&self, args: &RequestArguments) -> Result<Value, SignerError> {
        let method = Method::parse(&args.method);
        debug!(%method, sub = %self.sub.address, "sub-account request");
        match method {
            Method::PersonalSign => {
                let msg = param_str(args, 0, "message")?;
                let bytes = match msg.strip_prefix("0x") {
                    Some(h) => hex::decode(h)
                        .map_err(|e| SignerError::invalid_params(format!("message hex: {e}")))?,
                    None => msg.as_bytes().to_vec(),
                };
                let sig = self.sign_wrapped(eip191_hash_message(bytes)).await?;
                Ok(json!(sig))
            }
            Method::EthSignTypedDataV4 => {
                let raw = args
                    .param(1)
                    .ok_or_else(|| SignerError::invalid_params("missing typed data"))?;
                let typed: TypedData = match raw {
                    Value::String(s) => serde_json::from_str(s),
                    other => serde_json::from_value(other.clone()),
                }
                .map_err(|e| SignerError::invalid_params(format!("invalid typed data: {e}")))?;
                let hash = typed
                    .eip712_signing_hash()
                    .map_err(|e| SignerError::invalid_params(format!("typed data hash: {e}")))?;
                let sig = self.sign_wrapped(hash).await?;
                Ok(json!(sig))
            }
            Method::EthSendTransaction => {
                let receipt = self.send_calls(calls_from_request(args)?, None).await?;
                Ok(json!(receipt.transaction_hash))
            }
            Method::WalletSendCalls => {
                let paymaster = args
                    .param(0)
                    .and_then(|p| p.pointer("/capabilities/paymasterService/url"))
                    .and_then(Value::as_str)
                    .map(str::to_owned);
                let receipt = self.send_calls(calls_from_request(args)?, paymaster).await?;
                Ok(json!({ "id": receipt.user_operation_hash }))
            }
            other => Err(SignerError::UnsupportedMethod(format!(
                "{other} is not supported by sub-accounts"
            ))),
        }
    }

    /// Owner signature over the replay-safe form of `hash`, wrapped for the smart wallet.
    pub async fn sign_wrapped(&self, hash: B256) -> Result<Bytes, SignerError> {
        let safe = replay_safe_hash(self.sub.address, self.chain_id, hash);
        let sig = self.owner.sign_hash(safe).await?;
        let wrapped = wrap_signature(self.owner_index, sig);

        let (Some(factory), Some(factory_data)) = (self.sub.factory, self.sub.factory_data.clone())
        else {
            return Ok(wrapped);
        };
        if self.client.is_deployed(self.sub.address).await? {
            return Ok(wrapped);
        }
        let mut out = (factory, factory_data, wrapped).abi_encode_params();
        out.extend_from_slice(&ERC6492_MAGIC);
        Ok(out.into())
    }

    pub async fn send_calls(
        &self,
        calls: Vec<Call>,
        paymaster_url: Option<String>,
    ) -> Result<SendReceipt, SignerError> {
        let call_data = execute_batch_data(calls, self.data_suffix.as_ref());
        let mut op = UserOperationSend {
            signer: self,
            call_data,
            gas_bps: GAS_BPS_ONE,
            nonce: None,
            paymaster_url,
        };
        let on_retry = |e: &RetryEvent<'_>| {
            warn!(
                attempt = e.attempt,
                failure_type = %e.analysis.failure_type,
                delay_ms = u64::try_from(e.delay.as_millis()).unwrap_or(u64::MAX),
                "retrying user operation"
            );
        };
        let outcome = send_with_resilience(&mut op, &self.resilience, Some(&on_retry)).await?;
        info!(
            attempts = outcome.attempts,
            recovery_actions_used = outcome.recovery_actions_used,
            "user operation landed"
        );
        Ok(outcome.receipt)
    }

    async fn current_fees(&self) -> Result<(u128, u128), SignerError> {
        let block = self
            .client
            .request("eth_getBlockByNumber", json!(["latest", false]))
            .await?;
        let base_fee = block
            .get("baseFeePerGas")
            .map(value_u128)
            .transpose()?
            .unwrap_or(0);
        let gas_price = value_u128(&self.client.request("eth_gasPrice", json!([])).await?)?;
        Ok(compute_eip1559_fees(base_fee, gas_price))
    }

    async fn fetch_nonce(&self) -> Result<U256, SignerError> {
        let data = EntryPoint::getNonceCall {
            sender: self.sub.address,
            key: U192::ZERO,
        }
        .abi_encode();
        let raw = self.client.eth_call(ENTRY_POINT_V06, &data.into()).await?;
        EntryPoint::getNonceCall::abi_decode_returns(&raw)
            .map_err(|e| SignerError::internal(format!("decode getNonce: {e}")))
    }

    async fn paymaster_and_data(
        &self,
        url: &str,
        rpc_method: &str,
        op: &UserOperation,
    ) -> Result<Bytes, SignerError> {
        let res = self
            .pool
            .call_url(
                url,
                rpc_method,
                json!([op.to_json(), ENTRY_POINT_V06, to_hex_quantity(self.chain_id), {}]),
            )
            .await?;
        let pad = res
            .get("paymasterAndData")
            .and_then(Value::as_str)
            .ok_or_else(|| SignerError::internal(format!("{rpc_method}: missing paymasterAndData")))?;
        Bytes::from_str(pad).map_err(|e| SignerError::internal(format!("{rpc_method}: {e}")))
    }

    async fn wait_for_receipt(&self, user_op_hash: &str) -> Result<SendReceipt, SignerError> {
        loop {
            let receipt = self
                .client
                .request("eth_getUserOperationReceipt", json!([user_op_hash]))
                .await?;
            if receipt.is_null() {
                tokio::time::sleep(self.receipt_poll_interval).await;
                continue;
            }
            let success = receipt.get("success").and_then(Value::as_bool).unwrap_or(false);
            let transaction_hash = receipt
                .pointer("/receipt/transactionHash")
                .and_then(Value::as_str)
                .map(str::to_owned);
            let status = if success {
                WaitStatus::Complete
            } else {
                WaitStatus::Failed {
                    reason: receipt
                        .get("reason")
                        .and_then(Value::as_str)
                        .unwrap_or("user operation reverted")
                        .to_owned(),
                }
            };
            return Ok(SendReceipt {
                status,
                transaction_hash,
                user_operation_hash: Some(user_op_hash.to_owned()),
            });
        }
    }
}

/// One user operation submission, repaired between attempts by the resilience engine.
struct UserOperationSend<'a> {
    signer: &'a SubAccountSigner,
    call_data: Bytes,
    gas_bps: u64,
    nonce: Option<U256>,
    paymaster_url: Option<String>,
}

impl UserOperationSend<'_> {
    async fn build(&mut self) -> Result<UserOperation, SignerError> {
        let s = self.signer;
        let nonce = match self.nonce {
            Some(n) => n,
            None => {
                let n = s.fetch_nonce().await?;
                self.nonce = Some(n);
                n
            }
        };
        let mut init_code = Bytes::new();
        if let (Some(factory), Some(data)) = (&s.sub.factory, &s.sub.factory_data) {
            if !s.client.is_deployed(s.sub.address).await? {
                let mut code = factory.to_vec();
                code.extend_from_slice(data);
                init_code = code.into();
            }
        }
        let (max_fee, priority) = s.current_fees().await?;

        let mut op = UserOperation {
            sender: s.sub.address,
            nonce,
            init_code,
            call_data: self.call_data.clone(),
            max_fee_per_gas: U256::from(max_fee),
            max_priority_fee_per_gas: U256::from(priority),
            signature: wrap_signature(s.owner_index, dummy_signature()),
            ..UserOperation::default()
        };

        if let Some(url) = self.paymaster_url.as_deref() {
            op.paymaster_and_data = s
                .paymaster_and_data(url, "pm_getPaymasterStubData", &op)
                .await?;
        }

        let est = s
            .client
            .request(
                "eth_estimateUserOperationGas",
                json!([op.to_json(), ENTRY_POINT_V06]),
            )
            .await?;
        op.call_gas_limit = scale_gas(value_u256(&est, "callGasLimit")?, self.gas_bps);
        op.verification_gas_limit =
            scale_gas(value_u256(&est, "verificationGasLimit")?, self.gas_bps);
        op.pre_verification_gas = scale_gas(value_u256(&est, "preVerificationGas")?, self.gas_bps);

        if let Some(url) = self.paymaster_url.as_deref() {
            op.paymaster_and_data = s.paymaster_and_data(url, "pm_getPaymasterData", &op).await?;
        }

        let hash = op.hash(ENTRY_POINT_V06, s.chain_id);
        let sig = s.owner.sign_hash(hash).await?;
        op.signature = wrap_signature(s.owner_index, sig);
        Ok(op)
    }
}

/// Placeholder signature with the final length, for gas estimation.
fn dummy_signature() -> Bytes {
    let mut sig = vec![0xff_u8; 64];
    sig.push(0x1c);
    sig.into()
}

#[async_trait]
impl ResilientSend for UserOperationSend<'_> {
    async fn attempt(&mut self) -> Result<SendReceipt, SignerError> {
        let op = self.build().await?;
        let hash = self
            .signer
            .client
            .request("eth_sendUserOperation", json!([op.to_json(), ENTRY_POINT_V06]))
            .await?;
        let hash = hash
            .as_str()
            .ok_or_else(|| SignerError::internal("eth_sendUserOperation returned no hash"))?
            .to_owned();
        debug!(user_op_hash = %hash, "user operation submitted");
        self.signer.wait_for_receipt(&hash).await
    }

    fn increase_gas(&mut self, multiplier: f64) {
        #[expect(
            clippy::cast_possible_truncation,
            clippy::cast_sign_loss,
            clippy::float_arithmetic,
            reason = "multiplier is validated to lie in [1, 3]"
        )]
        let bps = (multiplier * 10_000.0).round() as u64;
        self.gas_bps = self.gas_bps.saturating_mul(bps) / GAS_BPS_ONE;
    }

    async fn refresh_nonce(&mut self) -> Result<(), SignerError> {
        self.nonce = Some(self.signer.fetch_nonce().await?);
        Ok(())
    }

    fn use_paymaster(&mut self, url: &str) {
        self.paymaster_url = Some(url.to_owned());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_send_calls() -> eyre::Result<()> {
        let args = RequestArguments::new(
            "wallet_sendCalls",
            json!([{ "calls": [
                { "to": "0x1111111111111111111111111111111111111111", "value": "0x10", "data": "0xabcd" },
                { "to": "0x2222222222222222222222222222222222222222" }
            ] }]),
        );
        let calls = calls_from_request(&args)?;
        assert_eq!(calls.len(), 2);
        assert_eq!(calls.first().map(|c| c.value), Some(U256::from(16_u8)));
        assert_eq!(calls.get(1).map(|c| c.data.len()), Some(0));
        Ok(())
    }

    #[test]
    fn rejects_empty_and_malformed_calls() {
        let empty = RequestArguments::new("wallet_sendCalls", json!([{ "calls": [] }]));
        assert!(calls_from_request(&empty).is_err());
        let bad_to = RequestArguments::new("eth_sendTransaction", json!([{ "to": "nope" }]));
        assert!(calls_from_request(&bad_to).is_err());
    }

    #[test]
    fn suffix_is_appended_to_every_call() -> eyre::Result<()> {
        let to: Address = "0x1111111111111111111111111111111111111111".parse()?;
        let calls = vec![
            Call { target: to, value: U256::ZERO, data: Bytes::from_static(&[0xaa]) },
            Call { target: to, value: U256::ZERO, data: Bytes::new() },
        ];
        let suffix = Bytes::from_static(&[0xde, 0xad]);
        let data = execute_batch_data(calls, Some(&suffix));
        let decoded = CoinbaseSmartWallet::executeBatchCall::abi_decode(&data)?;
        let datas: Vec<Vec<u8>> = decoded.calls.iter().map(|c| c.data.to_vec()).collect();
        assert_eq!(datas, vec![vec![0xaa, 0xde, 0xad], vec![0xde, 0xad]]);
        Ok(())
    }

    #[test]
    fn gas_scaling_compounds() {
        let base = U256::from(100_000_u64);
        assert_eq!(scale_gas(base, GAS_BPS_ONE), base);
        assert_eq!(scale_gas(base, 12_000), U256::from(120_000_u64));
        assert_eq!(scale_gas(base, 14_400), U256::from(144_000_u64));
    }
}
