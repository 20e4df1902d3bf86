//! Paying for sub-account calls from the global account.
//!
//! A sub-account that cannot pay yet has its calls wrapped into one `executeBatch` call that
//! the global account sends through the wallet popup, optionally preceded by top-up
//! transfers into the sub-account.

use super::Signer;
use crate::{
    contracts::Erc20,
    errors::SignerError,
    method::Method,
    spend_permissions,
    types::{to_hex_quantity, Address, RequestArguments, SubAccount},
    user_operation::{calls_from_request, execute_batch_data},
};
use alloy::{
    primitives::{address, Bytes, U256},
    sol_types::SolCall as _,
};
use serde_json::{json, Map, Value};
use std::str::FromStr as _;
use tracing::{debug, info, warn};

/// Token address used for the chain's native currency in funding requirements.
pub const NATIVE_TOKEN: Address = address!("EeeeeEeeeEeEeeEeEeEeeEEEeeeeEeeeeeeeEEeE");

/// Send the calls of `args` from `global` as a single `executeBatch` on `sub`.
///
/// `eth_sendTransaction` waits for the bundle and returns its transaction hash; the
/// `wallet_sendCalls` result is returned as the wallet gave it. The wallet grants the
/// sub-account a spend permission while serving the call, so permissions are refreshed
/// afterwards and later sends are signed by the sub-account itself.
pub(super) async fn route_through_global_account(
    signer: &Signer,
    args: &RequestArguments,
    global: Address,
    sub: &SubAccount,
    prepend_calls: Vec<Value>,
) -> Result<Value, SignerError> {
    let method = Method::parse(&args.method);
    let chain_id = signer.chain().id;
    let inner = execute_batch_data(calls_from_request(args)?, None);

    let mut calls = prepend_calls;
    calls.push(json!({ "to": sub.address, "data": inner, "value": "0x0" }));

    let mut params = match (&method, args.param(0)) {
        (Method::WalletSendCalls, Some(Value::Object(original))) => original.clone(),
        _ => Map::new(),
    };
    params.insert("version".into(), json!("1.0"));
    params.insert("chainId".into(), json!(to_hex_quantity(chain_id)));
    params.insert("from".into(), json!(global));
    params.insert("calls".into(), Value::Array(calls));
    params.insert("atomicRequired".into(), json!(true));

    info!(%global, sub = %sub.address, chain_id, "routing sub-account call through global account");
    let mut request = RequestArguments::new("wallet_sendCalls", json!([params]));
    signer.inject_capabilities(&mut request).await?;
    let result = signer.send_request_to_popup(&request).await?;
    refresh_spend_permissions(signer, global, sub.address, chain_id).await;

    if method != Method::EthSendTransaction {
        return Ok(result);
    }
    let id = calls_id(&result)?;
    let status = wait_for_calls_status(signer, &id).await?;
    status
        .pointer("/receipts/0/transactionHash")
        .cloned()
        .ok_or_else(|| SignerError::internal("calls status has no transaction hash"))
}

/// Best effort: a failed lookup only means the next send is routed again.
async fn refresh_spend_permissions(signer: &Signer, global: Address, sub: Address, chain_id: u64) {
    let args = RequestArguments::new(
        "coinbase_fetchPermissions",
        json!([{ "account": global, "chainId": to_hex_quantity(chain_id), "spender": sub }]),
    );
    match spend_permissions::fetch_permissions(
        &signer.pool,
        &signer.config.wallet_rpc_url,
        &signer.store,
        &args,
    )
    .await
    {
        Ok(_) => debug!(
            %sub,
            granted = spend_permissions::has_permission_for(&signer.store, sub),
            "spend permissions refreshed"
        ),
        Err(e) => warn!(error = %e, %sub, "could not refresh spend permissions"),
    }
}

/// `wallet_sendCalls` returns a bare id (v1) or `{id}` (v2).
pub(super) fn calls_id(result: &Value) -> Result<String, SignerError> {
    result
        .as_str()
        .or_else(|| result.get("id").and_then(Value::as_str))
        .map(str::to_owned)
        .ok_or_else(|| SignerError::internal("wallet_sendCalls returned no id"))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CallsState {
    Pending,
    Success,
    Failure,
}

/// EIP-5792 status: numeric codes (100 pending, 2xx confirmed) or legacy strings.
fn calls_state(status: &Value) -> CallsState {
    match status.get("status") {
        Some(Value::Number(n)) => match n.as_u64() {
            Some(100..=199) => CallsState::Pending,
            Some(200..=299) => CallsState::Success,
            _ => CallsState::Failure,
        },
        Some(Value::String(s)) => match s.to_ascii_lowercase().as_str() {
            "pending" => CallsState::Pending,
            "confirmed" | "success" => CallsState::Success,
            _ => CallsState::Failure,
        },
        _ => CallsState::Pending,
    }
}

/// Poll `wallet_getCallsStatus` on the wallet RPC until the bundle settles. Bounded by the
/// resilience timeout.
pub(super) async fn wait_for_calls_status(signer: &Signer, id: &str) -> Result<Value, SignerError> {
    let url = &signer.config.wallet_rpc_url;
    let poll = async {
        loop {
            let status = signer
                .pool
                .call_url(url, "wallet_getCallsStatus", json!([id]))
                .await?;
            match calls_state(&status) {
                CallsState::Pending => {
                    debug!(id, "calls pending");
                    tokio::time::sleep(signer.poll_interval).await;
                }
                CallsState::Success => return Ok(status),
                CallsState::Failure => {
                    return Err(SignerError::internal(format!(
                        "calls {id} failed with status {}",
                        status.get("status").unwrap_or(&Value::Null)
                    )))
                }
            }
        }
    };
    tokio::time::timeout(signer.config.resilience.timeout(), poll)
        .await
        .map_err(|_elapsed| {
            SignerError::Transport(format!("timed out waiting for calls {id}"))
        })?
}

/// Transfers that cover `required` (`{token: {amount}}`) from the global account.
///
/// Fails when a listed source shows the global account cannot cover the amount.
fn top_up_calls(
    required: &Map<String, Value>,
    sub: Address,
    global: Address,
) -> Result<Vec<Value>, SignerError> {
    let mut calls = Vec::with_capacity(required.len());
    for (token, need) in required {
        let token = Address::from_str(token)
            .map_err(|e| SignerError::internal(format!("invalid token {token}: {e}")))?;
        let amount = need
            .get("amount")
            .and_then(Value::as_str)
            .and_then(|a| U256::from_str(a).ok())
            .ok_or_else(|| SignerError::internal("insufficient balance data has no amount"))?;

        let global_balance = need
            .get("sources")
            .and_then(Value::as_array)
            .and_then(|sources| {
                sources.iter().find(|s| {
                    s.get("address")
                        .and_then(Value::as_str)
                        .and_then(|a| Address::from_str(a).ok())
                        == Some(global)
                })
            })
            .and_then(|s| s.get("balance").and_then(Value::as_str))
            .and_then(|b| U256::from_str(b).ok());
        if global_balance.is_some_and(|b| b < amount) {
            return Err(SignerError::internal(format!(
                "global account cannot cover {amount} of {token}"
            )));
        }

        if token == NATIVE_TOKEN {
            calls.push(json!({ "to": sub, "value": amount, "data": "0x" }));
        } else {
            let data = Erc20::transferCall { to: sub, amount }.abi_encode();
            calls.push(json!({ "to": token, "value": "0x0", "data": Bytes::from(data) }));
        }
    }
    Ok(calls)
}

/// Recover from a sub-account send that failed for lack of funds: top up the sub-account
/// from the global account and send the same calls in one bundle.
///
/// Anything that is not an actionable insufficient-balance failure on a sending method is
/// returned unchanged.
pub(super) async fn handle_insufficient_balance(
    signer: &Signer,
    args: &RequestArguments,
    global: Address,
    sub: &SubAccount,
    error: SignerError,
) -> Result<Value, SignerError> {
    if !Method::parse(&args.method).is_sending() {
        return Err(error);
    }
    let Some(required) = error
        .insufficient_balance_data()
        .and_then(|d| d.get("required"))
        .and_then(Value::as_object)
        .filter(|r| !r.is_empty())
        .cloned()
    else {
        return Err(error);
    };
    let top_ups = match top_up_calls(&required, sub.address, global) {
        Ok(calls) => calls,
        Err(e) => {
            warn!(error = %e, "cannot top up sub-account");
            return Err(error);
        }
    };
    info!(tokens = top_ups.len(), sub = %sub.address, "topping up sub-account from global account");
    route_through_global_account(signer, args, global, sub, top_ups).await
}
