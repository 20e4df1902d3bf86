//! Requests sent by the app's sub-account.
//!
//! They never reach the popup as-is: the sub-account signs locally with its owner key, or,
//! while it cannot pay for itself yet, its calls are wrapped and sent by the global account.

use super::{
    funding,
    owner::{add_owner, find_owner_index},
    Signer,
};
use crate::{
    config::FundingMode,
    errors::SignerError,
    method::Method,
    spend_permissions::has_permission_for,
    types::{Address, RequestArguments},
    user_operation::SubAccountSigner,
};
use alloy::primitives::Bytes;
use serde_json::{json, Value};
use std::{str::FromStr as _, sync::Arc};
use tracing::{debug, info, warn};

/// Name `sub` as sender when the request names none.
fn inject_sender(method: &Method, args: &mut RequestArguments, sub: Address) {
    let sub_json = json!(sub);
    match method {
        Method::PersonalSign | Method::EthSignTypedDataV1 => {
            if let Some(params) = args.params.as_array_mut() {
                match params.get_mut(1) {
                    Some(slot) if !slot.is_null() => {}
                    Some(slot) => *slot = sub_json,
                    None => {
                        if !params.is_empty() {
                            params.push(sub_json);
                        }
                    }
                }
            }
        }
        Method::EthSignTypedDataV3 | Method::EthSignTypedDataV4 => {
            if let Some(params) = args.params.as_array_mut() {
                if params.first().is_some_and(|p| !p.is_string()) {
                    params.insert(0, sub_json);
                }
            }
        }
        Method::EthSendTransaction | Method::WalletSendCalls => {
            if let Some(obj) = args.param_mut(0).and_then(Value::as_object_mut) {
                obj.entry("from").or_insert(sub_json);
            }
        }
        _ => {}
    }
}

pub(super) async fn delegate(
    signer: &Signer,
    mut args: RequestArguments,
) -> Result<Value, SignerError> {
    let sub = signer
        .store
        .sub_account()
        .ok_or_else(|| SignerError::unauthorized("no sub-account found"))?;
    let owner = signer.owner_account().await?;
    let global = signer
        .global_account()
        .ok_or_else(|| SignerError::unauthorized("no global account found"))?;

    let method = Method::parse(&args.method);
    inject_sender(&method, &mut args, sub.address);

    let funding_mode = signer.sub_accounts_config().funding;
    if method.is_sending()
        && funding_mode == FundingMode::SpendPermissions
        && !has_permission_for(&signer.store, sub.address)
    {
        debug!(sub = %sub.address, "no spend permission yet");
        return funding::route_through_global_account(signer, &args, global, &sub, Vec::new())
            .await;
    }

    let chain = signer.chain();
    let client = signer.pool.client(&chain)?;
    let owner_index = match find_owner_index(&client, &sub, owner.address()).await? {
        Some(i) => i,
        None => {
            info!(owner = %owner.address(), "owner not registered on sub-account");
            add_owner(signer, global, &sub, owner.address()).await?;
            find_owner_index(&client, &sub, owner.address())
                .await?
                .ok_or_else(|| {
                    SignerError::unauthorized("owner is not registered on the sub-account")
                })?
        }
    };

    let data_suffix = signer
        .config
        .data_suffix()
        .map(Bytes::from_str)
        .transpose()
        .map_err(|e| SignerError::internal(format!("invalid attribution data suffix: {e}")))?;
    let local = SubAccountSigner {
        sub: sub.clone(),
        owner,
        owner_index,
        chain_id: chain.id,
        client,
        pool: Arc::clone(&signer.pool),
        data_suffix,
        resilience: signer.config.resilience.clone(),
        receipt_poll_interval: signer.poll_interval,
    };

    match local.request(&args).await {
        Ok(v) => Ok(v),
        Err(e) if funding_mode == FundingMode::Manual => Err(e),
        Err(e) if e.insufficient_balance_data().is_some() => {
            warn!(sub = %sub.address, "sub-account has insufficient balance");
            funding::handle_insufficient_balance(signer, &args, global, &sub, e).await
        }
        Err(e) => Err(e),
    }
}
