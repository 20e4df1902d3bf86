use crate::{
    chain_client::ChainClientPool,
    errors::SignerError,
    store::StoreScope,
    types::{value_to_u64, Address, RequestArguments, SpendPermission},
};
use serde_json::Value;
use tracing::{debug, warn};

/// Parse permissions from a wallet RPC answer, dropping entries that fail validation.
pub fn parse_permissions(items: &[Value]) -> Vec<SpendPermission> {
    items
        .iter()
        .filter_map(|v| match serde_json::from_value::<SpendPermission>(v.clone()) {
            Ok(p) => match p.validate() {
                Ok(()) => Some(p),
                Err(e) => {
                    warn!(error = %e, "dropping invalid spend permission");
                    None
                }
            },
            Err(e) => {
                warn!(error = %e, "dropping malformed spend permission");
                None
            }
        })
        .collect()
}

/// Replace every cached permission for `chain_id` with `fresh`.
pub fn cache_for_chain(store: &StoreScope, chain_id: u64, fresh: Vec<SpendPermission>) {
    store.update(|s| {
        s.spend_permissions.retain(|p| p.chain_id != chain_id);
        s.spend_permissions.extend(fresh);
    });
}

fn upsert(store: &StoreScope, permission: SpendPermission) {
    store.update(|s| {
        s.spend_permissions
            .retain(|p| p.permission_hash != permission.permission_hash);
        s.spend_permissions.push(permission);
    });
}

/// Whether any permission names `spender`. A sub-account without one cannot pay for itself yet.
pub fn has_permission_for(store: &StoreScope, spender: Address) -> bool {
    store.read(|s| {
        s.spend_permissions
            .iter()
            .any(|p| p.permission.spender == spender)
    })
}

/// `coinbase_fetchPermissions`: `[{account, chainId, spender}]` -> `{permissions: [...]}`.
pub async fn fetch_permissions(
    pool: &ChainClientPool,
    wallet_rpc_url: &str,
    store: &StoreScope,
    args: &RequestArguments,
) -> Result<Value, SignerError> {
    let chain_id = args
        .param(0)
        .and_then(|p| p.get("chainId"))
        .and_then(value_to_u64)
        .ok_or_else(|| SignerError::invalid_params("coinbase_fetchPermissions requires chainId"))?;

    let response = pool
        .call_url(wallet_rpc_url, &args.method, args.params.clone())
        .await?;
    let items = response
        .get("permissions")
        .and_then(Value::as_array)
        .ok_or_else(|| SignerError::internal("fetch permissions response missing permissions"))?;
    let permissions = parse_permissions(items);
    debug!(chain_id, count = permissions.len(), "caching spend permissions");
    cache_for_chain(store, chain_id, permissions);
    Ok(response)
}

/// `coinbase_fetchPermission`: `[{permissionHash}]` -> `{permission: {...}}`.
pub async fn fetch_permission(
    pool: &ChainClientPool,
    wallet_rpc_url: &str,
    store: &StoreScope,
    args: &RequestArguments,
) -> Result<Value, SignerError> {
    if args
        .param(0)
        .and_then(|p| p.get("permissionHash"))
        .and_then(Value::as_str)
        .is_none()
    {
        return Err(SignerError::invalid_params(
            "coinbase_fetchPermission requires permissionHash",
        ));
    }
    let response = pool
        .call_url(wallet_rpc_url, &args.method, args.params.clone())
        .await?;
    if let Some(p) = response.get("permission") {
        if let Some(p) = parse_permissions(std::slice::from_ref(p)).pop() {
            upsert(store, p);
        }
    }
    Ok(response)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn permission(hash: &str, chain_id: u64, spender: &str) -> Value {
        json!({
            "permissionHash": hash,
            "signature": "0x",
            "chainId": chain_id,
            "permission": {
                "account": "0x1111111111111111111111111111111111111111",
                "spender": spender,
                "token": "0xEeeeeEeeeEeEeeEeEeEeeEEEeeeeEeeeeeeeEEeE",
                "allowance": "0x5af3107a4000",
                "period": 86400,
                "start": 0,
                "end": 281474976710655_u64,
                "salt": "0x0",
                "extraData": "0x"
            }
        })
    }

    #[test]
    fn cache_is_keyed_by_chain() -> eyre::Result<()> {
        let store = StoreScope::ephemeral();
        let sub = "0x2222222222222222222222222222222222222222";
        let base = parse_permissions(&[permission("0xa", 8453, sub)]);
        let eth = parse_permissions(&[permission("0xb", 1, sub)]);
        cache_for_chain(&store, 8453, base);
        cache_for_chain(&store, 1, eth);
        cache_for_chain(&store, 8453, vec![]);
        let left = store.spend_permissions();
        assert_eq!(left.len(), 1);
        assert_eq!(left.first().map(|p| p.chain_id), Some(1));
        assert!(has_permission_for(&store, sub.parse()?));
        assert!(!has_permission_for(
            &store,
            "0x3333333333333333333333333333333333333333".parse()?
        ));
        Ok(())
    }

    #[test]
    fn invalid_permissions_are_dropped() {
        let mut bad = permission("0xc", 1, "0x2222222222222222222222222222222222222222");
        bad["permission"]["start"] = json!(10);
        bad["permission"]["end"] = json!(5);
        assert!(parse_permissions(&[bad, json!({ "nope": true })]).is_empty());
    }
}
