use crate::{
    config::{Attribution, SubAccountCreation},
    method::Method,
    types::{parse_u64, Address, RequestArguments},
};
use serde_json::{json, Map, Value};

/// Keep only the capability entries whose chain-id key is in `chain_ids`. Keys that are not
/// valid hex quantities are dropped.
pub fn filter_by_chain_ids(capabilities: &Map<String, Value>, chain_ids: &[u64]) -> Map<String, Value> {
    capabilities
        .iter()
        .filter(|(k, _)| {
            k.starts_with("0x")
                .then(|| parse_u64(k))
                .flatten()
                .is_some_and(|id| chain_ids.contains(&id))
        })
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}

/// Chain-id filter from the second `wallet_getCapabilities` param. Invalid entries are ignored.
pub fn requested_chain_ids(filter: &Value) -> Vec<u64> {
    filter
        .as_array()
        .map(|ids| {
            ids.iter()
                .filter_map(|v| v.as_str().and_then(parse_u64).or_else(|| v.as_u64()))
                .collect()
        })
        .unwrap_or_default()
}

/// Inputs to [`inject_request_capabilities`].
#[derive(Debug, Clone, Copy)]
pub struct InjectedCapabilities<'a> {
    pub creation: SubAccountCreation,
    /// Owner to register when a sub-account is created on connect.
    pub owner: Option<Address>,
    pub attribution: Option<&'a Attribution>,
}

/// Add SDK-managed capabilities to `wallet_connect` and `wallet_sendCalls` requests without
/// overwriting anything the dapp set itself.
pub fn inject_request_capabilities(args: &mut RequestArguments, inject: &InjectedCapabilities<'_>) {
    let method = Method::parse(&args.method);
    if !matches!(method, Method::WalletConnect | Method::WalletSendCalls) {
        return;
    }

    if !args.params.is_array() {
        args.params = json!([]);
    }
    let Some(params) = args.params.as_array_mut() else {
        return;
    };
    if params.is_empty() {
        params.push(json!({}));
    }
    let Some(first) = params.first_mut().and_then(Value::as_object_mut) else {
        return;
    };
    let caps = first
        .entry("capabilities")
        .or_insert_with(|| Value::Object(Map::new()));
    let Some(caps) = caps.as_object_mut() else {
        return;
    };

    if method == Method::WalletConnect && inject.creation == SubAccountCreation::OnConnect {
        if let Some(owner) = inject.owner {
            caps.entry("addSubAccount").or_insert_with(|| {
                json!({
                    "account": {
                        "type": "create",
                        "keys": [{ "type": "address", "publicKey": owner }],
                    }
                })
            });
        }
    }

    if method == Method::WalletSendCalls {
        match inject.attribution {
            Some(Attribution {
                data_suffix: Some(suffix),
                ..
            }) => {
                caps.entry("attribution")
                    .or_insert_with(|| json!({ "dataSuffix": suffix }));
            }
            Some(Attribution { auto: true, .. }) => {
                caps.entry("attribution")
                    .or_insert_with(|| json!({ "auto": true }));
            }
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filters_and_skips_invalid_keys() {
        let caps: Map<String, Value> = serde_json::from_value(json!({
            "0x2105": { "atomic": "supported" },
            "0x1": { "atomic": "unsupported" },
            "not-hex": { "x": 1 },
            "0xzz": { "x": 2 },
        }))
        .unwrap_or_default();
        let out = filter_by_chain_ids(&caps, &requested_chain_ids(&json!(["0x2105", "bogus"])));
        assert_eq!(out.len(), 1, "{out:?}");
        assert!(out.contains_key("0x2105"));
    }

    #[test]
    fn on_connect_injects_owner_once() -> eyre::Result<()> {
        let owner: Address = "0x1111111111111111111111111111111111111111".parse()?;
        let inject = InjectedCapabilities {
            creation: SubAccountCreation::OnConnect,
            owner: Some(owner),
            attribution: None,
        };
        let mut args = RequestArguments::new("wallet_connect", Value::Null);
        inject_request_capabilities(&mut args, &inject);
        let add = &args.params[0]["capabilities"]["addSubAccount"];
        assert_eq!(add["account"]["type"], "create");

        let mut custom = RequestArguments::new(
            "wallet_connect",
            json!([{ "capabilities": { "addSubAccount": { "account": { "type": "deployed" } } } }]),
        );
        inject_request_capabilities(&mut custom, &inject);
        assert_eq!(
            custom.params[0]["capabilities"]["addSubAccount"]["account"]["type"],
            "deployed"
        );
        Ok(())
    }

    #[test]
    fn send_calls_gets_attribution() {
        let attribution = Attribution {
            auto: false,
            data_suffix: Some("0xdddd".into()),
        };
        let inject = InjectedCapabilities {
            creation: SubAccountCreation::Manual,
            owner: None,
            attribution: Some(&attribution),
        };
        let mut args = RequestArguments::new("wallet_sendCalls", json!([{ "calls": [] }]));
        inject_request_capabilities(&mut args, &inject);
        assert_eq!(
            args.params[0]["capabilities"]["attribution"]["dataSuffix"],
            "0xdddd"
        );
        let mut other = RequestArguments::new("personal_sign", json!(["0x00"]));
        inject_request_capabilities(&mut other, &inject);
        assert_eq!(other.params, json!(["0x00"]));
    }
}
