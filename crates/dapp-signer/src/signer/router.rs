use super::{channel::update_chain, sub_account, Signer};
use crate::{
    capabilities::{filter_by_chain_ids, requested_chain_ids},
    config::DefaultAccount,
    errors::SignerError,
    events::ProviderEvent,
    method::Method,
    spend_permissions,
    types::{parse_address, to_hex_quantity, value_to_u64, Address, Chain, RequestArguments, SubAccount},
};
use serde_json::{json, Value};
use tracing::{debug, Instrument as _};

/// Where one request is served.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    /// Answered from cached state.
    Local,
    /// Chain switch before any account is connected: no round trip.
    LocalSwitchChain,
    SwitchChain,
    /// Connect flow, including `eth_requestAccounts` before connection.
    Connect,
    Capabilities,
    GetSubAccounts,
    AddSubAccount,
    SpendPermissions,
    /// Signed locally by the sub-account.
    SubAccount,
    Popup,
    /// Passed through to the current chain's RPC endpoint.
    Rpc,
}

/// The account a signing or sending request names, if any.
pub fn sender_of(method: &Method, args: &RequestArguments) -> Option<Address> {
    let addr = |v: Option<&Value>| v.and_then(Value::as_str).and_then(parse_address);
    match method {
        Method::PersonalSign | Method::EthSignTypedDataV1 => addr(args.param(1)),
        Method::EthSignTypedDataV3 | Method::EthSignTypedDataV4 => addr(args.param(0)),
        Method::EthSendTransaction
        | Method::WalletSendCalls
        | Method::WalletSign
        | Method::WalletGrantPermissions => args.from_address(),
        _ => None,
    }
}

/// Route for `method` given the connection state.
///
/// `sub` is the cached sub-account. With `default_sub`, signing and sending requests that
/// name no sender go to the sub-account as well.
pub fn decide_route(
    method: &Method,
    connected: bool,
    sender: Option<Address>,
    sub: Option<Address>,
    default_sub: bool,
) -> Result<Route, SignerError> {
    if !connected {
        return match method {
            Method::EthRequestAccounts | Method::WalletConnect => Ok(Route::Connect),
            Method::WalletSwitchEthereumChain => Ok(Route::LocalSwitchChain),
            Method::WalletSendCalls | Method::WalletSign | Method::Experimental(_) => {
                Ok(Route::Popup)
            }
            other => Err(SignerError::unauthorized(format!(
                "Must call 'eth_requestAccounts' before '{other}'"
            ))),
        };
    }

    if let Some(sub) = sub {
        if sender == Some(sub) {
            return Ok(Route::SubAccount);
        }
        if sender.is_none() && default_sub && (method.is_signing() || method.is_sending()) {
            return Ok(Route::SubAccount);
        }
    }

    Ok(match method {
        Method::Experimental(_) => Route::Popup,
        Method::EthChainId
        | Method::NetVersion
        | Method::EthCoinbase
        | Method::EthAccounts
        | Method::EthRequestAccounts => Route::Local,
        Method::WalletSwitchEthereumChain => Route::SwitchChain,
        Method::WalletGetCapabilities => Route::Capabilities,
        Method::WalletGetSubAccounts => Route::GetSubAccounts,
        Method::WalletAddSubAccount => Route::AddSubAccount,
        Method::CoinbaseFetchPermissions | Method::CoinbaseFetchPermission => {
            Route::SpendPermissions
        }
        Method::WalletConnect => Route::Connect,
        Method::WalletSendCalls
        | Method::WalletSign
        | Method::WalletGrantPermissions
        | Method::WalletGetCallsStatus
        | Method::WalletShowCallsStatus
        | Method::PersonalSign
        | Method::EthSendTransaction
        | Method::EthSignTypedDataV1
        | Method::EthSignTypedDataV3
        | Method::EthSignTypedDataV4 => Route::Popup,
        Method::Unknown(_) => Route::Rpc,
    })
}

pub(super) async fn dispatch(signer: &Signer, args: RequestArguments) -> Result<Value, SignerError> {
    let method = Method::parse(&args.method);
    let sub = signer.store.sub_account().map(|s| s.address);
    let route = decide_route(
        &method,
        signer.is_connected(),
        sender_of(&method, &args),
        sub,
        signer.sub_accounts_config().default_account == DefaultAccount::Sub,
    )?;
    let span = tracing::debug_span!("request", %method, ?route);
    async move {
        debug!("dispatching");
        match route {
            Route::Local => Ok(signer.handle_local(&method)),
            Route::LocalSwitchChain => signer.handle_local_switch_chain(&args),
            Route::SwitchChain => signer.handle_switch_chain(&args).await,
            Route::Connect => signer.handle_connect(&method, args).await,
            Route::Capabilities => signer.handle_capabilities(&args),
            Route::GetSubAccounts => signer.handle_get_sub_accounts().await,
            Route::AddSubAccount => signer.handle_add_sub_account(args).await,
            Route::SpendPermissions => signer.handle_spend_permissions(&method, &args).await,
            Route::SubAccount => sub_account::delegate(signer, args).await,
            Route::Popup => {
                let mut args = args;
                signer.inject_capabilities(&mut args).await?;
                signer.send_request_to_popup(&args).await
            }
            Route::Rpc => signer.handle_rpc(&args).await,
        }
    }
    .instrument(span)
    .await
}

fn requested_chain_id(args: &RequestArguments) -> Result<u64, SignerError> {
    args.param(0)
        .and_then(|p| p.get("chainId"))
        .and_then(value_to_u64)
        .ok_or_else(|| SignerError::invalid_params("wallet_switchEthereumChain requires chainId"))
}

impl Signer {
    fn handle_local(&self, method: &Method) -> Value {
        let chain = self.chain();
        match method {
            Method::EthChainId => json!(to_hex_quantity(chain.id)),
            Method::NetVersion => json!(chain.id.to_string()),
            Method::EthCoinbase => self.accounts().first().map_or(Value::Null, |a| json!(a)),
            _ => {
                let accounts = match self.store.sub_account() {
                    Some(sub) => self.insert_sub_account(sub.address),
                    None => self.accounts(),
                };
                self.events.emit(ProviderEvent::Connect {
                    chain_id: to_hex_quantity(chain.id),
                });
                json!(accounts)
            }
        }
    }

    fn handle_local_switch_chain(&self, args: &RequestArguments) -> Result<Value, SignerError> {
        let id = requested_chain_id(args)?;
        if !update_chain(&self.store, &self.events, id, None) {
            let changed = self.store.chain().map(|c| c.id) != Some(id);
            self.store.set_chain(Chain::bare(id));
            if changed {
                self.events.emit(ProviderEvent::ChainChanged {
                    chain_id: to_hex_quantity(id),
                });
            }
        }
        Ok(Value::Null)
    }

    async fn handle_switch_chain(&self, args: &RequestArguments) -> Result<Value, SignerError> {
        let id = requested_chain_id(args)?;
        if update_chain(&self.store, &self.events, id, None) {
            return Ok(Value::Null);
        }
        debug!(chain_id = id, "unknown chain; asking the wallet");
        let result = self.send_request_to_popup(args).await?;
        if result.is_null() {
            update_chain(&self.store, &self.events, id, None);
        }
        Ok(result)
    }

    async fn handle_connect(
        &self,
        method: &Method,
        args: RequestArguments,
    ) -> Result<Value, SignerError> {
        let mut request = if *method == Method::EthRequestAccounts {
            RequestArguments::new(
                "wallet_connect",
                json!([{ "version": "1", "capabilities": {} }]),
            )
        } else {
            args
        };
        self.inject_capabilities(&mut request).await?;
        let result = self.send_request_to_popup(&request).await?;
        if *method == Method::EthRequestAccounts {
            return Ok(json!(self.accounts()));
        }
        Ok(result)
    }

    fn handle_capabilities(&self, args: &RequestArguments) -> Result<Value, SignerError> {
        let account = args
            .param(0)
            .and_then(Value::as_str)
            .and_then(parse_address)
            .ok_or_else(|| SignerError::invalid_params("wallet_getCapabilities requires an account"))?;
        if !self.accounts().contains(&account) {
            return Err(SignerError::unauthorized(
                "no active account found when getting capabilities",
            ));
        }
        let Some(capabilities) = self.store.capabilities() else {
            return Ok(json!({}));
        };
        match args.param(1) {
            None | Some(Value::Null) => Ok(Value::Object(capabilities)),
            Some(filter) => Ok(Value::Object(filter_by_chain_ids(
                &capabilities,
                &requested_chain_ids(filter),
            ))),
        }
    }

    async fn handle_get_sub_accounts(&self) -> Result<Value, SignerError> {
        if let Some(sub) = self.store.sub_account() {
            return Ok(json!({ "subAccounts": [sub] }));
        }
        let global = self
            .global_account()
            .ok_or_else(|| SignerError::unauthorized("no global account connected"))?;
        let response = self
            .pool
            .call_url(
                &self.config.wallet_rpc_url,
                "wallet_getSubAccounts",
                json!([{ "account": global, "domain": self.config.app.app_name }]),
            )
            .await?;
        let subs = response
            .get("subAccounts")
            .and_then(Value::as_array)
            .ok_or_else(|| SignerError::internal("wallet_getSubAccounts response has no subAccounts"))?
            .iter()
            .map(SubAccount::from_value)
            .collect::<Result<Vec<_>, _>>()?;
        if let Some(first) = subs.into_iter().next() {
            debug!(sub = %first.address, "caching sub-account");
            self.store.set_sub_account(first);
        }
        Ok(response)
    }

    async fn handle_add_sub_account(&self, mut args: RequestArguments) -> Result<Value, SignerError> {
        let account = args.param(0).and_then(|p| p.get("account"));
        let requested = account
            .and_then(|a| a.get("address"))
            .and_then(Value::as_str)
            .and_then(parse_address);

        if let Some(cached) = self.store.sub_account() {
            if requested.is_none() || requested == Some(cached.address) {
                debug!(sub = %cached.address, "returning cached sub-account");
                self.insert_sub_account(cached.address);
                return Ok(serde_json::to_value(&cached)?);
            }
        }

        let is_create = account.and_then(|a| a.get("type")).and_then(Value::as_str) == Some("create");
        let has_keys = account
            .and_then(|a| a.get("keys"))
            .and_then(Value::as_array)
            .is_some_and(|k| !k.is_empty());
        if is_create && !has_keys {
            let owner = self.owner_account().await?.address();
            if let Some(obj) = args
                .param_mut(0)
                .and_then(|p| p.get_mut("account"))
                .and_then(Value::as_object_mut)
            {
                obj.insert(
                    "keys".into(),
                    json!([{ "type": "address", "publicKey": owner }]),
                );
            }
        }
        self.send_request_to_popup(&args).await
    }

    async fn handle_spend_permissions(
        &self,
        method: &Method,
        args: &RequestArguments,
    ) -> Result<Value, SignerError> {
        let url = &self.config.wallet_rpc_url;
        if *method == Method::CoinbaseFetchPermissions {
            spend_permissions::fetch_permissions(&self.pool, url, &self.store, args).await
        } else {
            spend_permissions::fetch_permission(&self.pool, url, &self.store, args).await
        }
    }

    async fn handle_rpc(&self, args: &RequestArguments) -> Result<Value, SignerError> {
        let client = self.pool.client(&self.chain())?;
        let params = if args.params.is_null() {
            json!([])
        } else {
            args.params.clone()
        };
        client.request(&args.method, params).await
    }
}
