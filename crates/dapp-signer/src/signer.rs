//! The persistent signer.
//!
//! A [`Signer`] owns one secure channel to the wallet popup and routes every request either
//! to that popup, to the app's sub-account, or straight to the chain. Connection state lives
//! in its [`StoreScope`].

mod channel;
mod ephemeral;
mod funding;
pub mod owner;
mod router;
mod sub_account;

pub use channel::{apply_response_data, update_chain, SecureChannel};
pub use ephemeral::{EphemeralProvider, EphemeralSigner};
pub use router::{decide_route, sender_of, Route};

use crate::{
    capabilities::{inject_request_capabilities, InjectedCapabilities},
    chain_client::ChainClientPool,
    communicator::Communicator,
    config::{DefaultAccount, SdkConfig, SubAccountCreation, SubAccountsConfig},
    errors::SignerError,
    events::{EventBus, ProviderEvent},
    message::ResponseResult,
    method::Method,
    spend_permissions,
    store::StoreScope,
    types::{
        append_without_duplicates, parse_address, prepend_without_duplicates, to_hex_quantity,
        Address, Chain, RequestArguments, SubAccount,
    },
};
use owner::{OwnerAccount, StoredOwnerKey, ToOwnerAccount};
use serde_json::Value;
use std::{sync::Arc, time::Duration};
use tracing::{debug, info};

pub const DEFAULT_RECEIPT_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Everything a signer is built from.
pub struct SignerOptions {
    pub config: Arc<SdkConfig>,
    pub store: StoreScope,
    pub communicator: Arc<dyn Communicator>,
    pub pool: Arc<ChainClientPool>,
    pub events: EventBus,
    /// Owner key provider for sub-accounts. Defaults to a key kept in `store`.
    pub owner_provider: Option<Arc<dyn ToOwnerAccount>>,
    /// How often user operation receipts and call bundle statuses are polled.
    pub poll_interval: Duration,
}

impl SignerOptions {
    pub fn new(
        config: Arc<SdkConfig>,
        store: StoreScope,
        communicator: Arc<dyn Communicator>,
        pool: Arc<ChainClientPool>,
    ) -> Self {
        Self {
            config,
            store,
            communicator,
            pool,
            events: EventBus::new(),
            owner_provider: None,
            poll_interval: DEFAULT_RECEIPT_POLL_INTERVAL,
        }
    }
}

pub struct Signer {
    config: Arc<SdkConfig>,
    store: StoreScope,
    channel: SecureChannel,
    pool: Arc<ChainClientPool>,
    events: EventBus,
    owner_provider: Arc<dyn ToOwnerAccount>,
    poll_interval: Duration,
}

impl std::fmt::Debug for Signer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Signer")
            .field("store", &self.store.kind())
            .field("channel", &self.channel)
            .finish_non_exhaustive()
    }
}

impl Signer {
    pub fn new(opts: SignerOptions) -> Self {
        let SignerOptions {
            config,
            store,
            communicator,
            pool,
            events,
            owner_provider,
            poll_interval,
        } = opts;
        store.set_sub_accounts_config(config.sub_accounts.clone());
        let owner_provider = owner_provider
            .unwrap_or_else(|| Arc::new(StoredOwnerKey::new(store.clone())));
        Self {
            channel: SecureChannel::new(store.clone(), communicator, events.clone()),
            config,
            store,
            pool,
            events,
            owner_provider,
            poll_interval,
        }
    }

    pub const fn store(&self) -> &StoreScope {
        &self.store
    }

    pub const fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn accounts(&self) -> Vec<Address> {
        self.store.accounts()
    }

    pub fn is_connected(&self) -> bool {
        !self.store.accounts().is_empty()
    }

    /// Popup round trips currently waiting for a response.
    pub fn in_flight_requests(&self) -> usize {
        self.channel.in_flight()
    }

    /// Current chain: the stored one, else the app's first chain, else mainnet.
    pub fn chain(&self) -> Chain {
        if let Some(chain) = self.store.chain() {
            return chain;
        }
        let id = self.config.app.app_chain_ids.first().copied().unwrap_or(1);
        self.store
            .chains()
            .into_iter()
            .find(|c| c.id == id)
            .unwrap_or_else(|| Chain::bare(id))
    }

    fn sub_accounts_config(&self) -> SubAccountsConfig {
        self.store.sub_accounts_config()
    }

    /// First connected account that is not the sub-account.
    fn global_account(&self) -> Option<Address> {
        let sub = self.store.sub_account().map(|s| s.address);
        self.accounts().into_iter().find(|a| Some(*a) != sub)
    }

    async fn owner_account(&self) -> Result<Arc<dyn OwnerAccount>, SignerError> {
        self.owner_provider
            .to_owner_account()
            .await
            .map_err(|e| SignerError::unauthorized(format!("no owner account available: {e}")))
    }

    /// Exchange keys with the wallet. `args` travels in plaintext.
    pub async fn handshake(&self, args: RequestArguments) -> Result<(), SignerError> {
        let response = self.channel.handshake(&args).await?;
        match response.result {
            ResponseResult::Error(e) => Err(SignerError::Protocol(e)),
            ResponseResult::Value(v) => self.handle_response(&args, &v),
        }
    }

    pub async fn request(&self, args: RequestArguments) -> Result<Value, SignerError> {
        router::dispatch(self, args).await
    }

    /// Rotate the session keys and clear the connection state.
    pub fn cleanup(&self) {
        self.channel.rotate();
        self.store.reset();
        debug!(scope = ?self.store.kind(), "signer cleaned up");
    }

    async fn send_request_to_popup(&self, args: &RequestArguments) -> Result<Value, SignerError> {
        let chain_id = self.chain().id;
        let response = self.channel.round_trip(args, chain_id).await?;
        match response.result {
            ResponseResult::Error(e) => Err(SignerError::Protocol(e)),
            ResponseResult::Value(v) => {
                self.handle_response(args, &v)?;
                Ok(v)
            }
        }
    }

    /// Add SDK capabilities to `wallet_connect` and `wallet_sendCalls`.
    async fn inject_capabilities(&self, args: &mut RequestArguments) -> Result<(), SignerError> {
        let creation = self.sub_accounts_config().creation;
        let owner = if Method::parse(&args.method) == Method::WalletConnect
            && creation == SubAccountCreation::OnConnect
        {
            Some(self.owner_account().await?.address())
        } else {
            None
        };
        inject_request_capabilities(
            args,
            &InjectedCapabilities {
                creation,
                owner,
                attribution: self.config.preference.attribution.as_ref(),
            },
        );
        Ok(())
    }

    fn handle_response(&self, args: &RequestArguments, value: &Value) -> Result<(), SignerError> {
        match Method::parse(&args.method) {
            Method::EthRequestAccounts | Method::WalletConnect => self.handle_connect_result(value),
            Method::WalletAddSubAccount => {
                let sub = SubAccount::from_value(value)?;
                info!(sub = %sub.address, "sub-account added");
                let address = sub.address;
                self.store.set_sub_account(sub);
                self.insert_sub_account(address);
                Ok(())
            }
            _ => Ok(()),
        }
    }

    /// Accepts both the `wallet_connect` shape and a legacy address array.
    fn handle_connect_result(&self, value: &Value) -> Result<(), SignerError> {
        let (globals, sub, permissions) = if let Some(list) = value.as_array() {
            let globals: Vec<Address> = list
                .iter()
                .filter_map(|v| v.as_str().and_then(parse_address))
                .collect();
            (globals, None, None)
        } else {
            let accounts = value
                .get("accounts")
                .and_then(Value::as_array)
                .ok_or_else(|| SignerError::internal("wallet_connect response has no accounts"))?;
            let globals: Vec<Address> = accounts
                .iter()
                .filter_map(|a| a.get("address").and_then(Value::as_str).and_then(parse_address))
                .collect();
            let caps = accounts.first().and_then(|a| a.get("capabilities"));
            let sub = caps
                .and_then(|c| c.get("subAccounts"))
                .and_then(Value::as_array)
                .and_then(|s| s.first())
                .map(SubAccount::from_value)
                .transpose()?;
            let permissions = caps
                .and_then(|c| c.pointer("/spendPermissions/permissions"))
                .and_then(Value::as_array)
                .map(|p| spend_permissions::parse_permissions(p));
            (globals, sub, permissions)
        };
        if globals.is_empty() {
            return Err(SignerError::internal("wallet returned no accounts"));
        }

        self.store.set_accounts(globals);
        if let Some(sub) = sub {
            let address = sub.address;
            self.store.set_sub_account(sub);
            self.store.update(|s| {
                place_sub_account(
                    &mut s.account.accounts,
                    address,
                    s.sub_accounts_config
                        .as_ref()
                        .map(|c| c.default_account)
                        .unwrap_or_default(),
                );
            });
        }
        if let Some(permissions) = permissions {
            self.store.set_spend_permissions(permissions);
        }
        let chain = self.chain();
        if self.store.chain().is_none() {
            self.store.set_chain(chain.clone());
        }

        let accounts = self.accounts();
        info!(accounts = accounts.len(), chain_id = chain.id, "connected");
        self.events.emit(ProviderEvent::Connect {
            chain_id: to_hex_quantity(chain.id),
        });
        self.events
            .emit(ProviderEvent::AccountsChanged { accounts });
        Ok(())
    }

    /// Put `sub` into the AccountSet per the default-account setting, emitting
    /// `accountsChanged` when the set changes.
    fn insert_sub_account(&self, sub: Address) -> Vec<Address> {
        let default_account = self.sub_accounts_config().default_account;
        let (accounts, changed) = self.store.update(|s| {
            let before = s.account.accounts.clone();
            place_sub_account(&mut s.account.accounts, sub, default_account);
            (s.account.accounts.clone(), before != s.account.accounts)
        });
        if changed {
            self.events.emit(ProviderEvent::AccountsChanged {
                accounts: accounts.clone(),
            });
        }
        accounts
    }
}

fn place_sub_account(accounts: &mut Vec<Address>, sub: Address, default_account: DefaultAccount) {
    match default_account {
        DefaultAccount::Sub => prepend_without_duplicates(accounts, sub),
        DefaultAccount::Global => append_without_duplicates(accounts, sub),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const GLOBAL: &str = "0x1111111111111111111111111111111111111111";
    const SUB: &str = "0x2222222222222222222222222222222222222222";

    #[test]
    fn sub_account_placement_follows_default() -> eyre::Result<()> {
        let (g, s) = (GLOBAL.parse::<Address>()?, SUB.parse::<Address>()?);
        let mut accounts = vec![g];
        place_sub_account(&mut accounts, s, DefaultAccount::Global);
        assert_eq!(accounts, vec![g, s]);
        place_sub_account(&mut accounts, s, DefaultAccount::Sub);
        assert_eq!(accounts, vec![s, g]);
        Ok(())
    }
}
