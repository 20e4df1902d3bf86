//! Owner keys of sub-accounts.
//!
//! A sub-account is a smart wallet whose owner list contains the user's global account and
//! an app-held key. The app-held key signs locally; its position in the owner list is part of
//! every signature.

use super::{funding, Signer};
use crate::{
    chain_client::ChainClient,
    contracts::{owner_bytes_to_address, CoinbaseSmartWallet, CoinbaseSmartWalletFactory},
    crypto::fill_random,
    errors::SignerError,
    store::StoreScope,
    types::{to_hex_quantity, Address, RequestArguments, SubAccount},
};
use alloy::{
    primitives::{Bytes, B256, U256},
    signers::{local::PrivateKeySigner, SignerSync as _},
    sol_types::SolCall as _,
};
use async_trait::async_trait;
use serde_json::json;
use std::sync::Arc;
use tracing::{debug, info};
use zeroize::Zeroizing;

/// Local key that signs on behalf of a sub-account.
#[async_trait]
pub trait OwnerAccount: Send + Sync {
    fn address(&self) -> Address;

    /// Raw 65-byte ECDSA signature over `hash`, no message prefix.
    async fn sign_hash(&self, hash: B256) -> Result<Bytes, SignerError>;
}

/// Supplies the owner account for sub-account operations.
#[async_trait]
pub trait ToOwnerAccount: Send + Sync {
    async fn to_owner_account(&self) -> Result<Arc<dyn OwnerAccount>, SignerError>;
}

#[derive(Debug, Clone)]
pub struct LocalOwner {
    signer: PrivateKeySigner,
}

impl LocalOwner {
    pub const fn new(signer: PrivateKeySigner) -> Self {
        Self { signer }
    }

    pub fn from_hex(s: &str) -> Result<Self, SignerError> {
        let bytes = Zeroizing::new(
            hex::decode(s.trim_start_matches("0x"))
                .map_err(|e| SignerError::internal(format!("owner key hex: {e}")))?,
        );
        PrivateKeySigner::from_slice(&bytes)
            .map(Self::new)
            .map_err(|e| SignerError::internal(format!("owner key: {e}")))
    }

    pub fn generate() -> Result<Self, SignerError> {
        for _ in 0_u8..8_u8 {
            let mut bytes = Zeroizing::new([0_u8; 32]);
            fill_random(bytes.as_mut());
            if let Ok(signer) = PrivateKeySigner::from_slice(bytes.as_ref()) {
                return Ok(Self::new(signer));
            }
        }
        Err(SignerError::internal("failed to generate owner key"))
    }

    fn to_hex(&self) -> Zeroizing<String> {
        Zeroizing::new(hex::encode(self.signer.to_bytes()))
    }
}

#[async_trait]
impl OwnerAccount for LocalOwner {
    fn address(&self) -> Address {
        self.signer.address()
    }

    async fn sign_hash(&self, hash: B256) -> Result<Bytes, SignerError> {
        let sig = self
            .signer
            .sign_hash_sync(&hash)
            .map_err(|e| SignerError::internal(format!("owner sign: {e}")))?;
        Ok(Bytes::copy_from_slice(&sig.as_bytes()))
    }
}

/// Default owner provider: one secp256k1 key kept in the store scope, created on first use.
#[derive(Debug, Clone)]
pub struct StoredOwnerKey {
    store: StoreScope,
}

impl StoredOwnerKey {
    pub const fn new(store: StoreScope) -> Self {
        Self { store }
    }
}

#[async_trait]
impl ToOwnerAccount for StoredOwnerKey {
    async fn to_owner_account(&self) -> Result<Arc<dyn OwnerAccount>, SignerError> {
        if let Some(hex) = self.store.keys().owner_private_key {
            return Ok(Arc::new(LocalOwner::from_hex(&hex)?));
        }
        let owner = LocalOwner::generate()?;
        let hex = owner.to_hex();
        self.store
            .update(|s| s.keys.owner_private_key = Some(hex.as_str().to_owned()));
        debug!(owner = %owner.address(), "created sub-account owner key");
        Ok(Arc::new(owner))
    }
}

/// Position of `owner` in the sub-account's owner list.
///
/// Deployed accounts are read on chain, newest index first. Undeployed accounts are read from
/// the `createAccount` call in their factory data.
pub async fn find_owner_index(
    client: &ChainClient,
    sub: &SubAccount,
    owner: Address,
) -> Result<Option<u64>, SignerError> {
    if client.is_deployed(sub.address).await? {
        let next = client
            .eth_call(
                sub.address,
                &CoinbaseSmartWallet::nextOwnerIndexCall {}.abi_encode().into(),
            )
            .await?;
        let next = CoinbaseSmartWallet::nextOwnerIndexCall::abi_decode_returns(&next)
            .map_err(|e| SignerError::internal(format!("decode nextOwnerIndex: {e}")))?;
        let next = u64::try_from(next).unwrap_or(u64::MAX);
        for i in (0..next).rev() {
            let data = CoinbaseSmartWallet::ownerAtIndexCall {
                index: U256::from(i),
            }
            .abi_encode();
            let raw = client.eth_call(sub.address, &data.into()).await?;
            let entry = CoinbaseSmartWallet::ownerAtIndexCall::abi_decode_returns(&raw)
                .map_err(|e| SignerError::internal(format!("decode ownerAtIndex: {e}")))?;
            if owner_bytes_to_address(&entry) == Some(owner) {
                return Ok(Some(i));
            }
        }
        return Ok(None);
    }

    let Some(factory_data) = sub.factory_data.as_ref() else {
        return Ok(None);
    };
    let call = CoinbaseSmartWalletFactory::createAccountCall::abi_decode(factory_data)
        .map_err(|e| SignerError::internal(format!("decode factory data: {e}")))?;
    Ok(call
        .owners
        .iter()
        .position(|o| owner_bytes_to_address(o) == Some(owner))
        .and_then(|i| u64::try_from(i).ok()))
}

/// Register `owner` on the sub-account through the global account, deploying the account
/// first when needed, and wait for the bundle to land.
pub(super) async fn add_owner(
    signer: &Signer,
    global: Address,
    sub: &SubAccount,
    owner: Address,
) -> Result<(), SignerError> {
    let chain = signer.chain();
    let client = signer.pool.client(&chain)?;
    let mut calls = Vec::with_capacity(2);
    if !client.is_deployed(sub.address).await? {
        if let (Some(factory), Some(data)) = (sub.factory, sub.factory_data.as_ref()) {
            calls.push(json!({ "to": factory, "data": data, "value": "0x0" }));
        }
    }
    let data = CoinbaseSmartWallet::addOwnerAddressCall { owner }.abi_encode();
    calls.push(json!({ "to": sub.address, "data": Bytes::from(data), "value": "0x0" }));

    info!(%owner, sub = %sub.address, chain_id = chain.id, "adding owner to sub-account");
    let request = RequestArguments::new(
        "wallet_sendCalls",
        json!([{
            "version": "1.0",
            "chainId": to_hex_quantity(chain.id),
            "from": global,
            "calls": calls,
            "atomicRequired": true,
        }]),
    );
    let result = signer.send_request_to_popup(&request).await?;
    let id = funding::calls_id(&result)?;
    funding::wait_for_calls_status(signer, &id).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy::primitives::keccak256;

    #[tokio::test]
    async fn stored_owner_is_stable_per_scope() -> eyre::Result<()> {
        let store = StoreScope::ephemeral();
        let provider = StoredOwnerKey::new(store.clone());
        let a = provider.to_owner_account().await?;
        let b = provider.to_owner_account().await?;
        assert_eq!(a.address(), b.address());

        let other = StoredOwnerKey::new(StoreScope::ephemeral());
        assert_ne!(other.to_owner_account().await?.address(), a.address());
        Ok(())
    }

    #[tokio::test]
    async fn signature_recovers_owner() -> eyre::Result<()> {
        let owner = LocalOwner::generate()?;
        let hash = keccak256(b"payload");
        let sig = owner.sign_hash(hash).await?;
        assert_eq!(sig.len(), 65);
        let parsed = alloy::primitives::Signature::try_from(sig.as_ref())?;
        assert_eq!(parsed.recover_address_from_prehash(&hash)?, owner.address());
        Ok(())
    }
}
