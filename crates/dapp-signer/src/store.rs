//! Key/value state behind a signer.
//!
//! A persistent scope is shared by every persistent signer in the process and mirrors itself
//! to `store.json`. An ephemeral scope belongs to exactly one one-shot signer and never
//! touches disk.

use crate::{
    config::SubAccountsConfig,
    types::{Address, Chain, SpendPermission, SubAccount},
};
use eyre::Context as _;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::{
    fmt, fs,
    path::PathBuf,
    sync::{Arc, Mutex, PoisonError},
};
use tracing::warn;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct AccountState {
    pub accounts: Vec<Address>,
    pub chain: Option<Chain>,
    pub capabilities: Option<Map<String, Value>>,
}

/// Hex encoded key material. Never logged.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct KeysState {
    pub own_private_key: Option<String>,
    pub peer_public_key: Option<String>,
    pub owner_private_key: Option<String>,
}

impl fmt::Debug for KeysState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeysState")
            .field("own_private_key", &self.own_private_key.as_ref().map(|_| "<redacted>"))
            .field("peer_public_key", &self.peer_public_key)
            .field(
                "owner_private_key",
                &self.owner_private_key.as_ref().map(|_| "<redacted>"),
            )
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct StoreState {
    pub account: AccountState,
    pub sub_account: Option<SubAccount>,
    pub sub_accounts_config: Option<SubAccountsConfig>,
    pub spend_permissions: Vec<SpendPermission>,
    pub chains: Vec<Chain>,
    pub keys: KeysState,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScopeKind {
    Persistent,
    Ephemeral,
}

#[derive(Debug)]
struct StoreInner {
    kind: ScopeKind,
    path: Option<PathBuf>,
    state: Mutex<StoreState>,
}

/// Cloning shares the same scope.
#[derive(Debug, Clone)]
pub struct StoreScope {
    inner: Arc<StoreInner>,
}

impl StoreScope {
    /// Persistent scope mirrored to `path`. Existing state is loaded.
    pub fn persistent(path: PathBuf) -> eyre::Result<Self> {
        let state = if path.exists() {
            let s = fs::read_to_string(&path).with_context(|| format!("read {}", path.display()))?;
            serde_json::from_str(&s).with_context(|| format!("parse {}", path.display()))?
        } else {
            StoreState::default()
        };
        Ok(Self::with(ScopeKind::Persistent, Some(path), state))
    }

    /// Persistent semantics without a backing file.
    pub fn persistent_in_memory() -> Self {
        Self::with(ScopeKind::Persistent, None, StoreState::default())
    }

    pub fn ephemeral() -> Self {
        Self::with(ScopeKind::Ephemeral, None, StoreState::default())
    }

    fn with(kind: ScopeKind, path: Option<PathBuf>, state: StoreState) -> Self {
        Self {
            inner: Arc::new(StoreInner {
                kind,
                path,
                state: Mutex::new(state),
            }),
        }
    }

    pub fn kind(&self) -> ScopeKind {
        self.inner.kind
    }

    pub fn is_ephemeral(&self) -> bool {
        self.inner.kind == ScopeKind::Ephemeral
    }

    pub fn same_scope(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub fn read<R>(&self, f: impl FnOnce(&StoreState) -> R) -> R {
        let guard = self
            .inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        f(&guard)
    }

    /// Mutate and mirror to disk under the lock, so the file never falls behind a newer
    /// in-memory state. The closure must not block.
    pub fn update<R>(&self, f: impl FnOnce(&mut StoreState) -> R) -> R {
        let mut guard = self
            .inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let out = f(&mut guard);
        self.persist(&guard);
        out
    }

    fn persist(&self, state: &StoreState) {
        let Some(path) = self.inner.path.as_ref() else {
            return;
        };
        let res = serde_json::to_vec_pretty(state)
            .context("serialize store")
            .and_then(|bytes| crate::fsutil::write_atomic_private(path, &bytes));
        if let Err(e) = res {
            // Best-effort: in-memory state stays authoritative for this process.
            warn!(error = %e, path = %path.display(), "failed to persist store");
        }
    }

    /// App-level teardown. The sub-account configuration and the sub-account owner key
    /// survive; everything else is cleared.
    pub fn reset(&self) {
        self.update(|s| {
            let cfg = s.sub_accounts_config.take();
            let owner_private_key = s.keys.owner_private_key.take();
            *s = StoreState {
                sub_accounts_config: cfg,
                keys: KeysState {
                    owner_private_key,
                    ..KeysState::default()
                },
                ..StoreState::default()
            };
        });
    }

    pub fn accounts(&self) -> Vec<Address> {
        self.read(|s| s.account.accounts.clone())
    }

    pub fn set_accounts(&self, accounts: Vec<Address>) {
        self.update(|s| s.account.accounts = accounts);
    }

    pub fn chain(&self) -> Option<Chain> {
        self.read(|s| s.account.chain.clone())
    }

    pub fn set_chain(&self, chain: Chain) {
        self.update(|s| s.account.chain = Some(chain));
    }

    pub fn capabilities(&self) -> Option<Map<String, Value>> {
        self.read(|s| s.account.capabilities.clone())
    }

    pub fn set_capabilities(&self, capabilities: Map<String, Value>) {
        self.update(|s| s.account.capabilities = Some(capabilities));
    }

    pub fn chains(&self) -> Vec<Chain> {
        self.read(|s| s.chains.clone())
    }

    pub fn set_chains(&self, chains: Vec<Chain>) {
        self.update(|s| s.chains = chains);
    }

    pub fn sub_account(&self) -> Option<SubAccount> {
        self.read(|s| s.sub_account.clone())
    }

    pub fn set_sub_account(&self, sub: SubAccount) {
        self.update(|s| s.sub_account = Some(sub));
    }

    pub fn sub_accounts_config(&self) -> SubAccountsConfig {
        self.read(|s| s.sub_accounts_config.clone().unwrap_or_default())
    }

    pub fn set_sub_accounts_config(&self, cfg: SubAccountsConfig) {
        self.update(|s| s.sub_accounts_config = Some(cfg));
    }

    pub fn spend_permissions(&self) -> Vec<SpendPermission> {
        self.read(|s| s.spend_permissions.clone())
    }

    pub fn set_spend_permissions(&self, permissions: Vec<SpendPermission>) {
        self.update(|s| s.spend_permissions = permissions);
    }

    pub fn keys(&self) -> KeysState {
        self.read(|s| s.keys.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::parse_address;

    #[test]
    fn clones_share_state_and_ephemeral_scopes_do_not() -> eyre::Result<()> {
        let a = parse_address("0x1111111111111111111111111111111111111111")
            .ok_or_else(|| eyre::eyre!("address"))?;
        let shared = StoreScope::persistent_in_memory();
        let alias = shared.clone();
        alias.set_accounts(vec![a]);
        assert_eq!(shared.accounts(), vec![a]);
        assert!(shared.same_scope(&alias));

        let e1 = StoreScope::ephemeral();
        let e2 = StoreScope::ephemeral();
        e1.set_chain(Chain::bare(8453));
        assert_eq!(e2.chain(), None);
        assert!(!e1.same_scope(&e2));
        assert!(e1.is_ephemeral());
        Ok(())
    }

    #[test]
    fn persistent_scope_survives_reload_and_reset() -> eyre::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("store.json");
        let store = StoreScope::persistent(path.clone())?;
        store.set_chain(Chain::bare(8453));
        store.set_sub_accounts_config(SubAccountsConfig::default());
        store.update(|s| {
            s.keys.own_private_key = Some("aa".into());
            s.keys.owner_private_key = Some("bb".into());
        });

        let reloaded = StoreScope::persistent(path.clone())?;
        assert_eq!(reloaded.chain().map(|c| c.id), Some(8453));

        reloaded.reset();
        let after = StoreScope::persistent(path)?;
        assert_eq!(after.chain(), None);
        assert!(after.read(|s| s.sub_accounts_config.is_some()));
        assert_eq!(after.keys().owner_private_key.as_deref(), Some("bb"));
        assert_eq!(after.keys().own_private_key, None);
        Ok(())
    }

    #[test]
    fn file_matches_memory_after_concurrent_updates() -> eyre::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("store.json");
        let store = StoreScope::persistent(path.clone())?;

        let handles: Vec<_> = (1_u64..=8_u64)
            .map(|id| {
                let store = store.clone();
                std::thread::spawn(move || store.set_chain(Chain::bare(id)))
            })
            .collect();
        for h in handles {
            h.join().map_err(|_panic| eyre::eyre!("writer thread panicked"))?;
        }

        let on_disk = StoreScope::persistent(path)?;
        assert_eq!(on_disk.chain(), store.chain());
        Ok(())
    }

    #[test]
    fn keys_are_redacted_in_debug() {
        let k = KeysState {
            own_private_key: Some("deadbeef".into()),
            peer_public_key: None,
            owner_private_key: None,
        };
        assert!(!format!("{k:?}").contains("deadbeef"));
    }
}
