use crate::{
    crypto::{self, KeyPair, PeerKey, SharedSecret},
    errors::SignerError,
    store::StoreScope,
};
use std::sync::{Mutex, PoisonError};
use tracing::{debug, warn};

#[derive(Default)]
struct SessionKeys {
    own: Option<KeyPair>,
    peer: Option<PeerKey>,
    shared: Option<SharedSecret>,
}

/// Key manager for one signer: own key pair, the wallet's key, and the derived secret.
///
/// Key material is mirrored into the `keys` section of the signer's store scope, so a
/// persistent signer resumes its channel after a restart and an ephemeral one leaves nothing
/// behind.
pub struct Session {
    store: StoreScope,
    keys: Mutex<SessionKeys>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("store", &self.store.kind())
            .finish_non_exhaustive()
    }
}

impl Session {
    pub fn new(store: StoreScope) -> Self {
        Self {
            store,
            keys: Mutex::new(SessionKeys::default()),
        }
    }

    fn with_keys<R>(&self, f: impl FnOnce(&mut SessionKeys) -> R) -> R {
        let mut guard = self.keys.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut guard)
    }

    fn load_or_create_own(&self, keys: &mut SessionKeys) -> Result<KeyPair, SignerError> {
        if let Some(kp) = keys.own.as_ref() {
            return Ok(kp.clone());
        }
        let stored = self.store.keys().own_private_key;
        let kp = match stored.as_deref().map(KeyPair::from_pkcs8_hex) {
            Some(Ok(kp)) => kp,
            Some(Err(e)) => {
                warn!(error = %e, "stored session key unreadable; generating a new one");
                self.generate_and_store()?
            }
            None => self.generate_and_store()?,
        };
        keys.own = Some(kp.clone());
        Ok(kp)
    }

    fn generate_and_store(&self) -> Result<KeyPair, SignerError> {
        let kp = KeyPair::generate()?;
        let hex = kp.to_pkcs8_hex()?;
        self.store
            .update(|s| s.keys.own_private_key = Some(hex.as_str().to_owned()));
        debug!("generated session key pair");
        Ok(kp)
    }

    pub fn own_public_key_hex(&self) -> Result<String, SignerError> {
        self.with_keys(|keys| self.load_or_create_own(keys)?.public_key_hex())
    }

    pub fn peer_public_key(&self) -> Option<PeerKey> {
        self.with_keys(|keys| {
            if keys.peer.is_none() {
                keys.peer = self
                    .store
                    .keys()
                    .peer_public_key
                    .and_then(|h| crypto::import_peer_public_key_hex(&h).ok());
            }
            keys.peer.clone()
        })
    }

    /// Replace the wallet's key. Any cached secret belongs to the old key and is dropped.
    pub fn set_peer_public_key(&self, peer: PeerKey) -> Result<(), SignerError> {
        let hex = peer.to_hex()?;
        self.with_keys(|keys| {
            keys.peer = Some(peer);
            keys.shared = None;
        });
        self.store.update(|s| s.keys.peer_public_key = Some(hex));
        Ok(())
    }

    /// The shared secret, derived on first use. `None` until a peer key is known.
    pub fn shared_secret(&self) -> Result<Option<SharedSecret>, SignerError> {
        if let Some(s) = self.with_keys(|keys| keys.shared.clone()) {
            return Ok(Some(s));
        }
        let Some(peer) = self.peer_public_key() else {
            return Ok(None);
        };
        self.with_keys(|keys| {
            let own = self.load_or_create_own(keys)?;
            let secret = crypto::derive_shared_secret(&own, Some(&peer))?;
            keys.shared = Some(secret.clone());
            Ok(Some(secret))
        })
    }

    /// Forget everything. The next use generates a fresh key pair.
    pub fn rotate(&self) {
        self.with_keys(|keys| *keys = SessionKeys::default());
        self.store.update(|s| {
            s.keys.own_private_key = None;
            s.keys.peer_public_key = None;
        });
        debug!("session keys rotated");
    }
}
