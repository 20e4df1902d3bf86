//! Encrypted request/response channel to the wallet popup.
//!
//! `handshake` exchanges public keys in plaintext. Every later request is encrypted with the
//! derived secret, and every decrypted response passes through [`apply_response_data`] before
//! its result reaches the caller.

use crate::{
    communicator::Communicator,
    correlation::CorrelationTracker,
    crypto::{self, import_peer_public_key_hex},
    errors::SignerError,
    events::{EventBus, ProviderEvent},
    message::{
        EncryptedRequest, RequestContent, ResponseContent, ResponseData, RpcRequestMessage,
        RpcResponse, RpcResponseMessage,
    },
    session::Session,
    store::StoreScope,
    types::{parse_u64, to_hex_quantity, Chain, RequestArguments},
};
use std::sync::Arc;
use tracing::{debug, info_span, warn, Instrument as _};

pub struct SecureChannel {
    session: Session,
    communicator: Arc<dyn Communicator>,
    store: StoreScope,
    events: EventBus,
    correlations: CorrelationTracker,
}

impl std::fmt::Debug for SecureChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecureChannel")
            .field("session", &self.session)
            .field("in_flight", &self.correlations.in_flight())
            .finish_non_exhaustive()
    }
}

impl SecureChannel {
    pub fn new(store: StoreScope, communicator: Arc<dyn Communicator>, events: EventBus) -> Self {
        Self {
            session: Session::new(store.clone()),
            communicator,
            store,
            events,
            correlations: CorrelationTracker::default(),
        }
    }

    /// Whether a shared secret can be derived right now.
    pub fn is_established(&self) -> bool {
        matches!(self.session.shared_secret(), Ok(Some(_)))
    }

    pub fn in_flight(&self) -> usize {
        self.correlations.in_flight()
    }

    /// Plaintext key exchange. The wallet's key is taken from the response `sender`.
    pub async fn handshake(&self, args: &RequestArguments) -> Result<RpcResponse, SignerError> {
        let correlation = self.correlations.begin();
        let span = info_span!("handshake", method = %args.method, correlation_id = correlation.id());
        async {
            self.communicator.wait_for_popup_loaded().await?;
            let message = RpcRequestMessage::new(
                self.session.own_public_key_hex()?,
                Some(correlation.id().to_owned()),
                RequestContent::Handshake(args.clone()),
            );
            let response = self
                .communicator
                .post_request_and_wait_for_response(message)
                .await?;
            if let ResponseContent::Failure(failure) = &response.content {
                debug!(code = failure.code, "handshake rejected");
                return Err(SignerError::Protocol(failure.clone()));
            }
            let peer = import_peer_public_key_hex(&response.sender)?;
            self.session.set_peer_public_key(peer)?;
            debug!("secure channel established");
            self.open(&response)
        }
        .instrument(span)
        .await
    }

    /// Encrypt `action` for `chain_id`, send it, and open the response.
    pub async fn round_trip(
        &self,
        action: &RequestArguments,
        chain_id: u64,
    ) -> Result<RpcResponse, SignerError> {
        let Some(secret) = self.session.shared_secret()? else {
            return Err(SignerError::unauthorized(
                "No shared secret found when encrypting request",
            ));
        };
        let correlation = self.correlations.begin();
        let span = info_span!(
            "popup_request",
            method = %action.method,
            chain_id,
            correlation_id = correlation.id()
        );
        async {
            self.communicator.wait_for_popup_loaded().await?;
            let encrypted = crypto::encrypt_content(
                &EncryptedRequest {
                    action: action.clone(),
                    chain_id,
                },
                &secret,
            )?;
            let message = RpcRequestMessage::new(
                self.session.own_public_key_hex()?,
                Some(correlation.id().to_owned()),
                RequestContent::Encrypted(encrypted),
            );
            let response = self
                .communicator
                .post_request_and_wait_for_response(message)
                .await?;
            self.open(&response)
        }
        .instrument(span)
        .await
    }

    /// Failures bypass decryption. A response that cannot be decrypted rotates the session.
    fn open(&self, response: &RpcResponseMessage) -> Result<RpcResponse, SignerError> {
        let data = match &response.content {
            ResponseContent::Failure(failure) => return Err(SignerError::Protocol(failure.clone())),
            ResponseContent::Encrypted(data) => data,
        };
        let Some(secret) = self.session.shared_secret()? else {
            return Err(SignerError::NoSharedSecret);
        };
        let decrypted: RpcResponse = match crypto::decrypt_content(data, &secret) {
            Ok(r) => r,
            Err(e) => {
                warn!(error = %e, "response decryption failed; rotating session");
                self.session.rotate();
                return Err(e);
            }
        };
        if let Some(data) = decrypted.data.as_ref() {
            apply_response_data(&self.store, &self.events, data);
        }
        Ok(decrypted)
    }

    pub fn rotate(&self) {
        self.session.rotate();
    }
}

/// Side effects of every decrypted response: the chain list and the wallet capabilities are
/// replaced when present, and the current chain is re-resolved against the new list.
pub fn apply_response_data(store: &StoreScope, events: &EventBus, data: &ResponseData) {
    if let Some(chains) = data.chains.as_ref() {
        let list: Vec<Chain> = chains
            .iter()
            .filter_map(|(id, url)| {
                parse_u64(id).map(|id| Chain {
                    id,
                    rpc_url: Some(url.clone()),
                    native_currency: None,
                })
            })
            .collect();
        debug!(chains = list.len(), "chain list updated");
        let current = store.chain().map(|c| c.id);
        store.set_chains(list);
        if let Some(id) = current {
            update_chain(store, events, id, None);
        }
    }
    if let Some(capabilities) = data.capabilities.as_ref() {
        store.set_capabilities(capabilities.clone());
    }
}

/// Switch to a chain from the cached list, optionally replacing the list first.
///
/// Returns `false` when the chain is unknown. `chainChanged` fires only when the id changes.
pub fn update_chain(
    store: &StoreScope,
    events: &EventBus,
    chain_id: u64,
    new_chains: Option<Vec<Chain>>,
) -> bool {
    if let Some(chains) = new_chains {
        store.set_chains(chains);
    }
    let Some(chain) = store.chains().into_iter().find(|c| c.id == chain_id) else {
        return false;
    };
    let changed = store.chain().map(|c| c.id) != Some(chain_id);
    store.set_chain(chain);
    if changed {
        events.emit(ProviderEvent::ChainChanged {
            chain_id: to_hex_quantity(chain_id),
        });
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[test]
    fn chain_update_emits_only_on_change() -> eyre::Result<()> {
        let store = StoreScope::ephemeral();
        let events = EventBus::new();
        let mut rx = events.subscribe();
        assert!(!update_chain(&store, &events, 8453, None));

        let chains = vec![Chain::bare(1), Chain::bare(8453)];
        assert!(update_chain(&store, &events, 8453, Some(chains)));
        assert!(update_chain(&store, &events, 8453, None));
        assert_eq!(store.chain().map(|c| c.id), Some(8453));
        assert_eq!(
            rx.try_recv()?,
            ProviderEvent::ChainChanged {
                chain_id: "0x2105".into()
            }
        );
        assert!(rx.try_recv().is_err());
        Ok(())
    }

    #[test]
    fn response_data_refreshes_current_chain() {
        let store = StoreScope::ephemeral();
        let events = EventBus::new();
        store.set_chain(Chain::bare(8453));
        let data = ResponseData {
            chains: Some(BTreeMap::from([
                ("8453".to_owned(), "https://mainnet.base.org".to_owned()),
                ("bogus".to_owned(), "https://ignored".to_owned()),
            ])),
            capabilities: Some(serde_json::Map::new()),
        };
        apply_response_data(&store, &events, &data);
        assert_eq!(store.chains().len(), 1);
        assert_eq!(
            store.chain().and_then(|c| c.rpc_url).as_deref(),
            Some("https://mainnet.base.org")
        );
        assert!(store.capabilities().is_some());
    }
}
