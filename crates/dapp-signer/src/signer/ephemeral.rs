//! One-shot signing flows.
//!
//! Each operation builds its own [`EphemeralSigner`] with a private store scope and session,
//! so concurrent flows never share keys or cached state. Only the chain client pool is shared.

use super::{Signer, SignerOptions};
use crate::{
    chain_client::ChainClientPool,
    communicator::Communicator,
    config::SdkConfig,
    errors::SignerError,
    events::EventBus,
    method::Method,
    store::StoreScope,
    types::RequestArguments,
};
use serde_json::{json, Value};
use std::{sync::Arc, time::Duration};
use tracing::{debug, Instrument as _};

/// A signer whose state lives only as long as one operation.
#[derive(Debug)]
pub struct EphemeralSigner {
    inner: Signer,
}

impl EphemeralSigner {
    pub fn new(
        config: Arc<SdkConfig>,
        communicator: Arc<dyn Communicator>,
        pool: Arc<ChainClientPool>,
        poll_interval: Duration,
    ) -> Self {
        let opts = SignerOptions {
            config,
            store: StoreScope::ephemeral(),
            communicator,
            pool,
            events: EventBus::new(),
            owner_provider: None,
            poll_interval,
        };
        Self {
            inner: Signer::new(opts),
        }
    }

    pub const fn store(&self) -> &StoreScope {
        self.inner.store()
    }

    pub async fn handshake(&self, args: RequestArguments) -> Result<(), SignerError> {
        self.inner.handshake(args).await
    }

    pub async fn request(&self, args: RequestArguments) -> Result<Value, SignerError> {
        self.inner.request(args).await
    }

    pub fn cleanup(&self) {
        self.inner.cleanup();
    }

    /// Handshake, send `args`, and clean up whatever the outcome.
    pub async fn run(&self, args: RequestArguments) -> Result<Value, SignerError> {
        let result = async {
            self.handshake(RequestArguments::new("handshake", json!([])))
                .await?;
            self.request(args).await
        }
        .await;
        self.cleanup();
        result
    }
}

/// Provider surface for one-shot flows: `wallet_sendCalls`, `wallet_sign`,
/// `wallet_getCallsStatus`, and a few stubs.
#[derive(Clone)]
pub struct EphemeralProvider {
    config: Arc<SdkConfig>,
    communicator: Arc<dyn Communicator>,
    pool: Arc<ChainClientPool>,
    poll_interval: Duration,
}

impl std::fmt::Debug for EphemeralProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EphemeralProvider").finish_non_exhaustive()
    }
}

impl EphemeralProvider {
    pub fn new(
        config: Arc<SdkConfig>,
        communicator: Arc<dyn Communicator>,
        pool: Arc<ChainClientPool>,
    ) -> Self {
        Self {
            config,
            communicator,
            pool,
            poll_interval: super::DEFAULT_RECEIPT_POLL_INTERVAL,
        }
    }

    #[must_use]
    pub const fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// A fresh, isolated signer for one operation.
    pub fn signer(&self) -> EphemeralSigner {
        EphemeralSigner::new(
            Arc::clone(&self.config),
            Arc::clone(&self.communicator),
            Arc::clone(&self.pool),
            self.poll_interval,
        )
    }

    pub async fn request(&self, args: RequestArguments) -> Result<Value, SignerError> {
        let method = Method::parse(&args.method);
        let span = tracing::debug_span!("ephemeral_request", %method);
        async {
            match method {
                Method::WalletSendCalls | Method::WalletSign => {
                    debug!("running one-shot flow");
                    self.signer().run(args).await
                }
                Method::WalletGetCallsStatus => {
                    self.pool
                        .call_url(&self.config.wallet_rpc_url, &args.method, args.params.clone())
                        .await
                }
                Method::EthAccounts => Ok(json!([])),
                Method::NetVersion => Ok(json!("1")),
                Method::EthChainId => Ok(json!("0x1")),
                other => Err(SignerError::unauthorized(format!(
                    "method '{other}' is not supported by the ephemeral provider"
                ))),
            }
        }
        .instrument(span)
        .await
    }
}
