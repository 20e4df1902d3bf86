//! EIP-1193 style entry point for dapps.

use crate::{
    errors::{codes, SignerError},
    events::{EventBus, ProviderEvent},
    method::Method,
    signer::{Signer, SignerOptions},
    types::RequestArguments,
};
use serde_json::{json, Value};
use tokio::sync::broadcast;
use tracing::{info, warn};

#[derive(Debug)]
pub struct Provider {
    signer: Signer,
    events: EventBus,
}

impl Provider {
    pub fn new(opts: SignerOptions) -> Self {
        let events = opts.events.clone();
        Self {
            signer: Signer::new(opts),
            events,
        }
    }

    pub const fn signer(&self) -> &Signer {
        &self.signer
    }

    /// Events emitted after this call.
    pub fn subscribe(&self) -> broadcast::Receiver<ProviderEvent> {
        self.events.subscribe()
    }

    /// Serve one request. An `Unauthorized` outcome disconnects before it is returned.
    pub async fn request(&self, args: RequestArguments) -> Result<Value, SignerError> {
        validate(&args)?;
        let res = self.dispatch(args).await;
        if let Err(e) = &res {
            if e.is_unauthorized() {
                warn!(error = %e, "unauthorized; disconnecting");
                self.disconnect();
            }
        }
        res
    }

    async fn dispatch(&self, args: RequestArguments) -> Result<Value, SignerError> {
        if self.signer.is_connected() {
            return self.signer.request(args).await;
        }
        match Method::parse(&args.method) {
            // One-shot flows on an unconnected provider leave no session behind.
            Method::WalletSendCalls | Method::WalletSign => {
                let res = async {
                    self.signer.handshake(handshake_args()).await?;
                    self.signer.request(args).await
                }
                .await;
                self.signer.cleanup();
                res
            }
            m if m.needs_handshake() => {
                self.signer.handshake(handshake_args()).await?;
                self.signer.request(args).await
            }
            _ => self.signer.request(args).await,
        }
    }

    /// Tear down the session and the stored connection, then emit `disconnect`.
    pub fn disconnect(&self) {
        self.signer.cleanup();
        info!("disconnected");
        self.events.emit(ProviderEvent::Disconnect {
            code: codes::DISCONNECTED,
            message: "User initiated disconnection".into(),
        });
    }
}

fn handshake_args() -> RequestArguments {
    RequestArguments::new("handshake", json!([]))
}

fn validate(args: &RequestArguments) -> Result<(), SignerError> {
    if args.method.trim().is_empty() {
        return Err(SignerError::InvalidRequest(
            "'args.method' must be a non-empty string".into(),
        ));
    }
    if !(args.params.is_null() || args.params.is_array() || args.params.is_object()) {
        return Err(SignerError::invalid_params(
            "'args.params' must be an object or array if provided",
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_malformed_arguments() {
        assert!(matches!(
            validate(&RequestArguments::new(" ", Value::Null)),
            Err(SignerError::InvalidRequest(_))
        ));
        assert!(matches!(
            validate(&RequestArguments::new("eth_chainId", json!("x"))),
            Err(SignerError::InvalidParams(_))
        ));
        assert!(validate(&RequestArguments::new("eth_chainId", json!({}))).is_ok());
        assert!(validate(&RequestArguments::new("eth_chainId", Value::Null)).is_ok());
    }
}
