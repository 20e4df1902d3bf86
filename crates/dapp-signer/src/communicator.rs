use crate::{
    errors::SignerError,
    message::{RpcRequestMessage, RpcResponseMessage},
};
use async_trait::async_trait;

/// Message transport to the wallet popup. Owned by the embedding application.
#[async_trait]
pub trait Communicator: Send + Sync {
    /// Resolves once the popup is open and ready to receive messages.
    async fn wait_for_popup_loaded(&self) -> Result<(), SignerError>;

    /// Post `message` and resolve with the response whose `request_id` matches its `id`.
    async fn post_request_and_wait_for_response(
        &self,
        message: RpcRequestMessage,
    ) -> Result<RpcResponseMessage, SignerError>;
}
