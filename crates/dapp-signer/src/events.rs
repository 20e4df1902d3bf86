use crate::types::Address;
use serde::Serialize;
use tokio::sync::broadcast;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "camelCase")]
pub enum ProviderEvent {
    #[serde(rename_all = "camelCase")]
    Connect { chain_id: String },
    AccountsChanged { accounts: Vec<Address> },
    #[serde(rename_all = "camelCase")]
    ChainChanged { chain_id: String },
    Disconnect { code: i64, message: String },
}

/// Fan-out of provider events. Subscribers only see events emitted after they subscribe.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<ProviderEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(64);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ProviderEvent> {
        self.tx.subscribe()
    }

    pub fn emit(&self, event: ProviderEvent) {
        tracing::debug!(?event, "provider event");
        // No subscribers is fine.
        drop(self.tx.send(event));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscribers_receive_in_order() -> eyre::Result<()> {
        let bus = EventBus::new();
        bus.emit(ProviderEvent::ChainChanged { chain_id: "0x1".into() });
        let mut rx = bus.subscribe();
        bus.emit(ProviderEvent::Connect { chain_id: "0x2105".into() });
        bus.emit(ProviderEvent::ChainChanged { chain_id: "0x2105".into() });
        assert_eq!(rx.recv().await?, ProviderEvent::Connect { chain_id: "0x2105".into() });
        assert_eq!(
            rx.recv().await?,
            ProviderEvent::ChainChanged { chain_id: "0x2105".into() }
        );
        Ok(())
    }

    #[test]
    fn serializes_with_event_tag() -> eyre::Result<()> {
        let v = serde_json::to_value(ProviderEvent::Connect { chain_id: "0x1".into() })?;
        assert_eq!(v, serde_json::json!({ "event": "connect", "chainId": "0x1" }));
        Ok(())
    }
}
