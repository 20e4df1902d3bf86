use crate::{
    config::ChainsConfig,
    errors::{RpcErrorObject, SignerError},
    retry::{try_all_with_backoff, BackoffConfig},
    types::{Address, Chain},
};
use alloy::primitives::Bytes;
use async_trait::async_trait;
use eyre::Context as _;
use reqwest::Client;
use serde_json::{json, Value};
use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, PoisonError,
    },
    time::Duration,
};
use tracing::debug;

const DEFAULT_RPC_TIMEOUT: Duration = Duration::from_secs(20);
const DEFAULT_RPC_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// One JSON-RPC call against one endpoint.
#[async_trait]
pub trait ChainTransport: Send + Sync {
    async fn call(&self, url: &str, method: &str, params: Value) -> Result<Value, SignerError>;
}

#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: Client,
    next_id: Arc<AtomicU64>,
}

impl HttpTransport {
    pub fn new() -> eyre::Result<Self> {
        let client = Client::builder()
            .timeout(DEFAULT_RPC_TIMEOUT)
            .connect_timeout(DEFAULT_RPC_CONNECT_TIMEOUT)
            .build()
            .context("build rpc http client")?;
        Ok(Self {
            client,
            next_id: Arc::new(AtomicU64::new(1)),
        })
    }
}

/// Unwrap a JSON-RPC 2.0 response body.
pub fn parse_rpc_body(body: Value) -> Result<Value, SignerError> {
    if let Some(err) = body.get("error").filter(|e| !e.is_null()) {
        let err: RpcErrorObject = serde_json::from_value(err.clone())
            .map_err(|e| SignerError::internal(format!("malformed rpc error: {e}")))?;
        return Err(SignerError::Rpc(err));
    }
    body.get("result")
        .cloned()
        .ok_or_else(|| SignerError::internal("rpc response has neither result nor error"))
}

#[async_trait]
impl ChainTransport for HttpTransport {
    async fn call(&self, url: &str, method: &str, params: Value) -> Result<Value, SignerError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let body = json!({ "jsonrpc": "2.0", "id": id, "method": method, "params": params });
        let resp = self.client.post(url).json(&body).send().await?;
        let status = resp.status();
        if status.is_server_error() || status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Err(SignerError::Transport(format!("{url} returned {status}")));
        }
        let v: Value = resp.json().await?;
        parse_rpc_body(v)
    }
}

/// JSON-RPC client bound to one chain. Tries the chain's endpoints in order.
pub struct ChainClient {
    chain_id: u64,
    endpoints: Vec<String>,
    transport: Arc<dyn ChainTransport>,
    backoff: BackoffConfig,
}

impl std::fmt::Debug for ChainClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChainClient")
            .field("chain_id", &self.chain_id)
            .field("endpoints", &self.endpoints)
            .finish_non_exhaustive()
    }
}

impl ChainClient {
    pub const fn chain_id(&self) -> u64 {
        self.chain_id
    }

    pub fn endpoints(&self) -> &[String] {
        &self.endpoints
    }

    pub async fn request(&self, method: &str, params: Value) -> Result<Value, SignerError> {
        debug!(chain_id = self.chain_id, method, "chain rpc");
        let transport = Arc::clone(&self.transport);
        try_all_with_backoff(&self.endpoints, &self.backoff, |url| {
            let transport = Arc::clone(&transport);
            let params = params.clone();
            let url = url.clone();
            let method = method.to_owned();
            async move { transport.call(&url, &method, params).await }
        })
        .await
    }

    pub async fn eth_call(&self, to: Address, data: &Bytes) -> Result<Bytes, SignerError> {
        let v = self
            .request("eth_call", json!([{ "to": to, "data": data }, "latest"]))
            .await?;
        serde_json::from_value(v).map_err(|e| SignerError::internal(format!("eth_call result: {e}")))
    }

    pub async fn get_code(&self, address: Address) -> Result<Bytes, SignerError> {
        let v = self
            .request("eth_getCode", json!([address, "latest"]))
            .await?;
        serde_json::from_value(v).map_err(|e| SignerError::internal(format!("eth_getCode result: {e}")))
    }

    pub async fn is_deployed(&self, address: Address) -> Result<bool, SignerError> {
        Ok(!self.get_code(address).await?.is_empty())
    }
}

/// Clients per chain. Shared by every signer in the process, persistent or ephemeral.
pub struct ChainClientPool {
    transport: Arc<dyn ChainTransport>,
    fallbacks: ChainsConfig,
    backoff: BackoffConfig,
    clients: Mutex<HashMap<u64, Arc<ChainClient>>>,
}

impl std::fmt::Debug for ChainClientPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChainClientPool")
            .field("fallbacks", &self.fallbacks)
            .finish_non_exhaustive()
    }
}

impl ChainClientPool {
    pub fn new(transport: Arc<dyn ChainTransport>, fallbacks: ChainsConfig) -> Self {
        Self {
            transport,
            fallbacks,
            backoff: BackoffConfig::default(),
            clients: Mutex::new(HashMap::new()),
        }
    }

    pub fn http(fallbacks: ChainsConfig) -> eyre::Result<Self> {
        Ok(Self::new(Arc::new(HttpTransport::new()?), fallbacks))
    }

    #[must_use]
    pub fn with_backoff(mut self, backoff: BackoffConfig) -> Self {
        self.backoff = backoff;
        self
    }

    /// Client for `chain`. Rebuilt when the chain's RPC URL changed since the last call.
    pub fn client(&self, chain: &Chain) -> Result<Arc<ChainClient>, SignerError> {
        let mut endpoints: Vec<String> = chain.rpc_url.iter().cloned().collect();
        for url in self.fallbacks.fallbacks_for(chain.id) {
            if !endpoints.contains(url) {
                endpoints.push(url.clone());
            }
        }
        if endpoints.is_empty() {
            return Err(SignerError::internal(format!(
                "no rpc url configured for chain {}",
                chain.id
            )));
        }

        let mut clients = self.clients.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(c) = clients.get(&chain.id).filter(|c| c.endpoints == endpoints) {
            return Ok(Arc::clone(c));
        }
        let client = Arc::new(ChainClient {
            chain_id: chain.id,
            endpoints,
            transport: Arc::clone(&self.transport),
            backoff: self.backoff.clone(),
        });
        clients.insert(chain.id, Arc::clone(&client));
        Ok(client)
    }

    /// One call against a fixed URL, such as the wallet RPC or a paymaster.
    pub async fn call_url(
        &self,
        url: &str,
        method: &str,
        params: Value,
    ) -> Result<Value, SignerError> {
        debug!(url, method, "direct rpc");
        self.transport.call(url, method, params).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Recorder {
        seen: Mutex<Vec<(String, String)>>,
    }

    #[async_trait]
    impl ChainTransport for Recorder {
        async fn call(&self, url: &str, method: &str, _params: Value) -> Result<Value, SignerError> {
            self.seen
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push((url.to_owned(), method.to_owned()));
            if url.contains("down") {
                return Err(SignerError::Transport("connection refused".into()));
            }
            Ok(json!("0x2105"))
        }
    }

    fn chains_with_fallback() -> ChainsConfig {
        let mut fallbacks = ChainsConfig::default();
        fallbacks
            .fallback_rpc_urls
            .insert("8453".into(), vec!["https://backup.example".into()]);
        fallbacks
    }

    #[tokio::test]
    async fn falls_back_to_configured_endpoint() -> eyre::Result<()> {
        let rec = Arc::new(Recorder {
            seen: Mutex::new(vec![]),
        });
        let transport: Arc<dyn ChainTransport> = Arc::<Recorder>::clone(&rec);
        let pool = ChainClientPool::new(transport, chains_with_fallback())
            .with_backoff(BackoffConfig::single_pass());
        let chain = Chain {
            id: 8453,
            rpc_url: Some("https://down.example".into()),
            native_currency: None,
        };
        let out = pool.client(&chain)?.request("eth_chainId", json!([])).await?;
        assert_eq!(out, json!("0x2105"));
        let seen = rec.seen.lock().unwrap_or_else(PoisonError::into_inner).clone();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen.get(1).map(|s| s.0.as_str()), Some("https://backup.example"));
        Ok(())
    }

    #[test]
    fn pool_reuses_clients_until_url_changes() -> eyre::Result<()> {
        let rec = Arc::new(Recorder {
            seen: Mutex::new(vec![]),
        });
        let pool = ChainClientPool::new(rec, ChainsConfig::default());
        let mut chain = Chain {
            id: 1,
            rpc_url: Some("https://a.example".into()),
            native_currency: None,
        };
        let a = pool.client(&chain)?;
        assert!(Arc::ptr_eq(&a, &pool.client(&chain)?));
        chain.rpc_url = Some("https://b.example".into());
        assert!(!Arc::ptr_eq(&a, &pool.client(&chain)?));
        assert!(pool.client(&Chain::bare(10)).is_err());
        Ok(())
    }

    #[test]
    fn rpc_error_body_maps_to_rpc_error() {
        let err = parse_rpc_body(json!({
            "jsonrpc": "2.0", "id": 1,
            "error": { "code": -32000, "message": "nonce too low" }
        }));
        assert!(matches!(err, Err(SignerError::Rpc(ref e)) if e.message == "nonce too low"));
        assert_eq!(
            parse_rpc_body(json!({ "result": "0x1" })).ok(),
            Some(json!("0x1"))
        );
    }
}
