use crate::errors::SignerError;
use std::{future::Future, time::Duration};

/// Endpoint fallback policy for chain and bundler calls. Unrelated to the transaction
/// resilience engine, which retries whole user operations.
#[derive(Debug, Clone)]
pub struct BackoffConfig {
    /// Number of full rounds. Each round tries every endpoint once.
    pub rounds: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Random jitter (`0..=jitter_max_ms`) added to each backoff sleep.
    pub jitter_max_ms: u64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            rounds: 2,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(2),
            jitter_max_ms: 100,
        }
    }
}

impl BackoffConfig {
    /// One pass over the endpoints, no sleeping.
    pub const fn single_pass() -> Self {
        Self {
            rounds: 1,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            jitter_max_ms: 0,
        }
    }
}

fn round_delay(cfg: &BackoffConfig, round: usize) -> Duration {
    let shift = u32::try_from(round.min(16)).unwrap_or(16_u32);
    let pow2 = 1_u64.checked_shl(shift).unwrap_or(u64::MAX);
    let base_ms = u64::try_from(cfg.base_delay.as_millis()).unwrap_or(u64::MAX);
    let max_ms = u64::try_from(cfg.max_delay.as_millis()).unwrap_or(u64::MAX);
    let ms = base_ms.saturating_mul(pow2).min(max_ms);
    let jitter = if cfg!(test) || cfg.jitter_max_ms == 0 {
        0
    } else {
        rand::random::<u64>() % cfg.jitter_max_ms.saturating_add(1).max(1)
    };
    Duration::from_millis(ms.saturating_add(jitter))
}

/// Try `op(endpoint)` across all endpoints, in order, for `cfg.rounds` rounds.
///
/// Only transport failures move on to the next endpoint. A JSON-RPC error is an answer
/// from the chain and is returned immediately.
pub async fn try_all_with_backoff<I, T, Fut>(
    endpoints: &[I],
    cfg: &BackoffConfig,
    mut op: impl FnMut(&I) -> Fut + Send,
) -> Result<T, SignerError>
where
    I: Sync,
    Fut: Future<Output = Result<T, SignerError>> + Send,
{
    if endpoints.is_empty() {
        return Err(SignerError::internal("no rpc endpoints configured"));
    }
    let rounds = cfg.rounds.max(1);
    let mut last_err = None;

    for round in 0..rounds {
        for endpoint in endpoints {
            match op(endpoint).await {
                Ok(v) => return Ok(v),
                Err(e) if e.is_transport() => {
                    tracing::debug!(round, error = %e, "endpoint failed; trying next");
                    last_err = Some(e);
                }
                Err(e) => return Err(e),
            }
        }
        if round + 1 < rounds {
            tokio::time::sleep(round_delay(cfg, round)).await;
        }
    }

    Err(last_err.unwrap_or_else(|| SignerError::Transport("all endpoints failed".into())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::RpcErrorObject;
    use std::sync::{Arc, Mutex};

    fn quick(rounds: usize) -> BackoffConfig {
        BackoffConfig {
            rounds,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            jitter_max_ms: 0,
        }
    }

    #[tokio::test]
    async fn tries_all_endpoints_in_order_each_round() -> eyre::Result<()> {
        let endpoints = vec![1_i32, 2_i32, 3_i32];
        let calls: Arc<Mutex<Vec<i32>>> = Arc::new(Mutex::new(vec![]));
        let calls2 = Arc::clone(&calls);

        let res: Result<(), SignerError> = try_all_with_backoff(&endpoints, &quick(2), move |i| {
            let i = *i;
            let calls3 = Arc::clone(&calls2);
            async move {
                calls3
                    .lock()
                    .map_err(|e| SignerError::internal(e.to_string()))?
                    .push(i);
                Err(SignerError::Transport("connection refused".into()))
            }
        })
        .await;
        assert!(res.is_err_and(|e| e.is_transport()));
        let got = calls
            .lock()
            .map_err(|e| eyre::eyre!("mutex poisoned: {e}"))?
            .clone();
        assert_eq!(got, vec![1, 2, 3, 1, 2, 3]);
        Ok(())
    }

    #[tokio::test]
    async fn rpc_errors_are_not_retried() -> eyre::Result<()> {
        let endpoints = vec!["a", "b"];
        let calls = Arc::new(Mutex::new(0_u32));
        let calls2 = Arc::clone(&calls);
        let res: Result<(), SignerError> = try_all_with_backoff(&endpoints, &quick(3), move |_| {
            let calls3 = Arc::clone(&calls2);
            async move {
                *calls3
                    .lock()
                    .map_err(|e| SignerError::internal(e.to_string()))? += 1;
                Err(SignerError::Rpc(RpcErrorObject::new(-32000, "execution reverted")))
            }
        })
        .await;
        assert!(res.is_err_and(|e| e.code() == -32000));
        assert_eq!(*calls.lock().map_err(|e| eyre::eyre!("{e}"))?, 1);
        Ok(())
    }

    #[tokio::test]
    async fn returns_first_success() -> eyre::Result<()> {
        let endpoints = vec!["a".to_owned(), "b".to_owned()];
        let out = try_all_with_backoff(&endpoints, &quick(1), |e| {
            let ok = e == "b";
            async move {
                if ok {
                    Ok(42_i32)
                } else {
                    Err(SignerError::Transport("timeout".into()))
                }
            }
        })
        .await?;
        assert_eq!(out, 42);
        Ok(())
    }
}
