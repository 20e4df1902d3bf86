//! Bounded retries around transaction submission.
//!
//! Each failed attempt is classified by [`analyze_failure`]. Terminal classes end the
//! operation immediately; retryable classes trigger the matching recovery action (gas bump,
//! nonce refresh, sponsored fallback) followed by a backoff sleep.

mod analysis;
mod config;
mod error;

pub use analysis::{analyze_error, analyze_failure, FailureAnalysis, FailureType};
pub use config::{
    calculate_backoff_delay, BackoffStrategy, ResilienceConfig, MAX_GAS_MULTIPLIER,
    MAX_RETRIES_LIMIT, MIN_GAS_MULTIPLIER,
};
pub use error::{
    InvalidResilienceConfigError, MaxRetriesExceededError, ResilienceError,
    UnrecoverableTransactionError,
};

use crate::errors::SignerError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryActionType {
    GasIncrease,
    NonceCorrection,
    SponsoredFallback,
    Retry,
}

/// Audit record of one recovery step.
#[derive(Debug, Clone, Serialize)]
pub struct RecoveryAction {
    #[serde(rename = "type")]
    pub action_type: RecoveryActionType,
    pub description: String,
    pub timestamp: DateTime<Utc>,
}

impl RecoveryAction {
    fn now(action_type: RecoveryActionType, description: impl Into<String>) -> Self {
        Self {
            action_type,
            description: description.into(),
            timestamp: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WaitStatus {
    Complete,
    Failed { reason: String },
}

/// What one submit-and-wait attempt observed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendReceipt {
    pub status: WaitStatus,
    pub transaction_hash: Option<String>,
    pub user_operation_hash: Option<String>,
}

/// A send operation the engine can retry and repair between attempts.
#[async_trait]
pub trait ResilientSend: Send {
    async fn attempt(&mut self) -> Result<SendReceipt, SignerError>;

    /// Scale the gas limits used by subsequent attempts.
    fn increase_gas(&mut self, multiplier: f64);

    async fn refresh_nonce(&mut self) -> Result<(), SignerError>;

    /// Route subsequent attempts through the given paymaster.
    fn use_paymaster(&mut self, url: &str);
}

/// Passed to the retry callback before each backoff sleep.
#[derive(Debug)]
pub struct RetryEvent<'a> {
    pub attempt: u32,
    pub analysis: &'a FailureAnalysis,
    pub delay: Duration,
}

pub type OnRetry<'a> = &'a (dyn Fn(&RetryEvent<'_>) + Send + Sync);

#[derive(Debug, Clone)]
pub struct ResilientOutcome {
    pub receipt: SendReceipt,
    pub attempts: u32,
    pub recovery_actions: Vec<RecoveryAction>,
    pub recovery_actions_used: bool,
    pub elapsed: Duration,
}

/// Per-operation bookkeeping; dropped when the operation ends.
struct ResilienceState {
    attempts: u32,
    started: Instant,
    actions: Vec<RecoveryAction>,
    last_error: Option<SignerError>,
    last_analysis: Option<FailureAnalysis>,
    sponsored_fallback_used: bool,
}

impl ResilienceState {
    fn new() -> Self {
        Self {
            attempts: 0,
            started: Instant::now(),
            actions: Vec::new(),
            last_error: None,
            last_analysis: None,
            sponsored_fallback_used: false,
        }
    }

    fn elapsed_ms(&self) -> u64 {
        u64::try_from(self.started.elapsed().as_millis()).unwrap_or(u64::MAX)
    }
}

fn classify_receipt(receipt: &SendReceipt) -> Option<FailureAnalysis> {
    match &receipt.status {
        WaitStatus::Complete if receipt.transaction_hash.is_some() => None,
        WaitStatus::Complete => Some(FailureAnalysis::new(
            FailureType::RpcError,
            "operation completed without a transaction hash",
            None,
        )),
        WaitStatus::Failed { reason } => Some(FailureAnalysis::new(
            FailureType::RpcError,
            &format!("operation failed: {reason}"),
            None,
        )),
    }
}

/// Run `op` until it lands, fails terminally, or exhausts `config.max_retries`.
///
/// The configuration is validated before the first attempt.
pub async fn send_with_resilience<S>(
    op: &mut S,
    config: &ResilienceConfig,
    on_retry: Option<OnRetry<'_>>,
) -> Result<ResilientOutcome, ResilienceError>
where
    S: ResilientSend + ?Sized,
{
    config.validate()?;

    let max_attempts = u32::try_from(config.max_retries)
        .unwrap_or(0)
        .saturating_add(1);
    let initial_delay_ms = u64::try_from(config.initial_delay_ms).unwrap_or(0);
    let max_delay_ms = u64::try_from(config.max_delay_ms).unwrap_or(0);
    let mut state = ResilienceState::new();

    loop {
        state.attempts += 1;
        let attempt = state.attempts;
        debug!(attempt, max_attempts, "resilient send attempt");

        let analysis = match tokio::time::timeout(config.timeout(), op.attempt()).await {
            Ok(Ok(receipt)) => match classify_receipt(&receipt) {
                None => {
                    info!(
                        attempt,
                        recovery_actions = state.actions.len(),
                        "resilient send succeeded"
                    );
                    return Ok(ResilientOutcome {
                        receipt,
                        attempts: attempt,
                        recovery_actions_used: !state.actions.is_empty(),
                        recovery_actions: state.actions,
                        elapsed: state.started.elapsed(),
                    });
                }
                Some(a) => a,
            },
            Ok(Err(e)) if e.insufficient_balance_data().is_some() => {
                info!(attempt, "insufficient balance reported; handing back to caller");
                return Err(ResilienceError::Actionable(Box::new(e)));
            }
            Ok(Err(e)) => {
                let a = analyze_error(&e);
                state.last_error = Some(e);
                a
            }
            Err(_elapsed) => {
                let msg = format!("attempt timed out after {}s", config.timeout_seconds);
                FailureAnalysis::new(FailureType::Timeout, &msg, None)
            }
        };

        warn!(
            attempt,
            failure_type = %analysis.failure_type,
            recoverable = analysis.is_recoverable,
            error = %analysis.original_message,
            "resilient send attempt failed"
        );

        if !analysis.is_recoverable {
            return Err(UnrecoverableTransactionError {
                analysis,
                attempts: attempt,
            }
            .into());
        }

        if attempt >= max_attempts {
            debug!(
                last_error = ?state.last_error,
                previous_failure = ?state.last_analysis.as_ref().map(|a| a.failure_type),
                "retry budget exhausted"
            );
            return Err(MaxRetriesExceededError {
                attempts: attempt,
                elapsed_ms: state.elapsed_ms(),
                recovery_actions: state.actions,
                last_failure: analysis,
            }
            .into());
        }

        apply_recovery(op, config, &analysis, &mut state).await;

        let delay = calculate_backoff_delay(attempt, config.backoff, initial_delay_ms, max_delay_ms);
        state.actions.push(RecoveryAction::now(
            RecoveryActionType::Retry,
            format!("retry {} after {}ms", attempt + 1, delay.as_millis()),
        ));
        if let Some(cb) = on_retry {
            cb(&RetryEvent {
                attempt,
                analysis: &analysis,
                delay,
            });
        }
        state.last_analysis = Some(analysis);
        tokio::time::sleep(delay).await;
    }
}

async fn apply_recovery<S>(
    op: &mut S,
    config: &ResilienceConfig,
    analysis: &FailureAnalysis,
    state: &mut ResilienceState,
) where
    S: ResilientSend + ?Sized,
{
    match analysis.failure_type {
        FailureType::OutOfGas => {
            op.increase_gas(config.gas_multiplier);
            state.actions.push(RecoveryAction::now(
                RecoveryActionType::GasIncrease,
                format!("gas limit x{}", config.gas_multiplier),
            ));
        }
        FailureType::NonceTooLow | FailureType::NonceTooHigh => match op.refresh_nonce().await {
            Ok(()) => state.actions.push(RecoveryAction::now(
                RecoveryActionType::NonceCorrection,
                "refreshed nonce",
            )),
            Err(e) => {
                warn!(error = %e, "nonce refresh failed; retrying with previous nonce");
                state.last_error = Some(e);
            }
        },
        FailureType::InsufficientFundsForGas
            if config.fallback_to_sponsored && !state.sponsored_fallback_used =>
        {
            if let Some(url) = config.fallback_paymaster_url.as_deref() {
                op.use_paymaster(url);
                state.sponsored_fallback_used = true;
                state.actions.push(RecoveryAction::now(
                    RecoveryActionType::SponsoredFallback,
                    "switched to fallback paymaster",
                ));
            }
        }
        FailureType::InsufficientFundsForGas
        | FailureType::ReplacementUnderpriced
        | FailureType::Timeout
        | FailureType::NetworkError
        | FailureType::RpcError
        | FailureType::UserRejected
        | FailureType::InvalidParams
        | FailureType::ContractRevert
        | FailureType::InsufficientTokenBalance
        | FailureType::PermissionDenied
        | FailureType::Unknown => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};

    struct Scripted {
        results: VecDeque<Result<SendReceipt, SignerError>>,
        calls: u32,
        gas: f64,
        nonce_refreshes: u32,
        paymaster: Option<String>,
    }

    impl Scripted {
        fn new(results: Vec<Result<SendReceipt, SignerError>>) -> Self {
            Self {
                results: results.into(),
                calls: 0,
                gas: 1.0,
                nonce_refreshes: 0,
                paymaster: None,
            }
        }
    }

    fn landed() -> Result<SendReceipt, SignerError> {
        Ok(SendReceipt {
            status: WaitStatus::Complete,
            transaction_hash: Some("0xabc".into()),
            user_operation_hash: Some("0xdef".into()),
        })
    }

    fn fail(msg: &str) -> Result<SendReceipt, SignerError> {
        Err(SignerError::Transport(msg.into()))
    }

    #[async_trait]
    impl ResilientSend for Scripted {
        async fn attempt(&mut self) -> Result<SendReceipt, SignerError> {
            self.calls += 1;
            self.results
                .pop_front()
                .unwrap_or_else(|| Err(SignerError::internal("script exhausted")))
        }

        fn increase_gas(&mut self, multiplier: f64) {
            self.gas *= multiplier;
        }

        async fn refresh_nonce(&mut self) -> Result<(), SignerError> {
            self.nonce_refreshes += 1;
            Ok(())
        }

        fn use_paymaster(&mut self, url: &str) {
            self.paymaster = Some(url.to_owned());
        }
    }

    fn quick() -> ResilienceConfig {
        ResilienceConfig {
            initial_delay_ms: 0,
            max_delay_ms: 0,
            ..ResilienceConfig::default()
        }
    }

    #[tokio::test]
    async fn retries_network_errors_until_success() -> eyre::Result<()> {
        let mut op = Scripted::new(vec![
            fail("network error"),
            fail("fetch failed"),
            landed(),
        ]);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen2 = Arc::clone(&seen);
        let cb = move |ev: &RetryEvent<'_>| {
            if let Ok(mut g) = seen2.lock() {
                g.push((ev.attempt, ev.analysis.failure_type));
            }
        };
        let out = send_with_resilience(&mut op, &quick(), Some(&cb)).await?;
        assert_eq!(out.attempts, 3);
        assert!(out.recovery_actions_used);
        assert_eq!(
            out.recovery_actions
                .iter()
                .filter(|a| a.action_type == RecoveryActionType::Retry)
                .count(),
            2
        );
        let seen = seen
            .lock()
            .map_err(|e| eyre::eyre!("mutex poisoned: {e}"))?
            .clone();
        assert_eq!(
            seen,
            vec![(1, FailureType::NetworkError), (2, FailureType::NetworkError)]
        );
        Ok(())
    }

    #[tokio::test]
    async fn user_rejection_is_terminal_on_first_attempt() -> eyre::Result<()> {
        let mut op = Scripted::new(vec![fail("User rejected the request"), landed()]);
        let called = Arc::new(Mutex::new(0_u32));
        let called2 = Arc::clone(&called);
        let cb = move |_: &RetryEvent<'_>| {
            if let Ok(mut g) = called2.lock() {
                *g += 1;
            }
        };
        let res = send_with_resilience(&mut op, &ResilienceConfig::default(), Some(&cb)).await;
        let Err(ResilienceError::Unrecoverable(e)) = res else {
            eyre::bail!("expected unrecoverable, got {res:?}");
        };
        assert_eq!(e.attempts, 1);
        assert_eq!(e.analysis.failure_type, FailureType::UserRejected);
        assert!(!e.suggested_actions().is_empty());
        assert_eq!(op.calls, 1);
        let retries = *called
            .lock()
            .map_err(|e| eyre::eyre!("mutex poisoned: {e}"))?;
        assert_eq!(retries, 0);
        Ok(())
    }

    #[tokio::test]
    async fn exhausting_budget_reports_history() -> eyre::Result<()> {
        let mut op = Scripted::new(vec![
            fail("timeout"),
            fail("timeout"),
            fail("timeout"),
        ]);
        let cfg = ResilienceConfig {
            max_retries: 2,
            ..quick()
        };
        let res = send_with_resilience(&mut op, &cfg, None).await;
        let Err(ResilienceError::MaxRetriesExceeded(e)) = res else {
            eyre::bail!("expected max retries, got {res:?}");
        };
        assert_eq!(e.attempts, 3);
        assert_eq!(e.recovery_actions.len(), 2);
        assert_eq!(e.last_failure.failure_type, FailureType::Timeout);
        Ok(())
    }

    #[tokio::test]
    async fn invalid_config_fails_before_any_attempt() {
        let mut op = Scripted::new(vec![landed()]);
        let cfg = ResilienceConfig {
            gas_multiplier: 5.0,
            ..ResilienceConfig::default()
        };
        let res = send_with_resilience(&mut op, &cfg, None).await;
        assert!(matches!(res, Err(ResilienceError::InvalidConfig(_))));
        assert_eq!(op.calls, 0);
    }

    #[tokio::test]
    async fn applies_gas_nonce_and_sponsored_recovery() -> eyre::Result<()> {
        let mut op = Scripted::new(vec![
            fail("out of gas"),
            fail("nonce too low"),
            fail("insufficient funds for gas"),
            fail("insufficient funds for gas"),
            landed(),
        ]);
        let cfg = ResilienceConfig {
            max_retries: 5,
            fallback_to_sponsored: true,
            fallback_paymaster_url: Some("https://paymaster.example".into()),
            ..quick()
        };
        let out = send_with_resilience(&mut op, &cfg, None).await?;
        assert_eq!(out.attempts, 5);
        assert!((op.gas - 1.2).abs() < 1e-9);
        assert_eq!(op.nonce_refreshes, 1);
        assert_eq!(op.paymaster.as_deref(), Some("https://paymaster.example"));
        let sponsored = out
            .recovery_actions
            .iter()
            .filter(|a| a.action_type == RecoveryActionType::SponsoredFallback)
            .count();
        assert_eq!(sponsored, 1);
        Ok(())
    }

    #[tokio::test]
    async fn failed_wait_is_retried_as_rpc_error() -> eyre::Result<()> {
        let mut op = Scripted::new(vec![
            Ok(SendReceipt {
                status: WaitStatus::Failed {
                    reason: "user rejected".into(),
                },
                transaction_hash: None,
                user_operation_hash: None,
            }),
            Ok(SendReceipt {
                status: WaitStatus::Complete,
                transaction_hash: None,
                user_operation_hash: None,
            }),
            landed(),
        ]);
        let out = send_with_resilience(&mut op, &quick(), None).await?;
        assert_eq!(out.attempts, 3);
        Ok(())
    }

    #[tokio::test]
    async fn insufficient_balance_is_handed_back_untouched() -> eyre::Result<()> {
        let err = SignerError::Rpc(crate::errors::RpcErrorObject {
            code: -32090,
            message: "insufficient funds".into(),
            data: serde_json::json!({ "type": "INSUFFICIENT_FUNDS", "required": {} }),
        });
        let mut op = Scripted::new(vec![Err(err), landed()]);
        let res = send_with_resilience(&mut op, &quick(), None).await;
        let Err(e) = res else {
            eyre::bail!("expected an error, got {res:?}");
        };
        assert_eq!(op.calls, 1);
        assert!(e.actionable().is_some());
        assert!(SignerError::from(e).insufficient_balance_data().is_some());
        Ok(())
    }
}
