use super::{analysis::FailureAnalysis, RecoveryAction};
use crate::errors::SignerError;
use serde::Serialize;
use serde_json::{json, Value};
use std::fmt;
use thiserror::Error;

#[derive(Debug, Clone, Error, Serialize)]
#[serde(rename_all = "camelCase")]
#[error(
    "transaction failed after {attempts} attempts ({elapsed_ms}ms): {}",
    .last_failure.description
)]
pub struct MaxRetriesExceededError {
    pub attempts: u32,
    pub elapsed_ms: u64,
    pub recovery_actions: Vec<RecoveryAction>,
    pub last_failure: FailureAnalysis,
}

#[derive(Debug, Clone, Error, Serialize)]
#[serde(rename_all = "camelCase")]
#[error("unrecoverable transaction failure ({}): {}", .analysis.failure_type, .analysis.description)]
pub struct UnrecoverableTransactionError {
    pub analysis: FailureAnalysis,
    pub attempts: u32,
}

impl UnrecoverableTransactionError {
    pub const fn suggested_actions(&self) -> &'static [&'static str] {
        self.analysis.failure_type.suggested_user_actions()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize)]
#[error("invalid resilience config: {field} = {value} ({constraint})")]
pub struct InvalidResilienceConfigError {
    pub field: &'static str,
    pub value: String,
    pub constraint: &'static str,
}

impl InvalidResilienceConfigError {
    pub fn new(field: &'static str, value: impl fmt::Display, constraint: &'static str) -> Self {
        Self {
            field,
            value: value.to_string(),
            constraint,
        }
    }
}

#[derive(Debug, Clone, Error)]
pub enum ResilienceError {
    #[error(transparent)]
    MaxRetriesExceeded(#[from] MaxRetriesExceededError),
    #[error(transparent)]
    Unrecoverable(#[from] UnrecoverableTransactionError),
    #[error(transparent)]
    InvalidConfig(#[from] InvalidResilienceConfigError),
    /// A failure the caller can repair itself (an insufficient-balance error carrying its
    /// funding requirements). Handed back untouched instead of being retried.
    #[error(transparent)]
    Actionable(Box<SignerError>),
}

impl ResilienceError {
    /// The original error of an [`ResilienceError::Actionable`] failure.
    pub fn actionable(&self) -> Option<&SignerError> {
        match self {
            Self::Actionable(e) => Some(e),
            _ => None,
        }
    }

    pub const fn code(&self) -> &'static str {
        match self {
            Self::MaxRetriesExceeded(_) => "MAX_RETRIES_EXCEEDED",
            Self::Unrecoverable(_) => "UNRECOVERABLE_TRANSACTION",
            Self::InvalidConfig(_) => "INVALID_RESILIENCE_CONFIG",
            Self::Actionable(_) => "ACTIONABLE_FAILURE",
        }
    }

    /// Structured payload attached to the error object returned to dapps.
    pub fn details(&self) -> Value {
        match self {
            Self::MaxRetriesExceeded(e) => json!(e),
            Self::Unrecoverable(e) => json!({
                "analysis": e.analysis,
                "attempts": e.attempts,
                "suggestedActions": e.suggested_actions(),
            }),
            Self::InvalidConfig(e) => json!(e),
            Self::Actionable(e) => json!(e.to_rpc_error()),
        }
    }
}
