use crate::errors::{codes, SignerError};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FailureType {
    OutOfGas,
    NonceTooLow,
    NonceTooHigh,
    ReplacementUnderpriced,
    InsufficientFundsForGas,
    Timeout,
    NetworkError,
    RpcError,
    UserRejected,
    InvalidParams,
    ContractRevert,
    InsufficientTokenBalance,
    PermissionDenied,
    Unknown,
}

impl FailureType {
    pub const fn is_recoverable(self) -> bool {
        matches!(
            self,
            Self::OutOfGas
                | Self::NonceTooLow
                | Self::NonceTooHigh
                | Self::ReplacementUnderpriced
                | Self::InsufficientFundsForGas
                | Self::Timeout
                | Self::NetworkError
                | Self::RpcError
        )
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::OutOfGas => "OUT_OF_GAS",
            Self::NonceTooLow => "NONCE_TOO_LOW",
            Self::NonceTooHigh => "NONCE_TOO_HIGH",
            Self::ReplacementUnderpriced => "REPLACEMENT_UNDERPRICED",
            Self::InsufficientFundsForGas => "INSUFFICIENT_FUNDS_FOR_GAS",
            Self::Timeout => "TIMEOUT",
            Self::NetworkError => "NETWORK_ERROR",
            Self::RpcError => "RPC_ERROR",
            Self::UserRejected => "USER_REJECTED",
            Self::InvalidParams => "INVALID_PARAMS",
            Self::ContractRevert => "CONTRACT_REVERT",
            Self::InsufficientTokenBalance => "INSUFFICIENT_TOKEN_BALANCE",
            Self::PermissionDenied => "PERMISSION_DENIED",
            Self::Unknown => "UNKNOWN",
        }
    }

    const fn description(self) -> &'static str {
        match self {
            Self::OutOfGas => "The transaction ran out of gas",
            Self::NonceTooLow => "The nonce was already used by another transaction",
            Self::NonceTooHigh => "The nonce is ahead of the account's next nonce",
            Self::ReplacementUnderpriced => {
                "A pending transaction with the same nonce pays a higher fee"
            }
            Self::InsufficientFundsForGas => "The account cannot pay for gas",
            Self::Timeout => "The operation did not complete in time",
            Self::NetworkError => "The network request failed",
            Self::RpcError => "The RPC endpoint returned an error",
            Self::UserRejected => "The user rejected the request",
            Self::InvalidParams => "The request parameters are invalid",
            Self::ContractRevert => "The contract call reverted",
            Self::InsufficientTokenBalance => "The token balance is too low for this transfer",
            Self::PermissionDenied => "The account is not permitted to perform this action",
            Self::Unknown => "The failure could not be classified",
        }
    }

    const fn suggested_action(self) -> Option<&'static str> {
        match self {
            Self::OutOfGas => Some("increase the gas limit"),
            Self::NonceTooLow | Self::NonceTooHigh => Some("refresh the account nonce"),
            Self::ReplacementUnderpriced => Some("raise the fee and resubmit"),
            Self::InsufficientFundsForGas => Some("fund the account or use a paymaster"),
            Self::Timeout | Self::NetworkError | Self::RpcError => Some("retry the request"),
            Self::UserRejected
            | Self::InvalidParams
            | Self::ContractRevert
            | Self::InsufficientTokenBalance
            | Self::PermissionDenied
            | Self::Unknown => None,
        }
    }

    /// Next steps shown to the user when this failure ends an operation.
    pub const fn suggested_user_actions(self) -> &'static [&'static str] {
        match self {
            Self::UserRejected => &["Approve the request in your wallet to continue"],
            Self::InvalidParams => &[
                "Check the transaction parameters",
                "Verify recipient addresses and amounts",
            ],
            Self::ContractRevert => &[
                "Review the contract call; it would fail on-chain",
                "Simulate the transaction before sending",
            ],
            Self::InsufficientTokenBalance => &[
                "Add tokens to the sending account",
                "Reduce the transfer amount",
            ],
            Self::PermissionDenied => &[
                "Reconnect the wallet",
                "Grant the required permission and try again",
            ],
            Self::Unknown => &["Try again later", "Contact support if the problem persists"],
            Self::OutOfGas
            | Self::NonceTooLow
            | Self::NonceTooHigh
            | Self::ReplacementUnderpriced
            | Self::InsufficientFundsForGas
            | Self::Timeout
            | Self::NetworkError
            | Self::RpcError => &["Try again"],
        }
    }
}

impl fmt::Display for FailureType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Classification of one failed attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FailureAnalysis {
    #[serde(rename = "type")]
    pub failure_type: FailureType,
    pub is_recoverable: bool,
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suggested_action: Option<String>,
    pub original_message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<i64>,
}

impl FailureAnalysis {
    pub fn new(failure_type: FailureType, original_message: &str, code: Option<i64>) -> Self {
        Self {
            failure_type,
            is_recoverable: failure_type.is_recoverable(),
            description: failure_type.description().to_owned(),
            suggested_action: failure_type.suggested_action().map(str::to_owned),
            original_message: original_message.to_owned(),
            code,
        }
    }
}

struct Pattern {
    failure_type: FailureType,
    needles: &'static [&'static str],
    codes: &'static [i64],
}

// Order is significant: terminal categories come first so that a message matching both a
// terminal and a retryable pattern is never retried.
const PATTERNS: &[Pattern] = &[
    Pattern {
        failure_type: FailureType::UserRejected,
        needles: &[
            "user rejected",
            "user denied",
            "rejected by user",
            "user cancelled",
            "user canceled",
            "request rejected",
        ],
        codes: &[codes::USER_REJECTED],
    },
    Pattern {
        failure_type: FailureType::PermissionDenied,
        needles: &[
            "permission denied",
            "unauthorized",
            "not authorized",
            "not permitted",
        ],
        codes: &[codes::UNAUTHORIZED],
    },
    Pattern {
        failure_type: FailureType::InsufficientTokenBalance,
        needles: &[
            "transfer amount exceeds balance",
            "insufficient token balance",
            "insufficient balance for transfer",
            "erc20: insufficient",
        ],
        codes: &[],
    },
    Pattern {
        failure_type: FailureType::InvalidParams,
        needles: &[
            "invalid params",
            "invalid parameter",
            "invalid argument",
            "invalid address",
            "missing required",
        ],
        codes: &[codes::INVALID_PARAMS],
    },
    Pattern {
        failure_type: FailureType::ContractRevert,
        needles: &[
            "execution reverted",
            "transaction reverted",
            "call reverted",
            "reverted with reason",
        ],
        codes: &[3],
    },
    Pattern {
        failure_type: FailureType::OutOfGas,
        needles: &[
            "out of gas",
            "intrinsic gas too low",
            "gas too low",
            "gas limit too low",
            "gas required exceeds",
        ],
        codes: &[],
    },
    Pattern {
        failure_type: FailureType::NonceTooLow,
        needles: &[
            "nonce too low",
            "nonce has already been used",
            "invalid account nonce",
        ],
        codes: &[],
    },
    Pattern {
        failure_type: FailureType::NonceTooHigh,
        needles: &["nonce too high"],
        codes: &[],
    },
    Pattern {
        failure_type: FailureType::ReplacementUnderpriced,
        needles: &[
            "replacement transaction underpriced",
            "replacement underpriced",
            "transaction underpriced",
            "fee too low",
        ],
        codes: &[],
    },
    Pattern {
        failure_type: FailureType::InsufficientFundsForGas,
        needles: &[
            "insufficient funds for gas",
            "insufficient funds",
            "didn't pay prefund",
            "insufficient native",
        ],
        codes: &[],
    },
    Pattern {
        failure_type: FailureType::Timeout,
        needles: &["timeout", "timed out", "deadline exceeded"],
        codes: &[],
    },
    Pattern {
        failure_type: FailureType::NetworkError,
        needles: &[
            "network error",
            "network request failed",
            "fetch failed",
            "failed to fetch",
            "connection refused",
            "connection reset",
            "econnreset",
            "econnrefused",
            "socket hang up",
            "dns error",
            "error sending request",
        ],
        codes: &[],
    },
    Pattern {
        failure_type: FailureType::RpcError,
        needles: &[
            "internal error",
            "rpc error",
            "server error",
            "rate limit",
            "too many requests",
            "service unavailable",
            "bad gateway",
            "header not found",
        ],
        codes: &[codes::INTERNAL, -32000, -32005],
    },
];

/// Classify a failure from its message and optional error code. Pure: the same input always
/// yields the same analysis.
pub fn analyze_failure(message: &str, code: Option<i64>) -> FailureAnalysis {
    if code == Some(codes::USER_REJECTED) {
        return FailureAnalysis::new(FailureType::UserRejected, message, code);
    }

    let lower = message.to_lowercase();
    let by_message = PATTERNS
        .iter()
        .find(|p| p.needles.iter().any(|n| lower.contains(n)));
    let by_code = || {
        code.and_then(|c| PATTERNS.iter().find(|p| p.codes.contains(&c)))
    };

    let failure_type = by_message
        .or_else(by_code)
        .map_or(FailureType::Unknown, |p| p.failure_type);
    FailureAnalysis::new(failure_type, message, code)
}

pub fn analyze_error(err: &SignerError) -> FailureAnalysis {
    let code = err.rpc_error().map(|e| e.code);
    analyze_failure(&err.to_string(), code)
}
