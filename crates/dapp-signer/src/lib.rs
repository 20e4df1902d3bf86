//! Dapp-side wallet connection SDK.
//!
//! A [`provider::Provider`] talks to a wallet popup over an end-to-end encrypted session
//! (P-256 ECDH + AES-256-GCM), routes each EIP-1193 request to the popup, to a locally
//! signing sub-account, or straight to a chain RPC, and delivers sub-account user
//! operations through a bounded retry engine. [`signer::EphemeralProvider`] runs isolated
//! one-shot flows that leave no session behind.
#![recursion_limit = "256"]
#![expect(
    clippy::multiple_crate_versions,
    reason = "transitive dependency duplication"
)]

pub mod capabilities;
pub mod chain_client;
pub mod communicator;
pub mod config;
pub mod contracts;
pub mod correlation;
pub mod crypto;
pub mod errors;
pub mod events;
pub mod fsutil;
pub mod message;
pub mod method;
pub mod paths;
pub mod provider;
pub mod resilience;
pub mod retry;
pub mod session;
pub mod signer;
pub mod spend_permissions;
pub mod store;
pub mod types;
pub mod user_operation;

pub use errors::SignerError;
pub use provider::Provider;
