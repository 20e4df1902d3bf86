use alloy::{
    primitives::{address, keccak256, Address, Bytes, B256, U256},
    sol,
    sol_types::{Eip712Domain, SolStruct as _, SolValue as _},
};
use std::borrow::Cow;

/// ERC-4337 v0.6 entry point.
pub const ENTRY_POINT_V06: Address = address!("5FF137D4b0FDCD49DcA30c7CF57E578a026d2789");

sol! {
    #[derive(Debug, PartialEq, Eq)]
    struct Call {
        address target;
        uint256 value;
        bytes data;
    }

    #[derive(Debug)]
    contract CoinbaseSmartWallet {
        function executeBatch(Call[] calls) external payable;
        function execute(address target, uint256 value, bytes data) external payable;
        function addOwnerAddress(address owner) external;
        function nextOwnerIndex() external view returns (uint256);
        function ownerAtIndex(uint256 index) external view returns (bytes);
        function isOwnerAddress(address account) external view returns (bool);
    }

    #[derive(Debug)]
    contract CoinbaseSmartWalletFactory {
        function createAccount(bytes[] owners, uint256 nonce) external payable returns (address account);
    }

    #[derive(Debug)]
    contract Erc20 {
        function transfer(address to, uint256 amount) external returns (bool);
    }

    #[derive(Debug)]
    contract EntryPoint {
        function getNonce(address sender, uint192 key) external view returns (uint256 nonce);
    }

    #[derive(Debug)]
    struct SignatureWrapper {
        uint256 ownerIndex;
        bytes signatureData;
    }

    #[derive(Debug)]
    struct CoinbaseSmartWalletMessage {
        bytes32 hash;
    }
}

/// Hash a sub-account actually signs for an ERC-1271 check: the caller's hash bound to this
/// account and chain, so a signature cannot be replayed on another account sharing the owner.
pub fn replay_safe_hash(account: Address, chain_id: u64, hash: B256) -> B256 {
    let domain = Eip712Domain {
        name: Some(Cow::Borrowed("Coinbase Smart Wallet")),
        version: Some(Cow::Borrowed("1")),
        chain_id: Some(U256::from(chain_id)),
        verifying_contract: Some(account),
        salt: None,
    };
    CoinbaseSmartWalletMessage { hash }.eip712_signing_hash(&domain)
}

/// `abi.encode(SignatureWrapper(ownerIndex, signature))`.
pub fn wrap_signature(owner_index: u64, signature: Bytes) -> Bytes {
    SignatureWrapper {
        ownerIndex: U256::from(owner_index),
        signatureData: signature,
    }
    .abi_encode()
    .into()
}

/// Owner entries are `abi.encode(address)` for EOAs and 64-byte keys for passkeys.
pub fn owner_bytes_to_address(owner: &[u8]) -> Option<Address> {
    if owner.len() != 32 || owner.iter().take(12).any(|b| *b != 0) {
        return None;
    }
    Some(Address::from_slice(owner.get(12..)?))
}

pub fn address_owner_bytes(owner: Address) -> Bytes {
    owner.abi_encode().into()
}

/// ERC-4337 v0.6 user operation, as sent to a bundler.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct UserOperation {
    pub sender: Address,
    pub nonce: U256,
    pub init_code: Bytes,
    pub call_data: Bytes,
    pub call_gas_limit: U256,
    pub verification_gas_limit: U256,
    pub pre_verification_gas: U256,
    pub max_fee_per_gas: U256,
    pub max_priority_fee_per_gas: U256,
    pub paymaster_and_data: Bytes,
    pub signature: Bytes,
}

impl UserOperation {
    pub fn hash(&self, entry_point: Address, chain_id: u64) -> B256 {
        let packed = (
            self.sender,
            self.nonce,
            keccak256(&self.init_code),
            keccak256(&self.call_data),
            self.call_gas_limit,
            self.verification_gas_limit,
            self.pre_verification_gas,
            self.max_fee_per_gas,
            self.max_priority_fee_per_gas,
            keccak256(&self.paymaster_and_data),
        )
            .abi_encode_params();
        keccak256((keccak256(packed), entry_point, U256::from(chain_id)).abi_encode_params())
    }

    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "sender": self.sender,
            "nonce": self.nonce,
            "initCode": self.init_code,
            "callData": self.call_data,
            "callGasLimit": self.call_gas_limit,
            "verificationGasLimit": self.verification_gas_limit,
            "preVerificationGas": self.pre_verification_gas,
            "maxFeePerGas": self.max_fee_per_gas,
            "maxPriorityFeePerGas": self.max_priority_fee_per_gas,
            "paymasterAndData": self.paymaster_and_data,
            "signature": self.signature,
        })
    }
}

/// Fee policy for user operations:
/// - priority: max(1.5 gwei, gas_price / 10)
/// - max_fee: base_fee * 2 + priority
pub fn compute_eip1559_fees(base_fee: u128, gas_price: u128) -> (u128, u128) {
    let min_priority: u128 = 1_500_000_000;
    let priority = std::cmp::max(min_priority, gas_price / 10);
    let max_fee = base_fee
        .saturating_mul(2)
        .saturating_add(priority)
        .max(base_fee.saturating_add(priority));
    (max_fee, priority)
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy::sol_types::SolCall as _;

    #[test]
    fn owner_bytes_roundtrip() {
        let a = address!("1111111111111111111111111111111111111111");
        assert_eq!(owner_bytes_to_address(&address_owner_bytes(a)), Some(a));
        assert_eq!(owner_bytes_to_address(&[1_u8; 64]), None);
    }

    #[test]
    fn replay_safe_hash_binds_account_and_chain() {
        let h = keccak256(b"hello");
        let a = address!("1111111111111111111111111111111111111111");
        let b = address!("2222222222222222222222222222222222222222");
        assert_ne!(replay_safe_hash(a, 8453, h), replay_safe_hash(b, 8453, h));
        assert_ne!(replay_safe_hash(a, 8453, h), replay_safe_hash(a, 1, h));
        assert_eq!(replay_safe_hash(a, 1, h), replay_safe_hash(a, 1, h));
    }

    #[test]
    fn factory_data_decodes_owners() -> eyre::Result<()> {
        let owner = address!("3333333333333333333333333333333333333333");
        let data = CoinbaseSmartWalletFactory::createAccountCall {
            owners: vec![address_owner_bytes(owner)],
            nonce: U256::ZERO,
        }
        .abi_encode();
        let decoded = CoinbaseSmartWalletFactory::createAccountCall::abi_decode(&data)?;
        assert_eq!(
            decoded.owners.first().and_then(|o| owner_bytes_to_address(o)),
            Some(owner)
        );
        Ok(())
    }

    #[test]
    fn fees_respect_priority_floor() {
        let (max_fee, prio) = compute_eip1559_fees(10, 1_000);
        assert_eq!(prio, 1_500_000_000);
        assert_eq!(max_fee, 20 + 1_500_000_000);
    }

    #[test]
    fn user_op_hash_depends_on_signature_free_fields() {
        let mut op = UserOperation {
            nonce: U256::from(1_u8),
            ..UserOperation::default()
        };
        let h1 = op.hash(ENTRY_POINT_V06, 8453);
        op.signature = Bytes::from_static(&[1, 2, 3]);
        assert_eq!(op.hash(ENTRY_POINT_V06, 8453), h1);
        op.nonce = U256::from(2_u8);
        assert_ne!(op.hash(ENTRY_POINT_V06, 8453), h1);
    }
}
