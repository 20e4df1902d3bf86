use std::fmt;

/// The JSON-RPC surface the signer understands. Anything else is passed through to the
/// current chain's RPC endpoint as [`Method::Unknown`].
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Method {
    EthRequestAccounts,
    EthAccounts,
    EthChainId,
    EthCoinbase,
    NetVersion,
    WalletSwitchEthereumChain,
    WalletGetCapabilities,
    WalletConnect,
    WalletGetSubAccounts,
    WalletAddSubAccount,
    WalletSendCalls,
    WalletSign,
    WalletGrantPermissions,
    WalletGetCallsStatus,
    WalletShowCallsStatus,
    PersonalSign,
    EthSendTransaction,
    EthSignTypedDataV1,
    EthSignTypedDataV3,
    EthSignTypedDataV4,
    CoinbaseFetchPermissions,
    CoinbaseFetchPermission,
    Experimental(String),
    Unknown(String),
}

impl Method {
    pub fn parse(s: &str) -> Self {
        match s {
            "eth_requestAccounts" => Self::EthRequestAccounts,
            "eth_accounts" => Self::EthAccounts,
            "eth_chainId" => Self::EthChainId,
            "eth_coinbase" => Self::EthCoinbase,
            "net_version" => Self::NetVersion,
            "wallet_switchEthereumChain" => Self::WalletSwitchEthereumChain,
            "wallet_getCapabilities" => Self::WalletGetCapabilities,
            "wallet_connect" => Self::WalletConnect,
            "wallet_getSubAccounts" => Self::WalletGetSubAccounts,
            "wallet_addSubAccount" => Self::WalletAddSubAccount,
            "wallet_sendCalls" => Self::WalletSendCalls,
            "wallet_sign" => Self::WalletSign,
            "wallet_grantPermissions" => Self::WalletGrantPermissions,
            "wallet_getCallsStatus" => Self::WalletGetCallsStatus,
            "wallet_showCallsStatus" => Self::WalletShowCallsStatus,
            "personal_sign" => Self::PersonalSign,
            "eth_sendTransaction" => Self::EthSendTransaction,
            "eth_signTypedData_v1" => Self::EthSignTypedDataV1,
            "eth_signTypedData_v3" => Self::EthSignTypedDataV3,
            "eth_signTypedData_v4" => Self::EthSignTypedDataV4,
            "coinbase_fetchPermissions" => Self::CoinbaseFetchPermissions,
            "coinbase_fetchPermission" => Self::CoinbaseFetchPermission,
            other if other.starts_with("experimental_") => Self::Experimental(other.to_owned()),
            other => Self::Unknown(other.to_owned()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::EthRequestAccounts => "eth_requestAccounts",
            Self::EthAccounts => "eth_accounts",
            Self::EthChainId => "eth_chainId",
            Self::EthCoinbase => "eth_coinbase",
            Self::NetVersion => "net_version",
            Self::WalletSwitchEthereumChain => "wallet_switchEthereumChain",
            Self::WalletGetCapabilities => "wallet_getCapabilities",
            Self::WalletConnect => "wallet_connect",
            Self::WalletGetSubAccounts => "wallet_getSubAccounts",
            Self::WalletAddSubAccount => "wallet_addSubAccount",
            Self::WalletSendCalls => "wallet_sendCalls",
            Self::WalletSign => "wallet_sign",
            Self::WalletGrantPermissions => "wallet_grantPermissions",
            Self::WalletGetCallsStatus => "wallet_getCallsStatus",
            Self::WalletShowCallsStatus => "wallet_showCallsStatus",
            Self::PersonalSign => "personal_sign",
            Self::EthSendTransaction => "eth_sendTransaction",
            Self::EthSignTypedDataV1 => "eth_signTypedData_v1",
            Self::EthSignTypedDataV3 => "eth_signTypedData_v3",
            Self::EthSignTypedDataV4 => "eth_signTypedData_v4",
            Self::CoinbaseFetchPermissions => "coinbase_fetchPermissions",
            Self::CoinbaseFetchPermission => "coinbase_fetchPermission",
            Self::Experimental(s) | Self::Unknown(s) => s,
        }
    }

    /// Methods that may run before any account is connected.
    pub const fn allowed_unconnected(&self) -> bool {
        matches!(
            self,
            Self::EthRequestAccounts
                | Self::WalletSwitchEthereumChain
                | Self::WalletConnect
                | Self::WalletSendCalls
                | Self::WalletSign
                | Self::Experimental(_)
        )
    }

    /// Methods that need an established secure channel before they are sent.
    pub const fn needs_handshake(&self) -> bool {
        matches!(
            self,
            Self::EthRequestAccounts
                | Self::WalletConnect
                | Self::WalletSendCalls
                | Self::WalletSign
                | Self::Experimental(_)
        )
    }

    pub const fn is_signing(&self) -> bool {
        matches!(
            self,
            Self::PersonalSign
                | Self::EthSignTypedDataV1
                | Self::EthSignTypedDataV3
                | Self::EthSignTypedDataV4
        )
    }

    pub const fn is_sending(&self) -> bool {
        matches!(self, Self::EthSendTransaction | Self::WalletSendCalls)
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_is_inverse_of_as_str() {
        for name in [
            "eth_requestAccounts",
            "wallet_addSubAccount",
            "eth_signTypedData_v4",
            "coinbase_fetchPermission",
            "experimental_requestInfo",
            "eth_getBalance",
        ] {
            assert_eq!(Method::parse(name).as_str(), name);
        }
    }

    #[test]
    fn experimental_prefix_and_fallback() {
        assert!(matches!(
            Method::parse("experimental_requestInfo"),
            Method::Experimental(_)
        ));
        assert_eq!(
            Method::parse("eth_blockNumber"),
            Method::Unknown("eth_blockNumber".into())
        );
        assert!(Method::parse("experimental_x").allowed_unconnected());
        assert!(!Method::parse("personal_sign").allowed_unconnected());
    }
}
