use crate::{paths::DappSignerPaths, resilience::ResilienceConfig, types::AppMetadata};
use eyre::Context as _;
use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, fs, path::PathBuf, str::FromStr};

pub const DEFAULT_KEYS_URL: &str = "https://keys.coinbase.com/connect";
pub const DEFAULT_WALLET_RPC_URL: &str = "https://rpc.wallet.coinbase.com";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum SubAccountCreation {
    #[default]
    Manual,
    OnConnect,
}

/// Which account leads the AccountSet once a sub-account is known.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum DefaultAccount {
    Sub,
    #[default]
    Global,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum FundingMode {
    #[default]
    SpendPermissions,
    Manual,
}

impl FromStr for FundingMode {
    type Err = eyre::Report;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "spend-permissions" | "spend_permissions" => Ok(Self::SpendPermissions),
            "manual" => Ok(Self::Manual),
            other => eyre::bail!("unknown funding mode: {other}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(default, rename_all = "camelCase")]
pub struct SubAccountsConfig {
    pub creation: SubAccountCreation,
    pub default_account: DefaultAccount,
    pub funding: FundingMode,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Attribution {
    /// Let the wallet derive the suffix from the app origin.
    pub auto: bool,
    /// Explicit ERC-8021 style suffix appended to call data.
    pub data_suffix: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Preference {
    /// URL of the wallet popup.
    pub keys_url: String,
    pub attribution: Option<Attribution>,
    pub telemetry: bool,
}

impl Default for Preference {
    fn default() -> Self {
        Self {
            keys_url: DEFAULT_KEYS_URL.into(),
            attribution: None,
            telemetry: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct ChainsConfig {
    /// Extra RPC endpoints tried after the wallet-provided one, keyed by decimal chain id.
    pub fallback_rpc_urls: BTreeMap<String, Vec<String>>,
}

impl ChainsConfig {
    pub fn fallbacks_for(&self, chain_id: u64) -> &[String] {
        self.fallback_rpc_urls
            .get(&chain_id.to_string())
            .map_or(&[], Vec::as_slice)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SdkConfig {
    pub app: AppMetadata,
    pub preference: Preference,
    pub sub_accounts: SubAccountsConfig,
    pub resilience: ResilienceConfig,
    /// Wallet RPC used for spend permissions and ephemeral call status lookups.
    pub wallet_rpc_url: String,
    pub chains: ChainsConfig,
}

impl Default for SdkConfig {
    fn default() -> Self {
        Self {
            app: AppMetadata::default(),
            preference: Preference::default(),
            sub_accounts: SubAccountsConfig::default(),
            resilience: ResilienceConfig::default(),
            wallet_rpc_url: DEFAULT_WALLET_RPC_URL.into(),
            chains: ChainsConfig::default(),
        }
    }
}

impl SdkConfig {
    /// The explicit data suffix, if attribution is configured with one.
    pub fn data_suffix(&self) -> Option<&str> {
        self.preference
            .attribution
            .as_ref()
            .and_then(|a| a.data_suffix.as_deref())
    }
}

fn apply_env_overrides(cfg: &mut SdkConfig) {
    fn apply_env(var: &str, setter: impl FnOnce(&str)) {
        if let Ok(u) = std::env::var(var) {
            let t = u.trim();
            if !t.is_empty() {
                setter(t);
            }
        }
    }

    apply_env("DAPP_SIGNER_KEYS_URL", |v| {
        v.clone_into(&mut cfg.preference.keys_url);
    });
    apply_env("DAPP_SIGNER_WALLET_RPC_URL", |v| {
        v.clone_into(&mut cfg.wallet_rpc_url);
    });
    apply_env("DAPP_SIGNER_FUNDING_MODE", |v| match v.parse::<FundingMode>() {
        Ok(m) => cfg.sub_accounts.funding = m,
        Err(e) => tracing::warn!(error = %e, "ignoring DAPP_SIGNER_FUNDING_MODE"),
    });
}

#[derive(Debug, Clone)]
pub struct ConfigStore {
    path: PathBuf,
}

impl ConfigStore {
    pub fn new(paths: &DappSignerPaths) -> Self {
        Self {
            path: paths.config_file(),
        }
    }

    pub fn at(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn load_or_init_default(&self) -> eyre::Result<SdkConfig> {
        if !self.path.exists() {
            let mut cfg = SdkConfig::default();
            self.save(&cfg)?;
            apply_env_overrides(&mut cfg);
            return Ok(cfg);
        }

        let s = fs::read_to_string(&self.path)
            .with_context(|| format!("read {}", self.path.display()))?;
        let mut cfg: SdkConfig = toml::from_str(&s).context("parse config.toml")?;
        apply_env_overrides(&mut cfg);
        Ok(cfg)
    }

    pub fn save(&self, cfg: &SdkConfig) -> eyre::Result<()> {
        let s = toml::to_string_pretty(cfg).context("serialize config.toml")?;
        crate::fsutil::write_atomic_private(&self.path, s.as_bytes())
            .context("write config.toml")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resilience::BackoffStrategy;

    #[test]
    fn first_load_writes_defaults() -> eyre::Result<()> {
        let dir = tempfile::tempdir()?;
        let store = ConfigStore::at(dir.path().join("config.toml"));
        let cfg = store.load_or_init_default()?;
        assert_eq!(cfg.resilience, ResilienceConfig::default());
        assert!(dir.path().join("config.toml").exists());
        let again = store.load_or_init_default()?;
        assert_eq!(again.resilience, cfg.resilience);
        Ok(())
    }

    #[test]
    fn parses_partial_toml() -> eyre::Result<()> {
        let cfg: SdkConfig = toml::from_str(
            r#"
            wallet_rpc_url = "https://rpc.example"

            [sub_accounts]
            creation = "on-connect"
            defaultAccount = "sub"
            funding = "manual"

            [resilience]
            max_retries = 5
            backoff = "linear"

            [chains.fallback_rpc_urls]
            "8453" = ["https://base.example"]
            "#,
        )?;
        assert_eq!(cfg.sub_accounts.creation, SubAccountCreation::OnConnect);
        assert_eq!(cfg.sub_accounts.default_account, DefaultAccount::Sub);
        assert_eq!(cfg.sub_accounts.funding, FundingMode::Manual);
        assert_eq!(cfg.resilience.max_retries, 5);
        assert_eq!(cfg.resilience.backoff, BackoffStrategy::Linear);
        assert_eq!(cfg.chains.fallbacks_for(8453), ["https://base.example"]);
        assert!(cfg.chains.fallbacks_for(1).is_empty());
        assert_eq!(cfg.preference.keys_url, DEFAULT_KEYS_URL);
        Ok(())
    }

    #[test]
    fn funding_mode_from_env_string() -> eyre::Result<()> {
        assert_eq!("manual".parse::<FundingMode>()?, FundingMode::Manual);
        assert_eq!(
            "Spend-Permissions".parse::<FundingMode>()?,
            FundingMode::SpendPermissions
        );
        assert!("card".parse::<FundingMode>().is_err());
        Ok(())
    }
}
