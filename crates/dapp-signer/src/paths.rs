use directories::ProjectDirs;
use eyre::ContextCompat as _;
use std::path::PathBuf;

pub const CONFIG_DIR_ENV: &str = "DAPP_SIGNER_CONFIG_DIR";
pub const DATA_DIR_ENV: &str = "DAPP_SIGNER_DATA_DIR";

#[derive(Debug, Clone)]
pub struct DappSignerPaths {
    pub config_dir: PathBuf,
    pub data_dir: PathBuf,
    pub log_file: PathBuf,
}

impl DappSignerPaths {
    /// Platform dirs for `dapp-signer`, each overridable on its own through the environment.
    pub fn discover() -> eyre::Result<Self> {
        let env_dir = |key: &str| {
            std::env::var(key)
                .ok()
                .filter(|v| !v.trim().is_empty())
                .map(PathBuf::from)
        };
        let (config_dir, data_dir) = match (env_dir(CONFIG_DIR_ENV), env_dir(DATA_DIR_ENV)) {
            (Some(c), Some(d)) => (c, d),
            (c, d) => {
                let proj = ProjectDirs::from("", "", "dapp-signer")
                    .context("failed to resolve project dirs")?;
                (
                    c.unwrap_or_else(|| proj.config_dir().to_path_buf()),
                    d.unwrap_or_else(|| proj.data_dir().to_path_buf()),
                )
            }
        };
        Ok(Self::rooted(config_dir, data_dir))
    }

    pub fn rooted(config_dir: PathBuf, data_dir: PathBuf) -> Self {
        let log_file = data_dir.join("dapp-signer.log.jsonl");
        Self {
            config_dir,
            data_dir,
            log_file,
        }
    }

    pub fn config_file(&self) -> PathBuf {
        self.config_dir.join("config.toml")
    }

    /// Backing file of the persistent store scope.
    pub fn store_file(&self) -> PathBuf {
        self.data_dir.join("store.json")
    }

    pub fn ensure_private_dirs(&self) -> eyre::Result<()> {
        crate::fsutil::ensure_private_dir(&self.config_dir)?;
        crate::fsutil::ensure_private_dir(&self.data_dir)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rooted_layout() {
        let p = DappSignerPaths::rooted(PathBuf::from("/c"), PathBuf::from("/d"));
        assert_eq!(p.config_file(), PathBuf::from("/c/config.toml"));
        assert_eq!(p.store_file(), PathBuf::from("/d/store.json"));
        assert_eq!(p.log_file, PathBuf::from("/d/dapp-signer.log.jsonl"));
    }
}
