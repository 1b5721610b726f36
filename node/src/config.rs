use crate::dedup::SIGNING_CONFIRMATION_TIMEOUT;
use anyhow::Context;
use k256::ecdsa::SigningKey;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Fully resolved configuration: the parsed file plus the secrets it points at.
#[derive(Debug)]
pub struct Config {
    pub file: ConfigFile,
    pub secrets: SecretsConfig,
}

pub struct SecretsConfig {
    pub operator_key: SigningKey,
    pub aes_key: [u8; 16],
}

impl std::fmt::Debug for SecretsConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecretsConfig").finish_non_exhaustive()
    }
}

/// The contents of the operator's config.yaml. Unknown keys are ignored.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ConfigFile {
    pub chain: ChainConfig,
    pub storage: StorageConfig,
    pub tss: TssConfig,
    pub peer: PeerConfig,
    pub signing: SigningConfig,
    pub tbtc: TbtcConfig,
    /// Debug and metrics endpoints; disabled when absent.
    pub web_ui: Option<WebUIConfig>,
    /// Number of runtime worker threads; defaults to the number of cores.
    pub cores: Option<usize>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChainBackend {
    #[default]
    Local,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ChainConfig {
    pub backend: ChainBackend,
    pub url: String,
    pub account: AccountConfig,
    /// Logical contract name to hex address.
    pub contract_addresses: BTreeMap<String, String>,
    /// Seconds between mining checks of a submitted transaction.
    pub mining_check_interval: u64,
    pub max_gas_price: u128,
    pub balance_alert_threshold: u128,
    pub balance_monitor_interval: u64,
    /// 0 disables the limit.
    pub requests_per_second_limit: u32,
    /// 0 disables the limit.
    pub concurrency_limit: usize,
    pub request_timeout: u64,
    pub block_confirmations: u64,
    pub status_check_interval: u64,
}

impl Default for ChainConfig {
    fn default() -> Self {
        Self {
            backend: ChainBackend::Local,
            url: "http://127.0.0.1:8545".to_string(),
            account: AccountConfig::default(),
            contract_addresses: BTreeMap::new(),
            mining_check_interval: 60,
            max_gas_price: 500_000_000_000,
            balance_alert_threshold: 500_000_000_000_000_000,
            balance_monitor_interval: 600,
            requests_per_second_limit: 0,
            concurrency_limit: 0,
            request_timeout: 60,
            block_confirmations: 12,
            status_check_interval: 3600,
        }
    }
}

impl ChainConfig {
    pub fn mining_check_interval(&self) -> Duration {
        Duration::from_secs(self.mining_check_interval)
    }

    pub fn balance_monitor_interval(&self) -> Duration {
        Duration::from_secs(self.balance_monitor_interval)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout)
    }

    pub fn status_check_interval(&self) -> Duration {
        Duration::from_secs(self.status_check_interval)
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AccountConfig {
    /// Path of the file holding the hex secp256k1 secret key, relative to the
    /// config file's directory.
    pub key_file: String,
    pub key_file_password: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StorageConfig {
    pub data_dir: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("/var/keep"),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TssConfig {
    pub pre_params_pool_size: usize,
    /// Seconds allowed for generating pre-parameters when the pool is empty.
    pub pre_params_timeout: u64,
    /// Wall clock bound of one keygen or signing run, in seconds.
    pub protocol_timeout: u64,
    /// Seconds a single outbound message may be retried before the run fails.
    pub round_timeout: u64,
    /// Honest-threshold the pool pre-generates for.
    pub default_threshold: usize,
}

impl Default for TssConfig {
    fn default() -> Self {
        Self {
            pre_params_pool_size: 2,
            pre_params_timeout: 120,
            protocol_timeout: 600,
            round_timeout: 30,
            default_threshold: 2,
        }
    }
}

impl TssConfig {
    pub fn pre_params_timeout(&self) -> Duration {
        Duration::from_secs(self.pre_params_timeout)
    }

    pub fn protocol_timeout(&self) -> Duration {
        Duration::from_secs(self.protocol_timeout)
    }

    pub fn round_timeout(&self) -> Duration {
        Duration::from_secs(self.round_timeout)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PeerConfig {
    pub host: String,
    pub port: u16,
    /// Bootstrap peers as `host:port`.
    pub peers: Vec<String>,
}

impl Default for PeerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 3919,
            peers: Vec::new(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SigningConfig {
    /// Seconds between the submissions of consecutive selected signers.
    pub submission_stagger: u64,
    /// Signing attempts per digest while the chain still awaits a signature.
    pub max_attempts: u32,
    /// Seconds a signature request is re-checked on chain before it is
    /// treated as reverted.
    pub confirmation_timeout: u64,
}

impl Default for SigningConfig {
    fn default() -> Self {
        Self {
            submission_stagger: 5,
            max_attempts: 3,
            confirmation_timeout: SIGNING_CONFIRMATION_TIMEOUT.as_secs(),
        }
    }
}

impl SigningConfig {
    pub fn submission_stagger(&self) -> Duration {
        Duration::from_secs(self.submission_stagger)
    }

    pub fn confirmation_timeout(&self) -> Duration {
        Duration::from_secs(self.confirmation_timeout)
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TbtcConfig {
    /// Owner application this operator registers for.
    pub tbtc_system: Option<String>,
}

/// Config for the web UI, which is mostly for debugging and metrics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebUIConfig {
    pub host: String,
    pub port: u16,
}

impl ConfigFile {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let file = std::fs::read_to_string(path)
            .with_context(|| format!("read config file {}", path.display()))?;
        let config: Self = serde_yaml::from_str(&file)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.chain.account.key_file.is_empty() {
            anyhow::bail!("chain.account.keyFile must be set");
        }
        if self.storage.data_dir.as_os_str().is_empty() {
            anyhow::bail!("storage.dataDir must be set");
        }
        if self.tss.default_threshold == 0 {
            anyhow::bail!("tss.defaultThreshold must be at least 1");
        }
        if self.tss.protocol_timeout == 0 {
            anyhow::bail!("tss.protocolTimeout must be positive");
        }
        if self.signing.max_attempts == 0 {
            anyhow::bail!("signing.maxAttempts must be at least 1");
        }
        if self.chain.mining_check_interval == 0 {
            anyhow::bail!("chain.miningCheckInterval must be positive");
        }
        url::Url::parse(&self.chain.url).context("chain.url")?;
        Ok(())
    }
}

/// Parses a hex secp256k1 secret key, with or without a `0x` prefix.
pub fn parse_operator_key(hex_key: &str) -> anyhow::Result<SigningKey> {
    let trimmed = hex_key.trim();
    let bytes = hex::decode(trimmed.strip_prefix("0x").unwrap_or(trimmed))
        .context("decode operator key")?;
    SigningKey::from_slice(&bytes).map_err(|_| anyhow::anyhow!("invalid operator key"))
}

pub fn parse_aes_key(hex_key: &str) -> anyhow::Result<[u8; 16]> {
    hex::decode(hex_key.trim())
        .context("decode secret store key")?
        .try_into()
        .map_err(|_| anyhow::anyhow!("secret store key must be 16 bytes"))
}

pub fn load_config(config_path: &Path, aes_key: [u8; 16]) -> anyhow::Result<Config> {
    let file = ConfigFile::from_file(config_path).context("load config file")?;
    let base_dir = config_path.parent().unwrap_or_else(|| Path::new("."));
    let key_path = base_dir.join(&file.chain.account.key_file);
    let operator_key = parse_operator_key(
        &std::fs::read_to_string(&key_path)
            .with_context(|| format!("read operator key {}", key_path.display()))?,
    )?;
    Ok(Config {
        file,
        secrets: SecretsConfig {
            operator_key,
            aes_key,
        },
    })
}
