use eyre::{eyre, Result, WrapErr};
use std::env;
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use crate::chain::{is_valid_evm_address, is_valid_near_account};
use crate::codec::KeyRing;
use crate::coordinator::retry::{FinalityConfig, RetryConfig};
use crate::coordinator::Settings;

/// Main configuration for the coordinator
#[derive(Debug, Clone)]
pub struct Config {
    pub database: DatabaseConfig,
    pub api: ApiConfig,
    pub coordinator: CoordinatorConfig,
    pub evm: EvmConfig,
    pub near: NearConfig,
    pub mpc: MpcConfig,
    pub codec: CodecConfig,
}

/// Database configuration
#[derive(Clone)]
pub struct DatabaseConfig {
    pub url: String,
}

/// Custom Debug that redacts the database URL (may contain credentials).
impl fmt::Debug for DatabaseConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DatabaseConfig")
            .field("url", &"<redacted>")
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct ApiConfig {
    pub port: u16,
}

/// Timing and budget knobs of the coordinator
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    pub poll_interval_ms: u64,
    pub transfer_ttl_secs: u64,
    pub retry_max_attempts: u32,
    pub retry_initial_backoff_ms: u64,
    pub retry_max_backoff_ms: u64,
    pub retry_backoff_multiplier: f64,
    pub attempt_timeout_ms: u64,
    pub finality_poll_interval_ms: u64,
    pub finality_max_polls: u32,
}

/// EVM configuration
#[derive(Clone)]
pub struct EvmConfig {
    pub name: String,
    pub rpc_url: String,
    pub chain_id: u64,
    pub bridge_address: String,
    pub private_key: String,
    pub finality_blocks: u64,
    /// First block scanned when looking up bridge events
    pub start_block: u64,
}

/// Custom Debug that redacts private_key to prevent accidental log leakage.
impl fmt::Debug for EvmConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EvmConfig")
            .field("name", &self.name)
            .field("rpc_url", &self.rpc_url)
            .field("chain_id", &self.chain_id)
            .field("bridge_address", &self.bridge_address)
            .field("private_key", &"<redacted>")
            .field("finality_blocks", &self.finality_blocks)
            .field("start_block", &self.start_block)
            .finish()
    }
}

/// NEAR configuration
#[derive(Debug, Clone)]
pub struct NearConfig {
    pub name: String,
    pub rpc_url: String,
    /// Relayer that signs and broadcasts function calls as `signer_account`
    pub relayer_url: String,
    pub bridge_account: String,
    pub signer_account: String,
}

/// MPC signature service configuration
#[derive(Debug, Clone)]
pub struct MpcConfig {
    pub contract_id: String,
    /// Root key in NEAR format (`secp256k1:<base58>`)
    pub root_public_key: String,
    pub derivation_path: String,
    pub key_version: u32,
}

/// Payload protection keys
#[derive(Clone)]
pub struct CodecConfig {
    /// Raw `id:hex64,...` list
    pub payload_keys: String,
    pub key_id: String,
}

/// Custom Debug that redacts key material.
impl fmt::Debug for CodecConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CodecConfig")
            .field("payload_keys", &"<redacted>")
            .field("key_id", &self.key_id)
            .finish()
    }
}

impl CodecConfig {
    pub fn key_ring(&self) -> Result<KeyRing> {
        KeyRing::parse(&self.payload_keys).map_err(|e| eyre!("PAYLOAD_KEYS: {}", e))
    }
}

/// Default functions
fn default_api_port() -> u16 {
    9092
}

fn default_poll_interval() -> u64 {
    5000
}

fn default_transfer_ttl() -> u64 {
    3600
}

fn default_retry_max_attempts() -> u32 {
    5
}

fn default_retry_initial_backoff() -> u64 {
    2000
}

fn default_retry_max_backoff() -> u64 {
    60_000
}

fn default_retry_backoff_multiplier() -> f64 {
    2.0
}

fn default_attempt_timeout() -> u64 {
    30_000
}

fn default_finality_poll_interval() -> u64 {
    3000
}

fn default_finality_max_polls() -> u32 {
    40
}

fn default_finality_blocks() -> u64 {
    12
}

fn default_mpc_contract() -> String {
    "v1.signer".to_string()
}

fn default_derivation_path() -> String {
    "bridge-release".to_string()
}

fn required(name: &str) -> Result<String> {
    env::var(name).map_err(|_| eyre!("{} environment variable is required", name))
}

fn optional<T>(name: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    parse_or_default(name, env::var(name).ok(), default)
}

/// A set but malformed value is an error, never silently the default
fn parse_or_default<T>(name: &str, raw: Option<String>, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match raw {
        Some(raw) => raw
            .trim()
            .parse()
            .wrap_err_with(|| format!("{} has an invalid value: {}", name, raw)),
        None => Ok(default),
    }
}

impl CoordinatorConfig {
    pub fn retry(&self) -> RetryConfig {
        RetryConfig {
            max_attempts: self.retry_max_attempts,
            initial_backoff: Duration::from_millis(self.retry_initial_backoff_ms),
            max_backoff: Duration::from_millis(self.retry_max_backoff_ms),
            backoff_multiplier: self.retry_backoff_multiplier,
            attempt_timeout: Duration::from_millis(self.attempt_timeout_ms),
        }
    }

    pub fn finality(&self) -> FinalityConfig {
        FinalityConfig {
            poll_interval: Duration::from_millis(self.finality_poll_interval_ms),
            max_polls: self.finality_max_polls,
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

impl Config {
    /// Load configuration from environment variables
    /// Loads .env file if present, then reads from environment
    pub fn load() -> Result<Self> {
        Self::load_from_file(".env").or_else(|_| Self::load_from_env())
    }

    /// Load from a specific .env file path
    pub fn load_from_file(path: &str) -> Result<Self> {
        if Path::new(path).exists() {
            dotenvy::from_filename(path)
                .wrap_err_with(|| format!("Failed to load .env file from {}", path))?;
        }
        Self::load_from_env()
    }

    /// Load configuration from environment variables
    fn load_from_env() -> Result<Self> {
        let database = DatabaseConfig {
            url: required("DATABASE_URL")?,
        };

        let api = ApiConfig {
            port: optional("API_PORT", default_api_port())?,
        };

        let coordinator = CoordinatorConfig {
            poll_interval_ms: optional("POLL_INTERVAL_MS", default_poll_interval())?,
            transfer_ttl_secs: optional("TRANSFER_TTL_SECS", default_transfer_ttl())?,
            retry_max_attempts: optional("RETRY_MAX_ATTEMPTS", default_retry_max_attempts())?,
            retry_initial_backoff_ms: optional(
                "RETRY_INITIAL_BACKOFF_MS",
                default_retry_initial_backoff(),
            )?,
            retry_max_backoff_ms: optional("RETRY_MAX_BACKOFF_MS", default_retry_max_backoff())?,
            retry_backoff_multiplier: optional(
                "RETRY_BACKOFF_MULTIPLIER",
                default_retry_backoff_multiplier(),
            )?,
            attempt_timeout_ms: optional("ATTEMPT_TIMEOUT_MS", default_attempt_timeout())?,
            finality_poll_interval_ms: optional(
                "FINALITY_POLL_INTERVAL_MS",
                default_finality_poll_interval(),
            )?,
            finality_max_polls: optional("FINALITY_MAX_POLLS", default_finality_max_polls())?,
        };

        let evm = EvmConfig {
            name: optional("EVM_CHAIN_NAME", "ethereum".to_string())?,
            rpc_url: required("EVM_RPC_URL")?,
            chain_id: required("EVM_CHAIN_ID")?
                .parse()
                .wrap_err("EVM_CHAIN_ID must be a valid u64")?,
            bridge_address: required("EVM_BRIDGE_ADDRESS")?,
            private_key: required("EVM_PRIVATE_KEY")?,
            finality_blocks: optional("EVM_FINALITY_BLOCKS", default_finality_blocks())?,
            start_block: optional("EVM_BRIDGE_START_BLOCK", 0)?,
        };

        let near = NearConfig {
            name: optional("NEAR_CHAIN_NAME", "near".to_string())?,
            rpc_url: required("NEAR_RPC_URL")?,
            relayer_url: required("NEAR_RELAYER_URL")?,
            bridge_account: required("NEAR_BRIDGE_ACCOUNT")?,
            signer_account: required("NEAR_SIGNER_ACCOUNT")?,
        };

        let mpc = MpcConfig {
            contract_id: optional("MPC_CONTRACT_ID", default_mpc_contract())?,
            root_public_key: required("MPC_ROOT_PUBLIC_KEY")?,
            derivation_path: optional("MPC_DERIVATION_PATH", default_derivation_path())?,
            key_version: optional("MPC_KEY_VERSION", 0)?,
        };

        let codec = CodecConfig {
            payload_keys: required("PAYLOAD_KEYS")?,
            key_id: required("PAYLOAD_KEY_ID")?,
        };

        let config = Config {
            database,
            api,
            coordinator,
            evm,
            near,
            mpc,
            codec,
        };

        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    fn validate(&self) -> Result<()> {
        if self.database.url.is_empty() {
            return Err(eyre!("database.url cannot be empty"));
        }

        if self.coordinator.retry_max_attempts == 0 {
            return Err(eyre!("RETRY_MAX_ATTEMPTS must be at least 1"));
        }
        if self.coordinator.retry_backoff_multiplier < 1.0 {
            return Err(eyre!("RETRY_BACKOFF_MULTIPLIER must be >= 1.0"));
        }
        if self.coordinator.finality_max_polls == 0 {
            return Err(eyre!("FINALITY_MAX_POLLS must be at least 1"));
        }
        if self.coordinator.transfer_ttl_secs == 0 {
            return Err(eyre!("TRANSFER_TTL_SECS must be positive"));
        }

        if self.evm.rpc_url.is_empty() {
            return Err(eyre!("evm.rpc_url cannot be empty"));
        }
        if !is_valid_evm_address(&self.evm.bridge_address) {
            return Err(eyre!(
                "evm.bridge_address must be a valid hex address (42 chars with 0x prefix)"
            ));
        }
        if self.evm.private_key.len() != 66 || !self.evm.private_key.starts_with("0x") {
            return Err(eyre!("evm.private_key must be 66 chars (0x + 64 hex chars)"));
        }

        if self.near.rpc_url.is_empty() || self.near.relayer_url.is_empty() {
            return Err(eyre!("near.rpc_url and near.relayer_url cannot be empty"));
        }
        if !is_valid_near_account(&self.near.bridge_account) {
            return Err(eyre!("near.bridge_account is not a valid NEAR account id"));
        }
        if !is_valid_near_account(&self.near.signer_account) {
            return Err(eyre!("near.signer_account is not a valid NEAR account id"));
        }

        if !self.mpc.root_public_key.starts_with("secp256k1:") {
            return Err(eyre!("MPC_ROOT_PUBLIC_KEY must start with secp256k1:"));
        }
        if self.mpc.derivation_path.is_empty() {
            return Err(eyre!("MPC_DERIVATION_PATH cannot be empty"));
        }

        let ring = self.codec.key_ring()?;
        if !ring.contains(&self.codec.key_id) {
            return Err(eyre!(
                "PAYLOAD_KEY_ID {} is not present in PAYLOAD_KEYS",
                self.codec.key_id
            ));
        }

        Ok(())
    }

    /// Runtime settings handed to the coordinator
    pub fn coordinator_settings(&self) -> Settings {
        Settings {
            retry: self.coordinator.retry(),
            finality: self.coordinator.finality(),
            transfer_ttl: chrono::Duration::seconds(self.coordinator.transfer_ttl_secs as i64),
            poll_interval: self.coordinator.poll_interval(),
            key_id: self.codec.key_id.clone(),
            derivation_path: self.mpc.derivation_path.clone(),
        }
    }
}
