//! Layered configuration: compiled-in defaults < optional TOML file <
//! environment variables, validated once at startup so a federator refuses
//! to start with a missing signing key or a contradictory M/N (§2.1, §6).

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub chain: ChainConfig,
    pub bitcoin: BitcoinConfig,
    pub replenisher: ReplenisherConfig,
    pub database: DatabaseConfig,
    pub p2p: P2pConfig,
    pub batch: BatchConfig,
    pub logging: LoggingConfig,
    pub keys: KeyConfig,
}

/// §6: sidechain RPC URL, contract address, starting block, required confirmations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChainConfig {
    pub rpc_url: String,
    pub bridge_contract_address: String,
    pub start_block: u64,
    pub required_confirmations: u64,
    pub event_scan_batch_size: u64,
    pub event_scan_max_retries: u32,
}

impl Default for ChainConfig {
    fn default() -> Self {
        Self {
            rpc_url: "http://127.0.0.1:4444".to_string(),
            bridge_contract_address: "0x0000000000000000000000000000000000000000".to_string(),
            start_block: 0,
            required_confirmations: 10,
            event_scan_batch_size: 1000,
            event_scan_max_retries: 3,
        }
    }
}

impl ChainConfig {
    /// Confirmations a `Sending`/`Mined` update is considered durable after, per §4.1.
    pub fn durable_confirmations(&self) -> u64 {
        (self.required_confirmations / 2).max(1)
    }
}

/// §6: Bitcoin network and RPC credentials, derivation path, number of required signers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BitcoinConfig {
    pub network: BitcoinNetwork,
    pub rpc_url: String,
    pub rpc_user: String,
    pub rpc_password: String,
    pub derivation_path: String,
    pub federator_xpubs: Vec<String>,
    pub num_required_signers: usize,
    pub max_inputs_per_tx: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BitcoinNetwork {
    Mainnet,
    Testnet,
    Regtest,
}

impl Default for BitcoinConfig {
    fn default() -> Self {
        Self {
            network: BitcoinNetwork::Regtest,
            rpc_url: "http://127.0.0.1:18443".to_string(),
            rpc_user: "federator".to_string(),
            rpc_password: String::new(),
            derivation_path: "m/0".to_string(),
            federator_xpubs: Vec::new(),
            num_required_signers: 2,
            max_inputs_per_tx: 50,
        }
    }
}

/// §4.9: thresholds/limits for the replenisher sub-flow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplenisherConfig {
    pub replenisher_xpubs: Vec<String>,
    pub replenish_threshold_sat: u64,
    pub min_amount_sat: u64,
    pub max_amount_sat: u64,
    pub max_per_period: u32,
    #[serde(with = "humantime_serde")]
    pub period: Duration,
    pub alert_threshold_sat: u64,
    #[serde(with = "humantime_serde")]
    pub alert_cooldown: Duration,
}

impl Default for ReplenisherConfig {
    fn default() -> Self {
        Self {
            replenisher_xpubs: Vec::new(),
            replenish_threshold_sat: 10_000_000,
            min_amount_sat: 1_000_000,
            max_amount_sat: 100_000_000,
            max_per_period: 3,
            period: Duration::from_secs(24 * 3600),
            alert_threshold_sat: 1_000_000,
            alert_cooldown: Duration::from_secs(6 * 3600),
        }
    }
}

/// §6: DB URL.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub path: PathBuf,
    #[serde(with = "humantime_serde")]
    pub busy_timeout: Duration,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("federator.sqlite3"),
            busy_timeout: Duration::from_secs(5),
        }
    }
}

/// §6: known peer endpoints, listen port.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct P2pConfig {
    pub listen_port: u16,
    pub peers: Vec<String>,
    #[serde(with = "humantime_serde")]
    pub initiator_sync_interval: Duration,
    pub initiator_sync_wait_replies: usize,
    pub outbound_queue_capacity: usize,
}

impl Default for P2pConfig {
    fn default() -> Self {
        Self {
            listen_port: 9090,
            peers: Vec::new(),
            initiator_sync_interval: Duration::from_secs(10),
            initiator_sync_wait_replies: 0,
            outbound_queue_capacity: 256,
        }
    }
}

/// Batch formation limits (§3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchConfig {
    pub max_transfers_in_batch: usize,
    pub max_passed_blocks_in_batch: u64,
    #[serde(with = "humantime_serde")]
    pub iteration_interval: Duration,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            max_transfers_in_batch: 40,
            max_passed_blocks_in_batch: 120,
            iteration_interval: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

/// §6: master private key, peer public key set.
///
/// The raw secret material never lands in `Config`'s `Debug`/`Serialize`
/// output; only the path/env-var name is kept here, the bytes are loaded
/// directly into the zeroizing [`crate::crypto::FederatorKeystore`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyConfig {
    pub master_private_key_hex_env: String,
    pub bitcoin_xpriv_env: String,
    pub federator_addresses: Vec<String>,
}

impl Default for KeyConfig {
    fn default() -> Self {
        Self {
            master_private_key_hex_env: "FEDERATOR_PRIVATE_KEY".to_string(),
            bitcoin_xpriv_env: "FEDERATOR_BITCOIN_XPRIV".to_string(),
            federator_addresses: Vec::new(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            chain: ChainConfig::default(),
            bitcoin: BitcoinConfig::default(),
            replenisher: ReplenisherConfig::default(),
            database: DatabaseConfig::default(),
            p2p: P2pConfig::default(),
            batch: BatchConfig::default(),
            logging: LoggingConfig::default(),
            keys: KeyConfig::default(),
        }
    }
}

impl Config {
    /// Load defaults, optionally overlay a TOML file, then overlay
    /// environment variables, and validate the result.
    pub fn load(toml_path: Option<&Path>) -> Result<Self> {
        let _ = dotenvy::dotenv();
        let mut config = Config::default();

        if let Some(path) = toml_path {
            let contents = std::fs::read_to_string(path)
                .map_err(|e| Error::Config(format!("reading {}: {}", path.display(), e)))?;
            config = toml::from_str(&contents)
                .map_err(|e| Error::Config(format!("parsing {}: {}", path.display(), e)))?;
        }

        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("CHAIN_RPC_URL") {
            self.chain.rpc_url = v;
        }
        if let Ok(v) = std::env::var("BRIDGE_CONTRACT_ADDRESS") {
            self.chain.bridge_contract_address = v;
        }
        if let Ok(v) = std::env::var("CHAIN_START_BLOCK") {
            if let Ok(n) = v.parse() {
                self.chain.start_block = n;
            }
        }
        if let Ok(v) = std::env::var("REQUIRED_CONFIRMATIONS") {
            if let Ok(n) = v.parse() {
                self.chain.required_confirmations = n;
            }
        }
        if let Ok(v) = std::env::var("BITCOIN_NETWORK") {
            self.bitcoin.network = match v.to_lowercase().as_str() {
                "mainnet" => BitcoinNetwork::Mainnet,
                "testnet" => BitcoinNetwork::Testnet,
                _ => BitcoinNetwork::Regtest,
            };
        }
        if let Ok(v) = std::env::var("BITCOIN_RPC_URL") {
            self.bitcoin.rpc_url = v;
        }
        if let Ok(v) = std::env::var("BITCOIN_RPC_USER") {
            self.bitcoin.rpc_user = v;
        }
        if let Ok(v) = std::env::var("BITCOIN_RPC_PASSWORD") {
            self.bitcoin.rpc_password = v;
        }
        if let Ok(v) = std::env::var("BITCOIN_DERIVATION_PATH") {
            self.bitcoin.derivation_path = v;
        }
        if let Ok(v) = std::env::var("NUM_REQUIRED_SIGNERS") {
            if let Ok(n) = v.parse() {
                self.bitcoin.num_required_signers = n;
            }
        }
        if let Ok(v) = std::env::var("DB_PATH") {
            self.database.path = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("LISTEN_PORT") {
            if let Ok(n) = v.parse() {
                self.p2p.listen_port = n;
            }
        }
        if let Ok(v) = std::env::var("PEER_ENDPOINTS") {
            self.p2p.peers = v.split(',').map(|s| s.trim().to_string()).filter(|s| !s.is_empty()).collect();
        }
        if let Ok(v) = std::env::var("REPLENISH_THRESHOLD_SAT") {
            if let Ok(n) = v.parse() {
                self.replenisher.replenish_threshold_sat = n;
            }
        }
    }

    /// Refuse to start with a missing signing key or contradictory M/N.
    pub fn validate(&self) -> Result<()> {
        if self.bitcoin.num_required_signers == 0 {
            return Err(Error::Config("num_required_signers must be > 0".into()));
        }
        if self.bitcoin.num_required_signers > self.bitcoin.federator_xpubs.len().max(self.bitcoin.num_required_signers) {
            // federator_xpubs may be populated later from chain state; only reject an
            // outright-impossible M > N when xpubs are already known.
            if !self.bitcoin.federator_xpubs.is_empty()
                && self.bitcoin.num_required_signers > self.bitcoin.federator_xpubs.len()
            {
                return Err(Error::Config(format!(
                    "num_required_signers ({}) exceeds configured federator key count ({})",
                    self.bitcoin.num_required_signers,
                    self.bitcoin.federator_xpubs.len()
                )));
            }
        }
        if self.chain.required_confirmations == 0 {
            return Err(Error::Config("required_confirmations must be > 0".into()));
        }
        if self.batch.max_transfers_in_batch == 0 {
            return Err(Error::Config("max_transfers_in_batch must be > 0".into()));
        }
        if std::env::var(&self.keys.master_private_key_hex_env).is_err() {
            return Err(Error::Config(format!(
                "missing signing key: environment variable {} not set",
                self.keys.master_private_key_hex_env
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_sane_batch_limits() {
        let config = Config::default();
        assert_eq!(config.batch.max_transfers_in_batch, 40);
        assert!(config.batch.max_passed_blocks_in_batch > 0);
    }

    #[test]
    fn durable_confirmations_is_at_least_one() {
        let mut chain = ChainConfig::default();
        chain.required_confirmations = 1;
        assert_eq!(chain.durable_confirmations(), 1);
        chain.required_confirmations = 0;
        // validate() would reject this, but the helper itself must never divide to zero.
        assert_eq!(chain.durable_confirmations(), 1);
    }

    #[test]
    fn validate_rejects_missing_signing_key_env() {
        std::env::remove_var("FEDERATOR_PRIVATE_KEY_TEST_UNSET");
        let mut config = Config::default();
        config.keys.master_private_key_hex_env = "FEDERATOR_PRIVATE_KEY_TEST_UNSET".to_string();
        assert!(config.validate().is_err());
    }
}
