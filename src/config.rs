//! Configuration file support for the credential pipeline.
//!
//! Configuration is loaded from TOML and validated once at process start;
//! any missing or invalid required value is fatal.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};

use crate::error::ConfigError;
use crate::ethereum::parse_address;
use crate::hasher::HashFunction;
use crate::merkle::MAX_DEPTH;
use crate::types::{Group, MemberSelectionRule};

/// Environment variable naming the config file for the binaries.
pub const CONFIG_ENV: &str = "ZKP_CONFIG";
pub const DEFAULT_CONFIG_PATH: &str = "config.toml";

const API_KEY_PLACEHOLDER: &str = "{api_key}";

const DEFAULT_INITIAL_BATCH_SIZE: u64 = 2_000;
const DEFAULT_MAX_BATCH_SIZE: u64 = 10_000;
const DEFAULT_GROW_AFTER_SUCCESSES: u32 = 3;
const DEFAULT_MAX_RETRIES: u32 = 5;
const DEFAULT_INITIAL_BACKOFF_MS: u64 = 500;
const DEFAULT_MAX_BACKOFF_MS: u64 = 30_000;
const DEFAULT_BACKOFF_MULTIPLIER: f64 = 2.0;
const DEFAULT_POOL_WAIT_POLL_MS: u64 = 250;

const DEFAULT_TREE_DEPTH: u32 = 16;
const DEFAULT_LARGE_TREE_DEPTH: u32 = 21;
const DEFAULT_MIN_MEMBERS: usize = 10;
const DEFAULT_PROOF_WRITE_CHUNK: usize = 500;

const DEFAULT_FALSE_POSITIVE_RATE: f64 = 0.01;

const DEFAULT_TREE_BATCH_SIZE: usize = 10;
const DEFAULT_SOURCE_MESSAGE: &str = "zkp-group-credentials: prove membership of this address";

/// Configuration for the indexer, client and verifier.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub chains: Vec<ChainConfig>,
    #[serde(default)]
    pub contracts: Vec<ContractConfig>,
    #[serde(default)]
    pub sync: SyncConfig,
    #[serde(default)]
    pub tree: TreeConfig,
    #[serde(default)]
    pub bloom: BloomConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub groups: Vec<GroupConfig>,
    #[serde(default)]
    pub client: ClientConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChainConfig {
    pub name: String,
    /// One pooled RPC client is created per URL.
    pub rpc_urls: Vec<String>,
    /// Environment variable substituted for `{api_key}` in the URLs.
    #[serde(default)]
    pub api_key_env: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContractConfig {
    pub id: String,
    pub chain: String,
    pub address: String,
    #[serde(default)]
    pub deployed_block: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    #[serde(default = "default_initial_batch_size")]
    pub initial_batch_size: u64,
    #[serde(default = "default_max_batch_size")]
    pub max_batch_size: u64,
    #[serde(default = "default_grow_after_successes")]
    pub grow_after_successes: u32,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
    #[serde(default = "default_pool_wait_poll_ms")]
    pub pool_wait_poll_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TreeConfig {
    #[serde(default = "default_tree_depth")]
    pub depth: u32,
    #[serde(default = "default_large_tree_depth")]
    pub large_depth: u32,
    #[serde(default = "default_min_members")]
    pub min_members: usize,
    #[serde(default)]
    pub hash: HashFunction,
    #[serde(default = "default_proof_write_chunk")]
    pub proof_write_chunk: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BloomConfig {
    #[serde(default = "default_false_positive_rate")]
    pub false_positive_rate: f64,
    #[serde(default)]
    pub num_bits: Option<u64>,
    #[serde(default)]
    pub num_hashes: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupConfig {
    pub id: String,
    pub handle: String,
    pub display_name: String,
    pub rule: MemberSelectionRule,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    #[serde(default)]
    pub api_url: Option<String>,
    #[serde(default = "default_tree_batch_size")]
    pub tree_batch_size: usize,
    #[serde(default = "default_source_message")]
    pub source_message: String,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            initial_batch_size: DEFAULT_INITIAL_BATCH_SIZE,
            max_batch_size: DEFAULT_MAX_BATCH_SIZE,
            grow_after_successes: DEFAULT_GROW_AFTER_SUCCESSES,
            max_retries: DEFAULT_MAX_RETRIES,
            initial_backoff_ms: DEFAULT_INITIAL_BACKOFF_MS,
            max_backoff_ms: DEFAULT_MAX_BACKOFF_MS,
            backoff_multiplier: DEFAULT_BACKOFF_MULTIPLIER,
            pool_wait_poll_ms: DEFAULT_POOL_WAIT_POLL_MS,
        }
    }
}

impl Default for TreeConfig {
    fn default() -> Self {
        Self {
            depth: DEFAULT_TREE_DEPTH,
            large_depth: DEFAULT_LARGE_TREE_DEPTH,
            min_members: DEFAULT_MIN_MEMBERS,
            hash: HashFunction::default(),
            proof_write_chunk: DEFAULT_PROOF_WRITE_CHUNK,
        }
    }
}

impl Default for BloomConfig {
    fn default() -> Self {
        Self {
            false_positive_rate: DEFAULT_FALSE_POSITIVE_RATE,
            num_bits: None,
            num_hashes: None,
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
        }
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            api_url: None,
            tree_batch_size: DEFAULT_TREE_BATCH_SIZE,
            source_message: DEFAULT_SOURCE_MESSAGE.to_string(),
        }
    }
}

fn default_initial_batch_size() -> u64 {
    DEFAULT_INITIAL_BATCH_SIZE
}

fn default_max_batch_size() -> u64 {
    DEFAULT_MAX_BATCH_SIZE
}

fn default_grow_after_successes() -> u32 {
    DEFAULT_GROW_AFTER_SUCCESSES
}

fn default_max_retries() -> u32 {
    DEFAULT_MAX_RETRIES
}

fn default_initial_backoff_ms() -> u64 {
    DEFAULT_INITIAL_BACKOFF_MS
}

fn default_max_backoff_ms() -> u64 {
    DEFAULT_MAX_BACKOFF_MS
}

fn default_backoff_multiplier() -> f64 {
    DEFAULT_BACKOFF_MULTIPLIER
}

fn default_pool_wait_poll_ms() -> u64 {
    DEFAULT_POOL_WAIT_POLL_MS
}

fn default_tree_depth() -> u32 {
    DEFAULT_TREE_DEPTH
}

fn default_large_tree_depth() -> u32 {
    DEFAULT_LARGE_TREE_DEPTH
}

fn default_min_members() -> usize {
    DEFAULT_MIN_MEMBERS
}

fn default_proof_write_chunk() -> usize {
    DEFAULT_PROOF_WRITE_CHUNK
}

fn default_false_positive_rate() -> f64 {
    DEFAULT_FALSE_POSITIVE_RATE
}

fn default_data_dir() -> PathBuf {
    PathBuf::from(".data")
}

fn default_tree_batch_size() -> usize {
    DEFAULT_TREE_BATCH_SIZE
}

fn default_source_message() -> String {
    DEFAULT_SOURCE_MESSAGE.to_string()
}

fn invalid(field: impl Into<String>, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        field: field.into(),
        reason: reason.into(),
    }
}

impl ChainConfig {
    /// RPC URLs with `{api_key}` substituted from the environment.
    pub fn resolved_urls(&self) -> Result<Vec<String>, ConfigError> {
        let key = match &self.api_key_env {
            Some(var) => Some(std::env::var(var).map_err(|_| ConfigError::MissingEnv(var.clone()))?),
            None => None,
        };
        self.rpc_urls
            .iter()
            .map(|url| match (&key, url.contains(API_KEY_PLACEHOLDER)) {
                (Some(key), true) => Ok(url.replace(API_KEY_PLACEHOLDER, key)),
                (None, true) => Err(invalid(
                    format!("chains.{}.rpc_urls", self.name),
                    "URL has an {api_key} placeholder but no api_key_env",
                )),
                (_, false) => Ok(url.clone()),
            })
            .collect()
    }
}

impl GroupConfig {
    pub fn to_group(&self) -> Group {
        Group {
            id: self.id.clone(),
            handle: self.handle.clone(),
            display_name: self.display_name.clone(),
            rule: self.rule.clone(),
        }
    }
}

impl SyncConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.initial_batch_size == 0 {
            return Err(invalid("sync.initial_batch_size", "must be positive"));
        }
        if self.max_batch_size < self.initial_batch_size {
            return Err(invalid(
                "sync.max_batch_size",
                "must be at least initial_batch_size",
            ));
        }
        if self.backoff_multiplier < 1.0 {
            return Err(invalid("sync.backoff_multiplier", "must be >= 1.0"));
        }
        if self.max_backoff_ms < self.initial_backoff_ms {
            return Err(invalid(
                "sync.max_backoff_ms",
                "must be at least initial_backoff_ms",
            ));
        }
        Ok(())
    }
}

impl TreeConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        for (field, depth) in [("tree.depth", self.depth), ("tree.large_depth", self.large_depth)] {
            if !(2..=MAX_DEPTH).contains(&depth) {
                return Err(invalid(field, format!("must be in 2..={MAX_DEPTH}")));
            }
        }
        if self.large_depth < self.depth {
            return Err(invalid("tree.large_depth", "must be at least tree.depth"));
        }
        if self.min_members == 0 {
            return Err(invalid("tree.min_members", "must be positive"));
        }
        if self.proof_write_chunk == 0 {
            return Err(invalid("tree.proof_write_chunk", "must be positive"));
        }
        Ok(())
    }
}

impl BloomConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if !(self.false_positive_rate > 0.0 && self.false_positive_rate < 1.0) {
            return Err(invalid("bloom.false_positive_rate", "must be in (0, 1)"));
        }
        if self.num_bits.is_some() != self.num_hashes.is_some() {
            return Err(invalid(
                "bloom",
                "num_bits and num_hashes must be set together",
            ));
        }
        if self.num_bits == Some(0) || self.num_hashes == Some(0) {
            return Err(invalid("bloom", "num_bits and num_hashes must be positive"));
        }
        Ok(())
    }
}

impl Config {
    pub fn load_from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        Ok(config)
    }

    /// Loads from `ZKP_CONFIG` (or `config.toml`) and validates.
    pub fn from_env() -> Result<Self> {
        let path = std::env::var(CONFIG_ENV).unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
        let config = Self::load_from_file(Path::new(&path))?;
        config
            .validate()
            .with_context(|| format!("Invalid configuration in {path}"))?;
        Ok(config)
    }

    pub fn save_to_file(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize config to TOML")?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }

        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        Ok(())
    }

    pub fn chain(&self, name: &str) -> Option<&ChainConfig> {
        self.chains.iter().find(|c| c.name == name)
    }

    pub fn contract(&self, id: &str) -> Option<&ContractConfig> {
        self.contracts.iter().find(|c| c.id == id)
    }

    pub fn group_list(&self) -> Vec<Group> {
        self.groups.iter().map(GroupConfig::to_group).collect()
    }

    /// Checks cross references and value ranges.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut chain_names = HashSet::new();
        for chain in &self.chains {
            if chain.name.is_empty() {
                return Err(ConfigError::Missing("chains.name".to_string()));
            }
            if !chain_names.insert(chain.name.as_str()) {
                return Err(invalid("chains.name", format!("duplicate chain {}", chain.name)));
            }
            if chain.rpc_urls.is_empty() {
                return Err(ConfigError::Missing(format!("chains.{}.rpc_urls", chain.name)));
            }
            chain.resolved_urls()?;
        }

        let mut contract_ids = HashSet::new();
        for contract in &self.contracts {
            if !contract_ids.insert(contract.id.as_str()) {
                return Err(invalid("contracts.id", format!("duplicate contract {}", contract.id)));
            }
            if self.chain(&contract.chain).is_none() {
                return Err(invalid(
                    format!("contracts.{}.chain", contract.id),
                    format!("unknown chain {}", contract.chain),
                ));
            }
            parse_address(&contract.address).map_err(|e| {
                invalid(format!("contracts.{}.address", contract.id), e.to_string())
            })?;
        }

        let mut group_ids = HashSet::new();
        for group in &self.groups {
            if !group_ids.insert(group.id.as_str()) {
                return Err(invalid("groups.id", format!("duplicate group {}", group.id)));
            }
            if let Some(contract) = group.rule.contract() {
                if self.contract(contract).is_none() {
                    return Err(invalid(
                        format!("groups.{}.rule.contract", group.id),
                        format!("unknown contract {contract}"),
                    ));
                }
            }
        }

        self.sync.validate()?;
        self.tree.validate()?;
        self.bloom.validate()?;

        if self.client.tree_batch_size == 0 {
            return Err(invalid("client.tree_batch_size", "must be positive"));
        }
        if self.client.source_message.is_empty() {
            return Err(ConfigError::Missing("client.source_message".to_string()));
        }
        Ok(())
    }
}
