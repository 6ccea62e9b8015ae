//! Data model shared by the indexer, the client and the verifier.

use crate::bloom::BloomFilter;
use crate::hasher::HashFunction;
use crate::utils::{bytes_to_field, field_to_bytes, parse_node_hex, poseidon_hash, unix_timestamp};
use crate::Node;
use anyhow::{Context, Result};
use ethers::types::{Address, U256};
use ethers::utils::keccak256;
use log::debug;
use serde::{Deserialize, Serialize};

pub const HASH_SIZE: usize = 32;

/// Position of a log in the chain; the natural replay order.
///
/// Field order makes the derived `Ord` compare block, then transaction, then
/// log index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EventKey {
    pub block_number: u64,
    pub tx_index: u64,
    pub log_index: u64,
}

impl EventKey {
    pub const ENCODED_LEN: usize = 24;

    /// Big-endian encoding whose byte order matches `Ord`, for range scans.
    #[must_use]
    pub fn to_bytes(&self) -> [u8; Self::ENCODED_LEN] {
        let mut out = [0u8; Self::ENCODED_LEN];
        out[..8].copy_from_slice(&self.block_number.to_be_bytes());
        out[8..16].copy_from_slice(&self.tx_index.to_be_bytes());
        out[16..].copy_from_slice(&self.log_index.to_be_bytes());
        out
    }

    /// Smallest key in `block_number`.
    pub fn block_start(block_number: u64) -> Self {
        Self {
            block_number,
            tx_index: 0,
            log_index: 0,
        }
    }
}

/// One ERC-20 style `Transfer` log. Immutable once ingested.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferEvent {
    pub contract_id: String,
    pub from: Address,
    pub to: Address,
    pub value: U256,
    pub block_number: u64,
    pub tx_index: u64,
    pub log_index: u64,
}

impl TransferEvent {
    pub fn key(&self) -> EventKey {
        EventKey {
            block_number: self.block_number,
            tx_index: self.tx_index,
            log_index: self.log_index,
        }
    }
}

/// Last block of a contract whose events are durably stored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncCheckpoint {
    pub contract_id: String,
    pub last_block: u64,
    pub updated_at: u64,
}

/// Running balance of one address in one contract.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Balance {
    pub contract_id: String,
    pub address: Address,
    pub balance: U256,
    pub last_updated_block: u64,
}

/// How a group's members are derived.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MemberSelectionRule {
    /// Addresses whose balance ever exceeded 0.1% of supply.
    Whale { contract: String },
    /// The first 5% of distinct recipients.
    EarlyHolder { contract: String },
    /// A fixed allow-list.
    Static { addresses: Vec<Address> },
}

impl MemberSelectionRule {
    pub fn contract(&self) -> Option<&str> {
        match self {
            MemberSelectionRule::Whale { contract } | MemberSelectionRule::EarlyHolder { contract } => {
                Some(contract)
            }
            MemberSelectionRule::Static { .. } => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Group {
    pub id: String,
    pub handle: String,
    pub display_name: String,
    pub rule: MemberSelectionRule,
}

/// A published tree version together with its full layers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TreeRecord {
    pub tree_id: String,
    pub group_id: String,
    pub root: Node,
    pub depth: u32,
    pub hash: HashFunction,
    pub member_count: usize,
    pub created_at: u64,
    pub layers: Vec<Vec<Node>>,
}

/// Stored proof row for one (address, tree).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProofRecord {
    pub tree_id: String,
    pub address: Address,
    pub merkle_root: Node,
    pub path: Vec<Node>,
    pub path_indices: Vec<u8>,
}

/// The Bloom filter paired with one tree version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BloomRecord {
    pub tree_id: String,
    pub group_id: String,
    pub filter: BloomFilter,
}

/// A verified membership bound to an account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credential {
    pub account: Address,
    pub group_id: String,
    pub proof: ProofBlob,
    pub binding_signature: String,
    pub binding_value: Node,
    pub verified_at: u64,
}

/// Identifier of a tree version: the group plus the root it commits to.
pub fn tree_id(group_id: &str, root: &Node) -> String {
    format!("{}:{}", group_id, hex::encode(root))
}

/// Binding value `H(H(r, s), root)` using Poseidon.
///
/// ECDSA signatures here are RFC 6979 deterministic, so one key signing the
/// fixed source message always yields the same value for a given root. The
/// verifier uses it to refuse a second credential from the same address
/// without learning the address.
///
/// ```
/// use zkp_group_credentials::types::compute_binding_value;
///
/// let a = compute_binding_value(&[1u8; 32], &[2u8; 32], &[3u8; 32]);
/// let b = compute_binding_value(&[1u8; 32], &[2u8; 32], &[4u8; 32]);
/// assert_ne!(a, b);
/// ```
#[must_use]
pub fn compute_binding_value(r: &Node, s: &Node, root: &Node) -> Node {
    let signature = poseidon_hash(bytes_to_field(r), bytes_to_field(s));
    field_to_bytes(poseidon_hash(signature, bytes_to_field(root)))
}

/// The opaque proof blob handed to the verifier.
///
/// Carries the public inputs alongside the raw halo2 proof so the verifier
/// can check it without further context.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProofBlob {
    pub group_id: String,
    /// Merkle root as hex string (32 bytes = 64 hex chars).
    pub merkle_root: String,
    /// Binding value as hex string (32 bytes = 64 hex chars).
    pub binding_value: String,
    /// Raw ZK-SNARK proof bytes
    pub zk_proof: Vec<u8>,
    /// Unix timestamp when the proof was generated
    pub created_at: u64,
}

impl ProofBlob {
    const TIMESTAMP_TOLERANCE_SECS: u64 = 300;
    const TIMESTAMP_MAX_AGE_SECS: u64 = 86400;

    pub fn new(group_id: &str, merkle_root: &Node, binding_value: &Node, zk_proof: Vec<u8>) -> Self {
        Self {
            group_id: group_id.to_string(),
            merkle_root: hex::encode(merkle_root),
            binding_value: hex::encode(binding_value),
            zk_proof,
            created_at: unix_timestamp(),
        }
    }

    /// Canonical bytes the binding signature covers.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).context("Failed to serialize proof blob")
    }

    /// keccak256 of [`ProofBlob::to_bytes`].
    pub fn digest(&self) -> Result<[u8; 32]> {
        Ok(keccak256(self.to_bytes()?))
    }

    pub fn root(&self) -> Result<Node> {
        parse_node_hex(&self.merkle_root).context("Invalid merkle root in proof blob")
    }

    pub fn binding(&self) -> Result<Node> {
        parse_node_hex(&self.binding_value).context("Invalid binding value in proof blob")
    }

    /// Structural checks: non-empty fields, well-formed hex, sane timestamp.
    ///
    /// # Errors
    /// Returns an error describing the first failed check.
    pub fn validate(&self) -> Result<()> {
        debug!(
            "Validating proof blob for group {} ({} proof bytes)",
            self.group_id,
            self.zk_proof.len()
        );

        if self.group_id.is_empty() {
            return Err(anyhow::anyhow!("Group id cannot be empty."));
        }
        if self.zk_proof.is_empty() {
            return Err(anyhow::anyhow!(
                "ZK proof cannot be empty. The proof data is missing."
            ));
        }

        let now = unix_timestamp();
        if self.created_at > now + Self::TIMESTAMP_TOLERANCE_SECS {
            return Err(anyhow::anyhow!(
                "Timestamp is too far in the future: {} (current: {}, tolerance: {}s).",
                self.created_at,
                now,
                Self::TIMESTAMP_TOLERANCE_SECS
            ));
        }
        if now > self.created_at + Self::TIMESTAMP_MAX_AGE_SECS {
            return Err(anyhow::anyhow!(
                "Timestamp is too old: {} (current: {}, max age: {}s). Please generate a fresh proof.",
                self.created_at,
                now,
                Self::TIMESTAMP_MAX_AGE_SECS
            ));
        }

        self.root()?;
        self.binding()?;
        Ok(())
    }
}

/// What the client posts to `/attestations`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttestationSubmission {
    pub proof: ProofBlob,
    pub bound_account: Address,
    /// Hex-encoded 65-byte signature over the proof digest.
    pub binding_signature: String,
}

/// Verifier answer to a submission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttestationResponse {
    pub accepted: bool,
    #[serde(default)]
    pub reason: Option<String>,
}
