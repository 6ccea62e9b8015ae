//! Error types for the indexing, tree, client and verification subsystems.

use ethers::types::{Address, U256};
use thiserror::Error;

/// Errors surfaced by an RPC log provider.
#[derive(Error, Debug, Clone)]
pub enum RpcError {
    /// The provider refused the block range because the result set is too
    /// large. Handled by shrinking the range, never surfaced to callers.
    #[error("response too large for blocks {from}..={to}: {message}")]
    ResponseTooLarge { from: u64, to: u64, message: String },

    /// Network or provider hiccup, safe to retry.
    #[error("transient RPC failure: {0}")]
    Transient(String),

    /// Malformed response or request that will not succeed on retry.
    #[error("RPC failure: {0}")]
    Fatal(String),
}

impl RpcError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, RpcError::Transient(_))
    }
}

/// Errors from a contract sync run.
#[derive(Error, Debug)]
pub enum SyncError {
    #[error("retries exhausted after {attempts} attempts at block {from_block}: {last_error}")]
    RetryExhausted {
        attempts: u32,
        from_block: u64,
        last_error: String,
    },

    #[error("block {block} still too large at the minimum batch size")]
    UnsplittableRange { block: u64 },

    #[error("invalid contract configuration: {0}")]
    InvalidContract(String),

    #[error(transparent)]
    Rpc(#[from] RpcError),

    #[error(transparent)]
    Ledger(#[from] LedgerError),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Data-integrity failures during balance replay.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LedgerError {
    #[error("negative balance for {address:?} in {contract} at block {block}: has {balance}, sends {value}")]
    NegativeBalance {
        contract: String,
        address: Address,
        balance: U256,
        value: U256,
        block: u64,
    },

    #[error("burn of {value} exceeds total supply {supply} in {contract} at block {block}")]
    SupplyUnderflow {
        contract: String,
        supply: U256,
        value: U256,
        block: u64,
    },

    #[error("balance or supply overflow in {contract} at block {block}")]
    Overflow { contract: String, block: u64 },

    #[error("event ({block}, {tx_index}, {log_index}) replayed out of order in {contract}")]
    OutOfOrder {
        contract: String,
        block: u64,
        tx_index: u64,
        log_index: u64,
    },
}

/// Merkle accumulator construction failures.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TreeError {
    #[error("{members} members exceed the capacity {capacity} of a depth-{depth} tree")]
    CapacityExceeded {
        members: usize,
        capacity: usize,
        depth: u32,
    },

    #[error("{members} members is below the minimum of {minimum}")]
    TooFewMembers { members: usize, minimum: usize },

    #[error("unsupported tree depth {0}")]
    InvalidDepth(u32),

    #[error("leaf index {index} out of range for {leaves} leaves")]
    LeafIndexOutOfRange { index: usize, leaves: usize },

    #[error("leaf {0} is not in the tree")]
    LeafNotFound(String),

    #[error("malformed tree: {0}")]
    Malformed(String),
}

/// Invalid Bloom filter parameters or encodings.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BloomError {
    #[error("invalid bloom filter parameters: {0}")]
    InvalidParameters(String),

    #[error("sip keys must be {expected} bytes, got {actual}")]
    InvalidKeys { expected: usize, actual: usize },
}

/// Undecodable or inconsistent tree wire payloads.
#[derive(Error, Debug)]
pub enum WireError {
    #[error("protobuf decode failed: {0}")]
    Decode(#[from] prost::DecodeError),

    #[error("malformed payload: {0}")]
    Malformed(String),

    #[error(transparent)]
    Bloom(#[from] BloomError),

    #[error(transparent)]
    Tree(#[from] TreeError),
}

/// Missing or invalid configuration values; fatal at startup.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("missing required value: {0}")]
    Missing(String),

    #[error("invalid value for {field}: {reason}")]
    Invalid { field: String, reason: String },

    #[error("environment variable {0} is not set")]
    MissingEnv(String),
}

/// Storage backend failures.
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("storage backend error: {0}")]
    Backend(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("record not found: {0}")]
    NotFound(String),
}

/// Failures of a group resolution or publication cycle.
#[derive(Error, Debug)]
pub enum IndexerError {
    #[error(transparent)]
    Sync(#[from] SyncError),

    #[error(transparent)]
    Ledger(#[from] LedgerError),

    #[error(transparent)]
    Tree(#[from] TreeError),

    #[error(transparent)]
    Bloom(#[from] BloomError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Rpc(#[from] RpcError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("unknown {kind} {id}")]
    Unknown { kind: &'static str, id: String },

    #[error("background task failed: {0}")]
    Task(String),
}

/// Failures talking to the credential API.
#[derive(Error, Debug)]
pub enum ApiError {
    #[error("HTTP request failed: {0}")]
    Http(String),

    #[error("failed to decode response: {0}")]
    Decode(String),
}

/// Reasons the verifier refuses an attestation.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Rejection {
    #[error("binding signature does not match account {0:?}")]
    BadBindingSignature(Address),

    #[error("unknown group {0}")]
    UnknownGroup(String),

    #[error("merkle root is not the active root for group {0}")]
    StaleRoot(String),

    #[error("zero-knowledge proof failed verification")]
    InvalidProof,

    #[error("account already holds a credential for group {0}")]
    DuplicateCredential(String),

    #[error("binding value already used for group {0}")]
    DuplicateBinding(String),

    #[error("malformed submission: {0}")]
    Malformed(String),
}

/// Outcome of a failed verification: a refusal or a backend failure.
#[derive(Error, Debug)]
pub enum VerifierError {
    #[error(transparent)]
    Rejected(#[from] Rejection),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Failures of the attestation state machine.
#[derive(Error, Debug)]
pub enum AttestationError {
    #[error("signing failed: {0}")]
    Signing(String),

    #[error("witness construction failed: {0}")]
    Witness(String),

    #[error("proof generation failed: {0}")]
    Proving(String),

    #[error("proving worker stopped before answering")]
    WorkerGone,

    #[error("step {step} is not valid from state {state}")]
    InvalidTransition {
        step: &'static str,
        state: &'static str,
    },

    #[error("submission failed: {0}")]
    Submission(#[from] ApiError),

    #[error("attestation rejected: {0}")]
    Rejected(String),
}
