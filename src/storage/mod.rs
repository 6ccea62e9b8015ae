//! Persisted indexer state and the credential registry.
//!
//! Backends store the per-contract sync checkpoint, the ordered event log,
//! published tree versions with their proof rows and filters, the active
//! tree pointer per group, and verified credentials.

pub mod memory;
pub mod sled;

use async_trait::async_trait;
use ethers::types::Address;

use crate::error::StorageError;
use crate::types::{BloomRecord, Credential, ProofRecord, SyncCheckpoint, TransferEvent, TreeRecord};
use crate::Node;

pub type StorageResult<T> = Result<T, StorageError>;

/// Storage interface shared by the indexer, the API surface and the verifier.
#[async_trait]
pub trait CredentialStorage: Send + Sync {
    // ---- sync state ----

    async fn get_checkpoint(&self, contract_id: &str) -> StorageResult<Option<SyncCheckpoint>>;

    /// Appends `events` and then advances the checkpoint to `last_block`.
    ///
    /// Events already present under their natural key are skipped. Returns the
    /// number of newly stored events.
    async fn commit_batch(
        &self,
        contract_id: &str,
        events: &[TransferEvent],
        last_block: u64,
    ) -> StorageResult<usize>;

    /// All events of a contract in replay order.
    async fn events(&self, contract_id: &str) -> StorageResult<Vec<TransferEvent>>;

    /// Events with `from_block <= block_number <= to_block`, in replay order.
    async fn events_in_range(
        &self,
        contract_id: &str,
        from_block: u64,
        to_block: u64,
    ) -> StorageResult<Vec<TransferEvent>>;

    // ---- trees ----

    async fn save_tree(&self, tree: &TreeRecord) -> StorageResult<()>;

    async fn get_tree(&self, tree_id: &str) -> StorageResult<Option<TreeRecord>>;

    async fn save_proofs(&self, proofs: &[ProofRecord]) -> StorageResult<()>;

    async fn get_proof(&self, tree_id: &str, address: &Address) -> StorageResult<Option<ProofRecord>>;

    async fn save_bloom(&self, bloom: &BloomRecord) -> StorageResult<()>;

    async fn get_bloom(&self, tree_id: &str) -> StorageResult<Option<BloomRecord>>;

    /// Points the group at `tree_id`. Returns the previously active tree id.
    async fn activate_tree(&self, group_id: &str, tree_id: &str) -> StorageResult<Option<String>>;

    async fn active_tree_id(&self, group_id: &str) -> StorageResult<Option<String>>;

    /// `(group_id, tree_id)` for every group with an active tree.
    async fn active_trees(&self) -> StorageResult<Vec<(String, String)>>;

    /// Ids of every stored version of a group, active or not, sorted.
    async fn tree_ids(&self, group_id: &str) -> StorageResult<Vec<String>>;

    /// Deletes a tree version with its proofs and filter. Returns the number
    /// of proof rows removed.
    async fn retire_tree(&self, tree_id: &str) -> StorageResult<usize>;

    // ---- credentials ----

    async fn get_credential(&self, account: &Address, group_id: &str) -> StorageResult<Option<Credential>>;

    async fn binding_used(&self, group_id: &str, binding_value: &Node) -> StorageResult<bool>;

    /// Stores a credential and marks its binding value as used.
    async fn save_credential(&self, credential: &Credential) -> StorageResult<()>;

    async fn get_stats(&self) -> StorageResult<StorageStats>;
}

/// Convenience lookup of the active tree record for a group.
pub async fn active_tree(
    storage: &dyn CredentialStorage,
    group_id: &str,
) -> StorageResult<Option<TreeRecord>> {
    match storage.active_tree_id(group_id).await? {
        Some(tree_id) => storage.get_tree(&tree_id).await,
        None => Ok(None),
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StorageStats {
    pub contracts: u64,
    pub events: u64,
    pub trees: u64,
    pub active_trees: u64,
    pub proofs: u64,
    pub blooms: u64,
    pub credentials: u64,
}

pub use self::sled::SledStorage;
pub use memory::MemoryStorage;
