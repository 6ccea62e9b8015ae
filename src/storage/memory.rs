//! In-memory storage, used by tests and one-shot tree builds.

use async_trait::async_trait;
use ethers::types::Address;
use std::collections::btree_map::Entry;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::RwLock;

use super::{CredentialStorage, StorageResult, StorageStats};
use crate::types::{
    BloomRecord, Credential, EventKey, ProofRecord, SyncCheckpoint, TransferEvent, TreeRecord,
};
use crate::utils::unix_timestamp;
use crate::Node;

/// Thread-safe in-memory storage; each map sits behind its own `RwLock`.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    checkpoints: Arc<RwLock<HashMap<String, SyncCheckpoint>>>,
    events: Arc<RwLock<HashMap<String, BTreeMap<EventKey, TransferEvent>>>>,
    trees: Arc<RwLock<HashMap<String, TreeRecord>>>,
    proofs: Arc<RwLock<HashMap<String, HashMap<Address, ProofRecord>>>>,
    blooms: Arc<RwLock<HashMap<String, BloomRecord>>>,
    active: Arc<RwLock<BTreeMap<String, String>>>,
    credentials: Arc<RwLock<HashMap<(String, Address), Credential>>>,
    bindings: Arc<RwLock<HashSet<(String, Node)>>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CredentialStorage for MemoryStorage {
    async fn get_checkpoint(&self, contract_id: &str) -> StorageResult<Option<SyncCheckpoint>> {
        Ok(self.checkpoints.read().await.get(contract_id).cloned())
    }

    async fn commit_batch(
        &self,
        contract_id: &str,
        events: &[TransferEvent],
        last_block: u64,
    ) -> StorageResult<usize> {
        let mut added = 0;
        {
            let mut log = self.events.write().await;
            let log = log.entry(contract_id.to_string()).or_default();
            for event in events {
                if let Entry::Vacant(slot) = log.entry(event.key()) {
                    slot.insert(event.clone());
                    added += 1;
                }
            }
        }

        let mut checkpoints = self.checkpoints.write().await;
        let checkpoint = checkpoints
            .entry(contract_id.to_string())
            .or_insert_with(|| SyncCheckpoint {
                contract_id: contract_id.to_string(),
                last_block,
                updated_at: 0,
            });
        checkpoint.last_block = checkpoint.last_block.max(last_block);
        checkpoint.updated_at = unix_timestamp();
        Ok(added)
    }

    async fn events(&self, contract_id: &str) -> StorageResult<Vec<TransferEvent>> {
        Ok(self
            .events
            .read()
            .await
            .get(contract_id)
            .map(|log| log.values().cloned().collect())
            .unwrap_or_default())
    }

    async fn events_in_range(
        &self,
        contract_id: &str,
        from_block: u64,
        to_block: u64,
    ) -> StorageResult<Vec<TransferEvent>> {
        let events = self.events.read().await;
        let Some(log) = events.get(contract_id) else {
            return Ok(Vec::new());
        };
        Ok(log
            .range(EventKey::block_start(from_block)..)
            .take_while(|(key, _)| key.block_number <= to_block)
            .map(|(_, event)| event.clone())
            .collect())
    }

    async fn save_tree(&self, tree: &TreeRecord) -> StorageResult<()> {
        self.trees
            .write()
            .await
            .insert(tree.tree_id.clone(), tree.clone());
        Ok(())
    }

    async fn get_tree(&self, tree_id: &str) -> StorageResult<Option<TreeRecord>> {
        Ok(self.trees.read().await.get(tree_id).cloned())
    }

    async fn save_proofs(&self, proofs: &[ProofRecord]) -> StorageResult<()> {
        let mut rows = self.proofs.write().await;
        for proof in proofs {
            rows.entry(proof.tree_id.clone())
                .or_default()
                .insert(proof.address, proof.clone());
        }
        Ok(())
    }

    async fn get_proof(&self, tree_id: &str, address: &Address) -> StorageResult<Option<ProofRecord>> {
        Ok(self
            .proofs
            .read()
            .await
            .get(tree_id)
            .and_then(|rows| rows.get(address))
            .cloned())
    }

    async fn save_bloom(&self, bloom: &BloomRecord) -> StorageResult<()> {
        self.blooms
            .write()
            .await
            .insert(bloom.tree_id.clone(), bloom.clone());
        Ok(())
    }

    async fn get_bloom(&self, tree_id: &str) -> StorageResult<Option<BloomRecord>> {
        Ok(self.blooms.read().await.get(tree_id).cloned())
    }

    async fn activate_tree(&self, group_id: &str, tree_id: &str) -> StorageResult<Option<String>> {
        Ok(self
            .active
            .write()
            .await
            .insert(group_id.to_string(), tree_id.to_string()))
    }

    async fn active_tree_id(&self, group_id: &str) -> StorageResult<Option<String>> {
        Ok(self.active.read().await.get(group_id).cloned())
    }

    async fn active_trees(&self) -> StorageResult<Vec<(String, String)>> {
        Ok(self
            .active
            .read()
            .await
            .iter()
            .map(|(group, tree)| (group.clone(), tree.clone()))
            .collect())
    }

    async fn tree_ids(&self, group_id: &str) -> StorageResult<Vec<String>> {
        let mut ids: Vec<String> = self
            .trees
            .read()
            .await
            .values()
            .filter(|tree| tree.group_id == group_id)
            .map(|tree| tree.tree_id.clone())
            .collect();
        ids.sort();
        Ok(ids)
    }

    async fn retire_tree(&self, tree_id: &str) -> StorageResult<usize> {
        let removed = self
            .proofs
            .write()
            .await
            .remove(tree_id)
            .map(|rows| rows.len())
            .unwrap_or(0);
        self.blooms.write().await.remove(tree_id);
        self.trees.write().await.remove(tree_id);
        Ok(removed)
    }

    async fn get_credential(&self, account: &Address, group_id: &str) -> StorageResult<Option<Credential>> {
        Ok(self
            .credentials
            .read()
            .await
            .get(&(group_id.to_string(), *account))
            .cloned())
    }

    async fn binding_used(&self, group_id: &str, binding_value: &Node) -> StorageResult<bool> {
        Ok(self
            .bindings
            .read()
            .await
            .contains(&(group_id.to_string(), *binding_value)))
    }

    async fn save_credential(&self, credential: &Credential) -> StorageResult<()> {
        self.credentials.write().await.insert(
            (credential.group_id.clone(), credential.account),
            credential.clone(),
        );
        self.bindings
            .write()
            .await
            .insert((credential.group_id.clone(), credential.binding_value));
        Ok(())
    }

    async fn get_stats(&self) -> StorageResult<StorageStats> {
        let events = self.events.read().await;
        let proofs = self.proofs.read().await;
        Ok(StorageStats {
            contracts: self.checkpoints.read().await.len() as u64,
            events: events.values().map(|log| log.len() as u64).sum(),
            trees: self.trees.read().await.len() as u64,
            active_trees: self.active.read().await.len() as u64,
            proofs: proofs.values().map(|rows| rows.len() as u64).sum(),
            blooms: self.blooms.read().await.len() as u64,
            credentials: self.credentials.read().await.len() as u64,
        })
    }
}
