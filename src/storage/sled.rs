//! Sled-backed persistent storage.
//!
//! Values are JSON. Keys are `<scope>\0<big-endian suffix>` so prefix and
//! range scans come back in replay order.

use async_trait::async_trait;
use ethers::types::Address;
use log::debug;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::path::Path;

use super::{CredentialStorage, StorageResult, StorageStats};
use crate::error::StorageError;
use crate::types::{
    BloomRecord, Credential, EventKey, ProofRecord, SyncCheckpoint, TransferEvent, TreeRecord,
};
use crate::utils::unix_timestamp;
use crate::Node;

const CHECKPOINTS_TREE: &str = "checkpoints";
const EVENTS_TREE: &str = "events";
const TREES_TREE: &str = "trees";
const PROOFS_TREE: &str = "proofs";
const BLOOMS_TREE: &str = "blooms";
const ACTIVE_TREE: &str = "active_trees";
const CREDENTIALS_TREE: &str = "credentials";
const BINDINGS_TREE: &str = "bindings";

/// The part of a stored [`TreeRecord`] needed to list a group's versions
/// without decoding its layers.
#[derive(Deserialize)]
struct TreeOwner {
    group_id: String,
}

#[derive(Debug, Clone)]
pub struct SledStorage {
    db: sled::Db,
    checkpoints: sled::Tree,
    events: sled::Tree,
    trees: sled::Tree,
    proofs: sled::Tree,
    blooms: sled::Tree,
    active: sled::Tree,
    credentials: sled::Tree,
    bindings: sled::Tree,
}

fn backend(context: &str) -> impl Fn(sled::Error) -> StorageError + '_ {
    move |e| StorageError::Backend(format!("{context}: {e}"))
}

impl SledStorage {
    /// Opens or creates the database under `path`.
    pub fn open<P: AsRef<Path>>(path: P) -> StorageResult<Self> {
        let db = sled::open(path).map_err(backend("Failed to open sled db"))?;
        let open = |name: &str| {
            db.open_tree(name)
                .map_err(|e| StorageError::Backend(format!("Failed to open {name} tree: {e}")))
        };

        Ok(Self {
            checkpoints: open(CHECKPOINTS_TREE)?,
            events: open(EVENTS_TREE)?,
            trees: open(TREES_TREE)?,
            proofs: open(PROOFS_TREE)?,
            blooms: open(BLOOMS_TREE)?,
            active: open(ACTIVE_TREE)?,
            credentials: open(CREDENTIALS_TREE)?,
            bindings: open(BINDINGS_TREE)?,
            db,
        })
    }

    pub async fn flush(&self) -> StorageResult<()> {
        self.db
            .flush_async()
            .await
            .map_err(backend("Failed to flush db"))?;
        Ok(())
    }

    fn serialize<T: Serialize>(value: &T) -> StorageResult<Vec<u8>> {
        serde_json::to_vec(value).map_err(|e| StorageError::Serialization(e.to_string()))
    }

    fn deserialize<T: DeserializeOwned>(bytes: &[u8]) -> StorageResult<T> {
        serde_json::from_slice(bytes).map_err(|e| StorageError::Serialization(e.to_string()))
    }

    fn scoped_key(scope: &str, suffix: &[u8]) -> Vec<u8> {
        let mut key = Vec::with_capacity(scope.len() + 1 + suffix.len());
        key.extend_from_slice(scope.as_bytes());
        key.push(0);
        key.extend_from_slice(suffix);
        key
    }

    fn get<T: DeserializeOwned>(tree: &sled::Tree, key: &[u8]) -> StorageResult<Option<T>> {
        match tree.get(key).map_err(backend("Failed to read record"))? {
            Some(bytes) => Ok(Some(Self::deserialize(&bytes)?)),
            None => Ok(None),
        }
    }

    fn collect<T: DeserializeOwned>(
        iter: impl Iterator<Item = sled::Result<(sled::IVec, sled::IVec)>>,
    ) -> StorageResult<Vec<T>> {
        iter.map(|item| {
            let (_, value) = item.map_err(backend("Failed to iterate records"))?;
            Self::deserialize(&value)
        })
        .collect()
    }
}

#[async_trait]
impl CredentialStorage for SledStorage {
    async fn get_checkpoint(&self, contract_id: &str) -> StorageResult<Option<SyncCheckpoint>> {
        Self::get(&self.checkpoints, contract_id.as_bytes())
    }

    async fn commit_batch(
        &self,
        contract_id: &str,
        events: &[TransferEvent],
        last_block: u64,
    ) -> StorageResult<usize> {
        let mut batch = sled::Batch::default();
        let mut added = 0;
        for event in events {
            let key = Self::scoped_key(contract_id, &event.key().to_bytes());
            if !self
                .events
                .contains_key(&key)
                .map_err(backend("Failed to check event"))?
            {
                batch.insert(key, Self::serialize(event)?);
                added += 1;
            }
        }
        self.events
            .apply_batch(batch)
            .map_err(backend("Failed to append events"))?;
        self.events
            .flush_async()
            .await
            .map_err(backend("Failed to flush events"))?;

        // The checkpoint is written only once the events are durable.
        let previous = self.get_checkpoint(contract_id).await?;
        let checkpoint = SyncCheckpoint {
            contract_id: contract_id.to_string(),
            last_block: previous.map_or(last_block, |c| c.last_block.max(last_block)),
            updated_at: unix_timestamp(),
        };
        self.checkpoints
            .insert(contract_id.as_bytes(), Self::serialize(&checkpoint)?)
            .map_err(backend("Failed to save checkpoint"))?;
        self.checkpoints
            .flush_async()
            .await
            .map_err(backend("Failed to flush checkpoint"))?;

        debug!(
            "Committed {} new events for {} through block {}",
            added, contract_id, checkpoint.last_block
        );
        Ok(added)
    }

    async fn events(&self, contract_id: &str) -> StorageResult<Vec<TransferEvent>> {
        Self::collect(self.events.scan_prefix(Self::scoped_key(contract_id, &[])))
    }

    async fn events_in_range(
        &self,
        contract_id: &str,
        from_block: u64,
        to_block: u64,
    ) -> StorageResult<Vec<TransferEvent>> {
        let prefix = Self::scoped_key(contract_id, &[]);
        let start = Self::scoped_key(contract_id, &EventKey::block_start(from_block).to_bytes());
        let mut events = Vec::new();
        for item in self.events.range(start..) {
            let (key, value) = item.map_err(backend("Failed to iterate events"))?;
            if !key.starts_with(&prefix) {
                break;
            }
            let event: TransferEvent = Self::deserialize(&value)?;
            if event.block_number > to_block {
                break;
            }
            events.push(event);
        }
        Ok(events)
    }

    async fn save_tree(&self, tree: &TreeRecord) -> StorageResult<()> {
        self.trees
            .insert(tree.tree_id.as_bytes(), Self::serialize(tree)?)
            .map_err(backend("Failed to save tree"))?;
        Ok(())
    }

    async fn get_tree(&self, tree_id: &str) -> StorageResult<Option<TreeRecord>> {
        Self::get(&self.trees, tree_id.as_bytes())
    }

    async fn save_proofs(&self, proofs: &[ProofRecord]) -> StorageResult<()> {
        let mut batch = sled::Batch::default();
        for proof in proofs {
            batch.insert(
                Self::scoped_key(&proof.tree_id, proof.address.as_bytes()),
                Self::serialize(proof)?,
            );
        }
        self.proofs
            .apply_batch(batch)
            .map_err(backend("Failed to save proofs"))?;
        Ok(())
    }

    async fn get_proof(&self, tree_id: &str, address: &Address) -> StorageResult<Option<ProofRecord>> {
        Self::get(&self.proofs, &Self::scoped_key(tree_id, address.as_bytes()))
    }

    async fn save_bloom(&self, bloom: &BloomRecord) -> StorageResult<()> {
        self.blooms
            .insert(bloom.tree_id.as_bytes(), Self::serialize(bloom)?)
            .map_err(backend("Failed to save bloom filter"))?;
        Ok(())
    }

    async fn get_bloom(&self, tree_id: &str) -> StorageResult<Option<BloomRecord>> {
        Self::get(&self.blooms, tree_id.as_bytes())
    }

    async fn activate_tree(&self, group_id: &str, tree_id: &str) -> StorageResult<Option<String>> {
        // New data must be durable before the pointer moves to it.
        self.db.flush_async().await.map_err(backend("Failed to flush db"))?;
        let previous = self
            .active
            .insert(group_id.as_bytes(), tree_id.as_bytes())
            .map_err(backend("Failed to activate tree"))?;
        self.active
            .flush_async()
            .await
            .map_err(backend("Failed to flush active trees"))?;
        Ok(previous.map(|v| String::from_utf8_lossy(&v).into_owned()))
    }

    async fn active_tree_id(&self, group_id: &str) -> StorageResult<Option<String>> {
        Ok(self
            .active
            .get(group_id.as_bytes())
            .map_err(backend("Failed to read active tree"))?
            .map(|v| String::from_utf8_lossy(&v).into_owned()))
    }

    async fn active_trees(&self) -> StorageResult<Vec<(String, String)>> {
        self.active
            .iter()
            .map(|item| {
                let (group, tree) = item.map_err(backend("Failed to iterate active trees"))?;
                Ok((
                    String::from_utf8_lossy(&group).into_owned(),
                    String::from_utf8_lossy(&tree).into_owned(),
                ))
            })
            .collect()
    }

    async fn tree_ids(&self, group_id: &str) -> StorageResult<Vec<String>> {
        let mut ids = Vec::new();
        for item in self.trees.iter() {
            let (key, value) = item.map_err(backend("Failed to iterate trees"))?;
            let owner: TreeOwner = Self::deserialize(&value)?;
            if owner.group_id == group_id {
                ids.push(String::from_utf8_lossy(&key).into_owned());
            }
        }
        Ok(ids)
    }

    async fn retire_tree(&self, tree_id: &str) -> StorageResult<usize> {
        let mut batch = sled::Batch::default();
        let mut removed = 0;
        for item in self.proofs.scan_prefix(Self::scoped_key(tree_id, &[])).keys() {
            batch.remove(item.map_err(backend("Failed to scan proofs"))?);
            removed += 1;
        }
        self.proofs
            .apply_batch(batch)
            .map_err(backend("Failed to delete proofs"))?;
        self.blooms
            .remove(tree_id.as_bytes())
            .map_err(backend("Failed to delete bloom filter"))?;
        self.trees
            .remove(tree_id.as_bytes())
            .map_err(backend("Failed to delete tree"))?;
        Ok(removed)
    }

    async fn get_credential(&self, account: &Address, group_id: &str) -> StorageResult<Option<Credential>> {
        Self::get(&self.credentials, &Self::scoped_key(group_id, account.as_bytes()))
    }

    async fn binding_used(&self, group_id: &str, binding_value: &Node) -> StorageResult<bool> {
        self.bindings
            .contains_key(Self::scoped_key(group_id, binding_value))
            .map_err(backend("Failed to read binding"))
    }

    async fn save_credential(&self, credential: &Credential) -> StorageResult<()> {
        self.credentials
            .insert(
                Self::scoped_key(&credential.group_id, credential.account.as_bytes()),
                Self::serialize(credential)?,
            )
            .map_err(backend("Failed to save credential"))?;
        self.bindings
            .insert(
                Self::scoped_key(&credential.group_id, &credential.binding_value),
                Vec::new(),
            )
            .map_err(backend("Failed to save binding"))?;
        self.db.flush_async().await.map_err(backend("Failed to flush db"))?;
        Ok(())
    }

    async fn get_stats(&self) -> StorageResult<StorageStats> {
        Ok(StorageStats {
            contracts: self.checkpoints.len() as u64,
            events: self.events.len() as u64,
            trees: self.trees.len() as u64,
            active_trees: self.active.len() as u64,
            proofs: self.proofs.len() as u64,
            blooms: self.blooms.len() as u64,
            credentials: self.credentials.len() as u64,
        })
    }
}
