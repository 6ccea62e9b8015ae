//! Builds and publishes a group's tree, proofs and Bloom filter.
//!
//! A new version is written in full (tree, proof rows in chunks, filter)
//! before the group's active pointer moves to it. Only then is the previous
//! version deleted, together with any other version of the group left behind
//! by an interrupted publication.

use std::sync::Arc;

use ethers::types::Address;
use log::{debug, info, warn};

use crate::bloom::{BloomFilter, SipKeys};
use crate::config::{BloomConfig, TreeConfig};
use crate::error::{IndexerError, TreeError};
use crate::ethereum::address_to_leaf;
use crate::merkle::{MerkleTree, TreeBuilder};
use crate::storage::CredentialStorage;
use crate::types::{tree_id, BloomRecord, Group, ProofRecord, TreeRecord};
use crate::utils::unix_timestamp;
use crate::Node;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PublishOutcome {
    /// No tree is possible for this set this cycle.
    Skipped { group_id: String, reason: String },
    /// The recomputed root equals the active root.
    Unchanged { group_id: String, tree_id: String },
    Published {
        group_id: String,
        tree_id: String,
        members: usize,
        depth: u32,
        retired: Option<String>,
    },
}

/// A tree and filter built off the async runtime.
struct BuiltVersion {
    tree: MerkleTree,
    bloom: BloomFilter,
}

pub struct Publisher {
    storage: Arc<dyn CredentialStorage>,
    builder: Arc<TreeBuilder>,
    bloom: BloomConfig,
    proof_write_chunk: usize,
}

impl Publisher {
    pub fn new(
        storage: Arc<dyn CredentialStorage>,
        tree: &TreeConfig,
        bloom: &BloomConfig,
    ) -> Result<Self, TreeError> {
        Ok(Self {
            storage,
            builder: Arc::new(TreeBuilder::new(
                tree.hash,
                tree.depth,
                tree.large_depth,
                tree.min_members,
            )?),
            bloom: bloom.clone(),
            proof_write_chunk: tree.proof_write_chunk.max(1),
        })
    }

    pub fn builder(&self) -> &TreeBuilder {
        &self.builder
    }

    /// Builds the tree and filter for `members` on the blocking pool.
    async fn build(&self, members: &[Address]) -> Result<BuiltVersion, IndexerError> {
        let builder = Arc::clone(&self.builder);
        let bloom_config = self.bloom.clone();
        let leaves: Vec<Node> = members.iter().map(address_to_leaf).collect();
        let addresses = members.to_vec();

        tokio::task::spawn_blocking(move || {
            let tree = builder.build(&leaves)?;
            let (num_bits, num_hashes) = match (bloom_config.num_bits, bloom_config.num_hashes) {
                (Some(bits), Some(hashes)) => (bits, hashes),
                _ => BloomFilter::optimal_params(
                    addresses.len(),
                    bloom_config.false_positive_rate,
                )?,
            };
            let bloom =
                BloomFilter::for_addresses(&addresses, num_bits, num_hashes, SipKeys::random())?;
            Ok(BuiltVersion { tree, bloom })
        })
        .await
        .map_err(|e| IndexerError::Task(e.to_string()))?
    }

    /// Deletes every stored version of the group other than `active`.
    ///
    /// Covers the previous version as well as versions whose publication
    /// stopped before activation. Returns the number of versions removed.
    pub async fn sweep_inactive(&self, group_id: &str, active: &str) -> Result<usize, IndexerError> {
        let mut swept = 0;
        for stale in self.storage.tree_ids(group_id).await? {
            if stale == active {
                continue;
            }
            let removed = self.storage.retire_tree(&stale).await?;
            debug!("Retired {} ({} proof rows)", stale, removed);
            swept += 1;
        }
        Ok(swept)
    }

    /// Publishes `members` (canonically ordered) as the group's new version.
    pub async fn publish(
        &self,
        group: &Group,
        members: &[Address],
    ) -> Result<PublishOutcome, IndexerError> {
        let built = match self.build(members).await {
            Ok(built) => built,
            Err(IndexerError::Tree(
                err @ (TreeError::TooFewMembers { .. } | TreeError::CapacityExceeded { .. }),
            )) => {
                warn!("Skipping group {}: {}", group.id, err);
                return Ok(PublishOutcome::Skipped {
                    group_id: group.id.clone(),
                    reason: err.to_string(),
                });
            }
            Err(err) => return Err(err),
        };

        let root = built.tree.root();
        let new_id = tree_id(&group.id, &root);
        let previous = self.storage.active_tree_id(&group.id).await?;
        if previous.as_deref() == Some(new_id.as_str()) {
            debug!("Group {} unchanged at {}", group.id, new_id);
            self.sweep_inactive(&group.id, &new_id).await?;
            return Ok(PublishOutcome::Unchanged {
                group_id: group.id.clone(),
                tree_id: new_id,
            });
        }

        self.storage
            .save_tree(&TreeRecord {
                tree_id: new_id.clone(),
                group_id: group.id.clone(),
                root,
                depth: built.tree.depth(),
                hash: self.builder.hash(),
                member_count: members.len(),
                created_at: unix_timestamp(),
                layers: built.tree.layers().to_vec(),
            })
            .await?;

        for (chunk_index, chunk) in members.chunks(self.proof_write_chunk).enumerate() {
            let offset = chunk_index * self.proof_write_chunk;
            let rows = chunk
                .iter()
                .enumerate()
                .map(|(i, address)| {
                    let proof = built.tree.proof(offset + i)?;
                    Ok(ProofRecord {
                        tree_id: new_id.clone(),
                        address: *address,
                        merkle_root: root,
                        path: proof.path,
                        path_indices: proof.path_indices,
                    })
                })
                .collect::<Result<Vec<_>, TreeError>>()?;
            self.storage.save_proofs(&rows).await?;
            debug!(
                "Group {}: wrote proofs {}..{}",
                group.id,
                offset,
                offset + rows.len()
            );
        }

        self.storage
            .save_bloom(&BloomRecord {
                tree_id: new_id.clone(),
                group_id: group.id.clone(),
                filter: built.bloom,
            })
            .await?;

        let retired = self.storage.activate_tree(&group.id, &new_id).await?;
        self.sweep_inactive(&group.id, &new_id).await?;

        info!(
            "Published {} with {} members at depth {}",
            new_id,
            members.len(),
            built.tree.depth()
        );
        Ok(PublishOutcome::Published {
            group_id: group.id.clone(),
            tree_id: new_id,
            members: members.len(),
            depth: built.tree.depth(),
            retired,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hasher::HashFunction;
    use crate::merkle::verify_path;
    use crate::storage::{active_tree, MemoryStorage};
    use crate::types::MemberSelectionRule;

    fn members(n: u8) -> Vec<Address> {
        (1..=n).map(Address::repeat_byte).collect()
    }

    fn group() -> Group {
        Group {
            id: "whales".to_string(),
            handle: "whales".to_string(),
            display_name: "Whales".to_string(),
            rule: MemberSelectionRule::Static { addresses: vec![] },
        }
    }

    fn publisher(storage: Arc<MemoryStorage>) -> Publisher {
        let tree = TreeConfig {
            depth: 3,
            large_depth: 5,
            min_members: 2,
            hash: HashFunction::Sha3_256,
            proof_write_chunk: 3,
        };
        Publisher::new(storage, &tree, &BloomConfig::default()).unwrap()
    }

    #[tokio::test]
    async fn test_publish_writes_complete_version() {
        let storage = Arc::new(MemoryStorage::new());
        let publisher = publisher(Arc::clone(&storage));
        let set = members(7);

        let outcome = publisher.publish(&group(), &set).await.unwrap();
        let PublishOutcome::Published { tree_id, depth, retired, .. } = outcome else {
            panic!("expected a published version, got {outcome:?}");
        };
        assert_eq!(depth, 5);
        assert_eq!(retired, None);

        let tree = active_tree(storage.as_ref(), "whales").await.unwrap().unwrap();
        assert_eq!(tree.tree_id, tree_id);
        assert_eq!(tree.member_count, 7);

        for address in &set {
            let row = storage.get_proof(&tree_id, address).await.unwrap().unwrap();
            assert_eq!(row.path.len(), 4);
            assert!(verify_path(
                &HashFunction::Sha3_256,
                &address_to_leaf(address),
                &row.path,
                &row.path_indices,
                &tree.root
            ));
        }

        let bloom = storage.get_bloom(&tree_id).await.unwrap().unwrap();
        assert!(set.iter().all(|a| bloom.filter.contains_address(a)));
    }

    #[tokio::test]
    async fn test_same_set_is_a_noop() {
        let storage = Arc::new(MemoryStorage::new());
        let publisher = publisher(Arc::clone(&storage));
        publisher.publish(&group(), &members(4)).await.unwrap();
        let outcome = publisher.publish(&group(), &members(4)).await.unwrap();
        assert!(matches!(outcome, PublishOutcome::Unchanged { .. }));
        assert_eq!(storage.get_stats().await.unwrap().trees, 1);
    }

    #[tokio::test]
    async fn test_new_version_retires_old() {
        let storage = Arc::new(MemoryStorage::new());
        let publisher = publisher(Arc::clone(&storage));
        let PublishOutcome::Published { tree_id: first, .. } =
            publisher.publish(&group(), &members(4)).await.unwrap()
        else {
            panic!("first publish failed");
        };

        let outcome = publisher.publish(&group(), &members(5)).await.unwrap();
        let PublishOutcome::Published { retired, .. } = outcome else {
            panic!("second publish failed");
        };
        assert_eq!(retired, Some(first.clone()));
        assert!(storage.get_tree(&first).await.unwrap().is_none());
        assert!(storage.get_bloom(&first).await.unwrap().is_none());

        let stats = storage.get_stats().await.unwrap();
        assert_eq!(stats.trees, 1);
        assert_eq!(stats.proofs, 5);
    }

    /// Writes a version of the group's tree without activating it, as a
    /// publication interrupted before activation leaves it.
    async fn leave_unactivated(storage: &MemoryStorage, set: &[Address]) -> String {
        let leaves: Vec<Node> = set.iter().map(address_to_leaf).collect();
        let tree = MerkleTree::build(&HashFunction::Sha3_256, 3, &leaves).unwrap();
        let id = tree_id("whales", &tree.root());
        storage
            .save_tree(&TreeRecord {
                tree_id: id.clone(),
                group_id: "whales".to_string(),
                root: tree.root(),
                depth: 3,
                hash: HashFunction::Sha3_256,
                member_count: set.len(),
                created_at: 0,
                layers: tree.layers().to_vec(),
            })
            .await
            .unwrap();
        let proof = tree.proof(0).unwrap();
        storage
            .save_proofs(&[ProofRecord {
                tree_id: id.clone(),
                address: set[0],
                merkle_root: tree.root(),
                path: proof.path,
                path_indices: proof.path_indices,
            }])
            .await
            .unwrap();
        id
    }

    #[tokio::test]
    async fn test_unactivated_versions_are_swept() {
        let storage = Arc::new(MemoryStorage::new());
        let publisher = publisher(Arc::clone(&storage));

        let orphan = leave_unactivated(&storage, &members(3)).await;
        let outcome = publisher.publish(&group(), &members(4)).await.unwrap();
        let PublishOutcome::Published { tree_id, retired, .. } = outcome else {
            panic!("expected a published version, got {outcome:?}");
        };
        assert_eq!(retired, None);
        assert!(storage.get_tree(&orphan).await.unwrap().is_none());
        assert!(storage.get_proof(&orphan, &members(1)[0]).await.unwrap().is_none());
        assert_eq!(storage.tree_ids("whales").await.unwrap(), vec![tree_id.clone()]);

        // An unchanged cycle also clears versions left behind since.
        let orphan = leave_unactivated(&storage, &members(2)).await;
        let outcome = publisher.publish(&group(), &members(4)).await.unwrap();
        assert!(matches!(outcome, PublishOutcome::Unchanged { .. }));
        assert!(storage.get_tree(&orphan).await.unwrap().is_none());
        assert_eq!(storage.tree_ids("whales").await.unwrap(), vec![tree_id]);
    }

    #[tokio::test]
    async fn test_out_of_bounds_sets_are_skipped() {
        let storage = Arc::new(MemoryStorage::new());
        let publisher = publisher(Arc::clone(&storage));

        let outcome = publisher.publish(&group(), &members(1)).await.unwrap();
        assert!(matches!(outcome, PublishOutcome::Skipped { .. }));

        let outcome = publisher.publish(&group(), &members(17)).await.unwrap();
        assert!(matches!(outcome, PublishOutcome::Skipped { .. }));
        assert!(storage.active_tree_id("whales").await.unwrap().is_none());
    }
}
