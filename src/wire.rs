//! Protobuf wire format for published trees and their Bloom filters.
//!
//! One `GroupTreeList` carries any number of groups. The bulk listing sends
//! each group with its filter only (no layers); a batched fetch by tree id
//! sends full layers. Layer 0 holds the leaves and the last layer holds the
//! single root node.

use log::warn;
use prost::Message;

use crate::bloom::{BloomFilter, SipKeys};
use crate::error::{StorageError, WireError};
use crate::hasher::HashFunction;
use crate::merkle::SparseTree;
use crate::storage::CredentialStorage;
use crate::types::{Group, TreeRecord};
use crate::Node;

#[derive(Clone, PartialEq, Message)]
pub struct TreeNode {
    #[prost(bytes = "vec", tag = "1")]
    pub node: Vec<u8>,
    #[prost(uint32, tag = "2")]
    pub index: u32,
}

#[derive(Clone, PartialEq, Message)]
pub struct TreeLayer {
    #[prost(message, repeated, tag = "1")]
    pub nodes: Vec<TreeNode>,
}

#[derive(Clone, PartialEq, Message)]
pub struct GroupInfo {
    #[prost(string, tag = "1")]
    pub id: String,
    #[prost(string, tag = "2")]
    pub handle: String,
    #[prost(string, tag = "3")]
    pub display_name: String,
    #[prost(string, tag = "4")]
    pub tree_id: String,
}

#[derive(Clone, PartialEq, Message)]
pub struct GroupTree {
    #[prost(message, repeated, tag = "1")]
    pub layers: Vec<TreeLayer>,
    #[prost(bytes = "vec", tag = "2")]
    pub bloom_filter: Vec<u8>,
    #[prost(uint64, tag = "3")]
    pub bloom_num_bits: u64,
    #[prost(uint32, tag = "4")]
    pub bloom_num_hashes: u32,
    #[prost(bytes = "vec", repeated, tag = "5")]
    pub bloom_sip_keys: Vec<Vec<u8>>,
    #[prost(message, optional, tag = "6")]
    pub group: Option<GroupInfo>,
    #[prost(bytes = "vec", tag = "7")]
    pub root: Vec<u8>,
    #[prost(uint32, tag = "8")]
    pub depth: u32,
    #[prost(string, tag = "9")]
    pub hash: String,
}

#[derive(Clone, PartialEq, Message)]
pub struct GroupTreeList {
    #[prost(message, repeated, tag = "1")]
    pub groups: Vec<GroupTree>,
}

fn to_node(bytes: &[u8]) -> Result<Node, WireError> {
    bytes
        .try_into()
        .map_err(|_| WireError::Malformed(format!("node must be 32 bytes, got {}", bytes.len())))
}

impl GroupTree {
    /// Encodes one published tree. `with_layers = false` produces the
    /// filter-only entry used by the bulk listing.
    pub fn from_record(
        group: &Group,
        tree: &TreeRecord,
        bloom: &BloomFilter,
        with_layers: bool,
    ) -> Self {
        let layers = if with_layers {
            tree.layers
                .iter()
                .map(|layer| TreeLayer {
                    nodes: layer
                        .iter()
                        .enumerate()
                        .map(|(index, node)| TreeNode {
                            node: node.to_vec(),
                            index: index as u32,
                        })
                        .collect(),
                })
                .collect()
        } else {
            Vec::new()
        };

        Self {
            layers,
            bloom_filter: bloom.bits().to_vec(),
            bloom_num_bits: bloom.num_bits(),
            bloom_num_hashes: bloom.num_hashes(),
            bloom_sip_keys: bloom.keys().to_wire(),
            group: Some(GroupInfo {
                id: group.id.clone(),
                handle: group.handle.clone(),
                display_name: group.display_name.clone(),
                tree_id: tree.tree_id.clone(),
            }),
            root: tree.root.to_vec(),
            depth: tree.depth,
            hash: tree.hash.to_string(),
        }
    }

    pub fn group_id(&self) -> &str {
        self.group.as_ref().map(|g| g.id.as_str()).unwrap_or_default()
    }

    pub fn tree_id(&self) -> &str {
        self.group
            .as_ref()
            .map(|g| g.tree_id.as_str())
            .unwrap_or_default()
    }

    pub fn root_node(&self) -> Result<Node, WireError> {
        to_node(&self.root)
    }

    pub fn hash_function(&self) -> Result<HashFunction, WireError> {
        self.hash.parse().map_err(WireError::Malformed)
    }

    pub fn bloom(&self) -> Result<BloomFilter, WireError> {
        let keys = SipKeys::from_wire(&self.bloom_sip_keys)?;
        Ok(BloomFilter::from_parts(
            self.bloom_filter.clone(),
            self.bloom_num_bits,
            self.bloom_num_hashes,
            keys,
        )?)
    }

    /// Rebuilds the client-side tree from the carried layers.
    pub fn sparse_tree(&self) -> Result<SparseTree, WireError> {
        if self.layers.is_empty() {
            return Err(WireError::Malformed(format!(
                "tree {} carries no layers",
                self.tree_id()
            )));
        }
        let layers = self
            .layers
            .iter()
            .map(|layer| {
                layer
                    .nodes
                    .iter()
                    .map(|n| Ok((n.index, to_node(&n.node)?)))
                    .collect::<Result<Vec<_>, WireError>>()
            })
            .collect::<Result<Vec<_>, WireError>>()?;

        let tree = SparseTree::from_layers(&self.hash_function()?, layers)?;
        if !self.root.is_empty() && tree.root() != self.root_node()? {
            return Err(WireError::Malformed(format!(
                "tree {} root does not match its top layer",
                self.tree_id()
            )));
        }
        Ok(tree)
    }
}

impl GroupTreeList {
    pub fn to_bytes(&self) -> Vec<u8> {
        self.encode_to_vec()
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, WireError> {
        Ok(Self::decode(bytes)?)
    }
}

/// Encodes the active trees of `groups` from storage.
///
/// With `tree_ids = None` every active tree is listed filter-only; otherwise
/// only the named versions are sent, with full layers. Ids that are no longer
/// active are left out.
pub async fn export_active(
    storage: &dyn CredentialStorage,
    groups: &[Group],
    tree_ids: Option<&[String]>,
) -> Result<GroupTreeList, StorageError> {
    let mut list = GroupTreeList::default();
    for (group_id, tree_id) in storage.active_trees().await? {
        if tree_ids.is_some_and(|ids| !ids.contains(&tree_id)) {
            continue;
        }
        let Some(group) = groups.iter().find(|g| g.id == group_id) else {
            continue;
        };
        let (Some(tree), Some(bloom)) = (
            storage.get_tree(&tree_id).await?,
            storage.get_bloom(&tree_id).await?,
        ) else {
            warn!("Active tree {} is incomplete, not exported", tree_id);
            continue;
        };
        list.groups.push(GroupTree::from_record(
            group,
            &tree,
            &bloom.filter,
            tree_ids.is_some(),
        ));
    }
    Ok(list)
}
