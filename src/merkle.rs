//! Fixed-depth Merkle accumulator for group membership.
//!
//! A tree of depth `D` has `D` layers: the leaves at layer 0 and the single
//! root at layer `D - 1`. It holds at most `2^(D-1)` leaves. Positions past
//! the last real leaf are never materialized; whenever a sibling is absent the
//! precomputed empty subtree hash for that level stands in for it.

use std::collections::HashMap;
use std::fmt;

use crate::error::TreeError;
use crate::hasher::{EmptySubtrees, HashFunction, NodeHasher};
use crate::Node;

/// Largest supported depth; keeps `2^(D-1)` inside a `u32` leaf index.
pub const MAX_DEPTH: u32 = 33;

/// Inclusion proof for one leaf.
///
/// `path[i]` is the sibling at level `i`, read bottom-up, and
/// `path_indices[i]` is 0 when the running node is the left child and 1 when
/// it is the right child.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MerkleProof {
    pub leaf: Node,
    pub root: Node,
    pub path: Vec<Node>,
    pub path_indices: Vec<u8>,
    pub index: usize,
}

impl MerkleProof {
    pub fn verify(&self, hasher: &dyn NodeHasher) -> bool {
        verify_path(hasher, &self.leaf, &self.path, &self.path_indices, &self.root)
    }
}

impl fmt::Display for MerkleProof {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "MerkleProof:\n  Leaf: {}\n  Root: {}\n  Index: {}\n  Siblings: {}",
            hex::encode(self.leaf),
            hex::encode(self.root),
            self.index,
            self.path.len()
        )
    }
}

/// Folds `leaf` up through `path` and compares the result with `root`.
///
/// Mismatched lengths or direction bits other than 0/1 fail verification.
pub fn verify_path(
    hasher: &dyn NodeHasher,
    leaf: &Node,
    path: &[Node],
    path_indices: &[u8],
    root: &Node,
) -> bool {
    if path.len() != path_indices.len() {
        return false;
    }

    let mut current = *leaf;
    for (sibling, &bit) in path.iter().zip(path_indices) {
        current = match bit {
            0 => hasher.hash_pair(&current, sibling),
            1 => hasher.hash_pair(sibling, &current),
            _ => return false,
        };
    }

    current == *root
}

fn check_depth(depth: u32) -> Result<(), TreeError> {
    if !(2..=MAX_DEPTH).contains(&depth) {
        return Err(TreeError::InvalidDepth(depth));
    }
    Ok(())
}

/// Number of leaves a tree of `depth` can hold.
#[must_use]
pub fn capacity(depth: u32) -> usize {
    1usize << depth.saturating_sub(1)
}

/// A fully built tree, as produced by the indexer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MerkleTree {
    depth: u32,
    layers: Vec<Vec<Node>>,
    empty: EmptySubtrees,
}

impl MerkleTree {
    /// Builds a depth-`depth` tree over `leaves` in the given order.
    pub fn build(hasher: &dyn NodeHasher, depth: u32, leaves: &[Node]) -> Result<Self, TreeError> {
        check_depth(depth)?;
        let empty = EmptySubtrees::new(hasher, depth);
        Self::build_with(hasher, depth, leaves, &empty)
    }

    /// Like [`MerkleTree::build`] but reuses precomputed empty subtrees.
    pub fn build_with(
        hasher: &dyn NodeHasher,
        depth: u32,
        leaves: &[Node],
        empty: &EmptySubtrees,
    ) -> Result<Self, TreeError> {
        check_depth(depth)?;
        if empty.len() != depth as usize - 1 {
            return Err(TreeError::Malformed(format!(
                "{} empty subtree hashes for depth {}",
                empty.len(),
                depth
            )));
        }
        if leaves.is_empty() {
            return Err(TreeError::TooFewMembers {
                members: 0,
                minimum: 1,
            });
        }
        if leaves.len() > capacity(depth) {
            return Err(TreeError::CapacityExceeded {
                members: leaves.len(),
                capacity: capacity(depth),
                depth,
            });
        }

        let mut layers: Vec<Vec<Node>> = Vec::with_capacity(depth as usize);
        layers.push(leaves.to_vec());

        for level in 0..depth as usize - 1 {
            let next: Vec<Node> = layers[level]
                .chunks(2)
                .map(|pair| {
                    let right = pair.get(1).copied().unwrap_or_else(|| empty.get(level));
                    hasher.hash_pair(&pair[0], &right)
                })
                .collect();
            layers.push(next);
        }

        Ok(Self {
            depth,
            layers,
            empty: empty.clone(),
        })
    }

    pub fn root(&self) -> Node {
        // build_with always leaves exactly one node in the top layer.
        self.layers[self.layers.len() - 1][0]
    }

    pub fn depth(&self) -> u32 {
        self.depth
    }

    pub fn leaves(&self) -> &[Node] {
        &self.layers[0]
    }

    pub fn layers(&self) -> &[Vec<Node>] {
        &self.layers
    }

    pub fn len(&self) -> usize {
        self.layers[0].len()
    }

    pub fn is_empty(&self) -> bool {
        self.layers[0].is_empty()
    }

    /// Linear search for a leaf's position.
    pub fn position(&self, leaf: &Node) -> Option<usize> {
        self.leaves().iter().position(|candidate| candidate == leaf)
    }

    pub fn proof_for_leaf(&self, leaf: &Node) -> Result<MerkleProof, TreeError> {
        let index = self
            .position(leaf)
            .ok_or_else(|| TreeError::LeafNotFound(hex::encode(leaf)))?;
        self.proof(index)
    }

    /// Inclusion proof for the leaf at `leaf_index`.
    pub fn proof(&self, leaf_index: usize) -> Result<MerkleProof, TreeError> {
        if leaf_index >= self.len() {
            return Err(TreeError::LeafIndexOutOfRange {
                index: leaf_index,
                leaves: self.len(),
            });
        }

        let levels = self.depth as usize - 1;
        let mut path = Vec::with_capacity(levels);
        let mut path_indices = Vec::with_capacity(levels);
        let mut index = leaf_index;

        for level in 0..levels {
            let sibling = self.layers[level]
                .get(index ^ 1)
                .copied()
                .unwrap_or_else(|| self.empty.get(level));
            path.push(sibling);
            path_indices.push((index & 1) as u8);
            index >>= 1;
        }

        Ok(MerkleProof {
            leaf: self.layers[0][leaf_index],
            root: self.root(),
            path,
            path_indices,
            index: leaf_index,
        })
    }

    /// Layers as `(index, node)` pairs, the shape the wire format carries.
    pub fn indexed_layers(&self) -> Vec<Vec<(u32, Node)>> {
        self.layers
            .iter()
            .map(|layer| {
                layer
                    .iter()
                    .enumerate()
                    .map(|(i, node)| (i as u32, *node))
                    .collect()
            })
            .collect()
    }

    /// Proofs for every leaf, in leaf order.
    pub fn proofs(&self) -> impl Iterator<Item = MerkleProof> + '_ {
        (0..self.len()).filter_map(move |i| self.proof(i).ok())
    }
}

/// Selects a depth for a member set and enforces the size bounds.
///
/// Sets that fit `depth` use it; larger sets fall back to `large_depth`.
/// Sets under `min_members` are refused.
#[derive(Debug, Clone)]
pub struct TreeBuilder {
    hash: HashFunction,
    depth: u32,
    large_depth: u32,
    min_members: usize,
    empty: EmptySubtrees,
    empty_large: EmptySubtrees,
}

impl TreeBuilder {
    pub fn new(
        hash: HashFunction,
        depth: u32,
        large_depth: u32,
        min_members: usize,
    ) -> Result<Self, TreeError> {
        check_depth(depth)?;
        check_depth(large_depth)?;
        if large_depth < depth {
            return Err(TreeError::InvalidDepth(large_depth));
        }
        Ok(Self {
            hash,
            depth,
            large_depth,
            min_members,
            empty: EmptySubtrees::new(&hash, depth),
            empty_large: EmptySubtrees::new(&hash, large_depth),
        })
    }

    pub fn hash(&self) -> HashFunction {
        self.hash
    }

    pub fn min_members(&self) -> usize {
        self.min_members
    }

    pub fn select_depth(&self, members: usize) -> Result<u32, TreeError> {
        if members < self.min_members.max(1) {
            return Err(TreeError::TooFewMembers {
                members,
                minimum: self.min_members.max(1),
            });
        }
        if members <= capacity(self.depth) {
            Ok(self.depth)
        } else if members <= capacity(self.large_depth) {
            Ok(self.large_depth)
        } else {
            Err(TreeError::CapacityExceeded {
                members,
                capacity: capacity(self.large_depth),
                depth: self.large_depth,
            })
        }
    }

    pub fn build(&self, leaves: &[Node]) -> Result<MerkleTree, TreeError> {
        let depth = self.select_depth(leaves.len())?;
        let empty = if depth == self.depth {
            &self.empty
        } else {
            &self.empty_large
        };
        MerkleTree::build_with(&self.hash, depth, leaves, empty)
    }
}

/// A tree reconstructed from its published layers, possibly with gaps.
///
/// Used on the client: nodes are addressed by `(layer, index)` and any node
/// the publisher omitted resolves to the empty subtree hash of its level.
#[derive(Debug, Clone)]
pub struct SparseTree {
    layers: Vec<HashMap<u32, Node>>,
    leaf_positions: HashMap<Node, u32>,
    empty: EmptySubtrees,
    root: Node,
}

impl SparseTree {
    /// Reassembles a tree from `(index, node)` pairs per layer, leaves first.
    pub fn from_layers(
        hasher: &dyn NodeHasher,
        layers: Vec<Vec<(u32, Node)>>,
    ) -> Result<Self, TreeError> {
        let depth = u32::try_from(layers.len())
            .map_err(|_| TreeError::Malformed("too many layers".to_string()))?;
        check_depth(depth)?;

        let root = match layers.last().map(Vec::as_slice) {
            Some([(0, root)]) => *root,
            _ => {
                return Err(TreeError::Malformed(
                    "top layer must hold exactly the root at index 0".to_string(),
                ))
            }
        };

        let layers: Vec<HashMap<u32, Node>> = layers
            .into_iter()
            .map(|layer| layer.into_iter().collect())
            .collect();

        let leaf_positions = layers[0]
            .iter()
            .map(|(&index, &leaf)| (leaf, index))
            .collect();

        Ok(Self {
            layers,
            leaf_positions,
            empty: EmptySubtrees::new(hasher, depth),
            root,
        })
    }

    pub fn root(&self) -> Node {
        self.root
    }

    pub fn depth(&self) -> u32 {
        self.layers.len() as u32
    }

    pub fn leaf_count(&self) -> usize {
        self.layers[0].len()
    }

    /// Keyed lookup of a leaf's position.
    pub fn position(&self, leaf: &Node) -> Option<u32> {
        self.leaf_positions.get(leaf).copied()
    }

    /// Proof for `leaf`, or `None` if the leaf is not in the tree.
    pub fn proof_for(&self, leaf: &Node) -> Option<MerkleProof> {
        let leaf_index = self.position(leaf)?;
        let levels = self.layers.len() - 1;
        let mut path = Vec::with_capacity(levels);
        let mut path_indices = Vec::with_capacity(levels);
        let mut index = leaf_index;

        for level in 0..levels {
            let sibling = self.layers[level]
                .get(&(index ^ 1))
                .copied()
                .unwrap_or_else(|| self.empty.get(level));
            path.push(sibling);
            path_indices.push((index & 1) as u8);
            index >>= 1;
        }

        Some(MerkleProof {
            leaf: *leaf,
            root: self.root,
            path,
            path_indices,
            index: leaf_index as usize,
        })
    }
}
