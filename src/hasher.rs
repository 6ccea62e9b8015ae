//! Pluggable two-to-one node hashing and precomputed empty subtrees.

use serde::{Deserialize, Serialize};
use sha3::{Digest, Keccak256, Sha3_256};
use std::fmt;
use std::str::FromStr;

use crate::utils::{bytes_to_field, field_to_bytes, poseidon_hash};
use crate::Node;

/// The canonical zero leaf filling every absent position of a tree.
pub const ZERO_LEAF: Node = [0u8; 32];

/// A collision-resistant, fixed-arity (2-to-1) hash over tree nodes.
pub trait NodeHasher: Send + Sync {
    fn hash_pair(&self, left: &Node, right: &Node) -> Node;
}

/// Built-in node hashes, selectable from configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HashFunction {
    /// Poseidon over the Pallas base field, matching the proving circuit.
    #[default]
    Poseidon,
    Keccak256,
    Sha3_256,
}

impl NodeHasher for HashFunction {
    fn hash_pair(&self, left: &Node, right: &Node) -> Node {
        match self {
            HashFunction::Poseidon => {
                field_to_bytes(poseidon_hash(bytes_to_field(left), bytes_to_field(right)))
            }
            HashFunction::Keccak256 => Keccak256::new()
                .chain_update(left)
                .chain_update(right)
                .finalize()
                .into(),
            HashFunction::Sha3_256 => Sha3_256::new()
                .chain_update(left)
                .chain_update(right)
                .finalize()
                .into(),
        }
    }
}

impl fmt::Display for HashFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            HashFunction::Poseidon => "poseidon",
            HashFunction::Keccak256 => "keccak256",
            HashFunction::Sha3_256 => "sha3_256",
        };
        f.write_str(name)
    }
}

impl FromStr for HashFunction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "poseidon" => Ok(HashFunction::Poseidon),
            "keccak256" => Ok(HashFunction::Keccak256),
            "sha3_256" => Ok(HashFunction::Sha3_256),
            other => Err(format!("unknown hash function: {other}")),
        }
    }
}

/// Hashes of all-empty subtrees, indexed by tree level.
///
/// Level 0 is the zero leaf; level `i` is `H(level[i-1], level[i-1])`. A tree
/// of depth `D` needs `D - 1` of them, one per level below the root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmptySubtrees {
    hashes: Vec<Node>,
}

impl EmptySubtrees {
    pub fn new(hasher: &dyn NodeHasher, depth: u32) -> Self {
        let levels = depth.saturating_sub(1) as usize;
        let mut hashes = Vec::with_capacity(levels);
        let mut current = ZERO_LEAF;
        for _ in 0..levels {
            hashes.push(current);
            current = hasher.hash_pair(&current, &current);
        }
        Self { hashes }
    }

    /// Empty subtree hash for `level`. Levels past the precomputed range
    /// never occur for well-formed trees; the zero leaf is returned for them.
    #[must_use]
    pub fn get(&self, level: usize) -> Node {
        self.hashes.get(level).copied().unwrap_or(ZERO_LEAF)
    }

    pub fn len(&self) -> usize {
        self.hashes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hashes.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_functions_differ() {
        let a = [1u8; 32];
        let b = [2u8; 32];
        let poseidon = HashFunction::Poseidon.hash_pair(&a, &b);
        let keccak = HashFunction::Keccak256.hash_pair(&a, &b);
        let sha3 = HashFunction::Sha3_256.hash_pair(&a, &b);
        assert_ne!(poseidon, keccak);
        assert_ne!(keccak, sha3);
        assert_ne!(HashFunction::Sha3_256.hash_pair(&b, &a), sha3);
    }

    #[test]
    fn test_sha3_of_zero_pair_matches_reference() {
        let hash = HashFunction::Sha3_256.hash_pair(&ZERO_LEAF, &ZERO_LEAF);
        assert_eq!(
            hex::encode(hash),
            "070fa1ab6fcc557ed14d42941f1967693048551eb9042a8d0a057afbd75e81e0"
        );
    }

    #[test]
    fn test_empty_subtrees_are_iterated_self_hashes() {
        let hasher = HashFunction::Keccak256;
        let empty = EmptySubtrees::new(&hasher, 5);
        assert_eq!(empty.len(), 4);
        assert_eq!(empty.get(0), ZERO_LEAF);
        for level in 1..4 {
            let below = empty.get(level - 1);
            assert_eq!(empty.get(level), hasher.hash_pair(&below, &below));
        }
    }

    #[test]
    fn test_hash_function_serde_names() {
        #[derive(Deserialize)]
        struct Wrapper {
            hash: HashFunction,
        }
        let parsed: Wrapper = toml::from_str("hash = \"sha3_256\"").unwrap();
        assert_eq!(parsed.hash, HashFunction::Sha3_256);
        assert_eq!(HashFunction::Keccak256.to_string(), "keccak256");
        for hash in [HashFunction::Poseidon, HashFunction::Keccak256, HashFunction::Sha3_256] {
            assert_eq!(hash.to_string().parse::<HashFunction>(), Ok(hash));
        }
        assert!("md5".parse::<HashFunction>().is_err());
    }
}
