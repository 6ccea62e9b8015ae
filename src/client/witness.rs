//! Private inputs of a membership proof.

use std::fmt;

use ethers::types::{Address, RecoveryMessage, Signature, H256, U256};
use ethers::utils::hash_message;

use crate::error::AttestationError;
use crate::ethereum::address_to_leaf;
use crate::hasher::HashFunction;
use crate::merkle::{verify_path, MerkleProof};
use crate::types::compute_binding_value;
use crate::Node;

/// Everything the prover needs, assembled from the source signature and a
/// confirmed Merkle proof. Never persisted.
#[derive(Clone, PartialEq, Eq)]
pub struct Witness {
    pub r: Node,
    pub s: Node,
    pub is_y_odd: bool,
    /// EIP-191 hash of the source message.
    pub msg_hash: Node,
    pub siblings: Vec<Node>,
    pub path_indices: Vec<u8>,
    pub root: Node,
    pub binding_value: Node,
    pub hash: HashFunction,
}

fn u256_bytes(value: U256) -> Node {
    let mut out = [0u8; 32];
    value.to_big_endian(&mut out);
    out
}

/// Recovery bit from a legacy (27/28) or raw (0/1) `v`.
fn y_parity(v: u64) -> Result<bool, AttestationError> {
    match v {
        0 | 27 => Ok(false),
        1 | 28 => Ok(true),
        other => Err(AttestationError::Witness(format!(
            "unsupported signature recovery id {other}"
        ))),
    }
}

impl Witness {
    /// Decomposes `signature` over `source_message` and joins it with `proof`.
    pub fn build(
        signature: &Signature,
        source_message: &str,
        proof: &MerkleProof,
        hash: HashFunction,
    ) -> Result<Self, AttestationError> {
        let r = u256_bytes(signature.r);
        let s = u256_bytes(signature.s);
        Ok(Self {
            r,
            s,
            is_y_odd: y_parity(signature.v)?,
            msg_hash: hash_message(source_message).0,
            siblings: proof.path.clone(),
            path_indices: proof.path_indices.clone(),
            root: proof.root,
            binding_value: compute_binding_value(&r, &s, &proof.root),
            hash,
        })
    }

    pub fn signature(&self) -> Signature {
        Signature {
            r: U256::from_big_endian(&self.r),
            s: U256::from_big_endian(&self.s),
            v: 27 + u64::from(self.is_y_odd),
        }
    }

    /// The address that produced the source signature.
    pub fn recover_address(&self) -> Result<Address, AttestationError> {
        self.signature()
            .recover(RecoveryMessage::Hash(H256(self.msg_hash)))
            .map_err(|e| AttestationError::Witness(format!("signature recovery failed: {e}")))
    }

    /// Evaluates the membership relation natively.
    ///
    /// The recovered address must fold up to `root` through the path, and
    /// the binding value must be the one derived from `(r, s, root)`.
    pub fn check(&self) -> Result<(), AttestationError> {
        let address = self.recover_address()?;
        if !verify_path(
            &self.hash,
            &address_to_leaf(&address),
            &self.siblings,
            &self.path_indices,
            &self.root,
        ) {
            return Err(AttestationError::Witness(
                "signing address is not in the tree".to_string(),
            ));
        }
        if compute_binding_value(&self.r, &self.s, &self.root) != self.binding_value {
            return Err(AttestationError::Witness(
                "binding value does not match the signature".to_string(),
            ));
        }
        Ok(())
    }
}

// r and s identify the signer; keep them out of logs.
impl fmt::Debug for Witness {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Witness")
            .field("root", &hex::encode(self.root))
            .field("binding_value", &hex::encode(self.binding_value))
            .field("levels", &self.siblings.len())
            .field("hash", &self.hash)
            .finish_non_exhaustive()
    }
}
