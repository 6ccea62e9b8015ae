//! Anonymous group-membership credentials for Ethereum addresses.
//!
//! This library lets a user prove that one of their addresses belongs to a
//! qualifying group (whales, early holders, a static allow-list) without
//! revealing which address, and bind that proof to an account as a durable
//! credential.
//!
//! # Components
//!
//! - [`indexer`]: resumable `Transfer` log ingestion over a bounded RPC client
//!   pool, balance replay, group resolution and tree publication
//! - [`merkle`]: fixed-depth Merkle accumulator with sparse proofs
//! - [`bloom`]: SipHash-keyed Bloom filter used as a cheap candidacy index
//! - [`wire`]: protobuf wire format for trees and filters
//! - [`client`]: two-phase eligibility resolver and the attestation flow
//! - [`circuit`]: the halo2 proving backend
//! - [`verifier`]: checks performed on submitted attestations
//!
//! # Example
//!
//! ```no_run
//! use zkp_group_credentials::{hasher::HashFunction, merkle::MerkleTree};
//!
//! let leaves = vec![[1u8; 32], [2u8; 32]];
//! let tree = MerkleTree::build(&HashFunction::Sha3_256, 4, &leaves).unwrap();
//! let proof = tree.proof(1).unwrap();
//! assert!(proof.verify(&HashFunction::Sha3_256));
//! ```

pub mod bloom;
pub mod circuit;
pub mod client;
pub mod config;
pub mod error;
pub mod ethereum;
pub mod hasher;
pub mod indexer;
pub mod merkle;
pub mod storage;
pub mod types;
pub mod utils;
pub mod verifier;
pub mod wire;


pub use bloom::{BloomFilter, SipKeys};
pub use circuit::{CredentialCircuit, Halo2Backend, ProofBackend};
pub use client::{AttestationFlow, AttestationState, EligibilityResolver, EligibleCredential};
pub use config::Config;
pub use hasher::{EmptySubtrees, HashFunction, NodeHasher};
pub use merkle::{verify_path, MerkleProof, MerkleTree, SparseTree};
pub use types::{Credential, Group, MemberSelectionRule, TransferEvent};
pub use utils::{bytes_to_field, field_to_bytes, poseidon_hash};
pub use verifier::Verifier;

/// Circuit parameter for the halo2 proving system.
///
/// `k = 8` gives 256 rows, enough for the signature cells plus one row per
/// tree level for depths up to 64. Prover and verifier must agree on this
/// value; changing it invalidates every previously issued proof.
pub const CIRCUIT_K: u32 = 8;

/// A 32-byte tree node (leaf or interior hash).
pub type Node = [u8; 32];
