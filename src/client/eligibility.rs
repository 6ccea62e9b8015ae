//! Two-phase eligibility resolution.
//!
//! Phase one tests every candidate address against every group's Bloom filter,
//! fetched once in bulk. Phase two fetches only the trees that produced a hit,
//! in bounded batches, and looks each address up exactly. Filter false
//! positives are dropped silently in phase two.

use std::collections::{BTreeMap, BTreeSet};

use ethers::types::Address;
use log::{debug, warn};

use crate::client::api::CredentialApi;
use crate::error::ApiError;
use crate::ethereum::address_to_leaf;
use crate::hasher::HashFunction;
use crate::merkle::MerkleProof;
use crate::wire::GroupTreeList;

/// An `(address, group)` pair whose filter test was positive.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct Candidate {
    pub tree_id: String,
    pub group_id: String,
    pub address: Address,
}

/// A confirmed membership, ready for the proving step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EligibleCredential {
    pub group_id: String,
    pub tree_id: String,
    pub address: Address,
    pub proof: MerkleProof,
    pub hash: HashFunction,
}

/// Phase one: filter test of every address against every listed group.
///
/// Entries with an undecodable filter are skipped.
pub fn bloom_candidates(filters: &GroupTreeList, addresses: &[Address]) -> Vec<Candidate> {
    let mut candidates = BTreeSet::new();
    for entry in &filters.groups {
        let bloom = match entry.bloom() {
            Ok(bloom) => bloom,
            Err(err) => {
                warn!("Ignoring filter of {}: {}", entry.tree_id(), err);
                continue;
            }
        };
        for address in addresses {
            if bloom.contains_address(address) {
                candidates.insert(Candidate {
                    tree_id: entry.tree_id().to_string(),
                    group_id: entry.group_id().to_string(),
                    address: *address,
                });
            }
        }
    }
    candidates.into_iter().collect()
}

pub struct EligibilityResolver<'a> {
    api: &'a dyn CredentialApi,
    tree_batch_size: usize,
}

impl<'a> EligibilityResolver<'a> {
    pub fn new(api: &'a dyn CredentialApi, tree_batch_size: usize) -> Self {
        Self {
            api,
            tree_batch_size: tree_batch_size.max(1),
        }
    }

    /// Both phases over `addresses`.
    pub async fn resolve(&self, addresses: &[Address]) -> Result<Vec<EligibleCredential>, ApiError> {
        let filters = self.api.tree_filters().await?;
        let candidates = bloom_candidates(&filters, addresses);
        debug!(
            "{} filter hits for {} addresses across {} groups",
            candidates.len(),
            addresses.len(),
            filters.groups.len()
        );
        self.confirm(&candidates).await
    }

    /// Phase two: exact lookup of each candidate in its full tree.
    pub async fn confirm(&self, candidates: &[Candidate]) -> Result<Vec<EligibleCredential>, ApiError> {
        let mut by_tree: BTreeMap<&str, Vec<&Candidate>> = BTreeMap::new();
        for candidate in candidates {
            by_tree.entry(&candidate.tree_id).or_default().push(candidate);
        }
        let tree_ids: Vec<String> = by_tree.keys().map(|id| id.to_string()).collect();

        let mut confirmed = Vec::new();
        for batch in tree_ids.chunks(self.tree_batch_size) {
            let trees = self.api.trees(batch).await?;
            for entry in &trees.groups {
                let Some(pending) = by_tree.get(entry.tree_id()) else {
                    continue;
                };
                let (tree, hash) = match (entry.sparse_tree(), entry.hash_function()) {
                    (Ok(tree), Ok(hash)) => (tree, hash),
                    (Err(err), _) | (_, Err(err)) => {
                        warn!("Ignoring tree {}: {}", entry.tree_id(), err);
                        continue;
                    }
                };
                for candidate in pending {
                    match tree.proof_for(&address_to_leaf(&candidate.address)) {
                        Some(proof) => confirmed.push(EligibleCredential {
                            group_id: candidate.group_id.clone(),
                            tree_id: candidate.tree_id.clone(),
                            address: candidate.address,
                            proof,
                            hash,
                        }),
                        None => debug!("Filter false positive in {}", candidate.tree_id),
                    }
                }
            }
        }
        Ok(confirmed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bloom::{BloomFilter, SipKeys};
    use crate::merkle::MerkleTree;
    use crate::types::{
        tree_id, AttestationResponse, AttestationSubmission, Group, MemberSelectionRule,
        TreeRecord,
    };
    use crate::wire::GroupTree;
    use async_trait::async_trait;
    use std::sync::Mutex;

    /// Serves fixed trees and records every batched fetch.
    struct FixedApi {
        trees: Vec<GroupTree>,
        filters: Vec<GroupTree>,
        fetches: Mutex<Vec<Vec<String>>>,
    }

    #[async_trait]
    impl CredentialApi for FixedApi {
        async fn groups(&self) -> Result<Vec<Group>, ApiError> {
            Ok(vec![])
        }

        async fn tree_filters(&self) -> Result<GroupTreeList, ApiError> {
            Ok(GroupTreeList { groups: self.filters.clone() })
        }

        async fn trees(&self, tree_ids: &[String]) -> Result<GroupTreeList, ApiError> {
            self.fetches.lock().unwrap().push(tree_ids.to_vec());
            Ok(GroupTreeList {
                groups: self
                    .trees
                    .iter()
                    .filter(|t| tree_ids.iter().any(|id| id == t.tree_id()))
                    .cloned()
                    .collect(),
            })
        }

        async fn submit_attestation(
            &self,
            _submission: &AttestationSubmission,
        ) -> Result<AttestationResponse, ApiError> {
            Err(ApiError::Http("not served".to_string()))
        }
    }

    fn entry(group_id: &str, members: &[Address], bloom: BloomFilter) -> GroupTree {
        let hash = HashFunction::Sha3_256;
        let leaves: Vec<_> = members.iter().map(address_to_leaf).collect();
        let tree = MerkleTree::build(&hash, 4, &leaves).unwrap();
        let group = Group {
            id: group_id.to_string(),
            handle: group_id.to_string(),
            display_name: group_id.to_string(),
            rule: MemberSelectionRule::Static { addresses: members.to_vec() },
        };
        let record = TreeRecord {
            tree_id: tree_id(group_id, &tree.root()),
            group_id: group_id.to_string(),
            root: tree.root(),
            depth: tree.depth(),
            hash,
            member_count: members.len(),
            created_at: 0,
            layers: tree.layers().to_vec(),
        };
        GroupTree::from_record(&group, &record, &bloom, true)
    }

    fn api(groups: Vec<GroupTree>) -> FixedApi {
        let filters = groups
            .iter()
            .map(|g| GroupTree { layers: vec![], ..g.clone() })
            .collect();
        FixedApi {
            trees: groups,
            filters,
            fetches: Mutex::new(vec![]),
        }
    }

    fn addrs(range: std::ops::RangeInclusive<u8>) -> Vec<Address> {
        range.map(Address::repeat_byte).collect()
    }

    #[tokio::test]
    async fn test_confirms_members_and_drops_false_positives() {
        let members = addrs(1..=4);
        let outsider = Address::repeat_byte(0x99);

        // A filter that also claims the outsider: a forced false positive.
        let mut bloom = BloomFilter::new(512, 3, SipKeys::new(1, 2)).unwrap();
        members.iter().chain([&outsider]).for_each(|a| bloom.insert_address(a));
        let api = api(vec![entry("whales", &members, bloom)]);

        let resolver = EligibilityResolver::new(&api, 10);
        let found = resolver.resolve(&[members[2], outsider]).await.unwrap();

        assert_eq!(found.len(), 1);
        assert_eq!(found[0].address, members[2]);
        assert_eq!(found[0].group_id, "whales");
        assert!(found[0].proof.verify(&found[0].hash));
    }

    #[tokio::test]
    async fn test_only_hit_trees_are_fetched_in_batches() {
        let mut entries = Vec::new();
        for g in 0..5u8 {
            let members = addrs(g * 10 + 1..=g * 10 + 3);
            let bloom = BloomFilter::for_addresses(&members, 256, 3, SipKeys::new(g as u64, 7)).unwrap();
            entries.push(entry(&format!("group-{g}"), &members, bloom));
        }
        let api = api(entries);

        // Members of groups 0, 1 and 3 only.
        let mine = [Address::repeat_byte(1), Address::repeat_byte(12), Address::repeat_byte(33)];
        let resolver = EligibilityResolver::new(&api, 2);
        let found = resolver.resolve(&mine).await.unwrap();

        let mut groups: Vec<_> = found.iter().map(|c| c.group_id.as_str()).collect();
        groups.sort();
        assert_eq!(groups, vec!["group-0", "group-1", "group-3"]);

        let fetches = api.fetches.lock().unwrap();
        assert!(fetches.iter().all(|batch| batch.len() <= 2));
        let fetched: usize = fetches.iter().map(Vec::len).sum();
        assert!(fetched >= 3);
        assert!(fetched <= 5);
    }

    #[tokio::test]
    async fn test_no_candidates_means_no_tree_fetch() {
        let members = addrs(1..=3);
        let bloom = BloomFilter::for_addresses(&members, 1024, 4, SipKeys::new(5, 6)).unwrap();
        let api = api(vec![entry("whales", &members, bloom)]);
        let resolver = EligibilityResolver::new(&api, 10);
        let found = resolver.confirm(&[]).await.unwrap();
        assert!(found.is_empty());
        assert!(api.fetches.lock().unwrap().is_empty());
    }
}
