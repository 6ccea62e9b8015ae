use async_trait::async_trait;
use ethers::types::{Address, U256};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use zkp_group_credentials::{
    config::{ChainConfig, Config, ContractConfig, GroupConfig, StorageConfig, TreeConfig},
    error::{RpcError, TreeError},
    ethereum::{address_to_leaf, MINT_SENTINEL},
    hasher::HashFunction,
    indexer::{ContractSets, Indexer, LogProvider, PublishOutcome, RpcPool, SharedProvider},
    merkle::{verify_path, MerkleTree},
    storage::{active_tree, CredentialStorage, MemoryStorage, SledStorage},
    types::{MemberSelectionRule, TransferEvent},
    wire::{export_active, GroupTreeList},
    Node,
};

const TOKEN: &str = "0x742d35cc6634c0532925a3b844bc454e4438f44e";

fn alice() -> Address {
    Address::repeat_byte(0xaa)
}

fn bob() -> Address {
    Address::repeat_byte(0xbb)
}

fn transfer(block: u64, from: Address, to: Address, value: u64) -> TransferEvent {
    TransferEvent {
        contract_id: "token".to_string(),
        from,
        to,
        value: U256::from(value),
        block_number: block,
        tx_index: 0,
        log_index: 0,
    }
}

/// One million minted to Alice, then 2,000 moved to Bob.
fn history() -> Vec<TransferEvent> {
    vec![
        transfer(100, MINT_SENTINEL, alice(), 1_000_000),
        transfer(105, alice(), bob(), 2_000),
    ]
}

struct ChainSnapshot {
    head: u64,
    events: Vec<TransferEvent>,
}

#[async_trait]
impl LogProvider for ChainSnapshot {
    fn name(&self) -> &str {
        "snapshot"
    }

    async fn block_number(&self) -> Result<u64, RpcError> {
        Ok(self.head)
    }

    async fn transfer_logs(
        &self,
        contract_id: &str,
        _address: Address,
        from_block: u64,
        to_block: u64,
    ) -> Result<Vec<TransferEvent>, RpcError> {
        Ok(self
            .events
            .iter()
            .filter(|e| (from_block..=to_block).contains(&e.block_number))
            .map(|e| TransferEvent {
                contract_id: contract_id.to_string(),
                ..e.clone()
            })
            .collect())
    }
}

fn config(data_dir: &std::path::Path) -> Config {
    Config {
        chains: vec![ChainConfig {
            name: "mainnet".to_string(),
            rpc_urls: vec!["http://localhost:8545".to_string()],
            api_key_env: None,
        }],
        contracts: vec![ContractConfig {
            id: "token".to_string(),
            chain: "mainnet".to_string(),
            address: TOKEN.to_string(),
            deployed_block: 100,
        }],
        tree: TreeConfig {
            depth: 4,
            large_depth: 6,
            min_members: 1,
            hash: HashFunction::Sha3_256,
            proof_write_chunk: 8,
        },
        storage: StorageConfig {
            data_dir: data_dir.to_path_buf(),
        },
        groups: vec![
            GroupConfig {
                id: "token-whales".to_string(),
                handle: "whales".to_string(),
                display_name: "Token whales".to_string(),
                rule: MemberSelectionRule::Whale {
                    contract: "token".to_string(),
                },
            },
            GroupConfig {
                id: "token-early".to_string(),
                handle: "early".to_string(),
                display_name: "Early holders".to_string(),
                rule: MemberSelectionRule::EarlyHolder {
                    contract: "token".to_string(),
                },
            },
        ],
        ..Config::default()
    }
}

fn indexer(config: Config, storage: Arc<dyn CredentialStorage>, chain: ChainSnapshot) -> Indexer {
    let pool = RpcPool::new(
        vec![Arc::new(chain) as SharedProvider],
        Duration::from_millis(5),
    )
    .unwrap();
    let mut pools = HashMap::new();
    pools.insert("mainnet".to_string(), pool);
    Indexer::with_pools(config, storage, pools)
}

#[test]
fn test_recipient_of_large_transfer_is_a_whale() {
    let sets = ContractSets::derive("token", &history()).unwrap();
    // Supply 1,000,000 puts the threshold at 1,000; Bob holds 2,000.
    assert!(sets.whales.contains(&bob()));
    assert!(sets.whales.contains(&alice()));
    // ceil(5% of 2 recipients) = 1: only the first.
    assert_eq!(sets.early_holders, vec![alice()]);
}

#[test]
fn test_sha3_tree_matches_hand_computed_root() {
    let mut members: Vec<Address> = (1..=8u8).map(Address::repeat_byte).collect();
    members.push(alice());
    members.push(bob());
    members.sort();
    let leaves: Vec<Node> = members.iter().map(address_to_leaf).collect();

    let tree = MerkleTree::build(&HashFunction::Sha3_256, 5, &leaves).unwrap();
    assert_eq!(
        hex::encode(tree.root()),
        "a63db34fbe8f075466141a2c399eb956b3ff9a47f66a087ddc582357ada58c08"
    );

    // Ten members do not fit the eight leaves of a depth 4 tree.
    assert!(matches!(
        MerkleTree::build(&HashFunction::Sha3_256, 4, &leaves),
        Err(TreeError::CapacityExceeded { members: 10, capacity: 8, depth: 4 })
    ));

    let proof = tree.proof_for_leaf(&address_to_leaf(&bob())).unwrap();
    assert_eq!(proof.path.len(), 4);
    assert!(proof.verify(&HashFunction::Sha3_256));
    assert!(tree
        .position(&address_to_leaf(&Address::repeat_byte(0x42)))
        .is_none());
}

#[tokio::test]
async fn test_indexer_publishes_whales_and_serves_their_proofs() {
    let dir = TempDir::new().unwrap();
    let config = config(dir.path());
    let groups = config.group_list();
    let storage = Arc::new(MemoryStorage::new());
    let indexer = indexer(
        config,
        storage.clone(),
        ChainSnapshot { head: 110, events: history() },
    );

    let (summary, outcomes) = indexer.run_once().await.unwrap();
    assert!(summary.is_clean());
    assert_eq!(summary.reports[0].events, 2);
    assert_eq!(outcomes.len(), 2);
    assert!(outcomes
        .iter()
        .all(|o| matches!(o, PublishOutcome::Published { .. })));

    let whales = active_tree(storage.as_ref(), "token-whales")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(whales.member_count, 2);
    assert_eq!(whales.depth, 4);

    let record = storage
        .get_proof(&whales.tree_id, &bob())
        .await
        .unwrap()
        .unwrap();
    assert!(verify_path(
        &HashFunction::Sha3_256,
        &address_to_leaf(&bob()),
        &record.path,
        &record.path_indices,
        &whales.root,
    ));
    assert!(storage
        .get_proof(&whales.tree_id, &Address::repeat_byte(0x42))
        .await
        .unwrap()
        .is_none());

    // The exported wire form carries enough to rebuild Bob's proof client side.
    let list = export_active(storage.as_ref(), &groups, Some(std::slice::from_ref(&whales.tree_id)))
        .await
        .unwrap();
    let decoded = GroupTreeList::from_bytes(&list.to_bytes()).unwrap();
    let entry = &decoded.groups[0];
    assert!(entry.bloom().unwrap().contains_address(&bob()));
    let sparse = entry.sparse_tree().unwrap();
    assert_eq!(sparse.root(), whales.root);
    let proof = sparse.proof_for(&address_to_leaf(&bob())).unwrap();
    assert!(proof.verify(&HashFunction::Sha3_256));
    assert!(sparse.proof_for(&address_to_leaf(&Address::repeat_byte(0x42))).is_none());
}

#[tokio::test]
async fn test_sled_indexer_resumes_from_checkpoint() {
    let dir = TempDir::new().unwrap();
    let data_dir = dir.path().join("db");

    {
        let storage = Arc::new(SledStorage::open(&data_dir).unwrap());
        let indexer = indexer(
            config(&data_dir),
            storage.clone(),
            ChainSnapshot { head: 110, events: history() },
        );
        let summary = indexer.sync_all().await.unwrap();
        assert!(summary.is_clean());
        storage.flush().await.unwrap();
    }

    let storage = Arc::new(SledStorage::open(&data_dir).unwrap());
    assert_eq!(
        storage.get_checkpoint("token").await.unwrap().unwrap().last_block,
        110
    );

    let carol = Address::repeat_byte(0xcc);
    let mut events = history();
    events.push(transfer(120, bob(), carol, 1_500));
    let indexer = indexer(config(&data_dir), storage.clone(), ChainSnapshot { head: 130, events });

    let summary = indexer.sync_all().await.unwrap();
    let report = &summary.reports[0];
    assert_eq!(report.from_block, 111);
    assert_eq!(report.to_block, 130);
    assert_eq!(report.events, 1);
    assert_eq!(storage.events("token").await.unwrap().len(), 3);

    // Carol's 1,500 crosses the threshold; Bob stays a whale at 500.
    let outcomes = indexer.publish_all().await.unwrap();
    let published = outcomes
        .iter()
        .find_map(|o| match o {
            PublishOutcome::Published { group_id, members, .. } if group_id == "token-whales" => {
                Some(*members)
            }
            _ => None,
        })
        .unwrap();
    assert_eq!(published, 3);
}
