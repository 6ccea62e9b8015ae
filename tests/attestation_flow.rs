use ethers::signers::{LocalWallet, Signer};
use ethers::types::Address;
use std::sync::Arc;
use zkp_group_credentials::{
    circuit::ProofBackend,
    client::{AttestationFlow, AttestationState, EligibilityResolver, LocalApi, ProvingWorker, Witness},
    config::{BloomConfig, TreeConfig},
    error::AttestationError,
    hasher::HashFunction,
    indexer::{canonical_members, Publisher},
    storage::{CredentialStorage, MemoryStorage},
    types::{Group, MemberSelectionRule},
    verifier::Verifier,
    Node,
};

const MESSAGE: &str = "I control this address";

/// Stands in for the halo2 backend: the "proof" is the public inputs.
struct EchoBackend;

impl ProofBackend for EchoBackend {
    fn prove(&self, witness: &Witness) -> Result<Vec<u8>, AttestationError> {
        witness.check()?;
        Ok([witness.root, witness.binding_value].concat())
    }

    fn verify(&self, proof: &[u8], root: &Node, binding_value: &Node) -> bool {
        proof == [*root, *binding_value].concat()
    }
}

struct Deployment {
    storage: Arc<MemoryStorage>,
    api: LocalApi,
    worker: ProvingWorker,
}

async fn deploy(members: &[Address]) -> Deployment {
    let storage = Arc::new(MemoryStorage::new());
    let members = canonical_members(members.iter().copied());
    let group = Group {
        id: "allow-list".to_string(),
        handle: "allow".to_string(),
        display_name: "Allow list".to_string(),
        rule: MemberSelectionRule::Static {
            addresses: members.clone(),
        },
    };
    let tree = TreeConfig {
        depth: 4,
        large_depth: 6,
        min_members: 1,
        hash: HashFunction::Poseidon,
        proof_write_chunk: 4,
    };
    let publisher = Publisher::new(storage.clone(), &tree, &BloomConfig::default()).unwrap();
    publisher.publish(&group, &members).await.unwrap();

    let backend: Arc<dyn ProofBackend> = Arc::new(EchoBackend);
    let verifier = Arc::new(Verifier::new(storage.clone(), backend.clone(), vec![group.clone()]));
    Deployment {
        storage: storage.clone(),
        api: LocalApi::new(storage, vec![group], verifier),
        worker: ProvingWorker::spawn(backend).unwrap(),
    }
}

fn wallets(count: usize) -> Vec<LocalWallet> {
    (0..count)
        .map(|_| LocalWallet::new(&mut rand::thread_rng()))
        .collect()
}

#[tokio::test]
async fn test_member_attests_once() {
    let members = wallets(5);
    let addresses: Vec<Address> = members.iter().map(Signer::address).collect();
    let deployment = deploy(&addresses).await;
    let source = &members[3];
    let account = LocalWallet::new(&mut rand::thread_rng());

    let resolver = EligibilityResolver::new(&deployment.api, 2);
    let eligible = resolver.resolve(&[source.address()]).await.unwrap();
    assert_eq!(eligible.len(), 1);
    assert_eq!(eligible[0].group_id, "allow-list");

    let mut flow = AttestationFlow::new(eligible[0].clone(), MESSAGE);
    let state = flow
        .run(source, &account, &deployment.worker, &deployment.api)
        .await
        .unwrap();
    assert_eq!(state, AttestationState::Verified);

    let credential = deployment
        .storage
        .get_credential(&account.address(), "allow-list")
        .await
        .unwrap()
        .unwrap();
    let blob = flow.proof_blob().unwrap();
    assert_eq!(credential.proof.binding_value, blob.binding_value);

    // The same source signature yields the same binding value, whatever the
    // receiving account: a second credential is refused.
    let other_account = LocalWallet::new(&mut rand::thread_rng());
    let mut replay = AttestationFlow::new(eligible[0].clone(), MESSAGE);
    let err = replay
        .run(source, &other_account, &deployment.worker, &deployment.api)
        .await
        .unwrap_err();
    assert!(matches!(err, AttestationError::Rejected(_)));
    assert_eq!(replay.state(), AttestationState::Rejected);
    assert!(replay.rejection().unwrap().contains("binding value"));
}

#[tokio::test]
async fn test_outsider_is_not_eligible() {
    let members = wallets(4);
    let addresses: Vec<Address> = members.iter().map(Signer::address).collect();
    let deployment = deploy(&addresses).await;

    let outsider = LocalWallet::new(&mut rand::thread_rng());
    let resolver = EligibilityResolver::new(&deployment.api, 4);
    let eligible = resolver.resolve(&[outsider.address()]).await.unwrap();
    assert!(eligible.is_empty());
}

#[tokio::test]
async fn test_source_key_must_match_eligible_address() {
    let members = wallets(3);
    let addresses: Vec<Address> = members.iter().map(Signer::address).collect();
    let deployment = deploy(&addresses).await;

    let resolver = EligibilityResolver::new(&deployment.api, 4);
    let eligible = resolver.resolve(&[members[0].address()]).await.unwrap();
    let mut flow = AttestationFlow::new(eligible[0].clone(), MESSAGE);

    assert!(flow.sign_source(&members[1]).await.is_err());
    assert_eq!(flow.state(), AttestationState::Unsigned);
}
