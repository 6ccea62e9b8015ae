//! Checks a submitted attestation and records the resulting credential.
//!
//! Checks run in a fixed order and stop at the first failure:
//! 1. the proof blob is well formed and fresh
//! 2. the binding signature over the blob digest recovers to the bound account
//! 3. the group is known and the blob's root is its active root
//! 4. the zero-knowledge proof verifies against `(root, binding value)`
//! 5. the account holds no credential for the group and the binding value
//!    has not been used
//!
//! Only then is the credential persisted.

use std::str::FromStr;
use std::sync::Arc;

use ethers::types::Signature;
use log::{info, warn};
use tokio::sync::Mutex;

use crate::circuit::ProofBackend;
use crate::error::{Rejection, StorageError, VerifierError};
use crate::storage::{active_tree, CredentialStorage};
use crate::types::{AttestationResponse, AttestationSubmission, Credential, Group};
use crate::utils::unix_timestamp;

pub struct Verifier {
    storage: Arc<dyn CredentialStorage>,
    backend: Arc<dyn ProofBackend>,
    groups: Vec<Group>,
    // Serializes the duplicate check with the credential write.
    registry: Mutex<()>,
}

fn malformed(err: impl std::fmt::Display) -> Rejection {
    Rejection::Malformed(err.to_string())
}

impl Verifier {
    pub fn new(
        storage: Arc<dyn CredentialStorage>,
        backend: Arc<dyn ProofBackend>,
        groups: Vec<Group>,
    ) -> Self {
        Self {
            storage,
            backend,
            groups,
            registry: Mutex::new(()),
        }
    }

    /// Runs every check and persists the credential on success.
    pub async fn verify(
        &self,
        submission: &AttestationSubmission,
    ) -> Result<Credential, VerifierError> {
        let blob = &submission.proof;
        blob.validate().map_err(malformed)?;
        let root = blob.root().map_err(malformed)?;
        let binding_value = blob.binding().map_err(malformed)?;

        let signature = Signature::from_str(&submission.binding_signature).map_err(malformed)?;
        let digest = blob.digest().map_err(malformed)?;
        if signature
            .verify(digest.to_vec(), submission.bound_account)
            .is_err()
        {
            return Err(Rejection::BadBindingSignature(submission.bound_account).into());
        }

        if !self.groups.iter().any(|g| g.id == blob.group_id) {
            return Err(Rejection::UnknownGroup(blob.group_id.clone()).into());
        }
        match active_tree(self.storage.as_ref(), &blob.group_id).await? {
            Some(tree) if tree.root == root => {}
            _ => return Err(Rejection::StaleRoot(blob.group_id.clone()).into()),
        }

        let backend = Arc::clone(&self.backend);
        let proof = blob.zk_proof.clone();
        let valid = tokio::task::spawn_blocking(move || backend.verify(&proof, &root, &binding_value))
            .await
            .map_err(|e| StorageError::Backend(format!("verification task failed: {e}")))?;
        if !valid {
            return Err(Rejection::InvalidProof.into());
        }

        let _guard = self.registry.lock().await;
        if self
            .storage
            .get_credential(&submission.bound_account, &blob.group_id)
            .await?
            .is_some()
        {
            return Err(Rejection::DuplicateCredential(blob.group_id.clone()).into());
        }
        if self.storage.binding_used(&blob.group_id, &binding_value).await? {
            return Err(Rejection::DuplicateBinding(blob.group_id.clone()).into());
        }

        let credential = Credential {
            account: submission.bound_account,
            group_id: blob.group_id.clone(),
            proof: blob.clone(),
            binding_signature: submission.binding_signature.clone(),
            binding_value,
            verified_at: unix_timestamp(),
        };
        self.storage.save_credential(&credential).await?;
        info!(
            "Credential for group {} issued to {:?}",
            credential.group_id, credential.account
        );
        Ok(credential)
    }

    /// [`Verifier::verify`] folded into the API response shape.
    pub async fn respond(
        &self,
        submission: &AttestationSubmission,
    ) -> Result<AttestationResponse, StorageError> {
        match self.verify(submission).await {
            Ok(_) => Ok(AttestationResponse {
                accepted: true,
                reason: None,
            }),
            Err(VerifierError::Rejected(rejection)) => {
                warn!("Attestation rejected: {}", rejection);
                Ok(AttestationResponse {
                    accepted: false,
                    reason: Some(rejection.to_string()),
                })
            }
            Err(VerifierError::Storage(err)) => Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::AttestationError;
    use crate::client::witness::Witness;
    use crate::hasher::HashFunction;
    use crate::storage::MemoryStorage;
    use crate::types::{MemberSelectionRule, ProofBlob, TreeRecord};
    use crate::Node;
    use ethers::signers::{LocalWallet, Signer};
    use ethers::types::Address;

    /// Accepts a proof iff it equals `root || binding`.
    struct EchoBackend;

    impl ProofBackend for EchoBackend {
        fn prove(&self, witness: &Witness) -> Result<Vec<u8>, AttestationError> {
            Ok([witness.root, witness.binding_value].concat())
        }

        fn verify(&self, proof: &[u8], root: &Node, binding_value: &Node) -> bool {
            proof == [*root, *binding_value].concat()
        }
    }

    const ROOT: Node = [7u8; 32];
    const BINDING: Node = [8u8; 32];

    async fn setup() -> (Verifier, Arc<MemoryStorage>) {
        let storage = Arc::new(MemoryStorage::new());
        storage
            .save_tree(&TreeRecord {
                tree_id: "whales:07".to_string(),
                group_id: "whales".to_string(),
                root: ROOT,
                depth: 3,
                hash: HashFunction::Sha3_256,
                member_count: 3,
                created_at: 0,
                layers: vec![vec![[1u8; 32]; 3], vec![[2u8; 32]; 2], vec![ROOT]],
            })
            .await
            .unwrap();
        storage.activate_tree("whales", "whales:07").await.unwrap();
        let group = Group {
            id: "whales".to_string(),
            handle: "whales".to_string(),
            display_name: "Whales".to_string(),
            rule: MemberSelectionRule::Static { addresses: vec![] },
        };
        let verifier = Verifier::new(storage.clone(), Arc::new(EchoBackend), vec![group]);
        (verifier, storage)
    }

    async fn submission(wallet: &LocalWallet, blob: ProofBlob) -> AttestationSubmission {
        let signature = wallet.sign_message(blob.digest().unwrap()).await.unwrap();
        AttestationSubmission {
            proof: blob,
            bound_account: wallet.address(),
            binding_signature: signature.to_string(),
        }
    }

    fn blob(group: &str, root: &Node, binding: &Node) -> ProofBlob {
        ProofBlob::new(group, root, binding, [*root, *binding].concat())
    }

    fn wallet() -> LocalWallet {
        LocalWallet::new(&mut rand::thread_rng())
    }

    #[tokio::test]
    async fn test_accepts_and_persists() {
        let (verifier, storage) = setup().await;
        let wallet = wallet();
        let credential = verifier
            .verify(&submission(&wallet, blob("whales", &ROOT, &BINDING)).await)
            .await
            .unwrap();
        assert_eq!(credential.account, wallet.address());
        assert!(storage.binding_used("whales", &BINDING).await.unwrap());
        assert!(storage
            .get_credential(&wallet.address(), "whales")
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn test_binding_signature_must_match_account() {
        let (verifier, _) = setup().await;
        let mut submission = submission(&wallet(), blob("whales", &ROOT, &BINDING)).await;
        let other = Address::repeat_byte(0x42);
        submission.bound_account = other;
        assert!(matches!(
            verifier.verify(&submission).await,
            Err(VerifierError::Rejected(Rejection::BadBindingSignature(a))) if a == other
        ));
    }

    #[tokio::test]
    async fn test_replayed_proof_on_other_account_is_rejected() {
        let (verifier, _) = setup().await;
        let original = submission(&wallet(), blob("whales", &ROOT, &BINDING)).await;
        verifier.verify(&original).await.unwrap();

        // A captured proof re-signed by another account still carries the
        // same binding value.
        let thief = submission(&wallet(), original.proof.clone()).await;
        assert!(matches!(
            verifier.verify(&thief).await,
            Err(VerifierError::Rejected(Rejection::DuplicateBinding(_)))
        ));
    }

    #[tokio::test]
    async fn test_second_credential_for_account_is_rejected() {
        let (verifier, _) = setup().await;
        let wallet = wallet();
        verifier
            .verify(&submission(&wallet, blob("whales", &ROOT, &BINDING)).await)
            .await
            .unwrap();
        let again = submission(&wallet, blob("whales", &ROOT, &[9u8; 32])).await;
        assert!(matches!(
            verifier.verify(&again).await,
            Err(VerifierError::Rejected(Rejection::DuplicateCredential(_)))
        ));
    }

    #[tokio::test]
    async fn test_stale_root_unknown_group_and_bad_proof() {
        let (verifier, _) = setup().await;
        let wallet = wallet();

        let stale = submission(&wallet, blob("whales", &[1u8; 32], &BINDING)).await;
        assert!(matches!(
            verifier.verify(&stale).await,
            Err(VerifierError::Rejected(Rejection::StaleRoot(_)))
        ));

        let unknown = submission(&wallet, blob("minnows", &ROOT, &BINDING)).await;
        assert!(matches!(
            verifier.verify(&unknown).await,
            Err(VerifierError::Rejected(Rejection::UnknownGroup(_)))
        ));

        let mut forged = blob("whales", &ROOT, &BINDING);
        forged.zk_proof = vec![0u8; 64];
        let forged = submission(&wallet, forged).await;
        let response = verifier.respond(&forged).await.unwrap();
        assert!(!response.accepted);
        assert_eq!(response.reason, Some(Rejection::InvalidProof.to_string()));
    }
}
