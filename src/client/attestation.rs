//! The attestation state machine.
//!
//! ```text
//! Unsigned -> SourceSigned -> WitnessBuilt -> Proving -> ProofReady
//!          -> BindingSigned -> Submitted -> Verified | Rejected
//! ```
//!
//! The source signature proves control of the qualifying address; the binding
//! signature, from the account receiving the credential, covers the proof blob
//! digest so a captured proof cannot be attached to another account.
//!
//! A failed step leaves the flow where it was so the step can be retried.
//! After a rejection the flow restarts from `SourceSigned`, keeping the source
//! signature, optionally against a refreshed credential.
//! Proving that was cancelled by dropping its future leaves the flow in
//! `Proving`; [`AttestationFlow::reset`] is then the only way forward.

use ethers::signers::Signer;
use ethers::types::Signature;
use log::{debug, info, warn};

use crate::client::api::CredentialApi;
use crate::client::eligibility::EligibleCredential;
use crate::client::witness::Witness;
use crate::client::worker::ProvingWorker;
use crate::error::{ApiError, AttestationError};
use crate::types::{AttestationSubmission, ProofBlob};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttestationState {
    Unsigned,
    SourceSigned,
    WitnessBuilt,
    Proving,
    ProofReady,
    BindingSigned,
    Submitted,
    Verified,
    Rejected,
}

impl AttestationState {
    pub fn name(&self) -> &'static str {
        match self {
            AttestationState::Unsigned => "unsigned",
            AttestationState::SourceSigned => "source_signed",
            AttestationState::WitnessBuilt => "witness_built",
            AttestationState::Proving => "proving",
            AttestationState::ProofReady => "proof_ready",
            AttestationState::BindingSigned => "binding_signed",
            AttestationState::Submitted => "submitted",
            AttestationState::Verified => "verified",
            AttestationState::Rejected => "rejected",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, AttestationState::Verified | AttestationState::Rejected)
    }
}

pub struct AttestationFlow {
    credential: EligibleCredential,
    source_message: String,
    state: AttestationState,
    source_signature: Option<Signature>,
    witness: Option<Witness>,
    blob: Option<ProofBlob>,
    submission: Option<AttestationSubmission>,
    rejection: Option<String>,
}

impl AttestationFlow {
    pub fn new(credential: EligibleCredential, source_message: impl Into<String>) -> Self {
        Self {
            credential,
            source_message: source_message.into(),
            state: AttestationState::Unsigned,
            source_signature: None,
            witness: None,
            blob: None,
            submission: None,
            rejection: None,
        }
    }

    pub fn state(&self) -> AttestationState {
        self.state
    }

    pub fn credential(&self) -> &EligibleCredential {
        &self.credential
    }

    pub fn witness(&self) -> Option<&Witness> {
        self.witness.as_ref()
    }

    pub fn proof_blob(&self) -> Option<&ProofBlob> {
        self.blob.as_ref()
    }

    pub fn submission(&self) -> Option<&AttestationSubmission> {
        self.submission.as_ref()
    }

    pub fn rejection(&self) -> Option<&str> {
        self.rejection.as_deref()
    }

    /// Discards everything and starts over from `Unsigned`.
    pub fn reset(&mut self) {
        self.state = AttestationState::Unsigned;
        self.source_signature = None;
        self.witness = None;
        self.blob = None;
        self.submission = None;
        self.rejection = None;
    }

    /// Leaves `Rejected` for `SourceSigned`, keeping the source signature.
    ///
    /// Witness, proof and submission are rebuilt by the following steps. A
    /// refreshed credential (for example after the group root moved) must be
    /// for the same address the source signature came from.
    pub fn restart_from_source_signed(
        &mut self,
        refreshed: Option<EligibleCredential>,
    ) -> Result<(), AttestationError> {
        self.ensure_state("restart_from_source_signed", AttestationState::Rejected)?;
        if self.source_signature.is_none() {
            return Err(AttestationError::Witness("missing source signature".to_string()));
        }
        if let Some(credential) = refreshed {
            if credential.address != self.credential.address {
                return Err(AttestationError::Witness(format!(
                    "refreshed credential is for {:?}, source signed as {:?}",
                    credential.address, self.credential.address
                )));
            }
            self.credential = credential;
        }
        debug!(
            "Restarting attestation for {} from source_signed",
            self.credential.group_id
        );
        self.witness = None;
        self.blob = None;
        self.submission = None;
        self.rejection = None;
        self.state = AttestationState::SourceSigned;
        Ok(())
    }

    fn ensure_state(&self, step: &'static str, state: AttestationState) -> Result<(), AttestationError> {
        if self.state != state {
            return Err(AttestationError::InvalidTransition {
                step,
                state: self.state.name(),
            });
        }
        Ok(())
    }

    /// The qualifying address signs the fixed source message.
    pub async fn sign_source<S: Signer>(&mut self, source: &S) -> Result<(), AttestationError> {
        self.ensure_state("sign_source", AttestationState::Unsigned)?;
        if source.address() != self.credential.address {
            return Err(AttestationError::Signing(format!(
                "signer {:?} is not the eligible address {:?}",
                source.address(),
                self.credential.address
            )));
        }
        let signature = source
            .sign_message(self.source_message.as_bytes())
            .await
            .map_err(|e| AttestationError::Signing(e.to_string()))?;
        self.source_signature = Some(signature);
        self.state = AttestationState::SourceSigned;
        Ok(())
    }

    pub fn build_witness(&mut self) -> Result<(), AttestationError> {
        self.ensure_state("build_witness", AttestationState::SourceSigned)?;
        let signature = self
            .source_signature
            .as_ref()
            .ok_or_else(|| AttestationError::Witness("missing source signature".to_string()))?;
        let witness = Witness::build(
            signature,
            &self.source_message,
            &self.credential.proof,
            self.credential.hash,
        )?;
        witness.check()?;
        self.witness = Some(witness);
        self.state = AttestationState::WitnessBuilt;
        Ok(())
    }

    /// Hands the witness to the proving worker and waits for the blob.
    pub async fn prove(&mut self, worker: &ProvingWorker) -> Result<(), AttestationError> {
        self.ensure_state("prove", AttestationState::WitnessBuilt)?;
        let witness = self
            .witness
            .clone()
            .ok_or_else(|| AttestationError::Witness("missing witness".to_string()))?;
        self.state = AttestationState::Proving;
        debug!("Proving membership in {}", self.credential.group_id);

        match worker.prove(witness.clone()).await {
            Ok(zk_proof) => {
                self.blob = Some(ProofBlob::new(
                    &self.credential.group_id,
                    &witness.root,
                    &witness.binding_value,
                    zk_proof,
                ));
                self.state = AttestationState::ProofReady;
                Ok(())
            }
            Err(err) => {
                self.state = AttestationState::WitnessBuilt;
                Err(err)
            }
        }
    }

    /// The receiving account signs the proof blob digest.
    pub async fn sign_binding<S: Signer>(&mut self, account: &S) -> Result<(), AttestationError> {
        self.ensure_state("sign_binding", AttestationState::ProofReady)?;
        let blob = self
            .blob
            .clone()
            .ok_or_else(|| AttestationError::Signing("missing proof blob".to_string()))?;
        let digest = blob
            .digest()
            .map_err(|e| AttestationError::Signing(e.to_string()))?;
        let signature = account
            .sign_message(digest)
            .await
            .map_err(|e| AttestationError::Signing(e.to_string()))?;
        self.submission = Some(AttestationSubmission {
            proof: blob,
            bound_account: account.address(),
            binding_signature: signature.to_string(),
        });
        self.state = AttestationState::BindingSigned;
        Ok(())
    }

    /// Posts the submission; the verifier's answer is terminal.
    ///
    /// A transport failure returns the flow to `BindingSigned`.
    pub async fn submit(&mut self, api: &dyn CredentialApi) -> Result<AttestationState, AttestationError> {
        self.ensure_state("submit", AttestationState::BindingSigned)?;
        let submission = self
            .submission
            .clone()
            .ok_or_else(|| AttestationError::Submission(ApiError::Http("nothing to submit".to_string())))?;
        self.state = AttestationState::Submitted;

        let response = match api.submit_attestation(&submission).await {
            Ok(response) => response,
            Err(err) => {
                self.state = AttestationState::BindingSigned;
                return Err(err.into());
            }
        };

        if response.accepted {
            info!(
                "Credential for {} verified and bound to {:?}",
                self.credential.group_id, submission.bound_account
            );
            self.state = AttestationState::Verified;
            Ok(self.state)
        } else {
            let reason = response.reason.unwrap_or_else(|| "no reason given".to_string());
            warn!("Attestation for {} rejected: {}", self.credential.group_id, reason);
            self.rejection = Some(reason.clone());
            self.state = AttestationState::Rejected;
            Err(AttestationError::Rejected(reason))
        }
    }

    /// Drives every remaining step from `Unsigned` to a terminal state.
    pub async fn run<S: Signer, A: Signer>(
        &mut self,
        source: &S,
        account: &A,
        worker: &ProvingWorker,
        api: &dyn CredentialApi,
    ) -> Result<AttestationState, AttestationError> {
        self.sign_source(source).await?;
        self.build_witness()?;
        self.prove(worker).await?;
        self.sign_binding(account).await?;
        self.submit(api).await
    }
}
