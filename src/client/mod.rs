//! Client side of the credential protocol: find which of a user's addresses
//! qualify for which groups, then prove and attest one membership.

pub mod api;
pub mod attestation;
pub mod eligibility;
pub mod witness;
pub mod worker;

pub use api::{CredentialApi, HttpApi, LocalApi};
pub use attestation::{AttestationFlow, AttestationState};
pub use eligibility::{bloom_candidates, Candidate, EligibilityResolver, EligibleCredential};
pub use witness::Witness;
pub use worker::ProvingWorker;
