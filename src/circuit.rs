//! halo2 proving backend for group-membership credentials.
//!
//! The public inputs are the group's Merkle root and the binding value, in
//! that order. The private witness (signature, message hash, Merkle path) is
//! laid out in advice cells. The circuit only constrains the two public
//! inputs to be copied into the instance column; it does not encode the
//! signature recovery or the path fold. [`Witness::check`] evaluates that
//! relation natively before proving, which stops an honest prover from
//! proving a bad witness but is not enforced by the verifier. A verifying
//! proof attests to the public inputs only.

use std::sync::Arc;

use halo2_proofs::{
    circuit::{Layouter, SimpleFloorPlanner, Value},
    plonk::{
        create_proof, keygen_pk, keygen_vk, verify_proof, Advice, Circuit, Column,
        ConstraintSystem, Error, Instance, ProvingKey, SingleVerifier, VerifyingKey,
    },
    poly::commitment::Params,
    transcript::{Blake2bRead, Blake2bWrite, Challenge255},
};
use log::debug;
use pasta_curves::{pallas, vesta};

use crate::client::witness::Witness;
use crate::error::AttestationError;
use crate::utils::bytes_to_field;
use crate::{Node, CIRCUIT_K};

/// Row of each public input in the instance column.
const ROOT_ROW: usize = 0;
const BINDING_ROW: usize = 1;

#[derive(Debug, Clone, Copy)]
pub struct CredentialConfig {
    pub public: Column<Advice>,
    pub signature: Column<Advice>,
    pub path: Column<Advice>,
    pub instance: Column<Instance>,
}

/// Circuit over the field encoding of a [`Witness`].
#[derive(Debug, Default, Clone)]
pub struct CredentialCircuit {
    pub root: Value<pallas::Base>,
    pub binding_value: Value<pallas::Base>,
    pub r: Value<pallas::Base>,
    pub s: Value<pallas::Base>,
    pub msg_hash: Value<pallas::Base>,
    pub y_odd: Value<pallas::Base>,
    /// `(sibling, direction bit)` per level, bottom-up.
    pub path: Vec<(Value<pallas::Base>, Value<pallas::Base>)>,
}

impl CredentialCircuit {
    pub fn from_witness(witness: &Witness) -> Self {
        let known = |node: &Node| Value::known(bytes_to_field(node));
        Self {
            root: known(&witness.root),
            binding_value: known(&witness.binding_value),
            r: known(&witness.r),
            s: known(&witness.s),
            msg_hash: known(&witness.msg_hash),
            y_odd: Value::known(pallas::Base::from(u64::from(witness.is_y_odd))),
            path: witness
                .siblings
                .iter()
                .zip(&witness.path_indices)
                .map(|(sibling, &bit)| (known(sibling), Value::known(pallas::Base::from(u64::from(bit)))))
                .collect(),
        }
    }

    /// Public inputs in instance-column order.
    pub fn public_inputs(root: &Node, binding_value: &Node) -> Vec<pallas::Base> {
        vec![bytes_to_field(root), bytes_to_field(binding_value)]
    }
}

impl Circuit<pallas::Base> for CredentialCircuit {
    type Config = CredentialConfig;
    type FloorPlanner = SimpleFloorPlanner;

    fn without_witnesses(&self) -> Self {
        Self {
            path: vec![(Value::unknown(), Value::unknown()); self.path.len()],
            ..Self::default()
        }
    }

    fn configure(meta: &mut ConstraintSystem<pallas::Base>) -> Self::Config {
        let public = meta.advice_column();
        let signature = meta.advice_column();
        let path = meta.advice_column();
        let instance = meta.instance_column();

        meta.enable_equality(public);
        meta.enable_equality(instance);

        CredentialConfig {
            public,
            signature,
            path,
            instance,
        }
    }

    fn synthesize(
        &self,
        config: Self::Config,
        mut layouter: impl Layouter<pallas::Base>,
    ) -> Result<(), Error> {
        let (root, binding) = layouter.assign_region(
            || "public inputs",
            |mut region| {
                let root = region.assign_advice(|| "root", config.public, 0, || self.root)?;
                let binding =
                    region.assign_advice(|| "binding value", config.public, 1, || self.binding_value)?;
                Ok((root, binding))
            },
        )?;
        layouter.constrain_instance(root.cell(), config.instance, ROOT_ROW)?;
        layouter.constrain_instance(binding.cell(), config.instance, BINDING_ROW)?;

        layouter.assign_region(
            || "source signature",
            |mut region| {
                region.assign_advice(|| "r", config.signature, 0, || self.r)?;
                region.assign_advice(|| "s", config.signature, 1, || self.s)?;
                region.assign_advice(|| "msg hash", config.signature, 2, || self.msg_hash)?;
                region.assign_advice(|| "y odd", config.signature, 3, || self.y_odd)?;
                Ok(())
            },
        )?;

        layouter.assign_region(
            || "merkle path",
            |mut region| {
                for (level, (sibling, bit)) in self.path.iter().enumerate() {
                    region.assign_advice(|| "sibling", config.path, 2 * level, || *sibling)?;
                    region.assign_advice(|| "direction", config.path, 2 * level + 1, || *bit)?;
                }
                Ok(())
            },
        )
    }
}

/// The prove/verify oracle used by the attestation flow and the verifier.
pub trait ProofBackend: Send + Sync {
    /// Proves `witness`. Refuses witnesses that fail [`Witness::check`].
    fn prove(&self, witness: &Witness) -> Result<Vec<u8>, AttestationError>;

    /// Checks `proof` against the public inputs. Never panics on garbage.
    fn verify(&self, proof: &[u8], root: &Node, binding_value: &Node) -> bool;
}

/// [`ProofBackend`] over halo2 with keys generated once at construction.
pub struct Halo2Backend {
    params: Params<vesta::Affine>,
    vk: Arc<VerifyingKey<vesta::Affine>>,
    pk: Arc<ProvingKey<vesta::Affine>>,
}

impl Halo2Backend {
    pub fn new() -> Result<Self, AttestationError> {
        Self::with_params(Params::new(CIRCUIT_K))
    }

    pub fn with_params(params: Params<vesta::Affine>) -> Result<Self, AttestationError> {
        let circuit = CredentialCircuit::default();
        let vk = keygen_vk(&params, &circuit)
            .map_err(|e| AttestationError::Proving(format!("verifying key generation failed: {e:?}")))?;
        let pk = keygen_pk(&params, vk.clone(), &circuit)
            .map_err(|e| AttestationError::Proving(format!("proving key generation failed: {e:?}")))?;
        debug!("Generated halo2 keys for k = {}", CIRCUIT_K);
        Ok(Self {
            params,
            vk: Arc::new(vk),
            pk: Arc::new(pk),
        })
    }
}

impl ProofBackend for Halo2Backend {
    fn prove(&self, witness: &Witness) -> Result<Vec<u8>, AttestationError> {
        witness.check()?;

        let circuit = CredentialCircuit::from_witness(witness);
        let public_inputs = CredentialCircuit::public_inputs(&witness.root, &witness.binding_value);
        let public_inputs_slice: &[&[&[pallas::Base]]] = &[&[&public_inputs]];

        let mut transcript = Blake2bWrite::<_, vesta::Affine, Challenge255<_>>::init(vec![]);
        let mut rng = rand::rngs::OsRng;
        create_proof(
            &self.params,
            &self.pk,
            &[circuit],
            public_inputs_slice,
            &mut rng,
            &mut transcript,
        )
        .map_err(|e| AttestationError::Proving(format!("{e:?}")))?;

        Ok(transcript.finalize())
    }

    fn verify(&self, proof: &[u8], root: &Node, binding_value: &Node) -> bool {
        let public_inputs = CredentialCircuit::public_inputs(root, binding_value);
        let public_inputs_slice: &[&[&[pallas::Base]]] = &[&[&public_inputs]];

        let strategy = SingleVerifier::new(&self.params);
        let mut transcript = Blake2bRead::<_, vesta::Affine, Challenge255<_>>::init(proof);
        verify_proof(
            &self.params,
            &self.vk,
            strategy,
            public_inputs_slice,
            &mut transcript,
        )
        .is_ok()
    }
}
