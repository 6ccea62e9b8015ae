use anyhow::{Context, Result};
use clap::Parser;
use log::{debug, error, info};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use zkp_group_credentials::{
    circuit::Halo2Backend,
    config::{Config, CONFIG_ENV, DEFAULT_CONFIG_PATH},
    error::VerifierError,
    storage::SledStorage,
    types::AttestationSubmission,
    verifier::Verifier,
    CIRCUIT_K,
};

/// Default maximum allowed size for the submission JSON file (1MB).
/// Can be overridden via `ZKP_MAX_SUBMISSION_FILE_SIZE`.
const DEFAULT_MAX_SUBMISSION_FILE_SIZE: u64 = 1024 * 1024;

/// Default maximum allowed size for the ZK proof bytes (512KB).
/// Can be overridden via `ZKP_MAX_ZK_PROOF_SIZE`.
const DEFAULT_MAX_ZK_PROOF_SIZE: usize = 512 * 1024;

fn get_max_submission_file_size() -> u64 {
    std::env::var("ZKP_MAX_SUBMISSION_FILE_SIZE")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(DEFAULT_MAX_SUBMISSION_FILE_SIZE)
}

fn get_max_zk_proof_size() -> usize {
    std::env::var("ZKP_MAX_ZK_PROOF_SIZE")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(DEFAULT_MAX_ZK_PROOF_SIZE)
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Verify an attestation and record the credential", long_about = None)]
struct Args {
    #[arg(short, long, env = CONFIG_ENV, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    #[arg(short, long)]
    submission_file: PathBuf,
}

fn read_submission(path: &Path) -> Result<AttestationSubmission> {
    if !path.exists() {
        return Err(anyhow::anyhow!(
            "Submission file does not exist: {}",
            path.display()
        ));
    }

    let metadata = fs::metadata(path).context("Failed to read submission file metadata")?;
    debug!("Submission file size: {} bytes", metadata.len());
    let max_file_size = get_max_submission_file_size();
    if metadata.len() > max_file_size {
        return Err(anyhow::anyhow!(
            "Submission file too large: {} bytes (max {} bytes). Set ZKP_MAX_SUBMISSION_FILE_SIZE to raise the limit",
            metadata.len(),
            max_file_size
        ));
    }

    let content = fs::read_to_string(path).context("Failed to read submission file")?;
    let submission: AttestationSubmission =
        serde_json::from_str(&content).context("Failed to parse submission JSON")?;

    if submission.proof.zk_proof.len() > get_max_zk_proof_size() {
        return Err(anyhow::anyhow!(
            "ZK proof size exceeds limit: {} bytes (max {} bytes). Check that prover and verifier use the same CIRCUIT_K (current: {}), or set ZKP_MAX_ZK_PROOF_SIZE",
            submission.proof.zk_proof.len(),
            get_max_zk_proof_size(),
            CIRCUIT_K
        ));
    }
    Ok(submission)
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let config = Config::load_from_file(&args.config)?;
    config
        .validate()
        .with_context(|| format!("Invalid configuration in {}", args.config.display()))?;

    info!("Loading submission from: {}", args.submission_file.display());
    println!("Loading submission from: {}", args.submission_file.display());
    let submission = read_submission(&args.submission_file)?;

    println!("Submission details:");
    println!("  Group:         {}", submission.proof.group_id);
    println!("  Merkle Root:   {}", submission.proof.merkle_root);
    println!("  Binding value: {}", submission.proof.binding_value);
    println!("  Bound account: {:?}", submission.bound_account);
    println!("  ZK Proof Size: {} bytes", submission.proof.zk_proof.len());

    let storage = Arc::new(SledStorage::open(&config.storage.data_dir).with_context(|| {
        format!(
            "Failed to open storage at {}",
            config.storage.data_dir.display()
        )
    })?);

    println!("Generating ZK-SNARK keys...");
    let backend = Arc::new(Halo2Backend::new().context("Failed to set up proof system")?);
    let verifier = Verifier::new(storage, backend, config.group_list());

    println!("Verifying attestation...");
    match verifier.verify(&submission).await {
        Ok(credential) => {
            info!(
                "Credential recorded for {:?} in {}",
                credential.account, credential.group_id
            );
            println!("✓ Attestation verified");
            println!("  Credential: {} for {:?}", credential.group_id, credential.account);
            println!("  Verified at: {}", credential.verified_at);
            Ok(())
        }
        Err(VerifierError::Rejected(rejection)) => {
            error!("Attestation rejected: {}", rejection);
            println!("✗ Attestation rejected: {}", rejection);
            Err(anyhow::anyhow!("Attestation rejected: {rejection}"))
        }
        Err(err) => Err(err).context("Verification could not complete"),
    }
}
