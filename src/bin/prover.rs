use anyhow::{Context, Result};
use clap::Parser;
use ethers::signers::{LocalWallet, Signer};
use log::info;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use zkp_group_credentials::{
    circuit::{Halo2Backend, ProofBackend},
    client::{AttestationFlow, CredentialApi, EligibilityResolver, HttpApi, LocalApi, ProvingWorker},
    config::{Config, CONFIG_ENV, DEFAULT_CONFIG_PATH},
    ethereum::validate_private_key,
    storage::SledStorage,
    verifier::Verifier,
};

#[derive(Parser, Debug)]
#[command(author, version, about = "Find eligible groups for an address and attest one membership", long_about = None)]
struct Args {
    #[arg(short, long, env = CONFIG_ENV, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Key of the qualifying address
    #[arg(short, long, env = "ZKP_SOURCE_KEY", hide_env_values = true)]
    private_key: String,

    /// Key of the account receiving the credential; the source key if unset
    #[arg(short, long, env = "ZKP_ACCOUNT_KEY", hide_env_values = true)]
    account_key: Option<String>,

    /// Credential service; overrides `client.api_url`
    #[arg(long)]
    api_url: Option<String>,

    /// Group to attest; the first eligible group if unset
    #[arg(short, long)]
    group: Option<String>,

    #[arg(short, long, default_value = "attestation.json")]
    output: PathBuf,

    /// Stop after writing the signed submission
    #[arg(long)]
    no_submit: bool,
}

fn load_wallet(key: &str, name: &str) -> Result<LocalWallet> {
    validate_private_key(key).with_context(|| format!("Invalid {name}"))?;
    key.parse::<LocalWallet>()
        .with_context(|| format!("Failed to parse {name}"))
}

fn load_config(path: &Path) -> Result<Config> {
    let config = Config::load_from_file(path)?;
    config
        .validate()
        .with_context(|| format!("Invalid configuration in {}", path.display()))?;
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let config = load_config(&args.config)?;

    let source = load_wallet(&args.private_key, "private key")?;
    let account = match &args.account_key {
        Some(key) => load_wallet(key, "account key")?,
        None => source.clone(),
    };
    println!("Source address:  {:?}", source.address());
    println!("Bound account:   {:?}", account.address());

    println!("Generating proving keys...");
    let backend: Arc<dyn ProofBackend> =
        Arc::new(Halo2Backend::new().context("Failed to set up proof system")?);

    let api: Box<dyn CredentialApi> = match args.api_url.as_ref().or(config.client.api_url.as_ref()) {
        Some(url) => {
            info!("Using credential service at {}", url);
            Box::new(HttpApi::new(url))
        }
        None => {
            info!(
                "Using local storage at {}",
                config.storage.data_dir.display()
            );
            let storage = Arc::new(SledStorage::open(&config.storage.data_dir).with_context(|| {
                format!(
                    "Failed to open storage at {}",
                    config.storage.data_dir.display()
                )
            })?);
            let groups = config.group_list();
            let verifier = Arc::new(Verifier::new(
                storage.clone(),
                backend.clone(),
                groups.clone(),
            ));
            Box::new(LocalApi::new(storage, groups, verifier))
        }
    };

    let resolver = EligibilityResolver::new(api.as_ref(), config.client.tree_batch_size);
    let eligible = resolver
        .resolve(&[source.address()])
        .await
        .context("Eligibility lookup failed")?;
    if eligible.is_empty() {
        return Err(anyhow::anyhow!(
            "{:?} is not a member of any published group",
            source.address()
        ));
    }
    for credential in &eligible {
        println!(
            "Eligible for {} (tree {}, depth {})",
            credential.group_id,
            credential.tree_id,
            credential.proof.path.len() + 1
        );
    }

    let credential = match &args.group {
        Some(group) => eligible
            .into_iter()
            .find(|c| &c.group_id == group)
            .ok_or_else(|| anyhow::anyhow!("Not eligible for group {group}"))?,
        None => eligible
            .into_iter()
            .next()
            .ok_or_else(|| anyhow::anyhow!("No eligible group"))?,
    };

    let worker = ProvingWorker::spawn(backend).context("Failed to start proving worker")?;
    let mut flow = AttestationFlow::new(credential, config.client.source_message.clone());

    flow.sign_source(&source).await?;
    flow.build_witness()?;
    println!("Generating ZK proof for {}...", flow.credential().group_id);
    flow.prove(&worker).await?;
    flow.sign_binding(&account).await?;

    let submission = flow
        .submission()
        .ok_or_else(|| anyhow::anyhow!("Flow produced no submission"))?;
    let json = serde_json::to_string_pretty(submission).context("Failed to serialize submission")?;
    fs::write(&args.output, json)
        .with_context(|| format!("Failed to write {}", args.output.display()))?;
    println!("Submission written to {}", args.output.display());
    println!("  Binding value: {}", submission.proof.binding_value);
    println!("  Proof size:    {} bytes", submission.proof.zk_proof.len());

    if args.no_submit {
        return Ok(());
    }

    let state = flow.submit(api.as_ref()).await?;
    println!("Attestation {}", state.name());
    Ok(())
}
