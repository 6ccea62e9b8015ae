use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use log::{error, info};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use zkp_group_credentials::{
    config::{Config, CONFIG_ENV, DEFAULT_CONFIG_PATH},
    ethereum::read_address_file,
    hasher::HashFunction,
    indexer::{canonical_members, Indexer, PublishOutcome, Publisher, SyncSummary},
    storage::{CredentialStorage, MemoryStorage, SledStorage},
    types::{Group, MemberSelectionRule},
    wire::export_active,
};

#[derive(Parser, Debug)]
#[command(author, version, about = "Transfer indexer and group tree publisher", long_about = None)]
struct Args {
    #[arg(short, long, env = CONFIG_ENV, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Ingest new Transfer logs for every configured contract
    Sync,
    /// Resolve every group and publish changed trees
    Publish,
    /// Sync then publish, once or every `interval` seconds
    Run {
        #[arg(short, long)]
        interval: Option<u64>,
    },
    /// Build a tree over an address file without touching indexer state
    BuildTree {
        #[arg(short, long)]
        accounts_file: PathBuf,
        #[arg(short, long, default_value = "static")]
        group: String,
        #[arg(long)]
        depth: Option<u32>,
        #[arg(long)]
        hash: Option<HashFunction>,
        #[arg(short, long, default_value = "tree.pb")]
        output: PathBuf,
    },
    /// Write the wire encoding of the active trees
    Export {
        /// Full trees for these ids; filters of every active tree otherwise
        #[arg(long, value_delimiter = ',')]
        ids: Vec<String>,
        #[arg(short, long, default_value = "trees.pb")]
        output: PathBuf,
    },
    /// Print storage counters
    Stats,
}

fn load_config(path: &Path) -> Result<Config> {
    let config = Config::load_from_file(path)?;
    config
        .validate()
        .with_context(|| format!("Invalid configuration in {}", path.display()))?;
    Ok(config)
}

fn open_storage(config: &Config) -> Result<Arc<dyn CredentialStorage>> {
    let storage = SledStorage::open(&config.storage.data_dir).with_context(|| {
        format!(
            "Failed to open storage at {}",
            config.storage.data_dir.display()
        )
    })?;
    Ok(Arc::new(storage))
}

fn print_sync(summary: &SyncSummary) {
    for report in &summary.reports {
        println!(
            "{}: blocks {}..={}, {} new events, supply {}, {} whales",
            report.contract_id,
            report.from_block,
            report.to_block,
            report.events,
            report.total_supply,
            report.whales
        );
    }
    for (contract, err) in &summary.failures {
        println!("{}: FAILED: {}", contract, err);
    }
}

fn print_publish(outcomes: &[PublishOutcome]) {
    for outcome in outcomes {
        match outcome {
            PublishOutcome::Skipped { group_id, reason } => {
                println!("{}: skipped ({})", group_id, reason)
            }
            PublishOutcome::Unchanged { group_id, tree_id } => {
                println!("{}: unchanged ({})", group_id, tree_id)
            }
            PublishOutcome::Published {
                group_id,
                tree_id,
                members,
                depth,
                retired,
            } => {
                println!(
                    "{}: published {} ({} members, depth {})",
                    group_id, tree_id, members, depth
                );
                if let Some(old) = retired {
                    println!("  retired {}", old);
                }
            }
        }
    }
}

fn check_sync(summary: &SyncSummary) -> Result<()> {
    if summary.is_clean() {
        return Ok(());
    }
    Err(anyhow::anyhow!(
        "{} contract(s) failed to sync",
        summary.failures.len()
    ))
}

async fn build_tree(
    config: &Config,
    accounts_file: &Path,
    group_id: String,
    depth: Option<u32>,
    hash: Option<HashFunction>,
    output: &Path,
) -> Result<()> {
    let addresses = read_address_file(accounts_file)?;
    let members = canonical_members(addresses);
    println!(
        "Loaded {} distinct addresses from {}",
        members.len(),
        accounts_file.display()
    );

    let mut tree_config = config.tree.clone();
    if let Some(depth) = depth {
        tree_config.depth = depth;
        tree_config.large_depth = tree_config.large_depth.max(depth);
    }
    if let Some(hash) = hash {
        tree_config.hash = hash;
    }

    let storage = Arc::new(MemoryStorage::new());
    let group = Group {
        id: group_id.clone(),
        handle: group_id.clone(),
        display_name: group_id,
        rule: MemberSelectionRule::Static {
            addresses: members.clone(),
        },
    };
    let publisher = Publisher::new(storage.clone(), &tree_config, &config.bloom)?;
    let outcome = publisher.publish(&group, &members).await?;
    print_publish(std::slice::from_ref(&outcome));

    let PublishOutcome::Published { tree_id, .. } = outcome else {
        return Err(anyhow::anyhow!("No tree was built"));
    };
    let list = export_active(storage.as_ref(), &[group], Some(std::slice::from_ref(&tree_id))).await?;
    fs::write(output, list.to_bytes())
        .with_context(|| format!("Failed to write tree to {}", output.display()))?;
    println!("Tree written to {}", output.display());
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let config = load_config(&args.config)?;
    info!("Loaded configuration from {}", args.config.display());

    match args.command {
        Command::Sync => {
            let indexer = Indexer::from_config(config.clone(), open_storage(&config)?)?;
            let summary = indexer.sync_all().await?;
            print_sync(&summary);
            check_sync(&summary)
        }
        Command::Publish => {
            let indexer = Indexer::from_config(config.clone(), open_storage(&config)?)?;
            print_publish(&indexer.publish_all().await?);
            Ok(())
        }
        Command::Run { interval } => {
            let indexer = Indexer::from_config(config.clone(), open_storage(&config)?)?;
            loop {
                let (summary, outcomes) = indexer.run_once().await?;
                print_sync(&summary);
                print_publish(&outcomes);
                let Some(secs) = interval else {
                    return check_sync(&summary);
                };
                if !summary.is_clean() {
                    error!(
                        "{} contract(s) failed to sync; retrying in {}s",
                        summary.failures.len(),
                        secs
                    );
                }
                tokio::time::sleep(Duration::from_secs(secs)).await;
            }
        }
        Command::BuildTree {
            accounts_file,
            group,
            depth,
            hash,
            output,
        } => build_tree(&config, &accounts_file, group, depth, hash, &output).await,
        Command::Export { ids, output } => {
            let storage = open_storage(&config)?;
            let ids = (!ids.is_empty()).then_some(ids);
            let list = export_active(storage.as_ref(), &config.group_list(), ids.as_deref()).await?;
            fs::write(&output, list.to_bytes())
                .with_context(|| format!("Failed to write {}", output.display()))?;
            println!("Exported {} trees to {}", list.groups.len(), output.display());
            Ok(())
        }
        Command::Stats => {
            let stats = open_storage(&config)?.get_stats().await?;
            println!("{:#?}", stats);
            Ok(())
        }
    }
}
