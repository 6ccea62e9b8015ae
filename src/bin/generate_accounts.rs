use anyhow::{Context, Result};
use clap::Parser;
use ethers::signers::{LocalWallet, Signer};
use ethers::types::Address;
use std::collections::HashSet;
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use zkp_group_credentials::{config::GroupConfig, types::MemberSelectionRule};

#[derive(Parser, Debug)]
#[command(author, version, about = "Generate random test accounts", long_about = None)]
struct Args {
    #[arg(short = 'n', long, default_value_t = 1000)]
    count: usize,

    #[arg(short, long, default_value = "test_accounts.txt")]
    output: PathBuf,

    /// Also write `address,private_key` lines here
    #[arg(short, long)]
    keys_file: Option<PathBuf>,

    /// Also write a static `[[groups]]` config entry with this id
    #[arg(short, long)]
    static_group: Option<String>,
}

fn generate_wallets(count: usize) -> Vec<LocalWallet> {
    (0..count)
        .map(|_| LocalWallet::new(&mut rand::thread_rng()))
        .collect()
}

fn check_duplicates(addresses: &[Address]) -> bool {
    let unique: HashSet<_> = addresses.iter().collect();
    unique.len() == addresses.len()
}

fn write_lines(path: &Path, lines: impl Iterator<Item = String>) -> Result<()> {
    let mut file =
        File::create(path).with_context(|| format!("Failed to create {}", path.display()))?;
    for line in lines {
        writeln!(file, "{}", line)?;
    }
    Ok(())
}

#[derive(serde::Serialize)]
struct GroupsSnippet {
    groups: Vec<GroupConfig>,
}

fn main() -> Result<()> {
    let args = Args::parse();

    println!("Generating {} random Ethereum addresses...", args.count);
    let wallets = generate_wallets(args.count);
    let addresses: Vec<Address> = wallets.iter().map(Signer::address).collect();

    if !check_duplicates(&addresses) {
        return Err(anyhow::anyhow!("Generated duplicate addresses"));
    }

    println!("Writing addresses to {}...", args.output.display());
    write_lines(&args.output, addresses.iter().map(|a| format!("{:?}", a)))?;

    if let Some(keys_file) = &args.keys_file {
        println!("Writing private keys to {}...", keys_file.display());
        write_lines(
            keys_file,
            wallets
                .iter()
                .map(|w| format!("{:?},0x{}", w.address(), hex::encode(w.signer().to_bytes()))),
        )?;
    }

    if let Some(group_id) = &args.static_group {
        let snippet = GroupsSnippet {
            groups: vec![GroupConfig {
                id: group_id.clone(),
                handle: group_id.clone(),
                display_name: group_id.clone(),
                rule: MemberSelectionRule::Static {
                    addresses: addresses.clone(),
                },
            }],
        };
        let toml = toml::to_string_pretty(&snippet).context("Failed to serialize group")?;
        println!("\n# Static group entry for config.toml\n{}", toml);
    }

    println!("Successfully generated {} addresses", args.count);
    println!("First 5 addresses:");
    for (i, addr) in addresses.iter().take(5).enumerate() {
        println!("  {}: {:?}", i + 1, addr);
    }

    println!("\nValidation checks:");
    println!("  ✓ No duplicate addresses found");

    Ok(())
}
