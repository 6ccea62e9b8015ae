//! Ethereum address parsing, leaf encoding and key validation.

use crate::utils::validate_and_strip_hex;
use crate::Node;
use anyhow::{Context, Result};
use ethers::types::Address;
use std::path::Path;

/// Ethereum addresses are 20 bytes = 40 hex characters.
pub const ADDRESS_HEX_LENGTH: usize = 40;

/// Private keys are 32 bytes = 64 hex characters.
pub const PRIVATE_KEY_HEX_LENGTH: usize = 64;

/// Address used as `from` for mints and `to` for burns.
pub const MINT_SENTINEL: Address = Address::zero();

/// Parses an address, with or without `0x`, in any letter case.
///
/// ```
/// use zkp_group_credentials::ethereum::parse_address;
///
/// let address = parse_address("0x742d35Cc6634C0532925a3b844Bc454e4438f44e").unwrap();
/// assert_eq!(format!("{address:?}"), "0x742d35cc6634c0532925a3b844bc454e4438f44e");
/// ```
pub fn parse_address(address: &str) -> Result<Address> {
    let stripped = validate_and_strip_hex(address, ADDRESS_HEX_LENGTH)?;
    let mut bytes = [0u8; 20];
    hex::decode_to_slice(&stripped, &mut bytes).context("Failed to decode address from hex")?;
    Ok(Address::from(bytes))
}

/// Parses a batch of addresses, reporting the 1-based line of the first
/// failure.
pub fn parse_addresses_batch(addresses: &[String]) -> Result<Vec<Address>> {
    addresses
        .iter()
        .enumerate()
        .map(|(i, addr)| {
            parse_address(addr).with_context(|| {
                format!("Failed to validate address at line {}: '{}'", i + 1, addr)
            })
        })
        .collect()
}

/// Reads one address per line, skipping blanks and `#` comments.
pub fn read_address_file(path: &Path) -> Result<Vec<Address>> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read address file: {}", path.display()))?;

    let lines: Vec<String> = content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(str::to_string)
        .collect();

    parse_addresses_batch(&lines)
}

/// Validates a private key hex string.
///
/// ```
/// use zkp_group_credentials::ethereum::validate_private_key;
///
/// assert!(validate_private_key("0x4c0883a69102937d6231471b5dbb6204fe5129617082792ae468d01a3f362318").is_ok());
/// assert!(validate_private_key(&"0".repeat(64)).is_err());
/// ```
pub fn validate_private_key(private_key: &str) -> Result<()> {
    let stripped = validate_and_strip_hex(private_key, PRIVATE_KEY_HEX_LENGTH)?;

    if stripped.chars().all(|c| c == '0') {
        return Err(anyhow::anyhow!(
            "Private key cannot be all zeros. Please provide a valid private key."
        ));
    }

    Ok(())
}

/// Pads a 20-byte address to a 32-byte leaf (12 zero bytes, then the address).
#[must_use]
pub fn address_to_leaf(address: &Address) -> Node {
    let mut leaf = [0u8; 32];
    leaf[12..].copy_from_slice(address.as_bytes());
    leaf
}

/// Inverse of [`address_to_leaf`]; `None` if the padding bytes are not zero.
#[must_use]
pub fn leaf_to_address(leaf: &Node) -> Option<Address> {
    if leaf[..12].iter().any(|&b| b != 0) {
        return None;
    }
    Some(Address::from_slice(&leaf[12..]))
}
