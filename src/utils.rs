//! Utility functions for hex handling, field conversion and timestamps.

use anyhow::Result;
use halo2_gadgets::poseidon::primitives::{
    self as poseidon, ConstantLength, P128Pow5T3 as PoseidonSpec,
};
use pasta_curves::group::ff::PrimeField;
use pasta_curves::pallas;

use crate::Node;

fn is_valid_hex_string(s: &str) -> bool {
    s.chars().all(|c| c.is_ascii_hexdigit())
}

fn strip_hex_prefix(input: &str) -> &str {
    let trimmed = input.trim();
    trimmed
        .strip_prefix("0x")
        .or_else(|| trimmed.strip_prefix("0X"))
        .unwrap_or(trimmed)
}

/// Validates and strips hex prefix from a string.
///
/// # Errors
/// Returns an error if the stripped string does not have `expected_len`
/// characters or contains non-hex characters.
///
/// # Examples
///
/// ```
/// use zkp_group_credentials::utils::validate_and_strip_hex;
///
/// let result = validate_and_strip_hex("0x1234abcd", 8).unwrap();
/// assert_eq!(result, "1234abcd");
/// ```
pub fn validate_and_strip_hex(input: &str, expected_len: usize) -> Result<String> {
    let stripped = strip_hex_prefix(input);

    if stripped.len() != expected_len {
        return Err(anyhow::anyhow!(
            "Invalid hex string: must be {} characters (got {})",
            expected_len,
            stripped.len()
        ));
    }

    if !is_valid_hex_string(stripped) {
        return Err(anyhow::anyhow!(
            "Invalid hex string: contains non-hex characters"
        ));
    }

    Ok(stripped.to_string())
}

/// Parses a 32-byte node from hex, with or without `0x`.
pub fn parse_node_hex(input: &str) -> Result<Node> {
    let stripped = validate_and_strip_hex(input, 64)?;
    let mut node = [0u8; 32];
    hex::decode_to_slice(stripped, &mut node)
        .map_err(|e| anyhow::anyhow!("Invalid node hex: {e}"))?;
    Ok(node)
}

/// `0x`-prefixed lowercase hex of a byte slice.
#[must_use]
pub fn hex_prefixed(bytes: impl AsRef<[u8]>) -> String {
    format!("0x{}", hex::encode(bytes))
}

const BASE_U64: u64 = 256;

/// Converts 32 bytes to a Pallas base field element.
///
/// The bytes are read as a big-endian base-256 number reduced modulo the
/// field order, so every input maps to some element.
#[inline]
#[must_use]
pub fn bytes_to_field(bytes: &[u8; 32]) -> pallas::Base {
    let mut value = pallas::Base::zero();
    let base = pallas::Base::from(BASE_U64);

    for &byte in bytes.iter() {
        value = value * base + pallas::Base::from(byte as u64);
    }

    value
}

/// Converts a field element to its canonical 32-byte representation.
#[inline]
#[must_use]
pub fn field_to_bytes(field: pallas::Base) -> [u8; 32] {
    let mut bytes = [0u8; 32];
    let repr = field.to_repr();
    bytes.copy_from_slice(repr.as_ref());
    bytes
}

/// Poseidon hash of two field elements (`P128Pow5T3`, width 3, rate 2).
///
/// ```
/// use zkp_group_credentials::utils::poseidon_hash;
/// use pasta_curves::pallas;
///
/// let hash = poseidon_hash(pallas::Base::from(1), pallas::Base::from(2));
/// assert_ne!(hash, pallas::Base::zero());
/// ```
#[inline]
#[must_use]
pub fn poseidon_hash(left: pallas::Base, right: pallas::Base) -> pallas::Base {
    poseidon::Hash::<_, PoseidonSpec, ConstantLength<2>, 3, 2>::init().hash([left, right])
}

/// Seconds since the Unix epoch, or 0 if the clock is before it.
pub fn unix_timestamp() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_and_strip_hex_variants() {
        assert_eq!(validate_and_strip_hex("0x1234abcd", 8).unwrap(), "1234abcd");
        assert_eq!(validate_and_strip_hex("0X1234ABCD", 8).unwrap(), "1234ABCD");
        assert_eq!(
            validate_and_strip_hex("  0x1234abcd  ", 8).unwrap(),
            "1234abcd"
        );
    }

    #[test]
    fn test_validate_and_strip_hex_wrong_length() {
        let err = validate_and_strip_hex("0x1234abcd", 10).unwrap_err();
        assert!(err.to_string().contains("must be 10 characters"));
    }

    #[test]
    fn test_validate_and_strip_hex_invalid_characters() {
        let err = validate_and_strip_hex("0x1234xyzw", 8).unwrap_err();
        assert!(err.to_string().contains("non-hex characters"));
    }

    #[test]
    fn test_parse_node_hex() {
        let hex = format!("0x{}", "ab".repeat(32));
        assert_eq!(parse_node_hex(&hex).unwrap(), [0xab; 32]);
        assert!(parse_node_hex("0xabcd").is_err());
    }

    #[test]
    fn test_hex_prefixed() {
        assert_eq!(hex_prefixed([0xde, 0xad]), "0xdead");
    }

    #[test]
    fn test_bytes_to_field_distinct() {
        let a = bytes_to_field(&[1u8; 32]);
        let b = bytes_to_field(&[2u8; 32]);
        assert_ne!(a, pallas::Base::zero());
        assert_ne!(a, b);
    }

    #[test]
    fn test_poseidon_hash_is_order_sensitive() {
        let one = pallas::Base::from(1);
        let two = pallas::Base::from(2);
        assert_eq!(poseidon_hash(one, two), poseidon_hash(one, two));
        assert_ne!(poseidon_hash(one, two), poseidon_hash(two, one));
    }
}
