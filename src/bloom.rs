//! SipHash-keyed Bloom filter over group members.
//!
//! The filter lets a client test every group for candidacy without
//! downloading any tree. It may report members that are not in the group but
//! never misses one that is.

use ethers::types::Address;
use serde::{Deserialize, Serialize};
use siphasher::sip::SipHasher24;
use std::hash::Hasher;

use crate::error::BloomError;
use crate::ethereum::address_to_leaf;

/// The two 64-bit SipHash keys a filter is derived from.
///
/// Binary layout (16 bytes): `k0` as little-endian u64, then `k1` as
/// little-endian u64. On the wire each key travels as its own 8-byte entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SipKeys {
    pub k0: u64,
    pub k1: u64,
}

impl SipKeys {
    pub const ENCODED_LEN: usize = 16;
    pub const KEY_LEN: usize = 8;

    pub fn new(k0: u64, k1: u64) -> Self {
        Self { k0, k1 }
    }

    pub fn random() -> Self {
        Self {
            k0: rand::random(),
            k1: rand::random(),
        }
    }

    #[must_use]
    pub fn to_bytes(&self) -> [u8; Self::ENCODED_LEN] {
        let mut out = [0u8; Self::ENCODED_LEN];
        out[..8].copy_from_slice(&self.k0.to_le_bytes());
        out[8..].copy_from_slice(&self.k1.to_le_bytes());
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, BloomError> {
        if bytes.len() != Self::ENCODED_LEN {
            return Err(BloomError::InvalidKeys {
                expected: Self::ENCODED_LEN,
                actual: bytes.len(),
            });
        }
        let (k0, k1) = bytes.split_at(Self::KEY_LEN);
        Ok(Self {
            k0: read_u64_le(k0)?,
            k1: read_u64_le(k1)?,
        })
    }

    /// The two-entry wire representation.
    pub fn to_wire(&self) -> Vec<Vec<u8>> {
        vec![self.k0.to_le_bytes().to_vec(), self.k1.to_le_bytes().to_vec()]
    }

    pub fn from_wire(keys: &[Vec<u8>]) -> Result<Self, BloomError> {
        match keys {
            [k0, k1] => Ok(Self {
                k0: read_u64_le(k0)?,
                k1: read_u64_le(k1)?,
            }),
            _ => Err(BloomError::InvalidKeys {
                expected: 2,
                actual: keys.len(),
            }),
        }
    }
}

fn read_u64_le(bytes: &[u8]) -> Result<u64, BloomError> {
    let array: [u8; 8] = bytes.try_into().map_err(|_| BloomError::InvalidKeys {
        expected: SipKeys::KEY_LEN,
        actual: bytes.len(),
    })?;
    Ok(u64::from_le_bytes(array))
}

/// Bit array plus the parameters needed to query it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BloomFilter {
    bits: Vec<u8>,
    num_bits: u64,
    num_hashes: u32,
    keys: SipKeys,
}

const MAX_HASHES: u32 = 32;

impl BloomFilter {
    /// Bit count and hash count that keep the false-positive rate near
    /// `fp_rate` for `items` entries.
    pub fn optimal_params(items: usize, fp_rate: f64) -> Result<(u64, u32), BloomError> {
        if !(fp_rate > 0.0 && fp_rate < 1.0) {
            return Err(BloomError::InvalidParameters(format!(
                "false positive rate {fp_rate} must be in (0, 1)"
            )));
        }
        let n = items.max(1) as f64;
        let ln2 = std::f64::consts::LN_2;
        let num_bits = (-(n * fp_rate.ln()) / (ln2 * ln2)).ceil().max(8.0) as u64;
        let num_hashes = ((num_bits as f64 / n) * ln2).round().clamp(1.0, MAX_HASHES as f64) as u32;
        Ok((num_bits, num_hashes))
    }

    pub fn new(num_bits: u64, num_hashes: u32, keys: SipKeys) -> Result<Self, BloomError> {
        if num_bits == 0 || num_hashes == 0 {
            return Err(BloomError::InvalidParameters(format!(
                "num_bits={num_bits} num_hashes={num_hashes}"
            )));
        }
        Ok(Self {
            bits: vec![0u8; num_bits.div_ceil(8) as usize],
            num_bits,
            num_hashes,
            keys,
        })
    }

    pub fn with_rate(items: usize, fp_rate: f64, keys: SipKeys) -> Result<Self, BloomError> {
        let (num_bits, num_hashes) = Self::optimal_params(items, fp_rate)?;
        Self::new(num_bits, num_hashes, keys)
    }

    /// Rebuilds a filter from its published parts.
    pub fn from_parts(
        bits: Vec<u8>,
        num_bits: u64,
        num_hashes: u32,
        keys: SipKeys,
    ) -> Result<Self, BloomError> {
        if num_bits == 0 || num_hashes == 0 {
            return Err(BloomError::InvalidParameters(format!(
                "num_bits={num_bits} num_hashes={num_hashes}"
            )));
        }
        if bits.len() as u64 != num_bits.div_ceil(8) {
            return Err(BloomError::InvalidParameters(format!(
                "{} bytes cannot hold exactly {} bits",
                bits.len(),
                num_bits
            )));
        }
        Ok(Self {
            bits,
            num_bits,
            num_hashes,
            keys,
        })
    }

    /// Builds a filter over a member set.
    pub fn for_addresses<'a>(
        addresses: impl IntoIterator<Item = &'a Address>,
        num_bits: u64,
        num_hashes: u32,
        keys: SipKeys,
    ) -> Result<Self, BloomError> {
        let mut filter = Self::new(num_bits, num_hashes, keys)?;
        for address in addresses {
            filter.insert_address(address);
        }
        Ok(filter)
    }

    fn sip(k0: u64, k1: u64, item: &[u8]) -> u64 {
        let mut hasher = SipHasher24::new_with_keys(k0, k1);
        hasher.write(item);
        hasher.finish()
    }

    fn positions<'a>(&'a self, item: &[u8]) -> impl Iterator<Item = u64> + 'a {
        let h1 = Self::sip(self.keys.k0, self.keys.k1, item);
        let h2 = Self::sip(self.keys.k1, self.keys.k0, item) | 1;
        (0..self.num_hashes as u64)
            .map(move |i| h1.wrapping_add(i.wrapping_mul(h2)) % self.num_bits)
    }

    pub fn insert(&mut self, item: &[u8]) {
        let positions: Vec<u64> = self.positions(item).collect();
        for bit in positions {
            self.bits[(bit / 8) as usize] |= 1 << (bit % 8);
        }
    }

    pub fn contains(&self, item: &[u8]) -> bool {
        self.positions(item)
            .all(|bit| self.bits[(bit / 8) as usize] & (1 << (bit % 8)) != 0)
    }

    /// Members are hashed in their padded leaf form.
    pub fn insert_address(&mut self, address: &Address) {
        self.insert(&address_to_leaf(address));
    }

    pub fn contains_address(&self, address: &Address) -> bool {
        self.contains(&address_to_leaf(address))
    }

    pub fn bits(&self) -> &[u8] {
        &self.bits
    }

    pub fn num_bits(&self) -> u64 {
        self.num_bits
    }

    pub fn num_hashes(&self) -> u32 {
        self.num_hashes
    }

    pub fn keys(&self) -> SipKeys {
        self.keys
    }
}
