//! Wire-frozen Bloom filter over piece IDs.

use meridian_types::PieceId;
use sha2::{Digest, Sha256};

/// Bloom filter sized for an expected piece count and false-positive
/// rate.
///
/// Bit positions for a piece are drawn from SHA-256 of the piece ID and
/// the hash index, so satellite and storage node agree bit-for-bit. The
/// wire encoding is one byte of hash count followed by the bitmap.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BloomFilter {
    hash_count: u8,
    bits: Vec<u8>,
}

impl BloomFilter {
    /// Sizes a filter for `expected` entries at `fp_rate`.
    pub fn optimal(expected: u64, fp_rate: f64) -> Self {
        let n = expected.max(1) as f64;
        let p = fp_rate.clamp(1e-6, 0.5);
        let ln2 = std::f64::consts::LN_2;
        let m = (-n * p.ln() / (ln2 * ln2)).ceil().max(64.0);
        let k = ((m / n) * ln2).round().clamp(1.0, 32.0) as u8;
        Self {
            hash_count: k,
            bits: vec![0u8; (m as usize).div_ceil(8)],
        }
    }

    pub fn add(&mut self, id: &PieceId) {
        for position in self.positions(id) {
            self.bits[(position / 8) as usize] |= 1 << (position % 8);
        }
    }

    pub fn contains(&self, id: &PieceId) -> bool {
        self.positions(id)
            .iter()
            .all(|&position| self.bits[(position / 8) as usize] & (1 << (position % 8)) != 0)
    }

    /// `[hash_count, bitmap...]`.
    pub fn encode(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(1 + self.bits.len());
        bytes.push(self.hash_count);
        bytes.extend_from_slice(&self.bits);
        bytes
    }

    pub fn decode(bytes: &[u8]) -> Option<Self> {
        let (&hash_count, bits) = bytes.split_first()?;
        if hash_count == 0 || bits.is_empty() {
            return None;
        }
        Some(Self {
            hash_count,
            bits: bits.to_vec(),
        })
    }

    pub fn size_bytes(&self) -> usize {
        1 + self.bits.len()
    }

    fn bit_len(&self) -> u64 {
        (self.bits.len() as u64) * 8
    }

    fn positions(&self, id: &PieceId) -> Vec<u64> {
        (0..self.hash_count)
            .map(|index| {
                let mut hasher = Sha256::new();
                hasher.update(id.as_bytes());
                hasher.update([index]);
                let digest = hasher.finalize();
                let mut word = [0u8; 8];
                word.copy_from_slice(&digest[..8]);
                u64::from_be_bytes(word) % self.bit_len()
            })
            .collect()
    }
}
