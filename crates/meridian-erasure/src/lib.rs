//! # meridian-erasure: Erasure coding for the Meridian satellite
//!
//! Thin, scheme-aware wrapper around Reed-Solomon coding. A segment is
//! split into stripes of `required * share_size` bytes; every stripe is
//! encoded into `total` shares. A stored piece is the concatenation of
//! one share per stripe, so byte range `[i*share_size, (i+1)*share_size)`
//! of a piece is that piece's share of stripe `i`, which is exactly what
//! an audit challenges a node for.

use meridian_types::RedundancyScheme;
use reed_solomon_erasure::galois_8::ReedSolomon;
use thiserror::Error;

/// Result type for erasure operations.
pub type Result<T> = std::result::Result<T, ErasureError>;

/// Errors that can occur during encoding or reconstruction.
#[derive(Debug, Error)]
pub enum ErasureError {
    /// The redundancy parameters are not a valid code.
    #[error("invalid redundancy scheme: {0}")]
    InvalidScheme(String),

    /// Too few shares survived to reconstruct.
    #[error("not enough shares: have {have}, need {required}")]
    NotEnoughShares { have: usize, required: usize },

    /// A share's length does not match the scheme's share size.
    #[error("share {index} has size {size}, expected {expected}")]
    WrongShareSize {
        index: usize,
        size: usize,
        expected: usize,
    },

    /// The underlying codec rejected the operation.
    #[error("erasure codec: {0}")]
    Codec(#[from] reed_solomon_erasure::Error),
}

/// A redundancy scheme bound to its Reed-Solomon code.
#[derive(Clone)]
pub struct Strategy {
    scheme: RedundancyScheme,
    rs: ReedSolomon,
}

impl Strategy {
    pub fn new(scheme: RedundancyScheme) -> Result<Self> {
        if scheme.required == 0
            || scheme.total <= scheme.required
            || scheme.share_size == 0
            || scheme.required > scheme.repair
            || scheme.repair > scheme.optimal
            || scheme.optimal > scheme.total
        {
            return Err(ErasureError::InvalidScheme(format!(
                "required {} <= repair {} <= optimal {} <= total {}, share size {}",
                scheme.required, scheme.repair, scheme.optimal, scheme.total, scheme.share_size
            )));
        }
        let rs = ReedSolomon::new(
            usize::from(scheme.required),
            usize::from(scheme.total - scheme.required),
        )?;
        Ok(Self { scheme, rs })
    }

    pub fn scheme(&self) -> RedundancyScheme {
        self.scheme
    }

    fn share_size(&self) -> usize {
        self.scheme.share_size as usize
    }

    fn required(&self) -> usize {
        usize::from(self.scheme.required)
    }

    fn total(&self) -> usize {
        usize::from(self.scheme.total)
    }

    /// Encodes `data` into `total` pieces.
    ///
    /// The final stripe is zero-padded; callers record the original length
    /// and pass it back to [`Strategy::decode`].
    pub fn encode(&self, data: &[u8]) -> Result<Vec<Vec<u8>>> {
        let share_size = self.share_size();
        let stripe_size = share_size * self.required();
        let stripes = data.len().div_ceil(stripe_size).max(1);

        let mut pieces = vec![Vec::with_capacity(stripes * share_size); self.total()];
        for stripe in 0..stripes {
            let mut shards: Vec<Vec<u8>> = Vec::with_capacity(self.total());
            for shard_index in 0..self.required() {
                let start = stripe * stripe_size + shard_index * share_size;
                let mut shard = vec![0u8; share_size];
                if start < data.len() {
                    let end = (start + share_size).min(data.len());
                    shard[..end - start].copy_from_slice(&data[start..end]);
                }
                shards.push(shard);
            }
            shards.resize(self.total(), vec![0u8; share_size]);
            self.rs.encode(&mut shards)?;

            for (piece, shard) in pieces.iter_mut().zip(shards) {
                piece.extend_from_slice(&shard);
            }
        }
        Ok(pieces)
    }

    /// Reconstructs the original `data_len` bytes from surviving pieces.
    ///
    /// `pieces` is indexed by piece number and must have `total` entries;
    /// missing pieces are `None`.
    pub fn decode(&self, mut pieces: Vec<Option<Vec<u8>>>, data_len: usize) -> Result<Vec<u8>> {
        let share_size = self.share_size();
        let stripe_size = share_size * self.required();
        let stripes = data_len.div_ceil(stripe_size).max(1);
        let piece_size = stripes * share_size;

        pieces.resize(self.total(), None);
        let have = pieces.iter().flatten().count();
        if have < self.required() {
            return Err(ErasureError::NotEnoughShares {
                have,
                required: self.required(),
            });
        }
        for (index, piece) in pieces.iter().enumerate() {
            if let Some(piece) = piece {
                if piece.len() != piece_size {
                    return Err(ErasureError::WrongShareSize {
                        index,
                        size: piece.len(),
                        expected: piece_size,
                    });
                }
            }
        }

        let mut data = Vec::with_capacity(stripes * stripe_size);
        for stripe in 0..stripes {
            let mut shards: Vec<Option<Vec<u8>>> = pieces
                .iter()
                .map(|piece| {
                    piece
                        .as_ref()
                        .map(|piece| piece[stripe * share_size..(stripe + 1) * share_size].to_vec())
                })
                .collect();
            self.rs.reconstruct_data(&mut shards)?;
            for shard in shards.into_iter().take(self.required()) {
                data.extend_from_slice(&shard.expect("data shard reconstructed"));
            }
        }
        data.truncate(data_len);
        Ok(data)
    }

    /// Rebuilds all `total` shares of one stripe from any `required` of
    /// them. Audit uses this to recompute what every holder should have
    /// returned.
    pub fn rebuild_stripe(&self, shares: &[Option<Vec<u8>>]) -> Result<Vec<Vec<u8>>> {
        let share_size = self.share_size();
        let mut shards: Vec<Option<Vec<u8>>> = shares.to_vec();
        shards.resize(self.total(), None);

        let have = shards.iter().flatten().count();
        if have < self.required() {
            return Err(ErasureError::NotEnoughShares {
                have,
                required: self.required(),
            });
        }
        for (index, shard) in shards.iter().enumerate() {
            if let Some(shard) = shard {
                if shard.len() != share_size {
                    return Err(ErasureError::WrongShareSize {
                        index,
                        size: shard.len(),
                        expected: share_size,
                    });
                }
            }
        }

        self.rs.reconstruct(&mut shards)?;
        Ok(shards
            .into_iter()
            .map(|shard| shard.expect("all shards reconstructed"))
            .collect())
    }
}

impl std::fmt::Debug for Strategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Strategy")
            .field("scheme", &self.scheme)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::RngCore;

    fn scheme(required: u16, total: u16, share_size: u32) -> RedundancyScheme {
        RedundancyScheme {
            required,
            repair: required + 1,
            optimal: total - 1,
            total,
            share_size,
        }
    }

    fn random_data(len: usize) -> Vec<u8> {
        let mut data = vec![0u8; len];
        rand::thread_rng().fill_bytes(&mut data);
        data
    }

    #[test]
    fn rejects_degenerate_schemes() {
        assert!(Strategy::new(scheme(0, 4, 64)).is_err());
        assert!(Strategy::new(scheme(4, 4, 64)).is_err());
        assert!(Strategy::new(scheme(4, 8, 0)).is_err());
    }

    #[test]
    fn decode_recovers_from_any_required_subset() {
        let strategy = Strategy::new(scheme(4, 9, 256)).unwrap();
        let data = random_data(3000);
        let pieces = strategy.encode(&data).unwrap();
        assert_eq!(pieces.len(), 9);

        // Keep only pieces 2, 4, 5, 8.
        let surviving: Vec<Option<Vec<u8>>> = pieces
            .iter()
            .enumerate()
            .map(|(i, piece)| [2, 4, 5, 8].contains(&i).then(|| piece.clone()))
            .collect();

        let decoded = strategy.decode(surviving, data.len()).unwrap();
        assert_eq!(decoded, data);
    }

    #[test]
    fn decode_fails_below_required() {
        let strategy = Strategy::new(scheme(4, 9, 256)).unwrap();
        let data = random_data(1000);
        let pieces = strategy.encode(&data).unwrap();

        let surviving: Vec<Option<Vec<u8>>> = pieces
            .iter()
            .enumerate()
            .map(|(i, piece)| (i < 3).then(|| piece.clone()))
            .collect();

        assert!(matches!(
            strategy.decode(surviving, data.len()),
            Err(ErasureError::NotEnoughShares { have: 3, required: 4 })
        ));
    }

    #[test]
    fn rebuild_stripe_reproduces_every_share() {
        let strategy = Strategy::new(scheme(3, 6, 128)).unwrap();
        let data = random_data(3 * 128);
        let pieces = strategy.encode(&data).unwrap();

        // One stripe only: each piece is one share.
        let partial: Vec<Option<Vec<u8>>> = pieces
            .iter()
            .enumerate()
            .map(|(i, piece)| (i % 2 == 0).then(|| piece.clone()))
            .collect();
        let rebuilt = strategy.rebuild_stripe(&partial).unwrap();

        assert_eq!(rebuilt.len(), 6);
        for (rebuilt_share, piece) in rebuilt.iter().zip(&pieces) {
            assert_eq!(rebuilt_share, piece);
        }
    }

    #[test]
    fn reencoding_reconstructed_data_reproduces_pieces() {
        let strategy = Strategy::new(scheme(4, 9, 64)).unwrap();
        let data = random_data(2048);
        let pieces = strategy.encode(&data).unwrap();

        let surviving: Vec<Option<Vec<u8>>> = pieces
            .iter()
            .enumerate()
            .map(|(i, piece)| (i >= 5).then(|| piece.clone()))
            .collect();
        let decoded = strategy.decode(surviving, data.len()).unwrap();
        let reencoded = strategy.encode(&decoded).unwrap();
        assert_eq!(reencoded, pieces);
    }

    #[test]
    fn short_data_pads_to_one_stripe() {
        let strategy = Strategy::new(scheme(2, 4, 32)).unwrap();
        let data = b"tiny".to_vec();
        let pieces = strategy.encode(&data).unwrap();
        for piece in &pieces {
            assert_eq!(piece.len(), 32);
        }

        let decoded = strategy
            .decode(pieces.into_iter().map(Some).collect(), data.len())
            .unwrap();
        assert_eq!(decoded, data);
    }
}
