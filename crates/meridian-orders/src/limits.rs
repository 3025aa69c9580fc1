//! Order limits and signed piece hashes.

use chrono::{DateTime, Utc};
use ed25519_dalek::{Signature, Verifier, VerifyingKey};
use meridian_types::{NodeId, PieceId};
use serde::{Deserialize, Serialize};

use crate::{OrderError, Result};

/// Storage-node action authorised by an order limit. Closed set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Action {
    Put,
    Get,
    PutRepair,
    GetRepair,
    GetAudit,
}

/// Random 16-byte serial, unique per issued limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SerialNumber([u8; 16]);

impl SerialNumber {
    pub fn generate() -> Self {
        let mut bytes = [0u8; 16];
        rand::Rng::fill(&mut rand::thread_rng(), &mut bytes[..]);
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }
}

/// Authorisation for one action on one piece.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderLimit {
    pub serial: SerialNumber,
    /// Issuing satellite; equal to its verifying-key bytes.
    pub satellite: NodeId,
    /// Storage node the limit is addressed to.
    pub node: NodeId,
    pub piece_id: PieceId,
    pub action: Action,
    /// Maximum bytes this limit covers.
    pub limit: u64,
    /// Public half of the session's ephemeral piece key.
    pub piece_public_key: [u8; 32],
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl OrderLimit {
    /// Canonical bytes the satellite signature covers.
    pub fn signing_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(160);
        bytes.extend_from_slice(self.serial.as_bytes());
        bytes.extend_from_slice(self.satellite.as_bytes());
        bytes.extend_from_slice(self.node.as_bytes());
        bytes.extend_from_slice(self.piece_id.as_bytes());
        bytes.push(self.action as u8);
        bytes.extend_from_slice(&self.limit.to_be_bytes());
        bytes.extend_from_slice(&self.piece_public_key);
        bytes.extend_from_slice(&self.created_at.timestamp_micros().to_be_bytes());
        bytes.extend_from_slice(&self.expires_at.timestamp_micros().to_be_bytes());
        bytes
    }
}

/// An order limit together with the satellite's signature over it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedOrderLimit {
    pub limit: OrderLimit,
    /// ed25519 signature bytes.
    pub signature: Vec<u8>,
}

impl SignedOrderLimit {
    /// Verifies the satellite signature and the expiry.
    pub fn verify(&self, satellite: &VerifyingKey, now: DateTime<Utc>) -> Result<()> {
        if self.limit.expires_at <= now {
            return Err(OrderError::Expired(self.limit.expires_at));
        }
        let signature = Signature::from_slice(&self.signature)
            .map_err(|_| OrderError::InvalidSignature)?;
        satellite
            .verify(&self.limit.signing_bytes(), &signature)
            .map_err(|_| OrderError::InvalidSignature)
    }
}

/// A storage node's signed receipt for a stored piece.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageNodeHash {
    pub piece_id: PieceId,
    /// SHA-256 of the stored piece bytes.
    pub hash: [u8; 32],
    pub piece_size: u64,
    pub timestamp: DateTime<Utc>,
    /// ed25519 signature bytes from the node's identity key.
    pub signature: Vec<u8>,
}

impl StorageNodeHash {
    /// Canonical bytes the node signature covers.
    pub fn signing_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(96);
        bytes.extend_from_slice(self.piece_id.as_bytes());
        bytes.extend_from_slice(&self.hash);
        bytes.extend_from_slice(&self.piece_size.to_be_bytes());
        bytes.extend_from_slice(&self.timestamp.timestamp_micros().to_be_bytes());
        bytes
    }

    /// Verifies the node's signature.
    pub fn verify(&self, node: &VerifyingKey) -> Result<()> {
        let signature = Signature::from_slice(&self.signature)
            .map_err(|_| OrderError::InvalidSignature)?;
        node.verify(&self.signing_bytes(), &signature)
            .map_err(|_| OrderError::InvalidSignature)
    }
}

/// SHA-256 of piece bytes; what nodes hash and sign.
pub fn piece_hash(data: &[u8]) -> [u8; 32] {
    use sha2::{Digest, Sha256};
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finalize().into()
}
