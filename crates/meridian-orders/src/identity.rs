//! Signing identities.

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use meridian_types::NodeId;
use rand::rngs::OsRng;

/// The satellite's long-lived identity key.
///
/// Signs every order limit and every terminal graceful-exit message. The
/// satellite's node ID is its verifying key, so holders of a limit can
/// check provenance without a directory lookup.
pub struct SatelliteIdentity {
    signing: SigningKey,
}

impl SatelliteIdentity {
    pub fn generate() -> Self {
        Self {
            signing: SigningKey::generate(&mut OsRng),
        }
    }

    pub fn from_signing_key(signing: SigningKey) -> Self {
        Self { signing }
    }

    pub fn id(&self) -> NodeId {
        NodeId::from_bytes(self.signing.verifying_key().to_bytes())
    }

    pub fn verifying_key(&self) -> VerifyingKey {
        self.signing.verifying_key()
    }

    pub fn sign(&self, message: &[u8]) -> Signature {
        self.signing.sign(message)
    }
}

impl std::fmt::Debug for SatelliteIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SatelliteIdentity")
            .field("id", &self.id())
            .finish_non_exhaustive()
    }
}

/// Ephemeral per-operation key a client signs its orders with.
///
/// The matching public key travels inside the order limit so the storage
/// node can bind orders to the session that presented the limit.
#[derive(Clone)]
pub struct PiecePrivateKey {
    signing: SigningKey,
}

impl PiecePrivateKey {
    pub fn generate() -> Self {
        Self {
            signing: SigningKey::generate(&mut OsRng),
        }
    }

    pub fn public_bytes(&self) -> [u8; 32] {
        self.signing.verifying_key().to_bytes()
    }

    pub fn to_bytes(&self) -> [u8; 32] {
        self.signing.to_bytes()
    }

    pub fn from_bytes(bytes: &[u8; 32]) -> Self {
        Self {
            signing: SigningKey::from_bytes(bytes),
        }
    }

    pub fn sign(&self, message: &[u8]) -> Signature {
        self.signing.sign(message)
    }

    pub fn verify(public: &[u8; 32], message: &[u8], signature: &Signature) -> bool {
        VerifyingKey::from_bytes(public)
            .is_ok_and(|key| key.verify(message, signature).is_ok())
    }
}

impl std::fmt::Debug for PiecePrivateKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PiecePrivateKey").finish_non_exhaustive()
    }
}
