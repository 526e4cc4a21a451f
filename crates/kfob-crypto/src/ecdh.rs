//! Ephemeral P-192 key agreement.
//!
//! The token generates a fresh key pair per pairing attempt, publishes the
//! uncompressed point, and derives the session key from the peer's point as
//! `SHA-1(x)` stretched to 24 bytes (the 20-byte digest followed by its
//! first four bytes).

use std::fmt;

use elliptic_curve::ecdh::diffie_hellman;
use elliptic_curve::sec1::ToEncodedPoint;
use elliptic_curve::{PublicKey, SecretKey};
use p192::NistP192;
use rand_core::OsRng;
use zeroize::{Zeroize, Zeroizing};

use crate::hash::{sha1, stretch_digest};
use crate::tdes::{TdesKey, KEY_LEN};

/// Uncompressed SEC1 point: `0x04 ‖ X ‖ Y`.
pub const PUBLIC_POINT_LEN: usize = 49;

/// Bare `X ‖ Y` without the SEC1 prefix.
pub const RAW_POINT_LEN: usize = 48;

/// Compressed SEC1 point: `0x02|0x03 ‖ X`.
pub const COMPRESSED_POINT_LEN: usize = 25;

/// Private scalar length.
pub const SCALAR_LEN: usize = 24;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum AgreementError {
    #[error("peer point has unsupported encoding length {len}")]
    UnsupportedEncoding { len: usize },
    #[error("peer point is not a valid P-192 point")]
    InvalidPeerPoint,
    #[error("invalid private scalar")]
    InvalidScalar,
}

/// Ephemeral P-192 key pair. The scalar is zeroized on drop.
#[derive(Clone)]
pub struct EphemeralKeyPair {
    secret: SecretKey<NistP192>,
}

impl EphemeralKeyPair {
    pub fn generate() -> Self {
        Self {
            secret: SecretKey::random(&mut OsRng),
        }
    }

    /// Rebuild a key pair from a persisted big-endian scalar.
    pub fn from_scalar_bytes(bytes: &[u8]) -> Result<Self, AgreementError> {
        if bytes.len() != SCALAR_LEN {
            return Err(AgreementError::InvalidScalar);
        }
        SecretKey::from_slice(bytes)
            .map(|secret| Self { secret })
            .map_err(|_| AgreementError::InvalidScalar)
    }

    pub fn scalar_bytes(&self) -> Zeroizing<[u8; SCALAR_LEN]> {
        let mut field = self.secret.to_bytes();
        let mut out = Zeroizing::new([0u8; SCALAR_LEN]);
        out.copy_from_slice(&field);
        field.as_mut_slice().zeroize();
        out
    }

    /// Uncompressed SEC1 encoding of the public point.
    pub fn public_point(&self) -> [u8; PUBLIC_POINT_LEN] {
        let encoded = self.secret.public_key().to_encoded_point(false);
        let mut out = [0u8; PUBLIC_POINT_LEN];
        out.copy_from_slice(encoded.as_bytes());
        out
    }

    /// Derive the 24-byte session key from the peer's public point.
    pub fn agree(&self, peer_point: &[u8]) -> Result<TdesKey, AgreementError> {
        let peer = parse_peer_point(peer_point)?;
        let shared = diffie_hellman(self.secret.to_nonzero_scalar(), peer.as_affine());
        let digest = Zeroizing::new(sha1(shared.raw_secret_bytes()));
        let stretched = Zeroizing::new(stretch_digest::<KEY_LEN>(&digest));
        Ok(TdesKey::from_bytes(*stretched))
    }
}

impl fmt::Debug for EphemeralKeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EphemeralKeyPair").finish_non_exhaustive()
    }
}

/// Accept a peer point as 49-byte SEC1, bare 48-byte `X ‖ Y`, or 25-byte
/// compressed.
pub fn parse_peer_point(bytes: &[u8]) -> Result<PublicKey<NistP192>, AgreementError> {
    let parsed = match bytes.len() {
        PUBLIC_POINT_LEN | COMPRESSED_POINT_LEN => PublicKey::from_sec1_bytes(bytes),
        RAW_POINT_LEN => {
            let mut sec1 = [0u8; PUBLIC_POINT_LEN];
            sec1[0] = 0x04;
            sec1[1..].copy_from_slice(bytes);
            PublicKey::from_sec1_bytes(&sec1)
        }
        len => return Err(AgreementError::UnsupportedEncoding { len }),
    };
    parsed.map_err(|_| AgreementError::InvalidPeerPoint)
}
