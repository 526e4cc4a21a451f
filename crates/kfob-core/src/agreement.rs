//! Key agreement engine.
//!
//! Owns the ephemeral P-192 key pair and the channel codec that carries the
//! derived session key. It does not know about pairing states; the
//! [`PairingMachine`](crate::pairing::PairingMachine) decides when each step
//! is allowed.

use tracing::{debug, warn};
use zeroize::Zeroizing;

use kfob_crypto::ecdh::{EphemeralKeyPair, PUBLIC_POINT_LEN};
use kfob_crypto::tdes::{ChannelCodec, TdesKey, BLOCK_LEN};
use kfob_crypto::utils::constant_time_compare;

use crate::errors::{FobError, FobResult};

/// Known plaintext the peer encrypts to prove it holds the same key.
pub const SAMPLE_PLAINTEXT: [u8; BLOCK_LEN] = *b"ORWLKEYF";

#[derive(Debug, Clone, Default)]
pub struct KeyAgreementEngine {
    key_pair: Option<EphemeralKeyPair>,
    codec: ChannelCodec,
    confirmed: bool,
}

impl KeyAgreementEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn restore(
        key_pair: Option<EphemeralKeyPair>,
        session_key: Option<TdesKey>,
        confirmed: bool,
    ) -> Self {
        let codec = match session_key {
            Some(k) => ChannelCodec::with_key(k),
            None => ChannelCodec::new(),
        };
        Self {
            key_pair,
            codec,
            confirmed,
        }
    }

    pub fn has_key_pair(&self) -> bool {
        self.key_pair.is_some()
    }

    pub fn key_pair(&self) -> Option<&EphemeralKeyPair> {
        self.key_pair.as_ref()
    }

    pub fn is_confirmed(&self) -> bool {
        self.confirmed
    }

    pub fn codec(&self) -> &ChannelCodec {
        &self.codec
    }

    pub fn session_key(&self) -> FobResult<&TdesKey> {
        self.codec.key().ok_or(FobError::KeyNotConfigured)
    }

    /// Return the public point, generating the key pair on first use.
    pub fn generate_key_pair(&mut self) -> [u8; PUBLIC_POINT_LEN] {
        let pair = self.key_pair.get_or_insert_with(|| {
            debug!("generated ephemeral P-192 key pair");
            EphemeralKeyPair::generate()
        });
        pair.public_point()
    }

    /// Run ECDH against `peer_point` and install the result as the session
    /// key. A second call overwrites the key.
    pub fn derive_shared_secret(&mut self, peer_point: &[u8]) -> FobResult<()> {
        let pair = self.key_pair.as_ref().ok_or(FobError::KeyNotConfigured)?;
        let key = pair.agree(peer_point)?;
        self.codec.set_key(key);
        self.confirmed = false;
        debug!(peer = %hex::encode(peer_point), "session key derived");
        Ok(())
    }

    /// Decrypt `ciphertext` and compare it with [`SAMPLE_PLAINTEXT`].
    pub fn confirm_shared_secret(&mut self, ciphertext: &[u8]) -> FobResult<()> {
        FobError::check_len(BLOCK_LEN, ciphertext.len())?;
        let mut block = Zeroizing::new([0u8; BLOCK_LEN]);
        block.copy_from_slice(ciphertext);
        self.codec.decrypt(&mut block[..])?;

        if !constant_time_compare(&block[..], &SAMPLE_PLAINTEXT) {
            warn!("session key confirmation failed");
            return Err(FobError::SecretMismatch);
        }
        self.confirmed = true;
        debug!("session key confirmed");
        Ok(())
    }

    /// Drop the ephemeral key pair. The session key stays installed.
    pub fn discard_key_pair(&mut self) {
        self.key_pair = None;
    }
}
