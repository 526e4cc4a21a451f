//! Pairing state machine.
//!
//! Drives the KeyFOB side of the ORWL handshake:
//!
//! ```text
//! Unassociated --SupplyPeerPublicKey--> SecretPending --ConfirmSecret-->
//! SecretConfirmed --StoreSeedX--> SeedXStored --FinalizeAssociation--> Associated
//! ```
//!
//! Every step is checked against the current state before anything is
//! touched, so a refused step leaves the machine exactly as it was. The
//! machine has no notion of the PIN; [`KeyFob`](crate::token::KeyFob) layers
//! the CVM gate on top.

use std::cmp::Ordering;
use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use kfob_crypto::ecdh::{COMPRESSED_POINT_LEN, PUBLIC_POINT_LEN, RAW_POINT_LEN};
use kfob_crypto::hash::{sha1, stretch_digest};
use kfob_crypto::tdes::{decrypt_in_place, encrypt_in_place, TdesKey, BLOCK_LEN};
use kfob_crypto::utils::random_array;

use crate::agreement::KeyAgreementEngine;
use crate::errors::{FobError, FobResult};
use crate::seed::{BleSeed, BleSeedSource, BLE_SEED_LEN};

/// Length of seedX and seedY.
pub const SEED_LEN: usize = 24;

pub const PAIR_KEY_LEN: usize = 128;

/// Challenge response block: SHA-1 followed by the digest's first 4 bytes.
pub const DIGEST_BLOCK_LEN: usize = 24;

// ============================================================================
// States and Operations
// ============================================================================

/// Protocol stage. Ordered: transitions only ever move forward.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub enum PairingState {
    #[default]
    Unassociated,
    SecretPending,
    SecretConfirmed,
    SeedXStored,
    Associated,
}

impl fmt::Display for PairingState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    RequestPublicKey,
    SupplyPeerPublicKey,
    ConfirmSecret,
    StoreSeedX,
    GenerateSeedY,
    FinalizeAssociation,
    StoreBleSeed,
    AuthenticateChallenge,
    StorePairKey,
    ReadPairKey,
    RetrieveBleSeed,
}

impl Operation {
    /// What a repeated one-time step reports as already set.
    pub fn label(self) -> &'static str {
        match self {
            Operation::RequestPublicKey => "ephemeral key pair",
            Operation::SupplyPeerPublicKey => "session key",
            Operation::ConfirmSecret => "session key confirmation",
            Operation::StoreSeedX => "seedX",
            Operation::GenerateSeedY => "seedY",
            Operation::FinalizeAssociation => "association",
            Operation::StoreBleSeed | Operation::RetrieveBleSeed => "BLE seed",
            Operation::AuthenticateChallenge => "challenge",
            Operation::StorePairKey | Operation::ReadPairKey => "pair key",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

// ============================================================================
// Secret Material
// ============================================================================

/// 128-byte opaque pairing key. Zeroized on drop, redacted in `Debug`.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct PairKey([u8; PAIR_KEY_LEN]);

impl PairKey {
    pub fn from_bytes(bytes: [u8; PAIR_KEY_LEN]) -> Self {
        Self(bytes)
    }

    pub fn from_slice(bytes: &[u8]) -> FobResult<Self> {
        FobError::check_len(PAIR_KEY_LEN, bytes.len())?;
        let mut out = [0u8; PAIR_KEY_LEN];
        out.copy_from_slice(bytes);
        Ok(Self(out))
    }

    pub fn as_bytes(&self) -> &[u8; PAIR_KEY_LEN] {
        &self.0
    }
}

impl fmt::Debug for PairKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PairKey([REDACTED])")
    }
}

/// seedX, seedY and the BLE seed. Absent until stored.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SeedMaterial {
    pub seed_x: Option<TdesKey>,
    pub seed_y: Option<TdesKey>,
    pub ble_seed: Option<BleSeed>,
}

/// Digest block over the seed's challenge window.
pub fn challenge_digest(seed: &BleSeed) -> [u8; DIGEST_BLOCK_LEN] {
    let digest = Zeroizing::new(sha1(seed.challenge_window()));
    stretch_digest::<DIGEST_BLOCK_LEN>(&digest)
}

fn is_supported_point_len(len: usize) -> bool {
    matches!(len, PUBLIC_POINT_LEN | RAW_POINT_LEN | COMPRESSED_POINT_LEN)
}

// ============================================================================
// Pairing Machine
// ============================================================================

#[derive(Debug, Clone, Default)]
pub struct PairingMachine {
    state: PairingState,
    engine: KeyAgreementEngine,
    seeds: SeedMaterial,
    pair_key: Option<PairKey>,
}

impl PairingMachine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn restore(
        state: PairingState,
        engine: KeyAgreementEngine,
        seeds: SeedMaterial,
        pair_key: Option<PairKey>,
    ) -> Self {
        Self {
            state,
            engine,
            seeds,
            pair_key,
        }
    }

    pub fn state(&self) -> PairingState {
        self.state
    }

    pub fn is_associated(&self) -> bool {
        self.state == PairingState::Associated
    }

    pub fn engine(&self) -> &KeyAgreementEngine {
        &self.engine
    }

    pub fn seeds(&self) -> &SeedMaterial {
        &self.seeds
    }

    pub fn pair_key(&self) -> Option<&PairKey> {
        self.pair_key.as_ref()
    }

    fn refuse(&self, op: Operation) -> FobError {
        warn!(operation = %op, state = %self.state, "pairing step out of order");
        FobError::order(op, self.state)
    }

    /// Gate a linear step that must run in exactly `required`.
    fn expect_stage(&self, op: Operation, required: PairingState) -> FobResult<()> {
        if self.is_associated() {
            return Err(FobError::AlreadyAssociated);
        }
        match self.state.cmp(&required) {
            Ordering::Equal => Ok(()),
            Ordering::Less => Err(self.refuse(op)),
            Ordering::Greater => Err(FobError::AlreadySet(op.label())),
        }
    }

    /// Gate a step allowed anywhere between confirmation and association.
    fn expect_seed_window(&self, op: Operation) -> FobResult<()> {
        match self.state {
            PairingState::Associated => Err(FobError::AlreadyAssociated),
            PairingState::SecretConfirmed | PairingState::SeedXStored => Ok(()),
            _ => Err(self.refuse(op)),
        }
    }

    fn expect_associated(&self, op: Operation) -> FobResult<()> {
        if !self.is_associated() {
            return Err(self.refuse(op));
        }
        Ok(())
    }

    fn session_key(&self) -> FobResult<&TdesKey> {
        self.engine.session_key()
    }

    /// The token's public point. Stable from generation until the secret is
    /// confirmed, so a host may ask again after sending its own point.
    pub fn request_public_key(&mut self) -> FobResult<[u8; PUBLIC_POINT_LEN]> {
        match self.state {
            PairingState::Unassociated | PairingState::SecretPending => {
                Ok(self.engine.generate_key_pair())
            }
            PairingState::Associated => Err(FobError::AlreadyAssociated),
            PairingState::SecretConfirmed | PairingState::SeedXStored => {
                Err(FobError::AlreadySet(Operation::RequestPublicKey.label()))
            }
        }
    }

    pub fn supply_peer_public_key(&mut self, peer_point: &[u8]) -> FobResult<()> {
        if !is_supported_point_len(peer_point.len()) {
            return Err(FobError::MalformedRequest(format!(
                "peer point length {} is not 25, 48 or 49",
                peer_point.len()
            )));
        }
        self.expect_stage(Operation::SupplyPeerPublicKey, PairingState::Unassociated)?;
        if !self.engine.has_key_pair() {
            return Err(self.refuse(Operation::SupplyPeerPublicKey));
        }
        self.engine.derive_shared_secret(peer_point)?;
        self.state = PairingState::SecretPending;
        info!(state = %self.state, "shared secret derived");
        Ok(())
    }

    pub fn confirm_secret(&mut self, ciphertext: &[u8; BLOCK_LEN]) -> FobResult<()> {
        self.expect_stage(Operation::ConfirmSecret, PairingState::SecretPending)?;
        self.engine.confirm_shared_secret(ciphertext)?;
        self.state = PairingState::SecretConfirmed;
        info!(state = %self.state, "shared secret confirmed");
        Ok(())
    }

    pub fn store_seed_x(&mut self, ciphertext: &[u8; SEED_LEN]) -> FobResult<()> {
        self.expect_stage(Operation::StoreSeedX, PairingState::SecretConfirmed)?;
        let mut seed = Zeroizing::new(*ciphertext);
        decrypt_in_place(self.session_key()?, &mut seed[..])?;
        self.seeds.seed_x = Some(TdesKey::from_bytes(*seed));
        self.state = PairingState::SeedXStored;
        info!(state = %self.state, "seedX stored");
        Ok(())
    }

    /// Draw a fresh seedY and return it under seedX, then the session key.
    /// Repeatable until association; each call replaces seedY.
    pub fn generate_seed_y(&mut self) -> FobResult<[u8; SEED_LEN]> {
        self.expect_stage(Operation::GenerateSeedY, PairingState::SeedXStored)?;
        let seed_x = self
            .seeds
            .seed_x
            .as_ref()
            .ok_or_else(|| self.refuse(Operation::GenerateSeedY))?;
        let session = self.session_key()?;

        let fresh = Zeroizing::new(random_array::<SEED_LEN>()?);
        let mut out = *fresh;
        encrypt_in_place(seed_x, &mut out)?;
        encrypt_in_place(session, &mut out)?;

        self.seeds.seed_y = Some(TdesKey::from_bytes(*fresh));
        debug!("seedY generated");
        Ok(out)
    }

    pub fn finalize(&mut self, require_pair_key: bool) -> FobResult<()> {
        self.expect_stage(Operation::FinalizeAssociation, PairingState::SeedXStored)?;
        if require_pair_key && self.pair_key.is_none() {
            return Err(self.refuse(Operation::FinalizeAssociation));
        }
        self.state = PairingState::Associated;
        self.engine.discard_key_pair();
        info!(state = %self.state, "association finalized");
        Ok(())
    }

    /// Unwrap the BLE seed: session key first, then seedX.
    pub fn store_ble_seed(&mut self, ciphertext: &[u8; BLE_SEED_LEN]) -> FobResult<()> {
        self.expect_seed_window(Operation::StoreBleSeed)?;
        let seed_x = self
            .seeds
            .seed_x
            .as_ref()
            .ok_or_else(|| self.refuse(Operation::StoreBleSeed))?;
        if self.seeds.ble_seed.is_some() {
            return Err(FobError::AlreadySet(Operation::StoreBleSeed.label()));
        }

        let mut plain = Zeroizing::new(*ciphertext);
        decrypt_in_place(self.session_key()?, &mut plain[..])?;
        decrypt_in_place(seed_x, &mut plain[..])?;

        self.seeds.ble_seed = Some(BleSeed::from_bytes(*plain));
        debug!("BLE seed stored");
        Ok(())
    }

    pub fn store_pair_key(&mut self, ciphertext: &[u8; PAIR_KEY_LEN]) -> FobResult<()> {
        self.expect_seed_window(Operation::StorePairKey)?;
        if self.pair_key.is_some() {
            return Err(FobError::AlreadySet(Operation::StorePairKey.label()));
        }
        let mut plain = Zeroizing::new(*ciphertext);
        decrypt_in_place(self.session_key()?, &mut plain[..])?;
        self.pair_key = Some(PairKey::from_bytes(*plain));
        debug!("pair key stored");
        Ok(())
    }

    /// The stored PairKey re-encrypted under the session key.
    pub fn read_pair_key(&self) -> FobResult<[u8; PAIR_KEY_LEN]> {
        self.expect_associated(Operation::ReadPairKey)?;
        let key = self
            .pair_key
            .as_ref()
            .ok_or(FobError::NotSet(Operation::ReadPairKey.label()))?;
        let mut out = *key.as_bytes();
        encrypt_in_place(self.session_key()?, &mut out)?;
        Ok(out)
    }

    /// Digest of the seed's challenge window under seedY, then the session
    /// key.
    pub fn authenticate_challenge(&self) -> FobResult<[u8; DIGEST_BLOCK_LEN]> {
        self.expect_associated(Operation::AuthenticateChallenge)?;
        let seed = self
            .seeds
            .ble_seed
            .as_ref()
            .ok_or(FobError::SeedNotAvailable)?;
        let seed_y = self.seeds.seed_y.as_ref().ok_or(FobError::KeyNotConfigured)?;
        let session = self.session_key()?;

        let mut block = challenge_digest(seed);
        encrypt_in_place(seed_y, &mut block)?;
        encrypt_in_place(session, &mut block)?;
        Ok(block)
    }
}

impl BleSeedSource for PairingMachine {
    fn retrieve_ble_seed(&mut self) -> FobResult<BleSeed> {
        self.expect_associated(Operation::RetrieveBleSeed)?;
        let stored = self
            .seeds
            .ble_seed
            .as_mut()
            .ok_or(FobError::SeedNotAvailable)?;
        let copy = stored.clone();
        stored.zeroize();
        self.seeds.ble_seed = None;
        debug!("BLE seed handed to cooperating component");
        Ok(copy)
    }
}
