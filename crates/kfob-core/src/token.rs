//! The KeyFOB token.
//!
//! [`KeyFob`] ties the identity store, the CVM gate and the pairing machine
//! to a [`Store`]. Each mutating operation runs as a transaction: it is
//! applied to a copy of the state, the copy is persisted, and only then does
//! it replace the live state. A refused operation or a failed save leaves
//! memory and storage untouched.
//!
//! Guards are checked in a fixed order: malformed input, then PIN blocked,
//! then PIN not configured, then PIN not verified, then pairing state, then
//! one-time flags.

use tracing::{debug, info, warn};
use zeroize::Zeroizing;

use kfob_crypto::ecdh::{EphemeralKeyPair, PUBLIC_POINT_LEN};
use kfob_crypto::tdes::{decrypt_in_place, TdesKey, BLOCK_LEN};

use crate::agreement::KeyAgreementEngine;
use crate::cvm::{CvmGate, Pin, PinCheck, PIN_LEN};
use crate::errors::{FobError, FobResult};
use crate::identity::{IdentityField, IdentityStore};
use crate::pairing::{
    PairKey, PairingMachine, PairingState, SeedMaterial, DIGEST_BLOCK_LEN, PAIR_KEY_LEN,
    SEED_LEN,
};
use crate::policy::TokenPolicy;
use crate::seed::{BleSeed, BleSeedSource, BLE_SEED_LEN};
use crate::store::{
    CredentialRecord, IdentityRecord, PairingRecord, Store, StoreError, TokenRecord,
    RECORD_VERSION,
};

/// Encrypted PIN block: six BCD digits and two zero bytes.
pub const PIN_BLOCK_LEN: usize = BLOCK_LEN;

// ============================================================================
// Association Status
// ============================================================================

/// Answer to the association status query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssociationStatus {
    ReadyToPair,
    AlreadyPaired,
    PinNotVerified,
    PinBlocked,
}

impl AssociationStatus {
    pub fn code(self) -> u8 {
        match self {
            AssociationStatus::ReadyToPair => 0x01,
            AssociationStatus::AlreadyPaired => 0x0E,
            AssociationStatus::PinNotVerified => 0x98,
            AssociationStatus::PinBlocked => 0x9D,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0x01 => Some(AssociationStatus::ReadyToPair),
            0x0E => Some(AssociationStatus::AlreadyPaired),
            0x98 => Some(AssociationStatus::PinNotVerified),
            0x9D => Some(AssociationStatus::PinBlocked),
            _ => None,
        }
    }
}

// ============================================================================
// Token State
// ============================================================================

/// The full entity set owned by the token.
#[derive(Debug, Clone)]
pub struct TokenState {
    pub identity: IdentityStore,
    pub cvm: CvmGate,
    pub pairing: PairingMachine,
}

fn corrupt(field: &'static str, e: impl std::fmt::Display) -> FobError {
    FobError::Store(StoreError::DataCorruption(format!("{}: {}", field, e)))
}

impl TokenState {
    pub fn fresh(policy: &TokenPolicy) -> Self {
        Self {
            identity: IdentityStore::new(),
            cvm: CvmGate::new(policy.pin_try_limit),
            pairing: PairingMachine::new(),
        }
    }

    pub fn to_record(&self) -> TokenRecord {
        let raw = |field| self.identity.raw(field).map(<[u8]>::to_vec);
        let identity = IdentityRecord {
            serial_number: raw(IdentityField::SerialNumber),
            unique_id: raw(IdentityField::UniqueId),
            display_name: raw(IdentityField::DisplayName),
        };

        let mut credential = CredentialRecord::default();
        credential.pin = self.cvm.pin().map(|p| p.as_bytes().to_vec());
        credential.try_limit = self.cvm.try_limit();
        credential.tries_remaining = self.cvm.tries_remaining();
        credential.blocked = self.cvm.is_blocked();

        let machine = &self.pairing;
        let engine = machine.engine();
        let seeds = machine.seeds();
        let key_bytes = |k: &TdesKey| k.as_bytes().to_vec();

        let mut pairing = PairingRecord::default();
        pairing.state = machine.state();
        pairing.key_scalar = engine.key_pair().map(|kp| kp.scalar_bytes().to_vec());
        pairing.session_key = engine.session_key().ok().map(key_bytes);
        pairing.secret_confirmed = engine.is_confirmed();
        pairing.seed_x = seeds.seed_x.as_ref().map(key_bytes);
        pairing.seed_y = seeds.seed_y.as_ref().map(key_bytes);
        pairing.ble_seed = seeds.ble_seed.as_ref().map(|s| s.as_bytes().to_vec());
        pairing.pair_key = machine.pair_key().map(|k| k.as_bytes().to_vec());

        TokenRecord {
            version: RECORD_VERSION,
            identity,
            credential,
            pairing,
        }
    }

    pub fn from_record(record: &TokenRecord, policy: &TokenPolicy) -> FobResult<Self> {
        let id = &record.identity;
        let identity = IdentityStore::restore(
            id.serial_number.as_deref(),
            id.unique_id.as_deref(),
            id.display_name.as_deref(),
        )
        .map_err(|e| corrupt("identity", e))?;

        let cred = &record.credential;
        let pin = cred
            .pin
            .as_deref()
            .map(Pin::from_bytes)
            .transpose()
            .map_err(|e| corrupt("pin", e))?;
        let cvm = CvmGate::restore(pin, policy.pin_try_limit, cred.tries_remaining, cred.blocked);

        let p = &record.pairing;
        let key_pair = p
            .key_scalar
            .as_deref()
            .map(EphemeralKeyPair::from_scalar_bytes)
            .transpose()
            .map_err(|e| corrupt("key_scalar", e))?;
        let tdes = |field: &'static str, v: &Option<Vec<u8>>| {
            v.as_deref()
                .map(TdesKey::from_slice)
                .transpose()
                .map_err(|e| corrupt(field, e))
        };
        let session_key = tdes("session_key", &p.session_key)?;
        let seeds = SeedMaterial {
            seed_x: tdes("seed_x", &p.seed_x)?,
            seed_y: tdes("seed_y", &p.seed_y)?,
            ble_seed: p
                .ble_seed
                .as_deref()
                .map(BleSeed::from_slice)
                .transpose()
                .map_err(|e| corrupt("ble_seed", e))?,
        };
        let pair_key = p
            .pair_key
            .as_deref()
            .map(PairKey::from_slice)
            .transpose()
            .map_err(|e| corrupt("pair_key", e))?;

        let engine = KeyAgreementEngine::restore(key_pair, session_key, p.secret_confirmed);
        let pairing = PairingMachine::restore(p.state, engine, seeds, pair_key);

        Ok(Self {
            identity,
            cvm,
            pairing,
        })
    }
}

fn fixed<const N: usize>(payload: &[u8]) -> FobResult<[u8; N]> {
    payload.try_into().map_err(|_| FobError::LengthMismatch {
        expected: N,
        got: payload.len(),
    })
}

fn gate(state: &TokenState, required: bool) -> FobResult<()> {
    if required {
        state.cvm.require_verified()?;
    }
    Ok(())
}

/// Decrypt an 8-byte PIN block under the session key. The two bytes after
/// the digits must be zero.
fn open_pin_block(
    state: &TokenState,
    block: &[u8; PIN_BLOCK_LEN],
) -> FobResult<Zeroizing<[u8; PIN_BLOCK_LEN]>> {
    let key = state.pairing.engine().session_key()?;
    let mut plain = Zeroizing::new(*block);
    decrypt_in_place(key, &mut plain[..])?;
    if plain[PIN_LEN..].iter().any(|b| *b != 0) {
        return Err(FobError::MalformedRequest("PIN block padding must be zero".into()));
    }
    Ok(plain)
}

// ============================================================================
// KeyFob
// ============================================================================

pub struct KeyFob<S: Store> {
    store: S,
    policy: TokenPolicy,
    state: TokenState,
}

impl<S: Store> KeyFob<S> {
    /// Open the token backed by `store`. Opening always starts a new session.
    pub fn open(store: S, policy: TokenPolicy) -> FobResult<Self> {
        policy.validate()?;
        let state = match store.load()? {
            Some(record) => TokenState::from_record(&record, &policy)?,
            None => TokenState::fresh(&policy),
        };
        info!(state = %state.pairing.state(), "token opened");
        Ok(Self {
            store,
            policy,
            state,
        })
    }

    pub fn state(&self) -> &TokenState {
        &self.state
    }

    pub fn pairing_state(&self) -> PairingState {
        self.state.pairing.state()
    }

    pub fn policy(&self) -> &TokenPolicy {
        &self.policy
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    fn transact<T>(
        &mut self,
        op: &'static str,
        f: impl FnOnce(&mut TokenState, &TokenPolicy) -> FobResult<T>,
    ) -> FobResult<T> {
        let mut next = self.state.clone();
        let out = f(&mut next, &self.policy).map_err(|e| {
            debug!(op, error = %e, "operation refused");
            e
        })?;
        if let Err(e) = self.store.save(&next.to_record()) {
            warn!(op, error = %e, "persisting token state failed");
            return Err(e.into());
        }
        self.state = next;
        debug!(op, state = %self.state.pairing.state(), "operation committed");
        Ok(out)
    }

    fn inspect<T>(
        &self,
        op: &'static str,
        f: impl FnOnce(&TokenState, &TokenPolicy) -> FobResult<T>,
    ) -> FobResult<T> {
        f(&self.state, &self.policy).map_err(|e| {
            debug!(op, error = %e, "operation refused");
            e
        })
    }

    // ------------------------------------------------------------------------
    // Session and administration
    // ------------------------------------------------------------------------

    /// Start a new communication session. Clears PIN verification.
    pub fn begin_session(&mut self) {
        self.state.cvm.begin_session();
        debug!("new session");
    }

    /// Wipe every entity and the persisted record.
    pub fn factory_reset(&mut self) -> FobResult<()> {
        self.store.clear()?;
        self.state = TokenState::fresh(&self.policy);
        warn!("token factory reset");
        Ok(())
    }

    /// Administrative unblock: installs `new_pin` and restores the try budget.
    pub fn unblock_pin(&mut self, new_pin: &[u8]) -> FobResult<()> {
        let pin = Pin::from_bytes(new_pin)?;
        self.transact("unblock_pin", move |st, _| {
            st.cvm.unblock(pin);
            Ok(())
        })
    }

    // ------------------------------------------------------------------------
    // Identity
    // ------------------------------------------------------------------------

    pub fn store_identity(&mut self, field: IdentityField, bytes: &[u8]) -> FobResult<()> {
        field.validate_len(bytes.len())?;
        self.transact("store_identity", |st, policy| {
            gate(st, field == IdentityField::DisplayName && policy.require_pin)?;
            st.identity.store_field(field, bytes)
        })
    }

    pub fn read_identity(&self, field: IdentityField) -> FobResult<Vec<u8>> {
        self.inspect("read_identity", |st, _| st.identity.read_field(field))
    }

    // ------------------------------------------------------------------------
    // CVM
    // ------------------------------------------------------------------------

    /// Configure the PIN. The first configuration takes six plaintext
    /// digits; re-keying takes an encrypted PIN block and a PIN verified
    /// earlier in this session.
    pub fn store_pin(&mut self, payload: &[u8]) -> FobResult<()> {
        if !self.state.cvm.is_configured() {
            let pin = Pin::from_bytes(payload)?;
            return self.transact("store_pin", move |st, _| st.cvm.configure(pin));
        }

        let block = fixed::<PIN_BLOCK_LEN>(payload)?;
        self.transact("store_pin", |st, _| {
            st.cvm.require_verified()?;
            let plain = open_pin_block(st, &block)?;
            let pin = Pin::from_bytes(&plain[..PIN_LEN])?;
            st.cvm.configure(pin)
        })
    }

    /// Verify an encrypted PIN block. A mismatch is not an error: it is
    /// reported as [`PinCheck::Rejected`] and the decremented budget is
    /// persisted.
    pub fn verify_pin(&mut self, payload: &[u8]) -> FobResult<PinCheck> {
        let block = fixed::<PIN_BLOCK_LEN>(payload)?;
        self.transact("verify_pin", |st, _| {
            if !st.cvm.is_configured() {
                return Err(FobError::PinNotConfigured);
            }
            if st.cvm.is_blocked() {
                return Err(FobError::CredentialBlocked);
            }
            let plain = open_pin_block(st, &block)?;
            st.cvm.verify(&plain[..PIN_LEN])
        })
    }

    pub fn association_status(&self) -> AssociationStatus {
        let cvm = &self.state.cvm;
        if cvm.is_blocked() {
            AssociationStatus::PinBlocked
        } else if (cvm.is_configured() && !cvm.is_verified())
            || (!cvm.is_configured() && self.policy.require_pin)
        {
            AssociationStatus::PinNotVerified
        } else if self.state.pairing.is_associated() {
            AssociationStatus::AlreadyPaired
        } else {
            AssociationStatus::ReadyToPair
        }
    }

    // ------------------------------------------------------------------------
    // Pairing
    // ------------------------------------------------------------------------

    pub fn get_public_key(&mut self) -> FobResult<[u8; PUBLIC_POINT_LEN]> {
        self.transact("get_public_key", |st, _| st.pairing.request_public_key())
    }

    pub fn generate_secret_key(&mut self, peer_point: &[u8]) -> FobResult<()> {
        self.transact("generate_secret_key", |st, _| {
            st.pairing.supply_peer_public_key(peer_point)
        })
    }

    pub fn confirm_secret_key(&mut self, ciphertext: &[u8]) -> FobResult<()> {
        let ct = fixed::<BLOCK_LEN>(ciphertext)?;
        self.transact("confirm_secret_key", |st, _| st.pairing.confirm_secret(&ct))
    }

    pub fn save_seed_x(&mut self, ciphertext: &[u8]) -> FobResult<()> {
        let ct = fixed::<SEED_LEN>(ciphertext)?;
        self.transact("save_seed_x", |st, _| st.pairing.store_seed_x(&ct))
    }

    pub fn get_seed_y(&mut self) -> FobResult<[u8; SEED_LEN]> {
        self.transact("get_seed_y", |st, _| st.pairing.generate_seed_y())
    }

    pub fn store_pair_key(&mut self, ciphertext: &[u8]) -> FobResult<()> {
        let ct = fixed::<PAIR_KEY_LEN>(ciphertext)?;
        self.transact("store_pair_key", |st, _| {
            gate(st, true)?;
            st.pairing.store_pair_key(&ct)
        })
    }

    pub fn read_pair_key(&self) -> FobResult<[u8; PAIR_KEY_LEN]> {
        self.inspect("read_pair_key", |st, _| {
            gate(st, true)?;
            st.pairing.read_pair_key()
        })
    }

    pub fn save_ble_seed(&mut self, ciphertext: &[u8]) -> FobResult<()> {
        let ct = fixed::<BLE_SEED_LEN>(ciphertext)?;
        self.transact("save_ble_seed", |st, policy| {
            gate(st, policy.require_pin)?;
            st.pairing.store_ble_seed(&ct)
        })
    }

    pub fn finalize_association(&mut self) -> FobResult<()> {
        self.transact("finalize_association", |st, policy| {
            gate(st, policy.require_pin)?;
            st.pairing.finalize(policy.require_pair_key)
        })
    }

    pub fn authenticate_seed(&self) -> FobResult<[u8; DIGEST_BLOCK_LEN]> {
        self.inspect("authenticate_seed", |st, policy| {
            gate(st, policy.require_pin)?;
            st.pairing.authenticate_challenge()
        })
    }
}

impl<S: Store> BleSeedSource for KeyFob<S> {
    fn retrieve_ble_seed(&mut self) -> FobResult<BleSeed> {
        self.transact("retrieve_ble_seed", |st, _| st.pairing.retrieve_ble_seed())
    }
}
