//! Host-side driver for exercising a token end to end.
//!
//! [`OrwlHost`] holds the material the ORWL side of the handshake owns and
//! builds the encrypted payloads it sends. [`run_pairing_flow`] drives a
//! [`Dispatcher`] through a complete association using encoded request
//! frames only, the way a real host would.

use std::fmt;

use thiserror::Error;
use tracing::{debug, info};
use zeroize::Zeroize;

use kfob_crypto::ecdh::EphemeralKeyPair;
use kfob_crypto::tdes::{decrypt_in_place, encrypt_in_place, TdesKey, BLOCK_LEN};
use kfob_crypto::utils::{constant_time_compare, random_array};
use kfob_crypto::{AgreementError, CodecError, RngError};

use crate::agreement::SAMPLE_PLAINTEXT;
use crate::cvm::{Pin, PIN_LEN};
use crate::dispatch::{Command, Dispatcher, Request, Response};
use crate::errors::{FobError, StatusWord};
use crate::pairing::{challenge_digest, DIGEST_BLOCK_LEN, PAIR_KEY_LEN, SEED_LEN};
use crate::seed::{BleSeed, BLE_SEED_LEN};
use crate::store::Store;
use crate::token::{AssociationStatus, PIN_BLOCK_LEN};

#[derive(Debug, Error)]
pub enum HarnessError {
    #[error("{command} refused with status {status}")]
    Refused { command: Command, status: StatusWord },

    #[error("unexpected response to {command}: {reason}")]
    UnexpectedResponse { command: Command, reason: String },

    #[error("no session key; the token's public point was never accepted")]
    NoSession,

    #[error("challenge response did not match the BLE seed")]
    ChallengeMismatch,

    #[error(transparent)]
    Fob(#[from] FobError),

    #[error(transparent)]
    Agreement(#[from] AgreementError),

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error(transparent)]
    Rng(#[from] RngError),
}

// ============================================================================
// ORWL Host
// ============================================================================

/// The ORWL side of a pairing.
pub struct OrwlHost {
    key_pair: EphemeralKeyPair,
    session: Option<TdesKey>,
    seed_x: TdesKey,
    seed_y: Option<TdesKey>,
    ble_seed: BleSeed,
    pair_key: [u8; PAIR_KEY_LEN],
}

impl fmt::Debug for OrwlHost {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OrwlHost")
            .field("public_point", &hex::encode(self.public_point()))
            .field("session", &self.session.as_ref().map(|_| "[REDACTED]"))
            .field("seed_x", &"[REDACTED]")
            .field("seed_y", &self.seed_y.as_ref().map(|_| "[REDACTED]"))
            .field("ble_seed", &"[REDACTED]")
            .field("pair_key", &"[REDACTED]")
            .finish()
    }
}

impl Drop for OrwlHost {
    fn drop(&mut self) {
        self.pair_key.zeroize();
    }
}

impl OrwlHost {
    /// A host with freshly drawn seedX, BLE seed and pair key.
    pub fn new() -> Result<Self, HarnessError> {
        Ok(Self::with_material(
            TdesKey::from_bytes(random_array::<SEED_LEN>()?),
            BleSeed::from_bytes(random_array::<BLE_SEED_LEN>()?),
            random_array::<PAIR_KEY_LEN>()?,
        ))
    }

    pub fn with_material(seed_x: TdesKey, ble_seed: BleSeed, pair_key: [u8; PAIR_KEY_LEN]) -> Self {
        Self {
            key_pair: EphemeralKeyPair::generate(),
            session: None,
            seed_x,
            seed_y: None,
            ble_seed,
            pair_key,
        }
    }

    pub fn public_point(&self) -> [u8; kfob_crypto::PUBLIC_POINT_LEN] {
        self.key_pair.public_point()
    }

    pub fn session_key(&self) -> Result<&TdesKey, HarnessError> {
        self.session.as_ref().ok_or(HarnessError::NoSession)
    }

    pub fn seed_x(&self) -> &TdesKey {
        &self.seed_x
    }

    pub fn seed_y(&self) -> Option<&TdesKey> {
        self.seed_y.as_ref()
    }

    pub fn ble_seed(&self) -> &BleSeed {
        &self.ble_seed
    }

    pub fn pair_key(&self) -> &[u8; PAIR_KEY_LEN] {
        &self.pair_key
    }

    /// Derive the session key from the token's public point.
    pub fn accept_token_point(&mut self, token_point: &[u8]) -> Result<(), HarnessError> {
        self.session = Some(self.key_pair.agree(token_point)?);
        Ok(())
    }

    pub fn sample_ciphertext(&self) -> Result<[u8; BLOCK_LEN], HarnessError> {
        let mut ct = SAMPLE_PLAINTEXT;
        encrypt_in_place(self.session_key()?, &mut ct)?;
        Ok(ct)
    }

    pub fn pin_block(&self, pin: &Pin) -> Result<[u8; PIN_BLOCK_LEN], HarnessError> {
        let mut block = [0u8; PIN_BLOCK_LEN];
        block[..PIN_LEN].copy_from_slice(pin.as_bytes());
        encrypt_in_place(self.session_key()?, &mut block)?;
        Ok(block)
    }

    pub fn seed_x_ciphertext(&self) -> Result<[u8; SEED_LEN], HarnessError> {
        let mut ct = *self.seed_x.as_bytes();
        encrypt_in_place(self.session_key()?, &mut ct)?;
        Ok(ct)
    }

    /// The BLE seed under seedX, then the session key.
    pub fn ble_seed_ciphertext(&self) -> Result<[u8; BLE_SEED_LEN], HarnessError> {
        let mut ct = *self.ble_seed.as_bytes();
        encrypt_in_place(&self.seed_x, &mut ct)?;
        encrypt_in_place(self.session_key()?, &mut ct)?;
        Ok(ct)
    }

    pub fn pair_key_ciphertext(&self) -> Result<[u8; PAIR_KEY_LEN], HarnessError> {
        let mut ct = self.pair_key;
        encrypt_in_place(self.session_key()?, &mut ct)?;
        Ok(ct)
    }

    /// Unwrap seedY: session key first, then seedX.
    pub fn accept_seed_y(&mut self, ciphertext: &[u8]) -> Result<(), HarnessError> {
        let mut plain: [u8; SEED_LEN] =
            ciphertext
                .try_into()
                .map_err(|_| HarnessError::UnexpectedResponse {
                    command: Command::GetSeedY,
                    reason: format!("{} bytes", ciphertext.len()),
                })?;
        decrypt_in_place(self.session_key()?, &mut plain)?;
        decrypt_in_place(&self.seed_x, &mut plain)?;
        self.seed_y = Some(TdesKey::from_bytes(plain));
        Ok(())
    }

    /// Check an authenticate-seed response against the BLE seed this host
    /// handed over.
    pub fn verify_challenge(&self, response: &[u8]) -> Result<(), HarnessError> {
        let seed_y = self.seed_y.as_ref().ok_or(HarnessError::UnexpectedResponse {
            command: Command::AuthenticateSeed,
            reason: "seedY was never received".into(),
        })?;
        let mut block: [u8; DIGEST_BLOCK_LEN] =
            response
                .try_into()
                .map_err(|_| HarnessError::UnexpectedResponse {
                    command: Command::AuthenticateSeed,
                    reason: format!("{} bytes", response.len()),
                })?;
        decrypt_in_place(self.session_key()?, &mut block)?;
        decrypt_in_place(seed_y, &mut block)?;
        if !constant_time_compare(&block, &challenge_digest(&self.ble_seed)) {
            return Err(HarnessError::ChallengeMismatch);
        }
        Ok(())
    }

    /// Recover a pair key returned by the read-pair-key command.
    pub fn open_pair_key(&self, ciphertext: &[u8]) -> Result<[u8; PAIR_KEY_LEN], HarnessError> {
        let mut plain: [u8; PAIR_KEY_LEN] =
            ciphertext
                .try_into()
                .map_err(|_| HarnessError::UnexpectedResponse {
                    command: Command::ReadPairKey,
                    reason: format!("{} bytes", ciphertext.len()),
                })?;
        decrypt_in_place(self.session_key()?, &mut plain)?;
        Ok(plain)
    }
}

// ============================================================================
// Flow
// ============================================================================

/// Send one request as an encoded frame and insist on 9000.
pub fn exchange<S: Store>(
    dispatcher: &mut Dispatcher<S>,
    request: &Request,
) -> Result<Vec<u8>, HarnessError> {
    let command = Command::from_code(request.code).ok_or(FobError::UnknownCommand(request.code))?;
    let frame = request.encode()?;
    let response = Response::from_bytes(&dispatcher.handle_frame(&frame))?;
    if !response.is_ok() {
        return Err(HarnessError::Refused {
            command,
            status: response.status,
        });
    }
    debug!(%command, len = response.data.len(), "exchange complete");
    Ok(response.data)
}

/// Configure the token's first PIN in plaintext.
pub fn provision_pin<S: Store>(dispatcher: &mut Dispatcher<S>, pin: &Pin) -> Result<(), HarnessError> {
    exchange(
        dispatcher,
        &Request::new(Command::StorePin, PIN_LEN as u8, pin.as_bytes().to_vec()),
    )?;
    Ok(())
}

/// Drive a full association. With a PIN the host verifies it once the
/// session key exists and also hands over its pair key.
pub fn run_pairing_flow<S: Store>(
    dispatcher: &mut Dispatcher<S>,
    host: &mut OrwlHost,
    pin: Option<&Pin>,
) -> Result<(), HarnessError> {
    let status = exchange(dispatcher, &Request::bare(Command::AssociationStatus))?;
    match status.first().copied().and_then(AssociationStatus::from_code) {
        Some(AssociationStatus::AlreadyPaired) | Some(AssociationStatus::PinBlocked) => {
            return Err(HarnessError::UnexpectedResponse {
                command: Command::AssociationStatus,
                reason: format!("token reports {:02x?}", status),
            });
        }
        Some(_) => {}
        None => {
            return Err(HarnessError::UnexpectedResponse {
                command: Command::AssociationStatus,
                reason: "unknown status code".into(),
            });
        }
    }

    let token_point = exchange(dispatcher, &Request::bare(Command::GetPublicKey))?;
    host.accept_token_point(&token_point)?;
    exchange(
        dispatcher,
        &Request::new(Command::GenerateSecretKey, 0, host.public_point().to_vec()),
    )?;
    exchange(
        dispatcher,
        &Request::new(Command::ConfirmSecretKey, 0, host.sample_ciphertext()?.to_vec()),
    )?;

    if let Some(pin) = pin {
        exchange(
            dispatcher,
            &Request::new(Command::VerifyPin, PIN_LEN as u8, host.pin_block(pin)?.to_vec()),
        )?;
    }

    exchange(
        dispatcher,
        &Request::new(Command::SaveSeedX, SEED_LEN as u8, host.seed_x_ciphertext()?.to_vec()),
    )?;
    let seed_y = exchange(dispatcher, &Request::bare(Command::GetSeedY))?;
    host.accept_seed_y(&seed_y)?;
    exchange(
        dispatcher,
        &Request::new(Command::SaveSeed, 0, host.ble_seed_ciphertext()?.to_vec()),
    )?;
    if pin.is_some() {
        exchange(
            dispatcher,
            &Request::new(
                Command::StorePairKey,
                PAIR_KEY_LEN as u8,
                host.pair_key_ciphertext()?.to_vec(),
            ),
        )?;
    }
    exchange(dispatcher, &Request::bare(Command::SaveSecretKeys))?;

    let challenge = exchange(dispatcher, &Request::bare(Command::AuthenticateSeed))?;
    host.verify_challenge(&challenge)?;
    info!("pairing flow complete");
    Ok(())
}
