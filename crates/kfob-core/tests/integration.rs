//! Integration tests for KeyFOB token flows.
//!
//! These tests drive the token through its public API:
//! - Full association and the one-time finalize
//! - Challenge authentication against the stored BLE seed
//! - Read-once seed hand-off to the BLE component
//! - PIN gating and persistence of the try budget

use std::sync::Arc;

use kfob_core::cvm::{Pin, PinCheck};
use kfob_core::errors::FobError;
use kfob_core::harness::OrwlHost;
use kfob_core::identity::IdentityField;
use kfob_core::pairing::{challenge_digest, Operation};
use kfob_core::seed::{BleLinkAgent, BleSeed};
use kfob_core::{AssociationStatus, KeyFob, MemoryStore, PairingState, Store, TokenPolicy};
use kfob_crypto::tdes::{decrypt_in_place, TdesKey};

type Fob = KeyFob<Arc<MemoryStore>>;

fn open(policy: TokenPolicy) -> (Fob, Arc<MemoryStore>) {
    let store = Arc::new(MemoryStore::new());
    (KeyFob::open(store.clone(), policy).unwrap(), store)
}

/// Run the handshake up to SeedXStored.
fn to_seed_x(fob: &mut Fob, host: &mut OrwlHost) {
    let point = fob.get_public_key().unwrap();
    host.accept_token_point(&point).unwrap();
    fob.generate_secret_key(&host.public_point()).unwrap();
    fob.confirm_secret_key(&host.sample_ciphertext().unwrap()).unwrap();
    fob.save_seed_x(&host.seed_x_ciphertext().unwrap()).unwrap();
}

fn open_seed_y(host: &OrwlHost, ct: &[u8; 24]) -> [u8; 24] {
    let mut plain = *ct;
    decrypt_in_place(host.session_key().unwrap(), &mut plain).unwrap();
    decrypt_in_place(host.seed_x(), &mut plain).unwrap();
    plain
}

/// Test: full association, finalize succeeds exactly once
#[test]
fn integration_association_is_one_time() {
    let (mut fob, _) = open(TokenPolicy::default());
    let mut host = OrwlHost::new().unwrap();
    to_seed_x(&mut fob, &mut host);

    let first = fob.get_seed_y().unwrap();
    let second = fob.get_seed_y().unwrap();
    assert_ne!(first, second);
    host.accept_seed_y(&second).unwrap();

    fob.finalize_association().unwrap();
    assert_eq!(fob.pairing_state(), PairingState::Associated);
    assert_eq!(fob.association_status(), AssociationStatus::AlreadyPaired);
    assert_eq!(fob.finalize_association(), Err(FobError::AlreadyAssociated));
    assert_eq!(fob.get_public_key(), Err(FobError::AlreadyAssociated));
}

/// Test: seedY differs between independent pairing attempts
#[test]
fn integration_seed_y_fresh_per_attempt() {
    let mut seeds = Vec::new();
    for _ in 0..2 {
        let (mut fob, _) = open(TokenPolicy::default());
        let mut host = OrwlHost::new().unwrap();
        to_seed_x(&mut fob, &mut host);
        let ct = fob.get_seed_y().unwrap();
        seeds.push(open_seed_y(&host, &ct));
    }
    assert_ne!(seeds[0], seeds[1]);
}

/// Test: challenge authentication only after association
#[test]
fn integration_authenticate_challenge() {
    let (mut fob, _) = open(TokenPolicy::default());
    let mut host = OrwlHost::new().unwrap();
    to_seed_x(&mut fob, &mut host);
    let seed_y = fob.get_seed_y().unwrap();
    fob.save_ble_seed(&host.ble_seed_ciphertext().unwrap()).unwrap();

    assert_eq!(
        fob.authenticate_seed(),
        Err(FobError::ProtocolOrderViolation {
            operation: Operation::AuthenticateChallenge,
            state: PairingState::SeedXStored,
        })
    );

    fob.finalize_association().unwrap();
    let mut block = fob.authenticate_seed().unwrap();
    decrypt_in_place(host.session_key().unwrap(), &mut block).unwrap();
    let seed_y = TdesKey::from_bytes(open_seed_y(&host, &seed_y));
    decrypt_in_place(&seed_y, &mut block).unwrap();
    assert_eq!(block, challenge_digest(host.ble_seed()));
}

/// Test: the BLE component takes the seed exactly once
#[test]
fn integration_seed_hand_off_is_read_once() {
    let (mut fob, store) = open(TokenPolicy::default());
    let mut host = OrwlHost::new().unwrap();
    let mut agent = BleLinkAgent::new();
    assert!(agent.load_from(&mut fob).is_err());

    to_seed_x(&mut fob, &mut host);
    fob.save_ble_seed(&host.ble_seed_ciphertext().unwrap()).unwrap();
    fob.finalize_association().unwrap();

    agent.load_from(&mut fob).unwrap();
    assert_eq!(agent.seed().map(BleSeed::as_bytes), Some(host.ble_seed().as_bytes()));

    let mut other = BleLinkAgent::new();
    assert_eq!(other.load_from(&mut fob), Err(FobError::SeedNotAvailable));
    assert_eq!(fob.authenticate_seed(), Err(FobError::SeedNotAvailable));
    assert!(store.load().unwrap().unwrap().pairing.ble_seed.is_none());
}

/// Test: the try budget survives a restart
#[test]
fn integration_pin_budget_persists() {
    let (mut fob, store) = open(TokenPolicy::default());
    let mut host = OrwlHost::new().unwrap();
    fob.store_pin(Pin::from_ascii("135790").unwrap().as_bytes()).unwrap();

    let point = fob.get_public_key().unwrap();
    host.accept_token_point(&point).unwrap();
    fob.generate_secret_key(&host.public_point()).unwrap();
    fob.confirm_secret_key(&host.sample_ciphertext().unwrap()).unwrap();

    let wrong = host.pin_block(&Pin::from_ascii("000000").unwrap()).unwrap();
    assert_eq!(fob.verify_pin(&wrong).unwrap(), PinCheck::Rejected { tries_remaining: 4 });
    drop(fob);

    let mut fob = KeyFob::open(store, TokenPolicy::default()).unwrap();
    assert_eq!(fob.state().cvm.tries_remaining(), 4);
    assert_eq!(fob.pairing_state(), PairingState::SecretConfirmed);
    let right = host.pin_block(&Pin::from_ascii("135790").unwrap()).unwrap();
    assert_eq!(fob.verify_pin(&right).unwrap(), PinCheck::Accepted);
    assert_eq!(fob.state().cvm.tries_remaining(), 5);
}

/// Test: strict policy gates the display name and the association
#[test]
fn integration_strict_policy() {
    let (mut fob, _) = open(TokenPolicy::strict());
    let mut host = OrwlHost::new().unwrap();
    fob.store_identity(IdentityField::SerialNumber, &[0x11; 16]).unwrap();
    assert_eq!(
        fob.store_identity(IdentityField::DisplayName, b"ORWL fob"),
        Err(FobError::PinNotConfigured)
    );

    let pin = Pin::from_ascii("246810").unwrap();
    fob.store_pin(pin.as_bytes()).unwrap();
    to_seed_x(&mut fob, &mut host);
    assert_eq!(fob.finalize_association(), Err(FobError::AuthorizationRequired));

    fob.verify_pin(&host.pin_block(&pin).unwrap()).unwrap();
    fob.store_identity(IdentityField::DisplayName, b"ORWL fob").unwrap();
    assert!(matches!(
        fob.finalize_association(),
        Err(FobError::ProtocolOrderViolation { .. })
    ));
    fob.store_pair_key(&host.pair_key_ciphertext().unwrap()).unwrap();
    fob.finalize_association().unwrap();

    let ct = fob.read_pair_key().unwrap();
    assert_eq!(&host.open_pair_key(&ct).unwrap(), host.pair_key());
}
