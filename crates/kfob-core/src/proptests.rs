#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use crate::cvm::{CvmGate, Pin, PinCheck};
    use crate::errors::{FobError, FobResult};
    use crate::harness::OrwlHost;
    use crate::identity::{IdentityField, IdentityStore};
    use crate::pairing::PairingState;
    use crate::policy::TokenPolicy;
    use crate::seed::BleSeedSource;
    use crate::store::MemoryStore;
    use crate::token::KeyFob;

    fn field() -> impl Strategy<Value = IdentityField> {
        prop_oneof![
            Just(IdentityField::SerialNumber),
            Just(IdentityField::UniqueId),
            Just(IdentityField::DisplayName),
        ]
    }

    fn valid_value(field: IdentityField) -> BoxedStrategy<Vec<u8>> {
        match field {
            IdentityField::DisplayName => prop::collection::vec(any::<u8>(), 1..=255).boxed(),
            _ => prop::collection::vec(any::<u8>(), 16..=16).boxed(),
        }
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    enum Refusal {
        Order,
        Repeat,
        Associated,
    }

    const STAGES: [PairingState; 5] = [
        PairingState::Unassociated,
        PairingState::SecretPending,
        PairingState::SecretConfirmed,
        PairingState::SeedXStored,
        PairingState::Associated,
    ];

    /// Walk a fresh token `stage` steps down the happy path with valid
    /// host payloads. Stage 0 has no key pair yet.
    fn drive(stage: usize) -> (KeyFob<MemoryStore>, OrwlHost) {
        let mut fob = KeyFob::open(MemoryStore::new(), TokenPolicy::default()).unwrap();
        let mut host = OrwlHost::new().unwrap();
        if stage >= 1 {
            let point = fob.get_public_key().unwrap();
            host.accept_token_point(&point).unwrap();
            fob.generate_secret_key(&host.public_point()).unwrap();
        }
        if stage >= 2 {
            fob.confirm_secret_key(&host.sample_ciphertext().unwrap()).unwrap();
        }
        if stage >= 3 {
            fob.save_seed_x(&host.seed_x_ciphertext().unwrap()).unwrap();
        }
        if stage >= 4 {
            fob.finalize_association().unwrap();
        }
        assert_eq!(fob.pairing_state(), STAGES[stage]);
        (fob, host)
    }

    /// Expected refusal of pairing step `op` in `stage`; `None` when the
    /// step is in order there.
    fn refusal(stage: usize, op: u8) -> Option<Refusal> {
        use Refusal::*;
        if stage == 4 {
            return match op {
                7 | 8 => None,
                _ => Some(Associated),
            };
        }
        match op {
            0 if stage <= 1 => None,
            0 => Some(Repeat),
            1 if stage == 0 => Some(Order),
            1 => Some(Repeat),
            2 if stage == 1 => None,
            2 if stage == 0 => Some(Order),
            2 => Some(Repeat),
            3 if stage == 2 => None,
            3 if stage == 3 => Some(Repeat),
            3 => Some(Order),
            4..=6 if stage == 3 => None,
            _ => Some(Order),
        }
    }

    fn run_step(fob: &mut KeyFob<MemoryStore>, host: &OrwlHost, op: u8) -> FobResult<()> {
        match op {
            0 => fob.get_public_key().map(|_| ()),
            1 => fob.generate_secret_key(&host.public_point()),
            2 => fob.confirm_secret_key(&host.sample_ciphertext().unwrap_or([0; 8])),
            3 => fob.save_seed_x(&host.seed_x_ciphertext().unwrap_or([0; 24])),
            4 => fob.get_seed_y().map(|_| ()),
            5 => fob.finalize_association(),
            6 => fob.save_ble_seed(&host.ble_seed_ciphertext().unwrap_or([0; 40])),
            7 => fob.authenticate_seed().map(|_| ()),
            _ => fob.retrieve_ble_seed().map(|_| ()),
        }
    }

    proptest! {
        #[test]
        fn test_identity_write_once(
            (field, first) in field().prop_flat_map(|f| (Just(f), valid_value(f))),
            second in prop::collection::vec(any::<u8>(), 16..=16)
        ) {
            let mut ids = IdentityStore::new();
            ids.store_field(field, &first).unwrap();
            prop_assert!(ids.store_field(field, &second).is_err());
            prop_assert_eq!(ids.read_field(field).unwrap(), first);
        }

        #[test]
        fn test_try_budget_exhausts(limit in 1u8..=15, wrong in 0u8..10) {
            let mut gate = CvmGate::new(limit);
            gate.configure(Pin::from_bytes(&[9, 9, 9, 9, 9, 9]).unwrap()).unwrap();
            let candidate = [wrong; 6];
            prop_assume!(candidate != [9; 6]);
            for left in (0..limit).rev() {
                prop_assert_eq!(
                    gate.verify(&candidate).unwrap(),
                    PinCheck::Rejected { tries_remaining: left }
                );
            }
            prop_assert!(gate.is_blocked());
            prop_assert!(gate.verify(&[9, 9, 9, 9, 9, 9]).is_err());
        }

        #[test]
        fn test_out_of_order_step_refused_from_any_stage(stage in 0usize..5, op in 0u8..9) {
            let expected = refusal(stage, op);
            prop_assume!(expected.is_some());
            let (mut fob, host) = drive(stage);
            let before = fob.state().to_record();

            let err = run_step(&mut fob, &host, op).unwrap_err();
            match expected {
                Some(Refusal::Order) => prop_assert!(
                    matches!(&err, FobError::ProtocolOrderViolation { state, .. } if *state == STAGES[stage]),
                    "stage {} op {}: {:?}", stage, op, err
                ),
                Some(Refusal::Repeat) => prop_assert!(
                    matches!(err, FobError::AlreadySet(_)),
                    "stage {} op {}: {:?}", stage, op, err
                ),
                Some(Refusal::Associated) => prop_assert_eq!(err, FobError::AlreadyAssociated),
                None => unreachable!(),
            }
            prop_assert_eq!(fob.pairing_state(), STAGES[stage]);
            prop_assert_eq!(fob.state().to_record(), before);
        }

        #[test]
        fn test_refused_commands_leave_record_unchanged(
            ops in prop::collection::vec((0u8..8, prop::collection::vec(any::<u8>(), 0..64)), 1..24)
        ) {
            let mut fob = KeyFob::open(MemoryStore::new(), TokenPolicy::default()).unwrap();
            for (op, payload) in ops {
                let before = fob.state().to_record();
                let result = match op {
                    0 => fob.get_public_key().map(|_| ()),
                    1 => fob.generate_secret_key(&payload),
                    2 => fob.confirm_secret_key(&payload),
                    3 => fob.save_seed_x(&payload),
                    4 => fob.get_seed_y().map(|_| ()),
                    5 => fob.save_ble_seed(&payload),
                    6 => fob.finalize_association(),
                    _ => fob.verify_pin(&payload).map(|_| ()),
                };
                if result.is_err() {
                    prop_assert_eq!(fob.state().to_record(), before);
                }
            }
        }
    }
}
