#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use crate::ecdh::EphemeralKeyPair;
    use crate::hash::{sha1, stretch_digest};
    use crate::tdes::{decrypt_in_place, encrypt_in_place, TdesKey};

    proptest! {
        #[test]
        fn test_cbc_round_trip(
            key in any::<[u8; 24]>(),
            blocks in 0usize..8,
            fill in any::<u8>()
        ) {
            let key = TdesKey::from_bytes(key);
            let plaintext: Vec<u8> = (0..blocks * 8).map(|i| fill.wrapping_add(i as u8)).collect();
            let mut buf = plaintext.clone();
            encrypt_in_place(&key, &mut buf).unwrap();
            decrypt_in_place(&key, &mut buf).unwrap();
            prop_assert_eq!(buf, plaintext);
        }

        #[test]
        fn test_unaligned_always_rejected(len in 1usize..64) {
            prop_assume!(len % 8 != 0);
            let key = TdesKey::from_bytes([7u8; 24]);
            let mut buf = vec![0u8; len];
            prop_assert!(encrypt_in_place(&key, &mut buf).is_err());
        }

        #[test]
        fn test_stretch_prefix(data in any::<Vec<u8>>()) {
            let d = sha1(&data);
            let s: [u8; 24] = stretch_digest(&d);
            prop_assert_eq!(&s[..20], &d[..]);
            prop_assert_eq!(&s[20..], &d[..4]);
        }
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(16))]

        #[test]
        fn test_agreement_symmetric(_seed in any::<u8>()) {
            let a = EphemeralKeyPair::generate();
            let b = EphemeralKeyPair::generate();
            prop_assert_eq!(
                a.agree(&b.public_point()).unwrap(),
                b.agree(&a.public_point()).unwrap()
            );
        }
    }
}
