//! BLE seed and the on-token retrieval interface.
//!
//! The seed is handed to the cooperating BLE component through the narrow
//! [`BleSeedSource`] capability. Retrieval is read-once: the source wipes its
//! copy as soon as the caller's copy exists.

use std::fmt;

use tracing::{debug, info};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::errors::{FobError, FobResult};

pub const BLE_SEED_LEN: usize = 40;

/// Prefix of the seed that feeds the challenge digest.
pub const CHALLENGE_WINDOW_LEN: usize = 32;

#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct BleSeed([u8; BLE_SEED_LEN]);

impl BleSeed {
    pub fn from_bytes(bytes: [u8; BLE_SEED_LEN]) -> Self {
        Self(bytes)
    }

    pub fn from_slice(bytes: &[u8]) -> FobResult<Self> {
        FobError::check_len(BLE_SEED_LEN, bytes.len())?;
        let mut out = [0u8; BLE_SEED_LEN];
        out.copy_from_slice(bytes);
        Ok(Self(out))
    }

    pub fn as_bytes(&self) -> &[u8; BLE_SEED_LEN] {
        &self.0
    }

    pub fn challenge_window(&self) -> &[u8] {
        &self.0[..CHALLENGE_WINDOW_LEN]
    }
}

impl fmt::Debug for BleSeed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BleSeed([REDACTED])")
    }
}

/// Capability granting read-once access to the stored BLE seed.
///
/// Only the BLE seed is reachable through this trait; the session key and
/// PairKey are not.
pub trait BleSeedSource {
    /// Copy the seed out and wipe the source.
    fn retrieve_ble_seed(&mut self) -> FobResult<BleSeed>;
}

/// The seed-less on-token component that drives BLE bonding.
#[derive(Debug, Default)]
pub struct BleLinkAgent {
    seed: Option<BleSeed>,
}

impl BleLinkAgent {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pull the seed from `source`. Holding a seed already is a no-op.
    pub fn load_from<S: BleSeedSource + ?Sized>(&mut self, source: &mut S) -> FobResult<()> {
        if self.seed.is_some() {
            debug!("BLE agent already holds a seed");
            return Ok(());
        }
        let seed = source.retrieve_ble_seed()?;
        self.seed = Some(seed);
        info!("BLE agent loaded seed");
        Ok(())
    }

    pub fn has_seed(&self) -> bool {
        self.seed.is_some()
    }

    pub fn seed(&self) -> Option<&BleSeed> {
        self.seed.as_ref()
    }

    pub fn forget(&mut self) {
        self.seed = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct OneShot(Option<BleSeed>);

    impl BleSeedSource for OneShot {
        fn retrieve_ble_seed(&mut self) -> FobResult<BleSeed> {
            self.0.take().ok_or(FobError::SeedNotAvailable)
        }
    }

    #[test]
    fn test_challenge_window() {
        let mut bytes = [0u8; BLE_SEED_LEN];
        for (i, b) in bytes.iter_mut().enumerate() {
            *b = i as u8;
        }
        let seed = BleSeed::from_bytes(bytes);
        assert_eq!(seed.challenge_window().len(), 32);
        assert_eq!(seed.challenge_window()[31], 31);
    }

    #[test]
    fn test_from_slice_length() {
        assert_eq!(
            BleSeed::from_slice(&[0u8; 39]),
            Err(FobError::LengthMismatch { expected: 40, got: 39 })
        );
    }

    #[test]
    fn test_agent_loads_once() {
        let mut source = OneShot(Some(BleSeed::from_bytes([5u8; BLE_SEED_LEN])));
        let mut agent = BleLinkAgent::new();
        agent.load_from(&mut source).unwrap();
        assert_eq!(agent.seed().unwrap().as_bytes(), &[5u8; BLE_SEED_LEN]);

        // second load does not touch the already drained source
        agent.load_from(&mut source).unwrap();
        assert!(agent.has_seed());

        agent.forget();
        assert_eq!(agent.load_from(&mut source), Err(FobError::SeedNotAvailable));
    }

    #[test]
    fn test_debug_redacted() {
        let seed = BleSeed::from_bytes([0x41; BLE_SEED_LEN]);
        assert_eq!(format!("{:?}", seed), "BleSeed([REDACTED])");
    }
}
