//! Token policy.
//!
//! Knobs that decide how strict the CVM gate is around the pairing flow. The
//! PairKey commands are always PIN-gated regardless of policy.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

/// Default PIN try budget.
pub const DEFAULT_PIN_TRY_LIMIT: u8 = 5;

/// Largest try budget that still fits in a `63Cx` status word.
pub const MAX_PIN_TRY_LIMIT: u8 = 15;

/// Errors from policy validation.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PolicyError {
    #[error("pin_try_limit must be in 1..=15, got {0}")]
    InvalidTryLimit(u8),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TokenPolicy {
    /// Consecutive PIN mismatches before the credential blocks.
    pub pin_try_limit: u8,
    /// Also gate display-name writes, BLE seed storage, finalization and
    /// challenge authentication behind a verified PIN.
    pub require_pin: bool,
    /// Refuse to finalize association until a PairKey has been stored.
    pub require_pair_key: bool,
}

impl Default for TokenPolicy {
    fn default() -> Self {
        Self {
            pin_try_limit: DEFAULT_PIN_TRY_LIMIT,
            require_pin: false,
            require_pair_key: false,
        }
    }
}

impl TokenPolicy {
    /// Strict variant used by provisioned devices.
    pub fn strict() -> Self {
        Self {
            require_pin: true,
            require_pair_key: true,
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<(), PolicyError> {
        if self.pin_try_limit == 0 || self.pin_try_limit > MAX_PIN_TRY_LIMIT {
            return Err(PolicyError::InvalidTryLimit(self.pin_try_limit));
        }
        info!(
            pin_try_limit = self.pin_try_limit,
            require_pin = self.require_pin,
            require_pair_key = self.require_pair_key,
            "token policy accepted"
        );
        Ok(())
    }
}
