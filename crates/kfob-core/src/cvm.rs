//! CVM authorization gate.
//!
//! A PIN credential with a bounded try budget. Two independent predicates
//! gate sensitive operations:
//! - `blocked`: set when the budget runs out, cleared only by [`CvmGate::unblock`]
//! - `verified`: set by a matching [`CvmGate::verify`], cleared at every new
//!   session and whenever the PIN is reconfigured

use std::fmt;

use tracing::{info, warn};
use zeroize::{Zeroize, ZeroizeOnDrop};

use kfob_crypto::utils::constant_time_compare;

use crate::errors::{FobError, FobResult};
use crate::policy::DEFAULT_PIN_TRY_LIMIT;

/// PIN length in BCD digits (one digit per byte).
pub const PIN_LEN: usize = 6;

/// A six-digit BCD PIN. Zeroized on drop, redacted in `Debug`.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct Pin([u8; PIN_LEN]);

impl Pin {
    pub fn from_bytes(bytes: &[u8]) -> FobResult<Self> {
        FobError::check_len(PIN_LEN, bytes.len())?;
        if bytes.iter().any(|d| *d > 9) {
            return Err(FobError::MalformedRequest(
                "PIN digits must be BCD values 0..=9".into(),
            ));
        }
        let mut digits = [0u8; PIN_LEN];
        digits.copy_from_slice(bytes);
        Ok(Self(digits))
    }

    /// Parse an ASCII string such as `"123456"`.
    pub fn from_ascii(s: &str) -> FobResult<Self> {
        let digits: Vec<u8> = s
            .bytes()
            .map(|c| c.wrapping_sub(b'0'))
            .collect();
        Self::from_bytes(&digits)
    }

    pub fn as_bytes(&self) -> &[u8; PIN_LEN] {
        &self.0
    }
}

impl PartialEq for Pin {
    fn eq(&self, other: &Self) -> bool {
        constant_time_compare(&self.0, &other.0)
    }
}

impl Eq for Pin {}

impl fmt::Debug for Pin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Pin([REDACTED])")
    }
}

/// Outcome of a PIN verification that did not hit a hard refusal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PinCheck {
    Accepted,
    Rejected { tries_remaining: u8 },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CvmGate {
    pin: Option<Pin>,
    try_limit: u8,
    tries_remaining: u8,
    blocked: bool,
    verified: bool,
}

impl Default for CvmGate {
    fn default() -> Self {
        Self::new(DEFAULT_PIN_TRY_LIMIT)
    }
}

impl CvmGate {
    pub fn new(try_limit: u8) -> Self {
        Self {
            pin: None,
            try_limit,
            tries_remaining: try_limit,
            blocked: false,
            verified: false,
        }
    }

    /// Rebuild a gate from persisted values. The session flag always starts
    /// cleared.
    pub fn restore(pin: Option<Pin>, try_limit: u8, tries_remaining: u8, blocked: bool) -> Self {
        Self {
            pin,
            try_limit,
            tries_remaining: tries_remaining.min(try_limit),
            blocked,
            verified: false,
        }
    }

    pub fn is_configured(&self) -> bool {
        self.pin.is_some()
    }

    pub fn is_verified(&self) -> bool {
        self.verified
    }

    pub fn is_blocked(&self) -> bool {
        self.blocked
    }

    pub fn tries_remaining(&self) -> u8 {
        self.tries_remaining
    }

    pub fn try_limit(&self) -> u8 {
        self.try_limit
    }

    pub fn pin(&self) -> Option<&Pin> {
        self.pin.as_ref()
    }

    /// Set or re-key the PIN.
    ///
    /// A first configuration is always allowed. Re-keying requires a
    /// verification earlier in the same session.
    pub fn configure(&mut self, pin: Pin) -> FobResult<()> {
        if self.blocked {
            return Err(FobError::CredentialBlocked);
        }
        if self.is_configured() && !self.verified {
            return Err(FobError::AuthorizationRequired);
        }
        let rekey = self.is_configured();
        self.pin = Some(pin);
        self.tries_remaining = self.try_limit;
        self.blocked = false;
        self.verified = false;
        info!(rekey, "PIN configured");
        Ok(())
    }

    /// Compare `candidate` against the stored PIN in constant time.
    pub fn verify(&mut self, candidate: &[u8]) -> FobResult<PinCheck> {
        let pin = self.pin.as_ref().ok_or(FobError::PinNotConfigured)?;
        if self.blocked {
            return Err(FobError::CredentialBlocked);
        }

        if constant_time_compare(pin.as_bytes(), candidate) {
            self.verified = true;
            self.tries_remaining = self.try_limit;
            info!("PIN verified");
            return Ok(PinCheck::Accepted);
        }

        self.verified = false;
        self.tries_remaining = self.tries_remaining.saturating_sub(1);
        if self.tries_remaining == 0 {
            self.blocked = true;
            warn!("PIN blocked after exhausting tries");
        } else {
            warn!(tries_remaining = self.tries_remaining, "PIN rejected");
        }
        Ok(PinCheck::Rejected {
            tries_remaining: self.tries_remaining,
        })
    }

    /// Administrative unblock: installs `pin`, restores the budget.
    pub fn unblock(&mut self, pin: Pin) {
        self.pin = Some(pin);
        self.tries_remaining = self.try_limit;
        self.blocked = false;
        self.verified = false;
        info!("PIN unblocked");
    }

    /// Succeeds only for a configured, unblocked, verified credential.
    pub fn require_verified(&self) -> FobResult<()> {
        if self.blocked {
            return Err(FobError::CredentialBlocked);
        }
        if !self.is_configured() {
            return Err(FobError::PinNotConfigured);
        }
        if !self.verified {
            return Err(FobError::AuthorizationRequired);
        }
        Ok(())
    }

    pub fn begin_session(&mut self) {
        self.verified = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pin(s: &str) -> Pin {
        Pin::from_ascii(s).unwrap()
    }

    #[test]
    fn test_pin_parsing() {
        assert_eq!(pin("123456").as_bytes(), &[1, 2, 3, 4, 5, 6]);
        assert!(matches!(
            Pin::from_bytes(&[1, 2, 3, 4, 5, 10]),
            Err(FobError::MalformedRequest(_))
        ));
        assert!(matches!(
            Pin::from_ascii("12345"),
            Err(FobError::LengthMismatch { expected: 6, got: 5 })
        ));
        assert!(Pin::from_ascii("12a456").is_err());
    }

    #[test]
    fn test_pin_equality() {
        assert_eq!(pin("123456"), pin("123456"));
        assert_ne!(pin("123456"), pin("123457"));
    }

    #[test]
    fn test_pin_debug_redacted() {
        assert_eq!(format!("{:?}", pin("123456")), "Pin([REDACTED])");
    }

    #[test]
    fn test_first_configure_allowed() {
        let mut gate = CvmGate::new(5);
        gate.configure(pin("111111")).unwrap();
        assert!(gate.is_configured());
        assert!(!gate.is_verified());
        assert_eq!(gate.tries_remaining(), 5);
    }

    #[test]
    fn test_rekey_requires_verification() {
        let mut gate = CvmGate::new(5);
        gate.configure(pin("111111")).unwrap();
        assert_eq!(
            gate.configure(pin("222222")),
            Err(FobError::AuthorizationRequired)
        );

        assert_eq!(gate.verify(&[1; 6]).unwrap(), PinCheck::Accepted);
        gate.configure(pin("222222")).unwrap();
        assert!(!gate.is_verified());
        assert_eq!(
            gate.verify(&[1; 6]).unwrap(),
            PinCheck::Rejected { tries_remaining: 4 }
        );
        assert_eq!(gate.verify(&[2; 6]).unwrap(), PinCheck::Accepted);
    }

    #[test]
    fn test_verify_unconfigured() {
        let mut gate = CvmGate::new(5);
        assert_eq!(gate.verify(&[0; 6]), Err(FobError::PinNotConfigured));
    }

    #[test]
    fn test_match_restores_budget() {
        let mut gate = CvmGate::new(3);
        gate.configure(pin("000000")).unwrap();
        gate.verify(&[9; 6]).unwrap();
        gate.verify(&[9; 6]).unwrap();
        assert_eq!(gate.tries_remaining(), 1);
        assert_eq!(gate.verify(&[0; 6]).unwrap(), PinCheck::Accepted);
        assert_eq!(gate.tries_remaining(), 3);
    }

    #[test]
    fn test_exhaustion_blocks_without_further_decrement() {
        let mut gate = CvmGate::new(5);
        gate.configure(pin("123456")).unwrap();
        for expected in (0..5).rev() {
            assert_eq!(
                gate.verify(&[0; 6]).unwrap(),
                PinCheck::Rejected { tries_remaining: expected }
            );
        }
        assert!(gate.is_blocked());
        assert_eq!(gate.verify(&[1, 2, 3, 4, 5, 6]), Err(FobError::CredentialBlocked));
        assert_eq!(gate.tries_remaining(), 0);
        assert_eq!(gate.configure(pin("654321")), Err(FobError::CredentialBlocked));
        assert_eq!(gate.require_verified(), Err(FobError::CredentialBlocked));
    }

    #[test]
    fn test_unblock() {
        let mut gate = CvmGate::new(1);
        gate.configure(pin("123456")).unwrap();
        gate.verify(&[0; 6]).unwrap();
        assert!(gate.is_blocked());

        gate.unblock(pin("999999"));
        assert!(!gate.is_blocked());
        assert_eq!(gate.tries_remaining(), 1);
        assert_eq!(gate.verify(&[9; 6]).unwrap(), PinCheck::Accepted);
    }

    #[test]
    fn test_session_reset_clears_verification() {
        let mut gate = CvmGate::new(5);
        gate.configure(pin("123456")).unwrap();
        gate.verify(&[1, 2, 3, 4, 5, 6]).unwrap();
        assert!(gate.require_verified().is_ok());
        gate.begin_session();
        assert_eq!(gate.require_verified(), Err(FobError::AuthorizationRequired));
    }

    #[test]
    fn test_require_verified_precedence() {
        let gate = CvmGate::new(5);
        assert_eq!(gate.require_verified(), Err(FobError::PinNotConfigured));
    }

    #[test]
    fn test_restore_starts_unverified() {
        let gate = CvmGate::restore(Some(pin("123456")), 5, 9, false);
        assert_eq!(gate.tries_remaining(), 5);
        assert!(!gate.is_verified());
    }
}
