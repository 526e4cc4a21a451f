//! Error types for the KeyFOB token.
//!
//! Every refusal the token can produce is a distinct [`FobError`] variant, and
//! every variant maps to a distinct ISO 7816 style [`StatusWord`] for the
//! command surface.

use std::fmt;

use thiserror::Error;

use kfob_crypto::{AgreementError, CodecError, RngError};

use crate::pairing::{Operation, PairingState};
use crate::policy::PolicyError;
use crate::store::StoreError;

pub type FobResult<T> = Result<T, FobError>;

// ============================================================================
// Status Words
// ============================================================================

/// Two-byte status word returned with every response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StatusWord(pub u16);

impl StatusWord {
    pub const OK: StatusWord = StatusWord(0x9000);
    pub const WRONG_LENGTH: StatusWord = StatusWord(0x6700);
    pub const WRONG_DATA: StatusWord = StatusWord(0x6A80);
    pub const INCORRECT_P1P2: StatusWord = StatusWord(0x6A86);
    pub const INS_NOT_SUPPORTED: StatusWord = StatusWord(0x6D00);
    pub const CONDITIONS_NOT_SATISFIED: StatusWord = StatusWord(0x6985);
    pub const ALREADY_ASSOCIATED: StatusWord = StatusWord(0x6986);
    pub const ALREADY_SET: StatusWord = StatusWord(0x6A89);
    pub const NOT_SET: StatusWord = StatusWord(0x6A88);
    pub const SEED_NOT_AVAILABLE: StatusWord = StatusWord(0x6A82);
    pub const KEY_NOT_CONFIGURED: StatusWord = StatusWord(0x6669);
    pub const PIN_NOT_VERIFIED: StatusWord = StatusWord(0x9840);
    pub const PIN_NOT_CONFIGURED: StatusWord = StatusWord(0x9802);
    pub const PIN_BLOCKED: StatusWord = StatusWord(0x9D61);
    pub const SECRET_MISMATCH: StatusWord = StatusWord(0x9405);
    pub const MEMORY_FAILURE: StatusWord = StatusWord(0x6581);
    pub const NO_PRECISE_DIAGNOSIS: StatusWord = StatusWord(0x6F00);

    /// `63Cx`: PIN rejected with `x` tries remaining.
    pub fn pin_rejected(tries_remaining: u8) -> StatusWord {
        StatusWord(0x63C0 | u16::from(tries_remaining.min(0x0F)))
    }

    pub fn is_ok(self) -> bool {
        self == Self::OK
    }

    pub fn to_bytes(self) -> [u8; 2] {
        self.0.to_be_bytes()
    }
}

impl fmt::Display for StatusWord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04X}", self.0)
    }
}

// ============================================================================
// Token Error
// ============================================================================

#[derive(Debug, Error, Clone, PartialEq)]
pub enum FobError {
    #[error("malformed request: {0}")]
    MalformedRequest(String),

    #[error("length mismatch: expected {expected} bytes, got {got}")]
    LengthMismatch { expected: usize, got: usize },

    #[error("invalid parameter byte {0:#04x}")]
    InvalidParameter(u8),

    #[error("unsupported command {0:#04x}")]
    UnknownCommand(u8),

    #[error("{operation} not permitted in state {state}")]
    ProtocolOrderViolation {
        operation: Operation,
        state: PairingState,
    },

    #[error("{0} already set")]
    AlreadySet(&'static str),

    #[error("token already associated")]
    AlreadyAssociated,

    #[error("{0} not set")]
    NotSet(&'static str),

    #[error("PIN verification required")]
    AuthorizationRequired,

    #[error("no PIN configured")]
    PinNotConfigured,

    #[error("PIN blocked")]
    CredentialBlocked,

    #[error("shared secret confirmation failed")]
    SecretMismatch,

    #[error("key not configured")]
    KeyNotConfigured,

    #[error("BLE seed not available")]
    SeedNotAvailable,

    #[error("crypto error: {0}")]
    Crypto(String),

    #[error(transparent)]
    Rng(#[from] RngError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Policy(#[from] PolicyError),
}

impl FobError {
    pub(crate) fn order(operation: Operation, state: PairingState) -> Self {
        FobError::ProtocolOrderViolation { operation, state }
    }

    pub(crate) fn check_len(expected: usize, got: usize) -> FobResult<()> {
        if expected != got {
            return Err(FobError::LengthMismatch { expected, got });
        }
        Ok(())
    }

    /// Status word reported on the command surface.
    pub fn status_word(&self) -> StatusWord {
        match self {
            FobError::MalformedRequest(_) => StatusWord::WRONG_DATA,
            FobError::LengthMismatch { .. } => StatusWord::WRONG_LENGTH,
            FobError::InvalidParameter(_) => StatusWord::INCORRECT_P1P2,
            FobError::UnknownCommand(_) => StatusWord::INS_NOT_SUPPORTED,
            FobError::ProtocolOrderViolation { .. } => StatusWord::CONDITIONS_NOT_SATISFIED,
            FobError::AlreadySet(_) => StatusWord::ALREADY_SET,
            FobError::AlreadyAssociated => StatusWord::ALREADY_ASSOCIATED,
            FobError::NotSet(_) => StatusWord::NOT_SET,
            FobError::AuthorizationRequired => StatusWord::PIN_NOT_VERIFIED,
            FobError::PinNotConfigured => StatusWord::PIN_NOT_CONFIGURED,
            FobError::CredentialBlocked => StatusWord::PIN_BLOCKED,
            FobError::SecretMismatch => StatusWord::SECRET_MISMATCH,
            FobError::KeyNotConfigured => StatusWord::KEY_NOT_CONFIGURED,
            FobError::SeedNotAvailable => StatusWord::SEED_NOT_AVAILABLE,
            FobError::Store(_) => StatusWord::MEMORY_FAILURE,
            FobError::Crypto(_) | FobError::Rng(_) | FobError::Policy(_) => {
                StatusWord::NO_PRECISE_DIAGNOSIS
            }
        }
    }
}

impl From<CodecError> for FobError {
    fn from(e: CodecError) -> Self {
        match e {
            CodecError::KeyNotConfigured => FobError::KeyNotConfigured,
            other => FobError::Crypto(other.to_string()),
        }
    }
}

impl From<AgreementError> for FobError {
    fn from(e: AgreementError) -> Self {
        match e {
            AgreementError::UnsupportedEncoding { .. } | AgreementError::InvalidPeerPoint => {
                FobError::MalformedRequest(e.to_string())
            }
            AgreementError::InvalidScalar => FobError::Crypto(e.to_string()),
        }
    }
}
