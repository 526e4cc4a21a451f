//! Command dispatch.
//!
//! Decodes `code ‖ param ‖ len ‖ payload` request frames, routes them to the
//! matching [`KeyFob`] operation and encodes `data ‖ status word` responses.
//! Every failure becomes a status word; nothing is swallowed.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use tracing::{debug, warn};

use crate::cvm::{PinCheck, PIN_LEN};
use crate::errors::{FobError, FobResult, StatusWord};
use crate::identity::IdentityField;
use crate::pairing::{PAIR_KEY_LEN, SEED_LEN};
use crate::store::Store;
use crate::token::KeyFob;

/// Request header: code, parameter, declared payload length.
pub const HEADER_LEN: usize = 3;

// ============================================================================
// Commands
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Command {
    ConfirmSecretKey = 0x10,
    GetPublicKey = 0x11,
    GenerateSecretKey = 0x12,
    VerifyPin = 0x13,
    AssociationStatus = 0x14,
    SaveSeed = 0x15,
    AuthenticateSeed = 0x16,
    SaveSecretKeys = 0x17,
    SaveSeedX = 0x18,
    GetSeedY = 0x19,
    StorePairKey = 0x1A,
    ReadPairKey = 0x1B,
    GetSerialNumber = 0x20,
    GetUniqueId = 0x21,
    GetDisplayName = 0x22,
    StoreSerialNumber = 0x2A,
    StoreUniqueId = 0x2B,
    StoreDisplayName = 0x2C,
    StorePin = 0x2D,
}

impl Command {
    pub const ALL: [Command; 19] = [
        Command::ConfirmSecretKey,
        Command::GetPublicKey,
        Command::GenerateSecretKey,
        Command::VerifyPin,
        Command::AssociationStatus,
        Command::SaveSeed,
        Command::AuthenticateSeed,
        Command::SaveSecretKeys,
        Command::SaveSeedX,
        Command::GetSeedY,
        Command::StorePairKey,
        Command::ReadPairKey,
        Command::GetSerialNumber,
        Command::GetUniqueId,
        Command::GetDisplayName,
        Command::StoreSerialNumber,
        Command::StoreUniqueId,
        Command::StoreDisplayName,
        Command::StorePin,
    ];

    pub fn code(self) -> u8 {
        self as u8
    }

    pub fn from_code(code: u8) -> Option<Self> {
        Self::ALL.iter().copied().find(|c| c.code() == code)
    }

    /// Parameter byte the command requires, if fixed.
    fn expected_param(self) -> Option<u8> {
        match self {
            Command::StorePin | Command::VerifyPin => Some(PIN_LEN as u8),
            Command::SaveSeedX => Some(SEED_LEN as u8),
            Command::StorePairKey => Some(PAIR_KEY_LEN as u8),
            // carries the name length, checked against the payload
            Command::StoreDisplayName => None,
            _ => Some(0),
        }
    }

    /// Commands that take no payload.
    fn is_query(self) -> bool {
        matches!(
            self,
            Command::GetPublicKey
                | Command::AssociationStatus
                | Command::AuthenticateSeed
                | Command::SaveSecretKeys
                | Command::GetSeedY
                | Command::ReadPairKey
                | Command::GetSerialNumber
                | Command::GetUniqueId
                | Command::GetDisplayName
        )
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}({:#04x})", self, self.code())
    }
}

// ============================================================================
// Frames
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub code: u8,
    pub param: u8,
    pub payload: Vec<u8>,
}

impl Request {
    pub fn new(command: Command, param: u8, payload: Vec<u8>) -> Self {
        Self {
            code: command.code(),
            param,
            payload,
        }
    }

    /// A request with no parameter and no payload.
    pub fn bare(command: Command) -> Self {
        Self::new(command, 0, Vec::new())
    }

    pub fn decode(frame: &[u8]) -> FobResult<Self> {
        if frame.len() < HEADER_LEN {
            return Err(FobError::MalformedRequest(format!(
                "frame of {} bytes is shorter than the header",
                frame.len()
            )));
        }
        let declared = usize::from(frame[2]);
        let payload = &frame[HEADER_LEN..];
        if payload.len() != declared {
            return Err(FobError::MalformedRequest(format!(
                "declared payload length {} but {} bytes follow",
                declared,
                payload.len()
            )));
        }
        Ok(Self {
            code: frame[0],
            param: frame[1],
            payload: payload.to_vec(),
        })
    }

    pub fn encode(&self) -> FobResult<Vec<u8>> {
        let len = u8::try_from(self.payload.len()).map_err(|_| {
            FobError::MalformedRequest(format!("payload of {} bytes", self.payload.len()))
        })?;
        let mut out = Vec::with_capacity(HEADER_LEN + self.payload.len());
        out.extend_from_slice(&[self.code, self.param, len]);
        out.extend_from_slice(&self.payload);
        Ok(out)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub status: StatusWord,
    pub data: Vec<u8>,
}

impl Response {
    pub fn ok(data: Vec<u8>) -> Self {
        Self {
            status: StatusWord::OK,
            data,
        }
    }

    pub fn status(status: StatusWord) -> Self {
        Self {
            status,
            data: Vec::new(),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.status.is_ok()
    }

    /// `data ‖ SW1 SW2`.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = self.data.clone();
        out.extend_from_slice(&self.status.to_bytes());
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> FobResult<Self> {
        if bytes.len() < 2 {
            return Err(FobError::MalformedRequest("response shorter than a status word".into()));
        }
        let split = bytes.len() - 2;
        let status = StatusWord(u16::from_be_bytes([bytes[split], bytes[split + 1]]));
        Ok(Self {
            status,
            data: bytes[..split].to_vec(),
        })
    }
}

impl From<FobError> for Response {
    fn from(e: FobError) -> Self {
        Response::status(e.status_word())
    }
}

// ============================================================================
// Statistics
// ============================================================================

#[derive(Debug, Default)]
pub struct DispatchStats {
    /// Requests received, including undecodable frames
    pub received: AtomicU64,
    /// Requests answered with 9000
    pub completed: AtomicU64,
    /// Requests answered with any other status word
    pub rejected: AtomicU64,
    /// Requests naming no known command
    pub unknown_command: AtomicU64,
}

impl DispatchStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> DispatchStatsSnapshot {
        DispatchStatsSnapshot {
            received: self.received.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            unknown_command: self.unknown_command.load(Ordering::Relaxed),
        }
    }

    pub fn reset(&self) {
        self.received.store(0, Ordering::Relaxed);
        self.completed.store(0, Ordering::Relaxed);
        self.rejected.store(0, Ordering::Relaxed);
        self.unknown_command.store(0, Ordering::Relaxed);
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchStatsSnapshot {
    pub received: u64,
    pub completed: u64,
    pub rejected: u64,
    pub unknown_command: u64,
}

// ============================================================================
// Dispatcher
// ============================================================================

/// Routes requests to a [`KeyFob`]. One request runs to completion before
/// the next is accepted.
pub struct Dispatcher<S: Store> {
    fob: KeyFob<S>,
    stats: DispatchStats,
}

impl<S: Store> Dispatcher<S> {
    pub fn new(fob: KeyFob<S>) -> Self {
        Self {
            fob,
            stats: DispatchStats::new(),
        }
    }

    pub fn fob(&self) -> &KeyFob<S> {
        &self.fob
    }

    /// On-token access, e.g. for the BLE component.
    pub fn fob_mut(&mut self) -> &mut KeyFob<S> {
        &mut self.fob
    }

    pub fn into_inner(self) -> KeyFob<S> {
        self.fob
    }

    pub fn stats(&self) -> DispatchStatsSnapshot {
        self.stats.snapshot()
    }

    /// Decode a raw frame, dispatch it and encode the response.
    pub fn handle_frame(&mut self, frame: &[u8]) -> Vec<u8> {
        match Request::decode(frame) {
            Ok(request) => self.handle(&request).to_bytes(),
            Err(e) => {
                self.stats.received.fetch_add(1, Ordering::Relaxed);
                self.stats.rejected.fetch_add(1, Ordering::Relaxed);
                warn!(error = %e, "undecodable request frame");
                Response::from(e).to_bytes()
            }
        }
    }

    pub fn handle(&mut self, request: &Request) -> Response {
        self.stats.received.fetch_add(1, Ordering::Relaxed);
        let response = match self.execute(request) {
            Ok(response) => response,
            Err(e) => {
                if matches!(e, FobError::UnknownCommand(_)) {
                    self.stats.unknown_command.fetch_add(1, Ordering::Relaxed);
                }
                warn!(code = request.code, error = %e, sw = %e.status_word(), "request refused");
                Response::from(e)
            }
        };

        if response.is_ok() {
            self.stats.completed.fetch_add(1, Ordering::Relaxed);
            debug!(code = request.code, len = response.data.len(), "request completed");
        } else {
            self.stats.rejected.fetch_add(1, Ordering::Relaxed);
        }
        response
    }

    fn execute(&mut self, request: &Request) -> FobResult<Response> {
        let command =
            Command::from_code(request.code).ok_or(FobError::UnknownCommand(request.code))?;
        check_param(command, request)?;
        if command.is_query() && !request.payload.is_empty() {
            return Err(FobError::LengthMismatch {
                expected: 0,
                got: request.payload.len(),
            });
        }

        let payload = request.payload.as_slice();
        let fob = &mut self.fob;
        let data = match command {
            Command::GetSerialNumber => fob.read_identity(IdentityField::SerialNumber)?,
            Command::GetUniqueId => fob.read_identity(IdentityField::UniqueId)?,
            Command::GetDisplayName => fob.read_identity(IdentityField::DisplayName)?,
            Command::StoreSerialNumber => {
                fob.store_identity(IdentityField::SerialNumber, payload)?;
                Vec::new()
            }
            Command::StoreUniqueId => {
                fob.store_identity(IdentityField::UniqueId, payload)?;
                Vec::new()
            }
            Command::StoreDisplayName => {
                fob.store_identity(IdentityField::DisplayName, payload)?;
                Vec::new()
            }
            Command::StorePin => {
                fob.store_pin(payload)?;
                Vec::new()
            }
            Command::VerifyPin => {
                return Ok(match fob.verify_pin(payload)? {
                    PinCheck::Accepted => Response::ok(Vec::new()),
                    PinCheck::Rejected { tries_remaining } => {
                        Response::status(StatusWord::pin_rejected(tries_remaining))
                    }
                });
            }
            Command::AssociationStatus => vec![fob.association_status().code()],
            Command::GetPublicKey => fob.get_public_key()?.to_vec(),
            Command::GenerateSecretKey => {
                fob.generate_secret_key(payload)?;
                Vec::new()
            }
            Command::ConfirmSecretKey => {
                fob.confirm_secret_key(payload)?;
                Vec::new()
            }
            Command::SaveSeedX => {
                fob.save_seed_x(payload)?;
                Vec::new()
            }
            Command::GetSeedY => fob.get_seed_y()?.to_vec(),
            Command::StorePairKey => {
                fob.store_pair_key(payload)?;
                Vec::new()
            }
            Command::ReadPairKey => fob.read_pair_key()?.to_vec(),
            Command::SaveSecretKeys => {
                fob.finalize_association()?;
                Vec::new()
            }
            Command::SaveSeed => {
                fob.save_ble_seed(payload)?;
                Vec::new()
            }
            Command::AuthenticateSeed => fob.authenticate_seed()?.to_vec(),
        };
        Ok(Response::ok(data))
    }
}

fn check_param(command: Command, request: &Request) -> FobResult<()> {
    match command.expected_param() {
        Some(expected) if request.param != expected => {
            Err(FobError::InvalidParameter(request.param))
        }
        None if usize::from(request.param) != request.payload.len() => {
            Err(FobError::InvalidParameter(request.param))
        }
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::TokenPolicy;
    use crate::store::MemoryStore;

    fn dispatcher() -> Dispatcher<MemoryStore> {
        Dispatcher::new(KeyFob::open(MemoryStore::new(), TokenPolicy::default()).unwrap())
    }

    #[test]
    fn test_command_codes_unique() {
        for c in Command::ALL {
            assert_eq!(Command::from_code(c.code()), Some(c));
        }
        assert_eq!(Command::from_code(0x99), None);
    }

    #[test]
    fn test_request_frame() {
        let req = Request::new(Command::SaveSeedX, 24, vec![0xAA; 24]);
        let frame = req.encode().unwrap();
        assert_eq!(&frame[..3], &[0x18, 24, 24]);
        assert_eq!(Request::decode(&frame).unwrap(), req);
    }

    #[test]
    fn test_request_declared_length_mismatch() {
        assert!(matches!(
            Request::decode(&[0x18, 24, 24, 1, 2, 3]),
            Err(FobError::MalformedRequest(_))
        ));
        assert!(matches!(Request::decode(&[0x18]), Err(FobError::MalformedRequest(_))));
    }

    #[test]
    fn test_response_bytes() {
        let resp = Response::ok(vec![1, 2]);
        assert_eq!(resp.to_bytes(), vec![1, 2, 0x90, 0x00]);
        assert_eq!(Response::from_bytes(&[1, 2, 0x90, 0x00]).unwrap(), resp);
    }

    #[test]
    fn test_unknown_command() {
        let mut d = dispatcher();
        let resp = d.handle(&Request { code: 0x77, param: 0, payload: vec![] });
        assert_eq!(resp.status, StatusWord::INS_NOT_SUPPORTED);
        assert_eq!(d.stats().unknown_command, 1);
        assert_eq!(d.stats().rejected, 1);
    }

    #[test]
    fn test_wrong_param() {
        let mut d = dispatcher();
        let resp = d.handle(&Request::new(Command::GetPublicKey, 1, vec![]));
        assert_eq!(resp.status, StatusWord::INCORRECT_P1P2);
        let resp = d.handle(&Request::new(Command::StoreDisplayName, 4, b"abc".to_vec()));
        assert_eq!(resp.status, StatusWord::INCORRECT_P1P2);
    }

    #[test]
    fn test_query_with_payload_rejected() {
        let mut d = dispatcher();
        let resp = d.handle(&Request::new(Command::AssociationStatus, 0, vec![1]));
        assert_eq!(resp.status, StatusWord::WRONG_LENGTH);
    }

    #[test]
    fn test_identity_commands() {
        let mut d = dispatcher();
        let resp = d.handle(&Request::bare(Command::GetSerialNumber));
        assert_eq!(resp.status, StatusWord::NOT_SET);

        let resp = d.handle(&Request::new(Command::StoreSerialNumber, 0, vec![5u8; 16]));
        assert!(resp.is_ok());
        let resp = d.handle(&Request::new(Command::StoreSerialNumber, 0, vec![6u8; 16]));
        assert_eq!(resp.status, StatusWord::ALREADY_SET);

        let resp = d.handle(&Request::bare(Command::GetSerialNumber));
        assert_eq!(resp, Response::ok(vec![5u8; 16]));

        let resp = d.handle(&Request::new(Command::StoreDisplayName, 3, b"fob".to_vec()));
        assert!(resp.is_ok());
        let resp = d.handle(&Request::bare(Command::GetDisplayName));
        assert_eq!(resp.data, b"fob");
    }

    #[test]
    fn test_association_status_command() {
        let mut d = dispatcher();
        let resp = d.handle(&Request::bare(Command::AssociationStatus));
        assert_eq!(resp, Response::ok(vec![0x01]));
    }

    #[test]
    fn test_out_of_order_command_status() {
        let mut d = dispatcher();
        let resp = d.handle(&Request::bare(Command::SaveSecretKeys));
        assert_eq!(resp.status, StatusWord::CONDITIONS_NOT_SATISFIED);
        let resp = d.handle(&Request::bare(Command::AuthenticateSeed));
        assert_eq!(resp.status, StatusWord::CONDITIONS_NOT_SATISFIED);
    }

    #[test]
    fn test_handle_frame_garbage() {
        let mut d = dispatcher();
        let out = d.handle_frame(&[0x11, 0x00]);
        assert_eq!(out, StatusWord::WRONG_DATA.to_bytes().to_vec());
        assert_eq!(d.stats().received, 1);
    }

    #[test]
    fn test_public_key_frame() {
        let mut d = dispatcher();
        let out = d.handle_frame(&[0x11, 0x00, 0x00]);
        assert_eq!(out.len(), 49 + 2);
        assert_eq!(out[0], 0x04);
        assert_eq!(&out[49..], &[0x90, 0x00]);
        assert_eq!(d.stats().completed, 1);
    }
}
