//! Triple-DES channel codec.
//!
//! Every protected payload on the token travels as 3-key triple-DES (EDE3) in
//! CBC mode with no padding, always chained from the same fixed IV. Callers
//! hand in buffers whose length is a whole number of 8-byte blocks; the
//! codec never pads or strips.
//!
//! Two layers are provided:
//! - free functions ([`encrypt_in_place`], [`decrypt_in_place`]) that take an
//!   explicit [`TdesKey`], used wherever a named key (seedX, seedY) applies
//! - [`ChannelCodec`], a single key slot holding the session key installed by
//!   key agreement

use std::fmt;

use cbc::cipher::{block_padding::NoPadding, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use constant_time_eq::constant_time_eq;
use des::TdesEde3;
use zeroize::{Zeroize, ZeroizeOnDrop};

type TdesCbcEnc = cbc::Encryptor<TdesEde3>;
type TdesCbcDec = cbc::Decryptor<TdesEde3>;

/// Cipher block size in bytes.
pub const BLOCK_LEN: usize = 8;

/// 3-key triple-DES key length in bytes.
pub const KEY_LEN: usize = 24;

/// Fixed CBC initialization vector shared by both ends of the channel.
pub const CHAIN_IV: [u8; BLOCK_LEN] = [0x0f, 0x1e, 0x2d, 0x3c, 0x4b, 0x5a, 0x69, 0x78];

/// Error type for codec operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum CodecError {
    #[error("buffer length {len} is not a multiple of the 8-byte cipher block")]
    UnalignedLength { len: usize },
    #[error("key must be {expected} bytes, got {got}")]
    InvalidKeyLength { expected: usize, got: usize },
    #[error("no key configured")]
    KeyNotConfigured,
    #[error("cipher initialisation failed")]
    CipherInit,
}

/// A 24-byte triple-DES key. Zeroized on drop, redacted in `Debug`.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct TdesKey([u8; KEY_LEN]);

impl TdesKey {
    pub fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
        Self(bytes)
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self, CodecError> {
        let arr: [u8; KEY_LEN] = bytes.try_into().map_err(|_| CodecError::InvalidKeyLength {
            expected: KEY_LEN,
            got: bytes.len(),
        })?;
        Ok(Self(arr))
    }

    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }
}

impl PartialEq for TdesKey {
    fn eq(&self, other: &Self) -> bool {
        constant_time_eq(&self.0, &other.0)
    }
}

impl Eq for TdesKey {}

impl fmt::Debug for TdesKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TdesKey([REDACTED])")
    }
}

fn check_alignment(buf: &[u8]) -> Result<(), CodecError> {
    if buf.len() % BLOCK_LEN != 0 {
        return Err(CodecError::UnalignedLength { len: buf.len() });
    }
    Ok(())
}

/// Encrypt `buf` in place under `key`.
pub fn encrypt_in_place(key: &TdesKey, buf: &mut [u8]) -> Result<(), CodecError> {
    check_alignment(buf)?;
    if buf.is_empty() {
        return Ok(());
    }
    let len = buf.len();
    TdesCbcEnc::new_from_slices(key.as_bytes(), &CHAIN_IV)
        .map_err(|_| CodecError::CipherInit)?
        .encrypt_padded_mut::<NoPadding>(buf, len)
        .map_err(|_| CodecError::UnalignedLength { len })?;
    Ok(())
}

/// Decrypt `buf` in place under `key`.
pub fn decrypt_in_place(key: &TdesKey, buf: &mut [u8]) -> Result<(), CodecError> {
    check_alignment(buf)?;
    if buf.is_empty() {
        return Ok(());
    }
    let len = buf.len();
    TdesCbcDec::new_from_slices(key.as_bytes(), &CHAIN_IV)
        .map_err(|_| CodecError::CipherInit)?
        .decrypt_padded_mut::<NoPadding>(buf)
        .map_err(|_| CodecError::UnalignedLength { len })?;
    Ok(())
}

/// Single-slot codec holding the session key.
///
/// The slot only ever changes through [`ChannelCodec::set_key`] and
/// [`ChannelCodec::clear_key`].
#[derive(Clone, Default)]
pub struct ChannelCodec {
    key: Option<TdesKey>,
}

impl ChannelCodec {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_key(key: TdesKey) -> Self {
        Self { key: Some(key) }
    }

    /// Replace the active key. The previous key is zeroized.
    pub fn set_key(&mut self, key: TdesKey) {
        self.key = Some(key);
    }

    pub fn clear_key(&mut self) {
        self.key = None;
    }

    pub fn is_key_configured(&self) -> bool {
        self.key.is_some()
    }

    pub fn key(&self) -> Option<&TdesKey> {
        self.key.as_ref()
    }

    pub fn encrypt(&self, buf: &mut [u8]) -> Result<(), CodecError> {
        let key = self.key.as_ref().ok_or(CodecError::KeyNotConfigured)?;
        encrypt_in_place(key, buf)
    }

    pub fn decrypt(&self, buf: &mut [u8]) -> Result<(), CodecError> {
        let key = self.key.as_ref().ok_or(CodecError::KeyNotConfigured)?;
        decrypt_in_place(key, buf)
    }
}

impl fmt::Debug for ChannelCodec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelCodec")
            .field("key_configured", &self.is_key_configured())
            .finish()
    }
}
