//! Trusted cryptographic primitives for the KeyFOB pairing protocol.
//!
//! Everything here is a thin, typed wrapper over RustCrypto implementations:
//! - [`tdes`]: 3-key triple-DES in CBC mode with the fixed chaining IV
//! - [`ecdh`]: ephemeral P-192 key pairs and the agreed 3DES key
//! - [`hash`]: SHA-1 digests
//! - [`utils`]: constant-time comparison and random material

#![forbid(unsafe_code)]

pub mod ecdh;
pub mod hash;
pub mod tdes;
pub mod utils;

#[cfg(test)]
mod proptests;

pub use ecdh::{AgreementError, EphemeralKeyPair, PUBLIC_POINT_LEN};
pub use tdes::{ChannelCodec, CodecError, TdesKey, BLOCK_LEN, KEY_LEN};
pub use utils::RngError;
