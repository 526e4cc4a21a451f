//! KFOB Core - the KeyFOB side of the ORWL pairing protocol.
//!
//! This crate implements:
//! - Identity store for the write-once serial number, unique ID and name
//! - CVM gate holding the PIN and its try budget
//! - Key agreement engine and the pairing state machine
//! - Seed retrieval for the on-token BLE component
//! - Command dispatch over `code ‖ param ‖ len ‖ payload` frames
//! - Persistent storage abstraction

#![forbid(unsafe_code)]

// Token entities
pub mod identity;
pub mod cvm;
pub mod agreement;
pub mod pairing;
pub mod seed;

// Services
pub mod policy;
pub mod token;
pub mod dispatch;

// Infrastructure
pub mod store;

// Supporting modules
pub mod errors;
pub mod harness;

#[cfg(test)]
mod proptests;

pub use dispatch::{Command, Dispatcher, Request, Response};
pub use errors::{FobError, FobResult, StatusWord};
pub use pairing::{Operation, PairingState};
pub use policy::TokenPolicy;
pub use store::{FileStore, MemoryStore, Store};
pub use token::{AssociationStatus, KeyFob};
