//! KFOB Simulator - drives a file-backed KeyFOB token
//!
//! This crate wires configuration, logging and a simulated ORWL host around
//! the token's command surface.

pub mod cli;
pub mod config;
pub mod runner;
