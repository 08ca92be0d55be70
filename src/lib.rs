// src/lib.rs

//! Parcel package management engine
//!
//! Package database and transaction engine for constrained (embedded Linux)
//! targets: maintains a local view of available and installed packages,
//! resolves dependencies, and performs install/remove/upgrade transactions
//! against one or more remote repositories.
//!
//! # Architecture
//!
//! - Explicit engine context: lock acquisition, config and list loading at
//!   construction; nothing persisted implicitly on teardown
//! - In-memory package database with arena storage and name/provides indices
//! - Durable state is the per-destination control-file status file, rewritten
//!   atomically at the end of every successful transaction
//! - Fetch, unpack and configure are trait collaborators; the engine only
//!   sequences them and inspects their result codes

pub mod backend;
pub mod config;
pub mod db;
pub mod engine;
mod error;
pub mod fetch;
pub mod pkg;
pub mod resolver;
pub mod version;

pub use config::Config;
pub use error::{Error, Result};
