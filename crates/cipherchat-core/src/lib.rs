//! Cipherchat Core Library
//!
//! Shared functionality for the Cipherchat encryption engine:
//! - Configuration resolution and hierarchy
//! - `SQLite` pool helpers and timestamps
//! - Tracing initialisation
//! - Common error types

pub mod config;
pub mod db;
pub mod error;
pub mod tracing_init;

pub use config::{CryptoConfig, IdentityPolicy};
pub use error::{Error, Result};
