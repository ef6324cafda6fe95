// src/utils/mod.rs
//! Common utilities shared by the supervisor, its workers and listeners
//!
//! - **config**: Layered configuration (defaults, file, environment)
//! - **errors**: Crate-wide error type and result alias
//! - **fs**: Directory helpers for per-tenant working trees

pub mod config;
pub mod errors;
pub mod fs;

pub use config::FleetConfig;
pub use errors::{FleetError, Result};
