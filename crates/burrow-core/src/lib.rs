//! burrow-core: Core types, configuration, and policies for burrow
//!
//! This crate provides the domain types, configuration structures, error
//! taxonomy, backoff policy, and port filter shared by the tunnel
//! orchestrator and the CLI. It contains no networking.

pub mod backoff;
pub mod config;
pub mod error;
pub mod filter;
pub mod types;

pub use error::{BurrowError, ConfigError, ErrorCode, TunnelError};
pub use types::{TunnelId, TunnelState};
