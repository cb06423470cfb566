//! Stratum Pool Client
//!
//! An async client for Stratum v1 mining pools:
//! - TCP session with newline-delimited JSON-RPC framing
//! - Subscribe and authorize handshake driven by an explicit state machine
//! - Simulated share submission paced by hash rate and share difficulty
//! - Automatic reconnection with capped exponential backoff
//! - Typed event stream and status snapshots for observers

pub mod client;
pub mod config;
pub mod error;
pub mod session;
pub mod stratum;
pub mod types;
pub mod utils;
pub mod worker;

pub use client::{ClientStatus, PoolEvent, StratumPoolClient};
pub use config::{ClientConfig, Config};
pub use error::{Error, Result};
pub use types::*;

/// Application information
pub const APP_NAME: &str = "stratum-pool-client";
pub const APP_VERSION: &str = env!("CARGO_PKG_VERSION");
pub const APP_DESCRIPTION: &str = env!("CARGO_PKG_DESCRIPTION");
