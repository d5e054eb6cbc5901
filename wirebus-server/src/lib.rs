//! # wirebus-server
//!
//! TCP server for the wirebus packet protocol.
//!
//! This crate provides:
//! - The accept loop and per-connection read tasks
//! - The authentication gate applied to every new connection
//! - Wiring from framed packets into the dispatch pools
//! - Configuration loading (YAML file plus environment overrides)

pub mod auth;
pub mod config;
pub mod error;
pub mod server;

pub use auth::{AuthGate, AuthOutcome};
pub use config::{AuthSettings, CodecSettings, Config, ConfigError, NetworkConfig, PoolSettings};
pub use error::ServerError;
pub use server::{Server, ServerConfig};
