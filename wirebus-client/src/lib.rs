//! # wirebus-client
//!
//! Client session for the wirebus packet protocol.
//!
//! This crate provides:
//! - `ClientSession`: connect, authenticate, steady-state keepalive and
//!   reconnect on a background loop
//! - A bounded replay cache for deliveries attempted while disconnected
//! - Client-side dispatch of inbound packets to registered processors

pub mod error;
pub mod replay;
pub mod session;

pub use error::ClientError;
pub use replay::ReplayCache;
pub use session::{ClientConfig, ClientSession, SessionState};
