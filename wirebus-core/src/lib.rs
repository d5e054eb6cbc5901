//! # wirebus-core
//!
//! Session machinery shared by the wirebus server and client.
//!
//! This crate provides:
//! - The `Transport` abstraction over a duplex byte stream
//! - `Connection` with backup queueing for in-flight-during-close packets
//! - The server-side `ConnectionRegistry`
//! - The `Processor` trait and explicit registration
//! - Sharded dispatch pools (`ProcessorPool`, `AssuredProcessorPool`)

pub mod assured;
pub mod connection;
pub mod error;
pub mod pool;
pub mod processor;
pub mod registry;
pub mod transport;

pub use assured::AssuredProcessorPool;
pub use connection::Connection;
pub use error::CoreError;
pub use pool::{PoolConfig, ProcessorPool};
pub use processor::{DispatchContext, Processor, ProcessorRegistry};
pub use registry::ConnectionRegistry;
pub use transport::{ChannelTransport, Transport, TransportError};
