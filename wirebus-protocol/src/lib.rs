//! # wirebus-protocol
//!
//! Wire protocol implementation for wirebus.
//!
//! This crate provides:
//! - Byte-stream framing with a start byte, length prefix and a 2-byte
//!   positional checksum
//! - The packet codec (header/body assembly, optional compression, raw
//!   binary payload mode)
//! - Pluggable `Serializer` and `Compressor` traits with JSON and zlib
//!   default implementations
//! - Protocol error types and constants

pub mod checksum;
pub mod codec;
pub mod compress;
pub mod error;
pub mod framer;
pub mod packet;
pub mod segments;
pub mod serialize;

pub use checksum::sign;
pub use codec::{CodecConfig, PacketCodec};
pub use compress::{Compressor, ZlibCompressor};
pub use error::ProtocolError;
pub use framer::{encode_frame, ByteFramer};
pub use packet::{
    Packet, Payload, AUTH_IDENTIFIER, KEY_AUTH_IDENTIFIER, KEY_RESULT, KEY_TOKEN,
};
pub use segments::SegmentedBuffer;
pub use serialize::{JsonSerializer, Serializer};

/// Start byte marking the beginning of a frame.
pub const START_BYTE: u8 = 0x01;

/// Size of the little-endian length field.
pub const LENGTH_FIELD_SIZE: usize = 4;

/// Size of the checksum trailer.
pub const CHECKSUM_SIZE: usize = 2;

/// Keepalive probe: a single unframed zero byte.
pub const KEEPALIVE_BYTE: u8 = 0x00;

/// Maximum bytes a framer will accumulate for one frame (100 MiB).
pub const MAX_FRAME_PAYLOAD: usize = 100 * 1024 * 1024;

/// Default port for a wirebus server.
pub const DEFAULT_PORT: u16 = 7923;
