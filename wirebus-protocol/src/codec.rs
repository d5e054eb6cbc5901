//! Packet codec.
//!
//! Converts a logical [`Packet`] to and from the framed payload bytes.
//! Layout:
//!
//! ```text
//! [1B desc: bit0 = binary payload, bit1 = compressed]
//!   binary mode: [2B headLen LE][headLen bytes header][body bytes]
//!   object mode: [combined header+data bytes]
//! ```
//!
//! In binary mode only the header travels through the serializer and the
//! body stays a raw byte array; in object mode the payload is folded into
//! the header map and the whole blob is serialized (and optionally
//! compressed) as one.

use crate::compress::{Compressor, ZlibCompressor};
use crate::error::ProtocolError;
use crate::packet::{Packet, Payload, KEY_DATA, KEY_IDENTIFIER, KEY_REQUEST_ID};
use crate::segments::SegmentedBuffer;
use crate::serialize::{JsonSerializer, Serializer};
use bytes::{BufMut, Bytes, BytesMut};
use serde_json::{Map, Value};
use std::sync::Arc;

/// Desc bit: payload is a raw byte array.
const DESC_BINARY: u8 = 1 << 0;

/// Desc bit: payload bytes are compressed.
const DESC_COMPRESSED: u8 = 1 << 1;

/// Codec options.
#[derive(Debug, Clone)]
pub struct CodecConfig {
    /// Enable body compression.
    pub compression: bool,
    /// Skip compressing payloads smaller than this.
    pub min_compress_len: usize,
}

impl Default for CodecConfig {
    fn default() -> Self {
        Self {
            compression: false,
            min_compress_len: 512,
        }
    }
}

impl CodecConfig {
    pub fn with_compression(mut self) -> Self {
        self.compression = true;
        self
    }

    pub fn with_min_compress_len(mut self, len: usize) -> Self {
        self.min_compress_len = len;
        self
    }
}

/// Packet encoder/decoder with pluggable serializer and compressor.
pub struct PacketCodec {
    serializer: Arc<dyn Serializer>,
    compressor: Arc<dyn Compressor>,
    config: CodecConfig,
}

impl Default for PacketCodec {
    fn default() -> Self {
        Self::new(CodecConfig::default())
    }
}

impl PacketCodec {
    pub fn new(config: CodecConfig) -> Self {
        Self {
            serializer: Arc::new(JsonSerializer),
            compressor: Arc::new(ZlibCompressor),
            config,
        }
    }

    pub fn with_serializer(mut self, serializer: Arc<dyn Serializer>) -> Self {
        self.serializer = serializer;
        self
    }

    pub fn with_compressor(mut self, compressor: Arc<dyn Compressor>) -> Self {
        self.compressor = compressor;
        self
    }

    fn should_compress(&self, len: usize) -> bool {
        self.config.compression && len > self.config.min_compress_len
    }

    /// Encodes a packet into the payload handed to the outer framer.
    pub fn encode(&self, packet: &Packet) -> Result<Bytes, ProtocolError> {
        let mut head = Map::new();
        head.insert(
            KEY_REQUEST_ID.to_string(),
            Value::String(packet.request_id.clone()),
        );
        head.insert(
            KEY_IDENTIFIER.to_string(),
            Value::String(packet.identifier()),
        );

        match &packet.payload {
            Payload::Binary(body) => {
                let head_bytes = self.serializer.serialize(&Value::Object(head))?;
                if head_bytes.len() > u16::MAX as usize {
                    return Err(ProtocolError::HeaderTooLarge {
                        size: head_bytes.len(),
                        max: u16::MAX as usize,
                    });
                }

                let compress = self.should_compress(body.len());
                let mut desc = DESC_BINARY;
                if compress {
                    desc |= DESC_COMPRESSED;
                }

                let mut prefix = BytesMut::with_capacity(3 + head_bytes.len());
                prefix.put_u8(desc);
                prefix.put_u16_le(head_bytes.len() as u16);
                prefix.put_slice(&head_bytes);

                let mut buf = SegmentedBuffer::new();
                buf.push(prefix.freeze());
                buf.push(body.clone());

                if compress {
                    // Rewrite the body segment in place when the compressor
                    // supports it; otherwise hand it a flattened copy.
                    let packed = if self.compressor.compresses_segments() {
                        self.compressor.compress(buf.segment(1))?
                    } else {
                        self.compressor.compress(&body.to_vec())?
                    };
                    buf.replace(1, Bytes::from(packed));
                }

                Ok(buf.to_bytes())
            }
            Payload::Value(value) => {
                head.insert(KEY_DATA.to_string(), value.clone());
                let mut blob = self.serializer.serialize(&Value::Object(head))?;

                let compress = self.should_compress(blob.len());
                if compress {
                    blob = self.compressor.compress(&blob)?;
                }

                let mut desc = 0u8;
                if compress {
                    desc |= DESC_COMPRESSED;
                }

                let mut out = BytesMut::with_capacity(1 + blob.len());
                out.put_u8(desc);
                out.put_slice(&blob);
                Ok(out.freeze())
            }
        }
    }

    /// Decodes a framed payload back into a packet.
    ///
    /// `connection_id` is left empty; the receive path fills it in.
    pub fn decode(&self, payload: &[u8]) -> Result<Packet, ProtocolError> {
        let desc = *payload
            .first()
            .ok_or(ProtocolError::Truncated { needed: 1 })?;
        let binary = desc & DESC_BINARY != 0;
        let compressed = desc & DESC_COMPRESSED != 0;
        let rest = &payload[1..];

        if binary {
            if rest.len() < 2 {
                return Err(ProtocolError::Truncated {
                    needed: 2 - rest.len(),
                });
            }
            let head_len = u16::from_le_bytes([rest[0], rest[1]]) as usize;
            if rest.len() < 2 + head_len {
                return Err(ProtocolError::Truncated {
                    needed: 2 + head_len - rest.len(),
                });
            }

            let head = self.deserialize_head(&rest[2..2 + head_len])?;
            let (request_id, identifier) = head_fields(&head)?;

            let body = &rest[2 + head_len..];
            let body = if compressed {
                Bytes::from(self.compressor.decompress(body)?)
            } else {
                Bytes::copy_from_slice(body)
            };

            Ok(Packet::new(request_id, identifier, body))
        } else {
            let blob;
            let combined = if compressed {
                blob = self.compressor.decompress(rest)?;
                blob.as_slice()
            } else {
                rest
            };

            let mut head = self.deserialize_head(combined)?;
            let data = head.remove(KEY_DATA).unwrap_or(Value::Null);
            let (request_id, identifier) = head_fields(&head)?;

            Ok(Packet::new(request_id, identifier, data))
        }
    }

    fn deserialize_head(&self, data: &[u8]) -> Result<Map<String, Value>, ProtocolError> {
        let head = match self.serializer.deserialize(data)? {
            Value::Object(map) => map,
            _ => return Err(ProtocolError::EmptyHead),
        };
        if head.is_empty() {
            return Err(ProtocolError::EmptyHead);
        }
        Ok(head)
    }
}

fn head_fields(head: &Map<String, Value>) -> Result<(String, &str), ProtocolError> {
    let request_id = head
        .get(KEY_REQUEST_ID)
        .and_then(Value::as_str)
        .ok_or(ProtocolError::MissingField(KEY_REQUEST_ID))?
        .to_string();
    let identifier = head
        .get(KEY_IDENTIFIER)
        .and_then(Value::as_str)
        .ok_or(ProtocolError::MissingField(KEY_IDENTIFIER))?;
    Ok((request_id, identifier))
}
