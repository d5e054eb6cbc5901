//! Byte-stream framer.
//!
//! Frame layout (1 start byte + 4-byte length + payload + 2-byte checksum):
//!
//! ```text
//! +-------+-----------------+-----------+----------+
//! | 0x01  | length (i32 LE) |  payload  | checksum |
//! | 1 byte|     4 bytes     |  L bytes  |  2 bytes |
//! +-------+-----------------+-----------+----------+
//! ```
//!
//! The framer is a resumable state machine: input may arrive split across
//! arbitrarily small chunks, and completed checksum-verified payloads are
//! queued in arrival order. A checksum mismatch or an oversized declared
//! length is fatal; the framer poisons itself and the owning connection is
//! expected to close.

use crate::checksum::sign;
use crate::error::ProtocolError;
use crate::{CHECKSUM_SIZE, LENGTH_FIELD_SIZE, MAX_FRAME_PAYLOAD, START_BYTE};
use bytes::{BufMut, Bytes, BytesMut};
use std::collections::VecDeque;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FramerState {
    /// Scanning for the start byte.
    Wait,
    /// Accumulating the 4-byte length field.
    ReadLen,
    /// Accumulating the declared payload.
    ReadData,
    /// Accumulating the 2-byte checksum trailer.
    ReadChecksum,
}

/// Per-connection inbound frame assembler.
#[derive(Debug)]
pub struct ByteFramer {
    state: FramerState,
    len_buf: [u8; LENGTH_FIELD_SIZE],
    len_filled: usize,
    expected: usize,
    payload: BytesMut,
    check_buf: [u8; CHECKSUM_SIZE],
    check_filled: usize,
    completed: VecDeque<Bytes>,
    poisoned: bool,
}

impl Default for ByteFramer {
    fn default() -> Self {
        Self::new()
    }
}

impl ByteFramer {
    pub fn new() -> Self {
        Self {
            state: FramerState::Wait,
            len_buf: [0; LENGTH_FIELD_SIZE],
            len_filled: 0,
            expected: 0,
            payload: BytesMut::new(),
            check_buf: [0; CHECKSUM_SIZE],
            check_filled: 0,
            completed: VecDeque::new(),
            poisoned: false,
        }
    }

    /// Consumes one inbound chunk, queueing any payloads it completes.
    pub fn feed(&mut self, mut chunk: &[u8]) -> Result<(), ProtocolError> {
        if self.poisoned {
            return Err(ProtocolError::Poisoned);
        }

        while !chunk.is_empty() {
            match self.state {
                FramerState::Wait => {
                    // Anything before the start byte is skipped; this is
                    // also what swallows unframed keepalive probes.
                    match chunk.iter().position(|&b| b == START_BYTE) {
                        Some(pos) => {
                            chunk = &chunk[pos + 1..];
                            self.len_filled = 0;
                            self.state = FramerState::ReadLen;
                        }
                        None => return Ok(()),
                    }
                }
                FramerState::ReadLen => {
                    let take = (LENGTH_FIELD_SIZE - self.len_filled).min(chunk.len());
                    self.len_buf[self.len_filled..self.len_filled + take]
                        .copy_from_slice(&chunk[..take]);
                    self.len_filled += take;
                    chunk = &chunk[take..];

                    if self.len_filled == LENGTH_FIELD_SIZE {
                        let declared = i32::from_le_bytes(self.len_buf);
                        if declared < 0 {
                            self.poisoned = true;
                            return Err(ProtocolError::NegativeLength(declared));
                        }
                        let expected = declared as usize;
                        if expected > MAX_FRAME_PAYLOAD {
                            self.poisoned = true;
                            return Err(ProtocolError::OversizedFrame {
                                max: MAX_FRAME_PAYLOAD,
                            });
                        }
                        self.expected = expected;
                        self.payload = BytesMut::with_capacity(expected.min(64 * 1024));
                        self.check_filled = 0;
                        self.state = if expected == 0 {
                            FramerState::ReadChecksum
                        } else {
                            FramerState::ReadData
                        };
                    }
                }
                FramerState::ReadData => {
                    let take = (self.expected - self.payload.len()).min(chunk.len());
                    self.payload.extend_from_slice(&chunk[..take]);
                    chunk = &chunk[take..];

                    if self.payload.len() == self.expected {
                        self.check_filled = 0;
                        self.state = FramerState::ReadChecksum;
                    }
                }
                FramerState::ReadChecksum => {
                    let take = (CHECKSUM_SIZE - self.check_filled).min(chunk.len());
                    self.check_buf[self.check_filled..self.check_filled + take]
                        .copy_from_slice(&chunk[..take]);
                    self.check_filled += take;
                    chunk = &chunk[take..];

                    if self.check_filled == CHECKSUM_SIZE {
                        let actual = sign(&self.payload);
                        if actual != self.check_buf {
                            self.poisoned = true;
                            return Err(ProtocolError::ChecksumMismatch {
                                expected: self.check_buf,
                                actual,
                            });
                        }
                        let payload = std::mem::take(&mut self.payload).freeze();
                        self.completed.push_back(payload);
                        self.state = FramerState::Wait;
                    }
                }
            }
        }

        Ok(())
    }

    /// Pops the next completed payload, in arrival order.
    pub fn next(&mut self) -> Option<Bytes> {
        self.completed.pop_front()
    }

    /// Number of completed payloads waiting for retrieval.
    pub fn pending(&self) -> usize {
        self.completed.len()
    }

    /// Whether an earlier fatal error disabled this framer.
    pub fn is_poisoned(&self) -> bool {
        self.poisoned
    }
}

/// Wraps a codec payload into one outbound frame.
pub fn encode_frame(payload: &[u8]) -> BytesMut {
    let mut buf =
        BytesMut::with_capacity(1 + LENGTH_FIELD_SIZE + payload.len() + CHECKSUM_SIZE);
    buf.put_u8(START_BYTE);
    buf.put_i32_le(payload.len() as i32);
    buf.put_slice(payload);
    buf.put_slice(&sign(payload));
    buf
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_single_frame_roundtrip() {
        let payload = b"hello frame";
        let encoded = encode_frame(payload);

        let mut framer = ByteFramer::new();
        framer.feed(&encoded).unwrap();

        assert_eq!(framer.next().unwrap().as_ref(), payload);
        assert!(framer.next().is_none());
    }

    #[test]
    fn test_byte_at_a_time() {
        let payload = b"resumable across arbitrary splits";
        let encoded = encode_frame(payload);

        let mut framer = ByteFramer::new();
        for byte in encoded.iter() {
            framer.feed(&[*byte]).unwrap();
        }

        assert_eq!(framer.next().unwrap().as_ref(), payload);
    }

    #[test]
    fn test_multiple_frames_in_one_chunk() {
        let mut stream = BytesMut::new();
        stream.extend_from_slice(&encode_frame(b"first"));
        stream.extend_from_slice(&encode_frame(b"second"));
        stream.extend_from_slice(&encode_frame(b"third"));

        let mut framer = ByteFramer::new();
        framer.feed(&stream).unwrap();

        assert_eq!(framer.pending(), 3);
        assert_eq!(framer.next().unwrap().as_ref(), b"first");
        assert_eq!(framer.next().unwrap().as_ref(), b"second");
        assert_eq!(framer.next().unwrap().as_ref(), b"third");
    }

    #[test]
    fn test_leading_garbage_skipped() {
        let mut stream = BytesMut::new();
        stream.extend_from_slice(&[0x00, 0x00, 0x7f]);
        stream.extend_from_slice(&encode_frame(b"after noise"));

        let mut framer = ByteFramer::new();
        framer.feed(&stream).unwrap();
        assert_eq!(framer.next().unwrap().as_ref(), b"after noise");
    }

    #[test]
    fn test_keepalive_bytes_ignored() {
        let mut framer = ByteFramer::new();
        framer.feed(&[crate::KEEPALIVE_BYTE]).unwrap();
        framer.feed(&[crate::KEEPALIVE_BYTE]).unwrap();
        assert_eq!(framer.pending(), 0);

        framer.feed(&encode_frame(b"live")).unwrap();
        assert_eq!(framer.next().unwrap().as_ref(), b"live");
    }

    #[test]
    fn test_empty_payload_frame() {
        let encoded = encode_frame(b"");
        let mut framer = ByteFramer::new();
        framer.feed(&encoded).unwrap();
        assert!(framer.next().unwrap().is_empty());
    }

    #[test]
    fn test_checksum_mismatch_is_fatal() {
        let mut encoded = encode_frame(b"corrupt me please").to_vec();
        // Flip one payload byte; the trailer no longer matches.
        encoded[7] ^= 0xff;

        let mut framer = ByteFramer::new();
        let err = framer.feed(&encoded).unwrap_err();
        assert!(matches!(err, ProtocolError::ChecksumMismatch { .. }));
        assert!(framer.is_poisoned());

        // Poisoned framers refuse further input.
        assert!(matches!(
            framer.feed(b"x").unwrap_err(),
            ProtocolError::Poisoned
        ));
    }

    #[test]
    fn test_corrupted_checksum_trailer_detected() {
        let payload = b"four or more bytes";
        let mut encoded = encode_frame(payload).to_vec();
        let last = encoded.len() - 1;
        encoded[last] ^= 0x01;

        let mut framer = ByteFramer::new();
        assert!(framer.feed(&encoded).is_err());
    }

    #[test]
    fn test_oversized_declared_length() {
        let mut stream = vec![START_BYTE];
        stream.extend_from_slice(&(MAX_FRAME_PAYLOAD as i32 + 1).to_le_bytes());

        let mut framer = ByteFramer::new();
        let err = framer.feed(&stream).unwrap_err();
        assert!(matches!(err, ProtocolError::OversizedFrame { .. }));
        assert!(framer.is_poisoned());
    }

    #[test]
    fn test_negative_declared_length() {
        let mut stream = vec![START_BYTE];
        stream.extend_from_slice(&(-1i32).to_le_bytes());

        let mut framer = ByteFramer::new();
        let err = framer.feed(&stream).unwrap_err();
        assert!(matches!(err, ProtocolError::NegativeLength(-1)));
    }

    proptest! {
        #[test]
        fn prop_arbitrary_splits_preserve_frames(
            payloads in proptest::collection::vec(
                proptest::collection::vec(any::<u8>(), 0..128),
                1..6,
            ),
            chunk_sizes in proptest::collection::vec(1usize..16, 1..64),
        ) {
            let mut stream = Vec::new();
            for payload in &payloads {
                stream.extend_from_slice(&encode_frame(payload));
            }

            let mut framer = ByteFramer::new();
            let mut offset = 0;
            let mut cursor = 0;
            while offset < stream.len() {
                let size = chunk_sizes[cursor % chunk_sizes.len()];
                cursor += 1;
                let end = (offset + size).min(stream.len());
                framer.feed(&stream[offset..end]).unwrap();
                offset = end;
            }

            for payload in &payloads {
                let got = framer.next().unwrap();
                prop_assert_eq!(got.as_ref(), &payload[..]);
            }
            prop_assert!(framer.next().is_none());
        }
    }
}
