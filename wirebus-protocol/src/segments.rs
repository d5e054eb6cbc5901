//! Segmented byte buffer.
//!
//! A packet is assembled from a handful of byte ranges (description byte,
//! header, body) that mostly already exist as owned buffers. Keeping them
//! as an ordered list of [`Bytes`] segments lets the codec build the final
//! payload without copying until flattening, and not at all when there is
//! exactly one segment.

use bytes::{Bytes, BytesMut};

/// Ordered sequence of byte segments with a running total length.
///
/// The total always equals the sum of the segment lengths; every mutation
/// updates it in the same call.
#[derive(Debug, Default, Clone)]
pub struct SegmentedBuffer {
    segments: Vec<Bytes>,
    total: usize,
}

impl SegmentedBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a segment at the end.
    pub fn push(&mut self, segment: Bytes) {
        self.total += segment.len();
        self.segments.push(segment);
    }

    /// Inserts a segment at `index`, shifting later segments.
    pub fn insert(&mut self, index: usize, segment: Bytes) {
        self.total += segment.len();
        self.segments.insert(index, segment);
    }

    /// Replaces the segment at `index`, adjusting the total length.
    pub fn replace(&mut self, index: usize, segment: Bytes) {
        self.total = self.total - self.segments[index].len() + segment.len();
        self.segments[index] = segment;
    }

    /// Returns the segment at `index`.
    pub fn segment(&self, index: usize) -> &Bytes {
        &self.segments[index]
    }

    /// Total byte length across all segments.
    pub fn len(&self) -> usize {
        self.total
    }

    pub fn is_empty(&self) -> bool {
        self.total == 0
    }

    /// Number of segments.
    pub fn segment_count(&self) -> usize {
        self.segments.len()
    }

    /// Flattens into a single contiguous buffer.
    ///
    /// With exactly one segment this is a cheap handle clone, no copy.
    pub fn to_bytes(&self) -> Bytes {
        match self.segments.len() {
            0 => Bytes::new(),
            1 => self.segments[0].clone(),
            _ => {
                let mut buf = BytesMut::with_capacity(self.total);
                for segment in &self.segments {
                    buf.extend_from_slice(segment);
                }
                buf.freeze()
            }
        }
    }
}
