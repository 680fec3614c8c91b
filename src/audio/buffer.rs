//! # Audio Accumulator
//!
//! Per-session store of raw PCM chunks waiting for recognition.
//!
//! ## Two kinds of flush:
//! - **Partial** (`take_partial`): returns the bytes appended since the previous
//!   partial flush and moves the partial mark forward. Turn audio stays buffered.
//! - **Final** (`flush`): returns every buffered byte in append order and clears
//!   the accumulator. Flushing an empty accumulator returns an empty vector.
//!
//! Appends are O(1) amortized: chunks are kept as-is and only concatenated on flush.
//! A hard byte cap turns runaway growth into a `BufferOverflow` instead of an OOM.
//!
//! Between turns the session keeps only a short lead-in (`retain_lead_in`), so an
//! open microphone never walks the buffer up to its cap.

use crate::error::GatewayError;
use std::collections::VecDeque;

#[derive(Debug, Clone)]
pub struct AudioAccumulator {
    chunks: VecDeque<Vec<u8>>,
    byte_len: usize,
    max_bytes: usize,
    /// Index of the first chunk not yet covered by a partial flush
    partial_mark: usize,
    partial_bytes: usize,
}

impl AudioAccumulator {
    pub fn new(max_bytes: usize) -> Self {
        Self {
            chunks: VecDeque::new(),
            byte_len: 0,
            max_bytes,
            partial_mark: 0,
            partial_bytes: 0,
        }
    }

    /// Append a chunk. Fails without modifying the buffer if the cap would be exceeded.
    pub fn append(&mut self, chunk: Vec<u8>) -> Result<(), GatewayError> {
        let attempted = self.byte_len + chunk.len();
        if attempted > self.max_bytes {
            return Err(GatewayError::BufferOverflow {
                limit: self.max_bytes,
                attempted,
            });
        }

        if chunk.is_empty() {
            return Ok(());
        }

        self.byte_len += chunk.len();
        self.partial_bytes += chunk.len();
        self.chunks.push_back(chunk);
        Ok(())
    }

    /// Full flush: return all buffered bytes and clear.
    pub fn flush(&mut self) -> Vec<u8> {
        let audio = self.chunks.iter().flatten().copied().collect();
        self.chunks.clear();
        self.byte_len = 0;
        self.partial_mark = 0;
        self.partial_bytes = 0;
        audio
    }

    /// Incremental flush: bytes appended since the last partial flush.
    pub fn take_partial(&mut self) -> Vec<u8> {
        let audio = self
            .chunks
            .range(self.partial_mark..)
            .flatten()
            .copied()
            .collect();
        self.partial_mark = self.chunks.len();
        self.partial_bytes = 0;
        audio
    }

    /// Keep at most `keep_bytes` of the newest audio as lead-in for the next turn.
    ///
    /// Whole chunks are dropped from the front. What remains counts toward the
    /// next final flush but not toward partial cadence. Returns the bytes dropped.
    pub fn retain_lead_in(&mut self, keep_bytes: usize) -> usize {
        let mut dropped = 0;
        while self.byte_len > keep_bytes {
            let Some(chunk) = self.chunks.pop_front() else {
                break;
            };
            self.byte_len -= chunk.len();
            dropped += chunk.len();
        }

        self.partial_mark = self.chunks.len();
        self.partial_bytes = 0;
        dropped
    }

    pub fn byte_len(&self) -> usize {
        self.byte_len
    }

    pub fn is_empty(&self) -> bool {
        self.byte_len == 0
    }

    /// Chunks appended since the last partial (or full) flush.
    pub fn chunks_since_partial(&self) -> usize {
        self.chunks.len() - self.partial_mark
    }

    /// Bytes appended since the last partial (or full) flush.
    pub fn bytes_since_partial(&self) -> usize {
        self.partial_bytes
    }

    pub fn max_bytes(&self) -> usize {
        self.max_bytes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_append_flush_preserves_order() {
        let mut acc = AudioAccumulator::new(1024);
        acc.append(vec![1, 2, 3]).unwrap();
        acc.append(vec![4, 5]).unwrap();
        assert_eq!(acc.byte_len(), 5);

        assert_eq!(acc.flush(), vec![1, 2, 3, 4, 5]);
        assert_eq!(acc.byte_len(), 0);
        assert!(acc.is_empty());
    }

    #[test]
    fn test_flush_empty_is_idempotent() {
        let mut acc = AudioAccumulator::new(1024);
        assert!(acc.flush().is_empty());
        assert!(acc.flush().is_empty());
        assert!(acc.take_partial().is_empty());
    }

    #[test]
    fn test_partial_flush_is_incremental() {
        let mut acc = AudioAccumulator::new(1024);
        acc.append(vec![1, 2]).unwrap();
        acc.append(vec![3]).unwrap();
        assert_eq!(acc.chunks_since_partial(), 2);

        assert_eq!(acc.take_partial(), vec![1, 2, 3]);
        assert_eq!(acc.chunks_since_partial(), 0);
        assert_eq!(acc.bytes_since_partial(), 0);

        acc.append(vec![4, 5]).unwrap();
        assert_eq!(acc.take_partial(), vec![4, 5]);

        // The final flush still covers the whole turn
        assert_eq!(acc.byte_len(), 5);
        assert_eq!(acc.flush(), vec![1, 2, 3, 4, 5]);
        assert_eq!(acc.chunks_since_partial(), 0);
    }

    #[test]
    fn test_overflow_rejects_without_mutation() {
        let mut acc = AudioAccumulator::new(4);
        acc.append(vec![1, 2, 3]).unwrap();

        let err = acc.append(vec![4, 5]).unwrap_err();
        assert_eq!(err, GatewayError::BufferOverflow { limit: 4, attempted: 5 });
        assert_eq!(acc.byte_len(), 3);

        acc.append(vec![4]).unwrap();
        assert_eq!(acc.flush(), vec![1, 2, 3, 4]);
    }

    #[test]
    fn test_retain_lead_in_drops_oldest_chunks() {
        let mut acc = AudioAccumulator::new(1024);
        for i in 0..5u8 {
            acc.append(vec![i; 4]).unwrap();
        }

        assert_eq!(acc.retain_lead_in(8), 12);
        assert_eq!(acc.byte_len(), 8);
        assert_eq!(acc.chunks_since_partial(), 0);
        assert_eq!(acc.bytes_since_partial(), 0);

        // Lead-in is still part of the next final flush
        acc.append(vec![9, 9]).unwrap();
        assert_eq!(acc.chunks_since_partial(), 1);
        assert_eq!(acc.take_partial(), vec![9, 9]);
        assert_eq!(acc.flush(), vec![3, 3, 3, 3, 4, 4, 4, 4, 9, 9]);

        assert_eq!(acc.retain_lead_in(8), 0);
    }
}
