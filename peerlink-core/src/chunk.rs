//! Outbound chunking and send-buffer watermarks for a direct data channel.

use bytes::Bytes;

/// Default chunk size in bytes. Well below the practical data-channel message limit.
pub const DEFAULT_CHUNK_SIZE: usize = 32 * 1024; // 32 KiB

/// Default high-water mark for the channel's buffered amount.
pub const DEFAULT_HIGH_WATER: usize = 8 * 1024 * 1024; // 8 MiB

/// Split an encoded frame into chunks of at most `chunk_size` bytes, in order.
/// Chunks share the frame's allocation.
pub fn split_into_chunks(frame: Bytes, chunk_size: usize) -> Vec<Bytes> {
    let size = if chunk_size == 0 {
        DEFAULT_CHUNK_SIZE
    } else {
        chunk_size
    };
    let mut out = Vec::with_capacity(chunk_count(frame.len(), size));
    let mut start = 0;
    while start < frame.len() {
        let end = (start + size).min(frame.len());
        out.push(frame.slice(start..end));
        start = end;
    }
    out
}

/// Number of chunks a payload of `len` bytes splits into: ceil(len / chunk_size).
pub fn chunk_count(len: usize, chunk_size: usize) -> usize {
    if chunk_size == 0 {
        return chunk_count(len, DEFAULT_CHUNK_SIZE);
    }
    len.div_ceil(chunk_size)
}

/// Buffered-byte thresholds: sending pauses above `high`, resumes once drained below `low`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Watermarks {
    pub high: usize,
    pub low: usize,
}

impl Watermarks {
    /// Low mark defaults to half the high mark.
    pub fn new(high: usize) -> Self {
        Self { high, low: high / 2 }
    }

    pub fn with_low(high: usize, low: usize) -> Self {
        Self {
            high,
            low: low.min(high),
        }
    }

    /// True if submitting `next` more bytes on top of `buffered` would cross the high mark.
    pub fn must_wait(&self, buffered: usize, next: usize) -> bool {
        buffered.saturating_add(next) > self.high
    }
}

impl Default for Watermarks {
    fn default() -> Self {
        Self::new(DEFAULT_HIGH_WATER)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_chunks() {
        let frame = Bytes::from((0..100u8).collect::<Vec<_>>());
        let chunks = split_into_chunks(frame, 30);
        assert_eq!(chunks.len(), 4);
        assert_eq!(chunks[0].len(), 30);
        assert_eq!(chunks[3].len(), 10);
        assert_eq!(chunks[3][0], 90);
    }

    #[test]
    fn split_exact_multiple() {
        let chunks = split_into_chunks(Bytes::from(vec![1u8; 90]), 30);
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunk_count(90, 30), 3);
    }

    #[test]
    fn split_zero_length() {
        assert!(split_into_chunks(Bytes::new(), 30).is_empty());
        assert_eq!(chunk_count(0, 30), 0);
    }

    #[test]
    fn split_zero_chunk_size_uses_default() {
        let chunks = split_into_chunks(Bytes::from(vec![0u8; DEFAULT_CHUNK_SIZE * 2 + 1]), 0);
        assert_eq!(chunks.len(), 3);
    }

    #[test]
    fn concatenation_preserves_bytes() {
        let data: Vec<u8> = (0..1000u32).map(|i| (i % 251) as u8).collect();
        let joined: Vec<u8> = split_into_chunks(Bytes::from(data.clone()), 64)
            .iter()
            .flat_map(|c| c.iter().copied())
            .collect();
        assert_eq!(joined, data);
    }

    #[test]
    fn watermarks() {
        let w = Watermarks::new(100);
        assert_eq!(w.low, 50);
        assert!(!w.must_wait(70, 30));
        assert!(w.must_wait(71, 30));
        assert_eq!(Watermarks::with_low(100, 200).low, 100);
    }
}
