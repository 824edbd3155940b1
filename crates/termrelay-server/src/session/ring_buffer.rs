//! Bounded capture of PTY output while a session is detached.
//!
//! Holds the most recent `capacity` bytes. Once full, the oldest bytes are
//! discarded: recent output is preferred over completeness, so a reattaching
//! client may miss the start of a long burst. `dropped()` reports how much.

/// A fixed-capacity circular byte buffer.
#[derive(Debug)]
pub struct RingBuffer {
    buf: Vec<u8>,
    capacity: usize,
    /// Index of the oldest stored byte.
    start: usize,
    len: usize,
    /// Bytes discarded on overflow since the last drain.
    dropped: u64,
}

impl RingBuffer {
    /// Create a new ring buffer with the given capacity in bytes.
    pub fn new(capacity: usize) -> Self {
        Self {
            buf: vec![0u8; capacity],
            capacity,
            start: 0,
            len: 0,
            dropped: 0,
        }
    }

    /// Append data, overwriting the oldest bytes if full.
    pub fn write(&mut self, data: &[u8]) {
        if self.capacity == 0 {
            self.dropped += data.len() as u64;
            return;
        }

        // Only the tail of an oversized write can survive.
        let data = if data.len() > self.capacity {
            let skip = data.len() - self.capacity;
            self.dropped += skip as u64;
            &data[skip..]
        } else {
            data
        };

        let overflow = (self.len + data.len()).saturating_sub(self.capacity);
        if overflow > 0 {
            self.start = (self.start + overflow) % self.capacity;
            self.len -= overflow;
            self.dropped += overflow as u64;
        }

        let mut write_pos = (self.start + self.len) % self.capacity;
        let mut remaining = data;
        while !remaining.is_empty() {
            let room = self.capacity - write_pos;
            let n = room.min(remaining.len());
            self.buf[write_pos..write_pos + n].copy_from_slice(&remaining[..n]);
            write_pos = (write_pos + n) % self.capacity;
            remaining = &remaining[n..];
        }
        self.len += data.len();
    }

    /// Read all buffered data in chronological order.
    pub fn read_all(&self) -> Vec<u8> {
        let mut result = Vec::with_capacity(self.len);
        let end = self.start + self.len;
        if end <= self.capacity {
            result.extend_from_slice(&self.buf[self.start..end]);
        } else {
            result.extend_from_slice(&self.buf[self.start..]);
            result.extend_from_slice(&self.buf[..end - self.capacity]);
        }
        result
    }

    /// Number of valid bytes currently stored.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Bytes lost to overflow since the last `clear`.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    /// Forget the buffered bytes and the overflow count.
    pub fn clear(&mut self) {
        self.start = 0;
        self.len = 0;
        self.dropped = 0;
    }
}
