//! Incremental UTF-8 decoding for terminal output.
//!
//! PTY reads return arbitrary byte boundaries, so a multi-byte character can
//! straddle two chunks. `Utf8Stream` holds back an incomplete trailing
//! sequence until the rest arrives; invalid bytes become U+FFFD.

/// Longest possible incomplete UTF-8 prefix.
const MAX_PENDING: usize = 3;

#[derive(Debug, Default)]
pub struct Utf8Stream {
    pending: Vec<u8>,
}

impl Utf8Stream {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk and return every complete character decoded so far.
    pub fn push(&mut self, chunk: &[u8]) -> String {
        self.pending.extend_from_slice(chunk);
        let mut out = String::with_capacity(self.pending.len());
        let mut rest: &[u8] = &self.pending;

        loop {
            match std::str::from_utf8(rest) {
                Ok(valid) => {
                    out.push_str(valid);
                    rest = &[];
                    break;
                }
                Err(e) => {
                    let (valid, after) = rest.split_at(e.valid_up_to());
                    out.push_str(std::str::from_utf8(valid).unwrap_or_default());
                    match e.error_len() {
                        Some(bad) => {
                            out.push(char::REPLACEMENT_CHARACTER);
                            rest = &after[bad..];
                        }
                        None => {
                            // Incomplete sequence at the end; wait for more bytes.
                            rest = after;
                            break;
                        }
                    }
                }
            }
        }

        let keep = rest.to_vec();
        debug_assert!(keep.len() <= MAX_PENDING);
        self.pending = keep;
        out
    }

    /// Flush whatever is left, replacing an incomplete tail with U+FFFD.
    pub fn finish(&mut self) -> String {
        let tail = std::mem::take(&mut self.pending);
        String::from_utf8_lossy(&tail).into_owned()
    }

    /// Bytes held back waiting for the rest of a character.
    pub fn pending(&self) -> usize {
        self.pending.len()
    }
}
