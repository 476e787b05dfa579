//! Bounded in-memory tail capture for agent output streams.
//!
//! Agent runs can produce arbitrarily large output. The buffer keeps memory
//! steady while preserving the end of the stream, where completion markers
//! live: once the cap is exceeded, content is replaced by a truncation prefix
//! plus the tail of everything seen so far.

/// Marker inserted at the front of a truncated buffer.
pub const TRUNCATION_PREFIX: &str = "[...agent output truncated in memory...]\n";

/// Default per-stream character cap.
pub const DEFAULT_CAP_CHARS: usize = 2_000_000;

/// A string buffer that never exceeds `cap` characters.
///
/// Invariant: after any sequence of pushes totalling L chars, the buffer
/// holds at most `cap` chars; if L > cap the content starts with
/// [`TRUNCATION_PREFIX`] and its tail equals the last `cap - prefix` chars
/// of the full concatenation.
#[derive(Debug)]
pub struct TailBuffer {
    cap: usize,
    buf: String,
}

impl TailBuffer {
    /// Create a buffer with the given character cap.
    ///
    /// Caps smaller than the truncation prefix are raised to hold at least
    /// the prefix plus one character.
    pub fn new(cap: usize) -> Self {
        let min = TRUNCATION_PREFIX.chars().count() + 1;
        Self {
            cap: cap.max(min),
            buf: String::new(),
        }
    }

    pub fn with_default_cap() -> Self {
        Self::new(DEFAULT_CAP_CHARS)
    }

    /// Append a chunk, truncating from the front when the cap is exceeded.
    pub fn push(&mut self, chunk: &str) {
        // Cheap path: byte length bounds char length, so no count needed.
        if self.buf.len() + chunk.len() <= self.cap {
            self.buf.push_str(chunk);
            return;
        }

        let combined_chars = self.buf.chars().count() + chunk.chars().count();
        if combined_chars <= self.cap {
            self.buf.push_str(chunk);
            return;
        }

        let keep = self.cap - TRUNCATION_PREFIX.chars().count();
        self.buf.push_str(chunk);

        let skip = combined_chars - keep;
        let byte_start = self
            .buf
            .char_indices()
            .nth(skip)
            .map_or(self.buf.len(), |(i, _)| i);

        let mut next = String::with_capacity(TRUNCATION_PREFIX.len() + (self.buf.len() - byte_start));
        next.push_str(TRUNCATION_PREFIX);
        next.push_str(&self.buf[byte_start..]);
        self.buf = next;
    }

    pub fn as_str(&self) -> &str {
        &self.buf
    }

    pub fn into_string(self) -> String {
        self.buf
    }

    pub fn len_chars(&self) -> usize {
        self.buf.chars().count()
    }

    pub fn is_truncated(&self) -> bool {
        self.buf.starts_with(TRUNCATION_PREFIX)
    }
}
