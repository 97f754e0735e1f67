//! Replay window for late-joining viewers.
//!
//! Keeps process output as an insertion-ordered sequence of chunks,
//! bounded by total byte size. A viewer that attaches after output has
//! already flowed receives the concatenation of what is retained here
//! instead of reparsing live traffic.

use std::collections::VecDeque;

/// Screenfuls of output retained for replay: the byte cap is
/// `cols * rows * PAGE_FACTOR` at the current geometry.
pub const PAGE_FACTOR: usize = 3;

/// A size-bounded, insertion-ordered chunk buffer.
#[derive(Debug, Default)]
pub struct ReplayBuffer {
    chunks: VecDeque<String>,
    total_bytes: usize,
}

impl ReplayBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a chunk. Eviction is a separate step so the cap can be
    /// computed from the geometry in effect at append time.
    pub fn push(&mut self, chunk: String) {
        self.total_bytes += chunk.len();
        self.chunks.push_back(chunk);
    }

    /// Drop oldest chunks, one at a time, while the retained total
    /// exceeds `max_bytes`. Returns how many chunks were dropped.
    ///
    /// Eviction is whole-chunk, so the buffer may land strictly under
    /// the cap. The newest chunk is always retained, even when it alone
    /// exceeds the cap — replay never loses the most recent output.
    pub fn evict_to(&mut self, max_bytes: usize) -> usize {
        let mut evicted = 0;
        while self.total_bytes > max_bytes && self.chunks.len() > 1 {
            if let Some(chunk) = self.chunks.pop_front() {
                self.total_bytes -= chunk.len();
                evicted += 1;
            }
        }
        evicted
    }

    /// The exact in-order concatenation of all retained chunks.
    pub fn snapshot(&self) -> String {
        let mut out = String::with_capacity(self.total_bytes);
        for chunk in &self.chunks {
            out.push_str(chunk);
        }
        out
    }

    /// Total retained bytes.
    pub fn len_bytes(&self) -> usize {
        self.total_bytes
    }

    /// Number of retained chunks.
    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }

    /// Whether nothing is retained.
    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }
}
