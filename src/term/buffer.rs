#![forbid(unsafe_code)]

use std::collections::VecDeque;

// Recent output kept for replay on reattach. Bounded by line count and by
// total bytes; whichever bound bites first evicts from the front.
#[derive(Debug)]
pub struct ScrollbackBuffer {
    chunks: VecDeque<String>,
    bytes: usize,
    max_lines: usize,
    max_bytes: usize,
}

impl ScrollbackBuffer {
    #[must_use]
    pub fn new(max_lines: usize, max_bytes: usize) -> Self {
        Self {
            chunks: VecDeque::with_capacity(max_lines.min(128)),
            bytes: 0,
            max_lines: max_lines.max(1),
            max_bytes: max_bytes.max(1),
        }
    }

    pub fn push(&mut self, chunk: String) {
        self.bytes += chunk.len();
        self.chunks.push_back(chunk);

        while self.chunks.len() > self.max_lines || self.bytes > self.max_bytes {
            match self.chunks.pop_front() {
                Some(dropped) => self.bytes -= dropped.len(),
                None => break,
            }
        }
    }

    #[must_use]
    pub fn history(&self) -> Vec<String> {
        self.chunks.iter().cloned().collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    #[must_use]
    pub fn total_bytes(&self) -> usize {
        self.bytes
    }
}
