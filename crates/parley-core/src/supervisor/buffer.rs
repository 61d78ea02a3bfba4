//! Bounded output buffer
//!
//! Ring-buffer semantics: once `capacity` is reached the oldest bytes are
//! dropped. Every byte has an absolute offset so a task can ask for
//! "everything since I was created" without holding a copy.

use std::collections::VecDeque;

#[derive(Debug)]
pub struct OutputBuffer {
    data: VecDeque<u8>,
    capacity: usize,
    /// Absolute offset one past the newest byte
    total: u64,
}

impl OutputBuffer {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            data: VecDeque::with_capacity(capacity.min(64 * 1024)),
            capacity,
            total: 0,
        }
    }

    pub fn push(&mut self, bytes: &[u8]) {
        self.total += bytes.len() as u64;
        let bytes = if bytes.len() > self.capacity {
            &bytes[bytes.len() - self.capacity..]
        } else {
            bytes
        };
        let overflow = (self.data.len() + bytes.len()).saturating_sub(self.capacity);
        self.data.drain(..overflow);
        self.data.extend(bytes);
    }

    /// Absolute offset one past the newest byte
    pub fn total(&self) -> u64 {
        self.total
    }

    /// Absolute offset of the oldest retained byte
    pub fn start(&self) -> u64 {
        self.total - self.data.len() as u64
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// The last `n` bytes
    pub fn tail(&self, n: usize) -> Vec<u8> {
        let skip = self.data.len().saturating_sub(n);
        self.data.iter().skip(skip).copied().collect()
    }

    /// Retained bytes at or after absolute `offset`
    pub fn since(&self, offset: u64) -> Vec<u8> {
        let skip = offset.saturating_sub(self.start()) as usize;
        self.data.iter().skip(skip).copied().collect()
    }
}
