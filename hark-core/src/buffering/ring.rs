//! Fixed-capacity overwrite ring for raw 16 kHz samples.
//!
//! `push` never fails: once the ring is full the oldest samples are evicted
//! FIFO and counted in [`RingAudioAccumulator::evicted`]. `drain(n)` is
//! all-or-nothing, so callers can poll for whole frames without blocking.

use ringbuf::{
    traits::{Consumer, Observer, RingBuffer},
    HeapRb,
};

pub struct RingAudioAccumulator {
    rb: HeapRb<i16>,
    evicted: u64,
}

impl RingAudioAccumulator {
    /// Create an accumulator holding at most `capacity` samples (minimum 1).
    pub fn new(capacity: usize) -> Self {
        Self {
            rb: HeapRb::new(capacity.max(1)),
            evicted: 0,
        }
    }

    /// Append samples, evicting the oldest ones beyond capacity.
    pub fn push(&mut self, samples: &[i16]) {
        let overflow = (self.len() + samples.len()).saturating_sub(self.capacity());
        self.evicted += overflow as u64;
        self.rb.push_slice_overwrite(samples);
    }

    /// Remove and return exactly `n` samples, or `None` if fewer are buffered.
    pub fn drain(&mut self, n: usize) -> Option<Vec<i16>> {
        if self.len() < n {
            return None;
        }
        let mut out = vec![0i16; n];
        let popped = self.rb.pop_slice(&mut out);
        debug_assert_eq!(popped, n);
        Some(out)
    }

    /// Drop up to `n` of the oldest samples; returns how many were removed.
    pub fn discard(&mut self, n: usize) -> usize {
        self.rb.skip(n)
    }

    /// Copy of the most recent `n` samples without consuming them.
    ///
    /// When fewer than `n` samples are buffered the result is left-padded
    /// with silence so it always has length `n`.
    pub fn tail(&self, n: usize) -> Vec<i16> {
        let len = self.len();
        let available = len.min(n);
        let mut out = Vec::with_capacity(n);
        out.resize(n - available, 0);
        out.extend(self.rb.iter().skip(len - available).copied());
        out
    }

    pub fn len(&self) -> usize {
        self.rb.occupied_len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.rb.capacity().get()
    }

    /// Total samples evicted by overwrite since construction.
    pub fn evicted(&self) -> u64 {
        self.evicted
    }

    pub fn clear(&mut self) {
        let len = self.len();
        self.rb.skip(len);
    }

    /// Copy of every buffered sample, oldest first.
    pub fn to_vec(&self) -> Vec<i16> {
        self.rb.iter().copied().collect()
    }
}

impl std::fmt::Debug for RingAudioAccumulator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RingAudioAccumulator")
            .field("len", &self.len())
            .field("capacity", &self.capacity())
            .field("evicted", &self.evicted)
            .finish()
    }
}
