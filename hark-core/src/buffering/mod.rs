//! Audio buffering.
//!
//! Two kinds of buffers live here:
//!
//! - the lock-free SPSC ring between the real-time capture callback and the
//!   pipeline thread (`ringbuf::HeapRb<f32>` split into producer/consumer);
//! - [`RingAudioAccumulator`], a single-owner overwrite ring that turns
//!   irregular sample runs into fixed-size frames.

pub mod ring;

use ringbuf::{traits::Split, HeapRb};

pub use ring::RingAudioAccumulator;
pub use ringbuf::traits::{Consumer, Producer};

/// Type alias for the producer half, held by the audio callback thread.
pub type AudioProducer = ringbuf::HeapProd<f32>;

/// Type alias for the consumer half, held by the pipeline thread.
pub type AudioConsumer = ringbuf::HeapCons<f32>;

/// Buffer capacity: 2^19 = 524 288 f32 samples ≈ 10.9 s at 48 kHz.
/// Wake detection only cares about the last few seconds; anything older is
/// dropped by the pipeline's backlog policy anyway.
pub const RING_CAPACITY: usize = 1 << 19;

/// Create a matched producer/consumer pair backed by a heap-allocated ring buffer.
pub fn create_audio_ring() -> (AudioProducer, AudioConsumer) {
    HeapRb::<f32>::new(RING_CAPACITY).split()
}

/// Convert normalised f32 samples in [-1.0, 1.0] to 16-bit PCM.
pub fn f32_to_i16(samples: &[f32]) -> Vec<i16> {
    samples
        .iter()
        .map(|s| (s.clamp(-1.0, 1.0) * i16::MAX as f32) as i16)
        .collect()
}
