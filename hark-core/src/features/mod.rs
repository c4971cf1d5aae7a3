//! Streaming feature extraction for wake detection.
//!
//! ## Stages
//!
//! ```text
//! raw i16 ─► carry-over ─► 1280-sample chunks ─► melspec(chunk + 480 history)
//!                                                     │  x / 10 + 2
//!                                                     ▼
//!                                   SpectrogramFrameBuffer (≤ 970 × 32)
//!                                                     │  76-frame windows, stride 8
//!                                                     ▼
//!                                   EmbeddingFrameBuffer (≤ 120 × 96)
//! ```

pub mod windower;

use std::collections::VecDeque;

pub use windower::FeatureWindower;

use crate::error::{HarkError, Result};

/// Tuning constants of the feature front-end.
///
/// The defaults match the openWakeWord model family; other model families
/// need their own values.
#[derive(Debug, Clone, PartialEq)]
pub struct FeatureConfig {
    /// Raw samples consumed per spectrogram call. Default: 1280 (80 ms).
    pub chunk_size: usize,
    /// Extra history samples prepended for spectral continuity. Default: 480.
    pub overlap: usize,
    /// Raw sample retention. Default: 160 000 (10 s at 16 kHz).
    pub raw_retention: usize,
    /// Spectrogram frame width. Default: 32.
    pub mel_bins: usize,
    /// Maximum retained spectrogram frames. Default: 970 (≈ 10 s).
    pub max_mel_frames: usize,
    /// Post-transform applied to spectrogram values: `v * mel_scale + mel_offset`.
    pub mel_scale: f32,
    pub mel_offset: f32,
    /// Spectrogram frames per embedding window. Default: 76.
    pub embedding_window: usize,
    /// Spectrogram frames between consecutive windows. Default: 8.
    pub embedding_stride: usize,
    /// Embedding width. Default: 96.
    pub embedding_dim: usize,
    /// Maximum retained embeddings. Default: 120.
    pub max_embeddings: usize,
}

impl Default for FeatureConfig {
    fn default() -> Self {
        Self {
            chunk_size: 1280,
            overlap: 480,
            raw_retention: 160_000,
            mel_bins: 32,
            max_mel_frames: 970,
            mel_scale: 0.1,
            mel_offset: 2.0,
            embedding_window: 76,
            embedding_stride: 8,
            embedding_dim: 96,
            max_embeddings: 120,
        }
    }
}

impl FeatureConfig {
    /// # Errors
    /// Returns `HarkError::InvalidConfig` for zero sizes or a window that can
    /// never fit in the retained spectrogram.
    pub fn validate(&self) -> Result<()> {
        let positive = [
            ("chunk_size", self.chunk_size),
            ("mel_bins", self.mel_bins),
            ("max_mel_frames", self.max_mel_frames),
            ("embedding_window", self.embedding_window),
            ("embedding_stride", self.embedding_stride),
            ("embedding_dim", self.embedding_dim),
            ("max_embeddings", self.max_embeddings),
        ];
        if let Some((name, _)) = positive.iter().find(|(_, v)| *v == 0) {
            return Err(HarkError::InvalidConfig(format!("{name} must be > 0")));
        }
        if self.embedding_window > self.max_mel_frames {
            return Err(HarkError::InvalidConfig(format!(
                "embedding_window ({}) exceeds max_mel_frames ({})",
                self.embedding_window, self.max_mel_frames
            )));
        }
        if self.raw_retention < self.chunk_size + self.overlap {
            return Err(HarkError::InvalidConfig(format!(
                "raw_retention ({}) must hold at least chunk_size + overlap ({})",
                self.raw_retention,
                self.chunk_size + self.overlap
            )));
        }
        Ok(())
    }
}

/// FIFO of fixed-width feature vectors stored flat.
///
/// Pushing past `max_frames` trims the oldest frames; the width never changes
/// after construction.
#[derive(Debug, Clone)]
pub struct FeatureRing {
    width: usize,
    max_frames: usize,
    data: VecDeque<f32>,
}

impl FeatureRing {
    pub fn new(width: usize, max_frames: usize) -> Self {
        Self {
            width,
            max_frames,
            data: VecDeque::with_capacity(width * max_frames),
        }
    }

    /// Append `values.len() / width` frames; returns the number appended.
    ///
    /// # Errors
    /// Returns `HarkError::Inference` if `values` is not a whole number of frames.
    pub fn push_frames(&mut self, values: &[f32]) -> Result<usize> {
        if values.len() % self.width != 0 {
            return Err(HarkError::Inference(format!(
                "{} values is not a multiple of frame width {}",
                values.len(),
                self.width
            )));
        }
        self.data.extend(values.iter().copied());
        let excess = self.len().saturating_sub(self.max_frames);
        if excess > 0 {
            self.data.drain(..excess * self.width);
        }
        Ok(values.len() / self.width)
    }

    /// Frames `[start, end)` flattened, or `None` if out of range.
    pub fn frames(&self, start: usize, end: usize) -> Option<Vec<f32>> {
        if start > end || end > self.len() {
            return None;
        }
        Some(
            self.data
                .range(start * self.width..end * self.width)
                .copied()
                .collect(),
        )
    }

    /// The most recent `n` frames (or all of them if fewer exist), flattened.
    pub fn latest(&self, n: usize) -> Vec<f32> {
        let len = self.len();
        let start = len - n.min(len);
        self.frames(start, len).unwrap_or_default()
    }

    /// Number of whole frames currently held.
    pub fn len(&self) -> usize {
        self.data.len() / self.width
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn clear(&mut self) {
        self.data.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        FeatureConfig::default().validate().expect("defaults valid");
    }

    #[test]
    fn zero_stride_is_rejected() {
        let cfg = FeatureConfig {
            embedding_stride: 0,
            ..FeatureConfig::default()
        };
        assert!(matches!(cfg.validate(), Err(HarkError::InvalidConfig(_))));
    }

    #[test]
    fn window_larger_than_retention_is_rejected() {
        let cfg = FeatureConfig {
            embedding_window: 100,
            max_mel_frames: 50,
            ..FeatureConfig::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn ring_trims_oldest_frames() {
        let mut ring = FeatureRing::new(2, 3);
        ring.push_frames(&[1.0, 1.0, 2.0, 2.0]).expect("push");
        ring.push_frames(&[3.0, 3.0, 4.0, 4.0]).expect("push");
        assert_eq!(ring.len(), 3);
        assert_eq!(ring.latest(10), vec![2.0, 2.0, 3.0, 3.0, 4.0, 4.0]);
    }

    #[test]
    fn ring_rejects_partial_frames() {
        let mut ring = FeatureRing::new(4, 8);
        assert!(ring.push_frames(&[0.0; 6]).is_err());
        assert!(ring.is_empty());
    }

    #[test]
    fn frames_range_checks() {
        let mut ring = FeatureRing::new(1, 8);
        ring.push_frames(&[0.0, 1.0, 2.0, 3.0]).expect("push");
        assert_eq!(ring.frames(1, 3), Some(vec![1.0, 2.0]));
        assert_eq!(ring.frames(2, 5), None);
        assert_eq!(ring.latest(2), vec![2.0, 3.0]);
    }
}
