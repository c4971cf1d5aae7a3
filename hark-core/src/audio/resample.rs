//! Capture-rate → 16 kHz conversion with a rubato `FastFixedIn` resampler.
//!
//! Devices usually capture at 44.1 or 48 kHz; the wake models expect 16 kHz.
//! Conversion runs on the pipeline thread, never in the audio callback. When
//! the rates already match no rubato session is created.

use rubato::{FastFixedIn, PolynomialDegree, Resampler};
use tracing::{debug, error};

use crate::error::{HarkError, Result};

/// Converts mono f32 audio between two fixed rates.
pub struct RateConverter {
    /// `None` in passthrough mode.
    resampler: Option<FastFixedIn<f32>>,
    /// Input held back until a full rubato chunk is available.
    pending: Vec<f32>,
    chunk_size: usize,
    scratch: Vec<Vec<f32>>,
}

impl RateConverter {
    /// `chunk_size` is the number of input frames per rubato call.
    ///
    /// # Errors
    /// Returns `HarkError::InvalidConfig` if rubato rejects the parameters.
    pub fn new(capture_rate: u32, target_rate: u32, chunk_size: usize) -> Result<Self> {
        if capture_rate == target_rate {
            return Ok(Self {
                resampler: None,
                pending: Vec::new(),
                chunk_size,
                scratch: Vec::new(),
            });
        }

        let resampler = FastFixedIn::<f32>::new(
            target_rate as f64 / capture_rate as f64,
            1.0,
            PolynomialDegree::Cubic,
            chunk_size,
            1,
        )
        .map_err(|e| HarkError::InvalidConfig(format!("resampler init: {e}")))?;
        let scratch = vec![vec![0f32; resampler.output_frames_max()]; 1];

        debug!(capture_rate, target_rate, chunk_size, "resampling enabled");

        Ok(Self {
            resampler: Some(resampler),
            pending: Vec::with_capacity(chunk_size * 2),
            chunk_size,
            scratch,
        })
    }

    /// Append the converted form of `samples` to `out`.
    ///
    /// Input that does not fill a whole chunk is kept for the next call.
    pub fn process_into(&mut self, samples: &[f32], out: &mut Vec<f32>) {
        let Some(resampler) = self.resampler.as_mut() else {
            out.extend_from_slice(samples);
            return;
        };

        self.pending.extend_from_slice(samples);
        let mut consumed = 0;
        while self.pending.len() - consumed >= self.chunk_size {
            let chunk = &self.pending[consumed..consumed + self.chunk_size];
            match resampler.process_into_buffer(&[chunk], &mut self.scratch, None) {
                Ok((_, produced)) => out.extend_from_slice(&self.scratch[0][..produced]),
                Err(e) => error!("resampler process error: {e}"),
            }
            consumed += self.chunk_size;
        }
        self.pending.drain(..consumed);
    }

    pub fn process(&mut self, samples: &[f32]) -> Vec<f32> {
        let mut out = Vec::new();
        self.process_into(samples, &mut out);
        out
    }

    pub fn is_passthrough(&self) -> bool {
        self.resampler.is_none()
    }
}
