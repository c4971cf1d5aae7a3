use tracing::trace;

use crate::{
    buffering::RingAudioAccumulator,
    error::{HarkError, Result},
    features::{FeatureConfig, FeatureRing},
    inference::{InferenceEngine, ModelStack, Tensor},
};

/// Raw samples → spectrogram frames → embeddings.
///
/// Owned by exactly one detector. Samples that do not complete a chunk are
/// held in `pending` and prepended to the next `ingest` call.
#[derive(Debug)]
pub struct FeatureWindower {
    config: FeatureConfig,
    pending: RingAudioAccumulator,
    history: RingAudioAccumulator,
    mel: FeatureRing,
    embeddings: FeatureRing,
}

impl FeatureWindower {
    pub fn new(config: FeatureConfig) -> Self {
        Self {
            pending: RingAudioAccumulator::new(config.chunk_size * 2),
            history: RingAudioAccumulator::new(config.raw_retention),
            mel: FeatureRing::new(config.mel_bins, config.max_mel_frames),
            embeddings: FeatureRing::new(config.embedding_dim, config.max_embeddings),
            config,
        }
    }

    /// Feed raw 16 kHz samples; returns the number of embeddings produced.
    ///
    /// # Errors
    /// Propagates engine failures and malformed engine outputs. Samples are
    /// already committed to the raw history when that happens.
    pub fn ingest(&mut self, samples: &[i16], models: &mut ModelStack) -> Result<usize> {
        let chunk = self.config.chunk_size;
        let mut completed = 0usize;
        for piece in samples.chunks(chunk) {
            self.pending.push(piece);
            while let Some(full) = self.pending.drain(chunk) {
                self.history.push(&full);
                completed += 1;
            }
        }
        if completed == 0 {
            return Ok(0);
        }

        self.extend_spectrogram(completed, models.melspec.as_mut())?;
        self.extend_embeddings(completed, models.embedding.as_mut())
    }

    fn extend_spectrogram(
        &mut self,
        chunks: usize,
        melspec: &mut dyn InferenceEngine,
    ) -> Result<()> {
        let n = chunks * self.config.chunk_size + self.config.overlap;
        let input: Vec<f32> = self.history.tail(n).into_iter().map(f32::from).collect();

        let output = melspec.run(&Tensor::row(input))?;
        let scale = self.config.mel_scale;
        let offset = self.config.mel_offset;
        let scaled: Vec<f32> = output
            .into_data()
            .into_iter()
            .map(|v| v * scale + offset)
            .collect();
        let frames = self.mel.push_frames(&scaled)?;
        trace!(chunks, frames, total = self.mel.len(), "spectrogram extended");
        Ok(())
    }

    fn extend_embeddings(
        &mut self,
        chunks: usize,
        embedding: &mut dyn InferenceEngine,
    ) -> Result<usize> {
        let window = self.config.embedding_window;
        let stride = self.config.embedding_stride;
        let bins = self.config.mel_bins;
        let dim = self.config.embedding_dim;

        let mut produced = 0;
        for i in (0..chunks).rev() {
            let Some(end) = self.mel.len().checked_sub(stride * i) else {
                continue;
            };
            if end < window {
                continue;
            }
            let Some(frames) = self.mel.frames(end - window, end) else {
                continue;
            };
            let output = embedding.run(&Tensor::new(vec![1, window, bins, 1], frames)?)?;
            if output.data().len() != dim {
                return Err(HarkError::Inference(format!(
                    "embedding output has {} values, expected {dim}",
                    output.data().len()
                )));
            }
            self.embeddings.push_frames(output.data())?;
            produced += 1;
        }
        Ok(produced)
    }

    /// The most recent `n` embeddings (fewer if not yet available) and their count.
    pub fn latest_embeddings(&self, n: usize) -> (usize, Vec<f32>) {
        let count = n.min(self.embeddings.len());
        (count, self.embeddings.latest(count))
    }

    /// Carry-over samples waiting for a full chunk.
    pub fn pending_samples(&self) -> usize {
        self.pending.len()
    }

    pub fn pending(&self) -> Vec<i16> {
        self.pending.to_vec()
    }

    /// Retained raw samples that have been consumed in whole chunks.
    pub fn raw_history(&self) -> Vec<i16> {
        self.history.to_vec()
    }

    pub fn spectrogram(&self) -> &FeatureRing {
        &self.mel
    }

    pub fn embeddings(&self) -> &FeatureRing {
        &self.embeddings
    }

    pub fn config(&self) -> &FeatureConfig {
        &self.config
    }

    pub fn reset(&mut self) {
        self.pending.clear();
        self.history.clear();
        self.mel.clear();
        self.embeddings.clear();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use approx::assert_relative_eq;
    use parking_lot::Mutex;

    use super::*;
    use crate::inference::stub::{FnEngine, ScriptedEngine, StubEmbeddingEngine, StubMelEngine};

    fn stack(mel_frames: usize) -> ModelStack {
        ModelStack {
            melspec: Box::new(StubMelEngine {
                frames: mel_frames,
                bins: 32,
            }),
            embedding: Box::new(StubEmbeddingEngine { dim: 96 }),
            classifier: Box::new(ScriptedEngine::new(vec![])),
        }
    }

    fn ramp(start: usize, len: usize) -> Vec<i16> {
        (start..start + len).map(|i| (i % 30_000) as i16).collect()
    }

    #[test]
    fn remainders_are_carried_over_exactly() {
        let mut windower = FeatureWindower::new(FeatureConfig::default());
        let mut models = stack(8);
        let mut pushed = Vec::new();

        for len in [100, 1500, 3, 2560, 700, 1279, 1, 4000, 17] {
            let piece = ramp(pushed.len(), len);
            pushed.extend_from_slice(&piece);
            windower.ingest(&piece, &mut models).expect("ingest");

            let mut rebuilt = windower.raw_history();
            rebuilt.extend(windower.pending());
            assert_eq!(rebuilt, pushed);
            assert!(windower.pending_samples() < 1280);
        }
    }

    #[test]
    fn short_spectrogram_skips_windowing() {
        let mut windower = FeatureWindower::new(FeatureConfig::default());
        let mut models = stack(8);

        for _ in 0..9 {
            assert_eq!(windower.ingest(&[0; 1280], &mut models).expect("ingest"), 0);
        }
        assert_eq!(windower.spectrogram().len(), 72);
        assert!(windower.embeddings().is_empty());

        // 80 frames: one window ends at the buffer end.
        assert_eq!(windower.ingest(&[0; 1280], &mut models).expect("ingest"), 1);

        // Two chunks, one stub call (8 frames): windows end at 80 and 88.
        assert_eq!(windower.ingest(&[0; 2560], &mut models).expect("ingest"), 2);
        assert_eq!(windower.embeddings().len(), 3);
    }

    #[test]
    fn spectrogram_input_is_left_padded_at_stream_start() {
        let seen: Arc<Mutex<Vec<Vec<f32>>>> = Arc::default();
        let sink = Arc::clone(&seen);
        let mut models = stack(8);
        models.melspec = Box::new(FnEngine(move |input: &Tensor| {
            sink.lock().push(input.data().to_vec());
            Tensor::new(vec![1, 1, 8, 32], vec![0.0; 8 * 32])
        }));

        let mut windower = FeatureWindower::new(FeatureConfig::default());
        let samples = vec![5i16; 1280];
        windower.ingest(&samples, &mut models).expect("ingest");
        windower.ingest(&[7; 2560], &mut models).expect("ingest");

        let seen = seen.lock();
        assert_eq!(seen.len(), 2, "one spectrogram call per ingest");
        assert_eq!(seen[0].len(), 1280 + 480);
        assert!(seen[0][..480].iter().all(|&v| v == 0.0));
        assert!(seen[0][480..].iter().all(|&v| v == 5.0));

        assert_eq!(seen[1].len(), 2 * 1280 + 480);
        assert!(seen[1][..480].iter().all(|&v| v == 5.0));
        assert!(seen[1][480..].iter().all(|&v| v == 7.0));
    }

    #[test]
    fn spectrogram_values_are_rescaled() {
        let mut models = stack(8);
        models.melspec = Box::new(FnEngine(|_: &Tensor| {
            Tensor::new(vec![1, 1, 1, 32], vec![10.0; 32])
        }));
        let mut windower = FeatureWindower::new(FeatureConfig::default());
        windower.ingest(&[0; 1280], &mut models).expect("ingest");

        let frame = windower.spectrogram().latest(1);
        assert_eq!(frame.len(), 32);
        for v in frame {
            assert_relative_eq!(v, 3.0);
        }
    }

    #[test]
    fn malformed_spectrogram_output_is_an_error() {
        let mut models = stack(8);
        models.melspec = Box::new(FnEngine(|_: &Tensor| -> Result<Tensor> {
            Ok(Tensor::row(vec![0.0; 33]))
        }));
        let mut windower = FeatureWindower::new(FeatureConfig::default());
        assert!(matches!(
            windower.ingest(&[0; 1280], &mut models),
            Err(HarkError::Inference(_))
        ));
    }

    #[test]
    fn embedding_buffer_is_trimmed_fifo() {
        let config = FeatureConfig {
            max_embeddings: 4,
            ..FeatureConfig::default()
        };
        let mut windower = FeatureWindower::new(config);
        let mut models = stack(76);
        for _ in 0..10 {
            windower.ingest(&[0; 1280], &mut models).expect("ingest");
        }
        assert_eq!(windower.embeddings().len(), 4);
        assert_eq!(windower.spectrogram().len(), 760);

        let (count, flat) = windower.latest_embeddings(16);
        assert_eq!(count, 4);
        assert_eq!(flat.len(), 4 * 96);
    }

    #[test]
    fn reset_clears_all_buffers() {
        let mut windower = FeatureWindower::new(FeatureConfig::default());
        let mut models = stack(76);
        windower.ingest(&[1; 2000], &mut models).expect("ingest");
        windower.reset();
        assert_eq!(windower.pending_samples(), 0);
        assert!(windower.raw_history().is_empty());
        assert!(windower.spectrogram().is_empty());
        assert!(windower.embeddings().is_empty());
    }
}
