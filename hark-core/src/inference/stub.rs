//! Deterministic stand-in engines.
//!
//! Used by tests and by offline development when no model files exist. They
//! produce correctly shaped tensors so the feature and detection pipeline can
//! be exercised end-to-end without a runtime.

use std::path::Path;
use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};

use parking_lot::Mutex;
use tracing::debug;

use crate::error::{HarkError, Result};
use crate::inference::{EngineFactory, InferenceEngine, ModelRole, Tensor};

/// Engine backed by a closure.
pub struct FnEngine<F>(pub F);

impl<F> InferenceEngine for FnEngine<F>
where
    F: FnMut(&Tensor) -> Result<Tensor> + Send + 'static,
{
    fn run(&mut self, input: &Tensor) -> Result<Tensor> {
        (self.0)(input)
    }
}

/// Emits `frames` zero-valued mel frames of width `bins` per call,
/// regardless of input length.
pub struct StubMelEngine {
    pub frames: usize,
    pub bins: usize,
}

impl InferenceEngine for StubMelEngine {
    fn run(&mut self, _input: &Tensor) -> Result<Tensor> {
        Tensor::new(
            vec![1, 1, self.frames, self.bins],
            vec![0.0; self.frames * self.bins],
        )
    }
}

/// Emits one zero-valued embedding of width `dim` per call.
pub struct StubEmbeddingEngine {
    pub dim: usize,
}

impl InferenceEngine for StubEmbeddingEngine {
    fn run(&mut self, _input: &Tensor) -> Result<Tensor> {
        Tensor::new(vec![1, 1, 1, self.dim], vec![0.0; self.dim])
    }
}

/// Classifier that replays a fixed score sequence, repeating the last score
/// once the script is exhausted (0.0 for an empty script).
pub struct ScriptedEngine {
    scores: Vec<f32>,
    next: usize,
}

impl ScriptedEngine {
    pub fn new(scores: Vec<f32>) -> Self {
        Self { scores, next: 0 }
    }
}

impl InferenceEngine for ScriptedEngine {
    fn run(&mut self, _input: &Tensor) -> Result<Tensor> {
        let score = self
            .scores
            .get(self.next)
            .or_else(|| self.scores.last())
            .copied()
            .unwrap_or(0.0);
        self.next = self.next.saturating_add(1);
        Ok(Tensor::row(vec![score]))
    }
}

/// Factory producing stub engines for every role.
///
/// `mel_frames_per_call` defaults to 76 so the very first chunk already fills
/// one embedding window, which keeps detector tests short.
#[derive(Clone)]
pub struct StubEngineFactory {
    pub mel_frames_per_call: usize,
    pub mel_bins: usize,
    pub embedding_dim: usize,
    pub scores: Vec<f32>,
    /// When set, opening this role fails with an ONNX-style error.
    pub fail_role: Option<ModelRole>,
    opened: Arc<AtomicUsize>,
    classifier_inputs: Arc<Mutex<Vec<Vec<usize>>>>,
}

impl StubEngineFactory {
    pub fn new(scores: Vec<f32>) -> Self {
        Self {
            mel_frames_per_call: 76,
            mel_bins: 32,
            embedding_dim: 96,
            scores,
            fail_role: None,
            opened: Arc::new(AtomicUsize::new(0)),
            classifier_inputs: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn failing(role: ModelRole) -> Self {
        Self {
            fail_role: Some(role),
            ..Self::new(vec![])
        }
    }

    /// Number of engines successfully opened so far.
    pub fn opened(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }

    /// Shapes of every tensor handed to the classifier.
    pub fn classifier_input_shapes(&self) -> Vec<Vec<usize>> {
        self.classifier_inputs.lock().clone()
    }
}

impl Default for StubEngineFactory {
    fn default() -> Self {
        Self::new(vec![0.0])
    }
}

impl EngineFactory for StubEngineFactory {
    fn open(&self, role: ModelRole, path: &Path) -> Result<Box<dyn InferenceEngine>> {
        if self.fail_role == Some(role) {
            return Err(HarkError::OnnxSession(format!(
                "stub refused to open {role} model {}",
                path.display()
            )));
        }
        debug!(%role, path = %path.display(), "opening stub engine");
        self.opened.fetch_add(1, Ordering::SeqCst);

        let engine: Box<dyn InferenceEngine> = match role {
            ModelRole::MelSpectrogram => Box::new(StubMelEngine {
                frames: self.mel_frames_per_call,
                bins: self.mel_bins,
            }),
            ModelRole::Embedding => Box::new(StubEmbeddingEngine {
                dim: self.embedding_dim,
            }),
            ModelRole::Classifier => {
                let inputs = Arc::clone(&self.classifier_inputs);
                let mut scripted = ScriptedEngine::new(self.scores.clone());
                Box::new(FnEngine(move |input: &Tensor| {
                    inputs.lock().push(input.shape().to_vec());
                    scripted.run(input)
                }))
            }
        };
        Ok(engine)
    }
}
