//! Inference abstraction.
//!
//! The wake pipeline chains three opaque models (mel-spectrogram, embedding,
//! classifier). Each is reached only through [`InferenceEngine`], a plain
//! `tensor -> tensor` call, so the feature and detection logic never depends
//! on a specific runtime and can be driven by deterministic fakes.
//!
//! `&mut self` on `run` reflects that runtime sessions are not safe to call
//! concurrently. Every engine is owned by exactly one detector, whose runtime
//! mutex serialises calls per instance.

pub mod stub;

#[cfg(feature = "onnx")]
pub mod onnx;

#[cfg(feature = "onnx")]
pub use onnx::{OnnxEngine, OnnxEngineFactory};

use std::fmt;
use std::path::Path;

use crate::error::{HarkError, Result};

/// Dense row-major f32 tensor exchanged with an [`InferenceEngine`].
#[derive(Debug, Clone, PartialEq)]
pub struct Tensor {
    shape: Vec<usize>,
    data: Vec<f32>,
}

impl Tensor {
    /// Build a tensor, checking that `data` fills `shape` exactly.
    pub fn new(shape: Vec<usize>, data: Vec<f32>) -> Result<Self> {
        let expected: usize = shape.iter().product();
        if expected != data.len() {
            return Err(HarkError::Inference(format!(
                "tensor shape {shape:?} needs {expected} values, got {}",
                data.len()
            )));
        }
        Ok(Self { shape, data })
    }

    /// `[1, n]` row vector.
    pub fn row(data: Vec<f32>) -> Self {
        Self {
            shape: vec![1, data.len()],
            data,
        }
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn data(&self) -> &[f32] {
        &self.data
    }

    pub fn into_data(self) -> Vec<f32> {
        self.data
    }

    /// First element, used for single-score classifier outputs.
    pub fn first(&self) -> Option<f32> {
        self.data.first().copied()
    }
}

/// Contract for all model backends: one synchronous, CPU-bound call.
pub trait InferenceEngine: Send + 'static {
    /// Run the model on `input` and return its first output.
    ///
    /// # Errors
    /// Returns an error if the input shape is rejected or the runtime faults.
    fn run(&mut self, input: &Tensor) -> Result<Tensor>;
}

/// Which stage of the wake pipeline a model file serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ModelRole {
    MelSpectrogram,
    Embedding,
    Classifier,
}

impl fmt::Display for ModelRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ModelRole::MelSpectrogram => "melspectrogram",
            ModelRole::Embedding => "embedding",
            ModelRole::Classifier => "classifier",
        })
    }
}

/// Opens model files into engines. Injected into detectors so tests and
/// alternative runtimes can replace ONNX.
pub trait EngineFactory: Send + Sync + 'static {
    /// # Errors
    /// Returns an error if the file is missing or cannot be parsed.
    fn open(&self, role: ModelRole, path: &Path) -> Result<Box<dyn InferenceEngine>>;
}

/// The three chained engines of one detector instance.
pub struct ModelStack {
    pub melspec: Box<dyn InferenceEngine>,
    pub embedding: Box<dyn InferenceEngine>,
    pub classifier: Box<dyn InferenceEngine>,
}

impl fmt::Debug for ModelStack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModelStack").finish_non_exhaustive()
    }
}
