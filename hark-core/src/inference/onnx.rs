//! ONNX backend via the `ort` crate.
//!
//! Targets the openWakeWord model family:
//!
//! | Model                    | Input            | Output            |
//! |--------------------------|------------------|-------------------|
//! | `melspectrogram.onnx`    | `[1, samples]`   | `[1, 1, T, 32]`   |
//! | `embedding_model.onnx`   | `[1, 76, 32, 1]` | `[1, 1, 1, 96]`   |
//! | classifier (`*.onnx`)    | `[1, 16, 96]`    | `[1, 1]`          |
//!
//! Sessions are single-threaded by default: one frame is 80 ms of audio and
//! all three models together run in a few milliseconds on a laptop core.

use std::path::Path;

use ndarray::{ArrayD, IxDyn};
use ort::session::builder::{GraphOptimizationLevel, SessionBuilder};
use ort::session::Session;
use ort::value::Value;
use tracing::info;

use crate::{
    error::{HarkError, Result},
    inference::{EngineFactory, InferenceEngine, ModelRole, Tensor},
};

fn intra_threads() -> usize {
    std::env::var("HARK_ORT_INTRA_THREADS")
        .ok()
        .and_then(|v| v.parse::<usize>().ok())
        .unwrap_or(1)
        .clamp(1, 8)
}

fn create_session(model_path: &Path) -> Result<Session> {
    if !model_path.exists() {
        return Err(HarkError::ModelNotFound {
            path: model_path.to_path_buf(),
        });
    }

    SessionBuilder::new()
        .map_err(|e| HarkError::OnnxSession(e.to_string()))?
        .with_intra_threads(intra_threads())
        .map_err(|e| HarkError::OnnxSession(e.to_string()))?
        .with_inter_threads(1)
        .map_err(|e| HarkError::OnnxSession(e.to_string()))?
        .with_optimization_level(GraphOptimizationLevel::All)
        .map_err(|e| HarkError::OnnxSession(e.to_string()))?
        .commit_from_file(model_path)
        .map_err(|e| HarkError::OnnxSession(e.to_string()))
}

/// One ONNX session wrapped as an [`InferenceEngine`].
pub struct OnnxEngine {
    session: Session,
    input_name: String,
    role: ModelRole,
}

impl OnnxEngine {
    pub fn open(role: ModelRole, path: &Path) -> Result<Self> {
        let session = create_session(path)?;

        let input_names: Vec<String> = session
            .inputs()
            .iter()
            .map(|outlet| outlet.name().to_string())
            .collect();
        let output_names: Vec<String> = session
            .outputs()
            .iter()
            .map(|outlet| outlet.name().to_string())
            .collect();

        let input_name = input_names
            .first()
            .cloned()
            .ok_or_else(|| HarkError::OnnxSession(format!("{role} model has no inputs")))?;
        if output_names.is_empty() {
            return Err(HarkError::OnnxSession(format!("{role} model has no outputs")));
        }

        info!(
            %role,
            path = %path.display(),
            inputs = ?input_names,
            outputs = ?output_names,
            "ONNX session ready"
        );

        Ok(Self {
            session,
            input_name,
            role,
        })
    }
}

impl InferenceEngine for OnnxEngine {
    fn run(&mut self, input: &Tensor) -> Result<Tensor> {
        let array = ArrayD::<f32>::from_shape_vec(IxDyn(input.shape()), input.data().to_vec())
            .map_err(|e| HarkError::Inference(format!("{} input: {e}", self.role)))?;
        let value = Value::from_array(array)
            .map_err(|e: ort::Error| HarkError::OnnxSession(e.to_string()))?;

        let outputs = self
            .session
            .run(ort::inputs![self.input_name.as_str() => value])
            .map_err(|e| HarkError::OnnxSession(format!("{} run: {e}", self.role)))?;

        let (shape, data) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| HarkError::OnnxSession(format!("{} output: {e}", self.role)))?;
        let shape: Vec<usize> = shape.iter().map(|&d| d.max(0) as usize).collect();

        Tensor::new(shape, data.to_vec())
    }
}

/// Opens every role with [`OnnxEngine::open`].
#[derive(Debug, Clone, Copy, Default)]
pub struct OnnxEngineFactory;

impl EngineFactory for OnnxEngineFactory {
    fn open(&self, role: ModelRole, path: &Path) -> Result<Box<dyn InferenceEngine>> {
        Ok(Box::new(OnnxEngine::open(role, path)?))
    }
}
