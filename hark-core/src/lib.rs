//! # hark-core
//!
//! Streaming wake-word detection and microphone arbitration.
//!
//! ## Architecture
//!
//! ```text
//! Microphone → AudioCapture → SPSC RingBuffer → Pipeline(spawn_blocking)
//!                                                    │
//!                                   RingAudioAccumulator → 1280-sample frames
//!                                                    │
//!                               MicrophoneArbiter gate (WakeListening only)
//!                                                    │
//!                  WakeDevice → FeatureWindower → mel → embedding → classifier
//!                                                    │
//!                                      broadcast::Sender<WakeEvent>
//! ```
//!
//! The audio callback is zero-alloc. All model work happens on the pipeline
//! thread; lifecycle changes (download, load, device swap) run on the tokio
//! runtime and report to the arbiter task.

#![forbid(unsafe_code)]
#![warn(clippy::all)]

pub mod arbiter;
pub mod audio;
pub mod buffering;
pub mod engine;
pub mod error;
pub mod features;
pub mod inference;
pub mod ipc;
pub mod wake;

// Convenience re-exports for downstream crates
pub use arbiter::{
    ArbiterConfig, ArbiterHandle, MicrophoneArbiter, PipelineState, RecognitionState,
    SpeechRecognizer,
};
pub use engine::{EngineConfig, HarkEngine};
pub use error::HarkError;
pub use features::{FeatureConfig, FeatureWindower};
pub use inference::{EngineFactory, InferenceEngine, ModelRole, ModelStack, Tensor};
pub use ipc::events::{
    EngineStatus, EngineStatusEvent, PipelineStateEvent, WakeDeviceStateEvent, WakeEvent,
};
pub use wake::{
    DetectorConfig, DeviceBuilder, ModelArtifacts, RegistryConfig, WakeDevice, WakeDeviceKind,
    WakeDeviceRegistry, WakeDeviceState, WakeWordDetector,
};

#[cfg(feature = "onnx")]
pub use inference::{OnnxEngine, OnnxEngineFactory};

#[cfg(feature = "download")]
pub use wake::HttpFetcher;
