//! `HarkEngine`: capture lifecycle around the wake pipeline.
//!
//! ## Lifecycle
//!
//! ```text
//! HarkEngine::new(config, registry, arbiter)
//!     └─► start()        → audio open, pipeline spawned, status = Listening
//!         └─► stop()     → running=false, stream dropped, status = Stopped
//! ```
//!
//! Model download/load and device selection belong to the
//! [`WakeDeviceRegistry`]; the engine only moves audio. Frames are gated by
//! the arbiter, so the engine can run before any model is loaded.
//!
//! ## Threading
//!
//! `cpal::Stream` is `!Send` on Windows/macOS. `AudioCapture` is created
//! inside the `spawn_blocking` closure and dropped there; a sync channel
//! carries the open result back to `start()`.

pub mod pipeline;

use std::sync::{
    atomic::{AtomicBool, AtomicU64, Ordering},
    Arc,
};

use parking_lot::Mutex;
use tokio::sync::broadcast;
use tracing::{error, info};

use crate::{
    arbiter::ArbiterHandle,
    audio::AudioCapture,
    buffering::create_audio_ring,
    error::{HarkError, Result},
    ipc::events::{EngineStatus, EngineStatusEvent, WakeEvent},
    wake::WakeDeviceRegistry,
};

/// Broadcast channel capacity for wake and status events.
const BROADCAST_CAP: usize = 64;

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Rate the wake models consume (Hz). Default: 16000.
    pub target_sample_rate: u32,
    /// Input frames per resampler call. Default: 960.
    pub resample_chunk: usize,
    /// Whole frames allowed to queue before the oldest are dropped.
    /// Default: 8 (≈0.64 s of 80 ms frames).
    pub max_backlog_frames: usize,
    /// Capacity of the i16 accumulator ahead of framing. Default: 4 s.
    pub accumulator_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            target_sample_rate: 16_000,
            resample_chunk: 960,
            max_backlog_frames: 8,
            accumulator_capacity: 64_000,
        }
    }
}

impl EngineConfig {
    /// # Errors
    /// `HarkError::InvalidConfig` on zero sizes.
    pub fn validate(&self) -> Result<()> {
        if self.target_sample_rate == 0 {
            return Err(HarkError::InvalidConfig("target_sample_rate must be > 0".into()));
        }
        if self.resample_chunk == 0 {
            return Err(HarkError::InvalidConfig("resample_chunk must be > 0".into()));
        }
        if self.max_backlog_frames == 0 {
            return Err(HarkError::InvalidConfig("max_backlog_frames must be > 0".into()));
        }
        if self.accumulator_capacity == 0 {
            return Err(HarkError::InvalidConfig("accumulator_capacity must be > 0".into()));
        }
        Ok(())
    }
}

/// The top-level engine handle.
///
/// `HarkEngine` is `Send + Sync`; wrap in `Arc` to share with event
/// forwarding tasks.
pub struct HarkEngine {
    config: EngineConfig,
    registry: Arc<WakeDeviceRegistry>,
    arbiter: ArbiterHandle,
    running: Arc<AtomicBool>,
    status: Arc<Mutex<EngineStatus>>,
    wake_tx: broadcast::Sender<WakeEvent>,
    status_tx: broadcast::Sender<EngineStatusEvent>,
    seq: Arc<AtomicU64>,
    diagnostics: Arc<pipeline::PipelineDiagnostics>,
}

impl HarkEngine {
    /// # Errors
    /// `HarkError::InvalidConfig` if `config` is unusable.
    pub fn new(
        config: EngineConfig,
        registry: Arc<WakeDeviceRegistry>,
        arbiter: ArbiterHandle,
    ) -> Result<Self> {
        config.validate()?;
        let (wake_tx, _) = broadcast::channel(BROADCAST_CAP);
        let (status_tx, _) = broadcast::channel(BROADCAST_CAP);

        Ok(Self {
            config,
            registry,
            arbiter,
            running: Arc::new(AtomicBool::new(false)),
            status: Arc::new(Mutex::new(EngineStatus::Idle)),
            wake_tx,
            status_tx,
            seq: Arc::new(AtomicU64::new(0)),
            diagnostics: Arc::new(pipeline::PipelineDiagnostics::default()),
        })
    }

    /// Start capture on the default input device.
    ///
    /// # Errors
    /// - `HarkError::AlreadyRunning` if already started.
    /// - `HarkError::NoDefaultInputDevice` / `HarkError::AudioStream` on device error.
    pub fn start(&self) -> Result<()> {
        self.start_with_device(None)
    }

    /// Start capture, preferring the input device named `preferred_input_device`.
    ///
    /// Blocks until the device is confirmed open (or fails).
    pub fn start_with_device(&self, preferred_input_device: Option<String>) -> Result<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(HarkError::AlreadyRunning);
        }

        self.diagnostics.reset();
        self.set_status(EngineStatus::Listening, None);

        let (producer, consumer) = create_audio_ring();

        let config = self.config.clone();
        let registry = Arc::clone(&self.registry);
        let arbiter = self.arbiter.clone();
        let running = Arc::clone(&self.running);
        let wake_tx = self.wake_tx.clone();
        let status_tx = self.status_tx.clone();
        let status = Arc::clone(&self.status);
        let seq = Arc::clone(&self.seq);
        let diagnostics = Arc::clone(&self.diagnostics);

        let (open_tx, open_rx) = std::sync::mpsc::channel::<Result<u32>>();

        tokio::task::spawn_blocking(move || {
            let capture = match AudioCapture::open_with_preference(
                producer,
                Arc::clone(&running),
                preferred_input_device.as_deref(),
            ) {
                Ok(c) => {
                    let _ = open_tx.send(Ok(c.sample_rate));
                    c
                }
                Err(e) => {
                    let _ = open_tx.send(Err(e));
                    running.store(false, Ordering::SeqCst);
                    return;
                }
            };

            let outcome = pipeline::run(pipeline::PipelineContext {
                config,
                registry,
                arbiter,
                consumer,
                running: Arc::clone(&running),
                wake_tx,
                seq,
                capture_sample_rate: capture.sample_rate,
                diagnostics,
            });

            drop(capture);

            if let Err(e) = outcome {
                error!(error = %e, "pipeline terminated");
                running.store(false, Ordering::SeqCst);
                publish_status(&status, &status_tx, EngineStatus::Error, Some(e.to_string()));
            }
        });

        match open_rx.recv() {
            Ok(Ok(rate)) => {
                info!(capture_rate = rate, "engine started, listening for wake word");
                Ok(())
            }
            Ok(Err(e)) => {
                self.running.store(false, Ordering::SeqCst);
                self.set_status(EngineStatus::Error, Some(e.to_string()));
                Err(e)
            }
            Err(_) => {
                self.running.store(false, Ordering::SeqCst);
                self.set_status(EngineStatus::Error, Some("pipeline failed to start".into()));
                Err(HarkError::Other(anyhow::anyhow!(
                    "pipeline task died unexpectedly"
                )))
            }
        }
    }

    /// # Errors
    /// `HarkError::NotRunning` if capture is not active.
    pub fn stop(&self) -> Result<()> {
        if !self.running.swap(false, Ordering::SeqCst) {
            return Err(HarkError::NotRunning);
        }
        self.set_status(EngineStatus::Stopped, None);
        info!("engine stop requested");
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn status(&self) -> EngineStatus {
        *self.status.lock()
    }

    pub fn registry(&self) -> &Arc<WakeDeviceRegistry> {
        &self.registry
    }

    pub fn arbiter(&self) -> &ArbiterHandle {
        &self.arbiter
    }

    pub fn subscribe_wake(&self) -> broadcast::Receiver<WakeEvent> {
        self.wake_tx.subscribe()
    }

    pub fn subscribe_status(&self) -> broadcast::Receiver<EngineStatusEvent> {
        self.status_tx.subscribe()
    }

    /// Pipeline counters merged with the active detector's error counts.
    pub fn diagnostics(&self) -> pipeline::DiagnosticsSnapshot {
        let stats = self.registry.current().stats();
        pipeline::DiagnosticsSnapshot {
            inference_errors: stats.inference_errors,
            size_mismatches: stats.size_mismatches,
            ..self.diagnostics.snapshot()
        }
    }

    fn set_status(&self, new_status: EngineStatus, detail: Option<String>) {
        publish_status(&self.status, &self.status_tx, new_status, detail);
    }
}

fn publish_status(
    status: &Mutex<EngineStatus>,
    tx: &broadcast::Sender<EngineStatusEvent>,
    new_status: EngineStatus,
    detail: Option<String>,
) {
    *status.lock() = new_status;
    let _ = tx.send(EngineStatusEvent {
        status: new_status,
        detail,
    });
}
