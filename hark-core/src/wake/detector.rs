//! openWakeWord-style detector: spectrogram → embeddings → classifier.
//!
//! ## Threading
//!
//! `process_frame` runs on the pipeline thread and only touches the runtime
//! mutex. `load`/`download` run on `spawn_blocking` tasks; they publish state
//! through a separate mutex + broadcast so observers never wait on inference.

use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};

use parking_lot::Mutex;
use tokio::sync::broadcast;
use tracing::{debug, error, info, info_span, warn};

use crate::{
    error::{HarkError, Result},
    features::{FeatureConfig, FeatureWindower},
    inference::{EngineFactory, ModelRole, ModelStack, Tensor},
    wake::{
        artifacts::ModelArtifacts,
        fetch::ModelFetcher,
        state::{DownloadProgress, WakeDeviceState},
    },
};

const STATE_CHANNEL_CAP: usize = 64;

/// Every numeric constant of the detector.
#[derive(Debug, Clone, PartialEq)]
pub struct DetectorConfig {
    /// Samples per `process_frame` call. Default: 1280 (80 ms @ 16 kHz).
    pub frame_size: usize,
    /// Expected input rate. Default: 16000.
    pub sample_rate: u32,
    /// Detection fires when the score is strictly above this. Default: 0.3.
    pub threshold: f32,
    /// Embeddings fed to the classifier per frame. Default: 16.
    pub classifier_window: usize,
    pub features: FeatureConfig,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            frame_size: 1280,
            sample_rate: 16_000,
            threshold: 0.3,
            classifier_window: 16,
            features: FeatureConfig::default(),
        }
    }
}

impl DetectorConfig {
    /// # Errors
    /// Returns `HarkError::InvalidConfig` describing the first bad field.
    pub fn validate(&self) -> Result<()> {
        if self.frame_size == 0 {
            return Err(HarkError::InvalidConfig("frame_size must be > 0".into()));
        }
        if self.sample_rate == 0 {
            return Err(HarkError::InvalidConfig("sample_rate must be > 0".into()));
        }
        if !self.threshold.is_finite() {
            return Err(HarkError::InvalidConfig(format!(
                "threshold must be finite, got {}",
                self.threshold
            )));
        }
        if self.classifier_window == 0 || self.classifier_window > self.features.max_embeddings {
            return Err(HarkError::InvalidConfig(format!(
                "classifier_window must be in 1..={}, got {}",
                self.features.max_embeddings, self.classifier_window
            )));
        }
        self.features.validate()
    }
}

/// Score and decision for one processed frame.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct ScoredFrame {
    pub score: f32,
    pub detected: bool,
}

/// Counters exposed for pipeline diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DetectorStats {
    pub inference_errors: u64,
    pub size_mismatches: u64,
}

struct DetectorRuntime {
    models: ModelStack,
    windower: FeatureWindower,
    consecutive_mismatches: u32,
}

struct Inner {
    config: DetectorConfig,
    artifacts: ModelArtifacts,
    factory: Arc<dyn EngineFactory>,
    fetcher: Option<Arc<dyn ModelFetcher>>,
    state: Mutex<WakeDeviceState>,
    state_tx: broadcast::Sender<WakeDeviceState>,
    runtime: Mutex<Option<DetectorRuntime>>,
    /// Bumped by `destroy`; a load that started under an older epoch discards
    /// its sessions instead of installing them.
    epoch: AtomicU64,
    inference_errors: AtomicU64,
    size_mismatches: AtomicU64,
}

/// Cheap to clone; clones share one runtime and one lifecycle.
#[derive(Clone)]
pub struct WakeWordDetector {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for WakeWordDetector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WakeWordDetector")
            .field("state", &self.state())
            .field("cache_dir", &self.inner.artifacts.cache_dir)
            .finish_non_exhaustive()
    }
}

impl WakeWordDetector {
    /// # Errors
    /// Returns `HarkError::InvalidConfig` if `config` does not validate.
    pub fn new(
        config: DetectorConfig,
        artifacts: ModelArtifacts,
        factory: Arc<dyn EngineFactory>,
        fetcher: Option<Arc<dyn ModelFetcher>>,
    ) -> Result<Self> {
        config.validate()?;
        let initial = Self::idle_state(&artifacts);
        let (state_tx, _) = broadcast::channel(STATE_CHANNEL_CAP);
        debug!(state = ?initial, cache = %artifacts.cache_dir.display(), "wake detector created");

        Ok(Self {
            inner: Arc::new(Inner {
                config,
                artifacts,
                factory,
                fetcher,
                state: Mutex::new(initial),
                state_tx,
                runtime: Mutex::new(None),
                epoch: AtomicU64::new(0),
                inference_errors: AtomicU64::new(0),
                size_mismatches: AtomicU64::new(0),
            }),
        })
    }

    fn idle_state(artifacts: &ModelArtifacts) -> WakeDeviceState {
        if artifacts.has_local_models() || artifacts.has_bundled_models() {
            WakeDeviceState::NotLoaded
        } else {
            WakeDeviceState::NotDownloaded
        }
    }

    pub fn state(&self) -> WakeDeviceState {
        self.inner.state.lock().clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<WakeDeviceState> {
        self.inner.state_tx.subscribe()
    }

    pub fn frame_size(&self) -> usize {
        self.inner.config.frame_size
    }

    pub fn config(&self) -> &DetectorConfig {
        &self.inner.config
    }

    pub fn artifacts(&self) -> &ModelArtifacts {
        &self.inner.artifacts
    }

    pub fn stats(&self) -> DetectorStats {
        DetectorStats {
            inference_errors: self.inner.inference_errors.load(Ordering::Relaxed),
            size_mismatches: self.inner.size_mismatches.load(Ordering::Relaxed),
        }
    }

    fn set_state(&self, next: WakeDeviceState) {
        let mut state = self.inner.state.lock();
        *state = next.clone();
        let _ = self.inner.state_tx.send(next);
    }

    /// Atomically move to `next` if `accept` approves the current state.
    fn transition(
        &self,
        accept: impl FnOnce(&WakeDeviceState) -> bool,
        next: WakeDeviceState,
    ) -> std::result::Result<(), WakeDeviceState> {
        let mut state = self.inner.state.lock();
        if !accept(&*state) {
            return Err(state.clone());
        }
        *state = next.clone();
        let _ = self.inner.state_tx.send(next);
        Ok(())
    }

    // ── Load ─────────────────────────────────────────────────────────────────

    /// Load on a blocking task.
    ///
    /// # Errors
    /// See [`WakeWordDetector::load_blocking`].
    pub async fn load(&self) -> Result<()> {
        let this = self.clone();
        tokio::task::spawn_blocking(move || this.load_blocking())
            .await
            .map_err(|e| HarkError::Other(anyhow::anyhow!("wake load task failed: {e}")))?
    }

    /// `NotLoaded | ErrorLoading → Loading → Loaded | ErrorLoading`.
    ///
    /// Returns `Ok` without doing anything if already loaded or busy.
    ///
    /// # Errors
    /// `ModelsUnavailable` when no model files are present locally or bundled;
    /// otherwise the error that put the detector into `ErrorLoading`.
    pub fn load_blocking(&self) -> Result<()> {
        let artifacts = &self.inner.artifacts;
        let models_present = artifacts.has_local_models() || artifacts.has_bundled_models();
        let gate = self.transition(
            |s| match s {
                WakeDeviceState::NotLoaded | WakeDeviceState::ErrorLoading { .. } => true,
                WakeDeviceState::NotDownloaded | WakeDeviceState::ErrorDownloading { .. } => {
                    models_present
                }
                _ => false,
            },
            WakeDeviceState::Loading,
        );
        match gate {
            Ok(()) => {}
            Err(s) if s.is_loaded() || s.is_busy() => return Ok(()),
            Err(_) => return Err(HarkError::ModelsUnavailable),
        }

        let epoch = self.inner.epoch.load(Ordering::SeqCst);
        let span = info_span!("wake_load", cache = %artifacts.cache_dir.display());
        let _enter = span.enter();

        if !artifacts.has_local_models() {
            if let Err(e) = artifacts.copy_bundled_to_cache() {
                error!(error = %e, "copying bundled wake models failed");
                self.set_state(WakeDeviceState::ErrorDownloading {
                    cause: e.to_string(),
                });
                return Err(e);
            }
        }

        let models = match self.open_models() {
            Ok(models) => models,
            Err(e) => {
                error!(error = %e, "wake model load failed");
                self.set_state(WakeDeviceState::ErrorLoading {
                    cause: e.to_string(),
                });
                return Err(e);
            }
        };

        let mut runtime = self.inner.runtime.lock();
        if self.inner.epoch.load(Ordering::SeqCst) != epoch {
            info!("detector destroyed during load; discarding sessions");
            return Ok(());
        }
        *runtime = Some(DetectorRuntime {
            models,
            windower: FeatureWindower::new(self.inner.config.features.clone()),
            consecutive_mismatches: 0,
        });
        self.set_state(WakeDeviceState::Loaded);
        info!(
            threshold = self.inner.config.threshold,
            frame_size = self.inner.config.frame_size,
            "wake models loaded"
        );
        Ok(())
    }

    fn open_models(&self) -> Result<ModelStack> {
        let open = |role: ModelRole| {
            let path = self.inner.artifacts.path(role);
            self.inner.factory.open(role, &path)
        };
        Ok(ModelStack {
            melspec: open(ModelRole::MelSpectrogram)?,
            embedding: open(ModelRole::Embedding)?,
            classifier: open(ModelRole::Classifier)?,
        })
    }

    // ── Download ─────────────────────────────────────────────────────────────

    /// Download on a blocking task.
    ///
    /// # Errors
    /// See [`WakeWordDetector::download_blocking`].
    pub async fn download(&self) -> Result<()> {
        let this = self.clone();
        tokio::task::spawn_blocking(move || this.download_blocking())
            .await
            .map_err(|e| HarkError::Other(anyhow::anyhow!("wake download task failed: {e}")))?
    }

    /// `NotDownloaded | ErrorDownloading → Downloading → NotLoaded | ErrorDownloading`,
    /// then chains into [`load_blocking`](Self::load_blocking) on success.
    ///
    /// A no-op when the models are already present or another task is busy.
    ///
    /// # Errors
    /// The download failure, or the load failure that followed it.
    pub fn download_blocking(&self) -> Result<()> {
        let gate = self.transition(
            |s| {
                matches!(
                    s,
                    WakeDeviceState::NotDownloaded | WakeDeviceState::ErrorDownloading { .. }
                )
            },
            WakeDeviceState::Downloading {
                progress: DownloadProgress::default(),
            },
        );
        if gate.is_err() {
            return Ok(());
        }

        let span = info_span!("wake_download", cache = %self.inner.artifacts.cache_dir.display());
        let _enter = span.enter();

        if let Err(e) = self.fetch_missing() {
            error!(error = %e, "wake model download failed");
            self.set_state(WakeDeviceState::ErrorDownloading {
                cause: e.to_string(),
            });
            return Err(e);
        }

        self.set_state(WakeDeviceState::NotLoaded);
        self.load_blocking()
    }

    fn fetch_missing(&self) -> Result<()> {
        let artifacts = &self.inner.artifacts;
        if artifacts.has_bundled_models() {
            artifacts.copy_bundled_to_cache()?;
            return Ok(());
        }

        let missing = artifacts.missing();
        if missing.is_empty() {
            return Ok(());
        }
        let fetcher = self
            .inner
            .fetcher
            .as_ref()
            .ok_or_else(|| HarkError::Download("no model fetcher configured".into()))?;
        std::fs::create_dir_all(&artifacts.cache_dir)?;

        for role in missing {
            let file = artifacts.file(role);
            let url = file.url.as_deref().ok_or_else(|| {
                HarkError::Download(format!(
                    "{role} model {} has no download source",
                    file.file_name
                ))
            })?;
            let dest = artifacts.path(role);
            let part = dest.with_extension("onnx.part");

            info!(%role, url, "downloading wake model");
            let mut publish = |progress: DownloadProgress| {
                self.set_state(WakeDeviceState::Downloading { progress });
            };
            if let Err(e) = fetcher.fetch(url, &part, &mut publish) {
                let _ = std::fs::remove_file(&part);
                return Err(e);
            }
            std::fs::rename(&part, &dest)?;
        }
        Ok(())
    }

    // ── Per-frame ────────────────────────────────────────────────────────────

    /// `true` when the wake phrase was just spoken.
    ///
    /// # Errors
    /// See [`process_frame_scored`](Self::process_frame_scored).
    pub fn process_frame(&self, frame: &[i16]) -> Result<bool> {
        Ok(self.process_frame_scored(frame)?.detected)
    }

    /// Score one frame.
    ///
    /// Returns a zero score with no side effects unless `Loaded`. A frame of
    /// the wrong length is tolerated once (the pipeline may still hold a frame
    /// sliced for the previous device); a second consecutive one is an error.
    /// Inference failures are logged, counted and reported as no detection.
    ///
    /// # Errors
    /// `HarkError::FrameSizeMismatch` on the second consecutive bad frame.
    pub fn process_frame_scored(&self, frame: &[i16]) -> Result<ScoredFrame> {
        // State lock first and released: load holds runtime then state.
        if !self.state().is_loaded() {
            return Ok(ScoredFrame::default());
        }
        let mut guard = self.inner.runtime.lock();
        let Some(runtime) = guard.as_mut() else {
            return Ok(ScoredFrame::default());
        };

        let expected = self.inner.config.frame_size;
        if frame.len() != expected {
            runtime.consecutive_mismatches += 1;
            self.inner.size_mismatches.fetch_add(1, Ordering::Relaxed);
            if runtime.consecutive_mismatches > 1 {
                return Err(HarkError::FrameSizeMismatch {
                    expected,
                    actual: frame.len(),
                });
            }
            warn!(expected, actual = frame.len(), "ignoring frame of unexpected size");
            return Ok(ScoredFrame::default());
        }
        runtime.consecutive_mismatches = 0;

        match Self::score(runtime, frame, &self.inner.config) {
            Ok(score) => Ok(ScoredFrame {
                score,
                detected: score > self.inner.config.threshold,
            }),
            Err(e) => {
                let total = self.inner.inference_errors.fetch_add(1, Ordering::Relaxed) + 1;
                warn!(error = %e, total, "wake inference failed; frame skipped");
                Ok(ScoredFrame::default())
            }
        }
    }

    fn score(runtime: &mut DetectorRuntime, frame: &[i16], config: &DetectorConfig) -> Result<f32> {
        runtime.windower.ingest(frame, &mut runtime.models)?;

        let (count, flat) = runtime.windower.latest_embeddings(config.classifier_window);
        if count == 0 {
            return Ok(0.0);
        }
        let input = Tensor::new(vec![1, count, config.features.embedding_dim], flat)?;
        runtime
            .models
            .classifier
            .run(&input)?
            .first()
            .ok_or_else(|| HarkError::Inference("classifier returned no score".into()))
    }

    /// Forget all buffered audio and features, keeping the loaded sessions.
    ///
    /// The next frame is scored as if the stream had just started. Call this
    /// when the detector regains the microphone after a gap.
    pub fn reset(&self) {
        if let Some(runtime) = self.inner.runtime.lock().as_mut() {
            runtime.windower.reset();
            debug!("wake feature history cleared");
        }
    }

    // ── Teardown ─────────────────────────────────────────────────────────────

    /// Release the model sessions and return to the idle lifecycle state.
    ///
    /// Any load still in flight discards its sessions when it finishes.
    pub fn destroy(&self) {
        self.inner.epoch.fetch_add(1, Ordering::SeqCst);
        let released = self.inner.runtime.lock().take().is_some();
        self.set_state(Self::idle_state(&self.inner.artifacts));
        debug!(released, "wake detector destroyed");
    }
}

#[cfg(test)]
mod tests {
    use std::path::Path;
    use std::sync::atomic::AtomicUsize;

    use super::*;
    use crate::inference::stub::{FnEngine, StubEngineFactory};
    use crate::inference::InferenceEngine;

    const MODEL_FILES: [&str; 3] = [
        "melspectrogram.onnx",
        "embedding_model.onnx",
        "hey_jarvis_v0.1.onnx",
    ];

    fn artifacts(root: &Path, with_models: bool) -> ModelArtifacts {
        let artifacts = ModelArtifacts::openwakeword(root).with_bundled_dir(None);
        if with_models {
            std::fs::create_dir_all(&artifacts.cache_dir).expect("mkdir");
            for name in MODEL_FILES {
                std::fs::write(artifacts.cache_dir.join(name), b"onnx").expect("write");
            }
        }
        artifacts
    }

    fn detector(root: &Path, factory: StubEngineFactory) -> WakeWordDetector {
        WakeWordDetector::new(
            DetectorConfig::default(),
            artifacts(root, true),
            Arc::new(factory),
            None,
        )
        .expect("detector")
    }

    fn drain(rx: &mut broadcast::Receiver<WakeDeviceState>) -> Vec<WakeDeviceState> {
        let mut out = Vec::new();
        while let Ok(s) = rx.try_recv() {
            out.push(s);
        }
        out
    }

    struct WriteFetcher {
        fail: bool,
        calls: AtomicUsize,
    }

    impl ModelFetcher for WriteFetcher {
        fn fetch(
            &self,
            _url: &str,
            dest: &Path,
            progress: &mut dyn FnMut(DownloadProgress),
        ) -> Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(HarkError::Download("connection reset".into()));
            }
            std::fs::write(dest, b"onnx")?;
            progress(DownloadProgress {
                downloaded_bytes: 4,
                total_bytes: Some(4),
            });
            Ok(())
        }
    }

    #[test]
    fn default_config_validates() {
        DetectorConfig::default().validate().expect("valid");
        let bad = DetectorConfig {
            classifier_window: 0,
            ..DetectorConfig::default()
        };
        assert!(bad.validate().is_err());
    }

    #[test]
    fn initial_state_reflects_local_models() {
        let root = tempfile::tempdir().expect("tempdir");
        let factory: Arc<dyn EngineFactory> = Arc::new(StubEngineFactory::default());
        let missing = WakeWordDetector::new(
            DetectorConfig::default(),
            artifacts(&root.path().join("a"), false),
            Arc::clone(&factory),
            None,
        )
        .expect("detector");
        assert_eq!(missing.state(), WakeDeviceState::NotDownloaded);

        let present = detector(&root.path().join("b"), StubEngineFactory::default());
        assert_eq!(present.state(), WakeDeviceState::NotLoaded);
    }

    #[test]
    fn unloaded_detector_never_detects() {
        let root = tempfile::tempdir().expect("tempdir");
        let factory = StubEngineFactory::new(vec![0.99]);
        let det = detector(root.path(), factory.clone());

        for frame in [vec![0i16; 1280], vec![1; 7], vec![]] {
            assert!(!det.process_frame(&frame).expect("no error when unloaded"));
        }
        assert_eq!(factory.opened(), 0);
        assert!(factory.classifier_input_shapes().is_empty());
        assert_eq!(det.stats(), DetectorStats::default());
    }

    #[test]
    fn scripted_scores_map_to_threshold_decisions() {
        let root = tempfile::tempdir().expect("tempdir");
        let det = detector(root.path(), StubEngineFactory::new(vec![0.1, 0.2, 0.35, 0.1]));
        det.load_blocking().expect("load");

        let decisions: Vec<bool> = (0..4)
            .map(|_| det.process_frame(&[0; 1280]).expect("frame"))
            .collect();
        assert_eq!(decisions, vec![false, false, true, false]);
    }

    #[test]
    fn score_equal_to_threshold_does_not_fire() {
        let root = tempfile::tempdir().expect("tempdir");
        let det = detector(root.path(), StubEngineFactory::new(vec![0.3]));
        det.load_blocking().expect("load");
        let scored = det.process_frame_scored(&[0; 1280]).expect("frame");
        assert!(!scored.detected);
        approx::assert_relative_eq!(scored.score, 0.3);
    }

    #[test]
    fn classifier_sees_at_most_sixteen_embeddings() {
        let root = tempfile::tempdir().expect("tempdir");
        let factory = StubEngineFactory::default();
        let det = detector(root.path(), factory.clone());
        det.load_blocking().expect("load");

        for _ in 0..20 {
            det.process_frame(&[0; 1280]).expect("frame");
        }
        let shapes = factory.classifier_input_shapes();
        assert_eq!(shapes.len(), 20);
        assert_eq!(shapes[0], vec![1, 1, 96]);
        assert_eq!(shapes[15], vec![1, 16, 96]);
        assert_eq!(shapes[19], vec![1, 16, 96]);
    }

    #[test]
    fn frame_size_mismatch_tolerated_once() {
        let root = tempfile::tempdir().expect("tempdir");
        let det = detector(root.path(), StubEngineFactory::default());
        det.load_blocking().expect("load");

        assert!(!det.process_frame(&[0; 512]).expect("first mismatch tolerated"));
        det.process_frame(&[0; 1280]).expect("good frame resets");
        assert!(!det.process_frame(&[0; 512]).expect("tolerated again"));
        assert!(matches!(
            det.process_frame(&[0; 512]),
            Err(HarkError::FrameSizeMismatch {
                expected: 1280,
                actual: 512
            })
        ));
        assert_eq!(det.stats().size_mismatches, 3);
    }

    #[test]
    fn load_failure_is_retryable() {
        let root = tempfile::tempdir().expect("tempdir");
        let det = detector(root.path(), StubEngineFactory::failing(ModelRole::Classifier));
        let mut rx = det.subscribe();

        assert!(det.load_blocking().is_err());
        assert!(matches!(det.state(), WakeDeviceState::ErrorLoading { .. }));
        assert!(det.load_blocking().is_err());

        let states = drain(&mut rx);
        assert_eq!(states.len(), 4);
        assert_eq!(states[0], WakeDeviceState::Loading);
        assert!(states[1].is_error());
        assert_eq!(states[2], WakeDeviceState::Loading);
    }

    #[test]
    fn load_without_models_is_rejected() {
        let root = tempfile::tempdir().expect("tempdir");
        let det = WakeWordDetector::new(
            DetectorConfig::default(),
            artifacts(root.path(), false),
            Arc::new(StubEngineFactory::default()),
            None,
        )
        .expect("detector");
        assert!(matches!(det.load_blocking(), Err(HarkError::ModelsUnavailable)));
        assert_eq!(det.state(), WakeDeviceState::NotDownloaded);
    }

    #[test]
    fn download_chains_into_load() {
        let root = tempfile::tempdir().expect("tempdir");
        let fetcher = Arc::new(WriteFetcher {
            fail: false,
            calls: AtomicUsize::new(0),
        });
        let det = WakeWordDetector::new(
            DetectorConfig::default(),
            artifacts(root.path(), false),
            Arc::new(StubEngineFactory::default()),
            Some(fetcher.clone() as Arc<dyn ModelFetcher>),
        )
        .expect("detector");
        let mut rx = det.subscribe();

        det.download_blocking().expect("download");
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 3);
        assert!(det.artifacts().has_local_models());
        assert_eq!(det.state(), WakeDeviceState::Loaded);

        let states = drain(&mut rx);
        assert!(matches!(states[0], WakeDeviceState::Downloading { .. }));
        let tail: Vec<_> = states.iter().rev().take(3).rev().cloned().collect();
        assert_eq!(
            tail,
            vec![
                WakeDeviceState::NotLoaded,
                WakeDeviceState::Loading,
                WakeDeviceState::Loaded
            ]
        );
    }

    #[test]
    fn download_failure_leaves_no_partial_files() {
        let root = tempfile::tempdir().expect("tempdir");
        let det = WakeWordDetector::new(
            DetectorConfig::default(),
            artifacts(root.path(), false),
            Arc::new(StubEngineFactory::default()),
            Some(Arc::new(WriteFetcher {
                fail: true,
                calls: AtomicUsize::new(0),
            })),
        )
        .expect("detector");

        assert!(matches!(det.download_blocking(), Err(HarkError::Download(_))));
        assert!(matches!(
            det.state(),
            WakeDeviceState::ErrorDownloading { .. }
        ));
        assert_eq!(det.artifacts().missing().len(), 3);
    }

    #[test]
    fn bundled_models_are_cached_on_load() {
        let root = tempfile::tempdir().expect("tempdir");
        let bundled = root.path().join("bundled");
        std::fs::create_dir_all(&bundled).expect("mkdir");
        for name in MODEL_FILES {
            std::fs::write(bundled.join(name), b"onnx").expect("write");
        }
        let det = WakeWordDetector::new(
            DetectorConfig::default(),
            artifacts(&root.path().join("cache"), false).with_bundled_dir(Some(bundled)),
            Arc::new(StubEngineFactory::default()),
            None,
        )
        .expect("detector");
        assert_eq!(det.state(), WakeDeviceState::NotLoaded);

        det.load_blocking().expect("load");
        assert!(det.artifacts().has_local_models());
        assert_eq!(det.state(), WakeDeviceState::Loaded);
    }

    #[test]
    fn destroy_releases_runtime() {
        let root = tempfile::tempdir().expect("tempdir");
        let factory = StubEngineFactory::new(vec![0.9]);
        let det = detector(root.path(), factory.clone());
        det.load_blocking().expect("load");
        assert!(det.process_frame(&[0; 1280]).expect("frame"));

        det.destroy();
        assert_eq!(det.state(), WakeDeviceState::NotLoaded);
        assert!(!det.process_frame(&[0; 1280]).expect("frame"));
        assert_eq!(factory.classifier_input_shapes().len(), 1);
    }

    struct FailingClassifier;

    impl EngineFactory for FailingClassifier {
        fn open(&self, role: ModelRole, path: &Path) -> Result<Box<dyn InferenceEngine>> {
            match role {
                ModelRole::Classifier => Ok(Box::new(FnEngine(|_: &Tensor| -> Result<Tensor> {
                    Err(HarkError::Inference("nan in graph".into()))
                }))),
                _ => StubEngineFactory::default().open(role, path),
            }
        }
    }

    #[test]
    fn inference_errors_are_counted_not_raised() {
        let root = tempfile::tempdir().expect("tempdir");
        let det = WakeWordDetector::new(
            DetectorConfig::default(),
            artifacts(root.path(), true),
            Arc::new(FailingClassifier),
            None,
        )
        .expect("detector");
        det.load_blocking().expect("load");

        assert!(!det.process_frame(&[0; 1280]).expect("frame"));
        assert!(!det.process_frame(&[0; 1280]).expect("frame"));
        assert_eq!(det.stats().inference_errors, 2);
    }

    #[tokio::test]
    async fn async_load_runs_off_thread() {
        let root = tempfile::tempdir().expect("tempdir");
        let det = detector(root.path(), StubEngineFactory::default());
        det.load().await.expect("load");
        assert_eq!(det.state(), WakeDeviceState::Loaded);
        det.load().await.expect("second load is a no-op");
    }

    /// Engines whose output follows the input level: loud audio yields high
    /// spectrogram values, embeddings average them and the classifier scores
    /// the loudest embedding it is shown.
    struct LoudnessFactory;

    impl EngineFactory for LoudnessFactory {
        fn open(&self, role: ModelRole, _path: &Path) -> Result<Box<dyn InferenceEngine>> {
            Ok(match role {
                ModelRole::MelSpectrogram => Box::new(FnEngine(|input: &Tensor| -> Result<Tensor> {
                    let data = input.data();
                    let level = data.iter().map(|v| v.abs()).sum::<f32>()
                        / data.len().max(1) as f32
                        / f32::from(i16::MAX);
                    // Undoes the `x * 0.1 + 2` rescale for a 0..1 level.
                    Tensor::new(vec![1, 1, 76, 32], vec![level * 10.0; 76 * 32])
                })),
                ModelRole::Embedding => Box::new(FnEngine(|input: &Tensor| -> Result<Tensor> {
                    let data = input.data();
                    let mean = data.iter().sum::<f32>() / data.len().max(1) as f32;
                    Tensor::new(vec![1, 1, 1, 96], vec![mean - 2.0; 96])
                })),
                ModelRole::Classifier => Box::new(FnEngine(|input: &Tensor| -> Result<Tensor> {
                    let max = input.data().iter().copied().fold(0.0f32, f32::max);
                    Ok(Tensor::row(vec![max]))
                })),
            })
        }
    }

    #[test]
    fn reset_forgets_the_wake_phrase() {
        let root = tempfile::tempdir().expect("tempdir");
        let det = WakeWordDetector::new(
            DetectorConfig::default(),
            artifacts(root.path(), true),
            Arc::new(LoudnessFactory),
            None,
        )
        .expect("detector");
        det.load_blocking().expect("load");

        let loud = [29_000i16; 1280];
        let silent = [0i16; 1280];
        let phrase: Vec<bool> = (0..30)
            .map(|_| det.process_frame(&loud).expect("frame"))
            .collect();
        assert!(phrase[0], "loud audio should fire");

        // Without a reset the classifier window still holds the phrase.
        let stale = det.clone();
        assert!(stale.process_frame(&silent).expect("frame"));

        det.reset();
        let after: Vec<bool> = (0..5)
            .map(|_| det.process_frame(&silent).expect("frame"))
            .collect();
        assert_eq!(after, vec![false; 5]);
        assert_eq!(det.state(), WakeDeviceState::Loaded);
    }

    #[test]
    fn reset_before_load_is_a_noop() {
        let root = tempfile::tempdir().expect("tempdir");
        let det = detector(root.path(), StubEngineFactory::default());
        det.reset();
        assert_eq!(det.state(), WakeDeviceState::NotLoaded);
    }

    /// Calls `process_frame` on the watched detector from inside a download
    /// or a load and records what it saw.
    #[derive(Clone, Default)]
    struct InFlightObserver {
        detector: Arc<Mutex<Option<WakeWordDetector>>>,
        seen: Arc<Mutex<Vec<(WakeDeviceState, bool)>>>,
    }

    impl InFlightObserver {
        fn observe(&self) {
            if let Some(det) = self.detector.lock().as_ref() {
                let detected = det.process_frame(&[0; 1280]).expect("frame while busy");
                self.seen.lock().push((det.state(), detected));
            }
        }
    }

    struct ObservingFactory {
        inner: StubEngineFactory,
        observer: InFlightObserver,
    }

    impl EngineFactory for ObservingFactory {
        fn open(&self, role: ModelRole, path: &Path) -> Result<Box<dyn InferenceEngine>> {
            self.observer.observe();
            self.inner.open(role, path)
        }
    }

    struct ObservingFetcher {
        observer: InFlightObserver,
    }

    impl ModelFetcher for ObservingFetcher {
        fn fetch(
            &self,
            _url: &str,
            dest: &Path,
            _progress: &mut dyn FnMut(DownloadProgress),
        ) -> Result<()> {
            self.observer.observe();
            std::fs::write(dest, b"onnx")?;
            Ok(())
        }
    }

    #[test]
    fn downloading_and_loading_never_detect() {
        let root = tempfile::tempdir().expect("tempdir");
        let observer = InFlightObserver::default();
        let factory = StubEngineFactory::new(vec![0.99]);
        let det = WakeWordDetector::new(
            DetectorConfig::default(),
            artifacts(root.path(), false),
            Arc::new(ObservingFactory {
                inner: factory.clone(),
                observer: observer.clone(),
            }),
            Some(Arc::new(ObservingFetcher {
                observer: observer.clone(),
            })),
        )
        .expect("detector");
        *observer.detector.lock() = Some(det.clone());

        det.download_blocking().expect("download");
        *observer.detector.lock() = None;

        let seen = observer.seen.lock().clone();
        assert_eq!(seen.len(), 6, "three fetches and three opens");
        assert!(seen[..3]
            .iter()
            .all(|(s, _)| matches!(s, WakeDeviceState::Downloading { .. })));
        assert!(seen[3..].iter().all(|(s, _)| *s == WakeDeviceState::Loading));
        assert!(seen.iter().all(|(_, detected)| !detected));
        assert!(factory.classifier_input_shapes().is_empty());

        // Same detector fires once it is actually loaded.
        assert!(det.process_frame(&[0; 1280]).expect("frame"));
        assert_eq!(factory.classifier_input_shapes().len(), 1);
    }

    #[test]
    fn error_states_never_detect() {
        let root = tempfile::tempdir().expect("tempdir");

        let mut failing = StubEngineFactory::failing(ModelRole::Classifier);
        failing.scores = vec![0.99];
        let load_failed = detector(&root.path().join("load"), failing.clone());
        assert!(load_failed.load_blocking().is_err());

        let download_failed = WakeWordDetector::new(
            DetectorConfig::default(),
            artifacts(&root.path().join("download"), false),
            Arc::new(StubEngineFactory::new(vec![0.99])),
            Some(Arc::new(WriteFetcher {
                fail: true,
                calls: AtomicUsize::new(0),
            })),
        )
        .expect("detector");
        assert!(download_failed.download_blocking().is_err());

        for det in [&load_failed, &download_failed] {
            assert!(det.state().is_error(), "{:?}", det.state());
            for frame in [vec![0i16; 1280], vec![1; 7]] {
                assert!(!det.process_frame(&frame).expect("no error while failed"));
            }
            assert_eq!(det.stats(), DetectorStats::default());
        }
        assert!(failing.classifier_input_shapes().is_empty());
    }
}
