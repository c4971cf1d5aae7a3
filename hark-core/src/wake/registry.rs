//! Resolves the configured [`WakeDeviceKind`] to a live device and swaps it
//! at runtime.
//!
//! Each selection bumps a generation counter. The forwarder task that relays
//! device lifecycle changes into the arbiter checks the generation before
//! every relay, so a torn-down device can never overwrite the state of its
//! replacement.

use std::path::Path;
use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::{
    arbiter::ArbiterHandle,
    error::Result,
    inference::EngineFactory,
    ipc::events::WakeDeviceStateEvent,
    wake::{
        artifacts::ModelArtifacts,
        detector::{DetectorConfig, WakeWordDetector},
        device::{DisabledDevice, WakeDevice, WakeDeviceKind},
        fetch::ModelFetcher,
        state::WakeDeviceState,
    },
};

/// Everything needed to construct any kind of wake device.
#[derive(Clone)]
pub struct DeviceBuilder {
    pub detector: DetectorConfig,
    pub factory: Arc<dyn EngineFactory>,
    pub fetcher: Option<Arc<dyn ModelFetcher>>,
    pub builtin: ModelArtifacts,
    pub custom: ModelArtifacts,
}

impl DeviceBuilder {
    /// Builder with default detector settings and artifacts under `models_root`.
    pub fn new(
        models_root: &Path,
        factory: Arc<dyn EngineFactory>,
        fetcher: Option<Arc<dyn ModelFetcher>>,
    ) -> Self {
        Self {
            detector: DetectorConfig::default(),
            factory,
            fetcher,
            builtin: ModelArtifacts::openwakeword(models_root),
            custom: ModelArtifacts::custom(models_root),
        }
    }

    /// # Errors
    /// Returns `HarkError::InvalidConfig` if the detector config is invalid.
    pub fn build(&self, kind: WakeDeviceKind) -> Result<WakeDevice> {
        let detector = |artifacts: &ModelArtifacts| {
            WakeWordDetector::new(
                self.detector.clone(),
                artifacts.clone(),
                Arc::clone(&self.factory),
                self.fetcher.clone(),
            )
        };
        Ok(match kind {
            WakeDeviceKind::Disabled => WakeDevice::Disabled(DisabledDevice::default()),
            WakeDeviceKind::OpenWakeWord => WakeDevice::OpenWakeWord(detector(&self.builtin)?),
            WakeDeviceKind::CustomOpenWakeWord => {
                WakeDevice::CustomOpenWakeWord(detector(&self.custom)?)
            }
        })
    }
}

#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// Bounded wait for the old device to release its sessions. Default: 2 s.
    pub teardown_timeout: Duration,
    /// Buffered device-state events for slow subscribers. Default: 64.
    pub event_capacity: usize,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            teardown_timeout: Duration::from_secs(2),
            event_capacity: 64,
        }
    }
}

pub struct WakeDeviceRegistry {
    builder: DeviceBuilder,
    arbiter: ArbiterHandle,
    config: RegistryConfig,
    current: RwLock<Arc<WakeDevice>>,
    generation: Arc<AtomicU64>,
    forwarder: Mutex<Option<JoinHandle<()>>>,
    device_tx: broadcast::Sender<WakeDeviceStateEvent>,
    select_lock: tokio::sync::Mutex<()>,
}

impl WakeDeviceRegistry {
    /// Start with a disabled device. Must be called inside a tokio runtime.
    pub fn new(builder: DeviceBuilder, arbiter: ArbiterHandle, config: RegistryConfig) -> Self {
        let (device_tx, _) = broadcast::channel(config.event_capacity.max(1));
        let initial = Arc::new(WakeDevice::Disabled(DisabledDevice::default()));
        let registry = Self {
            builder,
            arbiter,
            config,
            current: RwLock::new(Arc::clone(&initial)),
            generation: Arc::new(AtomicU64::new(0)),
            forwarder: Mutex::new(None),
            device_tx,
            select_lock: tokio::sync::Mutex::new(()),
        };
        registry.restart_forwarder(initial, 0);
        registry
    }

    /// Active device. Callers hold the `Arc` only for the duration of one frame.
    pub fn current(&self) -> Arc<WakeDevice> {
        self.current.read().clone()
    }

    pub fn kind(&self) -> WakeDeviceKind {
        self.current.read().kind()
    }

    pub fn frame_size(&self) -> usize {
        self.current.read().frame_size()
    }

    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    pub fn builder(&self) -> &DeviceBuilder {
        &self.builder
    }

    pub fn subscribe(&self) -> broadcast::Receiver<WakeDeviceStateEvent> {
        self.device_tx.subscribe()
    }

    /// Switch to `kind`, tear the previous device down, and start loading the
    /// new one if its models are present.
    ///
    /// Selecting the active kind again only retries a pending or failed load.
    ///
    /// # Errors
    /// Returns an error only if the new device cannot be constructed; load
    /// failures surface through the device lifecycle instead.
    pub async fn select(&self, kind: WakeDeviceKind) -> Result<()> {
        let _serial = self.select_lock.lock().await;

        if self.kind() == kind {
            self.load_current().await;
            return Ok(());
        }

        let device = Arc::new(self.builder.build(kind)?);
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let old = std::mem::replace(&mut *self.current.write(), Arc::clone(&device));
        self.restart_forwarder(device, generation);
        info!(from = %old.kind(), to = %kind, generation, "wake device selected");

        self.teardown(old).await;
        self.load_current().await;
        Ok(())
    }

    /// Download (then load) the active device's models.
    ///
    /// # Errors
    /// See [`WakeWordDetector::download_blocking`].
    pub async fn download(&self) -> Result<()> {
        self.current().download().await
    }

    async fn load_current(&self) {
        let device = self.current();
        if !matches!(
            device.state(),
            WakeDeviceState::NotLoaded | WakeDeviceState::ErrorLoading { .. }
        ) {
            return;
        }
        if let Err(e) = device.load().await {
            warn!(kind = %device.kind(), error = %e, "wake device load failed");
        }
    }

    async fn teardown(&self, old: Arc<WakeDevice>) {
        let kind = old.kind();
        let task = tokio::task::spawn_blocking(move || old.destroy());
        match tokio::time::timeout(self.config.teardown_timeout, task).await {
            Ok(Ok(())) => debug!(%kind, "previous wake device released"),
            Ok(Err(e)) => warn!(%kind, error = %e, "wake device teardown task failed"),
            Err(_) => warn!(
                %kind,
                timeout_ms = self.config.teardown_timeout.as_millis() as u64,
                "wake device teardown timed out; abandoning it"
            ),
        }
    }

    fn restart_forwarder(&self, device: Arc<WakeDevice>, generation: u64) {
        // Subscribe before snapshotting so no transition falls in between.
        let mut rx = device.subscribe();
        let kind = device.kind();
        let arbiter = self.arbiter.clone();
        let device_tx = self.device_tx.clone();
        let current_generation = Arc::clone(&self.generation);

        let publish = move |state: WakeDeviceState| {
            arbiter.report_wake(state.clone());
            let _ = device_tx.send(WakeDeviceStateEvent { kind, state });
        };
        publish(device.state());

        let task = tokio::spawn(async move {
            loop {
                let state = match rx.recv().await {
                    Ok(state) => state,
                    Err(RecvError::Lagged(skipped)) => {
                        debug!(skipped, %kind, "device state forwarder lagged; resyncing");
                        device.state()
                    }
                    Err(RecvError::Closed) => break,
                };
                if current_generation.load(Ordering::SeqCst) != generation {
                    break;
                }
                publish(state);
            }
        });

        if let Some(previous) = self.forwarder.lock().replace(task) {
            previous.abort();
        }
    }
}

impl Drop for WakeDeviceRegistry {
    fn drop(&mut self) {
        if let Some(task) = self.forwarder.lock().take() {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arbiter::{ArbiterConfig, PipelineState};
    use crate::inference::stub::StubEngineFactory;

    const MODEL_FILES: [&str; 3] = [
        "melspectrogram.onnx",
        "embedding_model.onnx",
        "hey_jarvis_v0.1.onnx",
    ];

    fn builder(root: &Path) -> DeviceBuilder {
        let mut builder = DeviceBuilder::new(root, Arc::new(StubEngineFactory::default()), None);
        builder.builtin = builder.builtin.with_bundled_dir(None);
        std::fs::create_dir_all(&builder.builtin.cache_dir).expect("mkdir");
        for name in MODEL_FILES {
            std::fs::write(builder.builtin.cache_dir.join(name), b"onnx").expect("write");
        }
        builder
    }

    async fn wait_for(arbiter: &ArbiterHandle, want: PipelineState) {
        tokio::time::timeout(Duration::from_secs(2), async {
            while arbiter.state() != want {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap_or_else(|_| panic!("arbiter never reached {want:?}; at {:?}", arbiter.state()));
    }

    #[tokio::test]
    async fn selecting_a_detector_loads_it_and_informs_arbiter() {
        let root = tempfile::tempdir().expect("tempdir");
        let (arbiter, _task) = ArbiterHandle::spawn(ArbiterConfig::default());
        let registry =
            WakeDeviceRegistry::new(builder(root.path()), arbiter.clone(), RegistryConfig::default());
        let mut events = registry.subscribe();

        registry.select(WakeDeviceKind::OpenWakeWord).await.expect("select");
        assert_eq!(registry.kind(), WakeDeviceKind::OpenWakeWord);
        assert_eq!(registry.current().state(), WakeDeviceState::Loaded);
        wait_for(&arbiter, PipelineState::WakeListening).await;

        let mut seen = Vec::new();
        while let Ok(event) = events.try_recv() {
            assert_eq!(event.kind, WakeDeviceKind::OpenWakeWord);
            seen.push(event.state);
        }
        assert_eq!(seen.first(), Some(&WakeDeviceState::NotLoaded));
        assert_eq!(seen.last(), Some(&WakeDeviceState::Loaded));
    }

    #[tokio::test]
    async fn swap_tears_down_old_device_and_ignores_its_updates() {
        let root = tempfile::tempdir().expect("tempdir");
        let (arbiter, _task) = ArbiterHandle::spawn(ArbiterConfig::default());
        let registry =
            WakeDeviceRegistry::new(builder(root.path()), arbiter.clone(), RegistryConfig::default());

        registry.select(WakeDeviceKind::OpenWakeWord).await.expect("select");
        let old = registry.current();
        let old_detector = old.detector().expect("detector").clone();
        wait_for(&arbiter, PipelineState::WakeListening).await;

        registry.select(WakeDeviceKind::Disabled).await.expect("select");
        assert_eq!(registry.generation(), 2);
        assert_eq!(old_detector.state(), WakeDeviceState::NotLoaded);
        wait_for(&arbiter, PipelineState::Idle).await;

        // The abandoned detector loading again must not leak into the arbiter.
        old_detector.load_blocking().expect("reload");
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(arbiter.state(), PipelineState::Idle);
    }

    #[tokio::test]
    async fn swap_tolerates_one_frame_sliced_for_previous_device() {
        let root = tempfile::tempdir().expect("tempdir");
        let (arbiter, _task) = ArbiterHandle::spawn(ArbiterConfig::default());
        let mut builder = builder(root.path());
        builder.detector.frame_size = 640;
        let registry = WakeDeviceRegistry::new(builder, arbiter, RegistryConfig::default());

        let old = registry.current();
        assert_eq!(old.kind(), WakeDeviceKind::Disabled);
        let stale = vec![0i16; old.frame_size()];
        assert_eq!(stale.len(), 1280);

        registry.select(WakeDeviceKind::OpenWakeWord).await.expect("select");
        let new = registry.current();
        assert_eq!(new.state(), WakeDeviceState::Loaded);
        assert_eq!(registry.frame_size(), 640);

        assert!(!new.process_frame(&stale).expect("first stale frame tolerated"));
        assert!(matches!(
            new.process_frame(&stale),
            Err(crate::error::HarkError::FrameSizeMismatch {
                expected: 640,
                actual: 1280
            })
        ));
        new.process_frame(&vec![0; registry.frame_size()])
            .expect("correctly sized frame");
        assert_eq!(new.stats().size_mismatches, 2);
    }

    #[tokio::test]
    async fn custom_device_without_classifier_stays_unloaded() {
        let root = tempfile::tempdir().expect("tempdir");
        let (arbiter, _task) = ArbiterHandle::spawn(ArbiterConfig::default());
        let registry =
            WakeDeviceRegistry::new(builder(root.path()), arbiter.clone(), RegistryConfig::default());

        registry
            .select(WakeDeviceKind::CustomOpenWakeWord)
            .await
            .expect("select");
        assert_eq!(registry.current().state(), WakeDeviceState::NotDownloaded);
        assert_eq!(arbiter.state(), PipelineState::Idle);
    }

    #[tokio::test]
    async fn reselecting_same_kind_keeps_device() {
        let root = tempfile::tempdir().expect("tempdir");
        let (arbiter, _task) = ArbiterHandle::spawn(ArbiterConfig::default());
        let registry =
            WakeDeviceRegistry::new(builder(root.path()), arbiter, RegistryConfig::default());

        registry.select(WakeDeviceKind::OpenWakeWord).await.expect("select");
        let first = registry.current();
        registry.select(WakeDeviceKind::OpenWakeWord).await.expect("select");
        assert!(Arc::ptr_eq(&first, &registry.current()));
        assert_eq!(registry.generation(), 1);
    }
}
