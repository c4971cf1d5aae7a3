use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::{
    error::Result,
    wake::{
        detector::{DetectorStats, ScoredFrame, WakeWordDetector},
        state::WakeDeviceState,
    },
};

/// Frame size reported by devices that run no model.
pub const DISABLED_FRAME_SIZE: usize = 1280;

/// Configured wake technology.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WakeDeviceKind {
    /// No wake detection; the microphone is only used for explicit recognition.
    Disabled,
    /// Stock openWakeWord models.
    #[default]
    OpenWakeWord,
    /// openWakeWord front-end with a user-imported classifier.
    CustomOpenWakeWord,
}

impl std::fmt::Display for WakeDeviceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            WakeDeviceKind::Disabled => "disabled",
            WakeDeviceKind::OpenWakeWord => "openwakeword",
            WakeDeviceKind::CustomOpenWakeWord => "customopenwakeword",
        })
    }
}

/// Placeholder device: never loads, never detects.
#[derive(Debug)]
pub struct DisabledDevice {
    state_tx: broadcast::Sender<WakeDeviceState>,
}

impl Default for DisabledDevice {
    fn default() -> Self {
        let (state_tx, _) = broadcast::channel(1);
        Self { state_tx }
    }
}

/// A concrete wake implementation, resolved once per configuration change.
#[derive(Debug)]
pub enum WakeDevice {
    Disabled(DisabledDevice),
    OpenWakeWord(WakeWordDetector),
    CustomOpenWakeWord(WakeWordDetector),
}

impl WakeDevice {
    pub fn kind(&self) -> WakeDeviceKind {
        match self {
            WakeDevice::Disabled(_) => WakeDeviceKind::Disabled,
            WakeDevice::OpenWakeWord(_) => WakeDeviceKind::OpenWakeWord,
            WakeDevice::CustomOpenWakeWord(_) => WakeDeviceKind::CustomOpenWakeWord,
        }
    }

    pub fn detector(&self) -> Option<&WakeWordDetector> {
        match self {
            WakeDevice::Disabled(_) => None,
            WakeDevice::OpenWakeWord(d) | WakeDevice::CustomOpenWakeWord(d) => Some(d),
        }
    }

    pub fn state(&self) -> WakeDeviceState {
        self.detector()
            .map_or(WakeDeviceState::NotLoaded, WakeWordDetector::state)
    }

    /// Lifecycle changes. A disabled device never publishes.
    pub fn subscribe(&self) -> broadcast::Receiver<WakeDeviceState> {
        match self {
            WakeDevice::Disabled(d) => d.state_tx.subscribe(),
            WakeDevice::OpenWakeWord(d) | WakeDevice::CustomOpenWakeWord(d) => d.subscribe(),
        }
    }

    /// # Errors
    /// See [`WakeWordDetector::download_blocking`].
    pub async fn download(&self) -> Result<()> {
        match self.detector() {
            Some(d) => d.download().await,
            None => Ok(()),
        }
    }

    /// # Errors
    /// See [`WakeWordDetector::load_blocking`].
    pub async fn load(&self) -> Result<()> {
        match self.detector() {
            Some(d) => d.load().await,
            None => Ok(()),
        }
    }

    /// # Errors
    /// See [`WakeWordDetector::process_frame_scored`].
    pub fn process_frame(&self, frame: &[i16]) -> Result<bool> {
        Ok(self.process_frame_scored(frame)?.detected)
    }

    /// # Errors
    /// See [`WakeWordDetector::process_frame_scored`].
    pub fn process_frame_scored(&self, frame: &[i16]) -> Result<ScoredFrame> {
        match self.detector() {
            Some(d) => d.process_frame_scored(frame),
            None => Ok(ScoredFrame::default()),
        }
    }

    pub fn frame_size(&self) -> usize {
        self.detector()
            .map_or(DISABLED_FRAME_SIZE, WakeWordDetector::frame_size)
    }

    pub fn stats(&self) -> DetectorStats {
        self.detector()
            .map(WakeWordDetector::stats)
            .unwrap_or_default()
    }

    /// See [`WakeWordDetector::reset`].
    pub fn reset(&self) {
        if let Some(d) = self.detector() {
            d.reset();
        }
    }

    pub fn destroy(&self) {
        if let Some(d) = self.detector() {
            d.destroy();
        }
    }
}
