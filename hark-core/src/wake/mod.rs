//! Wake-word devices: lifecycle, model artifacts, detection and selection.

pub mod artifacts;
pub mod detector;
pub mod device;
pub mod fetch;
pub mod registry;
pub mod state;

pub use artifacts::{ModelArtifacts, ModelFile};
pub use detector::{DetectorConfig, DetectorStats, ScoredFrame, WakeWordDetector};
pub use device::{DisabledDevice, WakeDevice, WakeDeviceKind};
pub use fetch::ModelFetcher;
pub use registry::{DeviceBuilder, RegistryConfig, WakeDeviceRegistry};
pub use state::{DownloadProgress, WakeDeviceState};

#[cfg(feature = "download")]
pub use fetch::HttpFetcher;
