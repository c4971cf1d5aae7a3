use serde::{Deserialize, Serialize};

/// Bytes fetched so far for an in-flight model download.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DownloadProgress {
    pub downloaded_bytes: u64,
    /// `None` when the server sent no content length.
    pub total_bytes: Option<u64>,
}

impl DownloadProgress {
    /// Completed fraction in [0, 1], if the total is known.
    pub fn fraction(&self) -> Option<f32> {
        match self.total_bytes {
            Some(0) => Some(1.0),
            Some(total) => Some((self.downloaded_bytes as f64 / total as f64).min(1.0) as f32),
            None => None,
        }
    }
}

/// Lifecycle of one wake device.
///
/// ```text
/// NotDownloaded ─download()─► Downloading ─┬─► NotLoaded ─load()─► Loading ─┬─► Loaded
///                                           └─► ErrorDownloading            └─► ErrorLoading
/// ```
///
/// Every error state can be retried; none is terminal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum WakeDeviceState {
    NotDownloaded,
    NotLoaded,
    Downloading { progress: DownloadProgress },
    Loading,
    Loaded,
    ErrorDownloading { cause: String },
    ErrorLoading { cause: String },
}

impl WakeDeviceState {
    pub fn is_loaded(&self) -> bool {
        matches!(self, WakeDeviceState::Loaded)
    }

    pub fn is_error(&self) -> bool {
        self.error_cause().is_some()
    }

    pub fn error_cause(&self) -> Option<&str> {
        match self {
            WakeDeviceState::ErrorDownloading { cause } | WakeDeviceState::ErrorLoading { cause } => {
                Some(cause)
            }
            _ => None,
        }
    }

    /// A download or load is running on a background task.
    pub fn is_busy(&self) -> bool {
        matches!(
            self,
            WakeDeviceState::Downloading { .. } | WakeDeviceState::Loading
        )
    }
}
