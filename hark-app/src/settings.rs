//! Persistent listener settings (JSON file in the app data directory).

use std::fs;
use std::path::{Path, PathBuf};

use hark_core::WakeDeviceKind;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[serde(default)]
pub struct AppSettings {
    pub preferred_input_device: Option<String>,
    pub wake_device: WakeDeviceKind,
    /// Detection fires when the classifier score is strictly above this.
    pub threshold: f32,
    /// Overrides `HARK_MODEL_DIR` and the platform default.
    pub model_dir: Option<String>,
    /// Classifier imported for the custom wake device at startup.
    pub custom_classifier_path: Option<String>,
    pub wake_detected_timeout_ms: u64,
    pub max_backlog_frames: usize,
    pub ort_intra_threads: usize,
}

impl Default for AppSettings {
    fn default() -> Self {
        Self {
            preferred_input_device: None,
            wake_device: WakeDeviceKind::OpenWakeWord,
            threshold: 0.3,
            model_dir: None,
            custom_classifier_path: None,
            wake_detected_timeout_ms: 8_000,
            max_backlog_frames: 8,
            ort_intra_threads: 1,
        }
    }
}

impl AppSettings {
    pub fn normalize(&mut self) {
        if !self.threshold.is_finite() {
            self.threshold = 0.3;
        }
        self.threshold = self.threshold.clamp(0.01, 0.99);
        self.wake_detected_timeout_ms = self.wake_detected_timeout_ms.clamp(1_000, 60_000);
        self.max_backlog_frames = self.max_backlog_frames.clamp(1, 64);
        self.ort_intra_threads = self.ort_intra_threads.clamp(1, 8);
        self.preferred_input_device = trimmed(self.preferred_input_device.take());
        self.model_dir = trimmed(self.model_dir.take());
        self.custom_classifier_path = trimmed(self.custom_classifier_path.take());
    }

    pub fn model_root(&self) -> Option<PathBuf> {
        self.model_dir.as_ref().map(PathBuf::from)
    }
}

fn trimmed(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// Export settings the core reads from the environment, unless the user
/// already set them.
pub fn apply_runtime_env_from_settings(settings: &AppSettings) {
    if std::env::var("HARK_ORT_INTRA_THREADS").is_err() {
        std::env::set_var(
            "HARK_ORT_INTRA_THREADS",
            settings.ort_intra_threads.to_string(),
        );
    }
}

pub fn default_settings_path() -> PathBuf {
    #[cfg(target_os = "windows")]
    {
        std::env::var_os("APPDATA")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("."))
            .join("Hark")
            .join("settings.json")
    }
    #[cfg(not(target_os = "windows"))]
    {
        std::env::var_os("XDG_DATA_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|| {
                std::env::var_os("HOME")
                    .map(PathBuf::from)
                    .unwrap_or_else(|| PathBuf::from("/tmp"))
                    .join(".local")
                    .join("share")
            })
            .join("hark")
            .join("settings.json")
    }
}

/// Missing or malformed files fall back to defaults.
pub fn load_settings(path: &Path) -> AppSettings {
    let mut settings = fs::read_to_string(path)
        .ok()
        .and_then(|raw| serde_json::from_str::<AppSettings>(&raw).ok())
        .unwrap_or_default();
    settings.normalize();
    settings
}

/// Like [`load_settings`], but writes the defaults out when no file exists
/// yet so there is something to edit.
pub fn load_or_init_settings(path: &Path) -> AppSettings {
    let settings = load_settings(path);
    if !path.exists() {
        match save_settings(path, &settings) {
            Ok(()) => info!(path = %path.display(), "wrote default settings"),
            Err(e) => warn!(path = %path.display(), error = %e, "could not write default settings"),
        }
    }
    settings
}

pub fn save_settings(path: &Path, settings: &AppSettings) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let json = serde_json::to_string_pretty(settings).map_err(std::io::Error::other)?;
    fs::write(path, json)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_file_keeps_defaults_for_missing_fields() {
        let settings: AppSettings =
            serde_json::from_str(r#"{"wakeDevice":"disabled","threshold":0.5}"#).expect("parse");
        assert_eq!(settings.wake_device, WakeDeviceKind::Disabled);
        assert_eq!(settings.threshold, 0.5);
        assert_eq!(settings.wake_detected_timeout_ms, 8_000);
    }

    #[test]
    fn normalize_clamps_and_trims() {
        let mut settings = AppSettings {
            threshold: 4.0,
            max_backlog_frames: 0,
            preferred_input_device: Some("  ".into()),
            model_dir: Some(" /opt/hark ".into()),
            ..AppSettings::default()
        };
        settings.normalize();
        assert_eq!(settings.threshold, 0.99);
        assert_eq!(settings.max_backlog_frames, 1);
        assert_eq!(settings.preferred_input_device, None);
        assert_eq!(settings.model_root(), Some(PathBuf::from("/opt/hark")));
    }

    #[test]
    fn save_then_load_restores_settings() {
        let dir = std::env::temp_dir().join(format!("hark-settings-{}", std::process::id()));
        let path = dir.join("settings.json");
        let settings = AppSettings {
            wake_device: WakeDeviceKind::CustomOpenWakeWord,
            custom_classifier_path: Some("/tmp/word.onnx".into()),
            ..AppSettings::default()
        };
        save_settings(&path, &settings).expect("save");
        assert_eq!(load_settings(&path), settings);
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn first_run_writes_defaults_and_keeps_edits() {
        let dir = std::env::temp_dir().join(format!("hark-init-settings-{}", std::process::id()));
        let path = dir.join("nested").join("settings.json");
        let _ = fs::remove_dir_all(&dir);

        assert_eq!(load_or_init_settings(&path), AppSettings::default());
        assert!(path.exists());

        fs::write(&path, r#"{"threshold":0.6}"#).expect("edit");
        assert_eq!(load_or_init_settings(&path).threshold, 0.6);
        let raw = fs::read_to_string(&path).expect("read");
        assert_eq!(raw, r#"{"threshold":0.6}"#, "existing file is left alone");
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn malformed_file_falls_back_to_defaults() {
        let dir = std::env::temp_dir().join(format!("hark-bad-settings-{}", std::process::id()));
        fs::create_dir_all(&dir).expect("mkdir");
        let path = dir.join("settings.json");
        fs::write(&path, "{not json").expect("write");
        assert_eq!(load_settings(&path), AppSettings::default());
        let _ = fs::remove_dir_all(dir);
    }
}
