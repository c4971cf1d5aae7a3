//! Model file locations for one wake implementation.
//!
//! Each implementation needs three files. They are looked up in a writable
//! cache directory first; a read-only bundled directory (shipped next to the
//! binary) can seed the cache, and missing files with a known URL can be
//! downloaded.

use std::fs;
use std::path::{Path, PathBuf};

use tracing::{debug, info};

use crate::{
    error::{HarkError, Result},
    inference::ModelRole,
};

const OWW_RELEASE: &str = "https://github.com/dscripka/openWakeWord/releases/download/v0.5.1";

/// File name the custom implementation expects for an imported classifier.
pub const CUSTOM_CLASSIFIER_FILE: &str = "custom_wake_word.onnx";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelFile {
    pub file_name: String,
    /// Download source; `None` for files that must be provided locally.
    pub url: Option<String>,
}

impl ModelFile {
    fn release(file_name: &str) -> Self {
        Self {
            file_name: file_name.to_string(),
            url: Some(format!("{OWW_RELEASE}/{file_name}")),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ModelArtifacts {
    pub cache_dir: PathBuf,
    pub bundled_dir: Option<PathBuf>,
    pub melspectrogram: ModelFile,
    pub embedding: ModelFile,
    pub classifier: ModelFile,
}

impl ModelArtifacts {
    /// Stock openWakeWord models ("hey jarvis") under `root/openwakeword`.
    pub fn openwakeword(root: &Path) -> Self {
        Self {
            cache_dir: root.join("openwakeword"),
            bundled_dir: bundled_models_dir().map(|d| d.join("openwakeword")),
            melspectrogram: ModelFile::release("melspectrogram.onnx"),
            embedding: ModelFile::release("embedding_model.onnx"),
            classifier: ModelFile::release("hey_jarvis_v0.1.onnx"),
        }
    }

    /// Same front-end models with a user-supplied classifier.
    pub fn custom(root: &Path) -> Self {
        Self {
            cache_dir: root.join("custom_openwakeword"),
            bundled_dir: None,
            melspectrogram: ModelFile::release("melspectrogram.onnx"),
            embedding: ModelFile::release("embedding_model.onnx"),
            classifier: ModelFile {
                file_name: CUSTOM_CLASSIFIER_FILE.to_string(),
                url: None,
            },
        }
    }

    pub fn with_bundled_dir(mut self, dir: Option<PathBuf>) -> Self {
        self.bundled_dir = dir;
        self
    }

    pub fn files(&self) -> [(ModelRole, &ModelFile); 3] {
        [
            (ModelRole::MelSpectrogram, &self.melspectrogram),
            (ModelRole::Embedding, &self.embedding),
            (ModelRole::Classifier, &self.classifier),
        ]
    }

    pub fn file(&self, role: ModelRole) -> &ModelFile {
        match role {
            ModelRole::MelSpectrogram => &self.melspectrogram,
            ModelRole::Embedding => &self.embedding,
            ModelRole::Classifier => &self.classifier,
        }
    }

    /// Cache path of the model serving `role`.
    pub fn path(&self, role: ModelRole) -> PathBuf {
        self.cache_dir.join(&self.file(role).file_name)
    }

    /// Roles whose file is absent from the cache.
    pub fn missing(&self) -> Vec<ModelRole> {
        self.files()
            .into_iter()
            .filter(|(role, _)| !self.path(*role).is_file())
            .map(|(role, _)| role)
            .collect()
    }

    pub fn has_local_models(&self) -> bool {
        self.missing().is_empty()
    }

    /// The bundled dir holds the complete file set.
    pub fn has_bundled_models(&self) -> bool {
        let Some(bundled) = self.bundled_dir.as_deref() else {
            return false;
        };
        self.files()
            .iter()
            .all(|(_, file)| bundled.join(&file.file_name).is_file())
    }

    /// Copy bundled files into the cache, skipping those already cached.
    /// Returns the number of files copied.
    ///
    /// # Errors
    /// `ModelsUnavailable` without a bundled dir; I/O errors from the copy.
    pub fn copy_bundled_to_cache(&self) -> Result<usize> {
        let bundled = self
            .bundled_dir
            .as_deref()
            .ok_or(HarkError::ModelsUnavailable)?;
        fs::create_dir_all(&self.cache_dir)?;

        let mut copied = 0;
        for role in self.missing() {
            let name = &self.file(role).file_name;
            let src = bundled.join(name);
            if !src.is_file() {
                return Err(HarkError::ModelNotFound { path: src });
            }
            let dest = self.path(role);
            let part = dest.with_extension("onnx.part");
            fs::copy(&src, &part)?;
            fs::rename(&part, &dest)?;
            debug!(%role, from = %src.display(), to = %dest.display(), "copied bundled model");
            copied += 1;
        }
        if copied > 0 {
            info!(copied, cache = %self.cache_dir.display(), "bundled wake models cached");
        }
        Ok(copied)
    }

    /// Install a user-provided classifier into the cache.
    ///
    /// # Errors
    /// `ModelNotFound` if `src` does not exist; I/O errors from the copy.
    pub fn import_classifier(&self, src: &Path) -> Result<PathBuf> {
        if !src.is_file() {
            return Err(HarkError::ModelNotFound {
                path: src.to_path_buf(),
            });
        }
        fs::create_dir_all(&self.cache_dir)?;
        let dest = self.path(ModelRole::Classifier);
        fs::copy(src, &dest)?;
        info!(from = %src.display(), to = %dest.display(), "classifier imported");
        Ok(dest)
    }
}

/// `HARK_MODEL_DIR` if set, else the platform data directory.
pub fn selected_models_dir() -> PathBuf {
    if let Ok(explicit) = std::env::var("HARK_MODEL_DIR") {
        if !explicit.trim().is_empty() {
            return PathBuf::from(explicit.trim());
        }
    }
    default_models_dir()
}

/// `HARK_BUNDLED_MODEL_DIR`, when set and non-empty.
pub fn bundled_models_dir() -> Option<PathBuf> {
    std::env::var("HARK_BUNDLED_MODEL_DIR")
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .map(PathBuf::from)
}

pub fn default_models_dir() -> PathBuf {
    #[cfg(target_os = "windows")]
    {
        std::env::var_os("APPDATA")
            .map(|p| PathBuf::from(p).join("Hark").join("models"))
            .unwrap_or_else(|| PathBuf::from("models"))
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
            .join("models")
    }
}
