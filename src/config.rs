//! Persisted application settings.
//!
//! Settings are stored as pretty-printed JSON. Every struct uses
//! `#[serde(default)]` so older or partial files still load.

use anyhow::{Context, Result};
use log::warn;
use serde::{Deserialize, Serialize};
use std::{
    env, fs,
    path::{Path, PathBuf},
};

/// The 80 class labels of the COCO dataset, in model output order.
pub const COCO_CLASSES: [&str; 80] = [
    "person", "bicycle", "car", "motorcycle", "airplane", "bus", "train", "truck", "boat",
    "traffic light", "fire hydrant", "stop sign", "parking meter", "bench", "bird", "cat", "dog",
    "horse", "sheep", "cow", "elephant", "bear", "zebra", "giraffe", "backpack", "umbrella",
    "handbag", "tie", "suitcase", "frisbee", "skis", "snowboard", "sports ball", "kite",
    "baseball bat", "baseball glove", "skateboard", "surfboard", "tennis racket", "bottle",
    "wine glass", "cup", "fork", "knife", "spoon", "bowl", "banana", "apple", "sandwich",
    "orange", "broccoli", "carrot", "hot dog", "pizza", "donut", "cake", "chair", "couch",
    "potted plant", "bed", "dining table", "toilet", "tv", "laptop", "mouse", "remote",
    "keyboard", "cell phone", "microwave", "oven", "toaster", "sink", "refrigerator", "book",
    "clock", "vase", "scissors", "teddy bear", "hair drier", "toothbrush",
];

/// Parameters for the built-in OpenCV DNN detector.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DetectorSettings {
    /// Square network input size in pixels.
    pub input_size: i32,
    /// Minimum `objectness * class score` for a box to be kept.
    pub score_threshold: f32,
    /// IoU threshold for non-maximum suppression.
    pub nms_threshold: f32,
    pub class_names: Vec<String>,
}

impl Default for DetectorSettings {
    fn default() -> Self {
        Self {
            input_size: 640,
            score_threshold: 0.25,
            nms_threshold: 0.45,
            class_names: COCO_CLASSES.iter().map(|name| name.to_string()).collect(),
        }
    }
}

/// How to invoke an external detection program.
///
/// Arguments may contain `{source}`, `{project}`, `{name}` and `{weights}`,
/// which are substituted per request.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ExternalDetectorSettings {
    pub program: String,
    pub args: Vec<String>,
}

impl Default for ExternalDetectorSettings {
    fn default() -> Self {
        let args = [
            "yolo/detect.py",
            "--source",
            "{source}",
            "--project",
            "{project}",
            "--name",
            "{name}",
            "--exist-ok",
            "--weights",
            "{weights}",
        ];
        Self {
            program: "python".to_string(),
            args: args.iter().map(|arg| arg.to_string()).collect(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AppSettings {
    /// Directory holding the model weights.
    pub model_dir: PathBuf,
    /// Currently selected model name, without extension.
    pub model: Option<String>,
    /// Model names offered in the selector.
    pub models: Vec<String>,
    /// Extension appended to the model name to locate its weights.
    pub weights_extension: String,
    /// Sub-directory of the source directory that receives annotated output.
    pub output_name: String,
    pub detector: DetectorSettings,
    pub external: ExternalDetectorSettings,
}

impl Default for AppSettings {
    fn default() -> Self {
        Self {
            model_dir: PathBuf::from("yolo"),
            model: Some("yolov5s".to_string()),
            models: ["yolov5s", "yolov5m", "yolov5l", "yolov5x"]
                .iter()
                .map(|name| name.to_string())
                .collect(),
            weights_extension: "pt".to_string(),
            output_name: "exp".to_string(),
            detector: DetectorSettings::default(),
            external: ExternalDetectorSettings::default(),
        }
    }
}

impl AppSettings {
    /// Load settings from a JSON file.
    pub fn load_from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)
            .with_context(|| format!("failed to read settings file {}", path.display()))?;
        let settings: AppSettings = serde_json::from_str(&contents)
            .with_context(|| format!("failed to parse settings JSON at {}", path.display()))?;
        Ok(settings)
    }

    /// Serialize settings to disk, overwriting any existing file.
    pub fn save_to_path<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        let payload =
            serde_json::to_string_pretty(self).context("failed to serialize settings JSON")?;
        fs::write(path, payload)
            .with_context(|| format!("failed to write settings file {}", path.display()))?;
        Ok(())
    }

    /// Path to the selected model's weights, or `None` when no model is selected.
    pub fn model_path(&self) -> Option<PathBuf> {
        let model = self.model.as_deref().map(str::trim)?;
        if model.is_empty() {
            return None;
        }
        let file_name = if self.weights_extension.is_empty() {
            model.to_string()
        } else {
            format!("{model}.{}", self.weights_extension)
        };
        Some(self.model_dir.join(file_name))
    }
}

/// Default location of the settings file (`config/detection_viewer.json`).
pub fn default_settings_path() -> PathBuf {
    env::current_dir()
        .map(|dir| dir.join("config/detection_viewer.json"))
        .unwrap_or_else(|_| PathBuf::from("config/detection_viewer.json"))
}

/// Loads settings from `path`, falling back to defaults when that fails.
pub fn load_settings(path: &Path) -> AppSettings {
    match AppSettings::load_from_path(path) {
        Ok(settings) => settings,
        Err(err) => {
            warn!(
                "Failed to load settings from {}: {err:?}. Falling back to defaults.",
                path.display()
            );
            AppSettings::default()
        }
    }
}

/// Saves settings, creating the parent directory if needed.
pub fn persist_settings(settings: &AppSettings, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
        && !parent.exists()
    {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create settings directory {}", parent.display()))?;
    }
    settings.save_to_path(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn default_model_path_points_into_model_dir() {
        let settings = AppSettings::default();
        assert_eq!(settings.model_path(), Some(PathBuf::from("yolo/yolov5s.pt")));
    }

    #[test]
    fn model_path_is_none_when_unselected() {
        let mut settings = AppSettings::default();
        settings.model = None;
        assert_eq!(settings.model_path(), None);

        settings.model = Some("  ".to_string());
        assert_eq!(settings.model_path(), None);
    }

    #[test]
    fn model_path_honours_extension() {
        let settings = AppSettings {
            model: Some("yolov5n".to_string()),
            weights_extension: "onnx".to_string(),
            ..Default::default()
        };
        assert_eq!(
            settings.model_path(),
            Some(PathBuf::from("yolo/yolov5n.onnx"))
        );
    }

    #[test]
    fn persisted_settings_load_back() {
        let temp = tempdir().expect("tempdir");
        let path = temp.path().join("nested").join("settings.json");

        let mut settings = AppSettings::default();
        settings.model = Some("yolov5x".to_string());
        settings.detector.score_threshold = 0.6;
        persist_settings(&settings, &path).expect("persist settings");

        let loaded = AppSettings::load_from_path(&path).expect("load settings");
        assert_eq!(loaded, settings);
    }

    #[test]
    fn partial_file_uses_defaults_for_missing_fields() {
        let temp = tempdir().expect("tempdir");
        let path = temp.path().join("settings.json");
        fs::write(&path, r#"{ "model": "yolov5m" }"#).expect("write settings");

        let loaded = load_settings(&path);
        assert_eq!(loaded.model.as_deref(), Some("yolov5m"));
        assert_eq!(loaded.output_name, "exp");
        assert_eq!(loaded.detector.class_names.len(), 80);
    }

    #[test]
    fn corrupt_file_falls_back_to_defaults() {
        let temp = tempdir().expect("tempdir");
        let path = temp.path().join("settings.json");
        fs::write(&path, "{ not json").expect("write settings");

        assert_eq!(load_settings(&path), AppSettings::default());
    }

    #[test]
    fn missing_file_falls_back_to_defaults() {
        let temp = tempdir().expect("tempdir");
        let loaded = load_settings(&temp.path().join("absent.json"));
        assert_eq!(loaded, AppSettings::default());
    }
}
