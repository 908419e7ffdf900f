//! The boundary between the viewer and whatever performs detection.

use crate::{config::AppSettings, dnn::DnnDetector, external::CommandDetector};
use std::{
    io,
    path::{Path, PathBuf},
    sync::Arc,
};
use thiserror::Error;

/// The kind of media a detection job works on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaKind {
    Image,
    Video,
}

impl MediaKind {
    /// File extensions accepted by the file dialog.
    pub fn extensions(self) -> &'static [&'static str] {
        match self {
            MediaKind::Image => &["jpg", "png", "jpeg"],
            MediaKind::Video => &["mp4", "avi"],
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            MediaKind::Image => "image",
            MediaKind::Video => "video",
        }
    }

    /// Alert shown when the file dialog is cancelled.
    pub fn cancel_alert(self) -> &'static str {
        match self {
            MediaKind::Image => "Please select an image!",
            MediaKind::Video => "Please select a video!",
        }
    }

    pub fn dialog_title(self) -> &'static str {
        match self {
            MediaKind::Image => "Select image",
            MediaKind::Video => "Select video",
        }
    }

    /// Guess the kind from a file extension, ignoring case.
    pub fn from_path(path: &Path) -> Option<Self> {
        let ext = path.extension()?.to_str()?.to_ascii_lowercase();
        [MediaKind::Image, MediaKind::Video]
            .into_iter()
            .find(|kind| kind.extensions().contains(&ext.as_str()))
    }
}

#[derive(Debug, Error)]
pub enum DetectionError {
    #[error("source path has no file name: {}", .0.display())]
    NoFileName(PathBuf),
    #[error("model weights not found: {}", .0.display())]
    WeightsNotFound(PathBuf),
    #[error("failed to launch detector `{program}`: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },
    #[error("detector exited with {status}: {stderr}")]
    Failed { status: String, stderr: String },
    #[error("detector produced no output at {}", .0.display())]
    MissingOutput(PathBuf),
    #[error("cannot read media file {}", .0.display())]
    Unreadable(PathBuf),
    #[error("cannot write output file {}", .0.display())]
    Unwritable(PathBuf),
    #[error("failed to prepare output directory {}: {source}", .path.display())]
    OutputDir {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("OpenCV error: {0}")]
    OpenCV(#[from] opencv::Error),
    #[error("unexpected model output: {0}")]
    ModelOutput(String),
}

/// Everything a detector needs to process one file.
#[derive(Debug, Clone, PartialEq)]
pub struct DetectionRequest {
    pub source: PathBuf,
    /// Directory that receives the output sub-directory.
    pub project_dir: PathBuf,
    /// Name of the output sub-directory, `exp` by default.
    pub output_name: String,
    pub weights: PathBuf,
}

impl DetectionRequest {
    /// Creates a request whose output lands next to the source file.
    pub fn new(source: impl Into<PathBuf>, weights: impl Into<PathBuf>, output_name: &str) -> Self {
        let source = source.into();
        let project_dir = source
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_default();
        Self {
            source,
            project_dir,
            output_name: output_name.to_string(),
            weights: weights.into(),
        }
    }

    /// Directory the detector writes into.
    pub fn output_dir(&self) -> PathBuf {
        self.project_dir.join(&self.output_name)
    }

    /// Where the annotated copy of the source is expected.
    pub fn annotated_path(&self) -> Result<PathBuf, DetectionError> {
        let file_name = self
            .source
            .file_name()
            .ok_or_else(|| DetectionError::NoFileName(self.source.clone()))?;
        Ok(self.output_dir().join(file_name))
    }
}

/// Runs object detection and writes an annotated copy of the source.
pub trait Detector: Send + Sync {
    /// Short name for logs.
    fn name(&self) -> &str;

    /// Processes `request` and returns the path of the annotated output.
    fn detect(&self, request: &DetectionRequest, kind: MediaKind)
    -> Result<PathBuf, DetectionError>;
}

/// Picks the detector matching the weights format: ONNX exports run in-process,
/// everything else goes through the configured external program.
pub fn build_detector(settings: &AppSettings, weights: &Path) -> Arc<dyn Detector> {
    let is_onnx = weights
        .extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("onnx"));
    if is_onnx {
        Arc::new(DnnDetector::new(settings.detector.clone()))
    } else {
        Arc::new(CommandDetector::new(settings.external.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn media_kind_from_extension() {
        assert_eq!(MediaKind::from_path(Path::new("a/b.JPG")), Some(MediaKind::Image));
        assert_eq!(MediaKind::from_path(Path::new("clip.avi")), Some(MediaKind::Video));
        assert_eq!(MediaKind::from_path(Path::new("notes.txt")), None);
        assert_eq!(MediaKind::from_path(Path::new("no_extension")), None);
    }

    #[test]
    fn cancel_alert_names_the_media() {
        assert_eq!(MediaKind::Image.cancel_alert(), "Please select an image!");
        assert_eq!(MediaKind::Video.cancel_alert(), "Please select a video!");
    }

    #[test]
    fn annotated_path_uses_output_subdirectory() {
        let request = DetectionRequest::new("/data/shots/cat.jpg", "yolo/yolov5s.pt", "exp");
        assert_eq!(request.project_dir, PathBuf::from("/data/shots"));
        assert_eq!(
            request.annotated_path().expect("file name"),
            PathBuf::from("/data/shots/exp/cat.jpg")
        );
    }

    #[test]
    fn annotated_path_requires_file_name() {
        let request = DetectionRequest::new("/", "w.pt", "exp");
        assert!(matches!(
            request.annotated_path(),
            Err(DetectionError::NoFileName(_))
        ));
    }

    #[test]
    fn detector_follows_weights_format() {
        let settings = AppSettings::default();
        assert_eq!(build_detector(&settings, Path::new("yolo/m.onnx")).name(), "opencv-dnn");
        assert_eq!(build_detector(&settings, Path::new("yolo/m.ONNX")).name(), "opencv-dnn");
        assert_eq!(build_detector(&settings, Path::new("yolo/m.pt")).name(), "python");
    }
}
