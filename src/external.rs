use crate::{
    config::ExternalDetectorSettings,
    detector::{DetectionError, DetectionRequest, Detector, MediaKind},
};
use log::{debug, info};
use std::{path::PathBuf, process::Command};

/// Runs detection by invoking an external program, e.g. a YOLOv5 `detect.py`.
pub struct CommandDetector {
    settings: ExternalDetectorSettings,
}

impl CommandDetector {
    pub fn new(settings: ExternalDetectorSettings) -> Self {
        Self { settings }
    }

    /// Expands the configured argument template for `request`.
    pub fn arguments(&self, request: &DetectionRequest) -> Vec<String> {
        let source = request.source.to_string_lossy();
        let project = request.project_dir.to_string_lossy();
        let weights = request.weights.to_string_lossy();
        self.settings
            .args
            .iter()
            .map(|arg| {
                arg.replace("{source}", &source)
                    .replace("{project}", &project)
                    .replace("{name}", &request.output_name)
                    .replace("{weights}", &weights)
            })
            .collect()
    }
}

impl Detector for CommandDetector {
    fn name(&self) -> &str {
        &self.settings.program
    }

    fn detect(
        &self,
        request: &DetectionRequest,
        kind: MediaKind,
    ) -> Result<PathBuf, DetectionError> {
        let expected = request.annotated_path()?;
        let args = self.arguments(request);
        info!(
            "Running external detector on {} {}: {} {}",
            kind.label(),
            request.source.display(),
            self.settings.program,
            args.join(" ")
        );

        let output = Command::new(&self.settings.program)
            .args(&args)
            .output()
            .map_err(|source| DetectionError::Spawn {
                program: self.settings.program.clone(),
                source,
            })?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        if !stdout.trim().is_empty() {
            debug!("detector stdout:\n{}", stdout.trim_end());
        }
        if !stderr.trim().is_empty() {
            debug!("detector stderr:\n{}", stderr.trim_end());
        }

        if !output.status.success() {
            return Err(DetectionError::Failed {
                status: output.status.to_string(),
                stderr: stderr.trim().to_string(),
            });
        }
        if !expected.exists() {
            return Err(DetectionError::MissingOutput(expected));
        }
        Ok(expected)
    }
}
