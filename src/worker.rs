use crate::detector::{DetectionRequest, Detector, MediaKind};
use eframe::egui;
use log::{info, warn};
use std::{
    path::PathBuf,
    sync::{Arc, mpsc},
    thread,
    time::Instant,
};

/// The single message a detection job sends back to the UI thread.
#[derive(Debug, Clone, PartialEq)]
pub enum JobMessage {
    Finished { kind: MediaKind, output: PathBuf },
    Failed { kind: MediaKind, error: String },
}

/// Runs `detector` on a detached thread.
///
/// Exactly one [`JobMessage`] is sent when the detector returns, after which a
/// repaint is requested so the UI picks it up without waiting for input.
pub fn spawn_detection(
    detector: Arc<dyn Detector>,
    request: DetectionRequest,
    kind: MediaKind,
    sender: mpsc::Sender<JobMessage>,
    ctx: egui::Context,
) -> thread::JoinHandle<()> {
    thread::spawn(move || {
        let started = Instant::now();
        let message = match detector.detect(&request, kind) {
            Ok(output) => {
                info!(
                    "{} finished {} in {:.2?}: {}",
                    detector.name(),
                    request.source.display(),
                    started.elapsed(),
                    output.display()
                );
                JobMessage::Finished { kind, output }
            }
            Err(err) => {
                warn!(
                    "{} failed on {} after {:.2?}: {err}",
                    detector.name(),
                    request.source.display(),
                    started.elapsed()
                );
                JobMessage::Failed {
                    kind,
                    error: err.to_string(),
                }
            }
        };
        if sender.send(message).is_err() {
            warn!("UI went away before the detection result could be delivered");
        }
        ctx.request_repaint();
    })
}
