use crate::command::ControlCommand;
use crate::config::{AppSettings, persist_settings};
use crate::detector::{DetectionRequest, Detector, MediaKind, build_detector};
use crate::media::{fit_within, load_color_image};
use crate::video_reader::{FrameMessage, VideoReader};
use crate::worker::{JobMessage, spawn_detection};
use eframe::egui;
use log::{info, warn};
use std::{
    path::{Path, PathBuf},
    sync::{Arc, mpsc},
};

const STATUS_IDLE: &str = "Select an image or a video to run detection.";
const STATUS_RUNNING: &str = "Running detection...";

// Playback state of the annotated video.
#[derive(Debug, Clone, PartialEq)]
enum PlaybackState {
    // No video loaded.
    NotLoaded,
    Paused,
    Playing,
    Finished,
    Error(String),
}

/// Builds the detector for a given weights path; swapped out in tests.
type DetectorFactory = Box<dyn Fn(&AppSettings, &Path) -> Arc<dyn Detector>>;

pub struct DetectionApp {
    settings: AppSettings,
    settings_path: PathBuf,
    make_detector: DetectorFactory,
    // Source file of the current or last job.
    file_path: Option<PathBuf>,
    // Set while a detection job runs; disables the controls.
    busy: bool,
    status: String,
    // Message shown in the modal alert window.
    alert: Option<String>,
    job_sender: mpsc::Sender<JobMessage>,
    job_receiver: mpsc::Receiver<JobMessage>,
    // Manages the video playback thread.
    video_reader: Option<VideoReader>,
    frame_receiver: Option<mpsc::Receiver<FrameMessage>>,
    control_sender: Option<mpsc::Sender<ControlCommand>>,
    // Texture to display: the annotated image or the current video frame.
    texture: Option<egui::TextureHandle>,
    playback_state: PlaybackState,
}

impl DetectionApp {
    pub fn new(settings: AppSettings, settings_path: PathBuf) -> Self {
        Self::with_detector_factory(settings, settings_path, Box::new(build_detector))
    }

    fn with_detector_factory(
        settings: AppSettings,
        settings_path: PathBuf,
        make_detector: DetectorFactory,
    ) -> Self {
        let (job_sender, job_receiver) = mpsc::channel();
        Self {
            settings,
            settings_path,
            make_detector,
            file_path: None,
            busy: false,
            status: STATUS_IDLE.to_string(),
            alert: None,
            job_sender,
            job_receiver,
            video_reader: None,
            frame_receiver: None,
            control_sender: None,
            texture: None,
            playback_state: PlaybackState::NotLoaded,
        }
    }

    /// Opens a file dialog for `kind` and starts detection on the chosen file.
    fn pick_and_detect(&mut self, ctx: &egui::Context, kind: MediaKind) {
        let picked = rfd::FileDialog::new()
            .set_title(kind.dialog_title())
            .add_filter(kind.label(), kind.extensions())
            .pick_file();
        match picked {
            Some(path) => {
                self.start_detection(ctx, path, kind);
            }
            None => self.alert = Some(kind.cancel_alert().to_string()),
        }
    }

    /// Starts a detection job for `path`. Returns whether a job was started.
    pub fn start_detection(&mut self, ctx: &egui::Context, path: PathBuf, kind: MediaKind) -> bool {
        if self.busy {
            warn!("Ignoring {} while a detection job is running", path.display());
            return false;
        }
        if let Some(actual) = MediaKind::from_path(&path)
            && actual != kind
        {
            warn!(
                "{} looks like a {} but will be processed as a {}",
                path.display(),
                actual.label(),
                kind.label()
            );
        }
        self.file_path = Some(path.clone());

        let Some(weights) = self.settings.model_path() else {
            self.alert = Some("Please select a model!".to_string());
            return false;
        };

        self.stop_video();
        self.texture = None;
        self.busy = true;
        self.status = STATUS_RUNNING.to_string();

        let detector = (self.make_detector)(&self.settings, &weights);
        info!(
            "Detecting {} {} with {} ({})",
            kind.label(),
            path.display(),
            weights.display(),
            detector.name()
        );
        let request = DetectionRequest::new(path, weights, &self.settings.output_name);
        spawn_detection(
            detector,
            request,
            kind,
            self.job_sender.clone(),
            ctx.clone(),
        );
        true
    }

    /// Selects a model by name and persists the choice.
    pub fn choose_model(&mut self, name: &str) {
        self.settings.model = Some(name.to_string());
        if let Some(path) = self.settings.model_path() {
            info!("Selected model weights: {}", path.display());
        }
        if let Err(err) = persist_settings(&self.settings, &self.settings_path) {
            warn!("Failed to persist settings: {err:#}");
        }
    }

    /// Applies the result of a finished detection job.
    fn handle_job_message(&mut self, ctx: &egui::Context, message: JobMessage) {
        self.busy = false;
        match message {
            JobMessage::Finished {
                kind: MediaKind::Image,
                output,
            } => self.show_image(ctx, &output),
            JobMessage::Finished {
                kind: MediaKind::Video,
                output,
            } => self.play_video(&output),
            JobMessage::Failed { kind, error } => {
                self.status = format!("Detection failed for the {}.", kind.label());
                self.alert = Some(error);
            }
        }
    }

    fn show_image(&mut self, ctx: &egui::Context, path: &Path) {
        match load_color_image(path) {
            Ok(color_image) => {
                self.texture =
                    Some(ctx.load_texture("detection_result", color_image, egui::TextureOptions::LINEAR));
                self.status = format!("Showing {}", path.display());
            }
            Err(err) => {
                warn!("{err:#}");
                self.status = "Failed to open image!".to_string();
                self.alert = Some(format!("{err:#}"));
            }
        }
    }

    fn play_video(&mut self, path: &Path) {
        self.stop_video();
        // One slot: the reader blocks while the UI is not taking frames.
        let (frame_sender, frame_receiver) = mpsc::sync_channel(1);
        let (control_sender, control_receiver) = mpsc::channel();

        match VideoReader::new(path, frame_sender, control_receiver) {
            Ok(reader) => {
                info!("Starting playback of {}", path.display());
                let _ = control_sender.send(ControlCommand::Play);
                self.status = format!("Playing {}", path.display());
                self.video_reader = Some(reader);
                self.frame_receiver = Some(frame_receiver);
                self.control_sender = Some(control_sender);
                self.playback_state = PlaybackState::Playing;
            }
            Err(err) => {
                warn!("Failed to open {}: {err}", path.display());
                self.status = "Failed to open video!".to_string();
                self.alert = Some("Failed to open video!".to_string());
                self.playback_state = PlaybackState::Error(err.to_string());
            }
        }
    }

    // Dropping the control sender ends the playback thread.
    fn stop_video(&mut self) {
        self.control_sender = None;
        self.frame_receiver = None;
        self.video_reader = None;
        self.playback_state = PlaybackState::NotLoaded;
    }

    fn send_control(&mut self, command: ControlCommand) {
        if let Some(sender) = &self.control_sender {
            let _ = sender.send(command);
        }
        match command {
            ControlCommand::Play => self.playback_state = PlaybackState::Playing,
            ControlCommand::Pause => self.playback_state = PlaybackState::Paused,
            ControlCommand::Seek(_) => {}
        }
    }

    /// Drains job results and video frames produced since the last frame.
    fn poll(&mut self, ctx: &egui::Context) {
        while let Ok(message) = self.job_receiver.try_recv() {
            self.handle_job_message(ctx, message);
        }

        let Some(receiver) = &self.frame_receiver else {
            return;
        };
        // Keep only the newest frame if several arrived since the last update.
        let mut latest = None;
        let status = loop {
            match receiver.try_recv() {
                Ok(message) => latest = Some(message),
                Err(status) => break status,
            }
        };

        match latest {
            Some(Ok((color_image, _timestamp_ms))) => {
                self.texture =
                    Some(ctx.load_texture("video_frame", color_image, egui::TextureOptions::LINEAR));
            }
            Some(Err(err)) => {
                self.playback_state = PlaybackState::Error(format!("Video processing error: {err}"));
                self.video_reader = None;
                self.frame_receiver = None;
                return;
            }
            None => {}
        }

        // Playback thread exited: end of video.
        if status == mpsc::TryRecvError::Disconnected {
            if matches!(
                self.playback_state,
                PlaybackState::Playing | PlaybackState::Paused
            ) {
                self.playback_state = PlaybackState::Finished;
            }
            self.video_reader = None;
            self.frame_receiver = None;
            self.control_sender = None;
        }
    }

    fn controls(&mut self, ui: &mut egui::Ui) {
        let enabled = !self.busy;
        ui.horizontal(|ui| {
            if ui
                .add_enabled(enabled, egui::Button::new("Detect image..."))
                .clicked()
            {
                self.pick_and_detect(ui.ctx(), MediaKind::Image);
            }
            if ui
                .add_enabled(enabled, egui::Button::new("Detect video..."))
                .clicked()
            {
                self.pick_and_detect(ui.ctx(), MediaKind::Video);
            }

            ui.separator();

            let mut chosen = None;
            ui.add_enabled_ui(enabled, |ui| {
                egui::ComboBox::from_label("Model")
                    .selected_text(self.settings.model.as_deref().unwrap_or("none"))
                    .show_ui(ui, |ui| {
                        for name in &self.settings.models {
                            let selected = self.settings.model.as_deref() == Some(name.as_str());
                            if ui.selectable_label(selected, name.as_str()).clicked() {
                                chosen = Some(name.clone());
                            }
                        }
                    });
            });
            if let Some(name) = chosen {
                self.choose_model(&name);
            }

            ui.separator();

            let mut command = None;
            match &self.playback_state {
                PlaybackState::Playing => {
                    if ui.button("Pause").clicked() {
                        command = Some(ControlCommand::Pause);
                    }
                    if ui.button("Restart").clicked() {
                        command = Some(ControlCommand::Seek(0.0));
                    }
                }
                PlaybackState::Paused => {
                    if ui.button("Play").clicked() {
                        command = Some(ControlCommand::Play);
                    }
                    if ui.button("Restart").clicked() {
                        command = Some(ControlCommand::Seek(0.0));
                    }
                }
                _ => {}
            }
            if let Some(command) = command {
                self.send_control(command);
            }
        });
    }

    fn display(&self, ui: &mut egui::Ui) {
        if self.busy {
            ui.horizontal(|ui| {
                ui.spinner();
                ui.label(STATUS_RUNNING);
            });
            return;
        }
        if let PlaybackState::Error(msg) = &self.playback_state {
            ui.colored_label(egui::Color32::RED, msg.as_str());
        }
        if let Some(reader) = &self.video_reader {
            ui.label(format!(
                "{}x{} at {:.1} fps, {:.1}s",
                reader.width(),
                reader.height(),
                reader.fps(),
                reader.duration()
            ));
        }
        if let Some(texture) = &self.texture {
            let size = fit_within(texture.size_vec2(), ui.available_size());
            ui.centered_and_justified(|ui| {
                ui.image((texture.id(), size));
            });
        } else if self.file_path.is_none() {
            ui.label("No file selected.");
        }
        if self.playback_state == PlaybackState::Finished {
            ui.label("Playback finished.");
        }
    }

    fn alert_window(&mut self, ctx: &egui::Context) {
        let Some(message) = self.alert.clone() else {
            return;
        };
        egui::Window::new("Warning")
            .collapsible(false)
            .resizable(false)
            .anchor(egui::Align2::CENTER_CENTER, [0.0, 0.0])
            .show(ctx, |ui| {
                ui.label(message);
                if ui.button("OK").clicked() {
                    self.alert = None;
                }
            });
    }
}

impl eframe::App for DetectionApp {
    fn update(&mut self, ctx: &egui::Context, _frame: &mut eframe::Frame) {
        self.poll(ctx);

        egui::TopBottomPanel::bottom("status_bar").show(ctx, |ui| {
            ui.label(self.status.as_str());
        });

        egui::CentralPanel::default().show(ctx, |ui| {
            ui.heading("Object Detection Viewer");
            self.controls(ui);
            ui.separator();
            self.display(ui);
        });

        self.alert_window(ctx);

        if self.busy || self.frame_receiver.is_some() {
            ctx.request_repaint();
        }
    }
}
