//! Desktop viewer that runs object detection on an image or video and shows
//! the annotated result.

mod command;
mod config;
mod detector;
mod dnn;
mod external;
mod media;
mod ui;
mod video_reader;
mod worker;

use eframe::egui;
use log::info;
use ui::DetectionApp;

fn main() -> eframe::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let settings_path = config::default_settings_path();
    info!("Loading settings from {}", settings_path.display());
    let settings = config::load_settings(&settings_path);

    let options = eframe::NativeOptions {
        viewport: egui::ViewportBuilder::default().with_inner_size([800.0, 600.0]),
        ..Default::default()
    };

    eframe::run_native(
        "Object Detection Viewer",
        options,
        Box::new(move |_cc| Ok(Box::new(DetectionApp::new(settings, settings_path)))),
    )
}
