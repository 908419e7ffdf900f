use crate::command::ControlCommand;
use eframe::egui;
use log::{debug, warn};
use opencv::{
    core, imgproc,
    prelude::*,
    videoio::{self, VideoCapture},
};
use std::{
    path::Path,
    sync::mpsc,
    thread,
    time::{Duration, Instant},
};
use thiserror::Error;

#[derive(Debug, Clone, Error)]
pub enum VideoReaderError {
    #[error("{0}")]
    OpenCV(String),
}

/// A decoded frame and its position in the stream, in milliseconds.
pub type FrameMessage = Result<(egui::ColorImage, f64), VideoReaderError>;

/// Opens a video and decodes it frame by frame. Does no threading itself.
pub struct FrameDecoder {
    cap: VideoCapture,
}

impl FrameDecoder {
    pub fn new(path: &Path) -> Result<Self, VideoReaderError> {
        let path_str = path.to_string_lossy();
        let cap = VideoCapture::from_file(&path_str, videoio::CAP_ANY)
            .map_err(|e| VideoReaderError::OpenCV(format!("Failed to open video file: {e}")))?;

        if !cap.is_opened().unwrap_or(false) {
            return Err(VideoReaderError::OpenCV(format!(
                "Failed to open video file: {path_str}"
            )));
        }

        Ok(Self { cap })
    }

    /// Frames per second, 30 when the container does not say.
    pub fn fps(&self) -> f64 {
        match self.cap.get(videoio::CAP_PROP_FPS) {
            Ok(fps) if fps > 0.0 => fps,
            _ => 30.0,
        }
    }

    pub fn width(&self) -> u32 {
        self.cap.get(videoio::CAP_PROP_FRAME_WIDTH).unwrap_or(0.0) as u32
    }

    pub fn height(&self) -> u32 {
        self.cap.get(videoio::CAP_PROP_FRAME_HEIGHT).unwrap_or(0.0) as u32
    }

    /// Total duration in seconds.
    pub fn duration(&self) -> f64 {
        let frame_count = self.cap.get(videoio::CAP_PROP_FRAME_COUNT).unwrap_or(0.0);
        frame_count / self.fps()
    }

    /// Moves the read position to the frame at `ms` milliseconds.
    pub fn seek(&mut self, ms: f64) -> Result<(), VideoReaderError> {
        // Frame positioning is supported by more backends than POS_MSEC.
        let frame_index = (ms.max(0.0) / 1000.0 * self.fps()).round();
        self.cap
            .set(videoio::CAP_PROP_POS_FRAMES, frame_index)
            .map(|_| ())
            .map_err(|e| VideoReaderError::OpenCV(format!("Seek to {ms}ms failed: {e}")))
    }

    /// Reads the next frame as RGB with its timestamp.
    /// Returns `Ok(None)` at the end of the stream.
    pub fn read_next_frame(&mut self) -> Result<Option<(egui::ColorImage, f64)>, VideoReaderError> {
        let mut frame = core::Mat::default();
        match self.cap.read(&mut frame) {
            Ok(true) if !frame.empty() => {
                let timestamp_ms = self.cap.get(videoio::CAP_PROP_POS_MSEC).unwrap_or(0.0);
                let color_image = mat_to_color_image(&frame)?;
                Ok(Some((color_image, timestamp_ms)))
            }
            // End of video or read error
            _ => Ok(None),
        }
    }
}

/// Converts an OpenCV BGR frame into an egui image.
fn mat_to_color_image(frame: &core::Mat) -> Result<egui::ColorImage, VideoReaderError> {
    let mut rgb_frame = core::Mat::default();
    imgproc::cvt_color(
        frame,
        &mut rgb_frame,
        imgproc::COLOR_BGR2RGB,
        0,
        core::AlgorithmHint::ALGO_HINT_DEFAULT,
    )
    .map_err(|e| VideoReaderError::OpenCV(format!("Failed to convert frame to RGB: {e}")))?;

    let size = rgb_frame
        .size()
        .map_err(|e| VideoReaderError::OpenCV(format!("Failed to get frame size: {e}")))?;
    let data = rgb_frame
        .data_bytes()
        .map_err(|e| VideoReaderError::OpenCV(format!("Failed to access frame data: {e}")))?;
    Ok(egui::ColorImage::from_rgb(
        [size.width as usize, size.height as usize],
        data,
    ))
}

/// Fixed-rate schedule for frame delivery.
///
/// Deadlines advance by exactly one frame interval, so decode time is absorbed
/// instead of added on top of the interval.
#[derive(Debug, Clone, Copy)]
pub struct FrameClock {
    interval: Duration,
    next: Instant,
}

impl FrameClock {
    pub fn new(fps: f64, now: Instant) -> Self {
        Self {
            interval: Duration::from_secs_f64(1.0 / fps),
            next: now,
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Restarts the schedule, e.g. after a pause.
    pub fn reset(&mut self, now: Instant) {
        self.next = now;
    }

    /// Advances to the next deadline and returns how long to sleep until it.
    /// Falling more than one interval behind resynchronises instead of bursting.
    pub fn advance(&mut self, now: Instant) -> Duration {
        self.next += self.interval;
        if now > self.next + self.interval {
            self.next = now;
        }
        self.next.saturating_duration_since(now)
    }
}

/// Plays a video on a background thread, paced to its frame rate.
pub struct VideoReader {
    _thread_handle: thread::JoinHandle<()>,
    width: u32,
    height: u32,
    duration: f64,
    fps: f64,
}

impl VideoReader {
    /// Opens `path` and starts a paused playback thread.
    ///
    /// Frames go to `frame_sender`, which should be bounded so an idle UI
    /// blocks the decoder instead of buffering the whole video. The thread
    /// obeys `control_receiver` and exits at the end of the stream, when
    /// sending fails, or when the control channel is dropped.
    pub fn new(
        path: &Path,
        frame_sender: mpsc::SyncSender<FrameMessage>,
        control_receiver: mpsc::Receiver<ControlCommand>,
    ) -> Result<Self, VideoReaderError> {
        let mut decoder = FrameDecoder::new(path)?;

        let fps = decoder.fps();
        let width = decoder.width();
        let height = decoder.height();
        let duration = decoder.duration();
        debug!(
            "Opened {} ({width}x{height}, {fps:.2} fps, {duration:.1}s)",
            path.display()
        );

        let thread_handle = thread::spawn(move || {
            let mut is_paused = true;
            let mut clock = FrameClock::new(fps, Instant::now());

            loop {
                match control_receiver.try_recv() {
                    Ok(ControlCommand::Play) => {
                        if is_paused {
                            clock.reset(Instant::now());
                        }
                        is_paused = false;
                    }
                    Ok(ControlCommand::Pause) => is_paused = true,
                    Ok(ControlCommand::Seek(ms)) => {
                        if let Err(err) = decoder.seek(ms) {
                            warn!("{err}");
                        }
                    }
                    Err(mpsc::TryRecvError::Disconnected) => break,
                    Err(mpsc::TryRecvError::Empty) => {}
                }

                if is_paused {
                    thread::sleep(clock.interval());
                    continue;
                }

                match decoder.read_next_frame() {
                    Ok(Some(frame)) => {
                        if frame_sender.send(Ok(frame)).is_err() {
                            break;
                        }
                    }
                    Ok(None) => break,
                    Err(err) => {
                        let _ = frame_sender.send(Err(err));
                        break;
                    }
                }

                thread::sleep(clock.advance(Instant::now()));
            }
        });

        Ok(Self {
            _thread_handle: thread_handle,
            width,
            height,
            duration,
            fps,
        })
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn duration(&self) -> f64 {
        self.duration
    }

    pub fn fps(&self) -> f64 {
        self.fps
    }
}
