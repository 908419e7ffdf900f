//! In-process YOLOv5 detection using OpenCV's DNN module and an ONNX export.

use crate::{
    config::DetectorSettings,
    detector::{DetectionError, DetectionRequest, Detector, MediaKind},
};
use log::{debug, info};
use opencv::{
    core::{self, Mat, Point, Rect, Scalar, Size, Vector},
    dnn, imgcodecs, imgproc,
    prelude::*,
    videoio::{self, VideoCapture, VideoWriter},
};
use std::{
    fs,
    path::{Path, PathBuf},
};

/// Box in source image pixels, top-left origin.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

impl BoundingBox {
    fn to_rect(self) -> Rect {
        Rect::new(
            self.x.round() as i32,
            self.y.round() as i32,
            self.width.round() as i32,
            self.height.round() as i32,
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Candidate {
    pub class_id: usize,
    pub score: f32,
    pub bbox: BoundingBox,
}

/// Decodes raw YOLOv5 rows of `[cx, cy, w, h, objectness, class scores...]`.
///
/// `x_factor`/`y_factor` map network coordinates back to the source image.
pub fn decode_predictions(
    data: &[f32],
    stride: usize,
    threshold: f32,
    x_factor: f32,
    y_factor: f32,
) -> Vec<Candidate> {
    if stride <= 5 {
        return Vec::new();
    }
    data.chunks_exact(stride)
        .filter_map(|row| {
            let objectness = row[4];
            if objectness < threshold {
                return None;
            }
            let (class_id, class_score) = row[5..]
                .iter()
                .copied()
                .enumerate()
                .max_by(|a, b| a.1.total_cmp(&b.1))?;
            let score = objectness * class_score;
            if score < threshold {
                return None;
            }
            let (cx, cy, w, h) = (row[0], row[1], row[2], row[3]);
            Some(Candidate {
                class_id,
                score,
                bbox: BoundingBox {
                    x: (cx - w / 2.0) * x_factor,
                    y: (cy - h / 2.0) * y_factor,
                    width: w * x_factor,
                    height: h * y_factor,
                },
            })
        })
        .collect()
}

/// Stable per-class drawing colour (BGR).
pub fn class_color(class_id: usize) -> Scalar {
    const PALETTE: [(f64, f64, f64); 8] = [
        (56.0, 56.0, 255.0),
        (151.0, 157.0, 255.0),
        (31.0, 112.0, 255.0),
        (29.0, 178.0, 255.0),
        (49.0, 210.0, 207.0),
        (10.0, 249.0, 72.0),
        (23.0, 204.0, 146.0),
        (134.0, 219.0, 61.0),
    ];
    let (b, g, r) = PALETTE[class_id % PALETTE.len()];
    Scalar::new(b, g, r, 0.0)
}

/// Codec used when writing an annotated video, chosen by container.
pub fn fourcc_for(path: &Path) -> [char; 4] {
    let ext = path
        .extension()
        .and_then(|ext| ext.to_str())
        .map(str::to_ascii_lowercase);
    match ext.as_deref() {
        Some("avi") => ['M', 'J', 'P', 'G'],
        _ => ['m', 'p', '4', 'v'],
    }
}

/// Reads `source`, runs `annotate` on it and writes the result to `output`.
pub fn annotate_image_file(
    source: &Path,
    output: &Path,
    mut annotate: impl FnMut(&mut Mat) -> Result<usize, DetectionError>,
) -> Result<usize, DetectionError> {
    let mut image = imgcodecs::imread(&source.to_string_lossy(), imgcodecs::IMREAD_COLOR)?;
    if image.empty() {
        return Err(DetectionError::Unreadable(source.to_path_buf()));
    }
    let found = annotate(&mut image)?;
    debug!("{found} objects in {}", source.display());

    if !imgcodecs::imwrite(&output.to_string_lossy(), &image, &Vector::new())? {
        return Err(DetectionError::Unwritable(output.to_path_buf()));
    }
    Ok(found)
}

/// Copies `source` to `output` frame by frame at the source frame rate,
/// running `annotate` on every frame. Returns the number of frames written.
pub fn annotate_video_file(
    source: &Path,
    output: &Path,
    mut annotate: impl FnMut(&mut Mat) -> Result<usize, DetectionError>,
) -> Result<usize, DetectionError> {
    let mut capture = VideoCapture::from_file(&source.to_string_lossy(), videoio::CAP_ANY)?;
    if !capture.is_opened()? {
        return Err(DetectionError::Unreadable(source.to_path_buf()));
    }

    let fps = match capture.get(videoio::CAP_PROP_FPS)? {
        fps if fps > 0.0 => fps,
        _ => 30.0,
    };
    let size = Size::new(
        capture.get(videoio::CAP_PROP_FRAME_WIDTH)? as i32,
        capture.get(videoio::CAP_PROP_FRAME_HEIGHT)? as i32,
    );
    let [c1, c2, c3, c4] = fourcc_for(output);
    let fourcc = VideoWriter::fourcc(c1, c2, c3, c4)?;
    let mut writer = VideoWriter::new(&output.to_string_lossy(), fourcc, fps, size, true)?;
    if !writer.is_opened()? {
        return Err(DetectionError::Unwritable(output.to_path_buf()));
    }

    let mut frame = Mat::default();
    let mut frames = 0usize;
    while capture.read(&mut frame)? {
        if frame.empty() {
            break;
        }
        annotate(&mut frame)?;
        writer.write(&frame)?;
        frames += 1;
    }
    writer.release()?;
    debug!("annotated {frames} frames of {}", source.display());
    Ok(frames)
}

pub struct DnnDetector {
    settings: DetectorSettings,
}

impl DnnDetector {
    pub fn new(settings: DetectorSettings) -> Self {
        Self { settings }
    }

    fn load_network(&self, weights: &Path) -> Result<dnn::Net, DetectionError> {
        if !weights.is_file() {
            return Err(DetectionError::WeightsNotFound(weights.to_path_buf()));
        }
        let net = dnn::read_net_from_onnx(&weights.to_string_lossy())?;
        info!("Loaded ONNX model from {}", weights.display());
        Ok(net)
    }

    /// Runs the network on `frame` and returns the boxes surviving NMS.
    fn infer(&self, net: &mut dnn::Net, frame: &Mat) -> Result<Vec<Candidate>, DetectionError> {
        let input = self.settings.input_size;
        let size = frame.size()?;
        let blob = dnn::blob_from_image(
            frame,
            1.0 / 255.0,
            Size::new(input, input),
            Scalar::default(),
            true,
            false,
            core::CV_32F,
        )?;
        net.set_input(&blob, "", 1.0, Scalar::default())?;

        let names = net.get_unconnected_out_layers_names()?;
        let mut outputs: Vector<Mat> = Vector::new();
        net.forward(&mut outputs, &names)?;
        let output = outputs.get(0)?;
        if output.typ() != core::CV_32F {
            return Err(DetectionError::ModelOutput(format!(
                "expected 32-bit float output, got type {}",
                output.typ()
            )));
        }

        let stride = self.settings.class_names.len() + 5;
        let values: Vec<f32> = output
            .data_bytes()?
            .chunks_exact(4)
            .map(|b| f32::from_ne_bytes([b[0], b[1], b[2], b[3]]))
            .collect();
        if values.len() % stride != 0 {
            return Err(DetectionError::ModelOutput(format!(
                "{} values do not split into rows of {stride}; check the configured class names",
                values.len()
            )));
        }

        let candidates = decode_predictions(
            &values,
            stride,
            self.settings.score_threshold,
            size.width as f32 / input as f32,
            size.height as f32 / input as f32,
        );

        let boxes: Vector<Rect> = candidates.iter().map(|c| c.bbox.to_rect()).collect();
        let scores: Vector<f32> = candidates.iter().map(|c| c.score).collect();
        let mut keep: Vector<i32> = Vector::new();
        dnn::nms_boxes(
            &boxes,
            &scores,
            self.settings.score_threshold,
            self.settings.nms_threshold,
            &mut keep,
            1.0,
            0,
        )?;

        Ok(keep
            .iter()
            .filter_map(|index| candidates.get(index as usize).copied())
            .collect())
    }

    fn draw(&self, frame: &mut Mat, detections: &[Candidate]) -> Result<(), DetectionError> {
        for detection in detections {
            let rect = detection.bbox.to_rect();
            let color = class_color(detection.class_id);
            imgproc::rectangle(frame, rect, color, 2, imgproc::LINE_8, 0)?;

            let name = self
                .settings
                .class_names
                .get(detection.class_id)
                .map(String::as_str)
                .unwrap_or("?");
            let label = format!("{name} {:.2}", detection.score);
            imgproc::put_text(
                frame,
                &label,
                Point::new(rect.x, (rect.y - 5).max(12)),
                imgproc::FONT_HERSHEY_SIMPLEX,
                0.5,
                color,
                1,
                imgproc::LINE_AA,
                false,
            )?;
        }
        Ok(())
    }

    fn annotate(&self, net: &mut dnn::Net, frame: &mut Mat) -> Result<usize, DetectionError> {
        let detections = self.infer(net, frame)?;
        self.draw(frame, &detections)?;
        Ok(detections.len())
    }
}

impl Detector for DnnDetector {
    fn name(&self) -> &str {
        "opencv-dnn"
    }

    fn detect(
        &self,
        request: &DetectionRequest,
        kind: MediaKind,
    ) -> Result<PathBuf, DetectionError> {
        let output = request.annotated_path()?;
        let mut net = self.load_network(&request.weights)?;

        let output_dir = request.output_dir();
        fs::create_dir_all(&output_dir).map_err(|source| DetectionError::OutputDir {
            path: output_dir.clone(),
            source,
        })?;

        let annotate = |frame: &mut Mat| self.annotate(&mut net, frame);
        match kind {
            MediaKind::Image => annotate_image_file(&request.source, &output, annotate)?,
            MediaKind::Video => annotate_video_file(&request.source, &output, annotate)?,
        };
        Ok(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::video_reader::tests::write_test_video;
    use tempfile::tempdir;

    fn outline(frame: &mut Mat) -> Result<usize, DetectionError> {
        imgproc::rectangle(
            frame,
            Rect::new(2, 2, 10, 10),
            class_color(0),
            1,
            imgproc::LINE_8,
            0,
        )?;
        Ok(1)
    }

    fn row(cx: f32, cy: f32, w: f32, h: f32, obj: f32, classes: &[f32]) -> Vec<f32> {
        let mut values = vec![cx, cy, w, h, obj];
        values.extend_from_slice(classes);
        values
    }

    #[test]
    fn decode_scales_centre_boxes_to_source() {
        let data = row(320.0, 320.0, 64.0, 32.0, 0.9, &[0.1, 0.8, 0.05]);
        let candidates = decode_predictions(&data, 8, 0.25, 2.0, 0.5);

        assert_eq!(candidates.len(), 1);
        let candidate = candidates[0];
        assert_eq!(candidate.class_id, 1);
        assert!((candidate.score - 0.72).abs() < 1e-6);
        assert_eq!(
            candidate.bbox,
            BoundingBox {
                x: 576.0,
                y: 152.0,
                width: 128.0,
                height: 16.0,
            }
        );
    }

    #[test]
    fn decode_drops_low_scores() {
        let mut data = row(10.0, 10.0, 4.0, 4.0, 0.1, &[0.9, 0.0]);
        // objectness passes but the combined score does not
        data.extend(row(10.0, 10.0, 4.0, 4.0, 0.5, &[0.3, 0.2]));
        data.extend(row(50.0, 50.0, 4.0, 4.0, 0.95, &[0.0, 0.99]));

        let candidates = decode_predictions(&data, 7, 0.25, 1.0, 1.0);
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].class_id, 1);
    }

    #[test]
    fn decode_rejects_rows_without_classes() {
        assert!(decode_predictions(&[1.0; 10], 5, 0.1, 1.0, 1.0).is_empty());
    }

    #[test]
    fn codec_follows_container() {
        assert_eq!(fourcc_for(Path::new("out/clip.AVI")), ['M', 'J', 'P', 'G']);
        assert_eq!(fourcc_for(Path::new("out/clip.mp4")), ['m', 'p', '4', 'v']);
    }

    #[test]
    fn colors_cycle_through_palette() {
        assert_eq!(class_color(0), class_color(8));
        assert_ne!(class_color(0), class_color(1));
    }

    #[test]
    fn missing_weights_are_reported_before_loading() {
        let detector = DnnDetector::new(DetectorSettings::default());
        let request = DetectionRequest::new("/tmp/none.jpg", "/nonexistent/yolov5s.onnx", "exp");
        assert!(matches!(
            detector.detect(&request, MediaKind::Image),
            Err(DetectionError::WeightsNotFound(_))
        ));
    }

    #[test]
    fn video_is_rewritten_frame_by_frame() {
        let temp = tempdir().expect("tempdir");
        let source = write_test_video(temp.path(), "in.avi", 4, 20.0);
        let output = temp.path().join("out.avi");

        let mut calls = 0;
        let written = annotate_video_file(&source, &output, |frame| {
            calls += 1;
            outline(frame)
        })
        .expect("annotate video");
        assert_eq!(written, 4);
        assert_eq!(calls, 4);

        let mut capture =
            VideoCapture::from_file(&output.to_string_lossy(), videoio::CAP_ANY).expect("reopen");
        assert!(capture.is_opened().expect("state"));
        assert_eq!(capture.get(videoio::CAP_PROP_FRAME_WIDTH).expect("width"), 32.0);
        let mut frame = Mat::default();
        let mut frames = 0;
        while capture.read(&mut frame).expect("read") && !frame.empty() {
            frames += 1;
        }
        assert_eq!(frames, 4);
    }

    #[test]
    fn unreadable_video_is_reported() {
        let temp = tempdir().expect("tempdir");
        let source = temp.path().join("empty.avi");
        fs::write(&source, b"").expect("write");
        let result = annotate_video_file(&source, &temp.path().join("out.avi"), outline);
        assert!(matches!(result, Err(DetectionError::Unreadable(_))));
    }

    #[test]
    fn image_is_annotated_and_written() {
        let temp = tempdir().expect("tempdir");
        let source = temp.path().join("in.png");
        let blank = Mat::new_rows_cols_with_default(20, 20, core::CV_8UC3, Scalar::all(0.0))
            .expect("blank");
        imgcodecs::imwrite(&source.to_string_lossy(), &blank, &Vector::new()).expect("write");
        let output = temp.path().join("out.png");

        let found = annotate_image_file(&source, &output, outline).expect("annotate image");
        assert_eq!(found, 1);

        let written = imgcodecs::imread(&output.to_string_lossy(), imgcodecs::IMREAD_COLOR)
            .expect("read back");
        assert_eq!(written.size().expect("size"), Size::new(20, 20));
        let corner = written.at_2d::<core::Vec3b>(2, 2).expect("pixel");
        assert!(corner.0.iter().any(|&c| c > 0), "outline drawn at (2, 2)");
    }
}
