use anyhow::{Context, Result};
use eframe::egui;
use std::path::Path;

/// Border of the display area, in points, on each side.
const DISPLAY_BORDER: f32 = 1.0;

/// Decodes an image file into an egui [`egui::ColorImage`].
pub fn load_color_image(path: &Path) -> Result<egui::ColorImage> {
    let image = image::open(path)
        .with_context(|| format!("failed to load image from {}", path.display()))?
        .to_rgba8();
    let size = [image.width() as usize, image.height() as usize];
    Ok(egui::ColorImage::from_rgba_unmultiplied(
        size,
        image.as_raw(),
    ))
}

/// Largest size with the image's aspect ratio that fits inside `available`
/// minus the display border.
pub fn fit_within(image_size: egui::Vec2, available: egui::Vec2) -> egui::Vec2 {
    let target = (available - egui::vec2(2.0 * DISPLAY_BORDER, 2.0 * DISPLAY_BORDER))
        .max(egui::Vec2::ZERO);
    if image_size.x <= 0.0 || image_size.y <= 0.0 {
        return egui::Vec2::ZERO;
    }
    let scale = (target.x / image_size.x).min(target.y / image_size.y);
    image_size * scale
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn loads_png_into_color_image() {
        let temp = tempdir().expect("tempdir");
        let path = temp.path().join("annotated.png");
        let mut pixels = image::RgbImage::new(3, 2);
        pixels.put_pixel(2, 1, image::Rgb([255, 0, 0]));
        pixels.save(&path).expect("save png");

        let color_image = load_color_image(&path).expect("load");
        assert_eq!(color_image.size, [3, 2]);
        assert_eq!(color_image.pixels[5], egui::Color32::from_rgb(255, 0, 0));
        assert_eq!(color_image.pixels[0], egui::Color32::from_rgb(0, 0, 0));
    }

    #[test]
    fn unreadable_image_is_an_error() {
        let temp = tempdir().expect("tempdir");
        let path = temp.path().join("broken.jpg");
        std::fs::write(&path, b"not an image").expect("write");

        let err = load_color_image(&path).expect_err("should fail");
        assert!(err.to_string().contains("broken.jpg"));
    }

    #[test]
    fn fit_preserves_aspect_ratio() {
        let size = fit_within(egui::vec2(400.0, 200.0), egui::vec2(202.0, 502.0));
        assert_eq!(size, egui::vec2(200.0, 100.0));

        let size = fit_within(egui::vec2(100.0, 100.0), egui::vec2(802.0, 402.0));
        assert_eq!(size, egui::vec2(400.0, 400.0));
    }

    #[test]
    fn fit_never_goes_negative() {
        assert_eq!(
            fit_within(egui::vec2(10.0, 10.0), egui::vec2(1.0, 1.0)),
            egui::Vec2::ZERO
        );
        assert_eq!(
            fit_within(egui::vec2(0.0, 10.0), egui::vec2(100.0, 100.0)),
            egui::Vec2::ZERO
        );
    }
}
