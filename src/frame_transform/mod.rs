//! FrameTransform - Stateless Image Operations
//!
//! ## Responsibilities
//!
//! - Resize to a maximum width (aspect ratio preserved)
//! - Detection overlays (box, label background, label text)
//! - JPEG encoding for subscriber payloads
//!
//! Every function here is pure and safe to call from any session.

mod font;

use crate::detector::Detection;
use crate::error::Result;
use base64::Engine;
use image::codecs::jpeg::JpegEncoder;
use image::imageops::{self, FilterType};
use image::{Rgb, RgbImage};

/// Overlay palette, indexed by `class_id % PALETTE.len()`
pub const PALETTE: [[u8; 3]; 20] = [
    [220, 20, 60],
    [0, 130, 200],
    [60, 180, 75],
    [255, 225, 25],
    [245, 130, 48],
    [145, 30, 180],
    [70, 240, 240],
    [240, 50, 230],
    [210, 245, 60],
    [250, 190, 212],
    [0, 128, 128],
    [220, 190, 255],
    [170, 110, 40],
    [255, 250, 200],
    [128, 0, 0],
    [170, 255, 195],
    [128, 128, 0],
    [255, 215, 180],
    [0, 0, 128],
    [128, 128, 128],
];

const BOX_THICKNESS: u32 = 2;
const LABEL_PADDING: u32 = 3;
const LABEL_TEXT_COLOR: Rgb<u8> = Rgb([255, 255, 255]);

/// Overlay color for a class id
pub fn class_color(class_id: u32) -> Rgb<u8> {
    Rgb(PALETTE[class_id as usize % PALETTE.len()])
}

/// Scale down to `max_width`, flooring the new height
///
/// Images already within the limit are returned untouched, so applying this
/// twice is the same as applying it once.
pub fn resize(image: RgbImage, max_width: u32) -> RgbImage {
    let (width, height) = image.dimensions();
    if max_width == 0 || width <= max_width {
        return image;
    }

    let new_height = ((height as u64 * max_width as u64) / width as u64).max(1) as u32;
    imageops::resize(&image, max_width, new_height, FilterType::Triangle)
}

/// Label drawn above each box
pub fn label_text(detection: &Detection) -> String {
    format!(
        "{}: {:.0}%",
        detection.class_name,
        (detection.confidence * 100.0).clamp(0.0, 100.0)
    )
}

/// Draw detection overlays on a copy of `image`
pub fn annotate(image: &RgbImage, detections: &[Detection]) -> RgbImage {
    let mut canvas = image.clone();
    if canvas.width() == 0 || canvas.height() == 0 {
        return canvas;
    }

    for detection in detections {
        let color = class_color(detection.class_id);
        let [x1, y1, x2, y2] = clamp_bbox(&canvas, detection.bbox);

        draw_box(&mut canvas, x1, y1, x2, y2, color);

        let label = label_text(detection);
        let label_w = font::text_width(&label) + LABEL_PADDING * 2;
        let label_h = font::GLYPH_HEIGHT + LABEL_PADDING * 2;

        // Above the box when there is room, otherwise just inside it
        let label_top = if y1 >= label_h { y1 - label_h } else { y1 };
        let label_right = (x1 + label_w).min(canvas.width() - 1);
        let label_bottom = (label_top + label_h).min(canvas.height() - 1);

        fill_rect(&mut canvas, x1, label_top, label_right, label_bottom, color);
        font::draw_text(
            &mut canvas,
            (x1 + LABEL_PADDING) as i64,
            (label_top + LABEL_PADDING) as i64,
            &label,
            LABEL_TEXT_COLOR,
        );
    }

    canvas
}

/// Encode as JPEG; quality is clamped to 1..=100
pub fn encode_jpeg(image: &RgbImage, quality: u8) -> Result<Vec<u8>> {
    let mut buffer = Vec::new();
    JpegEncoder::new_with_quality(&mut buffer, quality.clamp(1, 100)).encode_image(image)?;
    Ok(buffer)
}

/// Standard base64 of an encoded image
pub fn to_base64(bytes: &[u8]) -> String {
    base64::engine::general_purpose::STANDARD.encode(bytes)
}

/// Annotate, resize and encode in one step; returns base64 JPEG
pub fn render_frame(
    image: &RgbImage,
    detections: &[Detection],
    max_width: u32,
    quality: u8,
) -> Result<String> {
    let annotated = resize(annotate(image, detections), max_width);
    let jpeg = encode_jpeg(&annotated, quality)?;
    Ok(to_base64(&jpeg))
}

fn clamp_bbox(image: &RgbImage, bbox: [f32; 4]) -> [u32; 4] {
    let max_x = (image.width() - 1) as f32;
    let max_y = (image.height() - 1) as f32;
    let x1 = bbox[0].clamp(0.0, max_x);
    let y1 = bbox[1].clamp(0.0, max_y);
    let x2 = bbox[2].clamp(0.0, max_x);
    let y2 = bbox[3].clamp(0.0, max_y);
    [
        x1.min(x2) as u32,
        y1.min(y2) as u32,
        x1.max(x2) as u32,
        y1.max(y2) as u32,
    ]
}

fn draw_box(image: &mut RgbImage, x1: u32, y1: u32, x2: u32, y2: u32, color: Rgb<u8>) {
    for t in 0..BOX_THICKNESS {
        let top = (y1 + t).min(y2);
        let bottom = y2.saturating_sub(t).max(y1);
        let left = (x1 + t).min(x2);
        let right = x2.saturating_sub(t).max(x1);

        for x in x1..=x2 {
            image.put_pixel(x, top, color);
            image.put_pixel(x, bottom, color);
        }
        for y in y1..=y2 {
            image.put_pixel(left, y, color);
            image.put_pixel(right, y, color);
        }
    }
}

fn fill_rect(image: &mut RgbImage, x1: u32, y1: u32, x2: u32, y2: u32, color: Rgb<u8>) {
    for y in y1..=y2 {
        for x in x1..=x2 {
            image.put_pixel(x, y, color);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gradient(width: u32, height: u32) -> RgbImage {
        RgbImage::from_fn(width, height, |x, y| {
            Rgb([
                (x * 7 % 256) as u8,
                (y * 13 % 256) as u8,
                ((x * y) % 251) as u8,
            ])
        })
    }

    #[test]
    fn test_resize_scales_down() {
        let resized = resize(RgbImage::new(1920, 1080), 800);
        assert_eq!(resized.dimensions(), (800, 450));

        // Height is floored: 333 * 100 / 1000 = 33.3
        let resized = resize(RgbImage::new(1000, 333), 100);
        assert_eq!(resized.dimensions(), (100, 33));
    }

    #[test]
    fn test_resize_leaves_small_images() {
        let image = gradient(640, 480);
        let resized = resize(image.clone(), 800);
        assert_eq!(resized, image);
    }

    #[test]
    fn test_resize_idempotent() {
        for (w, h, max) in [(1920, 1080, 800), (801, 3, 800), (5, 5, 1), (1000, 1, 7)] {
            let once = resize(gradient(w, h), max);
            let twice = resize(once.clone(), max);
            assert_eq!(once, twice, "{}x{} max {}", w, h, max);
        }
    }

    #[test]
    fn test_class_color_wraps() {
        assert_eq!(class_color(0), class_color(PALETTE.len() as u32));
        assert_ne!(class_color(0), class_color(1));
    }

    #[test]
    fn test_label_text() {
        let det = Detection::new(0, [0.0, 0.0, 1.0, 1.0], 0.876);
        assert_eq!(label_text(&det), "person: 88%");
    }

    #[test]
    fn test_annotate_draws_on_copy() {
        let image = RgbImage::new(120, 90);
        let detections = vec![Detection::new(3, [40.0, 40.0, 100.0, 80.0], 0.9)];

        let annotated = annotate(&image, &detections);

        // Source untouched
        assert!(image.pixels().all(|p| p.0 == [0, 0, 0]));
        // Box edge and label background carry the class color
        assert_eq!(*annotated.get_pixel(70, 80), class_color(3));
        assert_eq!(*annotated.get_pixel(40, 60), class_color(3));
        assert_eq!(*annotated.get_pixel(41, 40 - 2), class_color(3));
        // Label text is white
        assert!(annotated.pixels().any(|p| p.0 == [255, 255, 255]));
    }

    #[test]
    fn test_annotate_clamps_out_of_bounds_boxes() {
        let image = RgbImage::new(32, 32);
        let detections = vec![
            Detection::new(1, [-50.0, -50.0, 500.0, 500.0], 0.5),
            Detection::new(2, [20.0, 20.0, 10.0, 10.0], 0.5),
        ];
        let annotated = annotate(&image, &detections);
        assert_eq!(annotated.dimensions(), (32, 32));
    }

    #[test]
    fn test_encode_decodable() {
        let image = gradient(64, 48);
        let jpeg = encode_jpeg(&image, 70).unwrap();

        let decoded = image::load_from_memory(&jpeg).unwrap();
        assert_eq!(decoded.width(), 64);
        assert_eq!(decoded.height(), 48);
    }

    #[test]
    fn test_encode_size_grows_with_quality() {
        let image = gradient(160, 120);
        let low = encode_jpeg(&image, 10).unwrap();
        let high = encode_jpeg(&image, 95).unwrap();
        assert!(low.len() < high.len());
    }

    #[test]
    fn test_encode_clamps_quality() {
        let image = gradient(16, 16);
        assert!(encode_jpeg(&image, 0).is_ok());
        assert!(encode_jpeg(&image, 255).is_ok());
    }

    #[test]
    fn test_render_frame_base64() {
        let image = gradient(1600, 900);
        let detections = vec![Detection::new(0, [100.0, 100.0, 400.0, 600.0], 0.8)];

        let encoded = render_frame(&image, &detections, 800, 70).unwrap();
        let bytes = base64::engine::general_purpose::STANDARD
            .decode(encoded)
            .unwrap();
        let decoded = image::load_from_memory(&bytes).unwrap();
        assert_eq!((decoded.width(), decoded.height()), (800, 450));
    }
}
