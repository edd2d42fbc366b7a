//! Detector - Object Detection Adapter
//!
//! ## Responsibilities
//!
//! - `Detector` capability consumed by the analysis pipeline
//! - HTTP client for the external inference server
//! - Detection-level confidence cutoff and COCO label fill-in

mod coco;

pub use coco::{class_name, COCO_CLASSES};

use crate::error::{Error, Result};
use crate::frame_transform;
use async_trait::async_trait;
use image::RgbImage;
use reqwest::multipart::{Form, Part};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// One detected object instance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    pub class_id: u32,
    pub class_name: String,
    /// [x1, y1, x2, y2] in source pixel coordinates
    pub bbox: [f32; 4],
    pub confidence: f32,
}

impl Detection {
    pub fn new(class_id: u32, bbox: [f32; 4], confidence: f32) -> Self {
        Self {
            class_id,
            class_name: class_name(class_id),
            bbox,
            confidence,
        }
    }
}

/// Object detection capability
///
/// Implementations may be slow; the pipeline awaits one call per frame.
#[async_trait]
pub trait Detector: Send + Sync {
    /// Detect objects in one RGB frame
    async fn detect(&self, image: &RgbImage) -> Result<Vec<Detection>>;

    /// Whether the backend is reachable
    async fn health_check(&self) -> bool {
        true
    }
}

/// Raw detection as returned by the inference server
#[derive(Debug, Clone, Deserialize)]
struct RawDetection {
    class_id: u32,
    #[serde(default)]
    class_name: Option<String>,
    bbox: [f32; 4],
    confidence: f32,
}

/// Inference server response
#[derive(Debug, Clone, Deserialize)]
struct DetectResponse {
    #[serde(default)]
    detections: Vec<RawDetection>,
}

/// Detector backed by an HTTP inference server
pub struct HttpDetector {
    client: reqwest::Client,
    base_url: String,
    confidence_threshold: f32,
}

/// JPEG quality used for the upload to the inference server
const UPLOAD_JPEG_QUALITY: u8 = 90;

impl HttpDetector {
    /// Create new HTTP detector
    pub fn new(base_url: String, confidence_threshold: f32, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::Internal(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            confidence_threshold,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }
}

#[async_trait]
impl Detector for HttpDetector {
    async fn detect(&self, image: &RgbImage) -> Result<Vec<Detection>> {
        let url = format!("{}/v1/detect", self.base_url);
        let jpeg = encode_upload(image.clone()).await?;

        let form = Form::new()
            .part(
                "image",
                Part::bytes(jpeg)
                    .file_name("frame.jpg")
                    .mime_str("image/jpeg")?,
            )
            .text("confidence_threshold", self.confidence_threshold.to_string());

        let resp = self.client.post(&url).multipart(form).send().await?;

        if !resp.status().is_success() {
            return Err(Error::Detector(format!(
                "Inference request failed: {}",
                resp.status()
            )));
        }

        let body: DetectResponse = resp.json().await?;
        Ok(filter_detections(body.detections, self.confidence_threshold))
    }

    async fn health_check(&self) -> bool {
        let url = format!("{}/healthz", self.base_url);
        match self.client.get(&url).send().await {
            Ok(resp) => resp.status().is_success(),
            Err(_) => false,
        }
    }
}

/// JPEG-encode a frame for upload on the blocking pool
async fn encode_upload(image: RgbImage) -> Result<Vec<u8>> {
    tokio::task::spawn_blocking(move || frame_transform::encode_jpeg(&image, UPLOAD_JPEG_QUALITY))
        .await
        .map_err(|e| Error::Internal(format!("Frame encode task failed: {}", e)))?
}

/// Apply the detection-level cutoff and fill in missing labels
fn filter_detections(raw: Vec<RawDetection>, threshold: f32) -> Vec<Detection> {
    raw.into_iter()
        .filter(|d| d.confidence >= threshold)
        .map(|d| Detection {
            class_name: d
                .class_name
                .filter(|n| !n.is_empty())
                .unwrap_or_else(|| class_name(d.class_id)),
            class_id: d.class_id,
            bbox: d.bbox,
            confidence: d.confidence,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_filter_detections() {
        let body = r#"{
            "detections": [
                {"class_id": 0, "bbox": [1.0, 2.0, 30.0, 40.0], "confidence": 0.91},
                {"class_id": 2, "class_name": "vehicle", "bbox": [5.0, 5.0, 9.0, 9.0], "confidence": 0.55},
                {"class_id": 16, "bbox": [0.0, 0.0, 3.0, 3.0], "confidence": 0.2}
            ]
        }"#;
        let resp: DetectResponse = serde_json::from_str(body).unwrap();

        let detections = filter_detections(resp.detections, 0.5);
        assert_eq!(detections.len(), 2);
        assert_eq!(detections[0].class_name, "person");
        assert_eq!(detections[1].class_name, "vehicle");
    }

    #[test]
    fn test_empty_response() {
        let resp: DetectResponse = serde_json::from_str("{}").unwrap();
        assert!(filter_detections(resp.detections, 0.5).is_empty());
    }

    #[test]
    fn test_detection_serialization() {
        let det = Detection::new(2, [1.0, 2.0, 3.0, 4.0], 0.75);
        let json = serde_json::to_value(&det).unwrap();

        assert_eq!(json["class_id"], 2);
        assert_eq!(json["class_name"], "car");
        assert_eq!(json["bbox"].as_array().unwrap().len(), 4);
    }

    #[tokio::test]
    async fn test_encode_upload() {
        let image = RgbImage::from_pixel(64, 48, image::Rgb([200, 10, 10]));
        let jpeg = encode_upload(image).await.unwrap();
        assert_eq!(&jpeg[..2], &[0xFF, 0xD8]);

        let decoded = image::load_from_memory(&jpeg).unwrap();
        assert_eq!((decoded.width(), decoded.height()), (64, 48));
    }

    #[test]
    fn test_base_url_trailing_slash() {
        let detector =
            HttpDetector::new("http://infer:9000/".to_string(), 0.5, Duration::from_secs(1))
                .unwrap();
        assert_eq!(detector.base_url(), "http://infer:9000");
    }
}
