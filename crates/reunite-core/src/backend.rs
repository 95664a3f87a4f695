//! ONNX Runtime embedding backend: SCRFD detection + ArcFace recognition.

use crate::detector::FaceDetector;
use crate::embedder::{EmbedderError, FaceEmbedder};
use crate::recognizer::{
    FaceRecognizer, ARCFACE_EMBEDDING_DIM, ARCFACE_MATCH_THRESHOLD, ARCFACE_MODEL_VERSION,
};
use crate::types::BoundingBox;
use image::RgbImage;
use std::path::Path;

/// File name of the SCRFD detection model inside the model directory.
pub const SCRFD_MODEL_FILE: &str = "det_10g.onnx";
/// File name of the ArcFace recognition model inside the model directory.
pub const ARCFACE_MODEL_FILE: &str = "w600k_r50.onnx";

pub struct OnnxEmbedder {
    detector: FaceDetector,
    recognizer: FaceRecognizer,
}

impl OnnxEmbedder {
    /// Load both models from `model_dir`. Fails fast if either is missing.
    pub fn load(model_dir: &Path, detection_confidence: f32) -> Result<Self, EmbedderError> {
        let detector = FaceDetector::load(&model_dir.join(SCRFD_MODEL_FILE), detection_confidence)?;
        let recognizer = FaceRecognizer::load(&model_dir.join(ARCFACE_MODEL_FILE))?;
        Ok(Self {
            detector,
            recognizer,
        })
    }
}

impl FaceEmbedder for OnnxEmbedder {
    fn model_version(&self) -> &str {
        ARCFACE_MODEL_VERSION
    }

    fn dimension(&self) -> usize {
        ARCFACE_EMBEDDING_DIM
    }

    fn default_threshold(&self) -> f32 {
        ARCFACE_MATCH_THRESHOLD
    }

    fn detect(&mut self, image: &RgbImage) -> Result<Vec<BoundingBox>, EmbedderError> {
        self.detector.detect(image)
    }

    fn extract(&mut self, image: &RgbImage, face: &BoundingBox) -> Result<Vec<f32>, EmbedderError> {
        self.recognizer.extract(image, face)
    }
}
