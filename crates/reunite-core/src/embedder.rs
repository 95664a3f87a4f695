//! Seam between the encoder and whatever model produces face embeddings.

use crate::matcher::DEFAULT_MATCH_THRESHOLD;
use crate::types::BoundingBox;
use image::RgbImage;
use thiserror::Error;

/// Default minimum detection score for a face region.
pub const DEFAULT_DETECTION_CONFIDENCE: f32 = 0.5;

#[derive(Error, Debug)]
pub enum EmbedderError {
    #[error("model file not found: {0}; download it from insightface and place in the model directory")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("face has no landmarks; the detector must return landmarks for alignment")]
    NoLandmarks,
    #[cfg(feature = "onnx")]
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// An external face embedding extractor.
///
/// Implementations locate faces in an RGB image and turn one located face into
/// a fixed-length vector. They must be deterministic for a fixed model version.
pub trait FaceEmbedder {
    /// Tag stored next to every descriptor this extractor produces.
    fn model_version(&self) -> &str;

    /// Length of every vector returned by [`extract`](Self::extract).
    fn dimension(&self) -> usize;

    /// Euclidean match threshold suited to this model's descriptor space,
    /// used when the caller configures none.
    fn default_threshold(&self) -> f32 {
        DEFAULT_MATCH_THRESHOLD
    }

    /// Locate every face in the image.
    fn detect(&mut self, image: &RgbImage) -> Result<Vec<BoundingBox>, EmbedderError>;

    /// Extract the embedding of one detected face.
    fn extract(&mut self, image: &RgbImage, face: &BoundingBox) -> Result<Vec<f32>, EmbedderError>;
}

impl<E: FaceEmbedder + ?Sized> FaceEmbedder for Box<E> {
    fn model_version(&self) -> &str {
        (**self).model_version()
    }

    fn dimension(&self) -> usize {
        (**self).dimension()
    }

    fn default_threshold(&self) -> f32 {
        (**self).default_threshold()
    }

    fn detect(&mut self, image: &RgbImage) -> Result<Vec<BoundingBox>, EmbedderError> {
        (**self).detect(image)
    }

    fn extract(&mut self, image: &RgbImage, face: &BoundingBox) -> Result<Vec<f32>, EmbedderError> {
        (**self).extract(image, face)
    }
}
