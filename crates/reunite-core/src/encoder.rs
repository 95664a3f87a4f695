//! Face encoder: image bytes in, zero/one/many-face outcome out.

use crate::embedder::{EmbedderError, FaceEmbedder};
use crate::types::Descriptor;
use image::imageops::FilterType;
use image::{DynamicImage, GenericImageView, RgbImage};
use thiserror::Error;

/// Longest image side accepted before downscaling.
pub const DEFAULT_MAX_IMAGE_DIMENSION: u32 = 1600;

#[derive(Error, Debug)]
pub enum EncodeError {
    #[error("image could not be decoded: {0}")]
    Decode(#[from] image::ImageError),
    #[error("embedding backend: {0}")]
    Embedder(#[from] EmbedderError),
    #[error("embedding backend returned {actual} dimensions, expected {expected}")]
    DimensionMismatch { expected: usize, actual: usize },
}

/// Result of encoding one image.
#[derive(Debug, Clone, PartialEq)]
pub enum EncodeOutcome {
    /// No face found; the caller should ask for a clearer photo.
    NoFace,
    /// More than one face found; the encoder refuses to guess the subject.
    MultipleFaces { count: usize },
    /// Exactly one face, with its descriptor.
    Single(Descriptor),
}

/// Wraps a [`FaceEmbedder`] with decoding, downscaling and face-count checks.
pub struct FaceEncoder<E> {
    embedder: E,
    max_dimension: u32,
}

impl<E: FaceEmbedder> FaceEncoder<E> {
    pub fn new(embedder: E, max_dimension: u32) -> Self {
        Self {
            embedder,
            max_dimension,
        }
    }

    pub fn model_version(&self) -> &str {
        self.embedder.model_version()
    }

    pub fn dimension(&self) -> usize {
        self.embedder.dimension()
    }

    /// Decode raw image bytes and encode the single face they contain.
    pub fn encode(&mut self, image_bytes: &[u8]) -> Result<EncodeOutcome, EncodeError> {
        let decoded = image::load_from_memory(image_bytes)?;
        let image = self.downscale(decoded);
        self.encode_image(&image)
    }

    /// Encode an already-decoded image. No downscaling is applied.
    pub fn encode_image(&mut self, image: &RgbImage) -> Result<EncodeOutcome, EncodeError> {
        let faces = self.embedder.detect(image)?;

        let face = match faces.as_slice() {
            [] => {
                tracing::debug!(
                    width = image.width(),
                    height = image.height(),
                    "encode: no face detected"
                );
                return Ok(EncodeOutcome::NoFace);
            }
            [face] => face,
            many => {
                tracing::debug!(count = many.len(), "encode: multiple faces detected");
                return Ok(EncodeOutcome::MultipleFaces { count: many.len() });
            }
        };

        let values = self.embedder.extract(image, face)?;
        let expected = self.embedder.dimension();
        if values.len() != expected {
            return Err(EncodeError::DimensionMismatch {
                expected,
                actual: values.len(),
            });
        }

        tracing::debug!(
            confidence = face.confidence,
            model = self.embedder.model_version(),
            "encode: single face encoded"
        );

        Ok(EncodeOutcome::Single(Descriptor::new(
            values,
            self.embedder.model_version(),
        )))
    }

    /// Shrink so the longer side is at most `max_dimension`, keeping aspect ratio.
    fn downscale(&self, image: DynamicImage) -> RgbImage {
        let (width, height) = image.dimensions();
        if width.max(height) <= self.max_dimension {
            return image.into_rgb8();
        }

        tracing::debug!(
            width,
            height,
            cap = self.max_dimension,
            "downscaling image before detection"
        );
        image
            .resize(self.max_dimension, self.max_dimension, FilterType::Lanczos3)
            .into_rgb8()
    }
}
