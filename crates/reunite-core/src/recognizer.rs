//! ArcFace face recognizer via ONNX Runtime.
//!
//! Extracts 512-dimensional, L2-normalized embeddings from aligned face crops
//! using the w600k_r50 ArcFace model.

use crate::alignment::{self, ALIGNED_SIZE};
use crate::embedder::EmbedderError;
use crate::types::BoundingBox;
use image::RgbImage;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;

const ARCFACE_MEAN: f32 = 127.5;
const ARCFACE_STD: f32 = 127.5; // not 128.0; ArcFace normalizes symmetrically
pub const ARCFACE_EMBEDDING_DIM: usize = 512;
pub const ARCFACE_MODEL_VERSION: &str = "w600k_r50";
/// Euclidean threshold for unit-norm ArcFace embeddings (cosine similarity of about 0.4).
pub const ARCFACE_MATCH_THRESHOLD: f32 = 1.1;

/// ArcFace-based face recognizer.
pub struct FaceRecognizer {
    session: Session,
}

impl FaceRecognizer {
    /// Load the ArcFace ONNX model from the given path.
    pub fn load(model_path: &Path) -> Result<Self, EmbedderError> {
        if !model_path.exists() {
            return Err(EmbedderError::ModelNotFound(model_path.display().to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;

        tracing::info!(
            path = %model_path.display(),
            outputs = ?session.outputs().iter().map(|o| o.name()).collect::<Vec<_>>(),
            "loaded ArcFace model"
        );

        Ok(Self { session })
    }

    /// Extract the embedding of one detected face.
    ///
    /// The face must carry landmarks; it is aligned to the canonical 112×112
    /// position before inference.
    pub fn extract(&mut self, image: &RgbImage, face: &BoundingBox) -> Result<Vec<f32>, EmbedderError> {
        let landmarks = face.landmarks.as_ref().ok_or(EmbedderError::NoLandmarks)?;
        let aligned = alignment::align_face(image, landmarks);
        let input = preprocess(&aligned);

        let outputs = self
            .session
            .run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let (_, raw) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| EmbedderError::InferenceFailed(format!("embedding extraction: {e}")))?;

        if raw.len() != ARCFACE_EMBEDDING_DIM {
            return Err(EmbedderError::InferenceFailed(format!(
                "expected {ARCFACE_EMBEDDING_DIM}-dim embedding, got {}",
                raw.len()
            )));
        }

        Ok(l2_normalize(raw))
    }
}

/// Aligned RGB crop to a normalized NCHW tensor.
fn preprocess(aligned: &RgbImage) -> Array4<f32> {
    let size = ALIGNED_SIZE as usize;
    let mut tensor = Array4::<f32>::zeros((1, 3, size, size));
    for (x, y, pixel) in aligned.enumerate_pixels() {
        for c in 0..3 {
            tensor[[0, c, y as usize, x as usize]] = (pixel[c] as f32 - ARCFACE_MEAN) / ARCFACE_STD;
        }
    }
    tensor
}

fn l2_normalize(raw: &[f32]) -> Vec<f32> {
    let norm = raw.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        raw.iter().map(|x| x / norm).collect()
    } else {
        raw.to_vec()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::matcher::{EuclideanMatcher, Matcher, DEFAULT_MATCH_THRESHOLD};
    use crate::types::{Descriptor, RecordId, RegistryEntry};
    use image::Rgb;

    /// Unit vectors in 512-d space whose cosine similarity is `cos`.
    fn unit_pair(cos: f32) -> (Vec<f32>, Vec<f32>) {
        let mut a = vec![0.0; ARCFACE_EMBEDDING_DIM];
        let mut b = vec![0.0; ARCFACE_EMBEDDING_DIM];
        a[0] = 1.0;
        b[0] = cos;
        b[1] = (1.0 - cos * cos).sqrt();
        (a, b)
    }

    #[test]
    fn test_arcface_threshold_accepts_typical_same_person_pair() {
        let (a, b) = unit_pair(0.6);
        let probe = Descriptor::new(a, ARCFACE_MODEL_VERSION);
        let registered = [RegistryEntry::new(
            RecordId::new("child-1"),
            Descriptor::new(b, ARCFACE_MODEL_VERSION),
        )];

        let strict = EuclideanMatcher::new(DEFAULT_MATCH_THRESHOLD).unwrap();
        assert!(strict.compare(&probe, &registered).is_empty());

        let arcface = EuclideanMatcher::new(ARCFACE_MATCH_THRESHOLD).unwrap();
        assert_eq!(arcface.compare(&probe, &registered).len(), 1);
    }

    #[test]
    fn test_arcface_threshold_rejects_unrelated_pair() {
        let (a, b) = unit_pair(0.0);
        let probe = Descriptor::new(a, ARCFACE_MODEL_VERSION);
        let registered = [RegistryEntry::new(
            RecordId::new("other"),
            Descriptor::new(b, ARCFACE_MODEL_VERSION),
        )];
        let arcface = EuclideanMatcher::new(ARCFACE_MATCH_THRESHOLD).unwrap();
        assert!(arcface.compare(&probe, &registered).is_empty());
    }

    #[test]
    fn test_preprocess_output_shape() {
        let aligned = RgbImage::from_pixel(ALIGNED_SIZE, ALIGNED_SIZE, Rgb([128, 128, 128]));
        let tensor = preprocess(&aligned);
        assert_eq!(tensor.shape(), &[1, 3, 112, 112]);
    }

    #[test]
    fn test_preprocess_keeps_channel_order() {
        let aligned = RgbImage::from_pixel(ALIGNED_SIZE, ALIGNED_SIZE, Rgb([255, 127, 0]));
        let tensor = preprocess(&aligned);
        assert!((tensor[[0, 0, 5, 5]] - 1.0).abs() < 1e-6);
        assert!((tensor[[0, 1, 5, 5]] - (127.0 - ARCFACE_MEAN) / ARCFACE_STD).abs() < 1e-6);
        assert!((tensor[[0, 2, 5, 5]] + 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_l2_normalize_unit_length() {
        let v = l2_normalize(&[3.0, 4.0]);
        assert!((v[0] - 0.6).abs() < 1e-6 && (v[1] - 0.8).abs() < 1e-6);
    }

    #[test]
    fn test_l2_normalize_zero_vector_untouched() {
        assert_eq!(l2_normalize(&[0.0, 0.0]), vec![0.0, 0.0]);
    }
}
