//! SCRFD face detector via ONNX Runtime.
//!
//! Anchor-free decoding over three stride levels followed by NMS. Input photos
//! are letterboxed into the top-left corner of a 640×640 canvas.

use crate::embedder::EmbedderError;
use crate::types::BoundingBox;
use image::imageops::{self, FilterType};
use image::RgbImage;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;

const SCRFD_INPUT_SIZE: u32 = 640;
const SCRFD_MEAN: f32 = 127.5;
const SCRFD_STD: f32 = 128.0;
const SCRFD_NMS_THRESHOLD: f32 = 0.4;
const SCRFD_STRIDES: [usize; 3] = [8, 16, 32];
const SCRFD_ANCHORS_PER_CELL: usize = 2;

/// Output tensor positions for one stride level.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct LevelOutputs {
    score: usize,
    bbox: usize,
    kps: usize,
}

/// Raw tensors of one stride level, borrowed from the session outputs.
struct LevelTensors<'a> {
    stride: usize,
    scores: &'a [f32],
    bboxes: &'a [f32],
    kps: &'a [f32],
}

/// SCRFD-based face detector.
pub struct FaceDetector {
    session: Session,
    levels: [LevelOutputs; 3],
    confidence_threshold: f32,
}

impl FaceDetector {
    /// Load the SCRFD ONNX model from the given path.
    pub fn load(model_path: &Path, confidence_threshold: f32) -> Result<Self, EmbedderError> {
        if !model_path.exists() {
            return Err(EmbedderError::ModelNotFound(model_path.display().to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;

        let output_names: Vec<String> = session
            .outputs()
            .iter()
            .map(|o| o.name().to_string())
            .collect();

        tracing::info!(
            path = %model_path.display(),
            outputs = ?output_names,
            "loaded SCRFD model"
        );

        if output_names.len() < 9 {
            return Err(EmbedderError::InferenceFailed(format!(
                "SCRFD model requires 9 outputs (3 strides × score/bbox/kps), got {}",
                output_names.len()
            )));
        }

        let levels = resolve_level_outputs(&output_names);
        tracing::debug!(?levels, "SCRFD output tensor mapping");

        Ok(Self {
            session,
            levels,
            confidence_threshold,
        })
    }

    /// Detect faces in an RGB photo, strongest detection first.
    pub fn detect(&mut self, image: &RgbImage) -> Result<Vec<BoundingBox>, EmbedderError> {
        if image.width() == 0 || image.height() == 0 {
            return Ok(Vec::new());
        }

        let (input, scale) = preprocess(image);
        let outputs = self
            .session
            .run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let mut candidates = Vec::new();
        for (level, &stride) in self.levels.iter().zip(SCRFD_STRIDES.iter()) {
            let extract = |idx: usize, what: &str| {
                outputs[idx]
                    .try_extract_tensor::<f32>()
                    .map(|(_, data)| data)
                    .map_err(|e| {
                        EmbedderError::InferenceFailed(format!("{what} stride {stride}: {e}"))
                    })
            };

            let tensors = LevelTensors {
                stride,
                scores: extract(level.score, "scores")?,
                bboxes: extract(level.bbox, "bboxes")?,
                kps: extract(level.kps, "kps")?,
            };
            candidates.extend(decode_level(&tensors, scale, self.confidence_threshold));
        }

        let faces = suppress_overlaps(candidates, SCRFD_NMS_THRESHOLD);
        tracing::debug!(faces = faces.len(), "SCRFD detection complete");
        Ok(faces)
    }
}

/// Resize to fit the detector canvas and build a normalized NCHW tensor.
///
/// Returns the tensor and the scale applied to the source image.
fn preprocess(image: &RgbImage) -> (Array4<f32>, f32) {
    let canvas = SCRFD_INPUT_SIZE as usize;
    let scale = (SCRFD_INPUT_SIZE as f32 / image.width() as f32)
        .min(SCRFD_INPUT_SIZE as f32 / image.height() as f32);
    let new_w = ((image.width() as f32 * scale).round() as u32).clamp(1, SCRFD_INPUT_SIZE);
    let new_h = ((image.height() as f32 * scale).round() as u32).clamp(1, SCRFD_INPUT_SIZE);

    let resized = imageops::resize(image, new_w, new_h, FilterType::Triangle);

    // Unfilled canvas is zero, which is what the mean pixel normalizes to.
    let mut tensor = Array4::<f32>::zeros((1, 3, canvas, canvas));
    for (x, y, pixel) in resized.enumerate_pixels() {
        for c in 0..3 {
            tensor[[0, c, y as usize, x as usize]] = (pixel[c] as f32 - SCRFD_MEAN) / SCRFD_STD;
        }
    }

    (tensor, scale)
}

/// Map stride levels to output tensors.
///
/// Exports that name tensors `score_8`, `bbox_16`, `kps_32`, ... are mapped by
/// name; anything else uses the standard order of scores, bboxes, then kps.
fn resolve_level_outputs(names: &[String]) -> [LevelOutputs; 3] {
    let position = |prefix: &str, stride: usize| {
        let wanted = format!("{prefix}_{stride}");
        names.iter().position(|n| *n == wanted)
    };

    let by_name: Option<Vec<LevelOutputs>> = SCRFD_STRIDES
        .iter()
        .map(|&stride| {
            Some(LevelOutputs {
                score: position("score", stride)?,
                bbox: position("bbox", stride)?,
                kps: position("kps", stride)?,
            })
        })
        .collect();

    match by_name {
        Some(levels) => {
            tracing::info!("SCRFD: using name-based output tensor mapping");
            [levels[0], levels[1], levels[2]]
        }
        None => {
            tracing::info!(?names, "SCRFD: output names not recognized, using positional mapping");
            std::array::from_fn(|i| LevelOutputs {
                score: i,
                bbox: i + 3,
                kps: i + 6,
            })
        }
    }
}

/// Decode all anchors of one stride level above the confidence threshold.
fn decode_level(tensors: &LevelTensors<'_>, scale: f32, threshold: f32) -> Vec<BoundingBox> {
    let stride = tensors.stride as f32;
    let grid_w = SCRFD_INPUT_SIZE as usize / tensors.stride;
    let to_source = |v: f32| v / scale;

    tensors
        .scores
        .iter()
        .enumerate()
        .filter(|(_, &score)| score > threshold)
        .filter_map(|(idx, &score)| {
            let cell = idx / SCRFD_ANCHORS_PER_CELL;
            let cx = (cell % grid_w) as f32 * stride;
            let cy = (cell / grid_w) as f32 * stride;

            let d = tensors.bboxes.get(idx * 4..idx * 4 + 4)?;
            let x1 = to_source(cx - d[0] * stride);
            let y1 = to_source(cy - d[1] * stride);
            let x2 = to_source(cx + d[2] * stride);
            let y2 = to_source(cy + d[3] * stride);

            let landmarks = tensors.kps.get(idx * 10..idx * 10 + 10).map(|k| {
                std::array::from_fn(|i| {
                    (
                        to_source(cx + k[i * 2] * stride),
                        to_source(cy + k[i * 2 + 1] * stride),
                    )
                })
            });

            Some(BoundingBox {
                x: x1,
                y: y1,
                width: x2 - x1,
                height: y2 - y1,
                confidence: score,
                landmarks,
            })
        })
        .collect()
}

/// Greedy non-maximum suppression, strongest first.
fn suppress_overlaps(mut candidates: Vec<BoundingBox>, iou_threshold: f32) -> Vec<BoundingBox> {
    candidates.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));

    let mut kept: Vec<BoundingBox> = Vec::new();
    for candidate in candidates {
        if kept.iter().all(|k| k.iou(&candidate) <= iou_threshold) {
            kept.push(candidate);
        }
    }
    kept
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedder::DEFAULT_DETECTION_CONFIDENCE;
    use image::Rgb;

    fn make_bbox(x: f32, y: f32, w: f32, h: f32, conf: f32) -> BoundingBox {
        BoundingBox { x, y, width: w, height: h, confidence: conf, landmarks: None }
    }

    #[test]
    fn test_nms_suppresses_overlapping() {
        let detections = vec![
            make_bbox(5.0, 5.0, 100.0, 100.0, 0.8),
            make_bbox(0.0, 0.0, 100.0, 100.0, 0.9),
            make_bbox(200.0, 200.0, 50.0, 50.0, 0.7),
        ];
        let kept = suppress_overlaps(detections, 0.4);
        assert_eq!(kept.len(), 2);
        assert!((kept[0].confidence - 0.9).abs() < 1e-6);
        assert!((kept[1].confidence - 0.7).abs() < 1e-6);
    }

    #[test]
    fn test_nms_keeps_two_separate_faces() {
        // Two children side by side must stay two detections.
        let detections = vec![
            make_bbox(0.0, 0.0, 10.0, 10.0, 0.9),
            make_bbox(50.0, 50.0, 10.0, 10.0, 0.8),
        ];
        assert_eq!(suppress_overlaps(detections, 0.4).len(), 2);
    }

    #[test]
    fn test_nms_empty() {
        assert!(suppress_overlaps(vec![], 0.4).is_empty());
    }

    #[test]
    fn test_resolve_named_outputs() {
        let names: Vec<String> = [
            "bbox_8", "kps_8", "score_8",
            "bbox_16", "kps_16", "score_16",
            "bbox_32", "kps_32", "score_32",
        ].iter().map(|s| s.to_string()).collect();

        let levels = resolve_level_outputs(&names);
        assert_eq!(levels[0], LevelOutputs { score: 2, bbox: 0, kps: 1 });
        assert_eq!(levels[2], LevelOutputs { score: 8, bbox: 6, kps: 7 });
    }

    #[test]
    fn test_resolve_positional_fallback() {
        let names: Vec<String> = (0..9).map(|i: usize| (428 + i).to_string()).collect();
        let levels = resolve_level_outputs(&names);
        assert_eq!(levels[1], LevelOutputs { score: 1, bbox: 4, kps: 7 });
    }

    #[test]
    fn test_decode_maps_back_to_source_scale() {
        // Single anchor at cell (1, 1) of stride 8, box offsets of one stride.
        let grid_w = SCRFD_INPUT_SIZE as usize / 8;
        let anchor = (grid_w + 1) * SCRFD_ANCHORS_PER_CELL;
        let mut scores = vec![0.0f32; anchor + 1];
        scores[anchor] = 0.9;
        let mut bboxes = vec![0.0f32; (anchor + 1) * 4];
        bboxes[anchor * 4..anchor * 4 + 4].copy_from_slice(&[1.0, 1.0, 1.0, 1.0]);
        let kps = vec![0.0f32; (anchor + 1) * 10];

        let tensors = LevelTensors { stride: 8, scores: &scores, bboxes: &bboxes, kps: &kps };
        let faces = decode_level(&tensors, 2.0, DEFAULT_DETECTION_CONFIDENCE);

        assert_eq!(faces.len(), 1);
        let face = &faces[0];
        // Canvas box (0, 0)-(16, 16) at scale 2 is (0, 0)-(8, 8) in the source.
        assert!((face.x - 0.0).abs() < 1e-6 && (face.width - 8.0).abs() < 1e-6);
        let landmarks = face.landmarks.unwrap();
        assert!((landmarks[0].0 - 4.0).abs() < 1e-6);
    }

    #[test]
    fn test_decode_skips_low_scores() {
        let scores = vec![0.1f32, 0.5, 0.2];
        let bboxes = vec![1.0f32; 12];
        let tensors = LevelTensors { stride: 32, scores: &scores, bboxes: &bboxes, kps: &[] };
        let faces = decode_level(&tensors, 1.0, 0.5);
        assert!(faces.is_empty());
    }

    #[test]
    fn test_preprocess_letterbox_top_left() {
        let image = RgbImage::from_pixel(320, 160, Rgb([255, 255, 255]));
        let (tensor, scale) = preprocess(&image);
        assert_eq!(tensor.shape(), &[1, 3, 640, 640]);
        assert!((scale - 2.0).abs() < 1e-6);
        let white = (255.0 - SCRFD_MEAN) / SCRFD_STD;
        assert!((tensor[[0, 0, 0, 0]] - white).abs() < 1e-4);
        // Below the resized 640x320 region is padding.
        assert_eq!(tensor[[0, 2, 400, 10]], 0.0);
    }
}
