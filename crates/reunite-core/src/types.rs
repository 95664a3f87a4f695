use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use uuid::Uuid;

/// Opaque identifier of a missing-child record, issued by the CRUD layer.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RecordId(String);

impl RecordId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RecordId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for RecordId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum DescriptorError {
    #[error("descriptor blob is {actual} bytes, expected {expected} for the declared dimension")]
    LengthMismatch { expected: usize, actual: usize },
    #[error("declared descriptor dimension {0} is too large")]
    DimensionOverflow(usize),
}

/// Fixed-length face descriptor tagged with the model that produced it.
///
/// Fields are private: a descriptor is immutable once the encoder hands it out.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Descriptor {
    values: Vec<f32>,
    /// Embedding model that produced the values (e.g., "w600k_r50").
    model_version: String,
}

impl Descriptor {
    pub fn new(values: Vec<f32>, model_version: impl Into<String>) -> Self {
        Self {
            values,
            model_version: model_version.into(),
        }
    }

    pub fn values(&self) -> &[f32] {
        &self.values
    }

    pub fn dimension(&self) -> usize {
        self.values.len()
    }

    pub fn model_version(&self) -> &str {
        &self.model_version
    }

    /// Two descriptors are comparable only when the same model produced both.
    pub fn is_compatible(&self, other: &Descriptor) -> bool {
        self.model_version == other.model_version && self.values.len() == other.values.len()
    }

    /// Euclidean distance in descriptor space.
    pub fn euclidean_distance(&self, other: &Descriptor) -> f32 {
        self.values
            .iter()
            .zip(other.values.iter())
            .map(|(a, b)| (a - b).powi(2))
            .sum::<f32>()
            .sqrt()
    }

    /// Little-endian `f32` encoding used for persistence.
    pub fn to_le_bytes(&self) -> Vec<u8> {
        self.values.iter().flat_map(|v| v.to_le_bytes()).collect()
    }

    pub fn from_le_bytes(
        bytes: &[u8],
        dimension: usize,
        model_version: impl Into<String>,
    ) -> Result<Self, DescriptorError> {
        let expected = dimension
            .checked_mul(4)
            .ok_or(DescriptorError::DimensionOverflow(dimension))?;
        if bytes.len() != expected {
            return Err(DescriptorError::LengthMismatch {
                expected,
                actual: bytes.len(),
            });
        }
        let values = bytes
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect();
        Ok(Self::new(values, model_version))
    }
}

/// Bounding box for a detected face, with optional facial landmarks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub confidence: f32,
    /// Five-point facial landmarks: [left_eye, right_eye, nose, left_mouth, right_mouth].
    pub landmarks: Option<[(f32, f32); 5]>,
}

impl BoundingBox {
    pub fn area(&self) -> f32 {
        self.width.max(0.0) * self.height.max(0.0)
    }

    /// Intersection-over-union with another box, 0.0 when disjoint.
    pub fn iou(&self, other: &BoundingBox) -> f32 {
        let left = self.x.max(other.x);
        let top = self.y.max(other.y);
        let right = (self.x + self.width).min(other.x + other.width);
        let bottom = (self.y + self.height).min(other.y + other.height);

        let overlap = (right - left).max(0.0) * (bottom - top).max(0.0);
        let union = self.area() + other.area() - overlap;
        if union > 0.0 {
            overlap / union
        } else {
            0.0
        }
    }
}

/// Persisted association between a missing-child record and its descriptor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegistryEntry {
    pub entry_id: Uuid,
    pub record_id: RecordId,
    pub descriptor: Descriptor,
    pub created_at: DateTime<Utc>,
}

impl RegistryEntry {
    pub fn new(record_id: RecordId, descriptor: Descriptor) -> Self {
        Self {
            entry_id: Uuid::new_v4(),
            record_id,
            descriptor,
            created_at: Utc::now(),
        }
    }
}

/// Display attributes of a missing-child record, as seen by the registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MissingChildRecord {
    pub id: RecordId,
    pub full_name: String,
    pub guardian_contact: Option<String>,
}

/// One registry entry within the decision threshold of a probe.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchHit {
    pub record_id: RecordId,
    pub distance: f32,
}

/// Every registry entry within the threshold, best (smallest distance) first.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MatchResult {
    pub hits: Vec<MatchHit>,
    /// Candidates skipped because another model version produced them.
    pub skipped_incompatible: usize,
}

impl MatchResult {
    pub fn is_empty(&self) -> bool {
        self.hits.is_empty()
    }

    pub fn len(&self) -> usize {
        self.hits.len()
    }

    pub fn contains(&self, record_id: &RecordId) -> bool {
        self.hits.iter().any(|h| &h.record_id == record_id)
    }
}
