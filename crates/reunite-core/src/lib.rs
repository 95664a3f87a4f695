//! reunite-core: face encoding and descriptor matching for the missing-child registry.
//!
//! The encoder turns a photo into exactly one face descriptor (or reports that
//! it found none or several); the matcher compares a probe descriptor against
//! registered ones. Embedding extraction is pluggable through [`FaceEmbedder`];
//! the `onnx` feature ships an SCRFD + ArcFace backend.

pub mod embedder;
pub mod encoder;
pub mod matcher;
pub mod types;

#[cfg(feature = "onnx")]
mod alignment;
#[cfg(feature = "onnx")]
pub mod backend;
#[cfg(feature = "onnx")]
pub mod detector;
#[cfg(feature = "onnx")]
pub mod recognizer;

#[cfg(feature = "onnx")]
pub use backend::OnnxEmbedder;
pub use embedder::{EmbedderError, FaceEmbedder, DEFAULT_DETECTION_CONFIDENCE};
pub use encoder::{EncodeError, EncodeOutcome, FaceEncoder, DEFAULT_MAX_IMAGE_DIMENSION};
pub use matcher::{EuclideanMatcher, InvalidThreshold, Matcher, DEFAULT_MATCH_THRESHOLD};
pub use types::{
    BoundingBox, Descriptor, DescriptorError, MatchHit, MatchResult, MissingChildRecord, RecordId,
    RegistryEntry,
};
