//! Registry query service: register and search missing children by photo.
//!
//! Every call returns its result directly to the caller. Nothing about a
//! request outlives it except the store write performed by `register`.

use crate::config::{CombinePolicy, Config, ConfigError};
use chrono::{DateTime, Utc};
use reunite_core::{
    Descriptor, EncodeError, EncodeOutcome, EuclideanMatcher, FaceEmbedder, FaceEncoder,
    MatchResult, Matcher, MissingChildRecord, RecordId, RegistryEntry,
};
use reunite_store::{DescriptorStore, RecordDirectory, StoreError};
use serde::Serialize;
use std::collections::HashSet;
use std::fmt;
use std::ops::RangeInclusive;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("registry store unavailable: {0}")]
    StoreUnavailable(#[source] StoreError),
    #[error("face encoding failed: {0}")]
    Encode(#[from] EncodeError),
    #[error("configuration: {0}")]
    Config(#[from] ConfigError),
    #[error("request did not complete within {0:?}")]
    DeadlineExceeded(Duration),
    #[error("failed to start engine thread: {0}")]
    EngineSpawn(#[source] std::io::Error),
    #[error("engine thread exited")]
    ChannelClosed,
}

impl From<StoreError> for RegistryError {
    fn from(err: StoreError) -> Self {
        RegistryError::StoreUnavailable(err)
    }
}

/// Why a photo or query was turned away. These are answers, not failures.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum Rejection {
    NoFaceDetected,
    MultipleFacesDetected { count: usize },
    ImageSizeOutOfRange { size: usize, min: usize, max: usize },
    EmptyQuery,
}

impl Rejection {
    /// Message suitable for showing to the person who uploaded the photo.
    pub fn message(&self) -> String {
        match self {
            Rejection::NoFaceDetected => "No face was recognized in the uploaded image. \
                 Please upload a clearer version of the same image or a different one."
                .to_string(),
            Rejection::MultipleFacesDetected { count } => format!(
                "{count} faces were recognized in the uploaded image. Please upload an \
                 image showing only the missing child's face to avoid ambiguity."
            ),
            Rejection::ImageSizeOutOfRange { size, min, max } => format!(
                "The uploaded image is {size} bytes. Please upload an image between \
                 {min} and {max} bytes."
            ),
            Rejection::EmptyQuery => "Please provide a name, a photo, or both.".to_string(),
        }
    }
}

impl fmt::Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum RegisterOutcome {
    Registered(RegistryEntry),
    Rejected(Rejection),
    /// The record already has a descriptor; the existing one was kept.
    DuplicateEntry(RecordId),
}

/// A missing-child record returned by a search.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MatchedChild {
    pub record: MissingChildRecord,
    /// Descriptor distance to the probe; `None` for name-only matches.
    pub distance: Option<f32>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SearchOutcome {
    Rejected(Rejection),
    /// Matching children, best first. Empty when nobody matched.
    Matched(Vec<MatchedChild>),
}

/// One registry entry joined with its record, for listing.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ListedEntry {
    pub record_id: RecordId,
    /// `None` when the record no longer exists in the directory.
    pub full_name: Option<String>,
    pub model_version: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RegistryStatus {
    pub entries: usize,
    pub model_version: String,
    pub descriptor_dim: usize,
    pub match_threshold: f32,
    pub combine_policy: CombinePolicy,
}

pub struct RegistryService<E> {
    encoder: FaceEncoder<E>,
    matcher: EuclideanMatcher,
    store: Arc<dyn DescriptorStore>,
    directory: Arc<dyn RecordDirectory>,
    image_bytes: RangeInclusive<usize>,
    combine_policy: CombinePolicy,
}

impl<E: FaceEmbedder> RegistryService<E> {
    /// Build a service from validated configuration.
    ///
    /// Fails if the configuration is invalid or the embedder's descriptor
    /// length differs from `descriptor_dim`.
    pub fn new(
        config: &Config,
        embedder: E,
        store: Arc<dyn DescriptorStore>,
        directory: Arc<dyn RecordDirectory>,
    ) -> Result<Self, RegistryError> {
        config.validate()?;
        if embedder.dimension() != config.descriptor_dim {
            return Err(ConfigError::Invalid(format!(
                "descriptor_dim is {} but model {} produces {}",
                config.descriptor_dim,
                embedder.model_version(),
                embedder.dimension()
            ))
            .into());
        }
        let threshold = match config.match_threshold {
            Some(threshold) => threshold,
            None => {
                let threshold = embedder.default_threshold();
                tracing::info!(
                    model = embedder.model_version(),
                    threshold,
                    "using the model's default match threshold"
                );
                threshold
            }
        };
        let matcher =
            EuclideanMatcher::new(threshold).map_err(|e| ConfigError::Invalid(e.to_string()))?;

        Ok(Self {
            encoder: FaceEncoder::new(embedder, config.max_image_dimension),
            matcher,
            store,
            directory,
            image_bytes: config.min_image_bytes..=config.max_image_bytes,
            combine_policy: config.combine_policy,
        })
    }

    pub fn model_version(&self) -> &str {
        self.encoder.model_version()
    }

    /// Encode the photo and store its descriptor under `record_id`.
    pub fn register(
        &mut self,
        record_id: &RecordId,
        image_bytes: &[u8],
    ) -> Result<RegisterOutcome, RegistryError> {
        let descriptor = match self.encode_probe(image_bytes)? {
            Ok(descriptor) => descriptor,
            Err(rejection) => {
                tracing::info!(record_id = %record_id, reason = ?rejection, "registration rejected");
                return Ok(RegisterOutcome::Rejected(rejection));
            }
        };

        match self.store.put(record_id, &descriptor) {
            Ok(entry) => {
                tracing::info!(
                    record_id = %record_id,
                    entry_id = %entry.entry_id,
                    model = descriptor.model_version(),
                    "registered"
                );
                Ok(RegisterOutcome::Registered(entry))
            }
            Err(StoreError::DuplicateEntry(id)) => {
                tracing::info!(record_id = %id, "record already registered; keeping existing entry");
                Ok(RegisterOutcome::DuplicateEntry(id))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Find registered children whose face matches the photo.
    pub fn search(&mut self, image_bytes: &[u8]) -> Result<SearchOutcome, RegistryError> {
        let probe = match self.encode_probe(image_bytes)? {
            Ok(descriptor) => descriptor,
            Err(rejection) => {
                tracing::info!(reason = ?rejection, "search rejected");
                return Ok(SearchOutcome::Rejected(rejection));
            }
        };
        let result = self.match_descriptor(&probe)?;
        Ok(SearchOutcome::Matched(self.assemble(result)?))
    }

    /// Search by name, photo, or both, combining per the configured policy.
    pub fn search_combined(
        &mut self,
        full_name: Option<&str>,
        image_bytes: Option<&[u8]>,
    ) -> Result<SearchOutcome, RegistryError> {
        let full_name = full_name.map(str::trim).filter(|n| !n.is_empty());

        match (full_name, image_bytes) {
            (None, None) => Ok(SearchOutcome::Rejected(Rejection::EmptyQuery)),
            (Some(name), None) => Ok(SearchOutcome::Matched(self.name_matches(name)?)),
            (None, Some(image)) => self.search(image),
            (Some(name), Some(image)) => {
                let by_image = match self.search(image)? {
                    SearchOutcome::Matched(children) => children,
                    rejected => return Ok(rejected),
                };
                let by_name = self.name_matches(name)?;
                Ok(SearchOutcome::Matched(combine(
                    self.combine_policy,
                    by_name,
                    by_image,
                )))
            }
        }
    }

    /// Compare a descriptor against every stored entry.
    pub fn match_descriptor(&self, probe: &Descriptor) -> Result<MatchResult, RegistryError> {
        let candidates = self.store.all()?;
        Ok(self.matcher.compare(probe, &candidates))
    }

    /// Drop the descriptor for a record. Returns whether one existed.
    pub fn remove(&self, record_id: &RecordId) -> Result<bool, RegistryError> {
        let removed = self.store.remove(record_id)?;
        if removed {
            tracing::info!(record_id = %record_id, "registry entry removed");
        }
        Ok(removed)
    }

    /// Remove entries whose record no longer exists. Returns how many were removed.
    pub fn prune_orphans(&self) -> Result<usize, RegistryError> {
        let mut pruned = 0;
        for entry in self.store.all()? {
            if self.directory.lookup(&entry.record_id)?.is_none()
                && self.store.remove(&entry.record_id)?
            {
                tracing::info!(record_id = %entry.record_id, "pruned orphaned entry");
                pruned += 1;
            }
        }
        Ok(pruned)
    }

    pub fn list(&self) -> Result<Vec<ListedEntry>, RegistryError> {
        let mut entries = self.store.all()?;
        entries.sort_by(|a, b| a.record_id.cmp(&b.record_id));
        entries
            .into_iter()
            .map(|entry| -> Result<ListedEntry, RegistryError> {
                let full_name = self.directory.lookup(&entry.record_id)?.map(|r| r.full_name);
                Ok(ListedEntry {
                    record_id: entry.record_id,
                    full_name,
                    model_version: entry.descriptor.model_version().to_string(),
                    created_at: entry.created_at,
                })
            })
            .collect()
    }

    pub fn status(&self) -> Result<RegistryStatus, RegistryError> {
        Ok(RegistryStatus {
            entries: self.store.len()?,
            model_version: self.encoder.model_version().to_string(),
            descriptor_dim: self.encoder.dimension(),
            match_threshold: self.matcher.threshold(),
            combine_policy: self.combine_policy,
        })
    }

    /// Size-check and encode a photo. The outer error is a failure; the inner
    /// one is a rejection to hand back to the uploader.
    fn encode_probe(
        &mut self,
        image_bytes: &[u8],
    ) -> Result<Result<Descriptor, Rejection>, RegistryError> {
        let size = image_bytes.len();
        if !self.image_bytes.contains(&size) {
            return Ok(Err(Rejection::ImageSizeOutOfRange {
                size,
                min: *self.image_bytes.start(),
                max: *self.image_bytes.end(),
            }));
        }

        Ok(match self.encoder.encode(image_bytes)? {
            EncodeOutcome::Single(descriptor) => Ok(descriptor),
            EncodeOutcome::NoFace => Err(Rejection::NoFaceDetected),
            EncodeOutcome::MultipleFaces { count } => Err(Rejection::MultipleFacesDetected { count }),
        })
    }

    fn assemble(&self, result: MatchResult) -> Result<Vec<MatchedChild>, RegistryError> {
        let mut children = Vec::with_capacity(result.hits.len());
        for hit in result.hits {
            match self.directory.lookup(&hit.record_id)? {
                Some(record) => children.push(MatchedChild {
                    record,
                    distance: Some(hit.distance),
                }),
                None => {
                    tracing::warn!(record_id = %hit.record_id, "skipping stale registry entry");
                }
            }
        }
        Ok(children)
    }

    fn name_matches(&self, full_name: &str) -> Result<Vec<MatchedChild>, RegistryError> {
        Ok(self
            .directory
            .find_by_name(full_name)?
            .into_iter()
            .map(|record| MatchedChild {
                record,
                distance: None,
            })
            .collect())
    }
}

/// Merge name and image results. Image order (best distance first) is kept.
fn combine(
    policy: CombinePolicy,
    by_name: Vec<MatchedChild>,
    by_image: Vec<MatchedChild>,
) -> Vec<MatchedChild> {
    match (policy, by_name.is_empty(), by_image.is_empty()) {
        (CombinePolicy::Lenient, true, _) => by_image,
        (CombinePolicy::Lenient, false, true) => by_name,
        _ => {
            let names: HashSet<&RecordId> = by_name.iter().map(|c| &c.record.id).collect();
            by_image
                .into_iter()
                .filter(|c| names.contains(&c.record.id))
                .collect()
        }
    }
}
