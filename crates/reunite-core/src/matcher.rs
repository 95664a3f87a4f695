//! Threshold matching of a probe descriptor against registry entries.

use crate::types::{Descriptor, MatchHit, MatchResult, RegistryEntry};
use thiserror::Error;

/// Decision threshold used by the reference dlib-style 128-d embeddings.
pub const DEFAULT_MATCH_THRESHOLD: f32 = 0.6;

#[derive(Error, Debug, PartialEq)]
#[error("match threshold must be a finite, positive distance (got {0})")]
pub struct InvalidThreshold(pub f32);

/// Strategy for comparing a probe descriptor against registry entries.
pub trait Matcher {
    fn compare(&self, probe: &Descriptor, candidates: &[RegistryEntry]) -> MatchResult;
}

/// Euclidean-distance matcher with an inclusive decision threshold.
///
/// Every candidate within the threshold is returned; there is no top-1
/// selection. Hits are ordered by ascending distance, then by record id.
#[derive(Debug, Clone, Copy)]
pub struct EuclideanMatcher {
    threshold: f32,
}

impl EuclideanMatcher {
    pub fn new(threshold: f32) -> Result<Self, InvalidThreshold> {
        if !threshold.is_finite() || threshold <= 0.0 {
            return Err(InvalidThreshold(threshold));
        }
        Ok(Self { threshold })
    }

    pub fn threshold(&self) -> f32 {
        self.threshold
    }
}

impl Matcher for EuclideanMatcher {
    fn compare(&self, probe: &Descriptor, candidates: &[RegistryEntry]) -> MatchResult {
        let mut result = MatchResult::default();

        for entry in candidates {
            if !probe.is_compatible(&entry.descriptor) {
                tracing::warn!(
                    record_id = %entry.record_id,
                    entry_model = entry.descriptor.model_version(),
                    entry_dim = entry.descriptor.dimension(),
                    probe_model = probe.model_version(),
                    probe_dim = probe.dimension(),
                    "model version mismatch; skipping registry entry"
                );
                result.skipped_incompatible += 1;
                continue;
            }

            let distance = probe.euclidean_distance(&entry.descriptor);
            // NaN never satisfies the comparison, so corrupt entries fall out here.
            if distance <= self.threshold {
                result.hits.push(MatchHit {
                    record_id: entry.record_id.clone(),
                    distance,
                });
            }
        }

        result.hits.sort_by(|a, b| {
            a.distance
                .total_cmp(&b.distance)
                .then_with(|| a.record_id.cmp(&b.record_id))
        });

        tracing::debug!(
            candidates = candidates.len(),
            hits = result.hits.len(),
            skipped = result.skipped_incompatible,
            threshold = self.threshold,
            "match complete"
        );

        result
    }
}
