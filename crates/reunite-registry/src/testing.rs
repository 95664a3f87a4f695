//! Shared fixtures for unit tests.

use crate::config::Config;
use image::{DynamicImage, ImageFormat, Rgb, RgbImage};
use reunite_core::{
    BoundingBox, Descriptor, EmbedderError, FaceEmbedder, RecordId, RegistryEntry,
    DEFAULT_MATCH_THRESHOLD,
};
use reunite_store::{DescriptorStore, StoreError};
use std::io::Cursor;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

/// Embedder driven by pixel values instead of a model.
///
/// Pixel (0,0) carries the face count in red and the identity in green and
/// blue; pixel (1,0) red is per-photo jitter. Photos of one identity land
/// within 0.255 of each other, distinct identities at least 0.01 per step.
pub struct ScriptedEmbedder {
    delay: Duration,
    threshold: f32,
}

impl ScriptedEmbedder {
    pub fn new() -> Self {
        Self {
            delay: Duration::ZERO,
            threshold: DEFAULT_MATCH_THRESHOLD,
        }
    }

    /// Sleep this long in every `detect` call.
    pub fn slow(delay: Duration) -> Self {
        Self {
            delay,
            ..Self::new()
        }
    }

    /// Report `threshold` as the model's default match threshold.
    pub fn with_threshold(mut self, threshold: f32) -> Self {
        self.threshold = threshold;
        self
    }
}

impl FaceEmbedder for ScriptedEmbedder {
    fn model_version(&self) -> &str {
        "scripted-v1"
    }

    fn dimension(&self) -> usize {
        4
    }

    fn default_threshold(&self) -> f32 {
        self.threshold
    }

    fn detect(&mut self, image: &RgbImage) -> Result<Vec<BoundingBox>, EmbedderError> {
        if !self.delay.is_zero() {
            std::thread::sleep(self.delay);
        }
        let faces = image.get_pixel(0, 0).0[0] as usize;
        Ok((0..faces)
            .map(|i| BoundingBox {
                x: i as f32,
                y: 0.0,
                width: 1.0,
                height: 1.0,
                confidence: 0.99,
                landmarks: None,
            })
            .collect())
    }

    fn extract(&mut self, image: &RgbImage, _face: &BoundingBox) -> Result<Vec<f32>, EmbedderError> {
        let [_, g, b] = image.get_pixel(0, 0).0;
        let jitter = image.get_pixel(1, 0).0[0];
        Ok(vec![
            g as f32 / 100.0,
            b as f32 / 100.0,
            jitter as f32 / 1000.0,
            0.0,
        ])
    }
}

/// PNG understood by [`ScriptedEmbedder`].
pub fn photo(faces: u8, g: u8, b: u8, jitter: u8) -> Vec<u8> {
    let mut img = RgbImage::new(4, 1);
    img.put_pixel(0, 0, Rgb([faces, g, b]));
    img.put_pixel(1, 0, Rgb([jitter, 0, 0]));
    let mut out = Cursor::new(Vec::new());
    DynamicImage::ImageRgb8(img)
        .write_to(&mut out, ImageFormat::Png)
        .unwrap();
    out.into_inner()
}

/// Defaults sized for tiny test photos and the 4-wide scripted descriptor.
pub fn test_config() -> Config {
    Config {
        min_image_bytes: 1,
        descriptor_dim: 4,
        request_timeout_secs: 5,
        ..Config::default()
    }
}

/// Store wrapper that counts writes and full scans.
pub struct CountingStore<S> {
    inner: S,
    puts: AtomicUsize,
    scans: AtomicUsize,
}

impl<S> CountingStore<S> {
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            puts: AtomicUsize::new(0),
            scans: AtomicUsize::new(0),
        }
    }

    pub fn puts(&self) -> usize {
        self.puts.load(Ordering::SeqCst)
    }

    pub fn scans(&self) -> usize {
        self.scans.load(Ordering::SeqCst)
    }
}

impl<S: DescriptorStore> DescriptorStore for CountingStore<S> {
    fn put(&self, record_id: &RecordId, descriptor: &Descriptor) -> Result<RegistryEntry, StoreError> {
        self.puts.fetch_add(1, Ordering::SeqCst);
        self.inner.put(record_id, descriptor)
    }

    fn get(&self, record_id: &RecordId) -> Result<Option<RegistryEntry>, StoreError> {
        self.inner.get(record_id)
    }

    fn all(&self) -> Result<Vec<RegistryEntry>, StoreError> {
        self.scans.fetch_add(1, Ordering::SeqCst);
        self.inner.all()
    }

    fn remove(&self, record_id: &RecordId) -> Result<bool, StoreError> {
        self.inner.remove(record_id)
    }

    fn len(&self) -> Result<usize, StoreError> {
        self.inner.len()
    }
}
