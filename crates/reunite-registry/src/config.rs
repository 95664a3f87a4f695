use reunite_core::{DEFAULT_DETECTION_CONFIDENCE, DEFAULT_MAX_IMAGE_DIMENSION};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use thiserror::Error;

const MIB: usize = 1024 * 1024;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("cannot read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid config file: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("environment variable {key} has invalid value {value:?}")]
    InvalidEnv { key: String, value: String },
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// How a search with both a name and a photo combines the two result sets.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CombinePolicy {
    /// Intersection only; empty as soon as either side is empty.
    #[default]
    Strict,
    /// Intersection when both sides have results, otherwise whichever side does.
    Lenient,
}

impl FromStr for CombinePolicy {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "strict" => Ok(Self::Strict),
            "lenient" => Ok(Self::Lenient),
            _ => Err(()),
        }
    }
}

/// Registry configuration: defaults, then an optional TOML file, then
/// `REUNITE_*` environment variables. Validated once at startup.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Path to the SQLite database file.
    pub db_path: PathBuf,
    /// Directory containing ONNX model files.
    pub model_dir: PathBuf,
    /// Maximum Euclidean descriptor distance counted as the same person.
    /// `None` uses the embedding model's own default.
    pub match_threshold: Option<f32>,
    /// Longer image side above which photos are downscaled before detection.
    pub max_image_dimension: u32,
    pub min_image_bytes: usize,
    pub max_image_bytes: usize,
    /// Descriptor length the embedding backend must produce.
    pub descriptor_dim: usize,
    /// Minimum detector score for a face region.
    pub detection_confidence: f32,
    /// Deadline for a register or search request through the engine.
    pub request_timeout_secs: u64,
    pub combine_policy: CombinePolicy,
    /// When set, descriptor blobs are sealed with a key derived from this file.
    pub encryption_key_file: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        let data_dir = default_data_dir();
        Self {
            db_path: data_dir.join("registry.db"),
            model_dir: data_dir.join("models"),
            match_threshold: None,
            max_image_dimension: DEFAULT_MAX_IMAGE_DIMENSION,
            min_image_bytes: MIB,
            max_image_bytes: 5 * MIB,
            descriptor_dim: 512,
            detection_confidence: DEFAULT_DETECTION_CONFIDENCE,
            request_timeout_secs: 30,
            combine_policy: CombinePolicy::Strict,
            encryption_key_file: None,
        }
    }
}

/// `$XDG_DATA_HOME/reunite`, falling back to `~/.local/share/reunite`.
pub fn default_data_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            PathBuf::from(home).join(".local/share")
        })
        .join("reunite")
}

impl Config {
    /// Load defaults, the optional TOML file and environment overrides, then validate.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(toml::from_str(&text)?)
    }

    /// Apply `REUNITE_*` overrides from `lookup` (normally the process environment).
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        fn parsed<T: FromStr>(
            lookup: &dyn Fn(&str) -> Option<String>,
            key: &str,
        ) -> Result<Option<T>, ConfigError> {
            match lookup(key) {
                None => Ok(None),
                Some(value) => value.trim().parse().map(Some).map_err(|_| ConfigError::InvalidEnv {
                    key: key.to_string(),
                    value,
                }),
            }
        }

        let lookup: &dyn Fn(&str) -> Option<String> = &lookup;

        if let Some(v) = lookup("REUNITE_DB_PATH") {
            self.db_path = PathBuf::from(v);
        }
        if let Some(v) = lookup("REUNITE_MODEL_DIR") {
            self.model_dir = PathBuf::from(v);
        }
        if let Some(v) = parsed(lookup, "REUNITE_MATCH_THRESHOLD")? {
            self.match_threshold = Some(v);
        }
        if let Some(v) = parsed(lookup, "REUNITE_MAX_IMAGE_DIMENSION")? {
            self.max_image_dimension = v;
        }
        if let Some(v) = parsed(lookup, "REUNITE_MIN_IMAGE_BYTES")? {
            self.min_image_bytes = v;
        }
        if let Some(v) = parsed(lookup, "REUNITE_MAX_IMAGE_BYTES")? {
            self.max_image_bytes = v;
        }
        if let Some(v) = parsed(lookup, "REUNITE_DESCRIPTOR_DIM")? {
            self.descriptor_dim = v;
        }
        if let Some(v) = parsed(lookup, "REUNITE_DETECTION_CONFIDENCE")? {
            self.detection_confidence = v;
        }
        if let Some(v) = parsed(lookup, "REUNITE_REQUEST_TIMEOUT_SECS")? {
            self.request_timeout_secs = v;
        }
        if let Some(v) = parsed(lookup, "REUNITE_COMBINE_POLICY")? {
            self.combine_policy = v;
        }
        if let Some(v) = lookup("REUNITE_ENCRYPTION_KEY_FILE") {
            self.encryption_key_file = (!v.is_empty()).then(|| PathBuf::from(v));
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: String| Err(ConfigError::Invalid(msg));

        if let Some(threshold) = self.match_threshold {
            if !threshold.is_finite() || threshold <= 0.0 {
                return invalid(format!(
                    "match_threshold must be a positive distance, got {threshold}"
                ));
            }
        }
        if self.max_image_dimension == 0 {
            return invalid("max_image_dimension must be at least 1".into());
        }
        if self.max_image_bytes == 0 || self.min_image_bytes > self.max_image_bytes {
            return invalid(format!(
                "image byte range [{}, {}] is empty",
                self.min_image_bytes, self.max_image_bytes
            ));
        }
        if self.descriptor_dim == 0 {
            return invalid("descriptor_dim must be at least 1".into());
        }
        if !(self.detection_confidence > 0.0 && self.detection_confidence < 1.0) {
            return invalid(format!(
                "detection_confidence must be in (0, 1), got {}",
                self.detection_confidence
            ));
        }
        if self.request_timeout_secs == 0 {
            return invalid("request_timeout_secs must be at least 1".into());
        }
        Ok(())
    }

    pub fn request_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.request_timeout_secs)
    }
}
