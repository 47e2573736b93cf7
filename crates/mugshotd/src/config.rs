use mugshot_core::{FaceSelection, DEFAULT_MATCH_THRESHOLD, DETECTOR_MODEL_FILE, RECOGNIZER_MODEL_FILE};
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("cannot read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("invalid value {value:?} for {key}")]
    InvalidValue { key: String, value: String },
    #[error("{0}")]
    Invalid(String),
}

/// Daemon configuration.
///
/// Loaded from the TOML file named by `MUGSHOT_CONFIG` (if any), then
/// overridden by `MUGSHOT_*` environment variables.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Address the HTTP server binds to.
    pub listen: SocketAddr,
    /// Directory containing ONNX model files.
    pub model_dir: PathBuf,
    /// Path to the SQLite database file.
    pub db_path: PathBuf,
    /// Keep identities in memory only; nothing survives a restart.
    pub ephemeral: bool,
    /// Cosine similarity a match must strictly exceed.
    pub similarity_threshold: f64,
    /// Minimum SCRFD score for a detection to count as a face.
    pub detection_threshold: f32,
    /// Number of images every enrollment must carry.
    pub enroll_images: usize,
    /// Which face an enrollment image contributes when it shows several.
    pub face_selection: FaceSelection,
    /// JPEG quality of enrollment thumbnails.
    pub thumbnail_quality: u8,
    pub inference_timeout_secs: u64,
    pub store_timeout_secs: u64,
    /// Largest accepted request body, in bytes.
    pub max_upload_bytes: usize,
    /// Passphrase for at-rest encryption of stored embeddings.
    pub embedding_key: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(([127, 0, 0, 1], 5000)),
            model_dir: mugshot_core::default_model_dir(),
            db_path: default_db_path(|key| std::env::var(key).ok()),
            ephemeral: false,
            similarity_threshold: DEFAULT_MATCH_THRESHOLD,
            detection_threshold: mugshot_core::detector::SCRFD_CONFIDENCE_THRESHOLD,
            enroll_images: 5,
            face_selection: FaceSelection::First,
            thumbnail_quality: mugshot_core::face::DEFAULT_THUMBNAIL_QUALITY,
            inference_timeout_secs: 30,
            store_timeout_secs: 5,
            max_upload_bytes: 32 * 1024 * 1024,
            embedding_key: None,
        }
    }
}

impl Config {
    /// Load configuration from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration with `lookup` standing in for the environment.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = match lookup("MUGSHOT_CONFIG") {
            Some(path) => Self::from_file(Path::new(&path))?,
            None => Self {
                db_path: default_db_path(&lookup),
                ..Self::default()
            },
        };

        if let Some(v) = lookup("MUGSHOT_LISTEN") {
            config.listen = parse("MUGSHOT_LISTEN", &v)?;
        }
        if let Some(v) = lookup("MUGSHOT_MODEL_DIR") {
            config.model_dir = PathBuf::from(v);
        }
        if let Some(v) = lookup("MUGSHOT_DB_PATH") {
            config.db_path = PathBuf::from(v);
        }
        if let Some(v) = lookup("MUGSHOT_EPHEMERAL") {
            config.ephemeral = v != "0" && !v.eq_ignore_ascii_case("false");
        }
        if let Some(v) = lookup("MUGSHOT_SIMILARITY_THRESHOLD") {
            config.similarity_threshold = parse("MUGSHOT_SIMILARITY_THRESHOLD", &v)?;
        }
        if let Some(v) = lookup("MUGSHOT_DETECTION_THRESHOLD") {
            config.detection_threshold = parse("MUGSHOT_DETECTION_THRESHOLD", &v)?;
        }
        if let Some(v) = lookup("MUGSHOT_ENROLL_IMAGES") {
            config.enroll_images = parse("MUGSHOT_ENROLL_IMAGES", &v)?;
        }
        if let Some(v) = lookup("MUGSHOT_FACE_SELECTION") {
            config.face_selection = parse("MUGSHOT_FACE_SELECTION", &v)?;
        }
        if let Some(v) = lookup("MUGSHOT_THUMBNAIL_QUALITY") {
            config.thumbnail_quality = parse("MUGSHOT_THUMBNAIL_QUALITY", &v)?;
        }
        if let Some(v) = lookup("MUGSHOT_INFERENCE_TIMEOUT_SECS") {
            config.inference_timeout_secs = parse("MUGSHOT_INFERENCE_TIMEOUT_SECS", &v)?;
        }
        if let Some(v) = lookup("MUGSHOT_STORE_TIMEOUT_SECS") {
            config.store_timeout_secs = parse("MUGSHOT_STORE_TIMEOUT_SECS", &v)?;
        }
        if let Some(v) = lookup("MUGSHOT_MAX_UPLOAD_BYTES") {
            config.max_upload_bytes = parse("MUGSHOT_MAX_UPLOAD_BYTES", &v)?;
        }
        if let Some(v) = lookup("MUGSHOT_EMBEDDING_KEY") {
            config.embedding_key = Some(v).filter(|k| !k.is_empty());
        }

        config.validate()?;
        Ok(config)
    }

    fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(-1.0..1.0).contains(&self.similarity_threshold) {
            return Err(ConfigError::Invalid(format!(
                "similarity_threshold must be in [-1, 1), got {}",
                self.similarity_threshold
            )));
        }
        if !(0.0..=1.0).contains(&self.detection_threshold) {
            return Err(ConfigError::Invalid(format!(
                "detection_threshold must be in [0, 1], got {}",
                self.detection_threshold
            )));
        }
        if self.enroll_images == 0 {
            return Err(ConfigError::Invalid("enroll_images must be at least 1".into()));
        }
        if !(1..=100).contains(&self.thumbnail_quality) {
            return Err(ConfigError::Invalid(format!(
                "thumbnail_quality must be in 1..=100, got {}",
                self.thumbnail_quality
            )));
        }
        if self.inference_timeout_secs == 0 || self.store_timeout_secs == 0 {
            return Err(ConfigError::Invalid("timeouts must be at least one second".into()));
        }
        Ok(())
    }

    pub fn inference_timeout(&self) -> Duration {
        Duration::from_secs(self.inference_timeout_secs)
    }

    pub fn store_timeout(&self) -> Duration {
        Duration::from_secs(self.store_timeout_secs)
    }

    /// Path to the SCRFD detection model.
    pub fn scrfd_model_path(&self) -> String {
        self.model_dir
            .join(DETECTOR_MODEL_FILE)
            .to_string_lossy()
            .into_owned()
    }

    /// Path to the ArcFace recognition model.
    pub fn arcface_model_path(&self) -> String {
        self.model_dir
            .join(RECOGNIZER_MODEL_FILE)
            .to_string_lossy()
            .into_owned()
    }
}

fn default_db_path(lookup: impl Fn(&str) -> Option<String>) -> PathBuf {
    lookup("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| {
            let home = lookup("HOME").unwrap_or_else(|| "/tmp".to_string());
            PathBuf::from(home).join(".local/share")
        })
        .join("mugshot")
        .join("identities.db")
}

fn parse<T: FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        value: value.to_string(),
    })
}
