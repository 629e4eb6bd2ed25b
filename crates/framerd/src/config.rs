use crate::outputs::OutputMode;
use framer_core::compositor::{DEFAULT_OUTPUT_HEIGHT, DEFAULT_OUTPUT_WIDTH};
use framer_core::recognizer::{DEFAULT_FACE_SIZE, DEFAULT_SIMILARITY_THRESHOLD};
use framer_core::tracker::{DEFAULT_ALPHA, DEFAULT_MARGIN};
use framer_core::AspectRatio;
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid config file: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid {key}: {reason}")]
    Invalid { key: &'static str, reason: String },
}

/// Daemon configuration.
///
/// Built from defaults, then an optional TOML file, then `FRAMER_*`
/// environment variables, in that order.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// V4L2 capture device path.
    pub camera_device: String,
    /// Requested capture resolution; the driver may pick another.
    pub camera_width: u32,
    pub camera_height: u32,
    /// Directory containing ONNX model files.
    pub model_dir: PathBuf,
    /// SCRFD detector file name inside `model_dir`.
    pub detector_model: String,
    /// Embedding model file name inside `model_dir`.
    pub embedder_model: String,
    /// Reference images of known faces.
    pub known_faces_dir: PathBuf,
    /// SQLite embedding cache.
    pub db_path: PathBuf,
    pub face_size: u32,
    pub similarity_threshold: f32,
    pub smoothing_alpha: f32,
    pub tracking_margin: f32,
    pub aspect_ratio: AspectRatio,
    pub output_width: u32,
    pub output_height: u32,
    pub output_mode: OutputMode,
    pub stream_bind: SocketAddr,
    pub stream_fps: u32,
    pub jpeg_quality: u8,
    pub vcam_device: String,
    pub vcam_fps: u32,
    /// Run recognition on the tracked face every N frames; 0 disables it.
    pub recognize_every: u32,
    /// Log a warning after this many consecutive capture failures.
    pub capture_miss_warn: u32,
    /// Seconds between cache maintenance passes; 0 disables maintenance.
    pub maintenance_interval_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        let data_dir = data_dir();
        Self {
            camera_device: "/dev/video0".to_string(),
            camera_width: 1280,
            camera_height: 720,
            model_dir: data_dir.join("models"),
            detector_model: "det_10g.onnx".to_string(),
            embedder_model: "facenet.onnx".to_string(),
            known_faces_dir: data_dir.join("known_faces"),
            db_path: data_dir.join("embeddings.db"),
            face_size: DEFAULT_FACE_SIZE,
            similarity_threshold: DEFAULT_SIMILARITY_THRESHOLD,
            smoothing_alpha: DEFAULT_ALPHA,
            tracking_margin: DEFAULT_MARGIN,
            aspect_ratio: AspectRatio::WIDE,
            output_width: DEFAULT_OUTPUT_WIDTH,
            output_height: DEFAULT_OUTPUT_HEIGHT,
            output_mode: OutputMode::Stream,
            stream_bind: SocketAddr::from(([0, 0, 0, 0], 8080)),
            stream_fps: 30,
            jpeg_quality: 80,
            vcam_device: "/dev/video10".to_string(),
            vcam_fps: 20,
            recognize_every: 0,
            capture_miss_warn: 30,
            maintenance_interval_secs: 300,
        }
    }
}

impl Config {
    /// Load the full configuration from file and environment, then validate.
    pub fn load() -> Result<Self, ConfigError> {
        let explicit = std::env::var_os("FRAMER_CONFIG").map(PathBuf::from);
        let mut config = Self::from_config_file(explicit, default_config_path())?;
        config.apply_env(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    /// Read the explicitly named config file, which must exist, or else the
    /// default location when present.
    fn from_config_file(explicit: Option<PathBuf>, fallback: Option<PathBuf>) -> Result<Self, ConfigError> {
        let path = match (explicit, fallback) {
            (Some(path), _) => path,
            (None, Some(path)) if path.exists() => path,
            _ => return Ok(Self::default()),
        };
        tracing::info!(path = %path.display(), "loading config file");
        Self::from_file(&path)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&text)
    }

    pub fn from_toml(text: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(text)?)
    }

    /// Override fields from `FRAMER_*` variables. Unparsable values are
    /// logged and ignored.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let env = Env { lookup: &lookup };

        env.string("FRAMER_CAMERA_DEVICE", &mut self.camera_device);
        env.parse("FRAMER_CAMERA_WIDTH", &mut self.camera_width);
        env.parse("FRAMER_CAMERA_HEIGHT", &mut self.camera_height);
        env.path("FRAMER_MODEL_DIR", &mut self.model_dir);
        env.string("FRAMER_DETECTOR_MODEL", &mut self.detector_model);
        env.string("FRAMER_EMBEDDER_MODEL", &mut self.embedder_model);
        env.path("FRAMER_KNOWN_FACES_DIR", &mut self.known_faces_dir);
        env.path("FRAMER_DB_PATH", &mut self.db_path);
        env.parse("FRAMER_FACE_SIZE", &mut self.face_size);
        env.parse("FRAMER_SIMILARITY_THRESHOLD", &mut self.similarity_threshold);
        env.parse("FRAMER_SMOOTHING_ALPHA", &mut self.smoothing_alpha);
        env.parse("FRAMER_TRACKING_MARGIN", &mut self.tracking_margin);
        env.parse("FRAMER_ASPECT_RATIO", &mut self.aspect_ratio);
        env.parse("FRAMER_OUTPUT_WIDTH", &mut self.output_width);
        env.parse("FRAMER_OUTPUT_HEIGHT", &mut self.output_height);
        env.parse("FRAMER_OUTPUT_MODE", &mut self.output_mode);
        env.parse("FRAMER_STREAM_BIND", &mut self.stream_bind);
        env.parse("FRAMER_STREAM_FPS", &mut self.stream_fps);
        env.parse("FRAMER_JPEG_QUALITY", &mut self.jpeg_quality);
        env.string("FRAMER_VCAM_DEVICE", &mut self.vcam_device);
        env.parse("FRAMER_VCAM_FPS", &mut self.vcam_fps);
        env.parse("FRAMER_RECOGNIZE_EVERY", &mut self.recognize_every);
        env.parse("FRAMER_CAPTURE_MISS_WARN", &mut self.capture_miss_warn);
        env.parse("FRAMER_MAINTENANCE_INTERVAL_SECS", &mut self.maintenance_interval_secs);
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        fn invalid(key: &'static str, reason: impl Into<String>) -> ConfigError {
            ConfigError::Invalid {
                key,
                reason: reason.into(),
            }
        }

        if self.camera_width == 0 || self.camera_height == 0 {
            return Err(invalid("camera resolution", "must be non-zero"));
        }
        if self.output_width == 0 || self.output_height == 0 {
            return Err(invalid("output resolution", "must be non-zero"));
        }
        if self.output_width % 2 != 0 {
            return Err(invalid("output_width", "must be even for YUYV output"));
        }
        if self.face_size == 0 {
            return Err(invalid("face_size", "must be non-zero"));
        }
        if !(0.0..=1.0).contains(&self.similarity_threshold) {
            return Err(invalid("similarity_threshold", "must be within [0, 1]"));
        }
        if !(self.smoothing_alpha > 0.0 && self.smoothing_alpha <= 1.0) {
            return Err(invalid("smoothing_alpha", "must be within (0, 1]"));
        }
        if !(self.tracking_margin.is_finite() && self.tracking_margin > 0.0) {
            return Err(invalid("tracking_margin", "must be a positive number"));
        }
        if self.stream_fps == 0 || self.vcam_fps == 0 {
            return Err(invalid("fps", "stream_fps and vcam_fps must be non-zero"));
        }
        if !(1..=100).contains(&self.jpeg_quality) {
            return Err(invalid("jpeg_quality", "must be within 1..=100"));
        }
        if self.capture_miss_warn == 0 {
            return Err(invalid("capture_miss_warn", "must be non-zero"));
        }
        Ok(())
    }

    pub fn detector_model_path(&self) -> PathBuf {
        self.model_dir.join(&self.detector_model)
    }

    pub fn embedder_model_path(&self) -> PathBuf {
        self.model_dir.join(&self.embedder_model)
    }
}

/// `$XDG_DATA_HOME/framer`, falling back to `~/.local/share/framer`.
fn data_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            PathBuf::from(home).join(".local/share")
        })
        .join("framer")
}

/// `$XDG_CONFIG_HOME/framer/config.toml`, falling back to `~/.config`.
fn default_config_path() -> Option<PathBuf> {
    let config_home = std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .or_else(|_| std::env::var("HOME").map(|h| PathBuf::from(h).join(".config")))
        .ok()?;
    Some(config_home.join("framer/config.toml"))
}

struct Env<'a, F: Fn(&str) -> Option<String>> {
    lookup: &'a F,
}

impl<F: Fn(&str) -> Option<String>> Env<'_, F> {
    fn string(&self, key: &str, target: &mut String) {
        if let Some(v) = (self.lookup)(key) {
            *target = v;
        }
    }

    fn path(&self, key: &str, target: &mut PathBuf) {
        if let Some(v) = (self.lookup)(key) {
            *target = PathBuf::from(v);
        }
    }

    fn parse<T: FromStr>(&self, key: &str, target: &mut T) {
        let Some(raw) = (self.lookup)(key) else {
            return;
        };
        match raw.trim().parse() {
            Ok(v) => *target = v,
            Err(_) => tracing::warn!(key, value = %raw, "ignoring unparsable environment override"),
        }
    }
}
