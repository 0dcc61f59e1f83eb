use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::session::SessionOptions;

const SCRFD_MODEL_FILE: &str = "det_10g.onnx";
const ARCFACE_MODEL_FILE: &str = "w600k_r50.onnx";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("cannot read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("cannot parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Runtime configuration.
///
/// Built from defaults, then an optional TOML file, then `ROLLCALL_*`
/// environment variables; later layers win.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// V4L2 device path (default: /dev/video0).
    pub camera_device: String,
    /// Requested capture size; the driver may adjust it.
    pub camera_width: u32,
    pub camera_height: u32,
    /// Directory containing the ONNX model files.
    pub model_dir: PathBuf,
    /// SQLite database of enrolled faces.
    pub db_path: PathBuf,
    /// Where session files are written.
    pub output_dir: PathBuf,
    /// Where crops of unrecognized faces are saved for later registration.
    pub unknowns_dir: PathBuf,
    pub save_unknowns: bool,
    /// Cosine similarity needed to mark someone present.
    pub similarity_threshold: f32,
    /// Frames to discard after opening the camera (AGC/AE settling).
    pub warmup_frames: usize,
    /// Analyse every Nth frame.
    pub frame_stride: u32,
    pub skip_dark_frames: bool,
    /// Minimum time between analysed frames, in milliseconds; 0 analyses every frame.
    pub min_interval_ms: u64,
    /// End the session after this many seconds.
    pub max_duration_secs: Option<u64>,
}

impl Default for Config {
    fn default() -> Self {
        let data_dir = data_dir();
        Self {
            camera_device: "/dev/video0".to_string(),
            camera_width: 640,
            camera_height: 480,
            model_dir: data_dir.join("models"),
            db_path: data_dir.join("faces.db"),
            output_dir: data_dir.join("attendance"),
            unknowns_dir: data_dir.join("unknowns"),
            save_unknowns: true,
            similarity_threshold: 0.40,
            warmup_frames: 4,
            frame_stride: 1,
            skip_dark_frames: true,
            min_interval_ms: 0,
            max_duration_secs: None,
        }
    }
}

impl Config {
    /// Load from `path` (or the default config file, if present) and the environment.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => {
                let default_path = default_config_path();
                if default_path.is_file() {
                    Self::from_file(&default_path)?
                } else {
                    Self::default()
                }
            }
        };
        config.apply_overrides(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config = Self::from_toml_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        tracing::debug!(path = %path.display(), "configuration file loaded");
        Ok(config)
    }

    pub fn from_toml_str(text: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(text)
    }

    /// Apply `ROLLCALL_*` overrides from `lookup`. Unparsable values are
    /// ignored with a warning.
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("ROLLCALL_CAMERA_DEVICE") {
            self.camera_device = v;
        }
        if let Some(v) = lookup("ROLLCALL_MODEL_DIR") {
            self.model_dir = PathBuf::from(v);
        }
        if let Some(v) = lookup("ROLLCALL_DB_PATH") {
            self.db_path = PathBuf::from(v);
        }
        if let Some(v) = lookup("ROLLCALL_OUTPUT_DIR") {
            self.output_dir = PathBuf::from(v);
        }
        if let Some(v) = lookup("ROLLCALL_UNKNOWNS_DIR") {
            self.unknowns_dir = PathBuf::from(v);
        }
        override_parsed(&lookup, "ROLLCALL_CAMERA_WIDTH", &mut self.camera_width);
        override_parsed(&lookup, "ROLLCALL_CAMERA_HEIGHT", &mut self.camera_height);
        override_parsed(&lookup, "ROLLCALL_SIMILARITY_THRESHOLD", &mut self.similarity_threshold);
        override_parsed(&lookup, "ROLLCALL_WARMUP_FRAMES", &mut self.warmup_frames);
        override_parsed(&lookup, "ROLLCALL_FRAME_STRIDE", &mut self.frame_stride);
        override_parsed(&lookup, "ROLLCALL_MIN_INTERVAL_MS", &mut self.min_interval_ms);
        if let Some(v) = lookup("ROLLCALL_SKIP_DARK_FRAMES") {
            self.skip_dark_frames = parse_flag(&v);
        }
        if let Some(v) = lookup("ROLLCALL_SAVE_UNKNOWNS") {
            self.save_unknowns = parse_flag(&v);
        }
        if let Some(v) = lookup("ROLLCALL_MAX_DURATION_SECS") {
            match v.parse() {
                Ok(secs) => self.max_duration_secs = Some(secs),
                Err(_) => tracing::warn!(key = "ROLLCALL_MAX_DURATION_SECS", value = %v, "ignoring unparsable override"),
            }
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(0.0..=1.0).contains(&self.similarity_threshold) {
            return Err(ConfigError::Invalid(format!(
                "similarity_threshold {} is outside [0, 1]",
                self.similarity_threshold
            )));
        }
        if self.frame_stride == 0 {
            return Err(ConfigError::Invalid("frame_stride must be at least 1".into()));
        }
        if self.camera_width == 0 || self.camera_height == 0 {
            return Err(ConfigError::Invalid(format!(
                "camera size {}x{} is empty",
                self.camera_width, self.camera_height
            )));
        }
        Ok(())
    }

    /// Path to the SCRFD detection model.
    pub fn scrfd_model_path(&self) -> PathBuf {
        self.model_dir.join(SCRFD_MODEL_FILE)
    }

    /// Path to the ArcFace recognition model.
    pub fn arcface_model_path(&self) -> PathBuf {
        self.model_dir.join(ARCFACE_MODEL_FILE)
    }

    /// Session file for a session started at `started`.
    pub fn session_path(&self, started: DateTime<Local>) -> PathBuf {
        self.output_dir
            .join(format!("attendance_{}.csv", started.format("%Y%m%d_%H%M%S")))
    }

    pub fn session_options(&self) -> SessionOptions {
        SessionOptions {
            frame_stride: self.frame_stride,
            skip_dark_frames: self.skip_dark_frames,
            min_interval: (self.min_interval_ms > 0).then(|| Duration::from_millis(self.min_interval_ms)),
        }
    }
}

fn parse_flag(v: &str) -> bool {
    v != "0" && !v.eq_ignore_ascii_case("false")
}

fn override_parsed<F, T>(lookup: &F, key: &str, slot: &mut T)
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
{
    if let Some(v) = lookup(key) {
        match v.parse() {
            Ok(parsed) => *slot = parsed,
            Err(_) => tracing::warn!(key, value = %v, "ignoring unparsable override"),
        }
    }
}

/// `$XDG_DATA_HOME/rollcall`, falling back to `~/.local/share/rollcall`.
pub fn data_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".local/share"))
        .join("rollcall")
}

/// `$XDG_CONFIG_HOME/rollcall/config.toml`, falling back to `~/.config`.
pub fn default_config_path() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".config"))
        .join("rollcall")
        .join("config.toml")
}

fn home_dir() -> PathBuf {
    PathBuf::from(std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> =
            pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.camera_device, "/dev/video0");
        assert!((config.similarity_threshold - 0.40).abs() < 1e-6);
        assert_eq!(config.frame_stride, 1);
        assert!(config.skip_dark_frames);
        assert_eq!(config.session_options().min_interval, None);
        assert!(config.unknowns_dir.ends_with("rollcall/unknowns"));
        assert!(config.scrfd_model_path().ends_with("det_10g.onnx"));
        assert!(config.arcface_model_path().ends_with("w600k_r50.onnx"));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_toml_partial_file_keeps_defaults() {
        let config = Config::from_toml_str(
            r#"
            camera_device = "/dev/video2"
            similarity_threshold = 0.55
            max_duration_secs = 3600
            "#,
        )
        .unwrap();
        assert_eq!(config.camera_device, "/dev/video2");
        assert!((config.similarity_threshold - 0.55).abs() < 1e-6);
        assert_eq!(config.max_duration_secs, Some(3600));
        assert_eq!(config.warmup_frames, 4);
    }

    #[test]
    fn test_toml_unknown_key_rejected() {
        assert!(Config::from_toml_str("similarity_treshold = 0.5").is_err());
    }

    #[test]
    fn test_env_overrides() {
        let mut config = Config::default();
        config.apply_overrides(env(&[
            ("ROLLCALL_OUTPUT_DIR", "/srv/attendance"),
            ("ROLLCALL_FRAME_STRIDE", "5"),
            ("ROLLCALL_SKIP_DARK_FRAMES", "0"),
            ("ROLLCALL_WARMUP_FRAMES", "lots"),
            ("ROLLCALL_MAX_DURATION_SECS", "90"),
            ("ROLLCALL_MIN_INTERVAL_MS", "1500"),
            ("ROLLCALL_UNKNOWNS_DIR", "/srv/unknowns"),
            ("ROLLCALL_SAVE_UNKNOWNS", "false"),
        ]));
        assert_eq!(config.output_dir, PathBuf::from("/srv/attendance"));
        assert_eq!(config.frame_stride, 5);
        assert!(!config.skip_dark_frames);
        assert_eq!(config.warmup_frames, 4);
        assert_eq!(config.max_duration_secs, Some(90));
        assert_eq!(
            config.session_options(),
            SessionOptions {
                frame_stride: 5,
                skip_dark_frames: false,
                min_interval: Some(Duration::from_millis(1500)),
            }
        );
        assert_eq!(config.unknowns_dir, PathBuf::from("/srv/unknowns"));
        assert!(!config.save_unknowns);
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = Config { similarity_threshold: 1.5, ..Config::default() };
        assert!(config.validate().is_err());
        config.similarity_threshold = f32::NAN;
        assert!(config.validate().is_err());
        config.similarity_threshold = 0.4;
        config.frame_stride = 0;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_session_path_format() {
        let config = Config { output_dir: PathBuf::from("/out"), ..Config::default() };
        let started = Local.with_ymd_and_hms(2024, 8, 30, 9, 5, 7).unwrap();
        assert_eq!(
            config.session_path(started),
            PathBuf::from("/out/attendance_20240830_090507.csv")
        );
    }

    #[test]
    fn test_load_explicit_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rollcall.toml");
        std::fs::write(&path, "frame_stride = 3\n").unwrap();
        let config = Config::from_file(&path).unwrap();
        assert_eq!(config.frame_stride, 3);

        std::fs::write(&path, "frame_stride = \"three\"\n").unwrap();
        assert!(matches!(Config::from_file(&path), Err(ConfigError::Parse { .. })));
        assert!(matches!(
            Config::from_file(&dir.path().join("missing.toml")),
            Err(ConfigError::Read { .. })
        ));
    }
}
