use std::path::{Path, PathBuf};
use std::time::Duration;

use rollcall_core::enrollment::DEFAULT_MIN_PHOTOS;
use rollcall_core::upload::DEFAULT_MAX_UPLOAD_BYTES;
use rollcall_core::{CourseDefaults, EnrollmentPolicy, DEFAULT_SIMILARITY_THRESHOLD};
use serde::Deserialize;
use thiserror::Error;

pub const DEFAULT_QUEUE_DEPTH: usize = 16;
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;
const MAX_DEFAULT_WORKERS: usize = 4;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse {path}: {message}")]
    Parse { path: PathBuf, message: String },
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Which message bus the daemon claims its name on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Bus {
    #[default]
    Session,
    System,
}

impl std::str::FromStr for Bus {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "session" => Ok(Self::Session),
            "system" => Ok(Self::System),
            other => Err(ConfigError::Invalid(format!("unknown bus '{other}'"))),
        }
    }
}

/// On-disk `rollcalld.toml`; every key is optional.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConfigFile {
    pub data_dir: Option<PathBuf>,
    pub model_dir: Option<PathBuf>,
    pub similarity_threshold: Option<f32>,
    pub min_photos: Option<usize>,
    pub max_upload_bytes: Option<usize>,
    pub workers: Option<usize>,
    pub queue_depth: Option<usize>,
    pub request_timeout_secs: Option<u64>,
    pub preload_models: Option<bool>,
    pub default_course_name: Option<String>,
    pub default_course_code: Option<String>,
    pub bus: Option<Bus>,
}

/// Daemon configuration: file values, then `ROLLCALL_*` overrides, then defaults.
#[derive(Debug, Clone)]
pub struct Config {
    /// Holds `students.json`, `sessions.json` and `images/`.
    pub data_dir: PathBuf,
    /// Directory containing the ONNX model files.
    pub model_dir: PathBuf,
    pub similarity_threshold: f32,
    pub min_photos: usize,
    pub max_upload_bytes: usize,
    pub workers: usize,
    pub queue_depth: usize,
    pub request_timeout_secs: u64,
    /// Load the models at startup instead of on the first request.
    pub preload_models: bool,
    pub default_course_name: String,
    pub default_course_code: String,
    pub bus: Bus,
}

impl Config {
    /// Load from `ROLLCALL_CONFIG` (or the XDG default path) and the process environment.
    pub fn load() -> Result<Self, ConfigError> {
        let env = |key: &str| std::env::var(key).ok();
        let file = match env("ROLLCALL_CONFIG") {
            Some(path) => Some(read_file(Path::new(&path))?),
            None => {
                let path = default_config_path();
                if path.exists() {
                    Some(read_file(&path)?)
                } else {
                    None
                }
            }
        };
        Self::resolve(file.unwrap_or_default(), env)
    }

    /// Merge `file` with overrides looked up through `env`, then validate.
    pub fn resolve<F>(file: ConfigFile, env: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = CourseDefaults::default();
        let data_dir = env("ROLLCALL_DATA_DIR")
            .map(PathBuf::from)
            .or(file.data_dir)
            .unwrap_or_else(default_data_dir);
        let model_dir = env("ROLLCALL_MODEL_DIR")
            .map(PathBuf::from)
            .or(file.model_dir)
            .unwrap_or_else(|| data_dir.join("models"));

        let config = Self {
            similarity_threshold: env_parse(&env, "ROLLCALL_SIMILARITY_THRESHOLD")?
                .or(file.similarity_threshold)
                .unwrap_or(DEFAULT_SIMILARITY_THRESHOLD),
            min_photos: env_parse(&env, "ROLLCALL_MIN_PHOTOS")?
                .or(file.min_photos)
                .unwrap_or(DEFAULT_MIN_PHOTOS),
            max_upload_bytes: env_parse(&env, "ROLLCALL_MAX_UPLOAD_BYTES")?
                .or(file.max_upload_bytes)
                .unwrap_or(DEFAULT_MAX_UPLOAD_BYTES),
            workers: env_parse(&env, "ROLLCALL_WORKERS")?
                .or(file.workers)
                .unwrap_or_else(default_workers),
            queue_depth: env_parse(&env, "ROLLCALL_QUEUE_DEPTH")?
                .or(file.queue_depth)
                .unwrap_or(DEFAULT_QUEUE_DEPTH),
            request_timeout_secs: env_parse(&env, "ROLLCALL_REQUEST_TIMEOUT_SECS")?
                .or(file.request_timeout_secs)
                .unwrap_or(DEFAULT_REQUEST_TIMEOUT_SECS),
            preload_models: env_bool(&env, "ROLLCALL_PRELOAD_MODELS")?
                .or(file.preload_models)
                .unwrap_or(false),
            default_course_name: env("ROLLCALL_DEFAULT_COURSE_NAME")
                .or(file.default_course_name)
                .unwrap_or(defaults.name),
            default_course_code: env("ROLLCALL_DEFAULT_COURSE_CODE")
                .or(file.default_course_code)
                .unwrap_or(defaults.code),
            bus: env_parse(&env, "ROLLCALL_BUS")?.or(file.bus).unwrap_or_default(),
            data_dir,
            model_dir,
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if !(-1.0..=1.0).contains(&self.similarity_threshold) {
            return Err(ConfigError::Invalid(format!(
                "similarity_threshold must be within [-1, 1], got {}",
                self.similarity_threshold
            )));
        }
        for (key, value) in [
            ("min_photos", self.min_photos),
            ("max_upload_bytes", self.max_upload_bytes),
            ("workers", self.workers),
            ("queue_depth", self.queue_depth),
        ] {
            if value == 0 {
                return Err(ConfigError::Invalid(format!("{key} must be at least 1")));
            }
        }
        if self.request_timeout_secs == 0 {
            return Err(ConfigError::Invalid("request_timeout_secs must be at least 1".into()));
        }
        Ok(())
    }

    pub fn registry_path(&self) -> PathBuf {
        self.data_dir.join("students.json")
    }

    pub fn sessions_path(&self) -> PathBuf {
        self.data_dir.join("sessions.json")
    }

    pub fn images_dir(&self) -> PathBuf {
        self.data_dir.join("images")
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn enrollment_policy(&self) -> EnrollmentPolicy {
        EnrollmentPolicy {
            min_photos: self.min_photos,
            max_upload_bytes: self.max_upload_bytes,
        }
    }

    pub fn course_defaults(&self) -> CourseDefaults {
        CourseDefaults {
            name: self.default_course_name.clone(),
            code: self.default_course_code.clone(),
        }
    }
}

fn read_file(path: &Path) -> Result<ConfigFile, ConfigError> {
    let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    let file = toml::from_str(&contents).map_err(|err| ConfigError::Parse {
        path: path.to_path_buf(),
        message: err.to_string(),
    })?;
    tracing::info!(path = %path.display(), "configuration file loaded");
    Ok(file)
}

fn xdg_dir(var: &str, fallback: &str) -> PathBuf {
    std::env::var(var).map(PathBuf::from).unwrap_or_else(|_| {
        let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
        PathBuf::from(home).join(fallback)
    })
}

fn default_config_path() -> PathBuf {
    xdg_dir("XDG_CONFIG_HOME", ".config").join("rollcall/rollcalld.toml")
}

fn default_data_dir() -> PathBuf {
    xdg_dir("XDG_DATA_HOME", ".local/share").join("rollcall")
}

fn default_workers() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
        .min(MAX_DEFAULT_WORKERS)
}

fn env_parse<F, T>(env: &F, key: &str) -> Result<Option<T>, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
{
    match env(key) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::Invalid(format!("{key}={raw:?} is not a valid value"))),
    }
}

fn env_bool<F>(env: &F, key: &str) -> Result<Option<bool>, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    match env(key).as_deref().map(str::trim) {
        None => Ok(None),
        Some("1" | "true" | "yes") => Ok(Some(true)),
        Some("0" | "false" | "no") => Ok(Some(false)),
        Some(other) => Err(ConfigError::Invalid(format!("{key}={other:?} is not a boolean"))),
    }
}
