use std::path::{Path, PathBuf};

use finwise_categorize::CategorizerConfig;
use finwise_ocr::{PreprocessConfig, DEFAULT_LANGUAGES};
use serde::Deserialize;
use thiserror::Error;

pub const CONFIG_ENV: &str = "FINWISE_CONFIG";
pub const DEFAULT_CONFIG_FILE: &str = "finwise.toml";
pub const DEFAULT_LOG_FILTER: &str = "finwise=info,tower_http=info";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Invalid config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("Invalid value for {var}: {value:?}")]
    InvalidEnv { var: &'static str, value: String },
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub server: ServerSettings,
    pub logging: LoggingSettings,
    pub ml: MlSettings,
    pub ocr: OcrSettings,
    pub preprocess: PreprocessConfig,
    pub categorizer: CategorizerConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    pub host: String,
    pub port: u16,
    /// Upper bound for request bodies; base64 photos are large.
    pub body_limit_bytes: usize,
    pub allowed_origins: Vec<String>,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8000,
            body_limit_bytes: 20 * 1024 * 1024,
            allowed_origins: vec!["http://localhost".to_string(), "http://localhost:3000".to_string()],
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    pub format: LogFormat,
    /// `EnvFilter` directives; `RUST_LOG` takes precedence.
    pub filter: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MlSettings {
    /// Directory holding the exported classifier artifacts.
    pub models_path: PathBuf,
    /// TOML keyword table replacing the built-in one.
    pub rules_path: Option<PathBuf>,
}

impl Default for MlSettings {
    fn default() -> Self {
        Self { models_path: PathBuf::from("models"), rules_path: None }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct OcrSettings {
    pub languages: String,
    /// Tesseract `tessdata` directory; system default when unset.
    pub data_path: Option<String>,
}

impl Default for OcrSettings {
    fn default() -> Self {
        Self { languages: DEFAULT_LANGUAGES.to_string(), data_path: None }
    }
}

impl Settings {
    /// File named by `FINWISE_CONFIG` (or `finwise.toml` if present), then
    /// environment overrides.
    pub fn load() -> Result<Self, ConfigError> {
        let mut settings = match std::env::var(CONFIG_ENV) {
            Ok(path) => Self::from_file(Path::new(&path))?,
            Err(_) if Path::new(DEFAULT_CONFIG_FILE).exists() => {
                Self::from_file(Path::new(DEFAULT_CONFIG_FILE))?
            }
            Err(_) => Self::default(),
        };
        settings.apply_overrides(|var| std::env::var(var).ok())?;
        Ok(settings)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)
            .map_err(|source| ConfigError::Io { path: path.to_path_buf(), source })?;
        Self::from_toml(&text).map_err(|source| ConfigError::Parse { path: path.to_path_buf(), source })
    }

    pub fn from_toml(text: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(text)
    }

    /// `FINWISE_HOST`, `FINWISE_PORT` and `FINWISE_MODELS_PATH` win over the file.
    pub fn apply_overrides(&mut self, get: impl Fn(&str) -> Option<String>) -> Result<(), ConfigError> {
        if let Some(host) = get("FINWISE_HOST") {
            self.server.host = host;
        }
        if let Some(port) = get("FINWISE_PORT") {
            self.server.port = port
                .parse()
                .map_err(|_| ConfigError::InvalidEnv { var: "FINWISE_PORT", value: port })?;
        }
        if let Some(path) = get("FINWISE_MODELS_PATH") {
            self.ml.models_path = PathBuf::from(path);
        }
        Ok(())
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }

    pub fn log_filter(&self) -> &str {
        self.logging.filter.as_deref().unwrap_or(DEFAULT_LOG_FILTER)
    }
}
