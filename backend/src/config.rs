use std::collections::HashSet;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use shared::ScoreScale;

use crate::pipeline::compose::MaskMode;
use crate::pipeline::preprocess::PreprocessingConfig;
use crate::pipeline::rank::RankOptions;

const DEFAULT_PORT: u16 = 8081;
const DEFAULT_MAX_UPLOAD_BYTES: usize = 50 * 1024 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("Invalid YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("Invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

impl ConfigError {
    fn invalid<K: Into<String>, M: Into<String>>(key: K, message: M) -> Self {
        Self::InvalidValue {
            key: key.into(),
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ModelBackend {
    /// ONNX through tract.
    #[default]
    Tract,
    /// TorchScript through libtorch.
    Torch,
}

impl fmt::Display for ModelBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ModelBackend::Tract => write!(f, "tract"),
            ModelBackend::Torch => write!(f, "torch"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelSpec {
    #[serde(default)]
    pub backend: ModelBackend,
    pub path: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassifierConfig {
    #[serde(flatten)]
    pub model: ModelSpec,
    /// Class index -> label, in model output order.
    pub labels: Vec<String>,
    #[serde(default)]
    pub preprocessing: PreprocessingConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SegmentationConfig {
    #[serde(flatten)]
    pub model: ModelSpec,
    #[serde(default = "segmentation_preprocessing")]
    pub preprocessing: PreprocessingConfig,
    #[serde(default)]
    pub mask: MaskMode,
}

fn segmentation_preprocessing() -> PreprocessingConfig {
    PreprocessingConfig {
        size: [1024, 1024],
        mean: [0.5, 0.5, 0.5],
        std: [1.0, 1.0, 1.0],
        ..PreprocessingConfig::default()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EndpointsConfig {
    pub predict: RankOptions,
    pub analyze: RankOptions,
    pub remove_background: RankOptions,
}

impl Default for EndpointsConfig {
    fn default() -> Self {
        Self {
            predict: RankOptions::default(),
            analyze: RankOptions {
                include_logits: true,
                ..RankOptions::top(1)
            },
            remove_background: RankOptions {
                top_k: None,
                scale: ScoreScale::Percent,
                include_logits: false,
            },
        }
    }
}

impl EndpointsConfig {
    fn all_mut(&mut self) -> [&mut RankOptions; 3] {
        [
            &mut self.predict,
            &mut self.analyze,
            &mut self.remove_background,
        ]
    }
}

/// Model and presentation settings, read from a YAML file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfig {
    pub classifier: ClassifierConfig,
    #[serde(default)]
    pub segmentation: Option<SegmentationConfig>,
    #[serde(default)]
    pub endpoints: EndpointsConfig,
}

impl PipelineConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let config_str = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let mut config = Self::from_yaml_str(&config_str)?;
        if let Some(base) = path.parent() {
            config.resolve_model_paths(base);
        }
        Ok(config)
    }

    pub fn from_yaml_str(yaml: &str) -> Result<Self, ConfigError> {
        let config: PipelineConfig = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Relative model paths are relative to the config file.
    fn resolve_model_paths(&mut self, base: &Path) {
        let resolve = |path: &mut PathBuf| {
            if path.is_relative() {
                *path = base.join(&*path);
            }
        };
        resolve(&mut self.classifier.model.path);
        if let Some(segmentation) = self.segmentation.as_mut() {
            resolve(&mut segmentation.model.path);
        }
    }

    /// Environment overrides applied after the file is read.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(path) = lookup("CLASSIFIER_MODEL_PATH") {
            self.classifier.model.path = PathBuf::from(path);
        }
        if let Some(path) = lookup("SEGMENTATION_MODEL_PATH") {
            match self.segmentation.as_mut() {
                Some(segmentation) => segmentation.model.path = PathBuf::from(path),
                None => {
                    return Err(ConfigError::invalid(
                        "SEGMENTATION_MODEL_PATH",
                        "no segmentation section in the pipeline config",
                    ));
                }
            }
        }
        if let Some(raw) = lookup("SCORE_SCALE") {
            let scale = ScoreScale::from_str(raw.trim())
                .map_err(|_| ConfigError::invalid("SCORE_SCALE", format!("unknown scale `{raw}`")))?;
            for options in self.endpoints.all_mut() {
                options.scale = scale;
            }
        }
        self.validate()
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let labels = &self.classifier.labels;
        if labels.is_empty() {
            return Err(ConfigError::invalid("classifier.labels", "at least one label is required"));
        }
        let mut seen = HashSet::new();
        for label in labels {
            if label.trim().is_empty() {
                return Err(ConfigError::invalid("classifier.labels", "labels must not be blank"));
            }
            if !seen.insert(label.as_str()) {
                return Err(ConfigError::invalid(
                    "classifier.labels",
                    format!("duplicate label `{label}`"),
                ));
            }
        }

        validate_preprocessing("classifier.preprocessing", &self.classifier.preprocessing)?;
        if let Some(segmentation) = &self.segmentation {
            validate_preprocessing("segmentation.preprocessing", &segmentation.preprocessing)?;
            if let MaskMode::Binary { threshold } = segmentation.mask {
                if !(0.0..=1.0).contains(&threshold) {
                    return Err(ConfigError::invalid(
                        "segmentation.mask.threshold",
                        format!("{threshold} is outside [0, 1]"),
                    ));
                }
            }
        }

        let endpoints = [
            ("endpoints.predict", &self.endpoints.predict),
            ("endpoints.analyze", &self.endpoints.analyze),
            ("endpoints.remove_background", &self.endpoints.remove_background),
        ];
        for (key, options) in endpoints {
            if options.top_k == Some(0) {
                return Err(ConfigError::invalid(format!("{key}.top_k"), "must be at least 1"));
            }
        }
        Ok(())
    }
}

fn validate_preprocessing(key: &str, config: &PreprocessingConfig) -> Result<(), ConfigError> {
    if config.size.contains(&0) {
        return Err(ConfigError::invalid(format!("{key}.size"), "dimensions must be positive"));
    }
    if config.std.iter().any(|s| *s == 0.0 || !s.is_finite()) {
        return Err(ConfigError::invalid(format!("{key}.std"), "must be finite and non-zero"));
    }
    if !config.rescale.is_finite() || config.rescale <= 0.0 {
        return Err(ConfigError::invalid(format!("{key}.rescale"), "must be positive"));
    }
    Ok(())
}

/// Process-level settings from the environment (and `.env`).
#[derive(Debug, Clone, PartialEq)]
pub struct ServiceConfig {
    pub host: String,
    pub port: u16,
    pub workers: Option<usize>,
    pub max_upload_bytes: usize,
    pub pipeline_path: PathBuf,
}

impl ServiceConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let port = match lookup("PORT") {
            Some(raw) => parse_number("PORT", &raw)?,
            None => DEFAULT_PORT,
        };
        let workers = lookup("WORKERS")
            .map(|raw| parse_number::<usize>("WORKERS", &raw))
            .transpose()?;
        if workers == Some(0) {
            return Err(ConfigError::invalid("WORKERS", "must be at least 1"));
        }
        let max_upload_bytes = match lookup("MAX_UPLOAD_BYTES") {
            Some(raw) => parse_number("MAX_UPLOAD_BYTES", &raw)?,
            None => DEFAULT_MAX_UPLOAD_BYTES,
        };

        let pipeline_path = match lookup("PIPELINE_CONFIG") {
            Some(path) => PathBuf::from(path),
            None => match lookup("CARGO_MANIFEST_DIR") {
                Some(manifest_dir) => PathBuf::from(manifest_dir).join("../config/pipeline.yaml"),
                None => PathBuf::from("config/pipeline.yaml"),
            },
        };

        Ok(Self {
            host: lookup("BIND_HOST").unwrap_or_else(|| "0.0.0.0".to_string()),
            port,
            workers,
            max_upload_bytes,
            pipeline_path,
        })
    }

    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

fn parse_number<T: FromStr>(key: &str, raw: &str) -> Result<T, ConfigError>
where
    T::Err: fmt::Display,
{
    raw.trim()
        .parse()
        .map_err(|e: T::Err| ConfigError::invalid(key, format!("`{raw}`: {e}")))
}
