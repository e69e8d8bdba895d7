use crate::decoder::{DecodeStrategy, DecodeStrategyKind, DEFAULT_JPEG_QUALITY};
use serde::Deserialize;
use std::path::PathBuf;

pub trait Validatable {
    fn validate(&self) -> Result<(), String>;
}

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub server: ServerConfig,
    #[serde(deserialize_with = "deserialize_log_level")]
    pub log_level: LogLevel,
    pub auth: AuthConfig,
    pub model: ModelConfig,
    #[serde(default)]
    pub processing: ProcessingConfig,
}

fn deserialize_log_level<'de, D>(deserializer: D) -> Result<LogLevel, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let s = String::deserialize(deserializer)?;
    s.try_into().map_err(serde::de::Error::custom)
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    #[serde(default = "default_body_limit_bytes")]
    pub body_limit_bytes: usize,
    /// Origins allowed by CORS. Empty allows any origin.
    #[serde(default)]
    pub allowed_origins: Vec<String>,
}

fn default_body_limit_bytes() -> usize {
    10 * 1024 * 1024
}

impl ServerConfig {
    pub fn get_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[derive(Deserialize, Clone)]
pub struct AuthConfig {
    #[serde(default)]
    pub access_token: String,
}

// Keeps the secret out of the startup config dump.
impl std::fmt::Debug for AuthConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthConfig")
            .field("access_token", &"<redacted>")
            .finish()
    }
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
pub enum ModelName {
    InceptionV3,
    MobileNetV2,
    MobileNetV2Mid,
}

impl ModelName {
    pub fn as_str(&self) -> &'static str {
        match self {
            ModelName::InceptionV3 => "InceptionV3",
            ModelName::MobileNetV2 => "MobileNetV2",
            ModelName::MobileNetV2Mid => "MobileNetV2Mid",
        }
    }

    pub fn default_input_size(&self) -> u32 {
        match self {
            ModelName::InceptionV3 => 299,
            ModelName::MobileNetV2 | ModelName::MobileNetV2Mid => 224,
        }
    }
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    /// One session, one request at a time.
    #[default]
    Serialized,
    /// `num_instances` sessions dispatched round-robin.
    Pooled,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ModelConfig {
    #[serde(default = "default_model_name")]
    pub name: ModelName,
    pub model_dir: PathBuf,
    pub onnx_file: Option<String>,
    pub input_size: Option<u32>,
    #[serde(default = "default_dtype")]
    pub input_dtype: String,
    pub output_name: Option<String>,
    #[serde(default = "default_labels")]
    pub labels: Vec<String>,
    #[serde(default = "default_top_k")]
    pub top_k: usize,
    #[serde(default)]
    pub apply_softmax: bool,
    #[serde(default)]
    pub execution: ExecutionMode,
    #[serde(default = "default_model_instances")]
    pub num_instances: usize,
}

fn default_model_name() -> ModelName {
    ModelName::InceptionV3
}

fn default_dtype() -> String {
    "int32".to_string()
}

fn default_labels() -> Vec<String> {
    ["Drawing", "Hentai", "Neutral", "Porn", "Sexy"]
        .into_iter()
        .map(String::from)
        .collect()
}

fn default_top_k() -> usize {
    5
}

fn default_model_instances() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
}

impl ModelConfig {
    pub fn get_path(&self) -> PathBuf {
        match &self.onnx_file {
            Some(file) => self.model_dir.join(file),
            None => self.model_dir.join(format!("{}.onnx", self.name.as_str())),
        }
    }

    pub fn get_input_size(&self) -> u32 {
        self.input_size
            .unwrap_or_else(|| self.name.default_input_size())
    }

    pub fn session_count(&self) -> usize {
        match self.execution {
            ExecutionMode::Serialized => 1,
            ExecutionMode::Pooled => self.num_instances,
        }
    }
}

impl Validatable for ModelConfig {
    fn validate(&self) -> Result<(), String> {
        if !self.get_path().exists() {
            return Err(format!("Model file not found: {:?}", self.get_path()));
        }
        if self.labels.is_empty() {
            return Err("At least one class label must be configured".to_string());
        }
        if self.top_k == 0 {
            return Err("top_k must be at least 1".to_string());
        }
        if self.num_instances == 0 {
            return Err("num_instances must be at least 1".to_string());
        }
        if self.get_input_size() == 0 {
            return Err("input_size must be positive".to_string());
        }
        Ok(())
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ProcessingConfig {
    #[serde(default)]
    pub decode_strategy: DecodeStrategyKind,
    #[serde(default = "default_jpeg_quality")]
    pub jpeg_quality: u8,
    #[serde(default = "default_dtype")]
    pub tensor_dtype: String,
}

fn default_jpeg_quality() -> u8 {
    DEFAULT_JPEG_QUALITY
}

impl Default for ProcessingConfig {
    fn default() -> Self {
        Self {
            decode_strategy: DecodeStrategyKind::default(),
            jpeg_quality: default_jpeg_quality(),
            tensor_dtype: default_dtype(),
        }
    }
}

impl ProcessingConfig {
    pub fn get_decode_strategy(&self) -> DecodeStrategy {
        DecodeStrategy::from_kind(self.decode_strategy, self.jpeg_quality)
    }
}

impl Validatable for ProcessingConfig {
    fn validate(&self) -> Result<(), String> {
        if !(1..=100).contains(&self.jpeg_quality) {
            return Err(format!(
                "jpeg_quality must be between 1 and 100, got {}",
                self.jpeg_quality
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Deserialize, Clone)]
pub enum Environment {
    Local,
    Production,
}

impl Environment {
    pub fn as_str(&self) -> &'static str {
        match self {
            Environment::Local => "local",
            Environment::Production => "production",
        }
    }
}

impl TryFrom<String> for Environment {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        match s.to_lowercase().as_str() {
            "local" => Ok(Self::Local),
            "production" => Ok(Self::Production),
            other => Err(format!(
                "{} is not a supported environment. Use either `local` or `production`.",
                other
            )),
        }
    }
}

#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
pub enum LogLevel {
    Debug,
    Info,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
        }
    }
}

impl TryFrom<String> for LogLevel {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        match s.to_lowercase().as_str() {
            "debug" => Ok(Self::Debug),
            "info" => Ok(Self::Info),
            other => Err(format!(
                "{} is not a supported minimum log level. Use either `debug` or `info`.",
                other
            )),
        }
    }
}

pub fn get_configuration() -> Result<Config, config::ConfigError> {
    let base_path = std::env::current_dir()
        .map_err(|e| config::ConfigError::Message(format!("No current directory: {}", e)))?;
    let configuration_directory = base_path.join("configuration");

    let environment: Environment = std::env::var("APP_ENVIRONMENT")
        .unwrap_or_else(|_| "local".into())
        .try_into()
        .map_err(config::ConfigError::Message)?;

    let config = config::Config::builder()
        .add_source(config::File::from(
            configuration_directory.join("base.yaml"),
        ))
        .add_source(
            config::File::from(
                configuration_directory.join(format!("{}.yaml", environment.as_str())),
            )
            .required(false),
        )
        .add_source(
            config::Environment::with_prefix("APP")
                .prefix_separator("_")
                .separator("__"),
        )
        .build()?;

    let config = config.try_deserialize::<Config>()?;
    tracing::debug!("{:?}", config);

    let checks: [&dyn Validatable; 2] = [&config.model, &config.processing];
    for check in checks {
        if let Err(e) = check.validate() {
            tracing::error!("Configuration validation failed: {}", e);
            return Err(config::ConfigError::Message(e));
        }
    }

    Ok(config)
}
