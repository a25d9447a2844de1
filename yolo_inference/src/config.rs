use crate::inference_service::LabelPolicy;
use serde::Deserialize;
use std::{collections::HashMap, path::PathBuf};

const MODEL_PATH_ENV: &str = "YOLO_MODEL_PATH";
const DEVICE_ENV: &str = "YOLO_DEVICE";

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub server: ServerConfig,
    #[serde(deserialize_with = "deserialize_log_level")]
    pub log_level: LogLevel,
    #[serde(default)]
    pub model: ModelConfig,
    #[serde(default)]
    pub inference: InferenceConfig,
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
}

impl ServerConfig {
    pub fn get_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ModelConfig {
    #[serde(default = "default_model_dir")]
    pub model_dir: PathBuf,
    #[serde(default = "default_onnx_file")]
    pub onnx_file: String,
    /// Explicit artifact path, wins over `model_dir`/`onnx_file`.
    #[serde(default)]
    pub path: Option<PathBuf>,
    #[serde(default)]
    pub labels_file: Option<PathBuf>,
    #[serde(default)]
    pub device: Option<String>,
    #[serde(default = "default_intra_threads")]
    pub intra_threads: usize,
}

fn default_model_dir() -> PathBuf {
    PathBuf::from("models")
}

fn default_onnx_file() -> String {
    "yolov8n.onnx".to_string()
}

fn default_intra_threads() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            model_dir: default_model_dir(),
            onnx_file: default_onnx_file(),
            path: None,
            labels_file: None,
            device: None,
            intra_threads: default_intra_threads(),
        }
    }
}

impl ModelConfig {
    pub fn get_model_path(&self) -> PathBuf {
        match &self.path {
            Some(path) => path.clone(),
            None => self.model_dir.join(&self.onnx_file),
        }
    }
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct InferenceConfig {
    #[serde(default)]
    pub label_policy: LabelPolicy,
    /// Class id (as text) to application label, layered over the built-in mapping.
    #[serde(default)]
    pub class_labels: HashMap<String, String>,
    #[serde(default)]
    pub label_thresholds: HashMap<String, f32>,
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

#[derive(Debug, Deserialize, Clone)]
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

fn non_empty_env(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|value| !value.trim().is_empty())
}

pub fn get_configuration() -> Result<Config, config::ConfigError> {
    let base_path = std::env::current_dir()
        .map_err(|e| config::ConfigError::Message(format!("current directory: {}", e)))?;
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
        .set_override_option("model.path", non_empty_env(MODEL_PATH_ENV))?
        .set_override_option("model.device", non_empty_env(DEVICE_ENV))?
        .build()?;

    let config: Config = config.try_deserialize::<Config>()?;

    Ok(config)
}
