//! Service configuration

use anyhow::Context;
use serde::Deserialize;
use std::io::ErrorKind;
use std::path::PathBuf;

/// Environment variable holding an alternative config file path
pub const CONFIG_PATH_ENV: &str = "IMAGE_INSIGHT_CONFIG";

/// Environment variable overriding `caption.api_token`
pub const TOKEN_ENV: &str = "HF_TOKEN";

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub inference: InferenceConfig,
    pub models: ModelsConfig,
    pub face: FaceConfig,
    pub ocr: OcrConfig,
    pub caption: CaptionConfig,
    pub storage: StorageConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub body_limit_mb: usize,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct InferenceConfig {
    pub device: String,
    /// Seconds a model may stay unused before it is unloaded
    pub model_idle_timeout: u64,
    /// Seconds between idle checks
    pub cleanup_interval: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ModelsConfig {
    pub face_detector: PathBuf,
    pub gender_age: PathBuf,
    pub text_detector: PathBuf,
    pub text_recognizer: PathBuf,
    pub text_dictionary: PathBuf,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FaceConfig {
    pub confidence_threshold: f32,
    pub nms_threshold: f32,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct OcrConfig {
    pub det_threshold: f32,
    pub box_threshold: f32,
    pub unclip_ratio: f32,
    pub max_side_len: u32,
    pub max_rec_width: u32,
    pub min_confidence: f32,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CaptionConfig {
    pub endpoint: String,
    pub model: String,
    pub api_token: Option<String>,
    pub max_new_tokens: u32,
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub sqlite_path: PathBuf,
    pub data_dir: PathBuf,
    pub save_images: bool,
}

impl Config {
    pub fn load(path: &str) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path))?;
        Self::parse(path, &content)
    }

    /// Like [`Config::load`], but a missing file yields the defaults.
    /// Unreadable or malformed files are still errors.
    pub fn load_or_default(path: &str) -> anyhow::Result<Self> {
        match std::fs::read_to_string(path) {
            Ok(content) => Self::parse(path, &content),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                tracing::info!("Config file {} not found, using defaults", path);
                let mut config = Config::default();
                config.apply_env();
                Ok(config)
            }
            Err(e) => Err(e).with_context(|| format!("Failed to read config file {}", path)),
        }
    }

    fn parse(path: &str, content: &str) -> anyhow::Result<Self> {
        let mut config: Config =
            toml::from_str(content).with_context(|| format!("Invalid config file {}", path))?;
        config.apply_env();
        Ok(config)
    }

    /// Config path from `IMAGE_INSIGHT_CONFIG`, else `config.toml`
    pub fn default_path() -> String {
        std::env::var(CONFIG_PATH_ENV).unwrap_or_else(|_| "config.toml".to_string())
    }

    /// Apply environment overrides on top of file values
    pub fn apply_env(&mut self) {
        if let Ok(token) = std::env::var(TOKEN_ENV) {
            if !token.is_empty() {
                self.caption.api_token = Some(token);
            }
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8000,
            body_limit_mb: 20,
        }
    }
}

impl Default for InferenceConfig {
    fn default() -> Self {
        Self {
            device: "CPU".to_string(),
            model_idle_timeout: 300,
            cleanup_interval: 60,
        }
    }
}

impl Default for ModelsConfig {
    fn default() -> Self {
        Self {
            face_detector: PathBuf::from("models/scrfd_10g_kps.onnx"),
            gender_age: PathBuf::from("models/genderage.onnx"),
            text_detector: PathBuf::from("models/en_PP-OCRv3_det.onnx"),
            text_recognizer: PathBuf::from("models/en_PP-OCRv4_rec.onnx"),
            text_dictionary: PathBuf::from("models/en_dict.txt"),
        }
    }
}

impl Default for FaceConfig {
    fn default() -> Self {
        Self {
            confidence_threshold: 0.5,
            nms_threshold: 0.4,
        }
    }
}

impl Default for OcrConfig {
    fn default() -> Self {
        Self {
            det_threshold: 0.3,
            box_threshold: 0.6,
            unclip_ratio: 1.5,
            max_side_len: 960,
            max_rec_width: 320,
            min_confidence: 0.5,
        }
    }
}

impl Default for CaptionConfig {
    fn default() -> Self {
        Self {
            endpoint: "https://api-inference.huggingface.co".to_string(),
            model: "Salesforce/blip-image-captioning-base".to_string(),
            api_token: None,
            max_new_tokens: 32,
            timeout_secs: 60,
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            sqlite_path: PathBuf::from("data/insight.db"),
            data_dir: PathBuf::from("data"),
            save_images: true,
        }
    }
}
