//! Configuration loading and XDG path helpers.

use std::path::PathBuf;

use config::{Config, Environment, File};
use directories::ProjectDirs;
use serde::Deserialize;
use thiserror::Error;

use stipula_server::ServerConfig;

const CONFIG_FILE: &str = "config/settings";

#[derive(Debug, Error)]
pub enum AppConfigError {
    #[error("unable to resolve project directories")]
    MissingProjectDirs,
    #[error(transparent)]
    Build(#[from] config::ConfigError),
}

#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub storage: StorageConfig,
    #[serde(default)]
    pub pdf: PdfConfig,
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub worker: WorkerConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct StorageConfig {
    pub path: PathBuf,
    #[serde(default = "StorageConfig::default_uploads_bucket")]
    pub uploads_bucket: String,
    #[serde(default = "StorageConfig::default_extractions_bucket")]
    pub extractions_bucket: String,
}

impl StorageConfig {
    fn default_uploads_bucket() -> String {
        "uploads".to_string()
    }

    fn default_extractions_bucket() -> String {
        "extractions".to_string()
    }
}

/// Pre-parse validation limits for uploaded documents.
#[derive(Debug, Deserialize, Clone, Copy)]
pub struct PdfConfig {
    #[serde(default = "PdfConfig::default_max_file_size_mb")]
    pub max_file_size_mb: u64,
    #[serde(default = "PdfConfig::default_max_pages")]
    pub max_pages: usize,
}

impl PdfConfig {
    fn default_max_file_size_mb() -> u64 {
        25
    }

    fn default_max_pages() -> usize {
        100
    }

    pub fn max_size_bytes(&self) -> u64 {
        self.max_file_size_mb.saturating_mul(1024 * 1024)
    }
}

impl Default for PdfConfig {
    fn default() -> Self {
        Self {
            max_file_size_mb: Self::default_max_file_size_mb(),
            max_pages: Self::default_max_pages(),
        }
    }
}

/// Settings for the structured-extraction model client. The API key itself is
/// read from `OPENAI_API_KEY` by the client constructor, never from files.
#[derive(Debug, Deserialize, Clone)]
pub struct LlmConfig {
    #[serde(default = "LlmConfig::default_base_url")]
    pub base_url: String,
    #[serde(default = "LlmConfig::default_model")]
    pub model: String,
    #[serde(default = "LlmConfig::default_max_chars")]
    pub max_chars: usize,
    #[serde(default = "LlmConfig::default_temperature")]
    pub temperature: f64,
    #[serde(default = "LlmConfig::default_timeout_s")]
    pub timeout_s: u64,
    #[serde(default = "LlmConfig::default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "LlmConfig::default_base_delay_ms")]
    pub base_delay_ms: i64,
    #[serde(default = "LlmConfig::default_max_delay_ms")]
    pub max_delay_ms: i64,
}

impl LlmConfig {
    fn default_base_url() -> String {
        "https://api.openai.com/v1".to_string()
    }

    fn default_model() -> String {
        "gpt-4o-mini".to_string()
    }

    fn default_max_chars() -> usize {
        200_000
    }

    fn default_temperature() -> f64 {
        0.1
    }

    fn default_timeout_s() -> u64 {
        60
    }

    fn default_max_attempts() -> u32 {
        3
    }

    fn default_base_delay_ms() -> i64 {
        1_000
    }

    fn default_max_delay_ms() -> i64 {
        60_000
    }
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            base_url: Self::default_base_url(),
            model: Self::default_model(),
            max_chars: Self::default_max_chars(),
            temperature: Self::default_temperature(),
            timeout_s: Self::default_timeout_s(),
            max_attempts: Self::default_max_attempts(),
            base_delay_ms: Self::default_base_delay_ms(),
            max_delay_ms: Self::default_max_delay_ms(),
        }
    }
}

/// Worker pool and scheduling knobs.
#[derive(Debug, Deserialize, Clone, Copy)]
pub struct WorkerConfig {
    #[serde(default = "WorkerConfig::default_concurrency")]
    pub concurrency: usize,
    #[serde(default = "WorkerConfig::default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

impl WorkerConfig {
    fn default_concurrency() -> usize {
        4
    }

    fn default_poll_interval_ms() -> u64 {
        1_000
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            concurrency: Self::default_concurrency(),
            poll_interval_ms: Self::default_poll_interval_ms(),
        }
    }
}

pub fn load() -> Result<AppConfig, AppConfigError> {
    let default_storage = default_storage_path()?;
    let builder = Config::builder()
        .set_default("server.listen_addr", "127.0.0.1:8080")?
        .set_default(
            "storage.path",
            default_storage.to_string_lossy().to_string(),
        )?
        .add_source(File::with_name(CONFIG_FILE).required(false))
        .add_source(Environment::with_prefix("STIPULA").separator("__"));

    let cfg = builder.build()?.try_deserialize()?;
    Ok(cfg)
}

pub fn project_dirs() -> Result<ProjectDirs, AppConfigError> {
    ProjectDirs::from("dev", "ribelo", "stipula").ok_or(AppConfigError::MissingProjectDirs)
}

fn default_storage_path() -> Result<PathBuf, AppConfigError> {
    Ok(project_dirs()?.data_dir().to_path_buf())
}
