//! Environment-driven configuration.
//!
//! Settings are loaded once at startup via [`Config::from_env`] (after
//! `dotenvy` has had a chance to populate the process environment from a
//! `.env` file). Invalid combinations are rejected early with descriptive
//! errors so misconfiguration is easy to diagnose.
//!
//! The configuration covers:
//!
//! - Postgres connectivity (`DATABASE_URL`) and the HTTP listen address
//!   (`SERVER_ADDR?`).
//! - The watched directories (`DROP_DIR`, `ARCHIVE_DIR`, `BAD_DIR`) and
//!   the watcher quiet period (`MONITORING_TIME_SECS?`).
//! - Chunking (`CHUNK_SIZE?`, `CHUNK_OVERLAP?`).
//! - The embedding service (`EMBEDDING_URL`, `EMBEDDING_MODEL`,
//!   `EMBEDDING_DIMENSION?`).
//! - The vision service (`VISION_URL`, `VISION_MODEL`).
//! - The PDF→markdown converter (`CONVERTER_URL`, `PDF_CROP_TOP_PT?`,
//!   `PDF_CROP_BOTTOM_PT?`).
//! - Retrieval tuning (`SEARCH_TOP_K?`, `SEARCH_MIN_DISTANCE?`,
//!   `CONTEXT_BUDGET?`) and the hosted-LLM key (`LLM_API_KEY?`).

use std::env;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Errors encountered while loading configuration from the environment.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Required environment variable was not provided.
    #[error("missing environment variable: {0}")]
    MissingVariable(String),
    /// Environment variable contained a value that could not be parsed
    /// or violates a documented range.
    #[error("invalid value for {0}: {1}")]
    InvalidValue(String, String),
}

/// Runtime configuration shared by the ingest pipeline and the server.
#[derive(Debug, Clone)]
pub struct Config {
    /// Postgres connection string.
    pub database_url: String,
    /// HTTP listen address for `docqa serve`.
    pub server_addr: String,
    /// Directory watched for dropped files.
    pub drop_dir: PathBuf,
    /// Destination root for successfully ingested files.
    pub archive_dir: PathBuf,
    /// Destination root for stale re-submissions.
    pub bad_dir: PathBuf,
    /// Quiet period a file must survive unchanged before dispatch.
    pub monitoring_time: Duration,
    /// Sliding-window size in whitespace-separated words.
    pub chunk_size: usize,
    /// Window overlap in words. Always strictly less than the window.
    pub chunk_overlap: usize,
    /// Embedding service endpoint.
    pub embedding_url: String,
    /// Embedding model identifier sent with every request.
    pub embedding_model: String,
    /// Dimensionality of stored vectors.
    pub embedding_dimension: usize,
    /// Vision-language service endpoint.
    pub vision_url: String,
    /// Vision model identifier.
    pub vision_model: String,
    /// PDF→markdown converter endpoint.
    pub converter_url: String,
    /// Header crop offset in PDF points (1 pt = 1/72 inch).
    pub pdf_crop_top_pt: f32,
    /// Footer crop offset in PDF points.
    pub pdf_crop_bottom_pt: f32,
    /// Candidate count for vector search.
    pub search_top_k: i64,
    /// Relevance threshold; chunks at or below it are rejected.
    pub search_min_distance: f64,
    /// Context character budget.
    pub context_budget: usize,
    /// Bearer token for the hosted chat LLM.
    pub llm_api_key: Option<String>,
}

impl Config {
    /// Load and validate configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let chunk_size = load_usize_with_default("CHUNK_SIZE", 250)?;
        let chunk_overlap = load_usize_with_default("CHUNK_OVERLAP", 50)?;

        if !(10..=1200).contains(&chunk_size) {
            return Err(ConfigError::InvalidValue(
                "CHUNK_SIZE".into(),
                "must be between 10 and 1200 words".into(),
            ));
        }
        if chunk_overlap >= chunk_size {
            return Err(ConfigError::InvalidValue(
                "CHUNK_OVERLAP".into(),
                "must be strictly less than CHUNK_SIZE".into(),
            ));
        }

        let search_min_distance = load_f64_with_default("SEARCH_MIN_DISTANCE", 0.55)?;
        if !(0.0..=1.0).contains(&search_min_distance) {
            return Err(ConfigError::InvalidValue(
                "SEARCH_MIN_DISTANCE".into(),
                "must be between 0.0 and 1.0".into(),
            ));
        }

        let search_top_k = load_usize_with_default("SEARCH_TOP_K", 3)? as i64;
        if search_top_k == 0 {
            return Err(ConfigError::InvalidValue(
                "SEARCH_TOP_K".into(),
                "must be at least 1".into(),
            ));
        }

        let embedding_dimension = load_usize_with_default("EMBEDDING_DIMENSION", 1024)?;
        if embedding_dimension == 0 {
            return Err(ConfigError::InvalidValue(
                "EMBEDDING_DIMENSION".into(),
                "must be greater than zero".into(),
            ));
        }

        let monitoring_secs = load_usize_with_default("MONITORING_TIME_SECS", 5)?;

        Ok(Self {
            database_url: load_env("DATABASE_URL")?,
            server_addr: load_env_optional("SERVER_ADDR")
                .unwrap_or_else(|| "0.0.0.0:8080".to_string()),
            drop_dir: PathBuf::from(load_env("DROP_DIR")?),
            archive_dir: PathBuf::from(load_env("ARCHIVE_DIR")?),
            bad_dir: PathBuf::from(load_env("BAD_DIR")?),
            monitoring_time: Duration::from_secs(monitoring_secs as u64),
            chunk_size,
            chunk_overlap,
            embedding_url: load_env("EMBEDDING_URL")?,
            embedding_model: load_env("EMBEDDING_MODEL")?,
            embedding_dimension,
            vision_url: load_env("VISION_URL")?,
            vision_model: load_env("VISION_MODEL")?,
            converter_url: load_env("CONVERTER_URL")?,
            pdf_crop_top_pt: load_f32_with_default("PDF_CROP_TOP_PT", 0.0)?,
            pdf_crop_bottom_pt: load_f32_with_default("PDF_CROP_BOTTOM_PT", 0.0)?,
            search_top_k,
            search_min_distance,
            context_budget: load_usize_with_default("CONTEXT_BUDGET", 40_000)?,
            llm_api_key: load_env_optional("LLM_API_KEY"),
        })
    }

    /// Create the drop, archive and bad directories if they are missing.
    pub fn ensure_directories(&self) -> std::io::Result<()> {
        for dir in [&self.drop_dir, &self.archive_dir, &self.bad_dir] {
            std::fs::create_dir_all(dir)?;
        }
        Ok(())
    }
}

fn load_env(key: &str) -> Result<String, ConfigError> {
    env::var(key).map_err(|_| ConfigError::MissingVariable(key.to_string()))
}

fn load_env_optional(key: &str) -> Option<String> {
    env::var(key).ok().filter(|value| !value.trim().is_empty())
}

fn load_usize_with_default(key: &str, default: usize) -> Result<usize, ConfigError> {
    match load_env_optional(key) {
        Some(value) => value
            .parse()
            .map_err(|_| ConfigError::InvalidValue(key.to_string(), "not an integer".into())),
        None => Ok(default),
    }
}

fn load_f64_with_default(key: &str, default: f64) -> Result<f64, ConfigError> {
    match load_env_optional(key) {
        Some(value) => value
            .parse()
            .map_err(|_| ConfigError::InvalidValue(key.to_string(), "not a number".into())),
        None => Ok(default),
    }
}

fn load_f32_with_default(key: &str, default: f32) -> Result<f32, ConfigError> {
    match load_env_optional(key) {
        Some(value) => value
            .parse()
            .map_err(|_| ConfigError::InvalidValue(key.to_string(), "not a number".into())),
        None => Ok(default),
    }
}
