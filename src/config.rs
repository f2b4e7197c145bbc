//! Configuration for the orchestration layer
//!
//! Covers the model being driven, the device/budget table consulted by the
//! allocator, and logging. Values come from defaults, an optional TOML file,
//! and `EDGE_INFER_*` environment overrides, in that order.

use crate::error::{EngineError, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Top-level configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// Model configuration
    pub model: ModelConfig,
    /// Device catalog and memory budget configuration
    pub device: DeviceConfig,
    /// Logging configuration
    pub logging: LoggingConfig,
}

/// Model configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Path to the verified model artifact (supplied by the download layer)
    pub path: PathBuf,
    /// Context window in tokens (prompt + generated)
    pub context_size: usize,
    /// Tokenizer output buffer capacity in tokens; prompts that tokenize to
    /// more than this are rejected, not truncated
    pub max_prompt_tokens: usize,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("models/mistral-7b-int8.gguf"),
            context_size: 2048,
            max_prompt_tokens: 1024,
        }
    }
}

/// Device catalog and memory budget configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// Combined memory ceiling for all concurrently resident models, in MB
    pub total_budget_mb: u64,
    /// Core indices reserved for decode-heavy LLM work
    pub performance_cores: Vec<usize>,
    /// Core indices reserved for lighter workloads
    pub efficiency_cores: Vec<usize>,
    /// Declared footprint of the LLM workload, in MB
    pub llm_footprint_mb: u64,
    /// Declared footprint of the image classifier workload, in MB
    pub classifier_footprint_mb: u64,
    /// Declared footprint of the text-embedding workload, in MB
    pub embedding_footprint_mb: u64,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        // Footprints sized to the shipped model set: Mistral-7B INT8,
        // MobileNet-v3, BGE-small.
        Self {
            total_budget_mb: 6144,
            performance_cores: vec![4, 5, 6, 7],
            efficiency_cores: vec![0, 1, 2, 3],
            llm_footprint_mb: 4200,
            classifier_footprint_mb: 20,
            embedding_footprint_mb: 130,
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,
    /// Log format (json, pretty)
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
        }
    }
}

impl Config {
    /// Load configuration from environment variables on top of defaults
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Ok(path) = std::env::var("EDGE_INFER_MODEL_PATH") {
            config.model.path = PathBuf::from(path);
        }
        if let Ok(ctx) = std::env::var("EDGE_INFER_CONTEXT_SIZE") {
            config.model.context_size = ctx
                .parse()
                .map_err(|_| EngineError::config("Invalid context size"))?;
        }
        if let Ok(max_prompt) = std::env::var("EDGE_INFER_MAX_PROMPT_TOKENS") {
            config.model.max_prompt_tokens = max_prompt
                .parse()
                .map_err(|_| EngineError::config("Invalid max prompt tokens"))?;
        }
        if let Ok(budget) = std::env::var("EDGE_INFER_BUDGET_MB") {
            config.device.total_budget_mb = budget
                .parse()
                .map_err(|_| EngineError::config("Invalid memory budget"))?;
        }
        if let Ok(level) = std::env::var("EDGE_INFER_LOG_LEVEL") {
            config.logging.level = level;
        }
        if let Ok(format) = std::env::var("EDGE_INFER_LOG_FORMAT") {
            config.logging.format = format;
        }

        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<std::path::Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| EngineError::config(format!("Failed to read config file: {}", e)))?;

        let config: Self = toml::from_str(&content)
            .map_err(|e| EngineError::config(format!("Failed to parse config file: {}", e)))?;

        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.model.context_size == 0 {
            return Err(EngineError::config("Context size must be greater than 0"));
        }
        if self.model.max_prompt_tokens == 0 {
            return Err(EngineError::config(
                "Max prompt tokens must be greater than 0",
            ));
        }
        if self.model.max_prompt_tokens > self.model.context_size {
            return Err(EngineError::config(
                "Max prompt tokens cannot exceed the context size",
            ));
        }
        if self.device.total_budget_mb == 0 {
            return Err(EngineError::config("Memory budget must be greater than 0"));
        }
        if self.device.performance_cores.is_empty() || self.device.efficiency_cores.is_empty() {
            return Err(EngineError::config(
                "Both performance and efficiency core sets must be non-empty",
            ));
        }
        if self
            .device
            .performance_cores
            .iter()
            .any(|c| self.device.efficiency_cores.contains(c))
        {
            return Err(EngineError::config(
                "Performance and efficiency core sets must not overlap",
            ));
        }
        if !["trace", "debug", "info", "warn", "error"].contains(&self.logging.level.as_str()) {
            return Err(EngineError::config(
                "Log level must be one of: trace, debug, info, warn, error",
            ));
        }
        if !["json", "pretty"].contains(&self.logging.format.as_str()) {
            return Err(EngineError::config("Log format must be json or pretty"));
        }
        Ok(())
    }
}
