use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;
use triage_llm::LlmProvider;

use crate::error::{Result, TriageError};

pub const DEFAULT_CONFIG_PATH: &str = "triage.toml";
pub const DEFAULT_DB_PATH: &str = "knowledge.sqlite";
pub const DEFAULT_BIND_ADDR: &str = "0.0.0.0:8000";

/// Pipeline thresholds and naming. Every field has a default so a partial
/// TOML file (or none at all) is valid.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TriageConfig {
    pub brand_name: String,
    pub team_name: String,
    pub confidence_threshold: f32,
    pub retrieval_weight: f32,
    pub min_context_chars: usize,
    pub similarity_threshold: f32,
    pub top_k: usize,
    pub max_doc_chars: usize,
    pub compose_escalation_message: bool,
    pub resilience: ResilienceConfig,
}

impl Default for TriageConfig {
    fn default() -> Self {
        Self {
            brand_name: "doxa".to_string(),
            team_name: "TEAM 5".to_string(),
            confidence_threshold: 0.6,
            retrieval_weight: 0.2,
            min_context_chars: 20,
            similarity_threshold: 0.8,
            top_k: 5,
            max_doc_chars: 500,
            compose_escalation_message: false,
            resilience: ResilienceConfig::default(),
        }
    }
}

impl TriageConfig {
    /// Reads `path` if it exists; a missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            debug!(path = %path.display(), "config file not found, using defaults");
            return Ok(Self::default());
        }
        let raw = fs::read_to_string(path)?;
        let config = Self::from_toml(&raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml(raw: &str) -> Result<Self> {
        Ok(toml::from_str(raw)?)
    }

    pub fn validate(&self) -> Result<()> {
        for (name, value) in [
            ("confidence_threshold", self.confidence_threshold),
            ("retrieval_weight", self.retrieval_weight),
            ("similarity_threshold", self.similarity_threshold),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(TriageError::Config(format!(
                    "{name} must be within [0, 1], got {value}"
                )));
            }
        }
        if self.top_k == 0 {
            return Err(TriageError::Config("top_k must be at least 1".into()));
        }
        if self.brand_name.trim().is_empty() {
            return Err(TriageError::Config("brand_name must not be empty".into()));
        }
        self.resilience.validate()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResilienceConfig {
    pub max_attempts: u32,
    pub min_wait_ms: u64,
    pub max_wait_ms: u64,
    pub failure_threshold: u32,
    pub recovery_timeout_secs: u64,
}

impl Default for ResilienceConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            min_wait_ms: 4_000,
            max_wait_ms: 10_000,
            failure_threshold: 3,
            recovery_timeout_secs: 60,
        }
    }
}

impl ResilienceConfig {
    pub fn min_wait(&self) -> Duration {
        Duration::from_millis(self.min_wait_ms)
    }

    pub fn max_wait(&self) -> Duration {
        Duration::from_millis(self.max_wait_ms)
    }

    pub fn recovery_timeout(&self) -> Duration {
        Duration::from_secs(self.recovery_timeout_secs)
    }

    fn validate(&self) -> Result<()> {
        if self.max_attempts == 0 {
            return Err(TriageError::Config(
                "resilience.max_attempts must be at least 1".into(),
            ));
        }
        if self.failure_threshold == 0 {
            return Err(TriageError::Config(
                "resilience.failure_threshold must be at least 1".into(),
            ));
        }
        if self.min_wait_ms > self.max_wait_ms {
            return Err(TriageError::Config(
                "resilience.min_wait_ms must not exceed max_wait_ms".into(),
            ));
        }
        Ok(())
    }
}

/// Process-level settings taken from the environment.
#[derive(Debug, Clone)]
pub struct RuntimeSettings {
    pub provider: LlmProvider,
    pub model: String,
    pub db_path: PathBuf,
    pub config_path: PathBuf,
    pub bind_addr: String,
}

impl RuntimeSettings {
    pub fn from_env() -> Result<Self> {
        let provider_name =
            env::var("TRIAGE_PROVIDER").unwrap_or_else(|_| "mistral".to_string());
        let provider = LlmProvider::from_str(&provider_name)
            .ok_or_else(|| TriageError::Config(format!("unknown provider {provider_name}")))?;
        let model =
            env::var("TRIAGE_MODEL").unwrap_or_else(|_| provider.default_model().to_string());
        let db_path = env::var("TRIAGE_DB")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(DEFAULT_DB_PATH));
        let config_path = env::var("TRIAGE_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(DEFAULT_CONFIG_PATH));
        let bind_addr = env::var("BIND_ADDR").unwrap_or_else(|_| DEFAULT_BIND_ADDR.to_string());
        Ok(Self {
            provider,
            model,
            db_path,
            config_path,
            bind_addr,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn partial_toml_keeps_defaults() {
        let config = TriageConfig::from_toml(
            r#"
brand_name = "acme"

[resilience]
max_attempts = 5
"#,
        )
        .unwrap();
        assert_eq!(config.brand_name, "acme");
        assert_eq!(config.confidence_threshold, 0.6);
        assert_eq!(config.top_k, 5);
        assert_eq!(config.resilience.max_attempts, 5);
        assert_eq!(config.resilience.min_wait_ms, 4_000);
        assert_eq!(config.resilience.recovery_timeout(), Duration::from_secs(60));
    }

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempdir().unwrap();
        let config = TriageConfig::load(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(config, TriageConfig::default());
    }

    #[test]
    fn out_of_range_threshold_is_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("triage.toml");
        fs::write(&path, "confidence_threshold = 1.5\n").unwrap();
        let err = TriageConfig::load(&path).unwrap_err();
        assert!(matches!(err, TriageError::Config(_)));
    }

    #[test]
    fn invalid_toml_is_a_config_error() {
        let err = TriageConfig::from_toml("top_k = \"five\"").unwrap_err();
        assert!(matches!(err, TriageError::Config(_)));
    }
}
