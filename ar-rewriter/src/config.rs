//! Application configuration.

use std::path::Path;
use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::error::{ServiceError, ServiceResult};

fn default_model_id() -> String {
    "anthropic.claude-3-5-sonnet-20240620-v1:0".to_string()
}

fn default_guardrail_version() -> String {
    "DRAFT".to_string()
}

fn default_max_iterations() -> u32 {
    5
}

fn default_timeout_minutes() -> u64 {
    10
}

fn default_check_interval_seconds() -> u64 {
    60
}

fn default_max_attempts() -> u32 {
    3
}

fn default_base_delay_seconds() -> f64 {
    1.0
}

fn default_audit_log_path() -> String {
    "audit_log.jsonl".to_string()
}

/// One rule of the automated reasoning policy, used to turn rule IDs in
/// findings back into readable logic for the rewrite prompts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicyRule {
    pub id: String,
    pub expression: String,
    #[serde(default)]
    pub alternate_expression: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
}

/// One variable the policy's rules range over.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicyVariable {
    pub name: String,
    #[serde(default, rename = "type")]
    pub var_type: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
}

/// The rules and variables of the configured policy. May be empty, in which
/// case findings are passed through with raw rule identifiers and prompts
/// carry no policy context.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PolicyDefinition {
    #[serde(default)]
    pub rules: Vec<PolicyRule>,
    #[serde(default)]
    pub variables: Vec<PolicyVariable>,
}

impl PolicyDefinition {
    pub fn rule(&self, id: &str) -> Option<&PolicyRule> {
        self.rules.iter().find(|r| r.id == id)
    }
}

/// Full application configuration, loadable from a YAML file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Guardrail the validation calls run against.
    pub guardrail_id: String,
    #[serde(default = "default_guardrail_version")]
    pub guardrail_version: String,
    #[serde(default = "default_model_id")]
    pub model_id: String,
    #[serde(default = "default_max_iterations")]
    pub max_iterations: u32,
    /// Minutes a thread may sit in AWAITING_USER_INPUT before the sweeper
    /// auto-skips it.
    #[serde(default = "default_timeout_minutes")]
    pub timeout_minutes: u64,
    #[serde(default = "default_check_interval_seconds")]
    pub check_interval_seconds: u64,
    #[serde(default = "default_max_attempts")]
    pub retry_max_attempts: u32,
    #[serde(default = "default_base_delay_seconds")]
    pub retry_base_delay_seconds: f64,
    #[serde(default = "default_audit_log_path")]
    pub audit_log_path: String,
    #[serde(default)]
    pub policy_definition: PolicyDefinition,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            guardrail_id: String::new(),
            guardrail_version: default_guardrail_version(),
            model_id: default_model_id(),
            max_iterations: default_max_iterations(),
            timeout_minutes: default_timeout_minutes(),
            check_interval_seconds: default_check_interval_seconds(),
            retry_max_attempts: default_max_attempts(),
            retry_base_delay_seconds: default_base_delay_seconds(),
            audit_log_path: default_audit_log_path(),
            policy_definition: PolicyDefinition::default(),
        }
    }
}

impl AppConfig {
    pub fn from_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        let config: AppConfig = serde_yaml::from_str(&content)
            .with_context(|| format!("failed to parse config file: {}", path.display()))?;
        config.validate().map_err(anyhow::Error::from)?;
        Ok(config)
    }

    pub fn validate(&self) -> ServiceResult<()> {
        if self.guardrail_id.is_empty() {
            return Err(ServiceError::Config("guardrail_id must be set".into()));
        }
        if self.max_iterations == 0 {
            return Err(ServiceError::Config("max_iterations must be at least 1".into()));
        }
        if self.retry_max_attempts == 0 {
            return Err(ServiceError::Config(
                "retry_max_attempts must be at least 1".into(),
            ));
        }
        Ok(())
    }

    pub fn retry_base_delay(&self) -> Duration {
        Duration::from_secs_f64(self.retry_base_delay_seconds)
    }

    /// Apply a partial update from the config API.
    pub fn apply_update(&mut self, update: ConfigUpdate) -> ServiceResult<()> {
        let mut next = self.clone();
        if let Some(model_id) = update.model_id {
            next.model_id = model_id;
        }
        if let Some(max_iterations) = update.max_iterations {
            next.max_iterations = max_iterations;
        }
        if let Some(timeout_minutes) = update.timeout_minutes {
            next.timeout_minutes = timeout_minutes;
        }
        next.validate()?;
        *self = next;
        Ok(())
    }
}

/// The subset of config that may change at runtime.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConfigUpdate {
    pub model_id: Option<String>,
    pub max_iterations: Option<u32>,
    pub timeout_minutes: Option<u64>,
}
