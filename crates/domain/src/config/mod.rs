mod engine;
mod llm;
mod queue;

pub use engine::*;
pub use llm::*;
pub use queue::*;

use serde::{Deserialize, Serialize};
use std::fmt;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Top-level config
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub debounce: DebounceConfig,
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Config validation
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Severity level for a configuration issue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigSeverity {
    Error,
    Warning,
}

/// A single configuration validation issue.
#[derive(Debug, Clone)]
pub struct ConfigError {
    pub severity: ConfigSeverity,
    pub field: String,
    pub message: String,
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tag = match self.severity {
            ConfigSeverity::Error => "ERROR",
            ConfigSeverity::Warning => "WARN",
        };
        write!(f, "[{tag}] {}: {}", self.field, self.message)
    }
}

impl ConfigError {
    fn error(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self { severity: ConfigSeverity::Error, field: field.into(), message: message.into() }
    }

    fn warning(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self { severity: ConfigSeverity::Warning, field: field.into(), message: message.into() }
    }
}

impl Config {
    /// Validate the configuration and return a list of issues.
    ///
    /// Returns an empty vec when everything looks good.
    pub fn validate(&self) -> Vec<ConfigError> {
        let mut errors = Vec::new();

        if self.queue.defaults.cap == 0 {
            errors.push(ConfigError::error("queue.cap", "cap must be at least 1"));
        }
        for (key, ov) in self.queue.by_channel.iter().map(|(k, v)| (format!("queue.by_channel.{k}"), v))
            .chain(self.queue.by_room.iter().map(|(k, v)| (format!("queue.by_room.{k}"), v)))
        {
            if ov.cap == Some(0) {
                errors.push(ConfigError::error(format!("{key}.cap"), "cap must be at least 1"));
            }
        }

        if self.engine.max_tool_rounds == 0 {
            errors.push(ConfigError::warning(
                "engine.max_tool_rounds",
                "0 disables tool continuation; tool results will never reach the model",
            ));
        }
        if self.engine.stream_idle_timeout_ms == 0 {
            errors.push(ConfigError::error(
                "engine.stream_idle_timeout_ms",
                "idle timeout must be greater than 0",
            ));
        }

        if self.llm.providers.is_empty() {
            errors.push(ConfigError::warning("llm.providers", "no LLM providers configured"));
        }

        for (i, provider) in self.llm.providers.iter().enumerate() {
            if provider.id.is_empty() {
                errors.push(ConfigError::error(
                    format!("llm.providers[{i}].id"),
                    "provider id must not be empty",
                ));
            }
            if provider.base_url.is_empty() {
                errors.push(ConfigError::error(
                    format!("llm.providers[{i}].base_url"),
                    "provider base_url must not be empty",
                ));
            }
            if provider.api == ApiKind::ChatCompletions && provider.stateful {
                errors.push(ConfigError::warning(
                    format!("llm.providers[{i}].stateful"),
                    "chat_completions is always stateless; the flag is ignored",
                ));
            }
        }

        if let Some(default) = &self.llm.default_provider {
            if !self.llm.providers.iter().any(|p| &p.id == default) {
                errors.push(ConfigError::error(
                    "llm.default_provider",
                    format!("unknown provider '{default}'"),
                ));
            }
        }

        errors
    }
}
