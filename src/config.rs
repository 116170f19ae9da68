//! Configuration for the triage loop
//!
//! Values come from defaults, a TOML file, or environment variables.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::{Result, TriageError};

/// Default number of rounds before the loop gives up.
pub const DEFAULT_MAX_STEPS: usize = 10;

/// Runtime configuration for a triage service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TriageConfig {
    /// Chat-completion model used for both the tool-selection and decision calls
    pub model: String,

    /// Sampling temperature, if the provider should not use its own default
    pub temperature: Option<f32>,

    /// Completion token cap per model call
    pub max_tokens: Option<u32>,

    /// Round budget for one run
    pub max_steps: usize,

    /// Wall-clock limit the host applies around a whole run
    pub run_timeout_secs: Option<u64>,

    /// Enable debug logging
    pub debug_mode: bool,

    /// Fixed model answer used instead of the hosted model (offline mode)
    pub mock_response: Option<String>,
}

impl Default for TriageConfig {
    fn default() -> Self {
        Self {
            model: "gpt-4o-mini".to_string(),
            temperature: None,
            max_tokens: None,
            max_steps: DEFAULT_MAX_STEPS,
            run_timeout_secs: None,
            debug_mode: false,
            mock_response: None,
        }
    }
}

impl TriageConfig {
    /// Reject values the loop cannot honor.
    pub fn validate(&self) -> Result<()> {
        if self.max_steps == 0 {
            return Err(TriageError::Config {
                message: "max_steps must be at least 1".to_string(),
            });
        }
        if self.model.trim().is_empty() {
            return Err(TriageError::Config {
                message: "model must not be empty".to_string(),
            });
        }
        if let Some(t) = self.temperature {
            if !(0.0..=2.0).contains(&t) {
                return Err(TriageError::Config {
                    message: format!("temperature {t} is outside 0.0..=2.0"),
                });
            }
        }
        Ok(())
    }

    pub fn run_timeout(&self) -> Option<Duration> {
        self.run_timeout_secs.map(Duration::from_secs)
    }
}

/// Configuration builder
pub struct ConfigBuilder {
    config: TriageConfig,
}

impl Default for ConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: TriageConfig::default(),
        }
    }

    pub fn model(mut self, model: impl Into<String>) -> Self {
        self.config.model = model.into();
        self
    }

    pub fn temperature(mut self, temp: f32) -> Self {
        self.config.temperature = Some(temp);
        self
    }

    pub fn max_tokens(mut self, tokens: u32) -> Self {
        self.config.max_tokens = Some(tokens);
        self
    }

    pub fn max_steps(mut self, steps: usize) -> Self {
        self.config.max_steps = steps;
        self
    }

    pub fn run_timeout_secs(mut self, secs: u64) -> Self {
        self.config.run_timeout_secs = Some(secs);
        self
    }

    pub fn debug(mut self, enabled: bool) -> Self {
        self.config.debug_mode = enabled;
        self
    }

    pub fn mock_response(mut self, response: impl Into<String>) -> Self {
        self.config.mock_response = Some(response.into());
        self
    }

    pub fn build(self) -> Result<TriageConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

/// Load configuration from environment variables.
///
/// Unparseable numeric values are ignored and the default is kept.
pub fn from_env() -> TriageConfig {
    from_lookup(|key| std::env::var(key).ok())
}

fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> TriageConfig {
    let mut config = TriageConfig::default();

    if let Some(model) = lookup("OPENAI_MODEL") {
        config.model = model;
    }

    if let Some(temp) = lookup("OPENAI_TEMPERATURE") {
        if let Ok(temp_f) = temp.parse::<f32>() {
            config.temperature = Some(temp_f);
        }
    }

    if let Some(steps) = lookup("TRIAGE_MAX_STEPS") {
        if let Ok(n) = steps.parse::<usize>() {
            config.max_steps = n;
        }
    }

    if let Some(timeout) = lookup("TRIAGE_TIMEOUT") {
        if let Ok(secs) = timeout.parse::<u64>() {
            config.run_timeout_secs = Some(secs);
        }
    }

    if let Some(debug) = lookup("TRIAGE_DEBUG") {
        config.debug_mode = debug.to_lowercase() == "true" || debug == "1";
    }

    if let Some(mock) = lookup("TRIAGE_MOCK_RESPONSE") {
        if !mock.trim().is_empty() {
            config.mock_response = Some(mock);
        }
    }

    config
}

/// Load configuration from a TOML file
pub fn from_file(path: impl AsRef<std::path::Path>) -> Result<TriageConfig> {
    let contents = std::fs::read_to_string(path)?;
    let config: TriageConfig = toml::from_str(&contents)?;
    config.validate()?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    #[test]
    fn test_default_config() {
        let config = TriageConfig::default();
        assert_eq!(config.model, "gpt-4o-mini");
        assert_eq!(config.max_steps, 10);
        assert!(config.mock_response.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_builder() {
        let config = ConfigBuilder::new()
            .model("gpt-4o")
            .temperature(0.2)
            .max_tokens(400)
            .max_steps(3)
            .debug(true)
            .build()
            .unwrap();

        assert_eq!(config.model, "gpt-4o");
        assert_eq!(config.temperature, Some(0.2));
        assert_eq!(config.max_tokens, Some(400));
        assert_eq!(config.max_steps, 3);
        assert!(config.debug_mode);
    }

    #[test]
    fn zero_step_budget_is_rejected() {
        let err = ConfigBuilder::new().max_steps(0).build().unwrap_err();
        assert!(matches!(err, TriageError::Config { .. }));
    }

    #[test]
    fn env_lookup_overrides_defaults() {
        let vars: HashMap<&str, &str> = [
            ("OPENAI_MODEL", "gpt-4o"),
            ("TRIAGE_MAX_STEPS", "4"),
            ("TRIAGE_TIMEOUT", "90"),
            ("TRIAGE_DEBUG", "1"),
            ("OPENAI_TEMPERATURE", "warm"),
        ]
        .into_iter()
        .collect();
        let config = from_lookup(|k| vars.get(k).map(|v| v.to_string()));
        assert_eq!(config.model, "gpt-4o");
        assert_eq!(config.max_steps, 4);
        assert_eq!(config.run_timeout(), Some(Duration::from_secs(90)));
        assert!(config.debug_mode);
        assert_eq!(config.temperature, None);
    }

    #[test]
    fn loads_partial_toml_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "model = \"gpt-4o\"\nmax_steps = 5\nrun_timeout_secs = 120").unwrap();
        let config = from_file(file.path()).unwrap();
        assert_eq!(config.model, "gpt-4o");
        assert_eq!(config.max_steps, 5);
        assert_eq!(config.run_timeout_secs, Some(120));
        assert!(!config.debug_mode);
    }

    #[test]
    fn invalid_toml_file_is_reported() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "max_steps = \"many\"").unwrap();
        assert!(matches!(from_file(file.path()), Err(TriageError::Toml(_))));
    }
}
