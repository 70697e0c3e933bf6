//! Environment-driven client configuration

use std::num::NonZeroUsize;
use thiserror::Error;

pub const DEFAULT_BASE_URL: &str = "https://api.anthropic.com";
pub const DEFAULT_MODEL: &str = "claude-sonnet-4-20250514";
pub const DEFAULT_MAX_OUTPUT_TOKENS: u32 = 4096;
pub const DEFAULT_TEMPERATURE: f32 = 0.7;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("ANTHROPIC_API_KEY is not set")]
    MissingApiKey,
    #[error("invalid value for {var}: {value:?}")]
    InvalidValue { var: &'static str, value: String },
}

/// Settings for talking to the model service
#[derive(Debug, Clone, PartialEq)]
pub struct ClientConfig {
    pub api_key: Option<String>,
    pub base_url: String,
    pub model: String,
    pub max_output_tokens: u32,
    pub temperature: f32,
    /// Cap on model turns per exchange; `None` means unbounded
    pub max_turns: Option<NonZeroUsize>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            base_url: DEFAULT_BASE_URL.to_string(),
            model: DEFAULT_MODEL.to_string(),
            max_output_tokens: DEFAULT_MAX_OUTPUT_TOKENS,
            temperature: DEFAULT_TEMPERATURE,
            max_turns: None,
        }
    }
}

impl ClientConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Build from an arbitrary variable source. Empty values count as unset.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let get = |var: &str| lookup(var).filter(|v| !v.trim().is_empty());
        let defaults = Self::default();

        Ok(Self {
            api_key: get("ANTHROPIC_API_KEY"),
            base_url: get("ROOMWRIGHT_BASE_URL").unwrap_or(defaults.base_url),
            model: get("ROOMWRIGHT_MODEL").unwrap_or(defaults.model),
            max_output_tokens: parse_var(
                "ROOMWRIGHT_MAX_TOKENS",
                get("ROOMWRIGHT_MAX_TOKENS"),
            )?
            .unwrap_or(defaults.max_output_tokens),
            temperature: parse_var("ROOMWRIGHT_TEMPERATURE", get("ROOMWRIGHT_TEMPERATURE"))?
                .unwrap_or(defaults.temperature),
            max_turns: parse_var("ROOMWRIGHT_MAX_TURNS", get("ROOMWRIGHT_MAX_TURNS"))?,
        })
    }

    /// The credential, or a configuration error if none was supplied
    pub fn require_api_key(&self) -> Result<&str, ConfigError> {
        self.api_key.as_deref().ok_or(ConfigError::MissingApiKey)
    }
}

fn parse_var<T: std::str::FromStr>(
    var: &'static str,
    raw: Option<String>,
) -> Result<Option<T>, ConfigError> {
    raw.map(|value| {
        value
            .trim()
            .parse()
            .map_err(|_| ConfigError::InvalidValue { var, value })
    })
    .transpose()
}
