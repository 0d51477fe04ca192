use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Config {
    #[serde(default)]
    pub gemini: GeminiConfig,

    #[serde(default = "default_retry_count")]
    pub retry_count: usize,

    #[serde(default = "default_retry_delay")]
    pub retry_delay_seconds: u64,

    /// When enabled, a shared style template image is generated once and
    /// prepended to every illustration's reference list.
    #[serde(default)]
    pub style_template: bool,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct GeminiConfig {
    #[serde(default)]
    pub api_key: String,

    #[serde(default = "default_text_model")]
    pub text_model: String,

    #[serde(default = "default_image_model")]
    pub image_model: String,
}

fn default_retry_count() -> usize {
    3
}
fn default_retry_delay() -> u64 {
    10
}
fn default_text_model() -> String {
    "gemini-2.5-pro".to_string()
}
fn default_image_model() -> String {
    "gemini-2.5-flash-image".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            gemini: GeminiConfig {
                api_key: String::new(),
                text_model: default_text_model(),
                image_model: default_image_model(),
            },
            retry_count: default_retry_count(),
            retry_delay_seconds: default_retry_delay(),
            style_template: false,
        }
    }
}

impl Config {
    pub fn load() -> Result<Self> {
        Self::load_from(Path::new("config.yml"))
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        let mut config = if path.exists() {
            let content = fs::read_to_string(path)
                .with_context(|| format!("Failed to read {}", path.display()))?;
            serde_yaml_ng::from_str(&content)
                .with_context(|| format!("Failed to parse {}", path.display()))?
        } else {
            Config::default()
        };

        // Environment variable takes precedence over the file.
        if let Ok(key) = std::env::var("GEMINI_API_KEY") {
            if !key.is_empty() {
                config.gemini.api_key = key;
            }
        }

        if config.gemini.api_key.is_empty() {
            anyhow::bail!(
                "No Gemini API key. Set GEMINI_API_KEY or 'gemini.api_key' in config.yml."
            );
        }

        Ok(config)
    }
}
