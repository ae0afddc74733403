use serde::Deserialize;
use std::path::Path;

#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    pub provider: ProviderConfig,
    pub signal: SignalConfig,
    #[serde(default)]
    pub state: StateConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ProviderConfig {
    pub api_key: String,
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default)]
    pub models: ModelsConfig,
}

fn default_base_url() -> String {
    "https://api.openai.com/v1".to_string()
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct ModelsConfig {
    /// Classification, extraction, response generation.
    #[serde(default)]
    pub default: String,
    /// Short yes/no verification calls.
    #[serde(default)]
    pub precision: String,
}

impl ModelsConfig {
    /// Fill in unset model tiers. `precision` defaults to `default`.
    pub fn apply_defaults(&mut self) {
        if self.default.is_empty() {
            self.default = "openai/gpt-4o".to_string();
        }
        if self.precision.is_empty() {
            self.precision = self.default.clone();
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct SignalConfig {
    /// Base URL of the signal-cli HTTP daemon, e.g. "http://localhost:8080/api/v1".
    pub api_url: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct StateConfig {
    #[serde(default = "default_db_path")]
    pub db_path: String,
}

impl Default for StateConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
        }
    }
}

fn default_db_path() -> String {
    "companiond.db".to_string()
}

impl AppConfig {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let mut config: AppConfig = toml::from_str(&content)?;
        config.provider.models.apply_defaults();
        Ok(config)
    }
}
