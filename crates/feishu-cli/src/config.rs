//! Configuration file support

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Model used when neither flags nor config name one
pub const DEFAULT_MODEL: &str = "doubao-seed-1-6-250615";

/// Endpoint host used when neither flags nor config name one
pub const DEFAULT_BASE_URL: &str = "https://ark.cn-beijing.volces.com";

/// Configuration for feishu
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Model id sent with every request
    pub model: Option<String>,
    /// Base URL of the chat-completions service
    pub base_url: Option<String>,
    /// API key (alternative to the environment variable)
    pub api_key: Option<String>,
    /// Where conversation history is kept
    pub history_file: Option<String>,
}

impl Config {
    /// Get the config directory
    pub fn config_dir() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("feishu")
    }

    /// Get the config file path
    pub fn config_path() -> PathBuf {
        if let Ok(path) = std::env::var("FEISHU_CONFIG_PATH") {
            return PathBuf::from(path);
        }
        Self::config_dir().join("config.toml")
    }

    /// Load config from the default location
    pub fn load() -> Self {
        Self::load_from(&Self::config_path())
    }

    /// Load config from `path`, falling back to defaults when it is missing or invalid
    pub fn load_from(path: &Path) -> Self {
        if !path.exists() {
            return Self::default();
        }

        match fs::read_to_string(path) {
            Ok(content) => match toml::from_str(&content) {
                Ok(config) => config,
                Err(e) => {
                    eprintln!("Warning: Failed to parse config file: {}", e);
                    Self::default()
                }
            },
            Err(e) => {
                eprintln!("Warning: Failed to read config file: {}", e);
                Self::default()
            }
        }
    }

    /// Save config to `path`
    pub fn save_to(&self, path: &Path) -> std::io::Result<()> {
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)?;
        }

        let content = toml::to_string_pretty(self).map_err(std::io::Error::other)?;
        fs::write(path, content)
    }

    /// Create a default config file if it doesn't exist
    pub fn init() -> std::io::Result<PathBuf> {
        let path = Self::config_path();
        if path.exists() {
            return Ok(path);
        }

        let default_config = Config {
            model: Some(DEFAULT_MODEL.to_string()),
            base_url: Some(DEFAULT_BASE_URL.to_string()),
            api_key: None,
            history_file: None,
        };

        default_config.save_to(&path)?;
        Ok(path)
    }

    /// Model id, preferring `flag`
    pub fn model(&self, flag: Option<String>) -> String {
        flag.or_else(|| self.model.clone())
            .unwrap_or_else(|| DEFAULT_MODEL.to_string())
    }

    /// Base URL, preferring `flag`
    pub fn base_url(&self, flag: Option<String>) -> String {
        flag.or_else(|| self.base_url.clone())
            .unwrap_or_else(|| DEFAULT_BASE_URL.to_string())
    }

    /// Get the API key, checking config then env
    pub fn get_api_key(&self) -> Option<String> {
        if self.api_key.is_some() {
            return self.api_key.clone();
        }
        std::env::var(feishu_ai::client::API_KEY_ENV).ok()
    }

    /// History file, preferring `flag`
    pub fn history_path(&self, flag: Option<PathBuf>) -> PathBuf {
        if let Some(path) = flag {
            return path;
        }
        if let Some(ref path) = self.history_file {
            return PathBuf::from(path);
        }
        dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("feishu")
            .join("history.jsonl")
    }
}

/// Generate example config content
pub fn example_config() -> &'static str {
    r#"# feishu configuration file
# Place at ~/.config/feishu/config.toml (Linux) or set FEISHU_CONFIG_PATH

# Model id sent with every request
model = "doubao-seed-1-6-250615"

# Base URL of the chat-completions service
base_url = "https://ark.cn-beijing.volces.com"

# API key (optional - ARK_API_KEY is used when unset)
# api_key = "..."

# Conversation history (defaults to the local data directory)
# history_file = "~/.local/share/feishu/history.jsonl"
"#
}
