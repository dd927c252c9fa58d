//! CLI utilities for binaries
//!
//! Handles configuration loading and environment variables
//! for all binary executables.

use anyhow::Context;
use realtime_core::ClientOptions;
use std::path::PathBuf;

/// Type of configuration to load
#[derive(Debug, Clone)]
pub enum ConfigType {
    /// Client options (config/realtime.yaml)
    Client,
    /// Custom path
    Custom(String),
}

impl ConfigType {
    /// Get the default path for this config type
    pub fn default_path(&self) -> &str {
        match self {
            ConfigType::Client => "config/realtime.yaml",
            ConfigType::Custom(path) => path,
        }
    }

    /// Get the environment variable name for this config type
    pub fn env_var_name(&self) -> Option<&str> {
        match self {
            ConfigType::Client => Some("REALTIME_CONFIG_PATH"),
            ConfigType::Custom(_) => None,
        }
    }
}

/// Resolve the configuration path from the environment or use the default
pub fn load_config_from_env(config_type: ConfigType) -> PathBuf {
    config_type
        .env_var_name()
        .and_then(|name| std::env::var(name).ok())
        .unwrap_or_else(|| config_type.default_path().to_string())
        .into()
}

/// Load client options, reading `.env` first so secrets can live there
pub fn load_options(config_type: ConfigType) -> anyhow::Result<ClientOptions> {
    dotenv::dotenv().ok();
    let path = load_config_from_env(config_type);
    ClientOptions::load(&path)
        .with_context(|| format!("loading client options from {}", path.display()))
}

/// Parse command line arguments for a binary
///
/// Returns a vector of arguments (excluding the program name)
pub fn parse_args() -> Vec<String> {
    std::env::args().skip(1).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_type_paths() {
        assert_eq!(ConfigType::Client.default_path(), "config/realtime.yaml");

        let custom = ConfigType::Custom("custom/path.yaml".to_string());
        assert_eq!(custom.default_path(), "custom/path.yaml");
    }

    #[test]
    fn test_config_type_env_vars() {
        assert_eq!(ConfigType::Client.env_var_name(), Some("REALTIME_CONFIG_PATH"));
        assert_eq!(ConfigType::Custom("x.yaml".into()).env_var_name(), None);
    }
}
