use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

/// Top-level config (convoy.toml + CONVOY_* env overrides).
///
/// Delivery tuning (batch threshold, time window, request timeout, retry
/// cap) lives in the `delivery_settings` table instead of here, so
/// operators can swap it at runtime without a restart.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConvoyConfig {
    #[serde(default)]
    pub database: DatabaseConfig,
    pub backend: BackendConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

/// Remote completion backend endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendConfig {
    /// Base URL without trailing slash, e.g. "https://api.example.com".
    #[serde(default = "default_base_url")]
    pub base_url: String,
    /// Bearer token for the Authorization header. Omit for open endpoints.
    pub api_key: Option<String>,
    /// Model identifier forwarded with each completion request.
    pub model: Option<String>,
}

fn default_base_url() -> String {
    "http://localhost:8080".to_string()
}

fn default_db_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.convoy/convoy.db", home)
}

impl ConvoyConfig {
    /// Load config from a TOML file with CONVOY_* env var overrides.
    pub fn load(config_path: Option<&str>) -> crate::error::Result<Self> {
        let path = config_path
            .map(String::from)
            .unwrap_or_else(default_config_path);

        let config: ConvoyConfig = Figment::new()
            .merge(Toml::file(&path))
            .merge(Env::prefixed("CONVOY_").split("_"))
            .extract()
            .map_err(|e| crate::error::ConvoyError::Config(e.to_string()))?;

        Ok(config)
    }
}

fn default_config_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.convoy/convoy.toml", home)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backend_config_minimal_toml() {
        let config: ConvoyConfig = Figment::new()
            .merge(Toml::string("[backend]\nbase_url = \"http://10.0.0.5:9000\""))
            .extract()
            .expect("extract failed");
        assert_eq!(config.backend.base_url, "http://10.0.0.5:9000");
        assert!(config.backend.api_key.is_none());
        assert!(config.database.path.ends_with("convoy.db"));
    }

    #[test]
    fn missing_backend_section_is_an_error() {
        let result: std::result::Result<ConvoyConfig, _> =
            Figment::new().merge(Toml::string("")).extract();
        assert!(result.is_err());
    }
}
