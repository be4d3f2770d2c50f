// Server configuration.
//
// Core settings come from environment variables with development defaults.
// Models and admin settings can be seeded from a TOML file at startup.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use parley_common::types::{AdminSettings, ModelConfig};
use serde::Deserialize;
use thiserror::Error;

/// Core server configuration.
///
/// Constructed via [`ServerConfig::from_env`] which reads environment
/// variables and falls back to development defaults.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    /// Listen address (host:port).
    pub listen_addr: SocketAddr,
    /// Log filter directive (e.g. `info`, `parley_server=debug`).
    pub log_filter: String,
    /// Username of the bootstrap admin account.
    pub admin_username: String,
    /// Credential of the bootstrap admin. No admin is created without one.
    pub admin_credential: Option<String>,
    /// Optional TOML seed with models and admin settings.
    pub seed_file: Option<PathBuf>,
}

impl ServerConfig {
    /// Parse configuration from environment variables.
    ///
    /// | Variable | Default |
    /// |---|---|
    /// | `PARLEY_HOST` | `127.0.0.1` |
    /// | `PARLEY_PORT` | `7878` |
    /// | `PARLEY_LOG_FILTER` | `info` |
    /// | `PARLEY_ADMIN_USERNAME` | `admin` |
    /// | `PARLEY_ADMIN_CREDENTIAL` | *(none)* |
    /// | `PARLEY_SEED_FILE` | *(none)* |
    pub fn from_env() -> Self {
        Self::from_env_fn(|key| std::env::var(key))
    }

    /// Testable constructor that accepts an environment lookup function.
    fn from_env_fn<F>(env: F) -> Self
    where
        F: Fn(&str) -> Result<String, std::env::VarError>,
    {
        let host = env("PARLEY_HOST").unwrap_or_else(|_| "127.0.0.1".into());
        let port: u16 = env("PARLEY_PORT").ok().and_then(|v| v.parse().ok()).unwrap_or(7878);
        let listen_addr = format!("{host}:{port}")
            .parse()
            .unwrap_or_else(|_| SocketAddr::from(([127, 0, 0, 1], port)));

        let log_filter = env("PARLEY_LOG_FILTER").unwrap_or_else(|_| "info".into());
        let admin_username = env("PARLEY_ADMIN_USERNAME")
            .ok()
            .filter(|name| !name.trim().is_empty())
            .unwrap_or_else(|| "admin".into());
        let admin_credential = env("PARLEY_ADMIN_CREDENTIAL").ok().filter(|c| !c.is_empty());
        let seed_file = env("PARLEY_SEED_FILE").ok().filter(|p| !p.is_empty()).map(PathBuf::from);

        Self { listen_addr, log_filter, admin_username, admin_credential, seed_file }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read seed file {path}: {source}")]
    SeedRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse seed file {path}: {source}")]
    SeedParse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

/// Startup seed.
///
/// ```toml
/// [[models]]
/// id = "echo"
/// display_name = "Echo"
/// provider = "echo"
/// params = { delayMs = 20 }
///
/// [admin_settings]
/// title_model_id = "echo"
/// ```
#[derive(Debug, Default, Deserialize, PartialEq)]
#[serde(default)]
pub struct SeedFile {
    pub models: Vec<SeedModel>,
    pub admin_settings: Option<SeedAdminSettings>,
}

#[derive(Debug, Deserialize, PartialEq)]
pub struct SeedModel {
    #[serde(default)]
    pub id: String,
    pub display_name: String,
    pub provider: String,
    #[serde(default)]
    pub params: serde_json::Value,
}

#[derive(Debug, Default, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SeedAdminSettings {
    pub title_model_id: Option<String>,
    pub default_model_id: Option<String>,
}

impl SeedFile {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)
            .map_err(|source| ConfigError::SeedRead { path: path.to_path_buf(), source })?;
        Self::parse(&raw).map_err(|source| ConfigError::SeedParse { path: path.to_path_buf(), source })
    }

    fn parse(raw: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(raw)
    }
}

impl From<SeedModel> for ModelConfig {
    fn from(seed: SeedModel) -> Self {
        Self { id: seed.id, display_name: seed.display_name, provider: seed.provider, params: seed.params }
    }
}

impl From<SeedAdminSettings> for AdminSettings {
    fn from(seed: SeedAdminSettings) -> Self {
        Self { title_model_id: seed.title_model_id, default_model_id: seed.default_model_id }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::io::Write;

    use serde_json::json;

    use super::*;

    fn env_from_map(
        map: HashMap<&'static str, &'static str>,
    ) -> impl Fn(&str) -> Result<String, std::env::VarError> {
        move |key: &str| map.get(key).map(|v| v.to_string()).ok_or(std::env::VarError::NotPresent)
    }

    #[test]
    fn defaults_when_no_env_vars() {
        let cfg = ServerConfig::from_env_fn(env_from_map(HashMap::new()));
        assert_eq!(cfg.listen_addr.to_string(), "127.0.0.1:7878");
        assert_eq!(cfg.log_filter, "info");
        assert_eq!(cfg.admin_username, "admin");
        assert!(cfg.admin_credential.is_none());
        assert!(cfg.seed_file.is_none());
    }

    #[test]
    fn custom_values() {
        let mut m = HashMap::new();
        m.insert("PARLEY_HOST", "0.0.0.0");
        m.insert("PARLEY_PORT", "9000");
        m.insert("PARLEY_LOG_FILTER", "parley_server=debug");
        m.insert("PARLEY_ADMIN_USERNAME", "root");
        m.insert("PARLEY_ADMIN_CREDENTIAL", "s3cret");
        m.insert("PARLEY_SEED_FILE", "/etc/parley/seed.toml");
        let cfg = ServerConfig::from_env_fn(env_from_map(m));
        assert_eq!(cfg.listen_addr.to_string(), "0.0.0.0:9000");
        assert_eq!(cfg.log_filter, "parley_server=debug");
        assert_eq!(cfg.admin_username, "root");
        assert_eq!(cfg.admin_credential.as_deref(), Some("s3cret"));
        assert_eq!(cfg.seed_file, Some(PathBuf::from("/etc/parley/seed.toml")));
    }

    #[test]
    fn invalid_port_falls_back_to_default() {
        let mut m = HashMap::new();
        m.insert("PARLEY_PORT", "not-a-port");
        let cfg = ServerConfig::from_env_fn(env_from_map(m));
        assert_eq!(cfg.listen_addr.port(), 7878);
    }

    #[test]
    fn loads_seed_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"
[[models]]
id = "echo"
display_name = "Echo"
provider = "echo"
params = {{ delayMs = 5 }}

[[models]]
display_name = "Local"
provider = "openai"

[admin_settings]
title_model_id = "echo"
"#
        )
        .unwrap();

        let seed = SeedFile::load(file.path()).unwrap();
        assert_eq!(seed.models.len(), 2);
        assert_eq!(seed.models[0].params, json!({ "delayMs": 5 }));
        assert_eq!(seed.models[1].id, "");
        let settings: AdminSettings = seed.admin_settings.unwrap().into();
        assert_eq!(settings.title_model_id.as_deref(), Some("echo"));
    }

    #[test]
    fn seed_errors_name_the_file() {
        let missing = SeedFile::load(Path::new("/nonexistent/parley-seed.toml")).unwrap_err();
        assert!(matches!(missing, ConfigError::SeedRead { .. }));

        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "models = 3").unwrap();
        let invalid = SeedFile::load(file.path()).unwrap_err();
        assert!(matches!(invalid, ConfigError::SeedParse { .. }));
        assert!(invalid.to_string().contains(&file.path().display().to_string()));
    }
}
