//! Mesh configuration.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::info;
use vigil_types::{VigilError, VigilResult};

/// Configuration for one Vigil mesh process.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MeshConfig {
    /// Name of this process's endpoint, unique in the cluster.
    pub endpoint_name: String,
    /// Address other cluster members reach this process on.
    pub node: String,
    /// Service (port) other cluster members connect to.
    pub service: String,
    /// Capacity of the cluster event channel.
    pub event_capacity: usize,
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            endpoint_name: "vigil".to_string(),
            node: "127.0.0.1".to_string(),
            service: "7978".to_string(),
            event_capacity: 1024,
        }
    }
}

impl MeshConfig {
    /// Parse a TOML document. Missing fields fall back to defaults.
    pub fn from_toml_str(raw: &str) -> VigilResult<Self> {
        toml::from_str(raw)
            .map_err(|e| VigilError::Configuration(format!("invalid mesh config: {e}")))
    }
}

/// Load mesh configuration from a TOML file, with defaults.
pub fn load_config(path: Option<&Path>) -> MeshConfig {
    let config_path = path
        .map(|p| p.to_path_buf())
        .unwrap_or_else(default_config_path);

    if config_path.exists() {
        match std::fs::read_to_string(&config_path) {
            Ok(raw) => match MeshConfig::from_toml_str(&raw) {
                Ok(config) => {
                    info!(path = %config_path.display(), "Loaded configuration");
                    return config;
                }
                Err(e) => {
                    tracing::warn!(
                        error = %e,
                        path = %config_path.display(),
                        "Failed to parse config, using defaults"
                    );
                }
            },
            Err(e) => {
                tracing::warn!(
                    error = %e,
                    path = %config_path.display(),
                    "Failed to read config file, using defaults"
                );
            }
        }
    } else {
        info!(
            path = %config_path.display(),
            "Config file not found, using defaults"
        );
    }

    MeshConfig::default()
}

/// Get the default config file path.
pub fn default_config_path() -> PathBuf {
    PathBuf::from("vigil.toml")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = MeshConfig::default();
        assert_eq!(config.endpoint_name, "vigil");
        assert_eq!(config.event_capacity, 1024);
    }

    #[test]
    fn test_partial_toml_overrides() {
        let config = MeshConfig::from_toml_str(
            r#"
            endpoint_name = "hub"
            node = "10.0.0.5"
            "#,
        )
        .unwrap();
        assert_eq!(config.endpoint_name, "hub");
        assert_eq!(config.node, "10.0.0.5");
        assert_eq!(config.service, "7978");
    }

    #[test]
    fn test_invalid_toml_is_configuration_error() {
        let err = MeshConfig::from_toml_str("endpoint_name = [broken").unwrap_err();
        assert!(matches!(err, VigilError::Configuration(_)));
    }

    #[test]
    fn test_load_config_missing_file_uses_defaults() {
        let config = load_config(Some(Path::new("/nonexistent/vigil.toml")));
        assert_eq!(config.endpoint_name, "vigil");
    }

    #[test]
    fn test_load_config_reads_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "endpoint_name = \"sat1\"").unwrap();
        writeln!(file, "event_capacity = 64").unwrap();

        let config = load_config(Some(file.path()));
        assert_eq!(config.endpoint_name, "sat1");
        assert_eq!(config.event_capacity, 64);
    }

    #[test]
    fn test_load_config_malformed_file_uses_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "endpoint_name = [broken").unwrap();

        let config = load_config(Some(file.path()));
        assert_eq!(config.endpoint_name, "vigil");
    }
}
