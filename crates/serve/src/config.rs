use std::path::Path;

use anyhow::Context;

/// Server configuration, read from a JSON file (`config/config.json` by
/// default). A missing file is created with these defaults; missing fields
/// take their default; an unparseable file falls back to defaults entirely.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct Config {
    /// Address the HTTP server binds.
    pub host: String,
    /// Port the HTTP server binds. Storage node `id` is assigned the
    /// metadata port `port + id`.
    pub port: u16,
    /// Number of storage nodes to open.
    pub nodes_db: u32,
    /// Bearer token required on every route except `GET /`.
    #[serde(rename = "API_TOKEN")]
    pub api_token: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 5000,
            nodes_db: 3,
            api_token: "your_api_token_here".to_string(),
        }
    }
}

/// Load the configuration at `path`, writing the defaults there on first run.
pub fn load_or_create(path: &Path) -> anyhow::Result<Config> {
    if !path.exists() {
        let config = Config::default();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating config directory {}", parent.display()))?;
        }
        let body = serde_json::to_vec_pretty(&config).context("encoding default config")?;
        std::fs::write(path, body)
            .with_context(|| format!("writing default config to {}", path.display()))?;
        tracing::info!(path = %path.display(), "wrote default configuration");
        return Ok(config);
    }

    let raw = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    match serde_json::from_slice(&raw) {
        Ok(config) => Ok(config),
        Err(error) => {
            tracing::warn!(%error, path = %path.display(), "invalid configuration file, using defaults");
            Ok(Config::default())
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn first_run_writes_defaults() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("config/config.json");

        let config = load_or_create(&path).unwrap();
        assert_eq!(config.port, 5000);
        assert_eq!(config.nodes_db, 3);
        assert!(path.exists());

        // The written file round-trips.
        let again = load_or_create(&path).unwrap();
        assert_eq!(again.api_token, config.api_token);
    }

    #[test]
    fn partial_config_takes_field_defaults() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("config.json");
        std::fs::write(&path, r#"{"port": 9000, "API_TOKEN": "secret"}"#).unwrap();

        let config = load_or_create(&path).unwrap();
        assert_eq!(config.port, 9000);
        assert_eq!(config.api_token, "secret");
        assert_eq!(config.host, "127.0.0.1");
        assert_eq!(config.nodes_db, 3);
    }

    #[test]
    fn garbage_config_falls_back_to_defaults() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("config.json");
        std::fs::write(&path, "not json").unwrap();

        let config = load_or_create(&path).unwrap();
        assert_eq!(config.port, 5000);
    }
}
