use std::path::PathBuf;

use serde::Deserialize;
use tracing::warn;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub(crate) struct Config {
    pub(crate) server: ServerConfig,
    pub(crate) database: DatabaseConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub(crate) struct ServerConfig {
    pub(crate) host: String,
    pub(crate) port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "news.gmane.io".to_string(),
            port: 119,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub(crate) struct DatabaseConfig {
    pub(crate) path: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: "newsarc.db".to_string(),
        }
    }
}

pub(crate) fn load_config() -> Config {
    let Some(content) = load_config_text() else {
        return Config::default();
    };
    match toml::from_str(&content) {
        Ok(config) => config,
        Err(err) => {
            warn!("invalid newsarc.toml, using defaults: {err}");
            Config::default()
        }
    }
}

fn config_path_candidates() -> Vec<PathBuf> {
    vec![
        PathBuf::from("newsarc.toml"),
        xdg_config_dir().join("newsarc").join("newsarc.toml"),
    ]
}

fn load_config_text() -> Option<String> {
    for path in config_path_candidates() {
        if let Ok(content) = std::fs::read_to_string(&path) {
            return Some(content);
        }
    }
    None
}

fn xdg_config_dir() -> PathBuf {
    std::env::var_os("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .or_else(|| std::env::var_os("HOME").map(|home| PathBuf::from(home).join(".config")))
        .unwrap_or_else(|| PathBuf::from("."))
}

#[cfg(test)]
mod tests {
    use super::Config;

    #[test]
    fn defaults_apply_without_file_sections() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.server.host, "news.gmane.io");
        assert_eq!(config.server.port, 119);
        assert_eq!(config.database.path, "newsarc.db");
    }

    #[test]
    fn file_values_override_defaults() {
        let config: Config = toml::from_str(
            "[server]\nhost = \"news.example.org\"\nport = 563\n\n[database]\npath = \"/var/lib/newsarc/archive.db\"\n",
        )
        .unwrap();
        assert_eq!(config.server.host, "news.example.org");
        assert_eq!(config.server.port, 563);
        assert_eq!(config.database.path, "/var/lib/newsarc/archive.db");
    }

    #[test]
    fn partial_file_keeps_remaining_defaults() {
        let config: Config = toml::from_str("[server]\nhost = \"news.example.org\"\n").unwrap();
        assert_eq!(config.server.host, "news.example.org");
        assert_eq!(config.server.port, 119);
        assert_eq!(config.database.path, "newsarc.db");
    }
}
