use serde::Deserialize;
use std::fs::File;
use std::path::{Path, PathBuf};
use tracker::config::{Config as TrackerConfig, StorageType, ValidationError};

pub const DEFAULT_CONFIG_PATH: &str = "trafficstats.yaml";

#[derive(Clone, Deserialize, Debug, PartialEq)]
pub struct MetricsConfig {
    pub statsd_host: String,
    pub statsd_port: u16,
}

#[derive(Clone, Deserialize, Debug, PartialEq)]
pub struct LoggingConfig {
    /// Default filter when RUST_LOG is not set.
    #[serde(default = "default_level")]
    pub level: String,
    #[serde(default)]
    pub sentry_dsn: Option<String>,
}

fn default_level() -> String {
    "info".into()
}

#[derive(Clone, Deserialize, Debug, Default, PartialEq)]
pub struct CommonConfig {
    #[serde(default)]
    pub metrics: Option<MetricsConfig>,
    #[serde(default)]
    pub logging: Option<LoggingConfig>,
}

#[derive(Clone, Deserialize, Debug, Default, PartialEq)]
pub struct Config {
    #[serde(flatten)]
    pub common: CommonConfig,
    #[serde(flatten)]
    pub tracker: TrackerConfig,
}

impl Config {
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let file = File::open(path)?;
        let data = serde_yaml::from_reader(file)?;

        Ok(data)
    }

    /// Reads the given file, or the default file if present, or falls back to
    /// built-in defaults. Environment overrides are applied and the result is
    /// validated.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let default_path = Path::new(DEFAULT_CONFIG_PATH);
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None if default_path.exists() => Self::from_file(default_path)?,
            None => Config::default(),
        };

        config.apply_env(|key| std::env::var(key).ok());
        config.tracker.validate()?;
        Ok(config)
    }

    /// DATABASE_PATH overrides the embedded database location.
    fn apply_env<F>(&mut self, env: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let StorageType::Sqlite { path, .. } = &mut self.tracker.storage
            && let Some(value) = env("DATABASE_PATH").filter(|v| !v.trim().is_empty())
        {
            *path = PathBuf::from(value);
        }
    }
}

#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("could not load config from file: {0}")]
    LoadError(#[from] std::io::Error),
    #[error("could not parse config: {0}")]
    ParseError(#[from] serde_yaml::Error),
    #[error("invalid config: {0}")]
    Invalid(#[from] ValidationError),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_tmp_file(s: &str) -> tempfile::NamedTempFile {
        let mut tmp = tempfile::NamedTempFile::new().expect("create temp file");
        write!(tmp, "{}", s).expect("write yaml");

        tmp
    }

    #[test]
    fn full_config() {
        let yaml = r#"
            logging:
                level: debug
                sentry_dsn: https://key@sentry.example.com/1
            metrics:
                statsd_host: 127.0.0.1
                statsd_port: 8125
            listener:
                host: 0.0.0.0
                port: 9000
            github:
                username: octocat
                organization: acme
            sync:
                interval_secs: 86400
                run_on_start: false
            storage:
                type: sqlite
                path: /var/lib/trafficstats/stats.db
                fallback_path: /tmp/stats.db
            "#;
        let tmp = write_tmp_file(yaml);
        let config = Config::load(Some(tmp.path())).expect("load config");

        assert_eq!(config.common.logging.unwrap().level, "debug");
        assert_eq!(config.common.metrics.unwrap().statsd_port, 8125);
        assert_eq!(config.tracker.listener.port, 9000);
        assert_eq!(config.tracker.github.organization.as_deref(), Some("acme"));
        assert_eq!(config.tracker.sync.interval_secs, 86400);
        assert!(!config.tracker.sync.run_on_start);
        assert_eq!(config.tracker.sync.trailing_window_days, 14);
        assert!(matches!(config.tracker.storage, StorageType::Sqlite { .. }));
    }

    #[test]
    fn empty_config_uses_defaults() {
        let tmp = write_tmp_file("{}");
        let config = Config::from_file(tmp.path()).expect("load config");
        assert_eq!(config, Config::default());
    }

    #[test]
    fn invalid_config() {
        let tmp = write_tmp_file("sync:\n    interval_secs: 0\n");
        assert!(matches!(
            Config::load(Some(tmp.path())),
            Err(ConfigError::Invalid(ValidationError::InvalidSyncInterval))
        ));

        let tmp = write_tmp_file("storage:\n    type: postgres\n");
        assert!(matches!(
            Config::from_file(tmp.path()),
            Err(ConfigError::ParseError(_))
        ));

        assert!(matches!(
            Config::from_file(Path::new("/nonexistent/trafficstats.yaml")),
            Err(ConfigError::LoadError(_))
        ));
    }

    #[test]
    fn database_path_override() {
        let mut config = Config::default();
        config.apply_env(|key| (key == "DATABASE_PATH").then(|| "/data/stats.db".to_string()));
        assert_eq!(
            config.tracker.storage,
            StorageType::Sqlite {
                path: "/data/stats.db".into(),
                fallback_path: None
            }
        );

        // Document storage is left alone
        let mut config = Config::default();
        config.tracker.storage = StorageType::Firestore {
            project_id: "stats".into(),
            database: "(default)".into(),
            endpoint: None,
            token_env: None,
        };
        let before = config.clone();
        config.apply_env(|_| Some("/data/stats.db".to_string()));
        assert_eq!(config, before);
    }
}
