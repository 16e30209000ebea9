use crate::types::{Credential, CredentialError};
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;
use url::Url;

pub const DEFAULT_DATABASE_PATH: &str = "github_stats.db";
pub const DEFAULT_API_URL: &str = "https://api.github.com";

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Port cannot be 0")]
    InvalidPort,
    #[error("Sync interval cannot be 0")]
    InvalidSyncInterval,
    #[error("Trailing window cannot be 0 days")]
    InvalidWindow,
    #[error("Upstream timeout cannot be 0")]
    InvalidTimeout,
    #[error("Firestore project id cannot be empty")]
    EmptyProjectId,
    #[error("Invalid upstream API url")]
    InvalidApiUrl,
}

#[derive(Clone, Deserialize, Debug, PartialEq)]
#[serde(rename_all = "lowercase")]
#[serde(tag = "type")]
pub enum StorageType {
    Sqlite {
        path: PathBuf,
        /// Used when `path` is not writable at startup. Defaults to the
        /// system temp directory.
        #[serde(default)]
        fallback_path: Option<PathBuf>,
    },
    Firestore {
        project_id: String,
        #[serde(default = "default_firestore_database")]
        database: String,
        /// Overrides the public endpoint, e.g. to talk to the emulator.
        #[serde(default)]
        endpoint: Option<Url>,
        /// Environment variable holding a bearer token.
        #[serde(default)]
        token_env: Option<String>,
    },
}

impl Default for StorageType {
    fn default() -> Self {
        StorageType::Sqlite {
            path: DEFAULT_DATABASE_PATH.into(),
            fallback_path: None,
        }
    }
}

fn default_firestore_database() -> String {
    "(default)".into()
}

#[derive(Clone, Deserialize, Debug, PartialEq)]
pub struct Listener {
    pub host: String,
    pub port: u16,
}

impl Default for Listener {
    fn default() -> Self {
        Listener {
            host: "127.0.0.1".into(),
            port: 8000,
        }
    }
}

#[derive(Clone, Deserialize, Debug, PartialEq)]
pub struct GitHub {
    /// Defaults to [`DEFAULT_API_URL`].
    #[serde(default)]
    pub api_url: Option<Url>,
    /// Falls back to the GITHUB_USERNAME environment variable.
    #[serde(default)]
    pub username: Option<String>,
    /// Falls back to the GITHUB_ORG environment variable.
    #[serde(default)]
    pub organization: Option<String>,
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default = "default_token_env")]
    pub token_env: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for GitHub {
    fn default() -> Self {
        GitHub {
            api_url: None,
            username: None,
            organization: None,
            token: None,
            token_env: default_token_env(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

fn default_token_env() -> String {
    "GITHUB_TOKEN".into()
}

fn default_timeout_secs() -> u64 {
    30
}

impl GitHub {
    pub fn api_url(&self) -> Result<Url, ValidationError> {
        match &self.api_url {
            Some(url) => Ok(url.clone()),
            None => Url::parse(DEFAULT_API_URL).map_err(|_| ValidationError::InvalidApiUrl),
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// Resolves the single-operator credential from config and environment.
    pub fn credential(&self) -> Result<Credential, CredentialError> {
        self.credential_from(|key| std::env::var(key).ok())
    }

    fn credential_from<F>(&self, env: F) -> Result<Credential, CredentialError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let non_empty = |s: Option<String>| s.filter(|s| !s.trim().is_empty());

        let identity = non_empty(self.username.clone())
            .or_else(|| non_empty(env("GITHUB_USERNAME")))
            .ok_or(CredentialError::MissingIdentity)?;
        let token = non_empty(self.token.clone())
            .or_else(|| non_empty(env(&self.token_env)))
            .ok_or(CredentialError::MissingToken)?;
        let organization =
            non_empty(self.organization.clone()).or_else(|| non_empty(env("GITHUB_ORG")));

        Ok(Credential {
            identity,
            token,
            organization,
            scope_id: None,
        })
    }
}

#[derive(Clone, Deserialize, Debug, PartialEq)]
pub struct Sync {
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,
    #[serde(default = "default_window_days")]
    pub trailing_window_days: u32,
    #[serde(default = "default_true")]
    pub run_on_start: bool,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

impl Default for Sync {
    fn default() -> Self {
        Sync {
            interval_secs: default_interval_secs(),
            trailing_window_days: default_window_days(),
            run_on_start: true,
            enabled: true,
        }
    }
}

impl Sync {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

fn default_interval_secs() -> u64 {
    3600
}

fn default_window_days() -> u32 {
    crate::summary::DEFAULT_WINDOW_DAYS
}

fn default_true() -> bool {
    true
}

#[derive(Clone, Deserialize, Debug, Default, PartialEq)]
pub struct Config {
    #[serde(default)]
    pub listener: Listener,
    #[serde(default)]
    pub github: GitHub,
    #[serde(default)]
    pub sync: Sync,
    #[serde(default)]
    pub storage: StorageType,
}

impl Config {
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.listener.port == 0 {
            return Err(ValidationError::InvalidPort);
        }
        if self.sync.interval_secs == 0 {
            return Err(ValidationError::InvalidSyncInterval);
        }
        if self.sync.trailing_window_days == 0 {
            return Err(ValidationError::InvalidWindow);
        }
        if self.github.timeout_secs == 0 {
            return Err(ValidationError::InvalidTimeout);
        }
        self.github.api_url()?;
        if let StorageType::Firestore { project_id, .. } = &self.storage
            && project_id.trim().is_empty()
        {
            return Err(ValidationError::EmptyProjectId);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults() {
        let config: Config = serde_yaml::from_str("{}").unwrap();
        assert_eq!(config.listener, Listener::default());
        assert_eq!(config.sync.interval(), Duration::from_secs(3600));
        assert_eq!(config.sync.trailing_window_days, 14);
        assert_eq!(config.github.timeout(), Duration::from_secs(30));
        assert_eq!(config.github.api_url, None);
        assert_eq!(
            config.github.api_url().unwrap().as_str(),
            "https://api.github.com/"
        );

        let config: Config =
            serde_yaml::from_str("github:\n    api_url: http://localhost:9000/api\n").unwrap();
        assert_eq!(
            config.github.api_url().unwrap().as_str(),
            "http://localhost:9000/api"
        );
        assert_eq!(
            config.storage,
            StorageType::Sqlite {
                path: "github_stats.db".into(),
                fallback_path: None
            }
        );
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_firestore() {
        let yaml = r#"
listener:
    host: 0.0.0.0
    port: 8080
sync:
    interval_secs: 86400
    trailing_window_days: 7
storage:
    type: firestore
    project_id: stats-prod
    endpoint: http://localhost:8081
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.listener.port, 8080);
        assert_eq!(config.sync.interval_secs, 86400);
        assert!(config.sync.run_on_start);
        assert_eq!(
            config.storage,
            StorageType::Firestore {
                project_id: "stats-prod".into(),
                database: "(default)".into(),
                endpoint: Some(Url::parse("http://localhost:8081").unwrap()),
                token_env: None,
            }
        );
    }

    #[test]
    fn test_validation_errors() {
        let mut config = Config::default();
        config.listener.port = 0;
        assert_eq!(config.validate(), Err(ValidationError::InvalidPort));

        let mut config = Config::default();
        config.sync.interval_secs = 0;
        assert_eq!(config.validate(), Err(ValidationError::InvalidSyncInterval));

        let mut config = Config::default();
        config.sync.trailing_window_days = 0;
        assert_eq!(config.validate(), Err(ValidationError::InvalidWindow));

        let mut config = Config::default();
        config.github.timeout_secs = 0;
        assert_eq!(config.validate(), Err(ValidationError::InvalidTimeout));

        let config = Config {
            storage: StorageType::Firestore {
                project_id: " ".into(),
                database: "(default)".into(),
                endpoint: None,
                token_env: None,
            },
            ..Default::default()
        };
        assert_eq!(config.validate(), Err(ValidationError::EmptyProjectId));
    }

    #[test]
    fn test_credential_resolution() {
        let env = HashMap::from([
            ("GITHUB_USERNAME", "from-env"),
            ("GITHUB_TOKEN", "env-token"),
            ("GITHUB_ORG", "env-org"),
        ]);
        let lookup = |key: &str| env.get(key).map(|v| v.to_string());

        let github = GitHub::default();
        let credential = github.credential_from(lookup).unwrap();
        assert_eq!(credential.identity, "from-env");
        assert_eq!(credential.token, "env-token");
        assert_eq!(credential.organization.as_deref(), Some("env-org"));
        assert_eq!(credential.scope_id, None);

        // Inline values win over the environment
        let github = GitHub {
            username: Some("octocat".into()),
            token: Some("inline".into()),
            ..Default::default()
        };
        let credential = github.credential_from(lookup).unwrap();
        assert_eq!(credential.identity, "octocat");
        assert_eq!(credential.token, "inline");

        let github = GitHub {
            username: Some("octocat".into()),
            ..Default::default()
        };
        assert_eq!(
            github.credential_from(|_| None),
            Err(CredentialError::MissingToken)
        );
        assert_eq!(
            GitHub::default().credential_from(|_| None),
            Err(CredentialError::MissingIdentity)
        );
    }
}
