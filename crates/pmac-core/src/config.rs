//! TOML configuration for a sync run.
//!
//! ```toml
//! [sync]
//! strategy = "newest_wins"
//! plan_path = "project_plan.json"
//!
//! [retry]
//! max_attempts = 5
//!
//! [github]
//! repo = "acme/web"
//!
//! [jira]
//! base_url = "https://acme.atlassian.net"
//! project_key = "WEB"
//! email = "bot@acme.dev"
//! ```
//!
//! Credentials never live in this file; the CLI reads them from the
//! environment.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::engine::EngineOptions;
use crate::reconcile::InboundPolicy;
use crate::resolve::Strategy;
use crate::retry::RetryPolicy;
use crate::tracker::{GitHubConfig, JiraConfig};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("invalid config: {0}")]
    Invalid(String),
}

// -----------------------------------------------------------------------
// Sections
// -----------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PmacConfig {
    #[serde(default)]
    pub sync: SyncSection,
    #[serde(default)]
    pub retry: RetrySection,
    pub github: Option<GitHubSection>,
    pub jira: Option<JiraSection>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SyncSection {
    pub strategy: Strategy,
    pub inbound_policy: InboundPolicy,
    pub plan_path: PathBuf,
    pub mapping_path: PathBuf,
    pub call_timeout_secs: u64,
    pub max_rate_limit_wait_secs: u64,
}

impl Default for SyncSection {
    fn default() -> Self {
        Self {
            strategy: Strategy::default(),
            inbound_policy: InboundPolicy::default(),
            plan_path: PathBuf::from("project_plan.json"),
            mapping_path: PathBuf::from(".pmac/mapping.json"),
            call_timeout_secs: 30,
            max_rate_limit_wait_secs: 60,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RetrySection {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetrySection {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            base_delay_ms: 500,
            max_delay_ms: 8_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GitHubSection {
    /// `owner/name`.
    pub repo: String,
    #[serde(default = "default_github_api")]
    pub api_url: String,
    /// Owner of the Projects that back plan views; defaults to the repo owner.
    pub owner: Option<String>,
    pub closed_status: Option<String>,
}

fn default_github_api() -> String {
    "https://api.github.com".to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct JiraSection {
    pub base_url: String,
    pub project_key: String,
    /// Account email for basic auth.
    pub email: String,
    pub board_id: Option<u64>,
    pub filter_id: Option<u64>,
    pub story_points_field: Option<String>,
}

// -----------------------------------------------------------------------
// Loading and conversion
// -----------------------------------------------------------------------

impl PmacConfig {
    pub fn from_toml_str(path: &Path, text: &str) -> Result<Self, ConfigError> {
        let config: PmacConfig = toml::from_str(text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.check()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(path, &text)
    }

    fn check(&self) -> Result<(), ConfigError> {
        if self.retry.max_attempts == 0 {
            return Err(ConfigError::Invalid(
                "retry.max_attempts must be at least 1".to_string(),
            ));
        }
        if self.sync.call_timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "sync.call_timeout_secs must be at least 1".to_string(),
            ));
        }
        if let Some(github) = &self.github {
            let valid = github
                .repo
                .split_once('/')
                .is_some_and(|(owner, name)| !owner.is_empty() && !name.is_empty());
            if !valid {
                return Err(ConfigError::Invalid(format!(
                    "github.repo must be owner/name, got {:?}",
                    github.repo
                )));
            }
        }
        Ok(())
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.retry.max_attempts,
            base_delay: Duration::from_millis(self.retry.base_delay_ms),
            max_delay: Duration::from_millis(self.retry.max_delay_ms),
            max_rate_limit_wait: Duration::from_secs(self.sync.max_rate_limit_wait_secs),
        }
    }

    pub fn engine_options(&self) -> EngineOptions {
        EngineOptions {
            strategy: self.sync.strategy,
            inbound_policy: self.sync.inbound_policy,
            retry: self.retry_policy(),
            call_timeout: self.call_timeout(),
            dry_run: false,
        }
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.sync.call_timeout_secs)
    }

    pub fn github_config(&self) -> Option<GitHubConfig> {
        self.github.as_ref().map(|section| {
            let mut config = GitHubConfig::new(section.repo.clone());
            config.project_owner = section.owner.clone();
            if let Some(status) = &section.closed_status {
                config.closed_status = status.clone();
            }
            config
        })
    }

    pub fn jira_config(&self) -> Option<JiraConfig> {
        self.jira.as_ref().map(|section| {
            let mut config = JiraConfig::new(section.project_key.clone());
            config.board_id = section.board_id;
            config.filter_id = section.filter_id;
            if let Some(field) = &section.story_points_field {
                config.story_points_field = field.clone();
            }
            config
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(text: &str) -> Result<PmacConfig, ConfigError> {
        PmacConfig::from_toml_str(Path::new("config.toml"), text)
    }

    #[test]
    fn empty_file_uses_defaults() {
        let config = parse("").unwrap();
        assert_eq!(config.sync.plan_path, PathBuf::from("project_plan.json"));
        assert_eq!(config.sync.mapping_path, PathBuf::from(".pmac/mapping.json"));
        assert_eq!(config.retry_policy(), RetryPolicy::default());
        assert!(config.github_config().is_none());
        assert!(config.jira_config().is_none());
    }

    #[test]
    fn full_file_converts_into_adapter_configs() {
        let config = parse(
            r#"
[sync]
strategy = "newest_wins"
inbound_policy = "conflict"
call_timeout_secs = 10

[retry]
max_attempts = 2
base_delay_ms = 100

[github]
repo = "acme/web"
owner = "acme-org"

[jira]
base_url = "https://acme.atlassian.net"
project_key = "WEB"
email = "bot@acme.dev"
board_id = 7
story_points_field = "customfield_10028"
"#,
        )
        .unwrap();

        let options = config.engine_options();
        assert_eq!(options.strategy, Strategy::NewestWins);
        assert_eq!(options.inbound_policy, InboundPolicy::Conflict);
        assert_eq!(options.call_timeout, Duration::from_secs(10));
        assert_eq!(options.retry.max_attempts, 2);
        assert_eq!(options.retry.base_delay, Duration::from_millis(100));
        assert_eq!(options.retry.max_delay, Duration::from_secs(8));

        let github = config.github_config().unwrap();
        assert_eq!(github.repo, "acme/web");
        assert_eq!(github.owner(), "acme-org");
        assert_eq!(config.github.as_ref().unwrap().api_url, "https://api.github.com");

        let jira = config.jira_config().unwrap();
        assert_eq!(jira.project_key, "WEB");
        assert_eq!(jira.board_id, Some(7));
        assert_eq!(jira.story_points_field, "customfield_10028");
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let err = parse("[sync]\nstratgey = \"manual\"\n").unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }), "got {err:?}");
    }

    #[test]
    fn malformed_repo_is_invalid() {
        let err = parse("[github]\nrepo = \"web\"\n").unwrap_err();
        assert!(err.to_string().contains("owner/name"), "got {err}");
    }

    #[test]
    fn zero_attempts_is_invalid() {
        let err = parse("[retry]\nmax_attempts = 0\n").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn missing_file_is_an_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = PmacConfig::load(&dir.path().join("nope.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }
}
