//! Config resolution for the `pmac` binary.
//!
//! The config file lives at `~/.config/pmac/config.toml` by default. Every
//! setting resolves through the chain: CLI flag > env var > config file >
//! default. Tracker credentials only ever come from the environment.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result, bail};

use pmac_core::config::PmacConfig;
use pmac_core::tracker::{
    Credentials, GitHubAdapter, HttpTransport, JiraAdapter, TrackerRegistry,
};

pub const CONFIG_ENV: &str = "PMAC_CONFIG";
pub const PLAN_ENV: &str = "PMAC_PLAN";
pub const MAPPING_ENV: &str = "PMAC_MAPPING";
pub const GITHUB_TOKEN_ENV: &str = "GITHUB_TOKEN";
pub const JIRA_TOKEN_ENV: &str = "JIRA_API_TOKEN";

// -----------------------------------------------------------------------
// Paths
// -----------------------------------------------------------------------

/// Return the pmac config directory.
///
/// Always uses XDG layout: `$XDG_CONFIG_HOME/pmac` or `~/.config/pmac`.
pub fn config_dir() -> PathBuf {
    if let Ok(xdg) = std::env::var("XDG_CONFIG_HOME") {
        return PathBuf::from(xdg).join("pmac");
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".config")
        .join("pmac")
}

/// Return the default config file path.
pub fn config_path() -> PathBuf {
    config_dir().join("config.toml")
}

// -----------------------------------------------------------------------
// Resolved config
// -----------------------------------------------------------------------

/// Paths given on the command line.
#[derive(Debug, Default)]
pub struct Overrides {
    pub config: Option<PathBuf>,
    pub plan: Option<PathBuf>,
    pub mapping: Option<PathBuf>,
}

/// Fully resolved configuration, ready for use.
#[derive(Debug)]
pub struct ResolvedConfig {
    pub file: PmacConfig,
    /// The config file that was read, if any.
    pub source: Option<PathBuf>,
    pub plan_path: PathBuf,
    pub mapping_path: PathBuf,
}

impl ResolvedConfig {
    /// Resolve configuration.
    ///
    /// - Config file: `--config` > `PMAC_CONFIG` > default path if it exists > built-in defaults
    /// - Plan path: `--plan` > `PMAC_PLAN` > `sync.plan_path`
    /// - Mapping path: `--mapping` > `PMAC_MAPPING` > `sync.mapping_path`
    ///
    /// An explicitly named config file must exist.
    pub fn resolve(overrides: &Overrides) -> Result<Self> {
        let explicit = overrides
            .config
            .clone()
            .or_else(|| env_path(CONFIG_ENV));
        let source = match explicit {
            Some(path) => Some(path),
            None => Some(config_path()).filter(|p| p.exists()),
        };

        let file = match &source {
            Some(path) => PmacConfig::load(path)
                .with_context(|| format!("failed to load config from {}", path.display()))?,
            None => PmacConfig::default(),
        };
        tracing::debug!(source = ?source, "config resolved");

        let plan_path = overrides
            .plan
            .clone()
            .or_else(|| env_path(PLAN_ENV))
            .unwrap_or_else(|| file.sync.plan_path.clone());
        let mapping_path = overrides
            .mapping
            .clone()
            .or_else(|| env_path(MAPPING_ENV))
            .unwrap_or_else(|| file.sync.mapping_path.clone());

        Ok(Self {
            file,
            source,
            plan_path,
            mapping_path,
        })
    }

    /// Build adapters for every configured tracker.
    ///
    /// Fails when a configured tracker has no token in the environment.
    pub fn build_registry(&self) -> Result<TrackerRegistry> {
        let mut registry = TrackerRegistry::new();
        let timeout = self.file.call_timeout();

        if let (Some(section), Some(github)) = (&self.file.github, self.file.github_config()) {
            let token = required_env(GITHUB_TOKEN_ENV, "[github]")?;
            let transport =
                HttpTransport::new(section.api_url.clone(), Credentials::Bearer(token), timeout)
                    .context("failed to build GitHub HTTP client")?;
            registry.register(Arc::new(GitHubAdapter::new(github, Arc::new(transport))));
        }

        if let (Some(section), Some(jira)) = (&self.file.jira, self.file.jira_config()) {
            let token = required_env(JIRA_TOKEN_ENV, "[jira]")?;
            let credentials = Credentials::Basic {
                user: section.email.clone(),
                token,
            };
            let transport = HttpTransport::new(section.base_url.clone(), credentials, timeout)
                .context("failed to build Jira HTTP client")?;
            registry.register(Arc::new(JiraAdapter::new(jira, Arc::new(transport))));
        }

        if registry.is_empty() {
            bail!("no trackers configured; add a [github] or [jira] section to the config file");
        }
        Ok(registry)
    }
}

fn env_path(name: &str) -> Option<PathBuf> {
    std::env::var_os(name)
        .filter(|v| !v.is_empty())
        .map(PathBuf::from)
}

fn required_env(name: &str, section: &str) -> Result<String> {
    match std::env::var(name) {
        Ok(value) if !value.trim().is_empty() => Ok(value),
        _ => bail!("{section} is configured but {name} is not set"),
    }
}

// -----------------------------------------------------------------------
// Tests
// -----------------------------------------------------------------------
