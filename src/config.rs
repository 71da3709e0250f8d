//! appdrop Configuration
//!
//! Parses `config.toml` and resolves it, together with command-line
//! overrides, into the [`InstallContext`] the installer runs against.

use anyhow::{Context, Result};
use appdrop_common::paths;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default deadline for a single download
pub const DEFAULT_FETCH_TIMEOUT_SECS: u64 = 300;

/// The configuration file structure
#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct AppdropConfig {
    #[serde(default)]
    pub install: InstallSection,
    #[serde(default)]
    pub fetch: FetchSection,
    #[serde(default)]
    pub security: SecuritySection,
    #[serde(default)]
    pub paths: PathsSection,
}

/// Installation defaults
#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct InstallSection {
    /// Directory artifacts are placed into (default: platform applications folder)
    #[serde(default)]
    pub target: Option<PathBuf>,
}

/// Download settings
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FetchSection {
    /// Seconds before a download is abandoned
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    /// Custom User-Agent header
    #[serde(default)]
    pub user_agent: Option<String>,
}

impl Default for FetchSection {
    fn default() -> Self {
        Self {
            timeout_secs: default_timeout_secs(),
            user_agent: None,
        }
    }
}

/// Trust settings
#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct SecuritySection {
    /// Permit descriptors whose integrity policy is "skip"
    #[serde(default)]
    pub allow_unverified: bool,
}

/// State locations
#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct PathsSection {
    /// Where receipts are kept (default: ~/.local/share/appdrop)
    #[serde(default)]
    pub state_dir: Option<PathBuf>,
}

fn default_timeout_secs() -> u64 {
    DEFAULT_FETCH_TIMEOUT_SECS
}

/// Everything an install needs to know about its environment
///
/// Passed explicitly to the installer; nothing is read from process-wide state
/// once this is built.
#[derive(Debug, Clone)]
pub struct InstallContext {
    /// Directory artifacts are placed into
    pub target_root: PathBuf,

    /// Directory holding receipts
    pub state_dir: PathBuf,

    /// Deadline for a single fetch
    pub fetch_timeout: Duration,

    /// Whether descriptors with `policy = "skip"` may be installed
    pub allow_unverified: bool,

    /// User-Agent for HTTP downloads
    pub user_agent: String,
}

impl InstallContext {
    /// Context rooted in explicit directories, with default settings otherwise
    pub fn new(target_root: impl Into<PathBuf>, state_dir: impl Into<PathBuf>) -> Self {
        Self {
            target_root: target_root.into(),
            state_dir: state_dir.into(),
            fetch_timeout: Duration::from_secs(DEFAULT_FETCH_TIMEOUT_SECS),
            allow_unverified: false,
            user_agent: default_user_agent(),
        }
    }
}

/// Command-line overrides layered on top of the file
#[derive(Debug, Default, Clone)]
pub struct Overrides {
    pub target: Option<PathBuf>,
    pub state_dir: Option<PathBuf>,
    pub timeout_secs: Option<u64>,
    pub allow_unverified: bool,
}

impl AppdropConfig {
    /// Load configuration from a file path
    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::parse(&contents)
            .with_context(|| format!("Invalid config file: {}", path.display()))
    }

    /// Load the explicit path if given, else the default location if it exists
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        if let Some(path) = explicit {
            return Self::from_file(path);
        }

        match paths::config::config_file() {
            Some(path) if path.exists() => {
                tracing::debug!("Loading config from {}", path.display());
                Self::from_file(&path)
            }
            _ => Ok(Self::default()),
        }
    }

    /// Parse configuration from a TOML string
    pub fn parse(toml_str: &str) -> Result<Self> {
        let config: Self = toml::from_str(toml_str).context("Failed to parse config.toml")?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.fetch.timeout_secs == 0 {
            anyhow::bail!("fetch.timeout_secs must be greater than zero");
        }
        Ok(())
    }

    /// Resolve into an install context, applying command-line overrides
    pub fn resolve(&self, overrides: &Overrides) -> Result<InstallContext> {
        let target_root = overrides
            .target
            .clone()
            .or_else(|| self.install.target.clone())
            .unwrap_or_else(paths::install::default_target_root);

        let state_dir = match overrides
            .state_dir
            .clone()
            .or_else(|| self.paths.state_dir.clone())
        {
            Some(dir) => dir,
            None => paths::state::base_dir().context(
                "Cannot determine a state directory; set paths.state_dir or pass --state-dir",
            )?,
        };

        let timeout_secs = overrides.timeout_secs.unwrap_or(self.fetch.timeout_secs);
        if timeout_secs == 0 {
            anyhow::bail!("--timeout must be greater than zero");
        }

        Ok(InstallContext {
            target_root,
            state_dir,
            fetch_timeout: Duration::from_secs(timeout_secs),
            allow_unverified: overrides.allow_unverified || self.security.allow_unverified,
            user_agent: self
                .fetch
                .user_agent
                .clone()
                .unwrap_or_else(default_user_agent),
        })
    }
}

fn default_user_agent() -> String {
    format!("appdrop/{}", env!("CARGO_PKG_VERSION"))
}

/// Generate a template config.toml file
pub fn generate_template() -> String {
    format!(
        r#"# appdrop configuration

[install]
# Directory application bundles are placed into
# target = "/Applications"

[fetch]
# Seconds before a download is abandoned
timeout_secs = {timeout}

[security]
# Allow descriptors that disable integrity verification (policy = "skip")
allow_unverified = false

[paths]
# Where install receipts are kept
# state_dir = "~/.local/share/appdrop"
"#,
        timeout = DEFAULT_FETCH_TIMEOUT_SECS,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_empty_config() {
        let config = AppdropConfig::parse("").unwrap();
        assert_eq!(config.fetch.timeout_secs, DEFAULT_FETCH_TIMEOUT_SECS);
        assert!(!config.security.allow_unverified);
        assert!(config.install.target.is_none());
    }

    #[test]
    fn test_parse_full_config() {
        let toml = r#"
            [install]
            target = "/opt/apps"

            [fetch]
            timeout_secs = 30
            user_agent = "custom/1.0"

            [security]
            allow_unverified = true

            [paths]
            state_dir = "/var/lib/appdrop"
        "#;

        let config = AppdropConfig::parse(toml).unwrap();
        let ctx = config.resolve(&Overrides::default()).unwrap();
        assert_eq!(ctx.target_root, PathBuf::from("/opt/apps"));
        assert_eq!(ctx.state_dir, PathBuf::from("/var/lib/appdrop"));
        assert_eq!(ctx.fetch_timeout, Duration::from_secs(30));
        assert!(ctx.allow_unverified);
        assert_eq!(ctx.user_agent, "custom/1.0");
    }

    #[test]
    fn test_overrides_win() {
        let config = AppdropConfig::parse("[install]\ntarget = \"/opt/apps\"").unwrap();
        let ctx = config
            .resolve(&Overrides {
                target: Some(PathBuf::from("/tmp/apps")),
                state_dir: Some(PathBuf::from("/tmp/state")),
                timeout_secs: Some(5),
                allow_unverified: true,
            })
            .unwrap();
        assert_eq!(ctx.target_root, PathBuf::from("/tmp/apps"));
        assert_eq!(ctx.state_dir, PathBuf::from("/tmp/state"));
        assert_eq!(ctx.fetch_timeout, Duration::from_secs(5));
        assert!(ctx.allow_unverified);
    }

    #[test]
    fn test_rejects_zero_timeout_and_unknown_keys() {
        assert!(AppdropConfig::parse("[fetch]\ntimeout_secs = 0").is_err());
        assert!(AppdropConfig::parse("[fetch]\nretries = 3").is_err());
    }

    #[test]
    fn test_template_parses() {
        let config = AppdropConfig::parse(&generate_template()).unwrap();
        assert!(!config.security.allow_unverified);
    }
}
