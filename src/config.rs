use std::{
    env, fs,
    path::{Path, PathBuf},
    str::FromStr,
};

use anyhow::{Context as _, bail};
use serde::Deserialize;

use crate::{
    ledger::{DEFAULT_MAX_REQUESTS_PER_CONTEXT, DEFAULT_MAX_RESPONSE_BODY_BYTES, LedgerLimits},
    replay::HostMismatchPolicy,
};

const PROJECT_CONFIG_FILE: &str = "reqscope.toml";
const HOME_CONFIG_DIR: &str = ".reqscope";
const HOME_CONFIG_FILE: &str = "config.toml";

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub capture: Option<CaptureConfig>,
    #[serde(default)]
    pub replay: Option<ReplayConfig>,
    #[serde(default)]
    pub logging: Option<LoggingConfig>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CaptureConfig {
    pub max_requests_per_context: Option<usize>,
    pub max_response_body_bytes: Option<usize>,
    /// Attach as soon as a context is opened.
    pub auto_capture: Option<bool>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ReplayConfig {
    pub host_mismatch: Option<HostMismatchPolicy>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LoggingConfig {
    pub level: Option<String>,
    pub format: Option<LogFormat>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Json,
    Pretty,
}

impl Config {
    /// Explicit path first, then `./reqscope.toml`, then `~/.reqscope/config.toml`; defaults
    /// when none exist.
    pub fn load(explicit: Option<&Path>) -> anyhow::Result<Self> {
        if let Some(path) = explicit {
            return Self::from_path(path);
        }
        let cwd = env::current_dir().context("resolve current directory")?;
        let home = env::var_os("HOME").map(PathBuf::from);
        match discover_config_path(&cwd, home.as_deref()) {
            Some(path) => Self::from_path(path),
            None => Ok(Self::default()),
        }
    }

    pub fn from_path(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let toml =
            fs::read_to_string(path).with_context(|| format!("read config {}", path.display()))?;
        Self::from_toml_str(&toml).with_context(|| format!("load config {}", path.display()))
    }

    pub fn from_toml_str(toml: &str) -> anyhow::Result<Self> {
        toml.parse()
    }

    pub fn ledger_limits(&self) -> LedgerLimits {
        let capture = self.capture.as_ref();
        LedgerLimits {
            max_requests_per_context: capture
                .and_then(|capture| capture.max_requests_per_context)
                .unwrap_or(DEFAULT_MAX_REQUESTS_PER_CONTEXT),
            max_response_body_bytes: capture
                .and_then(|capture| capture.max_response_body_bytes)
                .unwrap_or(DEFAULT_MAX_RESPONSE_BODY_BYTES),
        }
    }

    pub fn auto_capture(&self) -> bool {
        self.capture
            .as_ref()
            .and_then(|capture| capture.auto_capture)
            .unwrap_or(false)
    }

    pub fn host_mismatch_policy(&self) -> HostMismatchPolicy {
        self.replay
            .as_ref()
            .and_then(|replay| replay.host_mismatch)
            .unwrap_or_default()
    }

    fn validate(&self) -> anyhow::Result<()> {
        if let Some(capture) = &self.capture {
            if capture.max_requests_per_context == Some(0) {
                bail!("`capture.max_requests_per_context` must be at least 1");
            }
            if capture.max_response_body_bytes == Some(0) {
                bail!("`capture.max_response_body_bytes` must be at least 1");
            }
        }
        Ok(())
    }
}

impl FromStr for Config {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let config: Self = toml::from_str(s).context("parse config TOML")?;
        config.validate()?;
        Ok(config)
    }
}

fn discover_config_path(cwd: &Path, home: Option<&Path>) -> Option<PathBuf> {
    let project = cwd.join(PROJECT_CONFIG_FILE);
    if project.is_file() {
        return Some(project);
    }
    let home_config = home?.join(HOME_CONFIG_DIR).join(HOME_CONFIG_FILE);
    home_config.is_file().then_some(home_config)
}
