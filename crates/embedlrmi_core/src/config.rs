use std::env;
use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use reqwest::Url;
use serde::{Deserialize, Serialize};

use crate::error::Error;
use crate::resolver::{RewriteRule, rules_from_parallel};

pub const DEFAULT_CACHE_EXPIRY_SECS: u64 = 2_592_000;
pub const DEFAULT_HTTP_TIMEOUT_MS: u64 = 5_000;
pub const DEFAULT_USER_AGENT: &str = concat!("embedlrmi/", env!("CARGO_PKG_VERSION"));

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct LrmiConfig {
    #[serde(default)]
    pub lrmi: LrmiSection,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct LrmiSection {
    pub endpoint: Option<String>,
    pub cache_expiry: Option<u64>,
    pub http_timeout_ms: Option<u64>,
    pub user_agent: Option<String>,
    #[serde(default)]
    pub url_replacements: UrlReplacements,
}

/// Parallel find/replace lists, paired by index.
#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct UrlReplacements {
    #[serde(default)]
    pub from: Vec<String>,
    #[serde(default)]
    pub to: Vec<String>,
}

/// Fully resolved settings handed to the gateway and provider at construction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    pub endpoint: String,
    pub rewrite_rules: Vec<RewriteRule>,
    pub cache_expiry_secs: u64,
    pub http_timeout: Duration,
    pub user_agent: String,
}

impl LrmiConfig {
    /// Resolve settings: env > config > default. A missing endpoint is fatal.
    pub fn settings(&self) -> Result<Settings, Error> {
        self.settings_with_lookup(|key| env::var(key).ok())
    }

    pub fn settings_with_lookup<F>(&self, lookup_env: F) -> Result<Settings, Error>
    where
        F: Fn(&str) -> Option<String>,
    {
        let endpoint = trimmed(lookup_env("EMBEDLRMI_ENDPOINT"))
            .or_else(|| trimmed(self.lrmi.endpoint.clone()))
            .ok_or_else(|| {
                Error::Configuration(
                    "endpoint is not set (config [lrmi].endpoint or EMBEDLRMI_ENDPOINT)"
                        .to_string(),
                )
            })?;
        Url::parse(&endpoint).map_err(|error| {
            Error::Configuration(format!("endpoint `{endpoint}` is not a valid URL: {error}"))
        })?;

        let cache_expiry_secs = trimmed(lookup_env("EMBEDLRMI_CACHE_EXPIRY"))
            .and_then(|value| value.parse::<u64>().ok())
            .or(self.lrmi.cache_expiry)
            .unwrap_or(DEFAULT_CACHE_EXPIRY_SECS);
        let timeout_ms = trimmed(lookup_env("EMBEDLRMI_HTTP_TIMEOUT_MS"))
            .and_then(|value| value.parse::<u64>().ok())
            .or(self.lrmi.http_timeout_ms)
            .unwrap_or(DEFAULT_HTTP_TIMEOUT_MS);
        if timeout_ms == 0 {
            return Err(Error::Configuration(
                "http_timeout_ms must be greater than zero".to_string(),
            ));
        }
        let user_agent = trimmed(lookup_env("EMBEDLRMI_USER_AGENT"))
            .or_else(|| trimmed(self.lrmi.user_agent.clone()))
            .unwrap_or_else(|| DEFAULT_USER_AGENT.to_string());

        Ok(Settings {
            endpoint,
            rewrite_rules: self.rewrite_rules(),
            cache_expiry_secs,
            http_timeout: Duration::from_millis(timeout_ms),
            user_agent,
        })
    }

    pub fn rewrite_rules(&self) -> Vec<RewriteRule> {
        rules_from_parallel(
            &self.lrmi.url_replacements.from,
            &self.lrmi.url_replacements.to,
        )
    }
}

/// Load and parse an LrmiConfig from a TOML file. Returns default if file doesn't exist.
pub fn load_config(config_path: &Path) -> Result<LrmiConfig> {
    if !config_path.exists() {
        return Ok(LrmiConfig::default());
    }
    let content = fs::read_to_string(config_path)
        .with_context(|| format!("failed to read {}", config_path.display()))?;
    let parsed: LrmiConfig = toml::from_str(&content)
        .with_context(|| format!("failed to parse {}", config_path.display()))?;
    Ok(parsed)
}

fn trimmed(value: Option<String>) -> Option<String> {
    value
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}
