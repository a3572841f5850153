use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

pub const DEFAULT_USER_AGENT: &str = "wikibot/0.1";

/// Runtime configuration, loaded from `wikibot.toml` with env overrides.
#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct BotConfig {
    #[serde(default)]
    pub site: SiteSection,
    #[serde(default)]
    pub run: RunSection,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct SiteSection {
    pub api_url: Option<String>,
    pub site_id: Option<String>,
    pub user_agent: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct RunSection {
    pub batch_size: Option<usize>,
    pub state_dir: Option<PathBuf>,
    pub user_fixes: Option<PathBuf>,
    pub summary_lang: Option<String>,
}

impl BotConfig {
    /// Resolve the wiki API URL: env `WIKI_API_URL` > config > None.
    pub fn api_url(&self) -> Option<String> {
        if let Some(value) = non_empty_env("WIKI_API_URL") {
            return Some(value);
        }
        self.site.api_url.clone()
    }

    /// Resolve user agent: env `WIKI_USER_AGENT` > config > default.
    pub fn user_agent(&self) -> String {
        if let Some(value) = non_empty_env("WIKI_USER_AGENT") {
            return value;
        }
        self.site
            .user_agent
            .clone()
            .unwrap_or_else(|| DEFAULT_USER_AGENT.to_string())
    }

    /// Resolve the site identifier used in PageRef keys: env `WIKI_SITE_ID` >
    /// config > API URL host > "wiki".
    pub fn site_id(&self) -> String {
        if let Some(value) = non_empty_env("WIKI_SITE_ID") {
            return value;
        }
        if let Some(site_id) = &self.site.site_id {
            return site_id.clone();
        }
        self.api_url()
            .and_then(|url| host_of(&url))
            .unwrap_or_else(|| "wiki".to_string())
    }

    pub fn batch_size(&self) -> usize {
        self.run.batch_size.unwrap_or(50)
    }

    pub fn summary_lang(&self) -> String {
        self.run
            .summary_lang
            .clone()
            .unwrap_or_else(|| "en".to_string())
    }

    pub fn state_dir(&self) -> PathBuf {
        self.run
            .state_dir
            .clone()
            .unwrap_or_else(|| PathBuf::from(".wikibot"))
    }
}

fn non_empty_env(key: &str) -> Option<String> {
    let value = env::var(key).ok()?;
    let trimmed = value.trim().to_string();
    if trimmed.is_empty() { None } else { Some(trimmed) }
}

fn host_of(url: &str) -> Option<String> {
    let rest = url.split_once("://").map(|(_, rest)| rest).unwrap_or(url);
    let host = rest.split('/').next()?.trim();
    if host.is_empty() {
        None
    } else {
        Some(host.to_string())
    }
}

/// Load and parse a BotConfig from a TOML file. Returns default if the file
/// doesn't exist.
pub fn load_config(config_path: &Path) -> Result<BotConfig> {
    if !config_path.exists() {
        return Ok(BotConfig::default());
    }
    let content = fs::read_to_string(config_path)
        .with_context(|| format!("failed to read {}", config_path.display()))?;
    let parsed: BotConfig = toml::from_str(&content)
        .with_context(|| format!("failed to parse {}", config_path.display()))?;
    Ok(parsed)
}
