use std::env;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use toml::Value;

pub const DEFAULT_USER_AGENT: &str = "wikimirror/0.1";
pub const DEFAULT_CONTENT_DIR: &str = "pages";
pub const DEFAULT_AUTHOR_EMAIL_DOMAIN: &str = "wiki.invalid";

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct MirrorConfig {
    #[serde(default)]
    pub wiki: WikiSection,
    #[serde(default)]
    pub sync: SyncSection,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct WikiSection {
    pub base_url: Option<String>,
    pub space_key: Option<String>,
    pub root_page_id: Option<String>,
    pub user_agent: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct SyncSection {
    pub replay_history: Option<bool>,
    pub author_email_domain: Option<String>,
    pub content_dir: Option<String>,
}

impl MirrorConfig {
    /// Resolve the wiki base URL: env WIKI_BASE_URL > config > None.
    pub fn base_url(&self) -> Option<String> {
        env_override("WIKI_BASE_URL")
            .or_else(|| self.wiki.base_url.clone())
            .map(|url| url.trim().trim_end_matches('/').to_string())
            .filter(|url| !url.is_empty())
    }

    /// Resolve the space key: env WIKI_SPACE_KEY > config > None.
    pub fn space_key(&self) -> Option<String> {
        env_override("WIKI_SPACE_KEY").or_else(|| self.wiki.space_key.clone())
    }

    /// Resolve the mirrored root page: env WIKI_ROOT_PAGE_ID > config > None.
    pub fn root_page_id(&self) -> Option<String> {
        env_override("WIKI_ROOT_PAGE_ID").or_else(|| self.wiki.root_page_id.clone())
    }

    /// Resolve user agent: env WIKI_USER_AGENT > config > DEFAULT_USER_AGENT.
    pub fn user_agent(&self) -> String {
        env_override("WIKI_USER_AGENT")
            .or_else(|| self.wiki.user_agent.clone())
            .unwrap_or_else(|| DEFAULT_USER_AGENT.to_string())
    }

    pub fn replay_history(&self) -> bool {
        self.sync.replay_history.unwrap_or(false)
    }

    /// Domain used to build commit emails for wiki authors without a public address.
    pub fn author_email_domain(&self) -> &str {
        self.sync
            .author_email_domain
            .as_deref()
            .map(str::trim)
            .filter(|domain| !domain.is_empty())
            .unwrap_or(DEFAULT_AUTHOR_EMAIL_DOMAIN)
    }

    pub fn content_dir(&self) -> &str {
        self.sync
            .content_dir
            .as_deref()
            .map(str::trim)
            .filter(|dir| !dir.is_empty())
            .unwrap_or(DEFAULT_CONTENT_DIR)
    }
}

fn env_override(key: &str) -> Option<String> {
    let value = env::var(key).ok()?;
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

/// Load and parse a MirrorConfig from a TOML file. Returns default if file doesn't exist.
pub fn load_config(config_path: &Path) -> Result<MirrorConfig> {
    if !config_path.exists() {
        return Ok(MirrorConfig::default());
    }
    let content = fs::read_to_string(config_path)
        .with_context(|| format!("failed to read {}", config_path.display()))?;
    let parsed: MirrorConfig = toml::from_str(&content)
        .with_context(|| format!("failed to parse {}", config_path.display()))?;
    Ok(parsed)
}

#[derive(Debug, Clone, Default)]
pub struct WikiConfigPatch {
    pub set_base_url: Option<String>,
    pub set_space_key: Option<String>,
    pub set_root_page_id: Option<String>,
}

impl WikiConfigPatch {
    fn is_empty(&self) -> bool {
        self.set_base_url.is_none() && self.set_space_key.is_none() && self.set_root_page_id.is_none()
    }
}

/// Update selected keys under `[wiki]` while preserving all other config sections.
/// Returns `true` when a write occurred.
pub fn patch_wiki_config(config_path: &Path, patch: &WikiConfigPatch) -> Result<bool> {
    if patch.is_empty() {
        return Ok(false);
    }

    let mut root = if config_path.exists() {
        let content = fs::read_to_string(config_path)
            .with_context(|| format!("failed to read {}", config_path.display()))?;
        toml::from_str::<Value>(&content)
            .with_context(|| format!("failed to parse {}", config_path.display()))?
    } else {
        Value::Table(Default::default())
    };
    let original = root.clone();

    let root_table = root.as_table_mut().ok_or_else(|| {
        anyhow::anyhow!(
            "top-level TOML must be a table in {}",
            config_path.display()
        )
    })?;
    let wiki_entry = root_table
        .entry("wiki".to_string())
        .or_insert_with(|| Value::Table(Default::default()));
    let wiki_table = wiki_entry
        .as_table_mut()
        .ok_or_else(|| anyhow::anyhow!("[wiki] must be a table in {}", config_path.display()))?;

    let updates = [
        ("base_url", &patch.set_base_url),
        ("space_key", &patch.set_space_key),
        ("root_page_id", &patch.set_root_page_id),
    ];
    for (key, value) in updates {
        if let Some(value) = value {
            wiki_table.insert(key.to_string(), Value::String(value.trim().to_string()));
        }
    }

    if root == original {
        return Ok(false);
    }

    let parent = config_path
        .parent()
        .ok_or_else(|| anyhow::anyhow!("config path has no parent: {}", config_path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("failed to create {}", parent.display()))?;
    let rendered = toml::to_string_pretty(&root).context("failed to serialize config TOML")?;
    fs::write(config_path, rendered)
        .with_context(|| format!("failed to write {}", config_path.display()))?;
    Ok(true)
}
