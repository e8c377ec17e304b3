//! Keyreply Configuration
//!
//! TOML configuration loading for the reply engine and its CLI

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub const DEFAULT_MAX_KEYWORDS_PER_SCOPE: usize = 50;
pub const DEFAULT_STORE_FILE: &str = "keyword_reply_config.json";
pub const DEFAULT_PATTERN_FILE: &str = "pattern_replies.json";

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub core: CoreConfig,
    #[serde(default)]
    pub reply: ReplyConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct CoreConfig {
    pub data_dir: Option<String>,
    pub log_level: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplyConfig {
    /// Scopes (groups) keep their own keyword buckets instead of writing everything to global.
    #[serde(default = "default_true")]
    pub group_separate: bool,
    #[serde(default = "default_max_keywords")]
    pub max_keywords_per_scope: usize,
    #[serde(default = "default_true")]
    pub enable_image_reply: bool,
    #[serde(default = "default_true")]
    pub allow_network_images: bool,
    #[serde(default = "default_true")]
    pub default_enabled: bool,
    /// Ask the host to mention the sender when replying inside a group scope.
    #[serde(default)]
    pub reply_with_at: bool,
    #[serde(default)]
    pub store_file: Option<String>,
    #[serde(default)]
    pub pattern_file: Option<String>,
}

impl Default for ReplyConfig {
    fn default() -> Self {
        Self {
            group_separate: true,
            max_keywords_per_scope: DEFAULT_MAX_KEYWORDS_PER_SCOPE,
            enable_image_reply: true,
            allow_network_images: true,
            default_enabled: true,
            reply_with_at: false,
            store_file: None,
            pattern_file: None,
        }
    }
}

impl ReplyConfig {
    pub fn store_file_name(&self) -> &str {
        self.store_file
            .as_deref()
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .unwrap_or(DEFAULT_STORE_FILE)
    }

    pub fn pattern_file_name(&self) -> &str {
        self.pattern_file
            .as_deref()
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .unwrap_or(DEFAULT_PATTERN_FILE)
    }
}

fn default_true() -> bool {
    true
}

fn default_max_keywords() -> usize {
    DEFAULT_MAX_KEYWORDS_PER_SCOPE
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("keyreply").join("config.toml"))
    }

    /// Resolves `core.data_dir`, expanding a leading `~`. Defaults to `~/.keyreply`.
    pub fn data_dir(&self) -> PathBuf {
        let home = || dirs::home_dir().unwrap_or_else(|| PathBuf::from("."));
        match self.core.data_dir.as_deref().map(str::trim) {
            Some("~") => home(),
            Some(dir) if dir.starts_with("~/") => home().join(dir.trim_start_matches("~/")),
            Some(dir) if !dir.is_empty() => PathBuf::from(dir),
            _ => home().join(".keyreply"),
        }
    }

    pub fn store_path(&self) -> PathBuf {
        self.data_dir().join(self.reply.store_file_name())
    }

    pub fn pattern_path(&self) -> PathBuf {
        self.data_dir().join(self.reply.pattern_file_name())
    }

    pub fn log_dir(&self) -> PathBuf {
        self.data_dir().join("logs")
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.reply.max_keywords_per_scope == 0 {
            anyhow::bail!("reply.max_keywords_per_scope must be > 0");
        }

        for (field, value) in [
            ("reply.store_file", self.reply.store_file.as_deref()),
            ("reply.pattern_file", self.reply.pattern_file.as_deref()),
        ] {
            if let Some(name) = value {
                let name = name.trim();
                if name.is_empty() {
                    anyhow::bail!("{} cannot be empty", field);
                }
                if name.contains('/') || name.contains('\\') {
                    anyhow::bail!("{} must be a file name, not a path: '{}'", field, name);
                }
            }
        }

        if self.reply.store_file_name() == self.reply.pattern_file_name() {
            anyhow::bail!("reply.store_file and reply.pattern_file must differ");
        }

        if let Some(level) = &self.core.log_level {
            if level.trim().is_empty() {
                anyhow::bail!("core.log_level cannot be empty");
            }
        }

        Ok(())
    }
}
