//! Keyreply Core
//!
//! Keyword lookup, regex fallback and content-chain rendering behind one engine

mod runtime;

pub use runtime::{ReplyRuntime, MAX_INBOUND_CONCURRENCY};

use keyreply_config::{Config, ReplyConfig};
use keyreply_render::{render_chain, ContentSegment, RenderOptions};
use keyreply_storage::{
    AddError, PatternError, PatternReplyStore, PatternRule, ReplyListing, SaveError,
    ScopedReplyStore, StorePolicy,
};
use regex::Regex;
use std::path::Path;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};

/// Immutable snapshot of the reply knobs, derived from [`ReplyConfig`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReplySettings {
    pub group_separate: bool,
    pub max_keywords_per_scope: usize,
    pub enable_image_reply: bool,
    pub allow_network_images: bool,
    pub default_enabled: bool,
    pub reply_with_at: bool,
}

impl Default for ReplySettings {
    fn default() -> Self {
        Self::from(&ReplyConfig::default())
    }
}

impl From<&ReplyConfig> for ReplySettings {
    fn from(config: &ReplyConfig) -> Self {
        Self {
            group_separate: config.group_separate,
            max_keywords_per_scope: config.max_keywords_per_scope,
            enable_image_reply: config.enable_image_reply,
            allow_network_images: config.allow_network_images,
            default_enabled: config.default_enabled,
            reply_with_at: config.reply_with_at,
        }
    }
}

impl ReplySettings {
    pub fn store_policy(&self) -> StorePolicy {
        StorePolicy {
            group_separate: self.group_separate,
            max_keywords_per_scope: self.max_keywords_per_scope,
        }
    }

    pub fn render_options(&self) -> RenderOptions {
        RenderOptions {
            images_enabled: self.enable_image_reply,
            allow_remote_images: self.allow_network_images,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ReplyError {
    #[error(transparent)]
    Add(#[from] AddError),
    #[error(transparent)]
    Pattern(#[from] PatternError),
    #[error("no reply found for '{0}'")]
    NotFound(String),
}

#[derive(Debug, Clone, Default)]
pub struct IncomingMessage {
    pub scope_id: Option<String>,
    pub sender_id: Option<String>,
    pub text: String,
}

impl IncomingMessage {
    pub fn new(scope_id: Option<&str>, sender_id: Option<&str>, text: &str) -> Self {
        Self {
            scope_id: scope_id.map(str::to_string),
            sender_id: sender_id.map(str::to_string),
            text: text.to_string(),
        }
    }

    fn scope(&self) -> Option<&str> {
        self.scope_id
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MatchSource {
    Keyword {
        keyword: String,
        scope_id: Option<String>,
    },
    /// 1-based position in the pattern list.
    Pattern { index: usize, pattern: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MatchedReply {
    pub source: MatchSource,
    pub raw: String,
}

struct PatternBook {
    store: PatternReplyStore,
    compiled: Vec<Option<Regex>>,
}

impl PatternBook {
    fn new(store: PatternReplyStore) -> Self {
        let mut book = Self {
            store,
            compiled: Vec::new(),
        };
        book.recompile();
        book
    }

    fn recompile(&mut self) {
        self.compiled = self
            .store
            .list()
            .iter()
            .map(|rule| match Regex::new(&rule.pattern) {
                Ok(re) => Some(re),
                Err(e) => {
                    warn!("Ignoring invalid reply pattern '{}': {}", rule.pattern, e);
                    None
                }
            })
            .collect();
    }

    fn find(&self, text: &str) -> Option<MatchedReply> {
        self.store
            .list()
            .iter()
            .zip(&self.compiled)
            .enumerate()
            .find_map(|(i, (rule, compiled))| {
                let re = compiled.as_ref()?;
                (rule.enabled && re.is_match(text)).then(|| MatchedReply {
                    source: MatchSource::Pattern {
                        index: i + 1,
                        pattern: rule.pattern.clone(),
                    },
                    raw: rule.raw.clone(),
                })
            })
    }
}

pub struct ReplyEngine {
    settings: ReplySettings,
    replies: RwLock<ScopedReplyStore>,
    patterns: RwLock<PatternBook>,
}

impl ReplyEngine {
    pub fn open(config: &Config) -> Self {
        Self::open_at(
            config.store_path(),
            config.pattern_path(),
            ReplySettings::from(&config.reply),
        )
    }

    pub fn open_at<P: AsRef<Path>, Q: AsRef<Path>>(
        store_path: P,
        pattern_path: Q,
        settings: ReplySettings,
    ) -> Self {
        let mut replies = ScopedReplyStore::load(store_path, settings.store_policy());
        let mut patterns = PatternReplyStore::load(pattern_path);

        let legacy = replies.pending_legacy_patterns().to_vec();
        if !legacy.is_empty() {
            let imported = patterns.import(legacy);
            if patterns.is_dirty() {
                warn!(
                    "Keeping legacy regex replies in {} until {} can be saved",
                    replies.path().display(),
                    patterns.path().display()
                );
            } else {
                info!("Imported {} legacy regex repl(ies)", imported);
                if let Err(e) = replies.release_legacy_patterns() {
                    error!(
                        "Failed to drop migrated regex replies from {}: {}",
                        replies.path().display(),
                        e
                    );
                }
            }
        }

        Self {
            settings,
            replies: RwLock::new(replies),
            patterns: RwLock::new(PatternBook::new(patterns)),
        }
    }

    pub fn settings(&self) -> &ReplySettings {
        &self.settings
    }

    /// Keyword lookup (ignoring case) first, then the regex fallback. `text` is not trimmed here.
    pub async fn find_reply(&self, scope_id: Option<&str>, text: &str) -> Option<MatchedReply> {
        if let Some(entry) = self.replies.read().await.lookup(scope_id, text) {
            return Some(MatchedReply {
                source: MatchSource::Keyword {
                    keyword: entry.keyword,
                    scope_id: entry.scope_id,
                },
                raw: entry.raw,
            });
        }

        self.patterns.read().await.find(text)
    }

    pub fn render(&self, raw: &str) -> Vec<ContentSegment> {
        render_chain(raw, self.settings.render_options())
    }

    /// Full reply path for one inbound message: match, render, optional mention.
    pub async fn respond(&self, message: &IncomingMessage) -> Option<Vec<ContentSegment>> {
        let text = message.text.trim();
        if text.is_empty() {
            return None;
        }

        let scope = message.scope();
        let matched = self.find_reply(scope, text).await?;
        debug!("Reply matched for {:?}: {:?}", scope, matched.source);

        let mut chain = self.render(&matched.raw);
        if chain.is_empty() {
            return None;
        }

        if self.settings.reply_with_at && scope.is_some() {
            if let Some(sender) = message
                .sender_id
                .as_deref()
                .map(str::trim)
                .filter(|s| !s.is_empty())
            {
                chain.insert(0, ContentSegment::mention(sender));
            }
        }

        Some(chain)
    }

    pub async fn add_reply(
        &self,
        scope_id: Option<&str>,
        keyword: &str,
        raw: &str,
    ) -> Result<(), ReplyError> {
        self.add_reply_with(scope_id, keyword, raw, self.settings.default_enabled)
            .await
    }

    pub async fn add_reply_with(
        &self,
        scope_id: Option<&str>,
        keyword: &str,
        raw: &str,
        enabled: bool,
    ) -> Result<(), ReplyError> {
        self.replies
            .write()
            .await
            .add(scope_id, keyword, raw, enabled)?;
        info!("Added reply '{}' (scope: {:?})", keyword.trim(), scope_id);
        Ok(())
    }

    pub async fn delete_reply(&self, scope_id: Option<&str>, keyword: &str) -> Result<(), ReplyError> {
        if self.replies.write().await.delete(scope_id, keyword) {
            info!("Deleted reply '{}' (scope: {:?})", keyword.trim(), scope_id);
            Ok(())
        } else {
            Err(ReplyError::NotFound(keyword.trim().to_string()))
        }
    }

    pub async fn set_reply_enabled(
        &self,
        scope_id: Option<&str>,
        keyword: &str,
        enabled: bool,
    ) -> Result<(), ReplyError> {
        if self
            .replies
            .write()
            .await
            .set_enabled(scope_id, keyword, enabled)
        {
            Ok(())
        } else {
            Err(ReplyError::NotFound(keyword.trim().to_string()))
        }
    }

    pub async fn list_replies(&self, scope_id: Option<&str>) -> ReplyListing {
        self.replies.read().await.list(scope_id)
    }

    pub async fn add_pattern(&self, pattern: &str, raw: &str) -> Result<usize, ReplyError> {
        let mut book = self.patterns.write().await;
        let index = book
            .store
            .add(pattern, raw, self.settings.default_enabled)?;
        book.recompile();
        info!("Added reply pattern #{} '{}'", index, pattern);
        Ok(index)
    }

    pub async fn delete_pattern(&self, index: usize) -> Result<(), ReplyError> {
        let mut book = self.patterns.write().await;
        if !book.store.remove(index) {
            return Err(ReplyError::NotFound(format!("pattern #{}", index)));
        }
        book.recompile();
        Ok(())
    }

    pub async fn set_pattern_enabled(&self, index: usize, enabled: bool) -> Result<(), ReplyError> {
        if self.patterns.write().await.store.set_enabled(index, enabled) {
            Ok(())
        } else {
            Err(ReplyError::NotFound(format!("pattern #{}", index)))
        }
    }

    pub async fn list_patterns(&self) -> Vec<PatternRule> {
        self.patterns.read().await.store.list().to_vec()
    }

    /// Retries persistence for stores whose last save failed. Pattern replies are
    /// saved first so migrated regex rules leave the keyword file only once stored.
    pub async fn flush(&self) -> Result<(), SaveError> {
        let mut book = self.patterns.write().await;
        if book.store.is_dirty() {
            book.store.save()?;
        }

        let mut replies = self.replies.write().await;
        if !replies.pending_legacy_patterns().is_empty() {
            replies.release_legacy_patterns()?;
        } else if replies.is_dirty() {
            replies.save()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::{IncomingMessage, MatchSource, ReplyEngine, ReplyError, ReplySettings};
    use keyreply_render::ContentSegment;
    use keyreply_storage::AddError;

    fn engine_with(dir: &tempfile::TempDir, settings: ReplySettings) -> ReplyEngine {
        ReplyEngine::open_at(
            dir.path().join("replies.json"),
            dir.path().join("patterns.json"),
            settings,
        )
    }

    fn engine(dir: &tempfile::TempDir) -> ReplyEngine {
        engine_with(dir, ReplySettings::default())
    }

    #[tokio::test]
    async fn respond_renders_matched_reply() {
        let dir = tempfile::tempdir().expect("tempdir");
        let engine = engine(&dir);
        engine
            .add_reply(Some("g1"), "menu", "today:\n[img]menu.png\nenjoy")
            .await
            .expect("add");

        let chain = engine
            .respond(&IncomingMessage::new(Some("g1"), Some("u1"), "  menu "))
            .await
            .expect("reply");
        assert_eq!(
            chain,
            vec![
                ContentSegment::text("today:\n"),
                ContentSegment::local_image("menu.png"),
                ContentSegment::text("enjoy"),
            ]
        );
    }

    #[tokio::test]
    async fn respond_matches_keywords_in_any_case() {
        let dir = tempfile::tempdir().expect("tempdir");
        let engine = engine(&dir);
        engine.add_reply(None, "Hello", "hi there").await.expect("add");

        for text in ["hello", "HELLO", "Hello"] {
            let chain = engine
                .respond(&IncomingMessage::new(None, None, text))
                .await
                .expect("reply");
            assert_eq!(chain, vec![ContentSegment::text("hi there")]);
        }
    }

    #[tokio::test]
    async fn respond_ignores_blank_and_unknown_messages() {
        let dir = tempfile::tempdir().expect("tempdir");
        let engine = engine(&dir);
        engine.add_reply(None, "hi", "hello").await.expect("add");

        assert!(engine
            .respond(&IncomingMessage::new(None, None, "   "))
            .await
            .is_none());
        assert!(engine
            .respond(&IncomingMessage::new(None, None, "bye"))
            .await
            .is_none());
    }

    #[tokio::test]
    async fn mention_is_prepended_only_in_group_scope() {
        let dir = tempfile::tempdir().expect("tempdir");
        let engine = engine_with(
            &dir,
            ReplySettings {
                reply_with_at: true,
                ..ReplySettings::default()
            },
        );
        engine.add_reply(None, "hi", "hello").await.expect("add");

        let in_group = engine
            .respond(&IncomingMessage::new(Some("g"), Some("42"), "hi"))
            .await
            .expect("reply");
        assert_eq!(in_group[0], ContentSegment::mention("42"));
        assert_eq!(in_group[1], ContentSegment::text("hello"));

        let private = engine
            .respond(&IncomingMessage::new(None, Some("42"), "hi"))
            .await
            .expect("reply");
        assert_eq!(private, vec![ContentSegment::text("hello")]);
    }

    #[tokio::test]
    async fn pattern_fallback_only_when_keyword_misses() {
        let dir = tempfile::tempdir().expect("tempdir");
        let engine = engine(&dir);
        engine.add_reply(None, "ping", "keyword pong").await.expect("add");
        assert_eq!(engine.add_pattern("^pi", "pattern pong").await, Ok(1));

        let keyword = engine.find_reply(None, "ping").await.expect("keyword");
        assert!(matches!(keyword.source, MatchSource::Keyword { .. }));

        let pattern = engine.find_reply(None, "pickle").await.expect("pattern");
        assert_eq!(pattern.raw, "pattern pong");
        assert!(matches!(pattern.source, MatchSource::Pattern { index: 1, .. }));

        engine.set_pattern_enabled(1, false).await.expect("disable");
        assert!(engine.find_reply(None, "pickle").await.is_none());
    }

    #[tokio::test]
    async fn invalid_pattern_is_rejected() {
        let dir = tempfile::tempdir().expect("tempdir");
        let engine = engine(&dir);
        assert!(matches!(
            engine.add_pattern("(", "x").await,
            Err(ReplyError::Pattern(_))
        ));
        assert!(engine.list_patterns().await.is_empty());
    }

    #[tokio::test]
    async fn missing_keyword_reports_not_found() {
        let dir = tempfile::tempdir().expect("tempdir");
        let engine = engine(&dir);
        assert_eq!(
            engine.delete_reply(None, "nope").await,
            Err(ReplyError::NotFound("nope".to_string()))
        );
        assert_eq!(
            engine.set_reply_enabled(Some("g"), "nope", false).await,
            Err(ReplyError::NotFound("nope".to_string()))
        );
        assert!(engine.delete_pattern(1).await.is_err());
    }

    #[tokio::test]
    async fn default_enabled_setting_applies_to_new_replies() {
        let dir = tempfile::tempdir().expect("tempdir");
        let engine = engine_with(
            &dir,
            ReplySettings {
                default_enabled: false,
                ..ReplySettings::default()
            },
        );
        engine.add_reply(None, "k", "v").await.expect("add");
        assert!(engine.find_reply(None, "k").await.is_none());
        engine
            .set_reply_enabled(None, "k", true)
            .await
            .expect("enable");
        assert!(engine.find_reply(None, "k").await.is_some());
    }

    #[tokio::test]
    async fn capacity_error_surfaces_as_typed_result() {
        let dir = tempfile::tempdir().expect("tempdir");
        let engine = engine_with(
            &dir,
            ReplySettings {
                max_keywords_per_scope: 1,
                ..ReplySettings::default()
            },
        );
        engine.add_reply(Some("g"), "a", "1").await.expect("first");
        assert_eq!(
            engine.add_reply(Some("g"), "b", "2").await,
            Err(ReplyError::Add(AddError::CapacityExceeded { limit: 1 }))
        );
    }

    #[tokio::test]
    async fn image_replies_can_be_disabled() {
        let dir = tempfile::tempdir().expect("tempdir");
        let engine = engine_with(
            &dir,
            ReplySettings {
                enable_image_reply: false,
                ..ReplySettings::default()
            },
        );
        engine.add_reply(None, "cat", "cat.png").await.expect("add");
        let chain = engine
            .respond(&IncomingMessage::new(None, None, "cat"))
            .await
            .expect("reply");
        assert_eq!(chain, vec![ContentSegment::text("cat.png")]);
    }
}
