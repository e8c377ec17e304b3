//! Keyreply Storage
//!
//! Scope-partitioned keyword reply store with atomic JSON persistence

mod document;
mod error;
mod patterns;
mod persist;

pub use document::{parse_document, Bucket, ParsedDocument, ReplyDocument, StoredReply};
pub use error::{AddError, LoadError, PatternError, SaveError};
pub use patterns::{validate_pattern, PatternReplyStore, PatternRule};

use document::with_pending_patterns;
use persist::{read_or_recover, write_json_atomic};
use std::path::{Path, PathBuf};
use tracing::{debug, error, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StorePolicy {
    /// When false every insert goes to the global bucket and lookups ignore scope buckets.
    pub group_separate: bool,
    pub max_keywords_per_scope: usize,
}

impl Default for StorePolicy {
    fn default() -> Self {
        Self {
            group_separate: true,
            max_keywords_per_scope: 50,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplyEntry {
    pub keyword: String,
    pub raw: String,
    pub enabled: bool,
    /// Owning scope bucket; `None` for global.
    pub scope_id: Option<String>,
}

impl ReplyEntry {
    fn from_stored(keyword: &str, stored: &StoredReply, scope_id: Option<&str>) -> Self {
        Self {
            keyword: keyword.to_string(),
            raw: stored.raw.clone(),
            enabled: stored.enabled,
            scope_id: scope_id.map(str::to_string),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReplyListing {
    pub global: Vec<ReplyEntry>,
    pub scope: Vec<ReplyEntry>,
}

fn normalize_scope(scope_id: Option<&str>) -> Option<&str> {
    scope_id.map(str::trim).filter(|s| !s.is_empty())
}

/// Enabled entry whose keyword equals `message` ignoring case. A key with the
/// exact casing wins over other spellings.
fn find_enabled<'a>(bucket: &'a Bucket, message: &str) -> Option<(&'a str, &'a StoredReply)> {
    if let Some((keyword, stored)) = bucket.get_key_value(message) {
        if stored.enabled {
            return Some((keyword.as_str(), stored));
        }
    }

    let folded = message.to_lowercase();
    bucket
        .iter()
        .find(|(keyword, stored)| stored.enabled && keyword.to_lowercase() == folded)
        .map(|(keyword, stored)| (keyword.as_str(), stored))
}

pub struct ScopedReplyStore {
    path: PathBuf,
    policy: StorePolicy,
    document: ReplyDocument,
    legacy_patterns: Vec<PatternRule>,
    dirty: bool,
}

impl ScopedReplyStore {
    /// Loads the store from `path`. Never fails: a missing, empty or malformed
    /// document resets to an empty store which is persisted immediately.
    pub fn load<P: AsRef<Path>>(path: P, policy: StorePolicy) -> Self {
        let mut store = Self {
            path: path.as_ref().to_path_buf(),
            policy,
            document: ReplyDocument::default(),
            legacy_patterns: Vec::new(),
            dirty: false,
        };

        match read_or_recover(&store.path, "reply store", parse_document) {
            Some(parsed) => {
                store.document = parsed.document;
                store.legacy_patterns = parsed.legacy_patterns;
                info!(
                    "Loaded {} keyword repl(ies) from {}",
                    store.document.total_entries(),
                    store.path.display()
                );
                if parsed.needs_rewrite {
                    info!("Migrating reply store at {} to current layout", store.path.display());
                    store.persist();
                }
            }
            None => store.persist(),
        }

        store
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn policy(&self) -> StorePolicy {
        self.policy
    }

    pub fn document(&self) -> &ReplyDocument {
        &self.document
    }

    /// True while the latest save attempt failed.
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Regex replies found in a legacy document that the pattern store has not
    /// confirmed yet. They keep being written back in legacy form until released.
    pub fn pending_legacy_patterns(&self) -> &[PatternRule] {
        &self.legacy_patterns
    }

    /// Drops the pending regex replies from the keyword file. Call only once they
    /// are saved elsewhere.
    pub fn release_legacy_patterns(&mut self) -> Result<(), SaveError> {
        if self.legacy_patterns.is_empty() {
            return Ok(());
        }
        let released = std::mem::take(&mut self.legacy_patterns);
        let result = self.save();
        if result.is_err() {
            self.legacy_patterns = released;
        }
        result
    }

    pub fn save(&mut self) -> Result<(), SaveError> {
        let result = if self.legacy_patterns.is_empty() {
            write_json_atomic(&self.path, &self.document)
        } else {
            with_pending_patterns(&self.document, &self.legacy_patterns)
                .map_err(SaveError::from)
                .and_then(|value| write_json_atomic(&self.path, &value))
        };
        self.dirty = result.is_err();
        result
    }

    fn persist(&mut self) {
        if let Err(e) = self.save() {
            error!(
                "Failed to save reply store to {}: {}",
                self.path.display(),
                e
            );
        }
    }

    fn target_scope<'a>(&self, scope_id: Option<&'a str>) -> Option<&'a str> {
        if self.policy.group_separate {
            normalize_scope(scope_id)
        } else {
            None
        }
    }

    /// Entries counted against the limit for `scope_id`: global plus that scope's bucket.
    pub fn scope_count(&self, scope_id: Option<&str>) -> usize {
        let scoped = normalize_scope(scope_id)
            .and_then(|scope| self.document.scopes.get(scope))
            .map_or(0, |bucket| bucket.len());
        self.document.global.len() + scoped
    }

    pub fn add(
        &mut self,
        scope_id: Option<&str>,
        keyword: &str,
        raw: &str,
        enabled: bool,
    ) -> Result<(), AddError> {
        let keyword = keyword.trim();
        if keyword.is_empty() {
            return Err(AddError::EmptyKeyword);
        }

        let target = self.target_scope(scope_id);
        let overwrite = match target {
            Some(scope) => self
                .document
                .scopes
                .get(scope)
                .is_some_and(|bucket| bucket.contains_key(keyword)),
            None => self.document.global.contains_key(keyword),
        };

        if !overwrite && self.scope_count(scope_id) >= self.policy.max_keywords_per_scope {
            return Err(AddError::CapacityExceeded {
                limit: self.policy.max_keywords_per_scope,
            });
        }

        let bucket = match target {
            Some(scope) => self.document.scopes.entry(scope.to_string()).or_default(),
            None => &mut self.document.global,
        };
        bucket.insert(keyword.to_string(), StoredReply::new(raw, enabled));
        debug!(
            "Stored reply '{}' in {}",
            keyword,
            target.unwrap_or("global")
        );

        self.persist();
        Ok(())
    }

    /// Removes `keyword`, trying the scope bucket before the global one.
    pub fn delete(&mut self, scope_id: Option<&str>, keyword: &str) -> bool {
        let keyword = keyword.trim();
        let mut removed = false;

        if let Some(scope) = normalize_scope(scope_id) {
            if let Some(bucket) = self.document.scopes.get_mut(scope) {
                removed = bucket.remove(keyword).is_some();
                if bucket.is_empty() {
                    self.document.scopes.remove(scope);
                }
            }
        }

        if !removed {
            removed = self.document.global.remove(keyword).is_some();
        }

        if removed {
            self.persist();
        }
        removed
    }

    pub fn set_enabled(&mut self, scope_id: Option<&str>, keyword: &str, enabled: bool) -> bool {
        let keyword = keyword.trim();
        let scoped = normalize_scope(scope_id)
            .and_then(|scope| self.document.scopes.get_mut(scope))
            .and_then(|bucket| bucket.get_mut(keyword));

        let entry = match scoped {
            Some(entry) => Some(entry),
            None => self.document.global.get_mut(keyword),
        };

        match entry {
            Some(entry) => {
                entry.enabled = enabled;
                self.persist();
                true
            }
            None => false,
        }
    }

    /// Case-insensitive match against the scope bucket, then global. Disabled
    /// entries never match.
    pub fn lookup(&self, scope_id: Option<&str>, message: &str) -> Option<ReplyEntry> {
        if let Some(scope) = self.target_scope(scope_id) {
            let hit = self
                .document
                .scopes
                .get(scope)
                .and_then(|bucket| find_enabled(bucket, message));
            if let Some((keyword, stored)) = hit {
                return Some(ReplyEntry::from_stored(keyword, stored, Some(scope)));
            }
        }

        find_enabled(&self.document.global, message)
            .map(|(keyword, stored)| ReplyEntry::from_stored(keyword, stored, None))
    }

    pub fn list(&self, scope_id: Option<&str>) -> ReplyListing {
        let global = self
            .document
            .global
            .iter()
            .map(|(keyword, stored)| ReplyEntry::from_stored(keyword, stored, None))
            .collect();

        let scope = normalize_scope(scope_id)
            .and_then(|scope| {
                self.document.scopes.get(scope).map(|bucket| {
                    bucket
                        .iter()
                        .map(|(keyword, stored)| {
                            ReplyEntry::from_stored(keyword, stored, Some(scope))
                        })
                        .collect()
                })
            })
            .unwrap_or_default();

        ReplyListing { global, scope }
    }
}
