//! Auxiliary regex replies, kept apart from the keyword document

use crate::error::{LoadError, PatternError, SaveError};
use crate::persist::{read_or_recover, write_json_atomic};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{error, info};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatternRule {
    pub pattern: String,
    pub raw: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

fn default_true() -> bool {
    true
}

fn parse_rules(content: &str) -> Result<Vec<PatternRule>, LoadError> {
    if content.trim().is_empty() {
        return Err(LoadError::Empty);
    }
    Ok(serde_json::from_str(content)?)
}

pub fn validate_pattern(pattern: &str) -> Result<(), PatternError> {
    if pattern.trim().is_empty() {
        return Err(PatternError::EmptyPattern);
    }
    Regex::new(pattern).map_err(|e| PatternError::InvalidPattern {
        pattern: pattern.to_string(),
        reason: e.to_string(),
    })?;
    Ok(())
}

pub struct PatternReplyStore {
    path: PathBuf,
    rules: Vec<PatternRule>,
    dirty: bool,
}

impl PatternReplyStore {
    pub fn load<P: AsRef<Path>>(path: P) -> Self {
        let path = path.as_ref().to_path_buf();
        let mut store = Self {
            path,
            rules: Vec::new(),
            dirty: false,
        };

        match read_or_recover(&store.path, "pattern replies", parse_rules) {
            Some(rules) => {
                info!(
                    "Loaded {} pattern repl(ies) from {}",
                    rules.len(),
                    store.path.display()
                );
                store.rules = rules;
            }
            None => store.persist(),
        }
        store
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn list(&self) -> &[PatternRule] {
        &self.rules
    }

    pub fn save(&mut self) -> Result<(), SaveError> {
        let result = write_json_atomic(&self.path, &self.rules);
        self.dirty = result.is_err();
        result
    }

    fn persist(&mut self) {
        if let Err(e) = self.save() {
            error!("Failed to save pattern replies: {}", e);
        }
    }

    /// Appends a rule and returns its 1-based index.
    pub fn add(&mut self, pattern: &str, raw: &str, enabled: bool) -> Result<usize, PatternError> {
        validate_pattern(pattern)?;
        self.rules.push(PatternRule {
            pattern: pattern.to_string(),
            raw: raw.to_string(),
            enabled,
        });
        self.persist();
        Ok(self.rules.len())
    }

    /// Merges rules recovered from a legacy keyword document, skipping duplicates.
    pub fn import(&mut self, rules: Vec<PatternRule>) -> usize {
        let mut imported = 0;
        for rule in rules {
            if validate_pattern(&rule.pattern).is_err() {
                continue;
            }
            if self.rules.iter().any(|r| r.pattern == rule.pattern) {
                continue;
            }
            self.rules.push(rule);
            imported += 1;
        }
        if imported > 0 {
            self.persist();
        }
        imported
    }

    pub fn remove(&mut self, index: usize) -> bool {
        if index == 0 || index > self.rules.len() {
            return false;
        }
        self.rules.remove(index - 1);
        self.persist();
        true
    }

    pub fn set_enabled(&mut self, index: usize, enabled: bool) -> bool {
        let Some(rule) = index
            .checked_sub(1)
            .and_then(|i| self.rules.get_mut(i))
        else {
            return false;
        };
        rule.enabled = enabled;
        self.persist();
        true
    }
}
