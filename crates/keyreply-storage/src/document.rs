//! Persisted keyword document and legacy migration
//!
//! Current shape: `{"global": {kw: {raw, enabled}}, "scopes": {scope: {kw: {...}}}}`.
//! Older plugin versions wrote a flat `keyword -> string | {type, content, ...}` map.

use crate::error::LoadError;
use crate::patterns::PatternRule;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use tracing::warn;

pub const IMAGE_MARKER: &str = "[图片]";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredReply {
    pub raw: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

impl StoredReply {
    pub fn new(raw: impl Into<String>, enabled: bool) -> Self {
        Self {
            raw: raw.into(),
            enabled,
        }
    }
}

pub type Bucket = BTreeMap<String, StoredReply>;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplyDocument {
    #[serde(default)]
    pub global: Bucket,
    #[serde(default)]
    pub scopes: BTreeMap<String, Bucket>,
}

impl ReplyDocument {
    pub fn total_entries(&self) -> usize {
        self.global.len() + self.scopes.values().map(BTreeMap::len).sum::<usize>()
    }
}

#[derive(Debug, Default)]
pub struct ParsedDocument {
    pub document: ReplyDocument,
    /// Regex replies found in a legacy document; they belong to the pattern store.
    pub legacy_patterns: Vec<PatternRule>,
    /// The on-disk form differs from what would be written back.
    pub needs_rewrite: bool,
}

fn default_true() -> bool {
    true
}

enum Converted {
    Reply(StoredReply, bool),
    Pattern(PatternRule),
    Skip,
}

/// Every value is itself an object. Legacy entries carry string or bool fields
/// (`type`, `content`, `raw`), so a legacy keyword named `global` fails this.
fn is_bucket_of_entries(value: &Value) -> bool {
    value
        .as_object()
        .is_some_and(|bucket| bucket.values().all(Value::is_object))
}

fn is_current_shape(map: &Map<String, Value>) -> bool {
    !map.is_empty()
        && map.iter().all(|(key, value)| match key.as_str() {
            "global" => is_bucket_of_entries(value),
            "scopes" => value
                .as_object()
                .is_some_and(|scopes| scopes.values().all(is_bucket_of_entries)),
            _ => false,
        })
}

/// Serializes `document` with not-yet-imported regex replies kept in `global`
/// in their legacy form, so a later load can recover them.
pub(crate) fn with_pending_patterns(
    document: &ReplyDocument,
    patterns: &[PatternRule],
) -> Result<Value, serde_json::Error> {
    let mut value = serde_json::to_value(document)?;
    if let Some(Value::Object(global)) = value.get_mut("global") {
        let mut n = 0;
        for rule in patterns {
            while global.contains_key(&format!("regex_{}", n)) {
                n += 1;
            }
            global.insert(
                format!("regex_{}", n),
                json!({
                    "type": "regex",
                    "pattern": rule.pattern,
                    "content": rule.raw,
                    "enabled": rule.enabled,
                }),
            );
        }
    }
    Ok(value)
}

fn mixed_to_raw(content: &str) -> String {
    match content.rsplit_once('|') {
        Some((text, image)) if !image.trim().is_empty() => {
            let text = text.trim();
            if text.is_empty() {
                format!("{}{}", IMAGE_MARKER, image.trim())
            } else {
                format!("{} {}{}", text, IMAGE_MARKER, image.trim())
            }
        }
        _ => content.to_string(),
    }
}

fn convert_entry(keyword: &str, value: &Value) -> Converted {
    let obj = match value {
        Value::String(raw) => return Converted::Reply(StoredReply::new(raw.clone(), true), true),
        Value::Object(obj) => obj,
        _ => return Converted::Skip,
    };

    let enabled = obj.get("enabled").and_then(Value::as_bool).unwrap_or(true);

    if let Some(raw) = obj.get("raw").and_then(Value::as_str) {
        let canonical = obj.len() == 2 && obj.get("enabled").is_some_and(Value::is_boolean);
        return Converted::Reply(StoredReply::new(raw, enabled), !canonical);
    }

    let reply_type = obj
        .get("type")
        .and_then(Value::as_str)
        .map(|t| t.trim().to_lowercase())
        .unwrap_or_else(|| "text".to_string());

    if reply_type == "regex" {
        return match (
            obj.get("pattern").and_then(Value::as_str),
            obj.get("content").and_then(Value::as_str),
        ) {
            (Some(pattern), Some(content)) => Converted::Pattern(PatternRule {
                pattern: pattern.to_string(),
                raw: content.to_string(),
                enabled,
            }),
            _ => Converted::Skip,
        };
    }

    let Some(content) = obj.get("content").and_then(Value::as_str) else {
        warn!("Skipping reply '{}': no raw or content field", keyword);
        return Converted::Skip;
    };

    let raw = match reply_type.as_str() {
        "图片" | "image" => format!("{}{}", IMAGE_MARKER, content.trim()),
        "混合" | "mixed" => mixed_to_raw(content),
        _ => content.to_string(),
    };
    Converted::Reply(StoredReply::new(raw, enabled), true)
}

fn convert_bucket(
    map: &Map<String, Value>,
    patterns: &mut Vec<PatternRule>,
    needs_rewrite: &mut bool,
) -> Bucket {
    let mut bucket = Bucket::new();
    for (keyword, value) in map {
        match convert_entry(keyword, value) {
            Converted::Reply(reply, rewritten) => {
                let trimmed = keyword.trim();
                if trimmed.is_empty() {
                    warn!("Skipping reply with empty keyword");
                    *needs_rewrite = true;
                    continue;
                }
                *needs_rewrite |= rewritten || trimmed != keyword;
                bucket.insert(trimmed.to_string(), reply);
            }
            Converted::Pattern(rule) => {
                patterns.push(rule);
                *needs_rewrite = true;
            }
            Converted::Skip => {
                warn!("Skipping unrecognized reply entry '{}'", keyword);
                *needs_rewrite = true;
            }
        }
    }
    bucket
}

/// Parses a persisted document, migrating legacy single-level shapes into `global`.
pub fn parse_document(content: &str) -> Result<ParsedDocument, LoadError> {
    if content.trim().is_empty() {
        return Err(LoadError::Empty);
    }

    let value: Value = serde_json::from_str(content)?;
    let Value::Object(root) = value else {
        return Err(LoadError::Shape(
            "top-level value is not an object".to_string(),
        ));
    };

    let mut parsed = ParsedDocument::default();

    if is_current_shape(&root) {
        if let Some(Value::Object(global)) = root.get("global") {
            parsed.document.global =
                convert_bucket(global, &mut parsed.legacy_patterns, &mut parsed.needs_rewrite);
        }
        if let Some(Value::Object(scopes)) = root.get("scopes") {
            for (scope_id, bucket) in scopes {
                let Value::Object(bucket) = bucket else {
                    warn!("Skipping scope '{}': not an object", scope_id);
                    parsed.needs_rewrite = true;
                    continue;
                };
                let converted =
                    convert_bucket(bucket, &mut parsed.legacy_patterns, &mut parsed.needs_rewrite);
                if converted.is_empty() {
                    parsed.needs_rewrite = true;
                    continue;
                }
                parsed.document.scopes.insert(scope_id.clone(), converted);
            }
        }
        parsed.needs_rewrite |= !(root.contains_key("global") && root.contains_key("scopes"));
    } else {
        parsed.document.global =
            convert_bucket(&root, &mut parsed.legacy_patterns, &mut parsed.needs_rewrite);
        parsed.needs_rewrite = true;
    }

    Ok(parsed)
}
