//! Journal entry model

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;
use std::sync::OnceLock;
use uuid::Uuid;

use super::sync_record::EntityRef;
use crate::error::Error;

/// Table name journal entries are tracked under for sync.
pub const ENTRIES_TABLE: &str = "entries";

/// A unique identifier for a journal entry, using UUID v7 (time-sortable)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EntryId(Uuid);

impl EntryId {
    /// Create a new unique entry ID using UUID v7
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    /// Get the string representation of this ID
    #[must_use]
    pub fn as_str(&self) -> String {
        self.0.to_string()
    }

    /// The sync entity reference for this entry (`entries:<id>`).
    #[must_use]
    pub fn entity_ref(&self) -> EntityRef {
        EntityRef::new(ENTRIES_TABLE, self.as_str())
    }

    /// Recover the entry id from an `entries:<id>` reference.
    pub fn from_entity_ref(entity: &EntityRef) -> Result<Self, Error> {
        if entity.table() != ENTRIES_TABLE {
            return Err(Error::InvalidEntityRef(entity.to_string()));
        }
        entity
            .local_id()
            .parse()
            .map_err(|_| Error::InvalidEntityRef(entity.to_string()))
    }
}

impl Default for EntryId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for EntryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for EntryId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

/// A journal entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entry {
    /// Unique identifier
    pub id: EntryId,
    /// Plain text content
    pub content: String,
    /// Creation timestamp (Unix ms)
    pub created_at: i64,
    /// Last update timestamp (Unix ms)
    pub updated_at: i64,
}

impl Entry {
    /// Create a new entry with the given content, stamped at `now_ms`
    #[must_use]
    pub fn new(content: impl Into<String>, now_ms: i64) -> Self {
        Self {
            id: EntryId::new(),
            content: content.into(),
            created_at: now_ms,
            updated_at: now_ms,
        }
    }

    /// The sync entity reference for this entry.
    #[must_use]
    pub fn entity_ref(&self) -> EntityRef {
        self.id.entity_ref()
    }

    /// Extract #tags from content
    #[must_use]
    pub fn tags(&self) -> Vec<String> {
        extract_tags(&self.content)
    }

    /// Get first line as title preview, truncated to `max_len` characters
    #[must_use]
    pub fn title_preview(&self, max_len: usize) -> String {
        self.content
            .lines()
            .next()
            .unwrap_or("")
            .chars()
            .take(max_len)
            .collect()
    }

    /// Check if entry content is empty (whitespace-only counts as empty)
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.content.trim().is_empty()
    }
}

fn tag_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"#([a-zA-Z][a-zA-Z0-9_-]*)").expect("Invalid regex"))
}

/// Extract #tags from text
///
/// Valid tags match the pattern: `#[a-zA-Z][a-zA-Z0-9_-]*`
/// Tags are returned in lowercase and deduplicated.
///
/// # Examples
///
/// ```
/// use jotter_core::models::extract_tags;
///
/// let tags = extract_tags("Slept badly #health, long walk #Outdoors");
/// assert!(tags.contains(&"health".to_string()));
/// assert!(tags.contains(&"outdoors".to_string()));
/// ```
#[must_use]
pub fn extract_tags(text: &str) -> Vec<String> {
    tag_pattern()
        .captures_iter(text)
        .map(|cap| cap[1].to_lowercase())
        .collect::<HashSet<_>>()
        .into_iter()
        .collect()
}
