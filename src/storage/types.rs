use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Folder every newly parsed or subscribed source lands in.
pub const UNCATEGORIZED: &str = "uncategorized";

// ============================================================================
// Persisted Model
// ============================================================================

/// One item of a feed.
///
/// The link URL is the identity of an entry within its [`Source`]: no two
/// entries of the same source share a `url`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Entry {
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub author: String,
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub read: bool,
    #[serde(default)]
    pub body: String,
}

impl Entry {
    /// Unread entry with no author or body.
    pub fn new(title: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            author: String::new(),
            url: url.into(),
            read: false,
            body: String::new(),
        }
    }
}

/// One subscribed feed together with every entry ever discovered for it.
///
/// Identity is the feed `url`, which stays stable across refreshes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Source {
    pub last_fetched: DateTime<Utc>,
    #[serde(default)]
    pub title: String,
    pub url: String,
    #[serde(default = "default_folder")]
    pub folder: String,
    #[serde(default)]
    pub entries: Vec<Entry>,
}

fn default_folder() -> String {
    UNCATEGORIZED.to_string()
}

impl Source {
    /// Empty source in the uncategorized folder.
    pub fn new(title: impl Into<String>, url: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            last_fetched: now,
            title: title.into(),
            url: url.into(),
            folder: default_folder(),
            entries: Vec::new(),
        }
    }

    pub fn has_unread(&self) -> bool {
        self.entries.iter().any(|e| !e.read)
    }

    pub fn unread_count(&self) -> usize {
        self.entries.iter().filter(|e| !e.read).count()
    }
}

/// Root aggregate: folder name to the ordered sources it holds.
///
/// Serializes as `{"Folders": {...}}`. A `BTreeMap` keeps the encoded
/// document deterministic for a given in-memory state.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct State {
    #[serde(default)]
    pub folders: BTreeMap<String, Vec<Source>>,
}

impl State {
    /// Build a state holding `sources` in the uncategorized folder.
    pub fn with_uncategorized(sources: Vec<Source>) -> Self {
        let mut folders = BTreeMap::new();
        folders.insert(UNCATEGORIZED.to_string(), sources);
        Self { folders }
    }

    /// Iterate every source of every folder.
    pub fn sources(&self) -> impl Iterator<Item = &Source> {
        self.folders.values().flatten()
    }

    pub fn sources_mut(&mut self) -> impl Iterator<Item = &mut Source> {
        self.folders.values_mut().flatten()
    }

    /// Whether any folder already holds a source with this feed URL.
    pub fn contains_feed(&self, url: &str) -> bool {
        self.sources().any(|s| s.url == url)
    }

    /// Source with the given feed URL inside `folder`.
    pub fn find_source_mut(&mut self, folder: &str, url: &str) -> Option<&mut Source> {
        self.folders
            .get_mut(folder)?
            .iter_mut()
            .find(|s| s.url == url)
    }

    pub fn source_count(&self) -> usize {
        self.folders.values().map(Vec::len).sum()
    }
}

// ============================================================================
// Read Views
// ============================================================================

/// A source reduced to its unread entries, as handed to the web layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UnreadSource {
    pub title: String,
    pub url: String,
    pub entries: Vec<Entry>,
}

/// Folder name to sources that still have unread entries.
pub type UnreadView = BTreeMap<String, Vec<UnreadSource>>;
