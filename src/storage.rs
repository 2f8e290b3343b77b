//! Persistence: app directory resolution, atomic JSON files, and the store
//! contracts the conversation engine talks to.
//!
//! The engine does not care what backs a store; it only needs
//! `save`/`load`/`list` for conversations and append/latest for summaries,
//! with last-write-wins consistency (one active client per conversation id).

use crate::compactor::SessionSummary;
use crate::conversation::Conversation;
use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::{Path, PathBuf};

pub fn tandem_dir() -> Result<PathBuf> {
    if let Ok(path) = std::env::var("TANDEM_HOME") {
        return Ok(PathBuf::from(path));
    }

    let home = dirs::home_dir().ok_or_else(|| anyhow::anyhow!("No home directory"))?;
    Ok(home.join(".tandem"))
}

pub fn ensure_dir(path: &Path) -> Result<()> {
    if !path.exists() {
        std::fs::create_dir_all(path)?;
    }
    Ok(())
}

pub fn write_json<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        ensure_dir(parent)?;
    }

    let tmp_path = path.with_extension("tmp");
    let file = std::fs::File::create(&tmp_path)?;
    let mut writer = std::io::BufWriter::new(file);
    serde_json::to_writer(&mut writer, value)?;
    writer.flush()?;
    std::fs::rename(tmp_path, path)?;
    Ok(())
}

pub fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let data = std::fs::read_to_string(path)?;
    Ok(serde_json::from_str(&data)?)
}

/// Listing entry for a saved conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredEntry {
    pub id: String,
    pub display_name: String,
    pub updated_at: DateTime<Utc>,
}

/// Persistence contract for conversation state.
pub trait SessionStore: Send + Sync {
    fn save(&self, state: &Conversation) -> Result<()>;
    fn load(&self, id: &str) -> Result<Option<Conversation>>;
    /// Most-recent-first.
    fn list(&self) -> Result<Vec<StoredEntry>>;
}

/// Append-only store for compaction summaries.
pub trait SummaryStore: Send + Sync {
    fn append(&self, summary: &SessionSummary) -> Result<()>;
    fn latest(&self) -> Result<Option<SessionSummary>>;
}

/// Filesystem-backed conversation store: one JSON file per conversation
/// under `<root>/<id>.json`.
pub struct FsSessionStore {
    root: PathBuf,
}

impl FsSessionStore {
    pub fn open() -> Result<Self> {
        Ok(Self {
            root: tandem_dir()?.join("conversations"),
        })
    }

    pub fn with_root(root: PathBuf) -> Self {
        Self { root }
    }

    fn path_for(&self, id: &str) -> PathBuf {
        self.root.join(format!("{}.json", id))
    }
}

impl SessionStore for FsSessionStore {
    fn save(&self, state: &Conversation) -> Result<()> {
        write_json(&self.path_for(&state.id), state)
    }

    fn load(&self, id: &str) -> Result<Option<Conversation>> {
        let path = self.path_for(id);
        if !path.exists() {
            return Ok(None);
        }
        Ok(Some(read_json(&path)?))
    }

    fn list(&self) -> Result<Vec<StoredEntry>> {
        let mut entries = Vec::new();
        if !self.root.exists() {
            return Ok(entries);
        }
        for entry in std::fs::read_dir(&self.root)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            // Unreadable records are skipped, not fatal for listing
            let Ok(state) = read_json::<Conversation>(&path) else {
                continue;
            };
            entries.push(StoredEntry {
                display_name: state.display_name.clone().unwrap_or_else(|| state.id.clone()),
                id: state.id,
                updated_at: state.updated_at,
            });
        }
        entries.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(entries)
    }
}

/// Filesystem-backed summary store: one JSON file per summary, never
/// rewritten after creation.
pub struct FsSummaryStore {
    root: PathBuf,
}

impl FsSummaryStore {
    pub fn open() -> Result<Self> {
        Ok(Self {
            root: tandem_dir()?.join("summaries"),
        })
    }

    pub fn with_root(root: PathBuf) -> Self {
        Self { root }
    }
}

impl SummaryStore for FsSummaryStore {
    fn append(&self, summary: &SessionSummary) -> Result<()> {
        write_json(&self.root.join(format!("{}.json", summary.id)), summary)
    }

    fn latest(&self) -> Result<Option<SessionSummary>> {
        if !self.root.exists() {
            return Ok(None);
        }
        let mut newest: Option<SessionSummary> = None;
        for entry in std::fs::read_dir(&self.root)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let Ok(summary) = read_json::<SessionSummary>(&path) else {
                continue;
            };
            let is_newer = newest
                .as_ref()
                .map(|current| summary.created_at > current.created_at)
                .unwrap_or(true);
            if is_newer {
                newest = Some(summary);
            }
        }
        Ok(newest)
    }
}
