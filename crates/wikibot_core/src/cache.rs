use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde_json::Value;

/// Per-script on-disk state, one JSON file per (family, code) pair under the
/// state directory. Read once at start, written once at end; concurrent
/// writers are not protected against, an accepted limitation.
#[derive(Debug)]
pub struct BotCache {
    path: PathBuf,
    entries: BTreeMap<String, Value>,
    dirty: bool,
}

impl BotCache {
    pub fn open(state_dir: &Path, family: &str, code: &str) -> Result<Self> {
        let path = state_dir.join(format!("{family}-{code}.json"));
        let entries = if path.exists() {
            let content = fs::read_to_string(&path)
                .with_context(|| format!("failed to read {}", path.display()))?;
            serde_json::from_str(&content)
                .with_context(|| format!("failed to parse {}", path.display()))?
        } else {
            BTreeMap::new()
        };
        Ok(Self {
            path,
            entries,
            dirty: false,
        })
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.entries.get(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    pub fn set(&mut self, key: impl Into<String>, value: Value) {
        self.entries.insert(key.into(), value);
        self.dirty = true;
    }

    pub fn remove(&mut self, key: &str) -> Option<Value> {
        let removed = self.entries.remove(key);
        if removed.is_some() {
            self.dirty = true;
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Persist the cache if anything changed since opening.
    pub fn save(&mut self) -> Result<()> {
        if !self.dirty {
            return Ok(());
        }
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        let rendered =
            serde_json::to_string_pretty(&self.entries).context("failed to serialize cache")?;
        fs::write(&self.path, rendered)
            .with_context(|| format!("failed to write {}", self.path.display()))?;
        self.dirty = false;
        Ok(())
    }
}
