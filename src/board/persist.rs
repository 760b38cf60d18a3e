//! Session-scoped persistence of the board's filter configuration, so a
//! user navigating away and back finds the board filtered as they left it.

use anyhow::{Context, Result};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing::{debug, warn};

use super::filter::FilterConfig;

pub trait FilterStateStore: Send {
    /// Previously saved config, or `None` when nothing usable is stored.
    fn load(&self) -> Option<FilterConfig>;

    fn save(&self, config: &FilterConfig) -> Result<()>;
}

/// One JSON file per session under a state directory.
pub struct JsonFileStore {
    path: PathBuf,
}

impl JsonFileStore {
    pub fn for_session(dir: &Path, session_id: &str) -> Self {
        JsonFileStore {
            path: dir.join(format!("propscope-filters-{}.json", session_id)),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl FilterStateStore for JsonFileStore {
    fn load(&self) -> Option<FilterConfig> {
        let text = match std::fs::read_to_string(&self.path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("No saved filters at {}", self.path.display());
                return None;
            }
            Err(e) => {
                warn!("Failed to read saved filters {}: {}", self.path.display(), e);
                return None;
            }
        };
        match serde_json::from_str(&text) {
            Ok(config) => Some(config),
            Err(e) => {
                warn!(
                    "Ignoring unreadable saved filters {}: {}",
                    self.path.display(),
                    e
                );
                None
            }
        }
    }

    fn save(&self, config: &FilterConfig) -> Result<()> {
        if let Some(dir) = self.path.parent() {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create {}", dir.display()))?;
        }
        let json = serde_json::to_string_pretty(config)?;
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, json)
            .with_context(|| format!("Failed to write {}", tmp.display()))?;
        std::fs::rename(&tmp, &self.path)
            .with_context(|| format!("Failed to replace {}", self.path.display()))?;
        Ok(())
    }
}

/// Keeps the config for the life of the process only.
#[derive(Clone, Default)]
pub struct MemoryStore {
    saved: Arc<Mutex<Option<FilterConfig>>>,
}

impl FilterStateStore for MemoryStore {
    fn load(&self) -> Option<FilterConfig> {
        self.saved.lock().ok().and_then(|saved| saved.clone())
    }

    fn save(&self, config: &FilterConfig) -> Result<()> {
        let mut saved = self
            .saved
            .lock()
            .map_err(|_| anyhow::anyhow!("filter state mutex poisoned"))?;
        *saved = Some(config.clone());
        Ok(())
    }
}

/// Opens the filter store belonging to one session.
pub trait SessionStores: Send {
    fn open(&self, session_id: &str) -> Box<dyn FilterStateStore>;
}

/// Per-session JSON files under one directory.
pub struct JsonFileSessions {
    dir: PathBuf,
}

impl JsonFileSessions {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        JsonFileSessions { dir: dir.into() }
    }
}

impl SessionStores for JsonFileSessions {
    fn open(&self, session_id: &str) -> Box<dyn FilterStateStore> {
        let store = JsonFileStore::for_session(&self.dir, session_id);
        debug!("Session {} filters at {}", session_id, store.path().display());
        Box::new(store)
    }
}

/// In-process sessions. Reopening a session id returns the same store, so a
/// session dropped from the board still finds its filters.
#[derive(Clone, Default)]
pub struct MemorySessions {
    stores: Arc<Mutex<HashMap<String, MemoryStore>>>,
}

impl SessionStores for MemorySessions {
    fn open(&self, session_id: &str) -> Box<dyn FilterStateStore> {
        let store = match self.stores.lock() {
            Ok(mut stores) => stores.entry(session_id.to_string()).or_default().clone(),
            Err(_) => {
                warn!("Session store mutex poisoned; {} starts fresh", session_id);
                MemoryStore::default()
            }
        };
        Box::new(store)
    }
}

/// Session ids name files, so only `[A-Za-z0-9_-]{1,64}` is accepted.
pub fn valid_session_id(session_id: &str) -> bool {
    !session_id.is_empty()
        && session_id.len() <= 64
        && session_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}
