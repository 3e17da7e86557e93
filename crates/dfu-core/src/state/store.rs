//! Session persistence across reloads.
//!
//! Two keys are stored: the state tag and the serial of the device in flight.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use super::machine::FlashState;
use crate::error::StoreError;

pub const STATE_KEY: &str = "flash_state";
pub const SERIAL_KEY: &str = "flash_serial";

/// Key/value store that outlives one process run.
pub trait SessionStore: Send {
    fn get(&self, key: &str) -> Option<String>;
    fn set(&mut self, key: &str, value: &str) -> Result<(), StoreError>;
    fn remove(&mut self, key: &str) -> Result<(), StoreError>;
}

/// Store scoped to the current process.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    values: BTreeMap<String, String>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SessionStore for MemoryStore {
    fn get(&self, key: &str) -> Option<String> {
        self.values.get(key).cloned()
    }

    fn set(&mut self, key: &str, value: &str) -> Result<(), StoreError> {
        self.values.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&mut self, key: &str) -> Result<(), StoreError> {
        self.values.remove(key);
        Ok(())
    }
}

/// TOML file store, written through on every change.
#[derive(Debug)]
pub struct FileStore {
    path: PathBuf,
    values: BTreeMap<String, String>,
}

impl FileStore {
    /// Open the store at `path`; a missing file starts empty.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        let values = if path.exists() {
            let content = fs::read_to_string(&path)?;
            toml::from_str(&content)?
        } else {
            BTreeMap::new()
        };
        debug!(path = %path.display(), entries = values.len(), "Opened session store");
        Ok(Self { path, values })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn flush(&self) -> Result<(), StoreError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&self.path, toml::to_string_pretty(&self.values)?)?;
        Ok(())
    }
}

impl SessionStore for FileStore {
    fn get(&self, key: &str) -> Option<String> {
        self.values.get(key).cloned()
    }

    fn set(&mut self, key: &str, value: &str) -> Result<(), StoreError> {
        self.values.insert(key.to_string(), value.to_string());
        self.flush()
    }

    fn remove(&mut self, key: &str) -> Result<(), StoreError> {
        if self.values.remove(key).is_some() {
            self.flush()?;
        }
        Ok(())
    }
}

/// Write `(state, serial)`. An empty serial removes the stored one.
pub fn save_state(
    store: &mut dyn SessionStore,
    state: FlashState,
    serial: &str,
) -> Result<(), StoreError> {
    store.set(STATE_KEY, state.as_str())?;
    if serial.is_empty() {
        store.remove(SERIAL_KEY)?;
    } else {
        store.set(SERIAL_KEY, serial)?;
    }
    Ok(())
}

pub fn clear_state(store: &mut dyn SessionStore) -> Result<(), StoreError> {
    store.remove(STATE_KEY)?;
    store.remove(SERIAL_KEY)
}

/// Read the persisted state, collapsing anything inconsistent to `Idle`.
///
/// Unknown tags, terminal states and states missing their serial all load
/// as `Idle` with the store cleared. `Error` is kept so it can be reset.
pub fn load_state(store: &mut dyn SessionStore) -> (FlashState, String) {
    let serial = store.get(SERIAL_KEY).unwrap_or_default();
    let Some(tag) = store.get(STATE_KEY) else {
        return (FlashState::Idle, String::new());
    };

    let valid = match tag.parse::<FlashState>() {
        Ok(FlashState::Idle | FlashState::FlashComplete) => None,
        Ok(state) if state.requires_serial() && serial.is_empty() => {
            warn!(state = %state, "Stored state requires a serial but none was saved, resetting");
            None
        }
        Ok(state) => Some(state),
        Err(e) => {
            warn!(error = %e, "Ignoring stored state");
            None
        }
    };

    match valid {
        Some(state) => {
            debug!(state = %state, serial = %serial, "Loaded session state");
            (state, serial)
        }
        None => {
            if let Err(e) = clear_state(store) {
                warn!(error = %e, "Failed to clear session store");
            }
            (FlashState::Idle, String::new())
        }
    }
}
