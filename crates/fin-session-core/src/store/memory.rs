use std::sync::{Arc, Mutex};

use super::{SessionStore, StorageError};

/// In-process store. Clones share the same slot.
#[derive(Clone, Default)]
pub struct MemoryStore {
    slot: Arc<Mutex<Option<String>>>,
    writes: Arc<Mutex<usize>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_value(value: impl Into<String>) -> Self {
        let store = Self::new();
        *store.slot.lock().unwrap_or_else(|e| e.into_inner()) = Some(value.into());
        store
    }

    /// Number of writes and removals performed so far.
    pub fn write_count(&self) -> usize {
        *self.writes.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn bump(&self) {
        *self.writes.lock().unwrap_or_else(|e| e.into_inner()) += 1;
    }
}

impl SessionStore for MemoryStore {
    fn read(&self) -> Result<Option<String>, StorageError> {
        let slot = self
            .slot
            .lock()
            .map_err(|_| StorageError::Unavailable("memory store poisoned".into()))?;
        Ok(slot.clone())
    }

    fn write(&self, value: &str) -> Result<(), StorageError> {
        let mut slot = self
            .slot
            .lock()
            .map_err(|_| StorageError::Unavailable("memory store poisoned".into()))?;
        *slot = Some(value.to_string());
        drop(slot);
        self.bump();
        Ok(())
    }

    fn remove(&self) -> Result<(), StorageError> {
        let mut slot = self
            .slot
            .lock()
            .map_err(|_| StorageError::Unavailable("memory store poisoned".into()))?;
        *slot = None;
        drop(slot);
        self.bump();
        Ok(())
    }
}
