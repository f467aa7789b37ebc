use ::keyring::Entry;

use super::{SessionStore, StorageError};

const SERVICE_NAME: &str = "fin-engine";

/// Keychain entry name holding the serialized session
const ENTRY_NAME: &str = "session";

/// Stores the session record in the OS keychain.
pub struct KeyringStore {
    service: String,
    entry: String,
}

impl KeyringStore {
    pub fn new() -> Self {
        Self::with_names(SERVICE_NAME, ENTRY_NAME)
    }

    pub fn with_names(service: impl Into<String>, entry: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            entry: entry.into(),
        }
    }

    fn entry(&self) -> Result<Entry, StorageError> {
        Ok(Entry::new(&self.service, &self.entry)?)
    }
}

impl Default for KeyringStore {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionStore for KeyringStore {
    fn read(&self) -> Result<Option<String>, StorageError> {
        match self.entry()?.get_password() {
            Ok(value) => Ok(Some(value)),
            Err(::keyring::Error::NoEntry) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn write(&self, value: &str) -> Result<(), StorageError> {
        self.entry()?.set_password(value)?;
        Ok(())
    }

    fn remove(&self) -> Result<(), StorageError> {
        match self.entry()?.delete_credential() {
            Ok(()) | Err(::keyring::Error::NoEntry) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
