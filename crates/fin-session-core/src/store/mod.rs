//! Persistent backends for the serialized session record.
//!
//! A backend stores one opaque string under one key. It knows nothing about
//! tokens; the session layer above it handles (de)serialization and folds
//! every backend failure into "no session".

pub mod file;
pub mod keyring;
pub mod memory;

use thiserror::Error;

pub use file::FileStore;
pub use keyring::KeyringStore;
pub use memory::MemoryStore;

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Storage I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Keychain error: {0}")]
    Keyring(#[from] ::keyring::Error),

    #[error("Storage unavailable: {0}")]
    Unavailable(String),
}

/// A single-slot store for the serialized session record.
///
/// Writes replace the whole value. `remove` succeeds when nothing is stored.
pub trait SessionStore: Send + Sync {
    fn read(&self) -> Result<Option<String>, StorageError>;

    fn write(&self, value: &str) -> Result<(), StorageError>;

    fn remove(&self) -> Result<(), StorageError>;
}

impl<S: SessionStore + ?Sized> SessionStore for Box<S> {
    fn read(&self) -> Result<Option<String>, StorageError> {
        (**self).read()
    }

    fn write(&self, value: &str) -> Result<(), StorageError> {
        (**self).write(value)
    }

    fn remove(&self) -> Result<(), StorageError> {
        (**self).remove()
    }
}
