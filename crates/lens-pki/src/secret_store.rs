//! Abstract blob storage for CA material.
//!
//! The host decides where secrets actually live (keychain, secure element,
//! plain files). The proxy core only ever speaks this trait.

use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::PathBuf;
use std::sync::Mutex;

#[derive(Debug, thiserror::Error)]
pub enum SecretStoreError {
    #[error("secret store I/O failed: {0}")]
    Io(#[from] io::Error),
    #[error("secret store backend failed: {0}")]
    Backend(String),
}

pub trait SecretStore: Send + Sync {
    fn put(&self, name: &str, bytes: &[u8]) -> Result<(), SecretStoreError>;
    fn get(&self, name: &str) -> Result<Option<Vec<u8>>, SecretStoreError>;
    fn delete(&self, name: &str) -> Result<(), SecretStoreError>;
}

/// In-memory store used by tests and short-lived sessions.
#[derive(Debug, Default)]
pub struct MemorySecretStore {
    blobs: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemorySecretStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SecretStore for MemorySecretStore {
    fn put(&self, name: &str, bytes: &[u8]) -> Result<(), SecretStoreError> {
        let mut blobs = self
            .blobs
            .lock()
            .map_err(|_| SecretStoreError::Backend("memory store lock poisoned".to_string()))?;
        blobs.insert(name.to_string(), bytes.to_vec());
        Ok(())
    }

    fn get(&self, name: &str) -> Result<Option<Vec<u8>>, SecretStoreError> {
        let blobs = self
            .blobs
            .lock()
            .map_err(|_| SecretStoreError::Backend("memory store lock poisoned".to_string()))?;
        Ok(blobs.get(name).cloned())
    }

    fn delete(&self, name: &str) -> Result<(), SecretStoreError> {
        let mut blobs = self
            .blobs
            .lock()
            .map_err(|_| SecretStoreError::Backend("memory store lock poisoned".to_string()))?;
        blobs.remove(name);
        Ok(())
    }
}

/// Directory-backed store: one file per named blob.
#[derive(Debug)]
pub struct DirSecretStore {
    root: PathBuf,
}

impl DirSecretStore {
    pub fn new(root: impl Into<PathBuf>) -> Result<Self, SecretStoreError> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    fn path_for(&self, name: &str) -> Result<PathBuf, SecretStoreError> {
        if name.is_empty() || name.contains(['/', '\\']) || name.contains("..") {
            return Err(SecretStoreError::Backend(format!(
                "invalid secret name: {name:?}"
            )));
        }
        Ok(self.root.join(name))
    }
}

impl SecretStore for DirSecretStore {
    fn put(&self, name: &str, bytes: &[u8]) -> Result<(), SecretStoreError> {
        fs::write(self.path_for(name)?, bytes)?;
        Ok(())
    }

    fn get(&self, name: &str) -> Result<Option<Vec<u8>>, SecretStoreError> {
        match fs::read(self.path_for(name)?) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(error) if error.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(error) => Err(error.into()),
        }
    }

    fn delete(&self, name: &str) -> Result<(), SecretStoreError> {
        match fs::remove_file(self.path_for(name)?) {
            Ok(()) => Ok(()),
            Err(error) if error.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(error) => Err(error.into()),
        }
    }
}
