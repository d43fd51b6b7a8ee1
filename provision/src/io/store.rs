//! Key-value byte storage backing parameters and credentials.
//!
//! The device keeps one flash file per key; [`DirStore`] reproduces that
//! layout on a host filesystem with one file per key under a root directory.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("invalid store key '{0}'")]
    InvalidKey(String),

    #[error("I/O error on key '{key}'")]
    Io {
        key: String,
        #[source]
        source: std::io::Error,
    },

    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// Byte-oriented persistent storage.
///
/// Methods take `&self`; implementations own their synchronization so one
/// store can be shared by the registry, the provisioner and the HTTP side.
pub trait ByteStore: Send + Sync {
    /// Read a key. A missing key is `Ok(None)`.
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError>;
    fn put(&self, key: &str, bytes: &[u8]) -> Result<(), StoreError>;
    /// Remove a key. Removing a missing key succeeds.
    fn delete(&self, key: &str) -> Result<(), StoreError>;
}

pub type SharedStore = Arc<dyn ByteStore>;

/// Read a key as text. Missing keys read as the empty string.
pub fn read_text(store: &dyn ByteStore, key: &str) -> Result<String, StoreError> {
    Ok(store
        .get(key)?
        .map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
        .unwrap_or_default())
}

/// Write text to a key. An empty value deletes the key instead.
pub fn write_text(store: &dyn ByteStore, key: &str, value: &str) -> Result<(), StoreError> {
    if value.is_empty() {
        store.delete(key)
    } else {
        store.put(key, value.as_bytes())
    }
}

/// Reject keys that cannot be mapped onto a single file name.
pub fn validate_key(key: &str) -> Result<(), StoreError> {
    let invalid = key.is_empty()
        || key == "."
        || key == ".."
        || key.contains(['/', '\\', '\0']);
    if invalid {
        return Err(StoreError::InvalidKey(key.to_string()));
    }
    Ok(())
}

/// One file per key under a root directory.
#[derive(Debug, Clone)]
pub struct DirStore {
    root: PathBuf,
}

impl DirStore {
    /// Open (and create if needed) a store rooted at `root`.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let root = root.into();
        fs::create_dir_all(&root).map_err(|source| StoreError::Io {
            key: root.display().to_string(),
            source,
        })?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, key: &str) -> Result<PathBuf, StoreError> {
        validate_key(key)?;
        Ok(self.root.join(key))
    }
}

impl ByteStore for DirStore {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let path = self.path_for(key)?;
        match fs::read(&path) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(source) => Err(StoreError::Io {
                key: key.to_string(),
                source,
            }),
        }
    }

    /// Atomic write (temp file + rename).
    fn put(&self, key: &str, bytes: &[u8]) -> Result<(), StoreError> {
        let path = self.path_for(key)?;
        debug!(key, len = bytes.len(), "store put");
        let tmp_path = self.root.join(format!(".{key}.tmp"));
        let io_err = |source| StoreError::Io {
            key: key.to_string(),
            source,
        };
        fs::write(&tmp_path, bytes).map_err(io_err)?;
        fs::rename(&tmp_path, &path).map_err(io_err)?;
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<(), StoreError> {
        let path = self.path_for(key)?;
        debug!(key, "store delete");
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(StoreError::Io {
                key: key.to_string(),
                source,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dir_store_put_get_delete() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = DirStore::open(temp.path().join("flash")).expect("open");

        assert_eq!(store.get("mqtt_port").expect("get"), None);
        store.put("mqtt_port", b"1883").expect("put");
        assert_eq!(store.get("mqtt_port").expect("get"), Some(b"1883".to_vec()));
        assert!(temp.path().join("flash/mqtt_port").exists());

        store.delete("mqtt_port").expect("delete");
        assert_eq!(store.get("mqtt_port").expect("get"), None);
        store.delete("mqtt_port").expect("delete missing");
    }

    #[test]
    fn empty_text_deletes_key() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = DirStore::open(temp.path()).expect("open");

        write_text(&store, "name", "value").expect("write");
        assert_eq!(read_text(&store, "name").expect("read"), "value");
        write_text(&store, "name", "").expect("clear");
        assert_eq!(store.get("name").expect("get"), None);
        assert_eq!(read_text(&store, "name").expect("read"), "");
    }

    #[test]
    fn rejects_keys_outside_root() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = DirStore::open(temp.path()).expect("open");
        for key in ["", "..", "a/b", "a\\b"] {
            assert!(matches!(
                store.put(key, b"x"),
                Err(StoreError::InvalidKey(_))
            ));
        }
    }
}
