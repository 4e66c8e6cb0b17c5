//! Local filesystem queue store.

use async_trait::async_trait;
use percent_encoding::{percent_decode_str, utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::warn;
use uuid::Uuid;

use crate::backend::{key_matches, QueueStore};
use fieldsync_common::{Error, Result};

/// Characters escaped when a key becomes a file name.
const KEY_ENCODE_SET: &AsciiSet = &NON_ALPHANUMERIC.remove(b'-').remove(b'_');

/// Extension of value files.
const VALUE_EXTENSION: &str = "json";

/// Local filesystem queue store.
///
/// Stores one file per key in a single directory. Writes go through a
/// temporary file and a rename, so a crash never leaves a half-written value
/// behind.
pub struct LocalStore {
    root: PathBuf,
}

impl LocalStore {
    /// Create a new local store with the given root directory.
    ///
    /// # Postconditions
    /// - Root directory is created if it doesn't exist
    ///
    /// # Errors
    /// - Permission denied
    /// - Root exists but is not a directory
    pub fn new(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();

        if !root.exists() {
            std::fs::create_dir_all(&root)?;
        } else if !root.is_dir() {
            return Err(Error::Store(format!(
                "{} is not a directory",
                root.display()
            )));
        }

        Ok(Self { root })
    }

    /// Root directory of the store.
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn key_to_path(&self, key: &str) -> PathBuf {
        let encoded = utf8_percent_encode(key, KEY_ENCODE_SET).to_string();
        self.root.join(format!("{}.{}", encoded, VALUE_EXTENSION))
    }

    fn file_name_to_key(name: &str) -> Option<String> {
        let encoded = name.strip_suffix(&format!(".{}", VALUE_EXTENSION))?;
        percent_decode_str(encoded)
            .decode_utf8()
            .ok()
            .map(|key| key.into_owned())
    }

    async fn value_files(&self) -> Result<Vec<(String, PathBuf)>> {
        let mut files = Vec::new();
        let mut entries = fs::read_dir(&self.root).await?;

        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let Some(name) = name.to_str() else {
                continue;
            };
            if let Some(key) = Self::file_name_to_key(name) {
                files.push((key, entry.path()));
            }
        }

        Ok(files)
    }
}

#[async_trait]
impl QueueStore for LocalStore {
    fn name(&self) -> &str {
        "local"
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        match fs::read(self.key_to_path(key)).await {
            Ok(data) => Ok(Some(data)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn set(&self, key: &str, value: Vec<u8>) -> Result<()> {
        let target = self.key_to_path(key);
        let temp = self.root.join(format!(".{}.tmp", Uuid::new_v4()));

        fs::write(&temp, &value).await?;
        if let Err(e) = fs::rename(&temp, &target).await {
            if let Err(cleanup) = fs::remove_file(&temp).await {
                warn!("Failed to remove temp file {}: {}", temp.display(), cleanup);
            }
            return Err(e.into());
        }

        Ok(())
    }

    async fn keys(&self, pattern: &str) -> Result<Vec<String>> {
        Ok(self
            .value_files()
            .await?
            .into_iter()
            .map(|(key, _)| key)
            .filter(|key| key_matches(pattern, key))
            .collect())
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        match fs::remove_file(self.key_to_path(key)).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn flush(&self) -> Result<()> {
        for (_, path) in self.value_files().await? {
            match fs::remove_file(&path).await {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }
}
