//! Exclusive writer lock for a store root.

use super::provider::DataError;
use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

/// Held while a process writes to the store. The lock file is created with
/// create-new semantics and removed on drop.
#[derive(Debug)]
pub struct StoreLock {
    path: PathBuf,
}

impl StoreLock {
    pub fn acquire(path: impl Into<PathBuf>) -> Result<Self, DataError> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let mut file = match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                return Err(DataError::StoreLocked {
                    path: path.display().to_string(),
                });
            }
            Err(e) => return Err(e.into()),
        };
        writeln!(file, "pid={}", std::process::id())?;
        writeln!(file, "acquired_at={}", chrono::Utc::now().to_rfc3339())?;

        tracing::debug!(path = %path.display(), "store lock acquired");
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for StoreLock {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.path) {
            tracing::warn!(path = %self.path.display(), error = %e, "failed to release store lock");
        }
    }
}
