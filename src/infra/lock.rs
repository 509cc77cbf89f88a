//! File-based build directory locking for mutual exclusion.

use std::fs::{File, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use fs2::FileExt;
use serde::{Deserialize, Serialize};

use crate::error::LockError;

/// Lock file name inside the build directory
pub const LOCK_FILENAME: &str = ".lock";

/// Metadata written into a held lock
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LockMetadata {
    /// Metadata format version
    pub version: u32,
    /// Holder process id
    pub pid: u32,
    /// When the lock was taken
    pub started_at_unix: u64,
    /// Command line of the holder
    pub command: String,
}

/// Exclusive lock on a build directory, released on drop
#[derive(Debug)]
pub struct BuildLock {
    file: File,
    lock_path: PathBuf,
}

impl BuildLock {
    /// Take the lock for `build_dir`, failing immediately if it is held
    pub fn acquire(build_dir: &Path, command: &str) -> Result<Self, LockError> {
        let lock_path = build_dir.join(LOCK_FILENAME);
        let io_err = |e: std::io::Error| LockError::Io {
            lock_path: lock_path.clone(),
            error: e.to_string(),
        };

        std::fs::create_dir_all(build_dir).map_err(io_err)?;
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&lock_path)
            .map_err(io_err)?;

        if file.try_lock_exclusive().is_err() {
            return Err(Self::contention_error(&lock_path));
        }

        let lock = Self {
            file,
            lock_path: lock_path.clone(),
        };
        lock.write_metadata(command).map_err(io_err)?;
        tracing::debug!(lock = %lock.path().display(), "Acquired build lock");
        Ok(lock)
    }

    /// Path of the lock file
    pub fn path(&self) -> &Path {
        &self.lock_path
    }

    fn write_metadata(&self, command: &str) -> std::io::Result<()> {
        let metadata = LockMetadata {
            version: 1,
            pid: std::process::id(),
            started_at_unix: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default()
                .as_secs(),
            command: command.to_string(),
        };
        let json = serde_json::to_string(&metadata).map_err(std::io::Error::other)?;

        let mut file = &self.file;
        file.set_len(0)?;
        file.seek(SeekFrom::Start(0))?;
        file.write_all(json.as_bytes())?;
        file.sync_all()
    }

    fn contention_error(lock_path: &Path) -> LockError {
        let metadata = std::fs::read_to_string(lock_path)
            .ok()
            .and_then(|c| serde_json::from_str::<LockMetadata>(&c).ok());
        match metadata {
            Some(m) => LockError::Contention {
                command: m.command,
                pid: m.pid,
                started_at_unix: m.started_at_unix,
                lock_path: lock_path.to_path_buf(),
            },
            None => LockError::ContentionUnknown {
                lock_path: lock_path.to_path_buf(),
            },
        }
    }
}

impl Drop for BuildLock {
    fn drop(&mut self) {
        let _ = self.file.unlock();
    }
}
