//! File-backed mutual exclusion between invocations
//!
//! A lock is an exclusive OS advisory lock (`flock`) on a file in the lock
//! directory. The lock lives as long as the open file in the [`LockGuard`], so
//! the OS releases it when the holder exits, even when it is killed. The file
//! itself only carries [`LockInfo`] about the holder; it is removed on release
//! and reused when a dead holder left it behind.

use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use super::profile::LockConfig;
use crate::workflow::ExecutionContext;

/// Errors raised by the lock manager
#[derive(Debug, thiserror::Error)]
pub enum LockError {
    #[error("Failed to prepare lock directory {path}: {source}")]
    Directory {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to acquire lock {path}: {source}")]
    Acquire {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to release lock {path}: {source}")]
    Release {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Sharing domain of a lock key
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LockScope {
    /// One holder per resource
    World,
    /// One holder per resource and batch
    Batch,
    /// One holder per resource, batch and flow
    Flow,
    /// One holder per resource, batch, flow and execution
    Execution,
}

impl LockScope {
    pub fn symbol(&self) -> &'static str {
        match self {
            LockScope::World => "world",
            LockScope::Batch => "batch",
            LockScope::Flow => "flow",
            LockScope::Execution => "execution",
        }
    }

    /// Qualify a resource ID by the parts of the context this scope covers
    pub fn qualify(&self, resource_id: &str, context: &ExecutionContext) -> String {
        let mut parts = vec![resource_id];
        if *self >= LockScope::Batch {
            parts.push(context.batch_id());
        }
        if *self >= LockScope::Flow {
            parts.push(context.flow_id());
        }
        if *self >= LockScope::Execution {
            parts.push(context.execution_id());
        }
        parts.join("/")
    }
}

impl fmt::Display for LockScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.symbol())
    }
}

impl FromStr for LockScope {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "world" => Ok(LockScope::World),
            "batch" => Ok(LockScope::Batch),
            "flow" => Ok(LockScope::Flow),
            "execution" => Ok(LockScope::Execution),
            other => Err(format!(
                "Unknown lock scope '{}' (expected world, batch, flow or execution)",
                other
            )),
        }
    }
}

/// Content written into a lock file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockInfo {
    pub scope: LockScope,
    pub key: String,
    pub pid: u32,
    pub acquired_at: chrono::DateTime<chrono::Utc>,
}

/// Hands out file locks in one directory
#[derive(Debug, Clone)]
pub struct LockManager {
    directory: PathBuf,
    poll_interval: Duration,
}

impl LockManager {
    pub fn new(directory: impl Into<PathBuf>, poll_interval: Duration) -> Self {
        Self {
            directory: directory.into(),
            poll_interval,
        }
    }

    pub fn from_config(config: &LockConfig) -> Self {
        Self::new(config.directory.clone(), config.poll_interval)
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    /// Lock file for a key
    pub fn lock_path(&self, scope: LockScope, key: &str) -> PathBuf {
        let digest = hex::encode(Sha256::digest(key.as_bytes()));
        self.directory
            .join(format!("{}-{}.lock", scope.symbol(), &digest[..16]))
    }

    /// Acquire a lock, waiting while another holder has it
    pub async fn acquire(&self, scope: LockScope, key: &str) -> Result<LockGuard, LockError> {
        let mut waiting = false;
        loop {
            if let Some(guard) = self.try_acquire(scope, key).await? {
                info!(scope = %scope, key, "Lock acquired");
                return Ok(guard);
            }
            if !waiting {
                let holder_pid = self.holder(scope, key).map(|h| h.pid);
                info!(
                    scope = %scope,
                    key,
                    holder_pid = ?holder_pid,
                    "Waiting for lock held by another invocation"
                );
                waiting = true;
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }

    /// Acquire a lock if nobody holds it
    pub async fn try_acquire(
        &self,
        scope: LockScope,
        key: &str,
    ) -> Result<Option<LockGuard>, LockError> {
        let directory = self.directory.clone();
        let path = self.lock_path(scope, key);
        let info = LockInfo {
            scope,
            key: key.to_string(),
            pid: std::process::id(),
            acquired_at: chrono::Utc::now(),
        };

        let task_path = path.clone();
        tokio::task::spawn_blocking(move || lock_file(&directory, task_path, &info))
            .await
            .map_err(|e| LockError::Acquire {
                path,
                source: std::io::Error::other(e.to_string()),
            })?
    }

    /// Acquire every key in sorted order
    pub async fn acquire_all<I>(&self, scope: LockScope, keys: I) -> Result<Vec<LockGuard>, LockError>
    where
        I: IntoIterator<Item = String>,
    {
        let mut keys: Vec<String> = keys.into_iter().collect();
        keys.sort();
        keys.dedup();

        let mut guards = Vec::with_capacity(keys.len());
        for key in &keys {
            guards.push(self.acquire(scope, key).await?);
        }
        Ok(guards)
    }

    /// Read the metadata last written into a lock file
    pub fn holder(&self, scope: LockScope, key: &str) -> Option<LockInfo> {
        let content = std::fs::read(self.lock_path(scope, key)).ok()?;
        serde_json::from_slice(&content).ok()
    }
}

fn lock_file(directory: &Path, path: PathBuf, info: &LockInfo) -> Result<Option<LockGuard>, LockError> {
    std::fs::create_dir_all(directory).map_err(|source| LockError::Directory {
        path: directory.to_path_buf(),
        source,
    })?;

    let acquire_error = |source| LockError::Acquire {
        path: path.clone(),
        source,
    };
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(&path)
        .map_err(acquire_error)?;
    if !try_lock_exclusive(&file).map_err(acquire_error)? {
        return Ok(None);
    }
    // The previous holder may have removed the file between our open and lock
    if !is_current(&file, &path).map_err(acquire_error)? {
        return Ok(None);
    }

    // Owned by the guard first: a failed write must still remove the file.
    let guard = LockGuard {
        path,
        file,
        released: false,
    };
    let content = serde_json::to_vec_pretty(info).unwrap_or_default();
    let mut handle = &guard.file;
    handle
        .set_len(0)
        .and_then(|()| handle.write_all(&content))
        .and_then(|()| handle.flush())
        .map_err(|source| LockError::Acquire {
            path: guard.path.clone(),
            source,
        })?;
    debug!(path = %guard.path.display(), "Lock file written");
    Ok(Some(guard))
}

#[cfg(unix)]
fn try_lock_exclusive(file: &File) -> std::io::Result<bool> {
    use std::os::unix::io::AsRawFd;

    // Safety: the descriptor belongs to `file`, which outlives the call.
    let ret = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
    if ret == 0 {
        return Ok(true);
    }
    let err = std::io::Error::last_os_error();
    if err.kind() == ErrorKind::WouldBlock {
        Ok(false)
    } else {
        Err(err)
    }
}

#[cfg(not(unix))]
fn try_lock_exclusive(file: &File) -> std::io::Result<bool> {
    match file.try_lock() {
        Ok(()) => Ok(true),
        Err(std::fs::TryLockError::WouldBlock) => Ok(false),
        Err(std::fs::TryLockError::Error(e)) => Err(e),
    }
}

/// Whether `path` still names the file we locked
#[cfg(unix)]
fn is_current(file: &File, path: &Path) -> std::io::Result<bool> {
    use std::os::unix::fs::MetadataExt;

    let held = file.metadata()?;
    match std::fs::metadata(path) {
        Ok(current) => Ok(held.dev() == current.dev() && held.ino() == current.ino()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e),
    }
}

#[cfg(not(unix))]
fn is_current(_file: &File, path: &Path) -> std::io::Result<bool> {
    Ok(path.exists())
}

/// A held lock; the lock file is removed on release or drop
#[derive(Debug)]
pub struct LockGuard {
    path: PathBuf,
    file: File,
    released: bool,
}

impl LockGuard {
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Release explicitly, reporting removal failures
    pub fn release(mut self) -> Result<(), LockError> {
        self.released = true;
        std::fs::remove_file(&self.path).map_err(|source| LockError::Release {
            path: self.path.clone(),
            source,
        })
    }
}

/// Removes the file while still locked; closing `file` afterwards unlocks it.
impl Drop for LockGuard {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        if let Err(e) = std::fs::remove_file(&self.path) {
            warn!(path = %self.path.display(), error = %e, "Failed to remove lock file");
        }
    }
}
