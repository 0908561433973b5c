//! Persistence collaborator: read and write scene override files.

use futures::future::BoxFuture;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

pub trait SceneStore: Send + Sync {
    fn read(&self, path: &Path) -> BoxFuture<'static, io::Result<String>>;
    fn write(&self, path: &Path, contents: String) -> BoxFuture<'static, io::Result<()>>;
}

/// Disk-backed store using `tokio::fs`.
#[derive(Debug, Clone, Default)]
pub struct FsStore;

impl SceneStore for FsStore {
    fn read(&self, path: &Path) -> BoxFuture<'static, io::Result<String>> {
        let path = path.to_path_buf();
        Box::pin(async move { tokio::fs::read_to_string(&path).await })
    }

    fn write(&self, path: &Path, contents: String) -> BoxFuture<'static, io::Result<()>> {
        let path = path.to_path_buf();
        Box::pin(async move {
            if let Some(parent) = path.parent() {
                if !parent.as_os_str().is_empty() {
                    tokio::fs::create_dir_all(parent).await?;
                }
            }
            tokio::fs::write(&path, contents).await
        })
    }
}

/// In-memory store with write counting and injectable failures.
#[derive(Debug, Default)]
pub struct MemoryStore {
    files: Mutex<HashMap<PathBuf, String>>,
    writes: AtomicUsize,
    fail_reads: AtomicBool,
    fail_writes: AtomicBool,
    write_delay: Mutex<Option<Duration>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set file contents directly, bypassing the write counter.
    pub fn insert(&self, path: impl Into<PathBuf>, contents: impl Into<String>) {
        self.files.lock().insert(path.into(), contents.into());
    }

    pub fn contents(&self, path: impl AsRef<Path>) -> Option<String> {
        self.files.lock().get(path.as_ref()).cloned()
    }

    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    pub fn fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Hold every later write open for `delay` before it reports completion.
    pub fn set_write_delay(&self, delay: Duration) {
        *self.write_delay.lock() = Some(delay);
    }
}

impl SceneStore for MemoryStore {
    fn read(&self, path: &Path) -> BoxFuture<'static, io::Result<String>> {
        let result = if self.fail_reads.load(Ordering::SeqCst) {
            Err(io::Error::new(io::ErrorKind::Other, "read failure injected"))
        } else {
            self.files.lock().get(path).cloned().ok_or_else(|| {
                io::Error::new(io::ErrorKind::NotFound, format!("{} not found", path.display()))
            })
        };
        Box::pin(futures::future::ready(result))
    }

    fn write(&self, path: &Path, contents: String) -> BoxFuture<'static, io::Result<()>> {
        let result = if self.fail_writes.load(Ordering::SeqCst) {
            Err(io::Error::new(io::ErrorKind::Other, "write failure injected"))
        } else {
            self.files.lock().insert(path.to_path_buf(), contents);
            self.writes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        };
        match *self.write_delay.lock() {
            Some(delay) => Box::pin(async move {
                tokio::time::sleep(delay).await;
                result
            }),
            None => Box::pin(futures::future::ready(result)),
        }
    }
}
