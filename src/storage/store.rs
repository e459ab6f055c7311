use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use thiserror::Error;

/// Errors raised by a [`StateStore`] backend.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Nothing has been stored under the key yet.
    #[error("No stored state found at {0}")]
    NotFound(String),
    /// Underlying I/O failed.
    #[error("Storage I/O error at {location}: {source}")]
    Io {
        location: String,
        #[source]
        source: std::io::Error,
    },
    /// Backend refused the write for a reason of its own.
    #[error("Storage backend error: {0}")]
    Backend(String),
}

/// Byte-level storage for the state document.
///
/// The engine only ever needs "write these bytes" and "read the bytes back";
/// whether they land in a local file or an object store is up to the
/// implementation.
pub trait StateStore: Send + Sync + 'static {
    /// Read the last stored document.
    fn load(&self) -> impl Future<Output = Result<Vec<u8>, StoreError>> + Send;

    /// Replace the stored document with `bytes`.
    fn save(&self, bytes: Vec<u8>) -> impl Future<Output = Result<(), StoreError>> + Send;
}

// ============================================================================
// File Store
// ============================================================================

/// Stores the state document as a single local file.
#[derive(Debug, Clone)]
pub struct FileStore {
    path: PathBuf,
}

impl FileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn io_error(&self, source: std::io::Error) -> StoreError {
        StoreError::Io {
            location: self.path.display().to_string(),
            source,
        }
    }
}

impl StateStore for FileStore {
    async fn load(&self) -> Result<Vec<u8>, StoreError> {
        match tokio::fs::read(&self.path).await {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(StoreError::NotFound(self.path.display().to_string()))
            }
            Err(e) => Err(self.io_error(e)),
        }
    }

    async fn save(&self, bytes: Vec<u8>) -> Result<(), StoreError> {
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || atomic_write(&path, &bytes))
            .await
            .map_err(|e| StoreError::Backend(format!("write task failed: {e}")))?
            .map_err(|e| self.io_error(e))
    }
}

/// Write `content` to `dst` through a temporary sibling file and a rename,
/// so the destination never holds a partially written document.
fn atomic_write(dst: &Path, content: &[u8]) -> std::io::Result<()> {
    use std::io::Write;
    use std::time::{SystemTime, UNIX_EPOCH};

    if let Some(parent) = dst.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }

    // Randomized temp filename so the temp path cannot be pre-planted as a symlink
    let random_suffix = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or(0);
    let temp_path = dst.with_extension(format!("tmp.{:016x}", random_suffix));

    let mut temp_file = std::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(&temp_path)?;

    let written = temp_file
        .write_all(content)
        .and_then(|_| temp_file.sync_all());
    drop(temp_file);
    if let Err(e) = written {
        let _ = std::fs::remove_file(&temp_path);
        return Err(e);
    }

    // On Windows, rename fails if destination exists, so remove it first
    #[cfg(windows)]
    if dst.exists() {
        if let Err(e) = std::fs::remove_file(dst) {
            let _ = std::fs::remove_file(&temp_path);
            return Err(e);
        }
    }

    std::fs::rename(&temp_path, dst).inspect_err(|_| {
        let _ = std::fs::remove_file(&temp_path);
    })
}

// ============================================================================
// Memory Store
// ============================================================================

/// Keeps the state document in memory.
///
/// Useful for ephemeral runs and for exercising the persist path: writes can
/// be made to fail on demand and are counted.
#[derive(Debug, Default)]
pub struct MemoryStore {
    bytes: Mutex<Option<Vec<u8>>>,
    fail_writes: AtomicBool,
    writes: AtomicUsize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store pre-seeded with a document.
    pub fn with_bytes(bytes: Vec<u8>) -> Self {
        Self {
            bytes: Mutex::new(Some(bytes)),
            ..Self::default()
        }
    }

    /// Make every subsequent `save` fail (or succeed again).
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Number of successful writes so far.
    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    /// Last successfully written document.
    pub fn contents(&self) -> Option<Vec<u8>> {
        self.bytes.lock().ok().and_then(|b| b.clone())
    }
}

impl StateStore for MemoryStore {
    async fn load(&self) -> Result<Vec<u8>, StoreError> {
        self.bytes
            .lock()
            .map_err(|_| StoreError::Backend("memory store poisoned".to_string()))?
            .clone()
            .ok_or_else(|| StoreError::NotFound("memory".to_string()))
    }

    async fn save(&self, bytes: Vec<u8>) -> Result<(), StoreError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StoreError::Backend("write rejected".to_string()));
        }
        *self
            .bytes
            .lock()
            .map_err(|_| StoreError::Backend("memory store poisoned".to_string()))? = Some(bytes);
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
