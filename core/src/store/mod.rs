//! File Store — receiving-side destination management: collision-free
//! naming, streaming writes, SHA-256 hashing, and partial-file cleanup.

use crate::relay::SessionId;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, warn};

/// Name used when a declared file name sanitizes down to nothing
const FALLBACK_NAME: &str = "download";

/// Give up probing for a free name after this many suffixes
const MAX_NAME_ATTEMPTS: u32 = 10_000;

/// File store error types
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("No active download for peer {0}")]
    NoActiveDownload(SessionId),
    #[error("Download already active for peer {0}")]
    DownloadAlreadyActive(SessionId),
    #[error("No free name for {0} in destination directory")]
    NoFreeName(String),
    #[error("Storage error: {0}")]
    Io(#[from] std::io::Error),
}

/// Bookkeeping for one in-progress incoming file
struct DownloadRecord {
    path: PathBuf,
    declared_size: u64,
    received: u64,
    file: File,
}

/// Byte counters after one append
#[derive(Debug, Clone, Copy)]
pub struct AppendOutcome {
    /// Bytes written so far
    pub received: u64,
    /// Declared total size
    pub total: u64,
}

/// Result of finalizing a download
#[derive(Debug, Clone)]
pub struct FinalizedDownload {
    /// Final on-disk path
    pub path: PathBuf,
    /// Bytes actually written
    pub received: u64,
    /// Size declared at file-start
    pub declared_size: u64,
}

/// Manages the destination directory and all active download records.
///
/// One record per peer; allocation, append, and finalize are keyed by the
/// peer's session ID.
pub struct FileStore {
    download_dir: PathBuf,
    active: HashMap<SessionId, DownloadRecord>,
}

impl FileStore {
    /// Create a store rooted at the given destination directory
    pub fn new(download_dir: impl Into<PathBuf>) -> Self {
        Self {
            download_dir: download_dir.into(),
            active: HashMap::new(),
        }
    }

    /// The destination directory
    pub fn download_dir(&self) -> &Path {
        &self.download_dir
    }

    /// Create the destination directory if it does not exist. Idempotent.
    pub async fn ensure_dir(&self) -> Result<(), StoreError> {
        tokio::fs::create_dir_all(&self.download_dir).await?;
        Ok(())
    }

    /// Whether a download is active for this peer
    pub fn has_active(&self, peer: &SessionId) -> bool {
        self.active.contains_key(peer)
    }

    /// Open a collision-free destination for an incoming file and register
    /// the download record.
    ///
    /// The declared name is sanitized to a bare file name; the first free of
    /// `name`, `name (1)`, `name (2)`, … is created (never overwriting an
    /// existing file) and opened for streaming writes.
    pub async fn allocate(
        &mut self,
        peer: &SessionId,
        declared_name: &str,
        declared_size: u64,
    ) -> Result<PathBuf, StoreError> {
        if self.active.contains_key(peer) {
            return Err(StoreError::DownloadAlreadyActive(peer.clone()));
        }
        self.ensure_dir().await?;

        let name = sanitize_name(declared_name);
        for attempt in 0..MAX_NAME_ATTEMPTS {
            let candidate = self.download_dir.join(numbered_name(&name, attempt));
            match OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&candidate)
                .await
            {
                Ok(file) => {
                    debug!(%peer, path = %candidate.display(), declared_size, "download allocated");
                    self.active.insert(
                        peer.clone(),
                        DownloadRecord {
                            path: candidate.clone(),
                            declared_size,
                            received: 0,
                            file,
                        },
                    );
                    return Ok(candidate);
                }
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Err(StoreError::NoFreeName(name))
    }

    /// Append bytes to the peer's active download.
    ///
    /// A missing record is a protocol-sequencing error, not a silent drop.
    pub async fn append(
        &mut self,
        peer: &SessionId,
        bytes: &[u8],
    ) -> Result<AppendOutcome, StoreError> {
        let record = self
            .active
            .get_mut(peer)
            .ok_or_else(|| StoreError::NoActiveDownload(peer.clone()))?;
        record.file.write_all(bytes).await?;
        record.received += bytes.len() as u64;
        Ok(AppendOutcome {
            received: record.received,
            total: record.declared_size,
        })
    }

    /// Flush and close the peer's download, removing its record
    pub async fn finalize(&mut self, peer: &SessionId) -> Result<FinalizedDownload, StoreError> {
        let mut record = self
            .active
            .remove(peer)
            .ok_or_else(|| StoreError::NoActiveDownload(peer.clone()))?;
        record.file.flush().await?;
        // Closing happens when the handle drops
        Ok(FinalizedDownload {
            path: record.path,
            received: record.received,
            declared_size: record.declared_size,
        })
    }

    /// Best-effort removal of the peer's partial download.
    ///
    /// Runs on failure paths where a further error has no actionable
    /// recipient: everything is logged and swallowed.
    pub async fn discard(&mut self, peer: &SessionId) {
        if let Some(record) = self.active.remove(peer) {
            drop(record.file);
            if let Err(e) = tokio::fs::remove_file(&record.path).await {
                warn!(%peer, path = %record.path.display(), error = %e, "failed to remove partial file");
            } else {
                debug!(%peer, path = %record.path.display(), "partial download discarded");
            }
        }
    }

    /// Discard every active download (wholesale teardown)
    pub async fn discard_all(&mut self) {
        let peers: Vec<SessionId> = self.active.keys().cloned().collect();
        for peer in peers {
            self.discard(&peer).await;
        }
    }

    /// Stream a file through SHA-256 and return the hex digest.
    ///
    /// Used both to pre-compute a sender-side advertised hash and to verify
    /// a completed download; never loads the file into memory at once.
    pub async fn compute_hash(path: impl AsRef<Path>) -> Result<String, StoreError> {
        let mut file = File::open(path.as_ref()).await?;
        let mut hasher = Sha256::new();
        let mut buf = vec![0u8; 64 * 1024];
        loop {
            let n = file.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
        }
        Ok(hex::encode(hasher.finalize()))
    }
}

/// Reduce a declared name to a bare file name.
///
/// Strips any directory components (either separator style) so a declared
/// name can never escape the destination directory.
fn sanitize_name(declared: &str) -> String {
    let normalized = declared.replace('\\', "/");
    let bare = normalized
        .split('/')
        .rev()
        .map(str::trim)
        .find(|segment| !segment.is_empty() && *segment != "." && *segment != "..")
        .unwrap_or(FALLBACK_NAME);
    bare.to_string()
}

/// `name` for attempt 0, `stem (n).ext` afterwards
fn numbered_name(name: &str, attempt: u32) -> String {
    if attempt == 0 {
        return name.to_string();
    }
    match name.rfind('.').filter(|i| *i > 0) {
        Some(i) => format!("{} ({}){}", &name[..i], attempt, &name[i..]),
        None => format!("{} ({})", name, attempt),
    }
}

// ============================================================================
// TESTS
// ============================================================================
