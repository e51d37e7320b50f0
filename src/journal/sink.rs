//! Journal output streams.

use std::io::SeekFrom;
use std::path::{Path, PathBuf};

use crate::utils::DagError;

use async_trait::async_trait;

use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncSeekExt, AsyncWriteExt};

#[cfg(test)]
use std::sync::{Arc, Mutex};

/// Append-only byte stream the journal writes records to. `append()` must
/// only return `Ok` once the bytes are durable.
#[async_trait]
pub trait JournalSink: Send + Sync {
    /// Appends bytes and flushes them to stable storage.
    async fn append(&mut self, bytes: &[u8]) -> Result<(), DagError>;
}

/// Journal sink backed by a file opened in append position.
pub struct FileSink {
    /// Path of the backing file.
    path: PathBuf,

    /// Backing file handle, cursor kept at EOF.
    backer: File,

    /// File length covering only fully appended records.
    len: u64,
}

impl FileSink {
    /// Opens an existing file for appending at its current end.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, DagError> {
        let path = path.as_ref().to_path_buf();
        let mut backer =
            OpenOptions::new().read(true).write(true).open(&path).await?;
        let len = backer.seek(SeekFrom::End(0)).await?; // seek to EOF
        Ok(FileSink { path, backer, len })
    }

    async fn write_synced(&mut self, bytes: &[u8]) -> Result<(), DagError> {
        self.backer.write_all(bytes).await?;
        self.backer.sync_data().await?;
        Ok(())
    }
}

#[async_trait]
impl JournalSink for FileSink {
    async fn append(&mut self, bytes: &[u8]) -> Result<(), DagError> {
        if let Err(e) = self.write_synced(bytes).await {
            // cut off whatever part of the record made it to the file
            pf_warn!(
                "append to '{}' failed, truncating back to {} bytes",
                self.path.display(),
                self.len
            );
            self.backer.set_len(self.len).await?;
            self.backer.seek(SeekFrom::Start(self.len)).await?;
            self.backer.sync_data().await?;
            return Err(e);
        }
        self.len += bytes.len() as u64;
        Ok(())
    }
}

/// In-memory sink that counts flushes; shared handles see the same bytes.
/// When torn, an append stores only the first half of its bytes and fails.
#[cfg(test)]
#[derive(Clone, Default)]
pub(crate) struct MemSink {
    inner: Arc<Mutex<MemSinkInner>>,
}

#[cfg(test)]
#[derive(Default)]
struct MemSinkInner {
    bytes: Vec<u8>,
    flushes: usize,
    torn: bool,
}

#[cfg(test)]
impl MemSink {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn bytes(&self) -> Vec<u8> {
        self.inner.lock().unwrap().bytes.clone()
    }

    pub(crate) fn flush_count(&self) -> usize {
        self.inner.lock().unwrap().flushes
    }

    pub(crate) fn set_torn(&self, torn: bool) {
        self.inner.lock().unwrap().torn = torn;
    }
}

#[cfg(test)]
#[async_trait]
impl JournalSink for MemSink {
    async fn append(&mut self, bytes: &[u8]) -> Result<(), DagError> {
        let mut inner = self.inner.lock().unwrap();
        if inner.torn {
            inner.bytes.extend_from_slice(&bytes[..bytes.len() / 2]);
            return Err(DagError::msg("device went away mid-append"));
        }
        inner.bytes.extend_from_slice(bytes);
        inner.flushes += 1;
        Ok(())
    }
}

#[cfg(test)]
mod sink_tests {
    use super::*;
    use tokio::fs;

    #[tokio::test(flavor = "multi_thread", worker_threads = 1)]
    async fn file_sink_appends() -> Result<(), DagError> {
        let path = std::env::temp_dir().join("dagmaster-test-sink.log");
        fs::write(&path, b"head").await?;
        let mut sink = FileSink::open(&path).await?;
        sink.append(b"-one").await?;
        sink.append(b"-two").await?;
        assert_eq!(sink.len, 12);
        assert_eq!(fs::read(&path).await?, b"head-one-two".to_vec());
        fs::remove_file(&path).await?;
        Ok(())
    }
}
