//! Durable recovery storage of one application directory: a single state
//! snapshot plus the journal of mutations since that snapshot, and the
//! connect record workers resolve the master address from.

mod agent;
mod connect;

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use crate::journal::FileSink;
use crate::utils::DagError;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use rmp_serde::decode::from_slice as decode_from_slice;
use rmp_serde::encode::to_vec_named as encode_to_vec_named;

use tokio::fs::{self, File, OpenOptions};
use tokio::io::{self, AsyncRead, AsyncReadExt, AsyncWriteExt};

pub use agent::{FsStorageAgent, StorageAgent};
pub use connect::ConnectRecord;

const SNAPSHOT_FILE: &str = "snapshot";
const SNAPSHOT_TMP_FILE: &str = "snapshot.tmp";
const JOURNAL_FILE: &str = "journal";

/// Magic bytes at the start of every journal file.
const JOURNAL_MAGIC: &[u8; 4] = b"DGJ1";

/// Journal file header: magic + snapshot generation it belongs to.
const JOURNAL_HEADER_LEN: usize = 4 + 8;

/// Current snapshot envelope format version.
pub const SNAPSHOT_FORMAT_VERSION: u32 = 1;

/// Versioned wrapper around snapshotted state.
#[derive(Debug, Serialize, Deserialize)]
struct SnapshotEnvelope<T> {
    format_version: u32,
    generation: u64,
    state: T,
}

/// Flushes a directory's entries, making renames and file creations in it
/// durable.
pub(crate) async fn sync_dir(dir: &Path) -> Result<(), DagError> {
    File::open(dir).await?.sync_all().await?;
    Ok(())
}

/// Result of loading the latest durable state.
pub struct Recovered<T> {
    /// Snapshotted state; `None` on a first run.
    pub state: Option<T>,

    /// Journal entries written after the snapshot, positioned after the
    /// file header.
    pub journal: Box<dyn AsyncRead + Unpin + Send>,
}

/// Snapshot and journal storage of an application directory. Between two
/// snapshots the journal file holds exactly the mutations applied since the
/// last one.
#[derive(Debug)]
pub struct RecoveryStore {
    /// Application directory.
    dir: PathBuf,

    /// Generation of the newest snapshot written or loaded.
    generation: u64,
}

impl RecoveryStore {
    /// Opens the store over `dir`, creating the directory if needed.
    pub async fn new_and_setup(
        dir: impl AsRef<Path>,
    ) -> Result<Self, DagError> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir).await?;
        Ok(RecoveryStore { dir, generation: 0 })
    }

    /// Generation of the newest snapshot written or loaded.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Application directory of this store.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path of the journal file.
    pub fn journal_path(&self) -> PathBuf {
        self.dir.join(JOURNAL_FILE)
    }

    /// Durably writes a new snapshot of `state` and starts an empty journal
    /// for it. The snapshot becomes visible atomically by rename; a crash
    /// before the journal is recreated leaves a journal whose header names
    /// an older generation, which `load_latest()` then ignores.
    pub async fn write_snapshot<T>(
        &mut self,
        state: &T,
    ) -> Result<FileSink, DagError>
    where
        T: Serialize,
    {
        let generation = self.generation + 1;
        let envelope = SnapshotEnvelope {
            format_version: SNAPSHOT_FORMAT_VERSION,
            generation,
            state,
        };
        let bytes = encode_to_vec_named(&envelope)?;

        let tmp_path = self.dir.join(SNAPSHOT_TMP_FILE);
        let mut tmp = File::create(&tmp_path).await?;
        tmp.write_all(&bytes).await?;
        tmp.sync_all().await?;
        drop(tmp);
        fs::rename(&tmp_path, self.dir.join(SNAPSHOT_FILE)).await?;
        sync_dir(&self.dir).await?; // rename durable before journal reset
        self.generation = generation;

        let journal_path = self.journal_path();
        let mut journal = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&journal_path)
            .await?;
        journal.write_all(JOURNAL_MAGIC).await?;
        journal.write_all(&generation.to_be_bytes()).await?;
        journal.sync_all().await?;
        drop(journal);
        sync_dir(&self.dir).await?;

        pf_debug!(
            "wrote snapshot generation {} ({} bytes)",
            generation,
            bytes.len()
        );
        FileSink::open(&journal_path).await
    }

    /// Loads the newest snapshot and opens the journal tail that follows it.
    pub async fn load_latest<T>(&mut self) -> Result<Recovered<T>, DagError>
    where
        T: DeserializeOwned,
    {
        let bytes = match fs::read(self.dir.join(SNAPSHOT_FILE)).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                pf_info!("no snapshot in {}, first run", self.dir.display());
                return Ok(Recovered {
                    state: None,
                    journal: Box::new(io::empty()),
                });
            }
            Err(e) => return Err(e.into()),
        };

        let envelope: SnapshotEnvelope<T> = match decode_from_slice(&bytes) {
            Ok(envelope) => envelope,
            Err(e) => {
                return logged_err!("snapshot is undecodable: {}", e);
            }
        };
        if envelope.format_version != SNAPSHOT_FORMAT_VERSION {
            return logged_err!(
                "unknown snapshot format version {}",
                envelope.format_version
            );
        }
        self.generation = envelope.generation;

        let journal = self.open_journal_tail(envelope.generation).await?;
        pf_info!("loaded snapshot generation {}", envelope.generation);
        Ok(Recovered {
            state: Some(envelope.state),
            journal,
        })
    }

    /// Opens the journal for reading if it belongs to the given snapshot
    /// generation, else yields an empty reader.
    async fn open_journal_tail(
        &self,
        generation: u64,
    ) -> Result<Box<dyn AsyncRead + Unpin + Send>, DagError> {
        let mut file = match File::open(self.journal_path()).await {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                pf_warn!("journal missing, treating as empty");
                return Ok(Box::new(io::empty()));
            }
            Err(e) => return Err(e.into()),
        };

        let mut header = [0u8; JOURNAL_HEADER_LEN];
        let mut filled = 0;
        while filled < JOURNAL_HEADER_LEN {
            let n = file.read(&mut header[filled..]).await?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        if filled < JOURNAL_HEADER_LEN || &header[..4] != JOURNAL_MAGIC {
            pf_warn!("journal header incomplete, treating as empty");
            return Ok(Box::new(io::empty()));
        }

        let mut gen_bytes = [0u8; 8];
        gen_bytes.copy_from_slice(&header[4..]);
        let journal_gen = u64::from_be_bytes(gen_bytes);
        if journal_gen != generation {
            pf_warn!(
                "journal generation {} != snapshot generation {}, ignoring",
                journal_gen,
                generation
            );
            return Ok(Box::new(io::empty()));
        }
        Ok(Box::new(file))
    }

    /// Atomically publishes the connect record of this application.
    pub async fn write_connect_record(
        &self,
        record: &ConnectRecord,
    ) -> Result<(), DagError> {
        connect::write_record(&self.dir, record).await?;
        pf_info!("published connect record {:?}", record);
        Ok(())
    }

    /// Reads the connect record of the application at `dir`.
    pub async fn read_connect_record(
        dir: impl AsRef<Path>,
    ) -> Result<ConnectRecord, DagError> {
        connect::read_record(dir.as_ref()).await
    }
}

#[cfg(test)]
mod recovery_tests {
    use super::*;
    use std::collections::BTreeMap;

    type Kv = BTreeMap<String, u64>;

    async fn fresh_dir(name: &str) -> Result<PathBuf, DagError> {
        let dir = PathBuf::from(format!("/tmp/dagmaster-test-{}", name));
        let _ = fs::remove_dir_all(&dir).await;
        Ok(dir)
    }

    async fn read_all(
        mut journal: Box<dyn AsyncRead + Unpin + Send>,
    ) -> Result<Vec<u8>, DagError> {
        let mut buf = vec![];
        journal.read_to_end(&mut buf).await?;
        Ok(buf)
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 1)]
    async fn first_run_is_empty() -> Result<(), DagError> {
        let dir = fresh_dir("store-empty").await?;
        let mut store = RecoveryStore::new_and_setup(&dir).await?;
        let recovered = store.load_latest::<Kv>().await?;
        assert!(recovered.state.is_none());
        assert!(read_all(recovered.journal).await?.is_empty());
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 1)]
    async fn snapshot_then_tail() -> Result<(), DagError> {
        use crate::journal::JournalSink;

        let dir = fresh_dir("store-tail").await?;
        let mut store = RecoveryStore::new_and_setup(&dir).await?;
        let mut kv = Kv::new();
        kv.insert("x".into(), 7);
        let mut sink = store.write_snapshot(&kv).await?;
        sink.append(b"tail-bytes").await?;
        assert!(dir.join(SNAPSHOT_FILE).exists());
        assert!(!dir.join(SNAPSHOT_TMP_FILE).exists());

        let mut reopened = RecoveryStore::new_and_setup(&dir).await?;
        let recovered = reopened.load_latest::<Kv>().await?;
        assert_eq!(recovered.state, Some(kv.clone()));
        assert_eq!(reopened.generation(), 1);
        assert_eq!(read_all(recovered.journal).await?, b"tail-bytes");

        // a second snapshot starts an empty journal
        kv.insert("y".into(), 8);
        reopened.write_snapshot(&kv).await?;
        let recovered = reopened.load_latest::<Kv>().await?;
        assert_eq!(recovered.state, Some(kv));
        assert_eq!(reopened.generation(), 2);
        assert!(read_all(recovered.journal).await?.is_empty());
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 1)]
    async fn stale_journal_ignored() -> Result<(), DagError> {
        use crate::journal::JournalSink;

        let dir = fresh_dir("store-stale").await?;
        let mut store = RecoveryStore::new_and_setup(&dir).await?;
        let mut sink = store.write_snapshot(&Kv::new()).await?;
        sink.append(b"old-generation").await?;
        let stale = fs::read(store.journal_path()).await?;

        // crash after the new snapshot was renamed in but before the
        // journal was recreated
        store.write_snapshot(&Kv::new()).await?;
        fs::write(store.journal_path(), &stale).await?;
        let recovered = store.load_latest::<Kv>().await?;
        assert!(read_all(recovered.journal).await?.is_empty());

        // incomplete header
        fs::write(store.journal_path(), b"DGJ").await?;
        let recovered = store.load_latest::<Kv>().await?;
        assert!(read_all(recovered.journal).await?.is_empty());
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 1)]
    async fn corrupt_snapshot_fatal() -> Result<(), DagError> {
        let dir = fresh_dir("store-corrupt").await?;
        let mut store = RecoveryStore::new_and_setup(&dir).await?;
        fs::write(dir.join(SNAPSHOT_FILE), b"\xc1garbage").await?;
        assert!(store.load_latest::<Kv>().await.is_err());

        let bad_version = SnapshotEnvelope {
            format_version: 99,
            generation: 1,
            state: Kv::new(),
        };
        fs::write(dir.join(SNAPSHOT_FILE), encode_to_vec_named(&bad_version)?)
            .await?;
        assert!(store.load_latest::<Kv>().await.is_err());
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 1)]
    async fn connect_record_roundtrip() -> Result<(), DagError> {
        let dir = fresh_dir("store-connect").await?;
        let store = RecoveryStore::new_and_setup(&dir).await?;
        assert!(RecoveryStore::read_connect_record(&dir).await.is_err());

        let record = ConnectRecord {
            addr: "127.0.0.1:4040".into(),
            rpc_timeout_ms: 500,
            retry_delay_ms: 100,
            retry_timeout_ms: 1500,
        };
        store.write_connect_record(&record).await?;
        let read = RecoveryStore::read_connect_record(&dir).await?;
        assert_eq!(read, record);
        assert_eq!(read.retry_timeout().as_millis(), 1500);
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 1)]
    async fn renames_leave_no_temp_files() -> Result<(), DagError> {
        let dir = fresh_dir("store-durable").await?;
        let mut store = RecoveryStore::new_and_setup(&dir).await?;
        let record = ConnectRecord {
            addr: "127.0.0.1:4041".into(),
            rpc_timeout_ms: 500,
            retry_delay_ms: 100,
            retry_timeout_ms: 1500,
        };
        store.write_connect_record(&record).await?;
        store.write_connect_record(&record).await?;
        store.write_snapshot(&7u64).await?;

        let mut names = vec![];
        let mut entries = fs::read_dir(&dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            names.push(entry.file_name().to_string_lossy().into_owned());
        }
        names.sort();
        assert!(names.iter().all(|n| !n.ends_with(".tmp")), "{:?}", names);
        assert!(names.contains(&SNAPSHOT_FILE.to_string()));

        sync_dir(store.dir()).await?;
        assert!(sync_dir(&dir.join("missing")).await.is_err());
        Ok(())
    }
}
