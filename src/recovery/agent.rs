//! Checkpoint artifact storage.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use crate::plan::OperatorId;
use crate::recovery::sync_dir;
use crate::utils::DagError;

use async_trait::async_trait;

use tokio::fs::{self, File};
use tokio::io::AsyncWriteExt;

/// Storage for operator checkpoint artifacts, keyed by (operator id, window
/// id). Workers save artifacts while the master may be down; the master
/// lists them on recovery.
#[async_trait]
pub trait StorageAgent: Send + Sync {
    /// Stores an artifact, replacing any previous one with the same key.
    async fn save(
        &self,
        operator: OperatorId,
        window_id: u64,
        data: &[u8],
    ) -> Result<(), DagError>;

    /// Loads an artifact.
    async fn load(
        &self,
        operator: OperatorId,
        window_id: u64,
    ) -> Result<Vec<u8>, DagError>;

    /// Deletes an artifact; deleting a missing artifact is not an error.
    async fn delete(
        &self,
        operator: OperatorId,
        window_id: u64,
    ) -> Result<(), DagError>;

    /// Lists stored window ids of an operator in ascending order.
    async fn window_ids(
        &self,
        operator: OperatorId,
    ) -> Result<Vec<u64>, DagError>;
}

/// Filesystem storage agent laying out artifacts as
/// `<root>/checkpoints/<operator>/<window id as 16 hex digits>`.
#[derive(Debug, Clone)]
pub struct FsStorageAgent {
    root: PathBuf,
}

impl FsStorageAgent {
    pub fn new(root: impl AsRef<Path>) -> Self {
        FsStorageAgent {
            root: root.as_ref().join("checkpoints"),
        }
    }

    fn operator_dir(&self, operator: OperatorId) -> PathBuf {
        self.root.join(operator.to_string())
    }

    fn artifact_path(&self, operator: OperatorId, window_id: u64) -> PathBuf {
        self.operator_dir(operator)
            .join(format!("{:016x}", window_id))
    }
}

#[async_trait]
impl StorageAgent for FsStorageAgent {
    async fn save(
        &self,
        operator: OperatorId,
        window_id: u64,
        data: &[u8],
    ) -> Result<(), DagError> {
        let dir = self.operator_dir(operator);
        fs::create_dir_all(&dir).await?;
        let path = self.artifact_path(operator, window_id);
        let tmp_path = path.with_extension("tmp");
        let mut tmp = File::create(&tmp_path).await?;
        tmp.write_all(data).await?;
        tmp.sync_all().await?;
        drop(tmp);
        fs::rename(&tmp_path, &path).await?;
        sync_dir(&dir).await?;
        pf_trace!("saved checkpoint {} of operator {}", window_id, operator);
        Ok(())
    }

    async fn load(
        &self,
        operator: OperatorId,
        window_id: u64,
    ) -> Result<Vec<u8>, DagError> {
        Ok(fs::read(self.artifact_path(operator, window_id)).await?)
    }

    async fn delete(
        &self,
        operator: OperatorId,
        window_id: u64,
    ) -> Result<(), DagError> {
        match fs::remove_file(self.artifact_path(operator, window_id)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn window_ids(
        &self,
        operator: OperatorId,
    ) -> Result<Vec<u64>, DagError> {
        let mut entries = match fs::read_dir(self.operator_dir(operator)).await
        {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(vec![]),
            Err(e) => return Err(e.into()),
        };

        let mut ids = vec![];
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let Some(name) = name.to_str() else {
                continue;
            };
            // skip leftovers of interrupted saves
            if name.len() != 16 {
                continue;
            }
            if let Ok(id) = u64::from_str_radix(name, 16) {
                ids.push(id);
            }
        }
        ids.sort_unstable();
        Ok(ids)
    }
}

#[cfg(test)]
mod agent_tests {
    use super::*;

    #[tokio::test(flavor = "multi_thread", worker_threads = 1)]
    async fn save_list_load_delete() -> Result<(), DagError> {
        let root = Path::new("/tmp/dagmaster-test-agent");
        let _ = fs::remove_dir_all(root).await;
        let agent = FsStorageAgent::new(root);

        assert!(agent.window_ids(1).await?.is_empty());
        agent.save(1, 10, b"ten").await?;
        agent.save(1, 3, b"three").await?;
        agent.save(2, 7, b"seven").await?;
        assert_eq!(agent.window_ids(1).await?, vec![3, 10]);
        assert_eq!(agent.window_ids(2).await?, vec![7]);
        assert_eq!(agent.load(1, 3).await?, b"three".to_vec());
        assert!(root
            .join("checkpoints/1/000000000000000a")
            .exists());

        agent.delete(1, 3).await?;
        agent.delete(1, 3).await?;
        assert_eq!(agent.window_ids(1).await?, vec![10]);
        assert!(agent.load(1, 3).await.is_err());
        Ok(())
    }
}
