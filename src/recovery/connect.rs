//! Connect record published by the master for its workers.

use std::path::Path;

use crate::recovery::sync_dir;
use crate::utils::DagError;

use serde::{Deserialize, Serialize};

use tokio::fs::{self, File};
use tokio::io::AsyncWriteExt;
use tokio::time::Duration;

/// File name of the connect record inside the application directory.
pub(crate) const CONNECT_FILE: &str = "connect.toml";
const CONNECT_TMP_FILE: &str = "connect.toml.tmp";

/// Where the current master listens and which timeouts a client should use
/// when talking to it. Rewritten whenever a master instance starts serving.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectRecord {
    /// Master RPC address as "host:port".
    pub addr: String,

    /// Per-call timeout in millisecs.
    pub rpc_timeout_ms: u64,

    /// Delay between retries in millisecs.
    pub retry_delay_ms: u64,

    /// Cumulative retry budget in millisecs.
    pub retry_timeout_ms: u64,
}

impl ConnectRecord {
    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_millis(self.rpc_timeout_ms)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn retry_timeout(&self) -> Duration {
        Duration::from_millis(self.retry_timeout_ms)
    }
}

/// Atomically replaces the connect record under `dir`.
pub(crate) async fn write_record(
    dir: &Path,
    record: &ConnectRecord,
) -> Result<(), DagError> {
    let text = toml::to_string(record)?;
    let tmp_path = dir.join(CONNECT_TMP_FILE);
    let mut tmp = File::create(&tmp_path).await?;
    tmp.write_all(text.as_bytes()).await?;
    tmp.sync_all().await?;
    drop(tmp);
    fs::rename(&tmp_path, dir.join(CONNECT_FILE)).await?;
    sync_dir(dir).await
}

/// Reads the connect record under `dir`. A missing record is an error.
pub(crate) async fn read_record(dir: &Path) -> Result<ConnectRecord, DagError> {
    let path = dir.join(CONNECT_FILE);
    let text = match fs::read_to_string(&path).await {
        Ok(text) => text,
        Err(e) => {
            return logged_err!(
                "cannot read connect record {}: {}",
                path.display(),
                e
            );
        }
    };
    Ok(toml::from_str(&text)?)
}
