//! Worker-side RPC proxy that follows the master across restarts.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use crate::plan::OperatorId;
use crate::recovery::{ConnectRecord, RecoveryStore};
use crate::rpc::messages::{
    CallId, ContainerHeartbeat, HeartbeatResponse, ReplyFrame,
    UmbilicalReply, UmbilicalRequest,
};
use crate::utils::{
    safe_tcp_read, tcp_connect_with_retry, tcp_write_frame, DagError,
};

use bytes::BytesMut;

use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::{oneshot, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{self, Instant};

/// Map from call ID -> waiter of its reply.
type PendingCalls = Arc<StdMutex<HashMap<CallId, oneshot::Sender<UmbilicalReply>>>>;

/// An open connection to the master. Requests of concurrent callers are
/// written one frame at a time; a reader task hands each reply to the
/// caller waiting on its call id, so a slow call does not hold up others.
struct ConnStream {
    conn_write: Mutex<OwnedWriteHalf>,
    pending: PendingCalls,

    /// Cleared by the reader task when the connection breaks.
    alive: Arc<AtomicBool>,

    reader_handle: JoinHandle<()>,
}

impl ConnStream {
    async fn connect(addr: &str) -> Result<Self, DagError> {
        let stream = tcp_connect_with_retry(addr, 0).await?;
        let (conn_read, conn_write) = stream.into_split();
        pf_debug!("connected to master '{}'", addr);

        let pending: PendingCalls = Arc::new(StdMutex::new(HashMap::new()));
        let alive = Arc::new(AtomicBool::new(true));
        let reader_handle = tokio::spawn(Self::reader_task(
            addr.to_string(),
            conn_read,
            pending.clone(),
            alive.clone(),
        ));
        Ok(ConnStream {
            conn_write: Mutex::new(conn_write),
            pending,
            alive,
            reader_handle,
        })
    }

    /// Reads replies until the connection breaks, then drops every waiter
    /// so their callers fail over.
    async fn reader_task(
        addr: String,
        mut conn_read: OwnedReadHalf,
        pending: PendingCalls,
        alive: Arc<AtomicBool>,
    ) {
        let mut read_buf = BytesMut::with_capacity(8 + 1024);
        loop {
            let (id, reply): ReplyFrame =
                match safe_tcp_read(&mut read_buf, &mut conn_read).await {
                    Ok(frame) => frame,
                    Err(e) => {
                        pf_debug!("conn to '{}' broken: {}", addr, e);
                        break;
                    }
                };
            let waiter = match pending.lock() {
                Ok(mut calls) => calls.remove(&id),
                Err(_) => break,
            };
            match waiter {
                Some(tx) => {
                    if tx.send(reply).is_err() {
                        pf_debug!("caller of call {} went away", id);
                    }
                }
                None => pf_debug!("discarding stale reply to call {}", id),
            }
        }
        alive.store(false, Ordering::Release);
        Self::drop_waiters(&pending);
    }

    fn drop_waiters(pending: &PendingCalls) {
        if let Ok(mut calls) = pending.lock() {
            calls.clear();
        }
    }

    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    /// Sends one request and waits for the reply carrying its call id.
    async fn exchange(
        &self,
        call: CallId,
        req: &UmbilicalRequest,
    ) -> Result<UmbilicalReply, DagError> {
        let (tx, rx) = oneshot::channel();
        self.pending
            .lock()
            .map_err(|_| DagError::msg("pending calls map poisoned"))?
            .insert(call, tx);
        let _waiting = Waiting {
            call,
            pending: &self.pending,
        };

        {
            let mut conn_write = self.conn_write.lock().await;
            tcp_write_frame(&mut *conn_write, &(call, req)).await?;
        }
        rx.await.map_err(|_| {
            DagError::msg(format!("conn lost before reply to call {}", call))
        })
    }

    fn shutdown(&self) {
        self.alive.store(false, Ordering::Release);
        self.reader_handle.abort();
        Self::drop_waiters(&self.pending);
    }
}

impl Drop for ConnStream {
    fn drop(&mut self) {
        self.reader_handle.abort();
    }
}

/// Unregisters a call's waiter when its caller stops waiting, whether
/// answered, failed, or cancelled by a timeout.
struct Waiting<'a> {
    call: CallId,
    pending: &'a PendingCalls,
}

impl Drop for Waiting<'_> {
    fn drop(&mut self) {
        if let Ok(mut calls) = self.pending.lock() {
            calls.remove(&self.call);
        }
    }
}

/// Connection to one master address, created lazily and shared by all
/// callers that resolved the same address.
struct RpcConn {
    addr: String,
    stream: Mutex<Option<Arc<ConnStream>>>,
}

impl RpcConn {
    fn new(addr: String) -> Self {
        RpcConn {
            addr,
            stream: Mutex::new(None),
        }
    }

    /// Returns the open stream, (re)connecting if there is none or the
    /// current one broke.
    async fn stream(&self) -> Result<Arc<ConnStream>, DagError> {
        let mut guard = self.stream.lock().await;
        match guard.as_ref() {
            Some(stream) if stream.is_alive() => Ok(stream.clone()),
            _ => {
                if guard.is_some() {
                    pf_debug!("reconnecting to '{}'", self.addr);
                }
                let stream = Arc::new(ConnStream::connect(&self.addr).await?);
                *guard = Some(stream.clone());
                Ok(stream)
            }
        }
    }

    /// Performs one request/reply round trip. Any transport error drops
    /// the stream so the next attempt reconnects.
    async fn round_trip(
        &self,
        call: CallId,
        req: &UmbilicalRequest,
    ) -> Result<UmbilicalReply, DagError> {
        let stream = self.stream().await?;
        match stream.exchange(call, req).await {
            Ok(reply) => Ok(reply),
            Err(e) => {
                stream.shutdown();
                let mut guard = self.stream.lock().await;
                if guard.as_ref().map_or(false, |s| Arc::ptr_eq(s, &stream)) {
                    *guard = None;
                }
                Err(e)
            }
        }
    }

    async fn close(&self) {
        if let Some(stream) = self.stream.lock().await.take() {
            stream.shutdown();
        }
    }
}

/// Currently resolved master endpoint.
#[derive(Clone)]
struct Resolved {
    record: ConnectRecord,
    conn: Arc<RpcConn>,
}

/// RPC client to the master. The master address and timeouts come from
/// the application's connect record, which is re-read whenever a call
/// fails at the transport level; calls are retried until they succeed or
/// their retry budget runs out. Safe to share among concurrent callers.
pub struct FailoverRpcProxy {
    /// Application directory holding the connect record.
    app_dir: PathBuf,

    /// Endpoint in use; replaced when the record names a new address.
    resolved: RwLock<Resolved>,

    /// Next call ID to assign.
    next_call: AtomicU64,
}

impl FailoverRpcProxy {
    /// Creates the proxy from the connect record of the application at
    /// `app_dir`. A missing record is an error.
    pub async fn new_and_setup(
        app_dir: impl AsRef<Path>,
    ) -> Result<Self, DagError> {
        let app_dir = app_dir.as_ref().to_path_buf();
        let record = RecoveryStore::read_connect_record(&app_dir).await?;
        pf_info!("proxy resolved master at '{}'", record.addr);
        let conn = Arc::new(RpcConn::new(record.addr.clone()));
        Ok(FailoverRpcProxy {
            app_dir,
            resolved: RwLock::new(Resolved { record, conn }),
            next_call: AtomicU64::new(1),
        })
    }

    /// Connect record currently in use.
    pub async fn connect_record(&self) -> ConnectRecord {
        self.resolved.read().await.record.clone()
    }

    /// Drops the current connection; the next call reconnects.
    pub async fn close(&self) {
        let conn = self.resolved.read().await.conn.clone();
        conn.close().await;
    }

    /// Issues a call. Application errors returned by the master come back as
    /// `DagError::Remote` right away; transport failures are retried and
    /// surface as `DagError::TimedOut` once the retry budget is spent.
    pub async fn call(
        &self,
        req: UmbilicalRequest,
    ) -> Result<UmbilicalReply, DagError> {
        let call = self.next_call.fetch_add(1, Ordering::Relaxed);
        let start = Instant::now();

        loop {
            let Resolved { record, conn } = self.resolved.read().await.clone();
            let err = match time::timeout(
                record.rpc_timeout(),
                conn.round_trip(call, &req),
            )
            .await
            {
                Ok(Ok(UmbilicalReply::Error(msg))) => {
                    return Err(DagError::remote(msg));
                }
                Ok(Ok(reply)) => return Ok(reply),
                Ok(Err(e)) => e,
                Err(_) => DagError::timeout(format!(
                    "call {} to '{}' got no reply within {:?}",
                    call,
                    conn.addr,
                    record.rpc_timeout()
                )),
            };
            pf_debug!("call {} failed: {}", call, err);

            // the master may have restarted elsewhere or changed budgets
            let latest =
                match RecoveryStore::read_connect_record(&self.app_dir).await {
                    Ok(latest) => latest,
                    Err(e) => {
                        pf_warn!("re-reading connect record failed: {}", e);
                        record
                    }
                };

            let elapsed = start.elapsed();
            if elapsed >= latest.retry_timeout() {
                pf_warn!("call {} giving up after {:?}", call, elapsed);
                return Err(DagError::timeout(format!(
                    "call {} gave up after {:?}: {}",
                    call, elapsed, err
                )));
            }

            {
                let mut resolved = self.resolved.write().await;
                if resolved.conn.addr != latest.addr
                    && Arc::ptr_eq(&resolved.conn, &conn)
                {
                    pf_info!(
                        "master moved '{}' -> '{}'",
                        resolved.conn.addr,
                        latest.addr
                    );
                    resolved.conn = Arc::new(RpcConn::new(latest.addr.clone()));
                }
                if resolved.conn.addr == latest.addr {
                    resolved.record = latest.clone();
                }
            }

            time::sleep(latest.retry_delay()).await;
        }
    }

    /// Sends a container heartbeat and returns the deployment instructions.
    pub async fn heartbeat(
        &self,
        heartbeat: ContainerHeartbeat,
    ) -> Result<HeartbeatResponse, DagError> {
        match self.call(UmbilicalRequest::Heartbeat(heartbeat)).await? {
            UmbilicalReply::Heartbeat(response) => Ok(response),
            reply => logged_err!("unexpected heartbeat reply {:?}", reply),
        }
    }

    /// Sends a diagnostic log line.
    pub async fn log(
        &self,
        container: impl Into<String>,
        msg: impl Into<String>,
    ) -> Result<(), DagError> {
        let req = UmbilicalRequest::Log {
            container: container.into(),
            msg: msg.into(),
        };
        match self.call(req).await? {
            UmbilicalReply::Ack => Ok(()),
            reply => logged_err!("unexpected log reply {:?}", reply),
        }
    }

    /// Reports an error of some operators of a container.
    pub async fn report_error(
        &self,
        container: impl Into<String>,
        operators: Vec<OperatorId>,
        msg: impl Into<String>,
    ) -> Result<(), DagError> {
        let req = UmbilicalRequest::ReportError {
            container: container.into(),
            operators,
            msg: msg.into(),
        };
        match self.call(req).await? {
            UmbilicalReply::Ack => Ok(()),
            reply => logged_err!("unexpected report reply {:?}", reply),
        }
    }
}
