//! Master-side worker-facing RPC reactor.

use std::net::SocketAddr;

use crate::rpc::messages::{
    CallId, ReplyFrame, RequestFrame, UmbilicalReply, UmbilicalRequest,
};
use crate::utils::{
    safe_tcp_read, safe_tcp_write, tcp_bind_with_retry, DagError,
};

use bytes::BytesMut;

use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Worker connection ID type.
pub type ConnId = u64;

/// An incoming call. Replying consumes it; calls may be answered in any
/// order.
#[derive(Debug)]
pub struct WorkerCall {
    pub conn: ConnId,
    pub call: CallId,
    pub req: UmbilicalRequest,
    responder: mpsc::UnboundedSender<ReplyFrame>,
}

impl WorkerCall {
    /// Sends the reply back on the connection the call came from. Fails if
    /// that connection is gone.
    pub fn reply(self, reply: UmbilicalReply) -> Result<(), DagError> {
        self.responder
            .send((self.call, reply))
            .map_err(|_| DagError::msg(format!("conn {} gone", self.conn)))
    }
}

/// The worker-facing reactor. Owns the acceptor task; dropping the reactor
/// stops accepting.
pub struct WorkerReactor {
    /// Receiver side of the call channel.
    rx_call: mpsc::UnboundedReceiver<WorkerCall>,

    /// Map from conn ID -> sender side of its reply channel, shared with the
    /// acceptor task.
    tx_replies: flashmap::ReadHandle<ConnId, mpsc::UnboundedSender<ReplyFrame>>,

    /// Address actually bound.
    local_addr: SocketAddr,

    /// Join handle of the acceptor task.
    acceptor_handle: JoinHandle<()>,
}

impl WorkerReactor {
    /// Binds the listener and spawns the acceptor task.
    pub async fn new_and_setup(
        bind_addr: SocketAddr,
    ) -> Result<Self, DagError> {
        let (tx_call, rx_call) = mpsc::unbounded_channel();
        let (tx_replies_write, tx_replies_read) =
            flashmap::new::<ConnId, mpsc::UnboundedSender<ReplyFrame>>();

        let listener = tcp_bind_with_retry(bind_addr, 10).await?;
        let local_addr = listener.local_addr()?;
        let mut acceptor =
            WorkerReactorAcceptorTask::new(tx_call, tx_replies_write, listener);
        let acceptor_handle = tokio::spawn(async move { acceptor.run().await });

        Ok(WorkerReactor {
            rx_call,
            tx_replies: tx_replies_read,
            local_addr,
            acceptor_handle,
        })
    }

    /// Address the listener is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Number of currently open worker connections.
    pub fn num_conns(&self) -> usize {
        let tx_replies_guard = self.tx_replies.guard();
        tx_replies_guard.len()
    }

    /// Waits for the next call from some worker.
    pub async fn recv_call(&mut self) -> Result<WorkerCall, DagError> {
        match self.rx_call.recv().await {
            Some(call) => Ok(call),
            None => logged_err!("call channel has been closed"),
        }
    }
}

impl Drop for WorkerReactor {
    fn drop(&mut self) {
        self.acceptor_handle.abort();
    }
}

/// WorkerReactor connection acceptor task.
struct WorkerReactorAcceptorTask {
    tx_call: mpsc::UnboundedSender<WorkerCall>,
    tx_replies:
        flashmap::WriteHandle<ConnId, mpsc::UnboundedSender<ReplyFrame>>,

    listener: TcpListener,
    responder_handles: Vec<(ConnId, JoinHandle<()>)>,

    next_conn_id: ConnId,

    tx_exit: mpsc::UnboundedSender<ConnId>,
    rx_exit: mpsc::UnboundedReceiver<ConnId>,
}

impl WorkerReactorAcceptorTask {
    fn new(
        tx_call: mpsc::UnboundedSender<WorkerCall>,
        tx_replies: flashmap::WriteHandle<
            ConnId,
            mpsc::UnboundedSender<ReplyFrame>,
        >,
        listener: TcpListener,
    ) -> Self {
        // get notified about termination of responder tasks
        let (tx_exit, rx_exit) = mpsc::unbounded_channel();

        WorkerReactorAcceptorTask {
            tx_call,
            tx_replies,
            listener,
            responder_handles: vec![],
            next_conn_id: 1,
            tx_exit,
            rx_exit,
        }
    }

    /// Registers a new worker connection and spawns its responder.
    fn accept_new_conn(
        &mut self,
        stream: TcpStream,
        addr: SocketAddr,
        id: ConnId,
    ) -> Result<(), DagError> {
        let mut tx_replies_guard = self.tx_replies.guard();
        if tx_replies_guard.contains_key(&id) {
            return logged_err!("duplicate conn ID accepted: {}", id);
        }
        pf_debug!("accepted worker conn {} '{}'", id, addr);

        let (tx_reply, rx_reply) = mpsc::unbounded_channel();
        tx_replies_guard.insert(id, tx_reply.clone());
        tx_replies_guard.publish();

        let mut responder = WorkerReactorResponderTask::new(
            id,
            addr,
            stream,
            self.tx_call.clone(),
            tx_reply,
            rx_reply,
            self.tx_exit.clone(),
        );
        let handle = tokio::spawn(async move { responder.run().await });
        self.responder_handles.push((id, handle));
        Ok(())
    }

    /// Removes handles of a closed worker connection.
    fn remove_left_conn(&mut self, id: ConnId) -> Result<(), DagError> {
        let mut tx_replies_guard = self.tx_replies.guard();
        if !tx_replies_guard.contains_key(&id) {
            return logged_err!("conn {} not found among active ones", id);
        }
        tx_replies_guard.remove(id);
        tx_replies_guard.publish();
        self.responder_handles.retain(|(conn, _)| *conn != id);
        Ok(())
    }

    async fn run(&mut self) {
        pf_debug!("worker acceptor task spawned");
        if let Ok(local_addr) = self.listener.local_addr() {
            pf_info!("accepting workers on '{}'", local_addr);
        }

        loop {
            tokio::select! {
                // new worker connection
                accepted = self.listener.accept() => {
                    let (stream, addr) = match accepted {
                        Ok(accepted) => accepted,
                        Err(e) => {
                            pf_warn!("error accepting worker conn: {}", e);
                            continue;
                        }
                    };
                    if let Err(e) = self.accept_new_conn(
                        stream,
                        addr,
                        self.next_conn_id,
                    ) {
                        pf_error!("error accepting new conn: {}", e);
                    } else {
                        self.next_conn_id += 1;
                    }
                },

                // a responder task exits
                id = self.rx_exit.recv() => {
                    let Some(id) = id else {
                        break;
                    };
                    if let Err(e) = self.remove_left_conn(id) {
                        pf_error!("error removing left conn {}: {}", id, e);
                    }
                },
            }
        }
    }
}

impl Drop for WorkerReactorAcceptorTask {
    fn drop(&mut self) {
        for (_, handle) in &self.responder_handles {
            handle.abort();
        }
    }
}

/// WorkerReactor per-connection responder task.
struct WorkerReactorResponderTask {
    id: ConnId,
    addr: SocketAddr,

    conn_read: OwnedReadHalf,
    conn_write: OwnedWriteHalf,

    tx_call: mpsc::UnboundedSender<WorkerCall>,
    req_buf: BytesMut,

    tx_reply: mpsc::UnboundedSender<ReplyFrame>,
    rx_reply: mpsc::UnboundedReceiver<ReplyFrame>,
    reply_buf: BytesMut,
    reply_buf_cursor: usize,
    retrying: bool,

    tx_exit: mpsc::UnboundedSender<ConnId>,
}

impl WorkerReactorResponderTask {
    fn new(
        id: ConnId,
        addr: SocketAddr,
        conn: TcpStream,
        tx_call: mpsc::UnboundedSender<WorkerCall>,
        tx_reply: mpsc::UnboundedSender<ReplyFrame>,
        rx_reply: mpsc::UnboundedReceiver<ReplyFrame>,
        tx_exit: mpsc::UnboundedSender<ConnId>,
    ) -> Self {
        let (conn_read, conn_write) = conn.into_split();

        WorkerReactorResponderTask {
            id,
            addr,
            conn_read,
            conn_write,
            tx_call,
            req_buf: BytesMut::with_capacity(8 + 1024),
            tx_reply,
            rx_reply,
            reply_buf: BytesMut::with_capacity(8 + 1024),
            reply_buf_cursor: 0,
            retrying: false,
            tx_exit,
        }
    }

    /// Reads a request frame.
    /// This is a non-method function to ease `tokio::select!` sharing.
    async fn read_req(
        req_buf: &mut BytesMut,
        conn_read: &mut OwnedReadHalf,
    ) -> Result<RequestFrame, DagError> {
        safe_tcp_read(req_buf, conn_read).await
    }

    /// Writes a reply frame.
    /// This is a non-method function to ease `tokio::select!` sharing.
    fn write_reply(
        reply_buf: &mut BytesMut,
        reply_buf_cursor: &mut usize,
        conn_write: &OwnedWriteHalf,
        reply: Option<&ReplyFrame>,
    ) -> Result<bool, DagError> {
        safe_tcp_write(reply_buf, reply_buf_cursor, conn_write, reply)
    }

    async fn run(&mut self) {
        pf_debug!("responder task for conn {} '{}' spawned", self.id, self.addr);

        loop {
            tokio::select! {
                // gets a reply to send back
                reply = self.rx_reply.recv(), if !self.retrying => {
                    let Some(reply) = reply else {
                        break;
                    };
                    match Self::write_reply(
                        &mut self.reply_buf,
                        &mut self.reply_buf_cursor,
                        &self.conn_write,
                        Some(&reply),
                    ) {
                        Ok(true) => {}
                        Ok(false) => {
                            pf_debug!("should start retrying reply send -> {}", self.id);
                            self.retrying = true;
                        }
                        Err(e) => {
                            pf_error!("error replying -> {}: {}", self.id, e);
                            break;
                        }
                    }
                },

                // retrying last unsuccessful reply send
                _ = self.conn_write.writable(), if self.retrying => {
                    match Self::write_reply(
                        &mut self.reply_buf,
                        &mut self.reply_buf_cursor,
                        &self.conn_write,
                        None,
                    ) {
                        Ok(true) => {
                            pf_debug!("finished retrying last reply send -> {}", self.id);
                            self.retrying = false;
                        }
                        Ok(false) => {}
                        Err(e) => {
                            pf_error!("error retrying reply -> {}: {}", self.id, e);
                            break;
                        }
                    }
                },

                // receives a request from the worker
                req = Self::read_req(&mut self.req_buf, &mut self.conn_read) => {
                    match req {
                        Ok((call, req)) => {
                            pf_trace!("recv <- {} call {} {:?}", self.id, call, req);
                            let call = WorkerCall {
                                conn: self.id,
                                call,
                                req,
                                responder: self.tx_reply.clone(),
                            };
                            if let Err(e) = self.tx_call.send(call) {
                                pf_error!("error forwarding call from {}: {}", self.id, e);
                            }
                        }

                        Err(_) => {
                            pf_debug!("worker conn {} closed", self.id);
                            break;
                        }
                    }
                },
            }
        }

        if let Err(e) = self.tx_exit.send(self.id) {
            pf_error!("error sending exit signal for {}: {}", self.id, e);
        }
    }
}
