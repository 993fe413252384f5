//! Coordination store client session: the thin capability wrapper the
//! coordination core is written against.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use bytes::BytesMut;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::store::{
    Stat, StoreFault, StoreReply, StoreRequest, WatchEvent, WatchKind, Xid,
};
use crate::utils::{
    safe_tcp_read, safe_tcp_write, tcp_connect_with_retry, SquallError,
};

/// Receiver half of one watch subscription. Delivers one `WatchEvent` per
/// observed change, in order; the stream ending means the session is gone.
pub type WatchRx = mpsc::UnboundedReceiver<WatchEvent>;

/// In-flight request registry shared with the messenger task.
type PendingMap = Mutex<HashMap<Xid, oneshot::Sender<StoreReply>>>;

/// Active watch subscriptions shared with the messenger task. Watching the
/// same (kind, path) again replaces the previous subscription's stream.
type WatchMap = Mutex<HashMap<(WatchKind, String), mpsc::UnboundedSender<WatchEvent>>>;

/// A connected coordination store session. All methods take `&self`;
/// share across tasks via `Arc`. Dropping the session (or any connection
/// loss) ends it, which removes its ephemeral nodes service-side.
pub struct StoreSession {
    /// Sender side of the request channel into the messenger task.
    tx_send: mpsc::UnboundedSender<StoreRequest>,

    /// In-flight requests awaiting replies.
    pending: Arc<PendingMap>,

    /// Armed watch subscriptions.
    watches: Arc<WatchMap>,

    /// Set once the connection is known dead; all calls fail fast after.
    dead: Arc<AtomicBool>,

    /// Next request correlation ID.
    next_xid: AtomicU64,

    /// Messenger task join handle.
    _messenger_handle: JoinHandle<()>,
}

// StoreSession public API implementation
impl StoreSession {
    /// Connects to the coordination store service.
    pub async fn connect(addr: SocketAddr) -> Result<Self, SquallError> {
        let conn = tcp_connect_with_retry(addr, 10).await?;
        let (tx_send, rx_send) = mpsc::unbounded_channel();
        let pending: Arc<PendingMap> = Arc::default();
        let watches: Arc<WatchMap> = Arc::default();
        let dead = Arc::new(AtomicBool::new(false));

        let messenger_handle = tokio::spawn(Self::session_messenger_task(
            conn,
            rx_send,
            pending.clone(),
            watches.clone(),
            dead.clone(),
        ));

        Ok(StoreSession {
            tx_send,
            pending,
            watches,
            dead,
            next_xid: AtomicU64::new(1),
            _messenger_handle: messenger_handle,
        })
    }

    /// Creates an ephemeral node tied to this session. Fails with
    /// `SquallError::NodeExists` if the path is taken.
    pub async fn register_ephemeral(
        &self,
        path: &str,
        data: Vec<u8>,
    ) -> Result<Stat, SquallError> {
        let xid = self.take_xid();
        let reply = self
            .do_call(StoreRequest::Register {
                xid,
                path: path.into(),
                data,
            })
            .await?;
        Self::expect_stat(path, reply)
    }

    /// Creates a persistent node. Fails with `SquallError::NodeExists` if
    /// the path is taken; callers that want idempotence treat that as
    /// success.
    pub async fn create_persistent(
        &self,
        path: &str,
        data: Vec<u8>,
    ) -> Result<Stat, SquallError> {
        let xid = self.take_xid();
        let reply = self
            .do_call(StoreRequest::Create {
                xid,
                path: path.into(),
                data,
            })
            .await?;
        Self::expect_stat(path, reply)
    }

    /// Overwrites an existing node's data.
    pub async fn set(
        &self,
        path: &str,
        data: Vec<u8>,
    ) -> Result<Stat, SquallError> {
        let xid = self.take_xid();
        let reply = self
            .do_call(StoreRequest::Set {
                xid,
                path: path.into(),
                data,
            })
            .await?;
        Self::expect_stat(path, reply)
    }

    /// Reads a node's data.
    pub async fn get(
        &self,
        path: &str,
    ) -> Result<(Vec<u8>, Stat), SquallError> {
        self.do_get(path, false).await
    }

    /// Reads a node's data and subscribes to subsequent changes.
    pub async fn get_watch(
        &self,
        path: &str,
    ) -> Result<(Vec<u8>, Stat, WatchRx), SquallError> {
        let rx = self.arm_watch(WatchKind::Data, path);
        match self.do_get(path, true).await {
            Ok((data, stat)) => Ok((data, stat, rx)),
            Err(e) => {
                self.disarm_watch(WatchKind::Data, path);
                Err(e)
            }
        }
    }

    /// Lists a node's children (leaf names).
    pub async fn children(
        &self,
        path: &str,
    ) -> Result<Vec<String>, SquallError> {
        self.do_children(path, false).await
    }

    /// Lists a node's children and subscribes to membership changes.
    pub async fn children_watch(
        &self,
        path: &str,
    ) -> Result<(Vec<String>, WatchRx), SquallError> {
        let rx = self.arm_watch(WatchKind::Children, path);
        match self.do_children(path, true).await {
            Ok(children) => Ok((children, rx)),
            Err(e) => {
                self.disarm_watch(WatchKind::Children, path);
                Err(e)
            }
        }
    }

    /// Gracefully ends the session; ephemerals are removed before this
    /// returns.
    pub async fn close(&self) -> Result<(), SquallError> {
        let xid = self.take_xid();
        match self.do_call(StoreRequest::Close { xid }).await? {
            StoreReply::Closed { .. } => {
                self.dead.store(true, Ordering::SeqCst);
                Ok(())
            }
            reply => Err(SquallError::UnexpectedStore(format!(
                "mismatched reply to close: {:?}",
                reply
            ))),
        }
    }
}

// StoreSession internal helpers
impl StoreSession {
    fn take_xid(&self) -> Xid {
        self.next_xid.fetch_add(1, Ordering::SeqCst)
    }

    async fn do_call(
        &self,
        req: StoreRequest,
    ) -> Result<StoreReply, SquallError> {
        if self.dead.load(Ordering::SeqCst) {
            return Err(SquallError::Connection("session is dead".into()));
        }

        let xid = match &req {
            StoreRequest::Register { xid, .. }
            | StoreRequest::Create { xid, .. }
            | StoreRequest::Set { xid, .. }
            | StoreRequest::Get { xid, .. }
            | StoreRequest::Children { xid, .. }
            | StoreRequest::Close { xid } => *xid,
        };

        let (tx_reply, rx_reply) = oneshot::channel();
        self.pending.lock().unwrap().insert(xid, tx_reply);

        if self.tx_send.send(req).is_err() {
            self.pending.lock().unwrap().remove(&xid);
            return Err(SquallError::Connection("session is dead".into()));
        }

        rx_reply.await.map_err(|_| {
            SquallError::Connection("session lost mid-call".into())
        })
    }

    async fn do_get(
        &self,
        path: &str,
        watch: bool,
    ) -> Result<(Vec<u8>, Stat), SquallError> {
        let xid = self.take_xid();
        let reply = self
            .do_call(StoreRequest::Get {
                xid,
                path: path.into(),
                watch,
            })
            .await?;
        match reply {
            StoreReply::Data { result, .. } => {
                result.map_err(|f| fault_to_err(path, f))
            }
            reply => Err(SquallError::UnexpectedStore(format!(
                "mismatched reply to get: {:?}",
                reply
            ))),
        }
    }

    async fn do_children(
        &self,
        path: &str,
        watch: bool,
    ) -> Result<Vec<String>, SquallError> {
        let xid = self.take_xid();
        let reply = self
            .do_call(StoreRequest::Children {
                xid,
                path: path.into(),
                watch,
            })
            .await?;
        match reply {
            StoreReply::Children { result, .. } => {
                result.map_err(|f| fault_to_err(path, f))
            }
            reply => Err(SquallError::UnexpectedStore(format!(
                "mismatched reply to children: {:?}",
                reply
            ))),
        }
    }

    fn expect_stat(
        path: &str,
        reply: StoreReply,
    ) -> Result<Stat, SquallError> {
        match reply {
            StoreReply::Stat { result, .. } => {
                result.map_err(|f| fault_to_err(path, f))
            }
            reply => Err(SquallError::UnexpectedStore(format!(
                "mismatched reply kind: {:?}",
                reply
            ))),
        }
    }

    fn arm_watch(&self, kind: WatchKind, path: &str) -> WatchRx {
        let (tx, rx) = mpsc::unbounded_channel();
        self.watches
            .lock()
            .unwrap()
            .insert((kind, path.to_string()), tx);
        rx
    }

    fn disarm_watch(&self, kind: WatchKind, path: &str) {
        self.watches
            .lock()
            .unwrap()
            .remove(&(kind, path.to_string()));
    }
}

fn fault_to_err(path: &str, fault: StoreFault) -> SquallError {
    match fault {
        StoreFault::NodeExists => SquallError::NodeExists(path.into()),
        StoreFault::NoNode => SquallError::NoNode(path.into()),
    }
}

// StoreSession session_messenger task implementation
impl StoreSession {
    async fn session_messenger_task(
        conn: TcpStream,
        mut rx_send: mpsc::UnboundedReceiver<StoreRequest>,
        pending: Arc<PendingMap>,
        watches: Arc<WatchMap>,
        dead: Arc<AtomicBool>,
    ) {
        let (mut conn_read, conn_write) = conn.into_split();
        let mut read_buf = BytesMut::new();
        let mut write_buf = BytesMut::new();
        let mut write_buf_cursor = 0;

        let mut retrying = false;
        loop {
            tokio::select! {
                // gets a request to send to the service
                req = rx_send.recv(), if !retrying => {
                    match req {
                        Some(req) => {
                            match Self::write_request(
                                &mut write_buf,
                                &mut write_buf_cursor,
                                &conn_write,
                                Some(&req)
                            ) {
                                Ok(true) => {}
                                Ok(false) => {
                                    retrying = true;
                                }
                                Err(_e) => break,
                            }
                        },
                        None => break, // session handle was dropped
                    }
                },

                // retrying last unsuccessful send
                _ = conn_write.writable(), if retrying => {
                    match Self::write_request(
                        &mut write_buf,
                        &mut write_buf_cursor,
                        &conn_write,
                        None
                    ) {
                        Ok(true) => {
                            retrying = false;
                        }
                        Ok(false) => {}
                        Err(_e) => break,
                    }
                },

                // receives a reply or a pushed watch event
                reply = Self::read_reply(&mut read_buf, &mut conn_read) => {
                    match reply {
                        Ok(StoreReply::Event(ev)) => {
                            Self::dispatch_event(&watches, ev);
                        },

                        Ok(reply) => {
                            let xid = reply.xid().unwrap();
                            let tx_reply =
                                pending.lock().unwrap().remove(&xid);
                            match tx_reply {
                                Some(tx_reply) => {
                                    let _ = tx_reply.send(reply);
                                }
                                None => {
                                    pf_warn!("sess";
                                             "unmatched reply xid {}", xid);
                                }
                            }
                        },

                        Err(_e) => break, // connection gone
                    }
                }
            }
        }

        // declare the session dead: wake every in-flight caller with a
        // connection error and end every watch stream
        dead.store(true, Ordering::SeqCst);
        pending.lock().unwrap().clear();
        watches.lock().unwrap().clear();
        pf_debug!("sess"; "session messenger exited");
    }

    fn dispatch_event(watches: &Arc<WatchMap>, ev: WatchEvent) {
        let key = (ev.kind, ev.path.clone());
        let mut guard = watches.lock().unwrap();
        if let Some(tx) = guard.get(&key) {
            if tx.send(ev).is_err() {
                // subscriber dropped its stream; forget the subscription
                guard.remove(&key);
            }
        }
    }

    async fn read_reply(
        read_buf: &mut BytesMut,
        conn_read: &mut OwnedReadHalf,
    ) -> Result<StoreReply, SquallError> {
        safe_tcp_read(read_buf, conn_read).await
    }

    fn write_request(
        write_buf: &mut BytesMut,
        write_buf_cursor: &mut usize,
        conn_write: &OwnedWriteHalf,
        req: Option<&StoreRequest>,
    ) -> Result<bool, SquallError> {
        safe_tcp_write(write_buf, write_buf_cursor, conn_write, req)
    }
}

#[cfg(test)]
mod session_tests {
    use super::*;
    use crate::store::StoreService;

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn api_create_set_get() -> Result<(), SquallError> {
        let service =
            StoreService::new_and_setup("127.0.0.1:54810".parse()?).await?;
        let sess = StoreSession::connect(service.local_addr()).await?;

        sess.create_persistent("/master_state", vec![0x10]).await?;
        let err = sess.create_persistent("/master_state", vec![0x10]).await;
        assert!(matches!(err, Err(SquallError::NodeExists(_))));

        let stat = sess.set("/master_state", vec![0x11]).await?;
        assert_eq!(stat.version, 1);
        let (data, stat) = sess.get("/master_state").await?;
        assert_eq!(data, vec![0x11]);
        assert_eq!(stat.version, 1);

        let err = sess.get("/no_such_node").await;
        assert!(matches!(err, Err(SquallError::NoNode(_))));
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn api_ephemeral_lifecycle() -> Result<(), SquallError> {
        let service =
            StoreService::new_and_setup("127.0.0.1:54811".parse()?).await?;
        let sess = StoreSession::connect(service.local_addr()).await?;
        sess.create_persistent("/living_processors", vec![]).await?;

        let other = StoreSession::connect(service.local_addr()).await?;
        other
            .register_ephemeral("/living_processors/src-0", vec![0x01])
            .await?;

        // duplicate registration refused, even from another session
        let dup = sess
            .register_ephemeral("/living_processors/src-0", vec![0x01])
            .await;
        assert!(matches!(dup, Err(SquallError::NodeExists(_))));

        let (children, mut watch_rx) =
            sess.children_watch("/living_processors").await?;
        assert_eq!(children, vec!["src-0"]);

        // graceful close removes the ephemeral and fires the watch
        other.close().await?;
        let ev = watch_rx.recv().await.unwrap();
        assert_eq!(ev.kind, WatchKind::Children);
        assert_eq!(ev.path, "/living_processors");
        assert_eq!(sess.children("/living_processors").await?.len(), 0);
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn api_session_drop_removes_ephemerals() -> Result<(), SquallError>
    {
        let service =
            StoreService::new_and_setup("127.0.0.1:54812".parse()?).await?;
        let sess = StoreSession::connect(service.local_addr()).await?;
        sess.create_persistent("/living_processors", vec![]).await?;

        let other = StoreSession::connect(service.local_addr()).await?;
        other
            .register_ephemeral("/living_processors/agg-0", vec![0x03])
            .await?;
        let (children, mut watch_rx) =
            sess.children_watch("/living_processors").await?;
        assert_eq!(children, vec!["agg-0"]);

        // ungraceful end: just drop the session handle
        drop(other);
        let ev = watch_rx.recv().await.unwrap();
        assert_eq!(ev.kind, WatchKind::Children);
        assert_eq!(sess.children("/living_processors").await?.len(), 0);
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn api_data_watch_ordering() -> Result<(), SquallError> {
        let service =
            StoreService::new_and_setup("127.0.0.1:54813".parse()?).await?;
        let writer = StoreSession::connect(service.local_addr()).await?;
        writer.create_persistent("/master_state", vec![0]).await?;

        let reader = StoreSession::connect(service.local_addr()).await?;
        let (data, _, mut watch_rx) = reader.get_watch("/master_state").await?;
        assert_eq!(data, vec![0]);

        for v in 1..=5u8 {
            writer.set("/master_state", vec![v]).await?;
        }
        // one event per change, in order; the watch stays usable across
        // fires (the wrapper owns re-arming)
        for _ in 1..=5u8 {
            let ev = watch_rx.recv().await.unwrap();
            assert_eq!(ev.kind, WatchKind::Data);
            assert_eq!(ev.path, "/master_state");
        }
        let (data, _) = reader.get("/master_state").await?;
        assert_eq!(data, vec![5]);
        Ok(())
    }
}
