//! Coordination store service: the node tree, session tracking, and watch
//! dispatch behind the wire protocol.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::net::SocketAddr;

use bytes::BytesMut;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::store::{
    Stat, StoreFault, StoreReply, StoreRequest, WatchEvent, WatchKind,
};
use crate::utils::{
    safe_tcp_read, safe_tcp_write, tcp_bind_with_retry, SquallError,
};

/// Service-side session identity, assigned at accept time.
type SessionId = u64;

/// Commands flowing from the session messenger tasks into the tree task.
#[derive(Debug)]
enum TreeCmd {
    /// A new session connected; its pushed replies go through `tx_push`.
    NewSession {
        sid: SessionId,
        tx_push: mpsc::UnboundedSender<StoreReply>,
    },

    /// A request arrived on a session.
    Request { sid: SessionId, req: StoreRequest },

    /// A session's connection ended (gracefully or not).
    SessionEnd { sid: SessionId },
}

/// The coordination store service. Holds the node tree on a dedicated
/// task; per-session messenger tasks bridge it to TCP connections.
pub struct StoreService {
    local_addr: SocketAddr,

    /// Join handle of the session acceptor task.
    _session_acceptor_handle: JoinHandle<()>,

    /// Join handle of the node tree task.
    _node_tree_handle: JoinHandle<()>,
}

impl StoreService {
    /// Creates a new coordination store service listening on the given
    /// address. Spawns the session acceptor task and the node tree task.
    pub async fn new_and_setup(
        bind_addr: SocketAddr,
    ) -> Result<Self, SquallError> {
        let listener = tcp_bind_with_retry(bind_addr, 10).await?;
        let local_addr = listener.local_addr()?;

        let (tx_tree, rx_tree) = mpsc::unbounded_channel();
        let session_acceptor_handle =
            tokio::spawn(Self::session_acceptor_task(listener, tx_tree));
        let node_tree_handle = tokio::spawn(Self::node_tree_task(rx_tree));

        pf_info!("store"; "accepting sessions on '{}'", local_addr);
        Ok(StoreService {
            local_addr,
            _session_acceptor_handle: session_acceptor_handle,
            _node_tree_handle: node_tree_handle,
        })
    }

    /// Address the service is actually bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
}

// StoreService session_acceptor task implementation
impl StoreService {
    async fn session_acceptor_task(
        listener: TcpListener,
        tx_tree: mpsc::UnboundedSender<TreeCmd>,
    ) {
        pf_debug!("store"; "session_acceptor task spawned");

        let mut next_sid: SessionId = 1;
        loop {
            match listener.accept().await {
                Ok((stream, addr)) => {
                    let sid = next_sid;
                    next_sid += 1;
                    pf_debug!("store"; "accepted session {} from '{}'",
                                       sid, addr);
                    tokio::spawn(Self::session_messenger_task(
                        sid,
                        stream,
                        tx_tree.clone(),
                    ));
                }
                Err(e) => {
                    pf_warn!("store"; "error accepting session: {}", e);
                }
            }
        }
    }

    /// Per-session messenger: forwards requests into the tree task and
    /// writes replies/events back onto the connection.
    async fn session_messenger_task(
        sid: SessionId,
        conn: TcpStream,
        tx_tree: mpsc::UnboundedSender<TreeCmd>,
    ) {
        let (mut conn_read, conn_write) = conn.into_split();
        let mut read_buf = BytesMut::new();
        let mut write_buf = BytesMut::new();
        let mut write_buf_cursor = 0;

        let (tx_push, mut rx_push) = mpsc::unbounded_channel();
        if tx_tree.send(TreeCmd::NewSession { sid, tx_push }).is_err() {
            return;
        }

        let mut retrying = false;
        loop {
            tokio::select! {
                // gets a reply or event to push to the client
                reply = rx_push.recv(), if !retrying => {
                    match reply {
                        Some(reply) => {
                            match Self::write_reply(
                                &mut write_buf,
                                &mut write_buf_cursor,
                                &conn_write,
                                Some(&reply)
                            ) {
                                Ok(true) => {}
                                Ok(false) => {
                                    retrying = true;
                                }
                                Err(_e) => break,
                            }
                        },
                        None => break, // session was ended by the tree task
                    }
                },

                // retrying last unsuccessful write
                _ = conn_write.writable(), if retrying => {
                    match Self::write_reply(
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

                // receives a request from the client
                req = Self::read_request(&mut read_buf, &mut conn_read) => {
                    match req {
                        Ok(req) => {
                            if tx_tree.send(
                                TreeCmd::Request { sid, req }).is_err() {
                                break;
                            }
                        },
                        Err(_e) => break, // connection gone
                    }
                }
            }
        }

        let _ = tx_tree.send(TreeCmd::SessionEnd { sid });
        pf_debug!("store"; "session messenger for {} exited", sid);
    }

    async fn read_request(
        read_buf: &mut BytesMut,
        conn_read: &mut OwnedReadHalf,
    ) -> Result<StoreRequest, SquallError> {
        safe_tcp_read(read_buf, conn_read).await
    }

    fn write_reply(
        write_buf: &mut BytesMut,
        write_buf_cursor: &mut usize,
        conn_write: &OwnedWriteHalf,
        reply: Option<&StoreReply>,
    ) -> Result<bool, SquallError> {
        safe_tcp_write(write_buf, write_buf_cursor, conn_write, reply)
    }
}

/// One node of the hierarchical tree.
#[derive(Debug)]
struct Node {
    data: Vec<u8>,
    stat: Stat,

    /// Owning session for ephemeral nodes; `None` for persistent ones.
    owner: Option<SessionId>,
}

/// Book-keeping for one live session.
#[derive(Debug)]
struct SessionCtx {
    tx_push: mpsc::UnboundedSender<StoreReply>,
    ephemerals: HashSet<String>,
}

/// The node tree plus watch and session registries. Owned entirely by
/// the tree task; all mutation is serialized through its command channel.
#[derive(Debug, Default)]
struct NodeTree {
    nodes: BTreeMap<String, Node>,
    data_watches: HashMap<String, Vec<SessionId>>,
    child_watches: HashMap<String, Vec<SessionId>>,
    sessions: HashMap<SessionId, SessionCtx>,
}

// StoreService node_tree task implementation
impl StoreService {
    async fn node_tree_task(mut rx_tree: mpsc::UnboundedReceiver<TreeCmd>) {
        pf_debug!("store"; "node_tree task spawned");

        let mut tree = NodeTree::default();
        while let Some(cmd) = rx_tree.recv().await {
            match cmd {
                TreeCmd::NewSession { sid, tx_push } => {
                    tree.sessions.insert(
                        sid,
                        SessionCtx {
                            tx_push,
                            ephemerals: HashSet::new(),
                        },
                    );
                }

                TreeCmd::Request { sid, req } => {
                    tree.handle_request(sid, req);
                }

                TreeCmd::SessionEnd { sid } => {
                    tree.end_session(sid);
                }
            }
        }
    }
}

impl NodeTree {
    fn handle_request(&mut self, sid: SessionId, req: StoreRequest) {
        let reply = match req {
            StoreRequest::Register { xid, path, data } => StoreReply::Stat {
                xid,
                result: self.create_node(&path, data, Some(sid)),
            },
            StoreRequest::Create { xid, path, data } => StoreReply::Stat {
                xid,
                result: self.create_node(&path, data, None),
            },
            StoreRequest::Set { xid, path, data } => StoreReply::Stat {
                xid,
                result: self.set_node(&path, data),
            },
            StoreRequest::Get { xid, path, watch } => {
                if watch {
                    arm_watch(&mut self.data_watches, &path, sid);
                }
                StoreReply::Data {
                    xid,
                    result: self.get_node(&path),
                }
            }
            StoreRequest::Children { xid, path, watch } => {
                if watch {
                    arm_watch(&mut self.child_watches, &path, sid);
                }
                StoreReply::Children {
                    xid,
                    result: self.children_of(&path),
                }
            }
            StoreRequest::Close { xid } => {
                // remove ephemerals (and fire watches) before replying so
                // a graceful close is observably complete; the reply must
                // go through the push channel grabbed beforehand, since
                // ending the session unregisters it
                let tx_push = self
                    .sessions
                    .get(&sid)
                    .map(|ctx| ctx.tx_push.clone());
                self.end_session(sid);
                if let Some(tx_push) = tx_push {
                    let _ = tx_push.send(StoreReply::Closed { xid });
                }
                return;
            }
        };
        self.push_to(sid, reply);
    }

    fn create_node(
        &mut self,
        path: &str,
        data: Vec<u8>,
        owner: Option<SessionId>,
    ) -> Result<Stat, StoreFault> {
        if !valid_path(path) {
            return Err(StoreFault::NoNode);
        }
        if self.nodes.contains_key(path) {
            return Err(StoreFault::NodeExists);
        }
        let parent = parent_of(path);
        if parent != "/" && !self.nodes.contains_key(parent) {
            return Err(StoreFault::NoNode);
        }

        let stat = Stat::default();
        self.nodes.insert(
            path.to_string(),
            Node {
                data,
                stat,
                owner,
            },
        );
        if let Some(sid) = owner {
            if let Some(ctx) = self.sessions.get_mut(&sid) {
                ctx.ephemerals.insert(path.to_string());
            }
        }
        self.fire_child_watches(parent);
        Ok(stat)
    }

    fn set_node(
        &mut self,
        path: &str,
        data: Vec<u8>,
    ) -> Result<Stat, StoreFault> {
        let node = self.nodes.get_mut(path).ok_or(StoreFault::NoNode)?;
        node.data = data;
        node.stat.version += 1;
        let stat = node.stat;
        self.fire_data_watches(path);
        Ok(stat)
    }

    fn get_node(&self, path: &str) -> Result<(Vec<u8>, Stat), StoreFault> {
        self.nodes
            .get(path)
            .map(|n| (n.data.clone(), n.stat))
            .ok_or(StoreFault::NoNode)
    }

    fn children_of(&self, path: &str) -> Result<Vec<String>, StoreFault> {
        if !self.nodes.contains_key(path) {
            return Err(StoreFault::NoNode);
        }
        let prefix = format!("{}/", path);
        let mut children = Vec::new();
        for child_path in self
            .nodes
            .range(prefix.clone()..)
            .take_while(|(p, _)| p.starts_with(&prefix))
            .map(|(p, _)| p)
        {
            let leaf = &child_path[prefix.len()..];
            if !leaf.contains('/') {
                children.push(leaf.to_string());
            }
        }
        Ok(children)
    }

    fn end_session(&mut self, sid: SessionId) {
        let Some(ctx) = self.sessions.remove(&sid) else {
            return; // already ended via a graceful Close
        };
        pf_debug!("store"; "session {} ended, {} ephemeral(s) removed",
                           sid, ctx.ephemerals.len());
        // keep the push channel alive while firing deletion watches for
        // other sessions
        for path in ctx.ephemerals {
            if self.nodes.remove(&path).is_some() {
                self.fire_data_watches(&path);
                self.fire_child_watches(parent_of(&path));
            }
        }
        for watchers in self.data_watches.values_mut() {
            watchers.retain(|&s| s != sid);
        }
        for watchers in self.child_watches.values_mut() {
            watchers.retain(|&s| s != sid);
        }
    }

    fn fire_data_watches(&mut self, path: &str) {
        self.fire_watches(WatchKind::Data, path);
    }

    fn fire_child_watches(&mut self, path: &str) {
        self.fire_watches(WatchKind::Children, path);
    }

    fn fire_watches(&mut self, kind: WatchKind, path: &str) {
        let registry = match kind {
            WatchKind::Data => &self.data_watches,
            WatchKind::Children => &self.child_watches,
        };
        let Some(watchers) = registry.get(path) else {
            return;
        };
        for sid in watchers.clone() {
            self.push_to(
                sid,
                StoreReply::Event(WatchEvent {
                    kind,
                    path: path.to_string(),
                }),
            );
        }
    }

    fn push_to(&self, sid: SessionId, reply: StoreReply) {
        if let Some(ctx) = self.sessions.get(&sid) {
            // a send failure means the messenger is gone; SessionEnd is
            // already on its way through the command channel
            let _ = ctx.tx_push.send(reply);
        }
    }
}

/// Arms a watch for a session on a path, at most once per pair.
fn arm_watch(
    registry: &mut HashMap<String, Vec<SessionId>>,
    path: &str,
    sid: SessionId,
) {
    let watchers = registry.entry(path.to_string()).or_default();
    if !watchers.contains(&sid) {
        watchers.push(sid);
    }
}

/// Paths are absolute, '/'-separated, with no empty segments.
fn valid_path(path: &str) -> bool {
    path.starts_with('/')
        && path.len() > 1
        && !path.ends_with('/')
        && !path.contains("//")
}

/// Parent path; the parent of a top-level node is "/".
fn parent_of(path: &str) -> &str {
    match path.rfind('/') {
        Some(0) | None => "/",
        Some(idx) => &path[..idx],
    }
}

#[cfg(test)]
mod service_tests {
    use super::*;

    #[test]
    fn path_helpers() {
        assert!(valid_path("/master_state"));
        assert!(valid_path("/living_processors/src-0"));
        assert!(!valid_path("relative"));
        assert!(!valid_path("/"));
        assert!(!valid_path("/trailing/"));
        assert!(!valid_path("/a//b"));

        assert_eq!(parent_of("/living_processors/src-0"),
                   "/living_processors");
        assert_eq!(parent_of("/master_state"), "/");
    }

    #[test]
    fn tree_create_set_get_children() {
        let mut tree = NodeTree::default();
        assert_eq!(
            tree.create_node("/living_processors", vec![], None),
            Ok(Stat { version: 0 })
        );
        assert_eq!(
            tree.create_node("/living_processors", vec![], None),
            Err(StoreFault::NodeExists)
        );
        // parent must exist
        assert_eq!(
            tree.create_node("/nowhere/child", vec![], None),
            Err(StoreFault::NoNode)
        );

        tree.create_node("/living_processors/src-0", vec![1], Some(7))
            .unwrap();
        tree.create_node("/living_processors/agg-0", vec![2], Some(7))
            .unwrap();
        let mut children = tree.children_of("/living_processors").unwrap();
        children.sort();
        assert_eq!(children, vec!["agg-0", "src-0"]);

        assert_eq!(
            tree.set_node("/living_processors/src-0", vec![9]),
            Ok(Stat { version: 1 })
        );
        assert_eq!(
            tree.get_node("/living_processors/src-0"),
            Ok((vec![9], Stat { version: 1 }))
        );
        assert_eq!(tree.get_node("/missing"), Err(StoreFault::NoNode));
    }

    #[test]
    fn tree_session_end_removes_ephemerals() {
        let mut tree = NodeTree::default();
        let (tx_push, _rx_push) = mpsc::unbounded_channel();
        tree.sessions.insert(
            7,
            SessionCtx {
                tx_push,
                ephemerals: HashSet::new(),
            },
        );
        tree.create_node("/living_processors", vec![], None).unwrap();
        tree.create_node("/living_processors/src-0", vec![], Some(7))
            .unwrap();
        assert_eq!(
            tree.children_of("/living_processors").unwrap().len(),
            1
        );

        tree.end_session(7);
        assert_eq!(
            tree.children_of("/living_processors").unwrap().len(),
            0
        );
        // persistent container survives
        assert!(tree.nodes.contains_key("/living_processors"));
    }
}
