//! Shuffle transport: line-oriented payload delivery between processor
//! instances over pooled TCP connections. Delivery is FIFO per
//! (upstream instance -> downstream instance) connection; the snapshot
//! protocol's barrier alignment depends on exactly that property.

use std::net::SocketAddr;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::topology::Topology;
use crate::types::{Clock, Payload, ProcessorId};
use crate::utils::{
    tcp_bind_with_retry, tcp_connect_with_retry, SquallError,
};

/// Identity of one inbound shuffle connection, local to a listener.
pub type ConnId = u64;

/// What a listener observed on one of its connections.
#[derive(Debug, PartialEq, Eq, Clone)]
pub enum ShuffleEvent {
    /// One payload line arrived.
    Frame(Payload),

    /// The connection ended; no further frames will carry this `ConnId`.
    Closed,
}

/// Inbound half of the shuffle for one bolt/sink instance.
pub struct ShuffleListener {
    local_addr: SocketAddr,

    /// Receiver side of the merged frame channel.
    rx_recv: mpsc::UnboundedReceiver<(ConnId, ShuffleEvent)>,

    /// Join handle of the connection acceptor task.
    _conn_acceptor_handle: JoinHandle<()>,
}

impl ShuffleListener {
    /// Binds the instance's shuffle address and spawns the connection
    /// acceptor task.
    pub async fn new_and_setup(
        bind_addr: SocketAddr,
    ) -> Result<Self, SquallError> {
        let listener = tcp_bind_with_retry(bind_addr, 10).await?;
        let local_addr = listener.local_addr()?;
        let (tx_recv, rx_recv) = mpsc::unbounded_channel();
        let conn_acceptor_handle =
            tokio::spawn(Self::conn_acceptor_task(listener, tx_recv));
        Ok(ShuffleListener {
            local_addr,
            rx_recv,
            _conn_acceptor_handle: conn_acceptor_handle,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Waits for the next event on any inbound connection. Events from a
    /// single connection preserve arrival order.
    pub async fn recv(
        &mut self,
    ) -> Result<(ConnId, ShuffleEvent), SquallError> {
        self.rx_recv.recv().await.ok_or_else(|| {
            SquallError::Connection("shuffle listener gone".into())
        })
    }

    async fn conn_acceptor_task(
        listener: TcpListener,
        tx_recv: mpsc::UnboundedSender<(ConnId, ShuffleEvent)>,
    ) {
        let mut next_cid: ConnId = 1;
        loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, addr)) => {
                        let cid = next_cid;
                        next_cid += 1;
                        pf_debug!("shuffle";
                                  "inbound conn {} from '{}'", cid, addr);
                        tokio::spawn(Self::conn_reader_task(
                            cid,
                            stream,
                            tx_recv.clone(),
                        ));
                    }
                    Err(e) => {
                        pf_warn!("shuffle"; "error accepting conn: {}", e);
                    }
                },

                // the owning runner is gone; release the listen address
                () = tx_recv.closed() => break,
            }
        }
    }

    async fn conn_reader_task(
        cid: ConnId,
        stream: TcpStream,
        tx_recv: mpsc::UnboundedSender<(ConnId, ShuffleEvent)>,
    ) {
        let mut lines = BufReader::new(stream).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => match Payload::from_line(&line) {
                    Ok(payload) => {
                        if tx_recv
                            .send((cid, ShuffleEvent::Frame(payload)))
                            .is_err()
                        {
                            return; // listener dropped
                        }
                    }
                    Err(e) => {
                        pf_error!("shuffle";
                                  "bad frame on conn {}: {}", cid, e);
                        break;
                    }
                },
                Ok(None) => break, // clean end of stream
                Err(e) => {
                    pf_debug!("shuffle";
                              "conn {} read error: {}", cid, e);
                    break;
                }
            }
        }
        let _ = tx_recv.send((cid, ShuffleEvent::Closed));
    }
}

/// Outbound half of the shuffle for one upstream instance. Connections
/// are opened on demand, pooled per address, and reused for the life of
/// the process.
pub struct ShuffleSender {
    /// Logging prefix (the owning processor's id).
    me: String,

    /// Map from address -> sender side of the per-connection channel,
    /// shared with the connector task.
    tx_conns: flashmap::ReadHandle<SocketAddr, mpsc::UnboundedSender<Payload>>,

    /// Sender side of the connect channel into the connector task.
    tx_connect: mpsc::UnboundedSender<SocketAddr>,

    /// Receiver side of the connect acknowledgement channel.
    rx_connack: mpsc::UnboundedReceiver<(SocketAddr, bool)>,

    /// Join handle of the connector task.
    _connector_handle: JoinHandle<()>,
}

impl ShuffleSender {
    /// Creates the outbound pool and spawns the connector task.
    pub fn new_and_setup(me: impl Into<String>) -> Self {
        let me = me.into();
        let (tx_conns_write, tx_conns_read) =
            flashmap::new::<SocketAddr, mpsc::UnboundedSender<Payload>>();
        let (tx_connect, rx_connect) = mpsc::unbounded_channel();
        let (tx_connack, rx_connack) = mpsc::unbounded_channel();

        let connector_handle = tokio::spawn(Self::connector_task(
            me.clone(),
            rx_connect,
            tx_conns_write,
            tx_connack,
        ));

        ShuffleSender {
            me,
            tx_conns: tx_conns_read,
            tx_connect,
            rx_connack,
            _connector_handle: connector_handle,
        }
    }

    /// Routes a data payload to every downstream operator, picking the
    /// instance by the payload's key hash.
    pub async fn send_keyed(
        &mut self,
        topology: &Topology,
        upstream: &str,
        payload: Payload,
    ) -> Result<(), SquallError> {
        debug_assert!(!payload.is_barrier());
        for down in topology.downstreams(upstream)?.to_vec() {
            let instance =
                topology.downstream_instance(&down, payload.key())?;
            let addr =
                topology.address_for(&ProcessorId::new(down, instance))?;
            self.send_to(addr, payload.clone()).await?;
        }
        Ok(())
    }

    /// Broadcasts a barrier frame to every instance of every downstream
    /// operator, opening connections eagerly so alignment never stalls on
    /// an idle keyed route.
    pub async fn broadcast_barrier(
        &mut self,
        topology: &Topology,
        upstream: &str,
        clock: &Clock,
    ) -> Result<(), SquallError> {
        for down in topology.downstreams(upstream)?.to_vec() {
            for instance in 0..topology.parallelism(&down)? {
                let addr = topology.address_for(&ProcessorId::new(
                    down.clone(),
                    instance,
                ))?;
                self.send_to(addr, Payload::barrier(clock.clone()))
                    .await?;
            }
        }
        Ok(())
    }

    /// Enqueues a payload onto the pooled connection for an address,
    /// establishing or re-establishing the connection as needed.
    pub async fn send_to(
        &mut self,
        addr: SocketAddr,
        payload: Payload,
    ) -> Result<(), SquallError> {
        let mut payload = Some(payload);
        for _attempt in 0..3 {
            let sent = {
                let guard = self.tx_conns.guard();
                match guard.get(&addr) {
                    Some(tx) => match tx.send(payload.take().unwrap()) {
                        Ok(()) => true,
                        Err(e) => {
                            // connection died; reclaim the payload
                            payload = Some(e.0);
                            false
                        }
                    },
                    None => false,
                }
            };
            if sent {
                return Ok(());
            }

            // ask the connector to (re)establish, then wait for its ack
            self.tx_connect.send(addr).map_err(|_| {
                SquallError::Connection("connector task gone".into())
            })?;
            loop {
                match self.rx_connack.recv().await {
                    Some((acked, ok)) if acked == addr => {
                        if !ok {
                            pf_error!(self.me;
                                      "cannot connect shuffle to '{}'",
                                      addr);
                            return Err(SquallError::Connection(format!(
                                "cannot connect shuffle to '{}'",
                                addr
                            )));
                        }
                        break;
                    }
                    Some(_) => continue,
                    None => {
                        return Err(SquallError::Connection(
                            "connector task gone".into(),
                        ));
                    }
                }
            }
        }
        pf_error!(self.me; "repeated shuffle send failures to '{}'", addr);
        Err(SquallError::Connection(format!(
            "repeated shuffle send failures to '{}'",
            addr
        )))
    }

    async fn connector_task(
        me: String,
        mut rx_connect: mpsc::UnboundedReceiver<SocketAddr>,
        mut tx_conns: flashmap::WriteHandle<
            SocketAddr,
            mpsc::UnboundedSender<Payload>,
        >,
        tx_connack: mpsc::UnboundedSender<(SocketAddr, bool)>,
    ) {
        while let Some(addr) = rx_connect.recv().await {
            // still-live pooled connection wins
            let mut stale = false;
            {
                let guard = tx_conns.guard();
                if let Some(tx) = guard.get(&addr) {
                    if tx.is_closed() {
                        stale = true;
                    } else {
                        let _ = tx_connack.send((addr, true));
                        continue;
                    }
                }
            }
            if stale {
                let mut guard = tx_conns.guard();
                guard.remove(addr);
                guard.publish();
            }

            match tcp_connect_with_retry(addr, 30).await {
                Ok(stream) => {
                    let (tx_send, rx_send) = mpsc::unbounded_channel();
                    tokio::spawn(Self::conn_writer_task(
                        me.clone(),
                        addr,
                        stream,
                        rx_send,
                    ));
                    let mut guard = tx_conns.guard();
                    guard.insert(addr, tx_send);
                    guard.publish();
                    let _ = tx_connack.send((addr, true));
                }
                Err(e) => {
                    pf_error!(me; "error connecting shuffle to '{}': {}",
                                  addr, e);
                    let _ = tx_connack.send((addr, false));
                }
            }
        }
    }

    async fn conn_writer_task(
        me: String,
        addr: SocketAddr,
        mut conn: TcpStream,
        mut rx_send: mpsc::UnboundedReceiver<Payload>,
    ) {
        pf_debug!(me; "shuffle conn to '{}' opened", addr);
        while let Some(payload) = rx_send.recv().await {
            let mut line = payload.to_line();
            line.push('\n');
            if let Err(e) = conn.write_all(line.as_bytes()).await {
                pf_debug!(me; "shuffle conn to '{}' lost: {}", addr, e);
                break;
            }
        }
        // dropping rx_send makes pooled sends fail, prompting reconnection
    }
}
