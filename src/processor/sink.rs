//! Sink runner: terminal consumer writing tuples outside the system.
//! Sinks carry no snapshot state; their output is at-least-once across
//! recoveries, with replay delimiting to suppress the duplicates that
//! can be suppressed.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use crate::master::{get_committed_clock, MasterMirror};
use crate::processor::SinkWriter;
use crate::registry::{register_processor, set_processor_state};
use crate::shuffle::{ConnId, ShuffleEvent, ShuffleListener};
use crate::store::StoreSession;
use crate::topology::Topology;
use crate::types::{Clock, MasterState, ProcessorId, ProcessorState};
use crate::utils::SquallError;

/// Configuration parameters of a sink runner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SinkConfig {
    /// Whether to drop replayed tuples already covered by the committed
    /// clock. With a deterministic, replayable writer this turns
    /// recovery into exactly-once output.
    pub suppress_replays: bool,
}

impl Default for SinkConfig {
    fn default() -> Self {
        SinkConfig {
            suppress_replays: true,
        }
    }
}

/// Replay phase of one inbound connection (same protocol as bolts).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConnPhase {
    Discarding,
    Live,
}

/// Sink runner for one operator instance.
pub struct SinkRunner<W: SinkWriter> {
    /// My processor ID.
    id: ProcessorId,

    /// Coordination store session; owns my ephemeral registration.
    session: Arc<StoreSession>,

    /// Local mirror of the master state.
    mirror: MasterMirror,

    listener: ShuffleListener,

    writer: W,

    config: SinkConfig,

    /// Replay delimiter: the committed clock read at the last resync.
    delimiter: Clock,

    /// Inbound connections and their replay phase.
    conns: HashMap<ConnId, ConnPhase>,

    /// Whether a flow session is on since the last resync.
    flowing: bool,
}

impl<W: SinkWriter> SinkRunner<W> {
    /// Creates a new sink runner: binds the shuffle listener, connects to
    /// the store, registers the ephemeral identity, and starts the
    /// master-state mirror.
    pub async fn new_and_setup(
        id: ProcessorId,
        topology: Topology,
        store_addr: SocketAddr,
        writer: W,
        config_str: Option<&str>,
    ) -> Result<Self, SquallError> {
        let config =
            parsed_config!(config_str => SinkConfig; suppress_replays)?;

        let listener =
            ShuffleListener::new_and_setup(topology.address_for(&id)?)
                .await?;
        let session = Arc::new(StoreSession::connect(store_addr).await?);
        register_processor(&session, &id, &ProcessorState::Unspecified)
            .await?;
        let mirror = MasterMirror::start(session.clone()).await?;

        Ok(SinkRunner {
            id,
            session,
            mirror,
            listener,
            writer,
            config,
            delimiter: Clock::empty(),
            conns: HashMap::new(),
            flowing: false,
        })
    }

    /// Main loop of the sink. Returns only on a fatal error.
    pub async fn run(&mut self) -> Result<(), SquallError> {
        pf_info!(self.id; "sink starting");
        self.resync().await?;
        loop {
            tokio::select! {
                res = self.mirror.changed() => {
                    res?;
                    self.handle_master().await?;
                },

                event = self.listener.recv() => {
                    let (cid, event) = event?;
                    self.handle_event(cid, event)?;
                },
            }
        }
    }

    async fn handle_master(&mut self) -> Result<(), SquallError> {
        match self.mirror.latest() {
            MasterState::Unavailable | MasterState::Initialization => {
                if self.flowing {
                    self.resync().await?;
                }
            }
            MasterState::Flowing { .. } => {
                self.flowing = true;
            }
            _ => {}
        }
        Ok(())
    }

    fn handle_event(
        &mut self,
        cid: ConnId,
        event: ShuffleEvent,
    ) -> Result<(), SquallError> {
        match event {
            ShuffleEvent::Closed => {
                self.conns.remove(&cid);
            }
            ShuffleEvent::Frame(p) if p.is_barrier() => {
                let default = self.default_phase();
                let phase = self.conns.entry(cid).or_insert(default);
                if *phase == ConnPhase::Discarding
                    && p.clock == self.delimiter
                {
                    *phase = ConnPhase::Live;
                }
                // cut barriers carry nothing a stateless sink must act on
            }
            ShuffleEvent::Frame(p) => {
                let default = self.default_phase();
                if *self.conns.entry(cid).or_insert(default)
                    == ConnPhase::Discarding
                {
                    return Ok(());
                }
                if self.config.suppress_replays
                    && !self.delimiter.is_empty()
                    && self.delimiter.dominates(&p.clock)
                {
                    return Ok(());
                }
                self.writer.write(&p.tuple)?;
            }
        }
        Ok(())
    }

    fn default_phase(&self) -> ConnPhase {
        if self.flowing {
            ConnPhase::Live
        } else {
            ConnPhase::Discarding
        }
    }

    /// Re-reads the committed clock and re-enters replay delimiting on
    /// every connection; announced state stays `SinkRunning`.
    async fn resync(&mut self) -> Result<(), SquallError> {
        self.delimiter = get_committed_clock(&self.session).await?;
        for phase in self.conns.values_mut() {
            *phase = ConnPhase::Discarding;
        }
        self.flowing = false;
        set_processor_state(
            &self.session,
            &self.id,
            &ProcessorState::SinkRunning,
        )
        .await?;
        pf_info!(self.id; "sink resynced, replay delimiter {}",
                          self.delimiter);
        Ok(())
    }
}

#[cfg(test)]
mod sink_tests {
    use super::*;
    use crate::master::create_master_state;
    use crate::processor::VecSink;
    use crate::registry::{get_all_processor_states, init_store_roots};
    use crate::shuffle::ShuffleSender;
    use crate::store::StoreService;
    use crate::topology::TopologyBuilder;
    use crate::types::Payload;
    use tokio::time::{self, Duration};

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn sink_delimits_replay() -> Result<(), SquallError> {
        let service =
            StoreService::new_and_setup("127.0.0.1:54860".parse()?).await?;
        let store_addr = service.local_addr();
        let ctl = StoreSession::connect(store_addr).await?;
        init_store_roots(&ctl).await?;
        create_master_state(&ctl).await?;

        // a previous run committed the cut at offset 2
        let committed = Clock::of([("p0", 2)]);
        crate::master::set_committed_clock(&ctl, &committed).await?;

        let topo = TopologyBuilder::new()
            .spout("src", vec!["p0".into()], vec!["out".into()])
            .sink("out", vec!["127.0.0.1:54861".parse()?])
            .build()?;
        let id = ProcessorId::new("out", 0);
        let collected = VecSink::new();

        let mut sink = SinkRunner::new_and_setup(
            id.clone(),
            topo.clone(),
            store_addr,
            collected.clone(),
            None,
        )
        .await?;
        tokio::spawn(async move {
            let _ = sink.run().await;
        });

        // wait for registration + resync
        for _ in 0..200 {
            let states = get_all_processor_states(&ctl).await?;
            if states.get(&id) == Some(&ProcessorState::SinkRunning) {
                break;
            }
            time::sleep(Duration::from_millis(10)).await;
        }

        // master is not yet Flowing: exactly the window in which stale
        // in-flight frames from before a flap can still arrive
        let mut upstream = ShuffleSender::new_and_setup("src-0");
        let addr = topo.address_for(&id)?;
        // stale pre-rewind frame: dropped by replay delimiting
        upstream
            .send_to(
                addr,
                Payload::data("stale", Clock::of([("p0", 9)])),
            )
            .await?;
        // rewind barrier at the committed clock opens the connection
        upstream
            .send_to(addr, Payload::barrier(committed.clone()))
            .await?;
        // a replayed frame at or below the committed clock is suppressed
        upstream
            .send_to(
                addr,
                Payload::data("covered", Clock::of([("p0", 2)])),
            )
            .await?;
        // fresh frames flow through
        upstream
            .send_to(
                addr,
                Payload::data("fresh-3", Clock::of([("p0", 3)])),
            )
            .await?;
        upstream
            .send_to(
                addr,
                Payload::data("fresh-4", Clock::of([("p0", 4)])),
            )
            .await?;

        for _ in 0..200 {
            if collected.collected().len() >= 2 {
                break;
            }
            time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(collected.collected(), vec!["fresh-3", "fresh-4"]);
        Ok(())
    }
}
