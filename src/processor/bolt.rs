//! Bolt runner: applies the user formula to incoming payloads, aligns on
//! barrier frames when a cut is pending, flushes its state to the
//! snapshot store at the cut's clock, and announces every step through
//! its ephemeral registration.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::Arc;

use crate::master::{get_committed_clock, MasterMirror};
use crate::processor::BoltFormula;
use crate::registry::{register_processor, set_processor_state};
use crate::shuffle::{
    ConnId, ShuffleEvent, ShuffleListener, ShuffleSender,
};
use crate::snapshot::SnapshotStore;
use crate::store::StoreSession;
use crate::topology::Topology;
use crate::types::{Clock, MasterState, Payload, ProcessorId, ProcessorState};
use crate::utils::SquallError;

/// Configuration parameters of a bolt runner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BoltConfig {
    /// Upper bound on post-cut frames held back during alignment; a
    /// runaway cut that never completes must not buffer unboundedly.
    pub held_frames_cap: usize,
}

impl Default for BoltConfig {
    fn default() -> Self {
        BoltConfig {
            held_frames_cap: 65536,
        }
    }
}

/// Where one inbound connection stands relative to replay delimiting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConnPhase {
    /// Frames are dropped until the barrier carrying the loaded clock
    /// arrives; suppresses stale in-flight frames across a reload.
    Discarding,

    /// Frames are applied (or held, when past a pending cut).
    Live,
}

/// Bolt runner for one operator instance.
pub struct BoltRunner<F: BoltFormula> {
    /// My processor ID.
    id: ProcessorId,

    topology: Topology,

    /// Coordination store session; owns my ephemeral registration.
    session: Arc<StoreSession>,

    /// Local mirror of the master state.
    mirror: MasterMirror,

    listener: ShuffleListener,

    sender: ShuffleSender,

    snapshots: Arc<dyn SnapshotStore>,

    formula: F,

    /// The formula's state; exactly what gets snapshotted.
    state: F::State,

    /// Clock of the snapshot currently loaded; doubles as the replay
    /// delimiter for discarding connections.
    loaded_clock: Clock,

    /// Join of the clocks of every input applied since loading; tags all
    /// emitted payloads.
    current_clock: Clock,

    /// Whether `BoltRunning` has been announced for the current flow.
    running: bool,

    /// Inbound connections and their replay phase.
    conns: HashMap<ConnId, ConnPhase>,

    /// The cut currently being aligned on, if any.
    pending_cut: Option<Clock>,

    /// Connections already known to be past the pending cut.
    past_cut: HashSet<ConnId>,

    /// Post-cut data frames held back until the cut completes.
    held: Vec<Payload>,

    /// Cut announced as `BoltSaved`, until the master leaves it.
    saved_cut: Option<Clock>,

    config: BoltConfig,
}

impl<F: BoltFormula> BoltRunner<F> {
    /// Creates a new bolt runner: binds the shuffle listener, connects to
    /// the store, registers the ephemeral identity, and starts the
    /// master-state mirror.
    pub async fn new_and_setup(
        id: ProcessorId,
        topology: Topology,
        store_addr: SocketAddr,
        snapshots: Arc<dyn SnapshotStore>,
        formula: F,
        config_str: Option<&str>,
    ) -> Result<Self, SquallError> {
        let config =
            parsed_config!(config_str => BoltConfig; held_frames_cap)?;

        let listener =
            ShuffleListener::new_and_setup(topology.address_for(&id)?)
                .await?;
        let session = Arc::new(StoreSession::connect(store_addr).await?);
        register_processor(&session, &id, &ProcessorState::Unspecified)
            .await?;
        let mirror = MasterMirror::start(session.clone()).await?;
        let sender = ShuffleSender::new_and_setup(id.to_string());

        Ok(BoltRunner {
            id,
            topology,
            session,
            mirror,
            listener,
            sender,
            snapshots,
            formula,
            state: F::State::default(),
            loaded_clock: Clock::empty(),
            current_clock: Clock::empty(),
            running: false,
            conns: HashMap::new(),
            pending_cut: None,
            past_cut: HashSet::new(),
            held: Vec::new(),
            saved_cut: None,
            config,
        })
    }

    /// Main loop of the bolt. Returns only on a fatal error.
    pub async fn run(&mut self) -> Result<(), SquallError> {
        pf_info!(self.id; "bolt starting");
        self.reload().await?;
        self.handle_master().await?;
        loop {
            tokio::select! {
                res = self.mirror.changed() => {
                    res?;
                    self.handle_master().await?;
                },

                event = self.listener.recv() => {
                    let (cid, event) = event?;
                    self.handle_event(cid, event).await?;
                },
            }
        }
    }

    /// Reacts to a master-state transition (possibly coalesced).
    async fn handle_master(&mut self) -> Result<(), SquallError> {
        match self.mirror.latest() {
            MasterState::Unavailable | MasterState::Initialization => {
                // a flow session ended under us; drop in-memory progress
                // and reload from the last complete cut
                if self.running || self.saved_cut.is_some() {
                    self.reload().await?;
                }
            }

            MasterState::SpoutsRewind { .. } | MasterState::SpoutsPaused => {
                // nothing for bolts to do; keep draining in-flight frames
            }

            MasterState::Flowing { cut: None } => {
                if !self.running || self.saved_cut.is_some() {
                    self.saved_cut = None;
                    self.announce_running().await?;
                }
            }

            MasterState::Flowing { cut: Some(cut) } => {
                if self.saved_cut.as_ref() == Some(&cut) {
                    // our save is in; the rest of the bolts are catching
                    // up
                } else if self.running {
                    if self.saved_cut.take().is_some() {
                        // the intervening Flowing(None) was coalesced away
                        self.announce_running().await?;
                    }
                    self.begin_cut(cut).await?;
                } else {
                    // first observation after a (re)load can land mid-cut
                    // when the mirror coalesces the intervening states;
                    // align on the cut rather than strand at BoltLoaded
                    self.begin_cut(cut).await?;
                }
            }
        }
        Ok(())
    }

    /// Reacts to one shuffle event.
    async fn handle_event(
        &mut self,
        cid: ConnId,
        event: ShuffleEvent,
    ) -> Result<(), SquallError> {
        match event {
            ShuffleEvent::Closed => {
                self.conns.remove(&cid);
                self.past_cut.remove(&cid);
            }
            ShuffleEvent::Frame(p) if p.is_barrier() => {
                self.handle_barrier(cid, p.clock).await?;
            }
            ShuffleEvent::Frame(p) => {
                self.handle_data(cid, p).await?;
            }
        }
        Ok(())
    }

    /// Phase a connection enters on its first frame: replay-delimited
    /// while (re)loading, live once the flow is on.
    fn default_phase(&self) -> ConnPhase {
        if self.running {
            ConnPhase::Live
        } else {
            ConnPhase::Discarding
        }
    }

    async fn handle_barrier(
        &mut self,
        cid: ConnId,
        clock: Clock,
    ) -> Result<(), SquallError> {
        let default = self.default_phase();
        let phase = self.conns.entry(cid).or_insert(default);
        match *phase {
            ConnPhase::Discarding => {
                if clock == self.loaded_clock {
                    // replay delimiter reached; the connection is clean
                    *phase = ConnPhase::Live;
                } else {
                    pf_debug!(self.id;
                              "stale barrier {} on discarding conn {}",
                              clock, cid);
                }
            }
            ConnPhase::Live => {
                match &self.pending_cut {
                    None => {
                        // the in-band marker can outrun the master-state
                        // mirror; trust it
                        self.pending_cut = Some(clock);
                        self.past_cut.clear();
                        self.past_cut.insert(cid);
                    }
                    Some(c) if *c == clock => {
                        self.past_cut.insert(cid);
                    }
                    Some(c) => {
                        pf_warn!(self.id;
                                 "barrier {} does not match pending cut {}",
                                 clock, c);
                    }
                }
                self.try_complete_cut().await?;
            }
        }
        Ok(())
    }

    async fn handle_data(
        &mut self,
        cid: ConnId,
        payload: Payload,
    ) -> Result<(), SquallError> {
        let default = self.default_phase();
        let phase = self.conns.entry(cid).or_insert(default);
        if *phase == ConnPhase::Discarding {
            return Ok(());
        }

        // records fully covered by the loaded snapshot are replay
        // duplicates
        if !self.loaded_clock.is_empty()
            && self.loaded_clock.dominates(&payload.clock)
        {
            return Ok(());
        }

        if let Some(cut) = &self.pending_cut {
            if !cut.dominates(&payload.clock) {
                // past the cut on this connection; hold the frame so the
                // snapshot state stays within the cut
                if self.held.len() >= self.config.held_frames_cap {
                    return logged_err!(self.id;
                        "cut {} held {} frames without completing",
                        cut, self.held.len());
                }
                self.past_cut.insert(cid);
                self.held.push(payload);
                self.try_complete_cut().await?;
                return Ok(());
            }
        }

        self.apply(payload).await
    }

    /// Applies one data frame to the formula state and emits the derived
    /// tuples downstream.
    async fn apply(&mut self, payload: Payload) -> Result<(), SquallError> {
        self.current_clock.join(&payload.clock);
        let outs = self.formula.apply(&mut self.state, &payload.tuple);
        for tuple in outs {
            self.sender
                .send_keyed(
                    &self.topology,
                    &self.id.name,
                    Payload::data(tuple, self.current_clock.clone()),
                )
                .await?;
        }
        Ok(())
    }

    async fn begin_cut(&mut self, cut: Clock) -> Result<(), SquallError> {
        match &self.pending_cut {
            None => {
                self.pending_cut = Some(cut);
                self.past_cut.clear();
                self.try_complete_cut().await?;
            }
            Some(c) if *c == cut => {}
            Some(c) => {
                pf_warn!(self.id;
                         "master cut {} while aligning on {}", cut, c);
            }
        }
        Ok(())
    }

    /// Completes the cut once every expected upstream connection has
    /// passed it: flush, announce, forward the barrier, release held
    /// frames.
    async fn try_complete_cut(&mut self) -> Result<(), SquallError> {
        let Some(cut) = self.pending_cut.clone() else {
            return Ok(());
        };
        let expected = self.topology.upstream_instances(&self.id.name);
        if self.past_cut.len() < expected {
            return Ok(());
        }

        let blob = rmp_serde::encode::to_vec(&self.state)?;
        self.snapshots.save(&self.id, &cut, blob).await?;
        set_processor_state(
            &self.session,
            &self.id,
            &ProcessorState::BoltSaved { clock: cut.clone() },
        )
        .await?;
        pf_info!(self.id; "snapshot saved at {}", cut);

        self.pending_cut = None;
        self.past_cut.clear();
        self.saved_cut = Some(cut.clone());

        // divide the stream for downstream consumers before releasing
        // anything beyond the cut
        self.sender
            .broadcast_barrier(&self.topology, &self.id.name, &cut)
            .await?;
        let held = std::mem::take(&mut self.held);
        for payload in held {
            self.apply(payload).await?;
        }
        Ok(())
    }

    /// Loads the snapshot selected by the committed clock (falling back
    /// to the latest local one), resets all alignment state, and
    /// announces `BoltLoaded`.
    async fn reload(&mut self) -> Result<(), SquallError> {
        let committed = get_committed_clock(&self.session).await?;
        let mut chosen: Option<(Clock, Vec<u8>)> = None;
        if !committed.is_empty() {
            if let Some(blob) =
                self.snapshots.load(&self.id, &committed).await?
            {
                chosen = Some((committed, blob));
            }
        }
        if chosen.is_none() {
            chosen = self.snapshots.latest(&self.id).await?;
        }

        let (clock, state) = match chosen {
            Some((clock, blob)) => {
                (clock, rmp_serde::decode::from_slice(&blob)?)
            }
            None => (Clock::empty(), F::State::default()),
        };

        self.state = state;
        self.loaded_clock = clock.clone();
        self.current_clock = clock.clone();
        self.running = false;
        for phase in self.conns.values_mut() {
            *phase = ConnPhase::Discarding;
        }
        self.pending_cut = None;
        self.past_cut.clear();
        self.held.clear();
        self.saved_cut = None;

        set_processor_state(
            &self.session,
            &self.id,
            &ProcessorState::BoltLoaded {
                clock: clock.clone(),
            },
        )
        .await?;
        pf_info!(self.id; "loaded snapshot at {}", clock);

        // delimit replay for downstream consumers the same way spouts do
        self.sender
            .broadcast_barrier(&self.topology, &self.id.name, &clock)
            .await?;
        Ok(())
    }

    async fn announce_running(&mut self) -> Result<(), SquallError> {
        set_processor_state(
            &self.session,
            &self.id,
            &ProcessorState::BoltRunning,
        )
        .await?;
        self.running = true;
        Ok(())
    }
}

#[cfg(test)]
mod bolt_tests {
    use super::*;
    use crate::master::{create_master_state, set_master_state};
    use crate::processor::WordCountFormula;
    use crate::registry::{get_all_processor_states, init_store_roots};
    use crate::snapshot::MemSnapshotStore;
    use crate::store::StoreService;
    use crate::topology::TopologyBuilder;
    use std::collections::BTreeMap;
    use tokio::time::{self, Duration};

    async fn await_state(
        session: &StoreSession,
        id: &ProcessorId,
        want: impl Fn(&ProcessorState) -> bool,
    ) -> Result<ProcessorState, SquallError> {
        for _ in 0..300 {
            let states = get_all_processor_states(session).await?;
            if let Some(state) = states.get(id) {
                if want(state) {
                    return Ok(state.clone());
                }
            }
            time::sleep(Duration::from_millis(10)).await;
        }
        logged_err!("test"; "{} never reached wanted state", id)
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn bolt_aligns_and_snapshots() -> Result<(), SquallError> {
        let service =
            StoreService::new_and_setup("127.0.0.1:54855".parse()?).await?;
        let store_addr = service.local_addr();
        let ctl = StoreSession::connect(store_addr).await?;
        init_store_roots(&ctl).await?;
        create_master_state(&ctl).await?;

        let topo = TopologyBuilder::new()
            .spout("src", vec!["p0".into()], vec!["agg".into()])
            .bolt("agg", vec!["127.0.0.1:54856".parse()?], vec![])
            .build()?;
        let snapshots = Arc::new(MemSnapshotStore::new());
        let id = ProcessorId::new("agg", 0);

        let mut bolt = BoltRunner::new_and_setup(
            id.clone(),
            topo.clone(),
            store_addr,
            snapshots.clone() as Arc<dyn SnapshotStore>,
            WordCountFormula,
            None,
        )
        .await?;
        tokio::spawn(async move {
            let _ = bolt.run().await;
        });

        // fresh start: loads the empty snapshot
        await_state(&ctl, &id, |s| {
            *s == ProcessorState::BoltLoaded {
                clock: Clock::empty(),
            }
        })
        .await?;

        // acting as negotiator and spout at once
        set_master_state(&ctl, &MasterState::Flowing { cut: None })
            .await?;
        await_state(&ctl, &id, |s| *s == ProcessorState::BoltRunning)
            .await?;

        let mut spout = ShuffleSender::new_and_setup("src-0");
        let addr = topo.address_for(&id)?;
        for (offset, word) in
            [(1, "storm"), (2, "gale"), (3, "storm")]
        {
            spout
                .send_to(
                    addr,
                    Payload::data(word, Clock::of([("p0", offset)])),
                )
                .await?;
        }

        // cut at offset 3: barrier then post-cut records
        let cut = Clock::of([("p0", 3)]);
        set_master_state(
            &ctl,
            &MasterState::Flowing {
                cut: Some(cut.clone()),
            },
        )
        .await?;
        spout.send_to(addr, Payload::barrier(cut.clone())).await?;
        // a post-cut record must not leak into the snapshot
        spout
            .send_to(
                addr,
                Payload::data("storm", Clock::of([("p0", 4)])),
            )
            .await?;

        await_state(&ctl, &id, |s| {
            *s == ProcessorState::BoltSaved { clock: cut.clone() }
        })
        .await?;

        let blob = snapshots.load(&id, &cut).await?.unwrap();
        let counts: BTreeMap<String, u64> =
            rmp_serde::decode::from_slice(&blob)?;
        assert_eq!(counts["storm"], 2);
        assert_eq!(counts["gale"], 1);

        // cut complete; bolt goes back to running and the held record is
        // applied on top
        set_master_state(&ctl, &MasterState::Flowing { cut: None })
            .await?;
        await_state(&ctl, &id, |s| *s == ProcessorState::BoltRunning)
            .await?;
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn bolt_reloads_at_committed_clock() -> Result<(), SquallError> {
        let service =
            StoreService::new_and_setup("127.0.0.1:54857".parse()?).await?;
        let store_addr = service.local_addr();
        let ctl = StoreSession::connect(store_addr).await?;
        init_store_roots(&ctl).await?;
        create_master_state(&ctl).await?;

        let topo = TopologyBuilder::new()
            .spout("src", vec!["p0".into()], vec!["agg".into()])
            .bolt("agg", vec!["127.0.0.1:54858".parse()?], vec![])
            .build()?;
        let id = ProcessorId::new("agg", 0);

        // a prior run left two snapshots; only the first cut committed
        let snapshots = Arc::new(MemSnapshotStore::new());
        let committed = Clock::of([("p0", 73)]);
        let uncommitted = Clock::of([("p0", 120)]);
        let mut counts = BTreeMap::new();
        counts.insert("storm".to_string(), 7u64);
        snapshots
            .save(&id, &committed, rmp_serde::encode::to_vec(&counts)?)
            .await?;
        counts.insert("storm".to_string(), 11u64);
        snapshots
            .save(&id, &uncommitted, rmp_serde::encode::to_vec(&counts)?)
            .await?;
        crate::master::set_committed_clock(&ctl, &committed).await?;

        let mut bolt = BoltRunner::new_and_setup(
            id.clone(),
            topo,
            store_addr,
            snapshots as Arc<dyn SnapshotStore>,
            WordCountFormula,
            None,
        )
        .await?;
        tokio::spawn(async move {
            let _ = bolt.run().await;
        });

        // the bolt must come back at the committed cut, not its newest
        // local snapshot
        await_state(&ctl, &id, |s| {
            *s == ProcessorState::BoltLoaded {
                clock: committed.clone(),
            }
        })
        .await?;
        Ok(())
    }
}
