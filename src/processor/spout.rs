//! Spout state machine: an input-source iterator gated on the master
//! state. The spout never advances its offset while paused, so the
//! offset it announces in `SpoutPaused` is the exact re-entry point for
//! replay.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::time::{self, Duration};

use crate::input::InputSource;
use crate::master::MasterMirror;
use crate::registry::{register_processor, set_processor_state};
use crate::shuffle::ShuffleSender;
use crate::store::StoreSession;
use crate::topology::Topology;
use crate::types::{
    Clock, MasterState, Offset, Partition, Payload, ProcessorId,
    ProcessorState,
};
use crate::utils::SquallError;

/// Configuration parameters of a spout runner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpoutConfig {
    /// Sleep length when the partition is exhausted, in ms.
    pub idle_sleep_ms: u64,

    /// Upper bound on waiting for a master-state change before
    /// re-observing, in ms.
    pub observe_timeout_ms: u64,
}

impl Default for SpoutConfig {
    fn default() -> Self {
        SpoutConfig {
            idle_sleep_ms: 20,
            observe_timeout_ms: 100,
        }
    }
}

/// Spout runner: owns one input partition and the outbound shuffle of
/// its records.
pub struct SpoutRunner<S: InputSource> {
    /// My processor ID.
    id: ProcessorId,

    /// The partition this spout owns.
    partition: Partition,

    topology: Topology,

    /// Coordination store session; owns my ephemeral registration.
    session: Arc<StoreSession>,

    /// Local mirror of the master state.
    mirror: MasterMirror,

    source: S,

    sender: ShuffleSender,

    config: SpoutConfig,

    /// Offset of the last emitted record; 0 before any emission.
    current_offset: Offset,

    /// Offset announced in the last `SpoutPaused`, if currently paused.
    paused_at: Option<Offset>,

    /// Whether `SpoutRunning` is the last announced state.
    announced_running: bool,

    /// Cut barrier already broadcast for this clock, if any.
    cut_barrier_sent: Option<Clock>,

    /// Rewind barrier already broadcast for this clock, if any.
    rewind_barrier_sent: Option<Clock>,
}

impl<S: InputSource> SpoutRunner<S> {
    /// Creates a new spout runner: connects to the store, registers the
    /// ephemeral identity, and starts the master-state mirror.
    pub async fn new_and_setup(
        id: ProcessorId,
        topology: Topology,
        store_addr: SocketAddr,
        source: S,
        config_str: Option<&str>,
    ) -> Result<Self, SquallError> {
        let config = parsed_config!(config_str => SpoutConfig;
                                    idle_sleep_ms, observe_timeout_ms)?;

        let partition = topology.partition_for(&id)?.clone();
        if source.partition() != &partition {
            return logged_err!(id; "source owns partition '{}', topology \
                                    assigns '{}'",
                                   source.partition(), partition);
        }

        let session = Arc::new(StoreSession::connect(store_addr).await?);
        register_processor(&session, &id, &ProcessorState::Unspecified)
            .await?;
        let mirror = MasterMirror::start(session.clone()).await?;
        let sender = ShuffleSender::new_and_setup(id.to_string());

        Ok(SpoutRunner {
            id,
            partition,
            topology,
            session,
            mirror,
            source,
            sender,
            config,
            current_offset: 0,
            paused_at: None,
            announced_running: false,
            cut_barrier_sent: None,
            rewind_barrier_sent: None,
        })
    }

    /// Main loop of the spout. Returns only on a fatal error; the session
    /// (and with it the ephemeral registration) dies with the runner.
    pub async fn run(&mut self) -> Result<(), SquallError> {
        pf_info!(self.id; "spout for partition '{}' starting",
                          self.partition);
        loop {
            self.step().await?;
        }
    }

    async fn step(&mut self) -> Result<(), SquallError> {
        match self.mirror.latest() {
            MasterState::Flowing { cut: None } => {
                self.announce_running().await?;
                self.emit_next().await?;
            }

            MasterState::Flowing { cut: Some(cut) } => {
                let target = cut.get(&self.partition);
                if self.current_offset < target {
                    // cut already chosen but this spout has not reached
                    // it yet; run up to the boundary, then pause there
                    self.announce_running().await?;
                    self.emit_next().await?;
                    if self.current_offset >= target {
                        self.announce_paused(target).await?;
                    }
                } else {
                    // at or past the boundary: divide the stream for the
                    // bolts, then keep flowing
                    self.send_cut_barrier(&cut).await?;
                    self.announce_running().await?;
                    self.emit_next().await?;
                }
            }

            MasterState::SpoutsPaused => {
                // a new cut is beginning; its barrier is yet to be sent
                self.cut_barrier_sent = None;
                self.announce_paused(self.current_offset).await?;
                self.observe_change().await?;
            }

            MasterState::SpoutsRewind { clock } => {
                self.handle_rewind(clock).await?;
                self.observe_change().await?;
            }

            MasterState::Unavailable | MasterState::Initialization => {
                // a fresh flow session is coming; barriers belong to the
                // next rewind/cut
                self.cut_barrier_sent = None;
                self.rewind_barrier_sent = None;
                self.observe_change().await?;
            }
        }
        Ok(())
    }

    /// Seeks the source to the rewind clock's offset for my partition and
    /// parks there. The barrier delimits replay for downstream alignment.
    async fn handle_rewind(
        &mut self,
        clock: Clock,
    ) -> Result<(), SquallError> {
        let target = clock.get(&self.partition);
        if self.rewind_barrier_sent.as_ref() != Some(&clock) {
            pf_info!(self.id; "rewinding '{}' to offset {}",
                              self.partition, target);
            self.source.seek(target).await?;
            self.current_offset = target;
            self.cut_barrier_sent = None;
            self.sender
                .broadcast_barrier(&self.topology, &self.id.name, &clock)
                .await?;
            self.rewind_barrier_sent = Some(clock);
        }
        self.announce_paused(target).await?;
        Ok(())
    }

    async fn send_cut_barrier(
        &mut self,
        cut: &Clock,
    ) -> Result<(), SquallError> {
        if self.cut_barrier_sent.as_ref() != Some(cut) {
            self.sender
                .broadcast_barrier(&self.topology, &self.id.name, cut)
                .await?;
            self.cut_barrier_sent = Some(cut.clone());
        }
        Ok(())
    }

    /// Emits the next record, or idles briefly when the partition is
    /// currently exhausted.
    async fn emit_next(&mut self) -> Result<(), SquallError> {
        match self.source.next().await? {
            Some((offset, tuple)) => {
                self.current_offset = offset;
                let clock =
                    Clock::of([(self.partition.clone(), offset)]);
                self.sender
                    .send_keyed(
                        &self.topology,
                        &self.id.name,
                        Payload::data(tuple, clock),
                    )
                    .await?;
            }
            None => {
                let idle = Duration::from_millis(self.config.idle_sleep_ms);
                tokio::select! {
                    res = self.mirror.changed() => res?,
                    () = time::sleep(idle) => {}
                }
            }
        }
        Ok(())
    }

    async fn announce_running(&mut self) -> Result<(), SquallError> {
        if self.paused_at.is_some() || !self.announced_running {
            set_processor_state(
                &self.session,
                &self.id,
                &ProcessorState::SpoutRunning,
            )
            .await?;
            self.paused_at = None;
            self.announced_running = true;
        }
        Ok(())
    }

    async fn announce_paused(
        &mut self,
        offset: Offset,
    ) -> Result<(), SquallError> {
        if self.paused_at != Some(offset) {
            set_processor_state(
                &self.session,
                &self.id,
                &ProcessorState::SpoutPaused {
                    partition: self.partition.clone(),
                    offset,
                },
            )
            .await?;
            self.paused_at = Some(offset);
            self.announced_running = false;
        }
        Ok(())
    }

    async fn observe_change(&mut self) -> Result<(), SquallError> {
        let bound = Duration::from_millis(self.config.observe_timeout_ms);
        tokio::select! {
            res = self.mirror.changed() => res,
            () = time::sleep(bound) => Ok(()),
        }
    }
}

#[cfg(test)]
mod spout_tests {
    use super::*;
    use crate::input::MemSource;
    use crate::master::{create_master_state, set_master_state};
    use crate::registry::{get_all_processor_states, init_store_roots};
    use crate::shuffle::{ShuffleEvent, ShuffleListener};
    use crate::store::StoreService;
    use crate::topology::TopologyBuilder;

    /// Polls the registry until a processor reaches the wanted state.
    async fn await_state(
        session: &StoreSession,
        id: &ProcessorId,
        wanted: &ProcessorState,
    ) -> Result<(), SquallError> {
        for _ in 0..200 {
            let states = get_all_processor_states(session).await?;
            if states.get(id) == Some(wanted) {
                return Ok(());
            }
            time::sleep(Duration::from_millis(10)).await;
        }
        logged_err!("test"; "state {} never reached by {}", wanted, id)
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn spout_state_machine() -> Result<(), SquallError> {
        let service =
            StoreService::new_and_setup("127.0.0.1:54850".parse()?).await?;
        let store_addr = service.local_addr();
        let ctl = StoreSession::connect(store_addr).await?;
        init_store_roots(&ctl).await?;
        create_master_state(&ctl).await?;

        let mut downstream =
            ShuffleListener::new_and_setup("127.0.0.1:54851".parse()?)
                .await?;
        let topo = TopologyBuilder::new()
            .spout("src", vec!["p0".into()], vec!["agg".into()])
            .bolt("agg", vec![downstream.local_addr()], vec![])
            .build()?;

        let records: Vec<String> =
            (1..=6).map(|i| format!("rec-{}", i)).collect();
        let id = ProcessorId::new("src", 0);
        let mut spout = SpoutRunner::new_and_setup(
            id.clone(),
            topo,
            store_addr,
            MemSource::new("p0", records),
            None,
        )
        .await?;
        tokio::spawn(async move {
            let _ = spout.run().await;
        });

        // acting as the negotiator: open the flow
        set_master_state(&ctl, &MasterState::Flowing { cut: None })
            .await?;
        await_state(&ctl, &id, &ProcessorState::SpoutRunning).await?;
        let (_cid, ev) = downstream.recv().await?;
        assert_eq!(
            ev,
            ShuffleEvent::Frame(Payload::data(
                "rec-1",
                Clock::of([("p0", 1)])
            ))
        );

        // begin a cut; spout parks at its next record boundary
        set_master_state(&ctl, &MasterState::SpoutsPaused).await?;
        let paused_offset = loop {
            let states = get_all_processor_states(&ctl).await?;
            if let Some(ProcessorState::SpoutPaused {
                partition,
                offset,
            }) = states.get(&id)
            {
                assert_eq!(partition, "p0");
                break *offset;
            }
            time::sleep(Duration::from_millis(10)).await;
        };
        assert!(paused_offset >= 1);

        // publish the cut; spout broadcasts the barrier and resumes
        let cut = Clock::of([("p0", paused_offset)]);
        set_master_state(
            &ctl,
            &MasterState::Flowing {
                cut: Some(cut.clone()),
            },
        )
        .await?;
        await_state(&ctl, &id, &ProcessorState::SpoutRunning).await?;

        // drain until the barrier; records before it stay <= the cut
        loop {
            let (_cid, ev) = downstream.recv().await?;
            match ev {
                ShuffleEvent::Frame(p) if p.is_barrier() => {
                    assert_eq!(p.clock, cut);
                    break;
                }
                ShuffleEvent::Frame(p) => {
                    assert!(cut.dominates(&p.clock));
                }
                ShuffleEvent::Closed => {
                    return logged_err!("test"; "conn closed early");
                }
            }
        }

        // rewind; spout re-parks at the rewind point and delimits replay
        let rewind = Clock::of([("p0", 2)]);
        set_master_state(
            &ctl,
            &MasterState::SpoutsRewind {
                clock: rewind.clone(),
            },
        )
        .await?;
        await_state(
            &ctl,
            &id,
            &ProcessorState::SpoutPaused {
                partition: "p0".into(),
                offset: 2,
            },
        )
        .await?;

        set_master_state(&ctl, &MasterState::Flowing { cut: None })
            .await?;
        // replay delimiter arrives, then the first replayed record is the
        // first one with offset strictly greater than the rewind point
        loop {
            let (_cid, ev) = downstream.recv().await?;
            match ev {
                ShuffleEvent::Frame(p) if p.is_barrier() => {
                    assert_eq!(p.clock, rewind);
                    break;
                }
                ShuffleEvent::Frame(_) => continue,
                ShuffleEvent::Closed => {
                    return logged_err!("test"; "conn closed early");
                }
            }
        }
        let (_cid, ev) = downstream.recv().await?;
        assert_eq!(
            ev,
            ShuffleEvent::Frame(Payload::data(
                "rec-3",
                Clock::of([("p0", 3)])
            ))
        );
        Ok(())
    }
}
