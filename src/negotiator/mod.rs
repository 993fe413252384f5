//! The Negotiator: single driver of the master state machine, and the
//! only writer of `/master_state`. It serializes two concerns: cluster
//! membership (are enough processors registered?) and the snapshot-cut
//! protocol.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{self, Duration};

use crate::master::{
    create_master_state, set_committed_clock, set_master_state,
};
use crate::registry::{
    get_all_processor_states, init_store_roots, register_processor,
    watch_living_processors,
};
use crate::store::{StoreSession, WatchRx};
use crate::topology::Topology;
use crate::types::{
    Clock, MasterState, ProcessorId, ProcessorState,
};
use crate::utils::SquallError;

/// Configuration parameters of the negotiator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NegotiatorConfig {
    /// Interval between coordination store polls while waiting on
    /// processor states, in ms.
    pub store_throttle_ms: u64,

    /// Flow time between consecutive snapshot cuts, in ms.
    pub snapshot_throttle_ms: u64,
}

impl Default for NegotiatorConfig {
    fn default() -> Self {
        NegotiatorConfig {
            store_throttle_ms: 200,
            snapshot_throttle_ms: 10_000,
        }
    }
}

/// The negotiator process. Owns the store session carrying its
/// `negotiator-0` ephemeral, the membership watch, and the handle of the
/// currently-running snapshot driver.
pub struct Negotiator {
    /// My processor ID (always `negotiator-0`).
    id: ProcessorId,

    topology: Topology,

    /// Coordination store session; owns my ephemeral registration.
    session: Arc<StoreSession>,

    config: NegotiatorConfig,

    /// Membership watch event stream.
    living_rx: WatchRx,

    /// Handle of the running snapshot driver, if any.
    driver: Option<JoinHandle<()>>,

    /// Sender side of the fatal-error channel, given to each driver.
    tx_fatal: mpsc::UnboundedSender<SquallError>,

    /// Receiver side of the fatal-error channel.
    rx_fatal: mpsc::UnboundedReceiver<SquallError>,
}

impl Negotiator {
    /// Creates a new negotiator: initializes the store roots, claims the
    /// `negotiator-0` identity, and arms the membership watch. A second
    /// live negotiator fails here with `DuplicateProcessor`.
    pub async fn new_and_setup(
        topology: Topology,
        store_addr: SocketAddr,
        config_str: Option<&str>,
    ) -> Result<Self, SquallError> {
        let config = parsed_config!(config_str => NegotiatorConfig;
                                    store_throttle_ms,
                                    snapshot_throttle_ms)?;

        let id = ProcessorId::new("negotiator", 0);
        let session = Arc::new(StoreSession::connect(store_addr).await?);
        init_store_roots(&session).await?;
        create_master_state(&session).await?;
        register_processor(&session, &id, &ProcessorState::Unspecified)
            .await?;
        let (_living, living_rx) =
            watch_living_processors(&session).await?;

        let (tx_fatal, rx_fatal) = mpsc::unbounded_channel();
        Ok(Negotiator {
            id,
            topology,
            session,
            config,
            living_rx,
            driver: None,
            tx_fatal,
            rx_fatal,
        })
    }

    /// Main event loop of the negotiator. Returns `Ok(())` only on a
    /// termination signal; any fatal error is returned after best-effort
    /// setting the master state back to `Unavailable`.
    pub async fn run(
        &mut self,
        mut rx_term: watch::Receiver<bool>,
    ) -> Result<(), SquallError> {
        // evaluate membership as found at startup
        if let Err(e) = self.refresh_membership().await {
            return self.bail(e).await;
        }

        loop {
            tokio::select! {
                // membership changed: never let the cut protocol straddle
                // a registration change
                event = self.living_rx.recv() => {
                    if event.is_none() {
                        return self.bail(SquallError::Connection(
                            "membership watch lost".into())).await;
                    }
                    if let Err(e) = self.refresh_membership().await {
                        return self.bail(e).await;
                    }
                },

                // the snapshot driver hit a fatal error; it terminates us
                // too (and our ephemeral with us)
                err = self.rx_fatal.recv() => {
                    let e = err.unwrap_or_else(|| SquallError::msg(
                        "fatal channel closed"));
                    return self.bail(e).await;
                },

                // termination signal
                _ = rx_term.changed() => {
                    pf_warn!(self.id; "caught termination signal");
                    self.kill_driver().await;
                    return Ok(());
                },
            }
        }
    }

    /// Kills the snapshot driver (if running), then either parks the
    /// cluster as `Unavailable` or starts a fresh driver, depending on
    /// how many processors are registered.
    async fn refresh_membership(&mut self) -> Result<(), SquallError> {
        self.kill_driver().await;

        let living = self
            .session
            .children(crate::registry::LIVING_PROCESSORS_PATH)
            .await?
            .len();
        let expected = self.topology.num_processors() + 1;

        if living < expected {
            pf_info!(self.id; "{} of {} processors present; unavailable",
                              living, expected);
            set_master_state(&self.session, &MasterState::Unavailable)
                .await?;
        } else {
            pf_info!(self.id; "all {} processors present; starting driver",
                              expected);
            let session = self.session.clone();
            let topology = self.topology.clone();
            let config = self.config.clone();
            let tx_fatal = self.tx_fatal.clone();
            self.driver = Some(tokio::spawn(async move {
                if let Err(e) =
                    Self::drive_snapshots(session, topology, config).await
                {
                    let _ = tx_fatal.send(e);
                }
            }));
        }
        Ok(())
    }

    /// Aborts the running snapshot driver and waits for it to be gone,
    /// so two drivers never interleave master-state writes.
    async fn kill_driver(&mut self) {
        if let Some(handle) = self.driver.take() {
            handle.abort();
            let _ = handle.await;
            pf_debug!(self.id; "snapshot driver killed");
        }
    }

    /// Fatal exit path: the operator must intervene, but the cluster
    /// should observably fall back to `Unavailable` first.
    async fn bail(&mut self, e: SquallError) -> Result<(), SquallError> {
        pf_error!(self.id; "fatal: {}", e);
        self.kill_driver().await;
        let _ = set_master_state(&self.session, &MasterState::Unavailable)
            .await;
        Err(e)
    }
}

// Negotiator snapshot driver implementation. The driver holds only a
// session handle and its fatal channel, so aborting it at any await
// point leaks nothing; the next driver restarts from `Initialization`.
impl Negotiator {
    async fn drive_snapshots(
        session: Arc<StoreSession>,
        topology: Topology,
        config: NegotiatorConfig,
    ) -> Result<(), SquallError> {
        let throttle = Duration::from_millis(config.store_throttle_ms);

        // initialization: wait for every bolt to load, demand agreement
        set_master_state(&session, &MasterState::Initialization).await?;
        let loaded =
            Self::until_bolts_loaded(&session, &topology, throttle).await?;
        let c0 = loaded.values().next().cloned().unwrap_or_default();
        if let Some((id, c)) =
            loaded.iter().find(|(_, c)| **c != c0)
        {
            return Err(SquallError::BadStartup(format!(
                "bolt {} loaded {} while others loaded {}",
                id, c, c0
            )));
        }

        // rewind: spouts seek to the agreed clock and park there
        set_master_state(
            &session,
            &MasterState::SpoutsRewind { clock: c0.clone() },
        )
        .await?;
        Self::until_spouts_paused(&session, &topology, Some(&c0), throttle)
            .await?;

        // flow loop: flow, cut, mark, wait for saves, commit
        let mut prev_cut: Option<Clock> =
            if c0.is_empty() { None } else { Some(c0) };
        loop {
            set_master_state(&session, &MasterState::Flowing { cut: None })
                .await?;
            time::sleep(Duration::from_millis(config.snapshot_throttle_ms))
                .await;

            set_master_state(&session, &MasterState::SpoutsPaused).await?;
            let cut = Self::until_spouts_paused(
                &session, &topology, None, throttle,
            )
            .await?;

            set_master_state(
                &session,
                &MasterState::Flowing {
                    cut: Some(cut.clone()),
                },
            )
            .await?;
            Self::until_bolts_saved(
                &session,
                &topology,
                &cut,
                prev_cut.as_ref(),
                throttle,
            )
            .await?;

            set_committed_clock(&session, &cut).await?;
            pf_info!("negotiator-0"; "cut {} committed", cut);
            prev_cut = Some(cut);
        }
    }

    /// Polls until every bolt announces `BoltLoaded`, returning the
    /// loaded clocks.
    async fn until_bolts_loaded(
        session: &StoreSession,
        topology: &Topology,
        throttle: Duration,
    ) -> Result<HashMap<ProcessorId, Clock>, SquallError> {
        let bolt_ids = topology.bolt_ids();
        loop {
            let states = get_all_processor_states(session).await?;
            let mut loaded = HashMap::with_capacity(bolt_ids.len());
            for id in &bolt_ids {
                if let Some(ProcessorState::BoltLoaded { clock }) =
                    states.get(id)
                {
                    loaded.insert(id.clone(), clock.clone());
                }
            }
            if loaded.len() == bolt_ids.len() {
                return Ok(loaded);
            }
            time::sleep(throttle).await;
        }
    }

    /// Polls until every spout announces `SpoutPaused`, returning the
    /// collected clock. With `expect` set (rewind), each spout must park
    /// exactly at the expected offset for its partition. The returned
    /// clock carries exactly one offset per spout partition.
    async fn until_spouts_paused(
        session: &StoreSession,
        topology: &Topology,
        expect: Option<&Clock>,
        throttle: Duration,
    ) -> Result<Clock, SquallError> {
        let spout_ids = topology.spout_ids();
        loop {
            let states = get_all_processor_states(session).await?;
            let mut cut = Clock::empty();
            let mut paused = 0;
            for id in &spout_ids {
                if let Some(ProcessorState::SpoutPaused {
                    partition,
                    offset,
                }) = states.get(id)
                {
                    if let Some(expected) = expect {
                        if *offset != expected.get(partition) {
                            continue; // stale pause from an earlier cut
                        }
                    }
                    cut.set(partition.clone(), *offset);
                    paused += 1;
                }
            }
            if paused == spout_ids.len() {
                if cut.len() != topology.spout_partitions().len() {
                    return Err(SquallError::UnexpectedStore(format!(
                        "cut {} misses spout partitions",
                        cut
                    )));
                }
                return Ok(cut);
            }
            time::sleep(throttle).await;
        }
    }

    /// Polls until every bolt announces `BoltSaved` at the current cut.
    /// A save at the previous cut is just not-yet; a save anywhere else
    /// is a divergence the cluster cannot recover from on its own.
    async fn until_bolts_saved(
        session: &StoreSession,
        topology: &Topology,
        cut: &Clock,
        prev_cut: Option<&Clock>,
        throttle: Duration,
    ) -> Result<(), SquallError> {
        let bolt_ids = topology.bolt_ids();
        loop {
            let states = get_all_processor_states(session).await?;
            let mut saved = 0;
            for id in &bolt_ids {
                match states.get(id) {
                    Some(ProcessorState::BoltSaved { clock })
                        if clock == cut =>
                    {
                        saved += 1;
                    }
                    Some(ProcessorState::BoltSaved { clock })
                        if Some(clock) == prev_cut => {}
                    Some(ProcessorState::BoltSaved { clock }) => {
                        return Err(SquallError::BadClusterState(format!(
                            "bolt {} saved {} while cut is {}",
                            id, clock, cut
                        )));
                    }
                    _ => {}
                }
            }
            if saved == bolt_ids.len() {
                return Ok(());
            }
            time::sleep(throttle).await;
        }
    }
}
