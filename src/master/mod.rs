//! Master-state channel: a single persistent node written only by the
//! Negotiator, mirrored into every processor through a data watch.

use std::sync::Arc;

use tokio::sync::watch;

use crate::registry::{COMMITTED_CLOCK_PATH, MASTER_STATE_PATH};
use crate::store::StoreSession;
use crate::types::{Clock, MasterState};
use crate::utils::SquallError;

/// Creates `/master_state` with the initial `Unavailable` value. If the
/// node already exists its value is preserved, so a restarted Negotiator
/// recovers the last known state.
pub async fn create_master_state(
    session: &StoreSession,
) -> Result<(), SquallError> {
    match session
        .create_persistent(
            MASTER_STATE_PATH,
            MasterState::Unavailable.to_bytes()?,
        )
        .await
    {
        Ok(_) | Err(SquallError::NodeExists(_)) => Ok(()),
        Err(e) => Err(e),
    }
}

/// Writes the master state. Only the Negotiator calls this.
pub async fn set_master_state(
    session: &StoreSession,
    state: &MasterState,
) -> Result<(), SquallError> {
    pf_info!("negotiator-0"; "master state := {}", state);
    session.set(MASTER_STATE_PATH, state.to_bytes()?).await?;
    Ok(())
}

/// Reads the current master state.
pub async fn get_master_state(
    session: &StoreSession,
) -> Result<MasterState, SquallError> {
    let (data, _) = session.get(MASTER_STATE_PATH).await?;
    MasterState::from_bytes(&data)
}

/// Persists the clock of a cut every bolt has durably saved.
pub async fn set_committed_clock(
    session: &StoreSession,
    clock: &Clock,
) -> Result<(), SquallError> {
    session
        .set(COMMITTED_CLOCK_PATH, rmp_serde::encode::to_vec(clock)?)
        .await?;
    Ok(())
}

/// Reads the last committed clock; absent or empty means no cut has ever
/// completed.
pub async fn get_committed_clock(
    session: &StoreSession,
) -> Result<Clock, SquallError> {
    match session.get(COMMITTED_CLOCK_PATH).await {
        Ok((data, _)) => Ok(rmp_serde::decode::from_slice(&data)?),
        Err(SquallError::NoNode(_)) => Ok(Clock::empty()),
        Err(e) => Err(e),
    }
}

/// A processor-local mirror of the master state: a single-slot mailbox
/// kept fresh by a watcher task, read by polling or awaiting changes.
/// Latest value wins; intermediate transitions may be coalesced.
#[derive(Clone)]
pub struct MasterMirror {
    rx: watch::Receiver<MasterState>,
}

impl MasterMirror {
    /// Starts the watcher task over an existing session and returns the
    /// mirror. The task re-reads the node on every watch firing and ends
    /// on session loss, which ends the mirror too. It keeps only a weak
    /// session handle, so the owning processor's drop still tears the
    /// session (and its ephemeral registration) down.
    pub async fn start(
        session: Arc<StoreSession>,
    ) -> Result<Self, SquallError> {
        let (data, _, mut watch_rx) =
            session.get_watch(MASTER_STATE_PATH).await?;
        let initial = MasterState::from_bytes(&data)?;
        let (tx, rx) = watch::channel(initial);

        let weak = Arc::downgrade(&session);
        drop(session);
        tokio::spawn(async move {
            while watch_rx.recv().await.is_some() {
                let Some(session) = weak.upgrade() else {
                    break;
                };
                match session.get(MASTER_STATE_PATH).await {
                    Ok((data, _)) => match MasterState::from_bytes(&data) {
                        Ok(state) => {
                            if tx.send(state).is_err() {
                                break; // all mirrors dropped
                            }
                        }
                        Err(e) => {
                            pf_error!("mirror";
                                      "bad master state bytes: {}", e);
                            break;
                        }
                    },
                    Err(e) => {
                        pf_error!("mirror";
                                  "error refreshing master state: {}", e);
                        break;
                    }
                }
            }
        });

        Ok(MasterMirror { rx })
    }

    /// Latest observed master state.
    pub fn latest(&self) -> MasterState {
        self.rx.borrow().clone()
    }

    /// Waits for the next master-state change. An error means the session
    /// behind the mirror is gone, which is fatal for the owning processor.
    pub async fn changed(&mut self) -> Result<(), SquallError> {
        self.rx.changed().await.map_err(|_| {
            SquallError::Connection("master-state mirror lost".into())
        })
    }
}

#[cfg(test)]
mod master_tests {
    use super::*;
    use crate::store::StoreService;

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn create_preserves_existing() -> Result<(), SquallError> {
        let service =
            StoreService::new_and_setup("127.0.0.1:54830".parse()?).await?;
        let sess = StoreSession::connect(service.local_addr()).await?;

        create_master_state(&sess).await?;
        set_master_state(&sess, &MasterState::SpoutsPaused).await?;

        // a restarted negotiator re-creates idempotently and still sees
        // the last written state
        create_master_state(&sess).await?;
        assert_eq!(
            get_master_state(&sess).await?,
            MasterState::SpoutsPaused
        );
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn mirror_follows_writer() -> Result<(), SquallError> {
        let service =
            StoreService::new_and_setup("127.0.0.1:54831".parse()?).await?;
        let writer = StoreSession::connect(service.local_addr()).await?;
        create_master_state(&writer).await?;

        // the mirror holds only a weak session handle; the reader keeps
        // the session alive for the duration
        let reader =
            Arc::new(StoreSession::connect(service.local_addr()).await?);
        let mut mirror = MasterMirror::start(reader.clone()).await?;
        assert_eq!(mirror.latest(), MasterState::Unavailable);

        set_master_state(&writer, &MasterState::Initialization).await?;
        mirror.changed().await?;
        assert_eq!(mirror.latest(), MasterState::Initialization);

        let cut = Clock::of([("p0", 73)]);
        set_master_state(
            &writer,
            &MasterState::Flowing {
                cut: Some(cut.clone()),
            },
        )
        .await?;
        mirror.changed().await?;
        assert_eq!(
            mirror.latest(),
            MasterState::Flowing { cut: Some(cut) }
        );
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn committed_clock_roundtrip() -> Result<(), SquallError> {
        let service =
            StoreService::new_and_setup("127.0.0.1:54832".parse()?).await?;
        let sess = StoreSession::connect(service.local_addr()).await?;
        crate::registry::init_store_roots(&sess).await?;

        assert_eq!(get_committed_clock(&sess).await?, Clock::empty());
        let c = Clock::of([("p0", 73), ("p1", 12)]);
        set_committed_clock(&sess, &c).await?;
        assert_eq!(get_committed_clock(&sess).await?, c);
        Ok(())
    }
}
