//! Processor registry: live processors advertise themselves and their
//! current state as ephemeral nodes under a well-known store path.

use std::collections::HashMap;

use crate::store::{StoreSession, WatchRx};
use crate::types::{Clock, ProcessorId, ProcessorState};
use crate::utils::SquallError;

/// Container of per-processor ephemeral nodes.
pub const LIVING_PROCESSORS_PATH: &str = "/living_processors";

/// The single master-state node; the Negotiator is its sole writer.
pub const MASTER_STATE_PATH: &str = "/master_state";

/// The most recent clock for which every bolt announced a durable save;
/// written by the Negotiator after each completed cut.
pub const COMMITTED_CLOCK_PATH: &str = "/committed_clock";

/// Store path of a processor's ephemeral node.
pub fn processor_path(id: &ProcessorId) -> String {
    format!("{}/{}", LIVING_PROCESSORS_PATH, id)
}

/// Creates the persistent roots. Idempotent: roots already present are
/// left untouched (recovery preserves their values).
pub async fn init_store_roots(
    session: &StoreSession,
) -> Result<(), SquallError> {
    for (path, data) in [
        (LIVING_PROCESSORS_PATH, Vec::new()),
        (
            COMMITTED_CLOCK_PATH,
            rmp_serde::encode::to_vec(&Clock::empty())?,
        ),
    ] {
        match session.create_persistent(path, data).await {
            Ok(_) => {}
            Err(SquallError::NodeExists(_)) => {}
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

/// Registers a live processor under its well-known path. A collision
/// means another live instance holds the same identity, which is fatal
/// for the caller.
pub async fn register_processor(
    session: &StoreSession,
    id: &ProcessorId,
    initial: &ProcessorState,
) -> Result<(), SquallError> {
    match session
        .register_ephemeral(&processor_path(id), initial.to_bytes()?)
        .await
    {
        Ok(_) => {
            pf_info!(id; "registered with initial state {}", initial);
            Ok(())
        }
        Err(SquallError::NodeExists(_)) => {
            Err(SquallError::DuplicateProcessor(id.to_string()))
        }
        Err(SquallError::NoNode(_)) => {
            Err(SquallError::UnexpectedStore(format!(
                "store roots missing while registering {}; \
                 run store-init first",
                id
            )))
        }
        Err(e) => Err(e),
    }
}

/// Announces a processor's current state on its ephemeral node.
pub async fn set_processor_state(
    session: &StoreSession,
    id: &ProcessorId,
    state: &ProcessorState,
) -> Result<(), SquallError> {
    pf_debug!(id; "announcing state {}", state);
    match session.set(&processor_path(id), state.to_bytes()?).await {
        Ok(_) => Ok(()),
        // our own registration must exist while we live
        Err(SquallError::NoNode(path)) => {
            Err(SquallError::UnexpectedStore(format!(
                "registration node '{}' vanished",
                path
            )))
        }
        Err(e) => Err(e),
    }
}

/// Reads every living processor's state in one pass. A child vanishing
/// between the listing and its read is a benign race (the processor just
/// died); malformed content is not.
pub async fn get_all_processor_states(
    session: &StoreSession,
) -> Result<HashMap<ProcessorId, ProcessorState>, SquallError> {
    let children = session.children(LIVING_PROCESSORS_PATH).await?;
    let mut states = HashMap::with_capacity(children.len());
    for child in children {
        let id = ProcessorId::parse(&child).map_err(|e| {
            SquallError::UnexpectedStore(format!(
                "bad registration node '{}': {}",
                child, e
            ))
        })?;
        let path = format!("{}/{}", LIVING_PROCESSORS_PATH, child);
        match session.get(&path).await {
            Ok((data, _)) => {
                let state =
                    ProcessorState::from_bytes(&data).map_err(|e| {
                        SquallError::UnexpectedStore(format!(
                            "bad state on '{}': {}",
                            path, e
                        ))
                    })?;
                states.insert(id, state);
            }
            Err(SquallError::NoNode(_)) => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(states)
}

/// Lists living processors and subscribes to membership changes.
pub async fn watch_living_processors(
    session: &StoreSession,
) -> Result<(Vec<String>, WatchRx), SquallError> {
    session.children_watch(LIVING_PROCESSORS_PATH).await
}

#[cfg(test)]
mod registry_tests {
    use super::*;
    use crate::store::StoreService;
    use crate::types::Clock;

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn roots_idempotent() -> Result<(), SquallError> {
        let service =
            StoreService::new_and_setup("127.0.0.1:54820".parse()?).await?;
        let sess = StoreSession::connect(service.local_addr()).await?;
        init_store_roots(&sess).await?;
        init_store_roots(&sess).await?;
        assert_eq!(sess.children(LIVING_PROCESSORS_PATH).await?.len(), 0);
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn duplicate_processor_refused() -> Result<(), SquallError> {
        let service =
            StoreService::new_and_setup("127.0.0.1:54821".parse()?).await?;
        let sess = StoreSession::connect(service.local_addr()).await?;
        init_store_roots(&sess).await?;

        let id = ProcessorId::new("negotiator", 0);
        register_processor(&sess, &id, &ProcessorState::Unspecified)
            .await?;

        // a second negotiator is refused at registration, even on a
        // fresh session
        let other = StoreSession::connect(service.local_addr()).await?;
        let err =
            register_processor(&other, &id, &ProcessorState::Unspecified)
                .await;
        assert_eq!(
            err,
            Err(SquallError::DuplicateProcessor("negotiator-0".into()))
        );
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn states_readback() -> Result<(), SquallError> {
        let service =
            StoreService::new_and_setup("127.0.0.1:54822".parse()?).await?;
        let sess = StoreSession::connect(service.local_addr()).await?;
        init_store_roots(&sess).await?;

        let spout = ProcessorId::new("src", 0);
        let bolt = ProcessorId::new("agg", 0);
        register_processor(&sess, &spout, &ProcessorState::Unspecified)
            .await?;
        register_processor(&sess, &bolt, &ProcessorState::Unspecified)
            .await?;

        set_processor_state(
            &sess,
            &spout,
            &ProcessorState::SpoutPaused {
                partition: "p0".into(),
                offset: 73,
            },
        )
        .await?;
        set_processor_state(
            &sess,
            &bolt,
            &ProcessorState::BoltLoaded {
                clock: Clock::of([("p0", 73)]),
            },
        )
        .await?;

        let states = get_all_processor_states(&sess).await?;
        assert_eq!(states.len(), 2);
        assert_eq!(
            states[&spout],
            ProcessorState::SpoutPaused {
                partition: "p0".into(),
                offset: 73,
            }
        );
        assert_eq!(
            states[&bolt],
            ProcessorState::BoltLoaded {
                clock: Clock::of([("p0", 73)]),
            }
        );
        Ok(())
    }
}
