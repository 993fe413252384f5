//! Public interface to the Squall core library, linked by the store,
//! processor, and control executables.

#![allow(clippy::uninlined_format_args)]

#[macro_use]
mod utils;

mod input;
mod master;
mod negotiator;
mod processor;
mod registry;
mod shuffle;
mod snapshot;
mod store;
mod topology;
mod types;

pub use utils::{logger_init, SquallError};

pub use types::{
    Clock, MasterState, Offset, Partition, Payload, ProcessorId,
    ProcessorState,
};

pub use topology::{OperatorKind, Topology, TopologyBuilder};

pub use store::{
    Stat, StoreService, StoreSession, WatchEvent, WatchKind, WatchRx,
};

pub use registry::{
    get_all_processor_states, init_store_roots, processor_path,
    register_processor, set_processor_state, watch_living_processors,
    COMMITTED_CLOCK_PATH, LIVING_PROCESSORS_PATH, MASTER_STATE_PATH,
};

pub use master::{
    create_master_state, get_committed_clock, get_master_state,
    set_committed_clock, set_master_state, MasterMirror,
};

pub use input::{FileSource, InputSource, MemSource};

pub use snapshot::{FileSnapshotStore, MemSnapshotStore, SnapshotStore};

pub use shuffle::{ConnId, ShuffleEvent, ShuffleListener, ShuffleSender};

pub use processor::{
    BoltConfig, BoltFormula, BoltRunner, LineFileSink, PassthroughFormula,
    SinkConfig, SinkRunner, SinkWriter, SpoutConfig, SpoutRunner, StdoutSink,
    VecSink, WordCountFormula,
};

pub use negotiator::{Negotiator, NegotiatorConfig};
