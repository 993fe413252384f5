//! Core data model: stream positions, payloads, and the processor/master
//! state machines' state types.

mod clock;
mod states;

pub use clock::{Clock, Offset, Partition, Payload};
pub use states::{MasterState, ProcessorId, ProcessorState};
