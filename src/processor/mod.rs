//! Processor runners: the spout state machine, the bolt runner that
//! aligns on barriers and snapshots its state, and the sink runner.
//! User logic plugs in through the `BoltFormula` and `SinkWriter` traits.

mod bolt;
mod formulas;
mod sink;
mod spout;

pub use bolt::{BoltConfig, BoltRunner};
pub use formulas::{
    BoltFormula, LineFileSink, PassthroughFormula, SinkWriter, StdoutSink,
    VecSink, WordCountFormula,
};
pub use sink::{SinkConfig, SinkRunner};
pub use spout::{SpoutConfig, SpoutRunner};
