//! Processor identities and the two distributed state machines' state
//! types, with their stable store encodings.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::types::{Clock, Offset, Partition};
use crate::utils::SquallError;

/// Processor identity: operator name plus instance index, with
/// `0 <= instance < parallelism(name)`.
#[derive(
    Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Clone, Serialize,
    Deserialize,
)]
pub struct ProcessorId {
    pub name: String,
    pub instance: u8,
}

impl ProcessorId {
    pub fn new(name: impl Into<String>, instance: u8) -> Self {
        ProcessorId {
            name: name.into(),
            instance,
        }
    }

    /// Parses the `{name}-{instance}` rendering. Operator names may
    /// themselves contain dashes; the instance is after the last one.
    pub fn parse(s: &str) -> Result<Self, SquallError> {
        let (name, instance) = s.rsplit_once('-').ok_or_else(|| {
            SquallError::msg(format!("malformed processor id '{}'", s))
        })?;
        if name.is_empty() {
            return Err(SquallError::msg(format!(
                "malformed processor id '{}'",
                s
            )));
        }
        let instance: u8 = instance.parse().map_err(|_| {
            SquallError::msg(format!("malformed instance index in '{}'", s))
        })?;
        Ok(ProcessorId::new(name, instance))
    }
}

impl fmt::Display for ProcessorId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}-{}", self.name, self.instance)
    }
}

/// Per-processor state advertised through the processor's ephemeral node.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub enum ProcessorState {
    /// Pre-registration sentinel.
    Unspecified,

    /// Spout is emitting normally.
    SpoutRunning,

    /// Spout has stopped reading at (partition, offset); the next record
    /// it will emit has offset > this value.
    SpoutPaused {
        partition: Partition,
        offset: Offset,
    },

    /// Bolt is applying records normally.
    BoltRunning,

    /// Bolt finished loading from a prior snapshot taken at this clock
    /// (empty clock if no prior snapshot exists).
    BoltLoaded { clock: Clock },

    /// Bolt has durably written the snapshot for this clock.
    BoltSaved { clock: Clock },

    /// Sink is consuming normally.
    SinkRunning,
}

/// The authoritative global mode, written only by the Negotiator.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub enum MasterState {
    /// Fewer than expected processors registered.
    Unavailable,

    /// Processors registered; waiting for bolts to load.
    Initialization,

    /// Spouts must seek to the given clock's offsets and pause.
    SpoutsRewind { clock: Clock },

    /// A snapshot cut is in progress; spouts must pause at their next
    /// record boundary.
    SpoutsPaused,

    /// Normal operation; when the cut is present, a snapshot at that
    /// clock is currently being saved by bolts.
    Flowing { cut: Option<Clock> },
}

// Store encodings are one tag byte followed by the rmp-encoded fields of
// the variant, so that adding variants or fields never shifts existing
// tags.
mod tags {
    pub const UNSPECIFIED: u8 = 0x00;
    pub const SPOUT_RUNNING: u8 = 0x01;
    pub const SPOUT_PAUSED: u8 = 0x02;
    pub const BOLT_RUNNING: u8 = 0x03;
    pub const BOLT_LOADED: u8 = 0x04;
    pub const BOLT_SAVED: u8 = 0x05;
    pub const SINK_RUNNING: u8 = 0x06;

    pub const UNAVAILABLE: u8 = 0x10;
    pub const INITIALIZATION: u8 = 0x11;
    pub const SPOUTS_REWIND: u8 = 0x12;
    pub const SPOUTS_PAUSED: u8 = 0x13;
    pub const FLOWING: u8 = 0x14;
}

impl ProcessorState {
    pub fn to_bytes(&self) -> Result<Vec<u8>, SquallError> {
        let mut buf = Vec::new();
        match self {
            ProcessorState::Unspecified => buf.push(tags::UNSPECIFIED),
            ProcessorState::SpoutRunning => buf.push(tags::SPOUT_RUNNING),
            ProcessorState::SpoutPaused { partition, offset } => {
                buf.push(tags::SPOUT_PAUSED);
                buf.extend(rmp_serde::encode::to_vec(&(partition, offset))?);
            }
            ProcessorState::BoltRunning => buf.push(tags::BOLT_RUNNING),
            ProcessorState::BoltLoaded { clock } => {
                buf.push(tags::BOLT_LOADED);
                buf.extend(rmp_serde::encode::to_vec(clock)?);
            }
            ProcessorState::BoltSaved { clock } => {
                buf.push(tags::BOLT_SAVED);
                buf.extend(rmp_serde::encode::to_vec(clock)?);
            }
            ProcessorState::SinkRunning => buf.push(tags::SINK_RUNNING),
        }
        Ok(buf)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, SquallError> {
        let (&tag, rest) = bytes.split_first().ok_or_else(|| {
            SquallError::msg("empty processor state encoding")
        })?;
        Ok(match tag {
            tags::UNSPECIFIED => ProcessorState::Unspecified,
            tags::SPOUT_RUNNING => ProcessorState::SpoutRunning,
            tags::SPOUT_PAUSED => {
                let (partition, offset) = rmp_serde::decode::from_slice(rest)?;
                ProcessorState::SpoutPaused { partition, offset }
            }
            tags::BOLT_RUNNING => ProcessorState::BoltRunning,
            tags::BOLT_LOADED => ProcessorState::BoltLoaded {
                clock: rmp_serde::decode::from_slice(rest)?,
            },
            tags::BOLT_SAVED => ProcessorState::BoltSaved {
                clock: rmp_serde::decode::from_slice(rest)?,
            },
            tags::SINK_RUNNING => ProcessorState::SinkRunning,
            _ => {
                return Err(SquallError::msg(format!(
                    "unknown processor state tag 0x{:02x}",
                    tag
                )))
            }
        })
    }
}

impl MasterState {
    pub fn to_bytes(&self) -> Result<Vec<u8>, SquallError> {
        let mut buf = Vec::new();
        match self {
            MasterState::Unavailable => buf.push(tags::UNAVAILABLE),
            MasterState::Initialization => buf.push(tags::INITIALIZATION),
            MasterState::SpoutsRewind { clock } => {
                buf.push(tags::SPOUTS_REWIND);
                buf.extend(rmp_serde::encode::to_vec(clock)?);
            }
            MasterState::SpoutsPaused => buf.push(tags::SPOUTS_PAUSED),
            MasterState::Flowing { cut } => {
                buf.push(tags::FLOWING);
                buf.extend(rmp_serde::encode::to_vec(cut)?);
            }
        }
        Ok(buf)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, SquallError> {
        let (&tag, rest) = bytes
            .split_first()
            .ok_or_else(|| SquallError::msg("empty master state encoding"))?;
        Ok(match tag {
            tags::UNAVAILABLE => MasterState::Unavailable,
            tags::INITIALIZATION => MasterState::Initialization,
            tags::SPOUTS_REWIND => MasterState::SpoutsRewind {
                clock: rmp_serde::decode::from_slice(rest)?,
            },
            tags::SPOUTS_PAUSED => MasterState::SpoutsPaused,
            tags::FLOWING => MasterState::Flowing {
                cut: rmp_serde::decode::from_slice(rest)?,
            },
            _ => {
                return Err(SquallError::msg(format!(
                    "unknown master state tag 0x{:02x}",
                    tag
                )))
            }
        })
    }
}

impl fmt::Display for MasterState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            MasterState::Unavailable => write!(f, "Unavailable"),
            MasterState::Initialization => write!(f, "Initialization"),
            MasterState::SpoutsRewind { clock } => {
                write!(f, "SpoutsRewind({})", clock)
            }
            MasterState::SpoutsPaused => write!(f, "SpoutsPaused"),
            MasterState::Flowing { cut: None } => write!(f, "Flowing(-)"),
            MasterState::Flowing { cut: Some(c) } => {
                write!(f, "Flowing({})", c)
            }
        }
    }
}

impl fmt::Display for ProcessorState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ProcessorState::Unspecified => write!(f, "Unspecified"),
            ProcessorState::SpoutRunning => write!(f, "SpoutRunning"),
            ProcessorState::SpoutPaused { partition, offset } => {
                write!(f, "SpoutPaused({}, {})", partition, offset)
            }
            ProcessorState::BoltRunning => write!(f, "BoltRunning"),
            ProcessorState::BoltLoaded { clock } => {
                write!(f, "BoltLoaded({})", clock)
            }
            ProcessorState::BoltSaved { clock } => {
                write!(f, "BoltSaved({})", clock)
            }
            ProcessorState::SinkRunning => write!(f, "SinkRunning"),
        }
    }
}

#[cfg(test)]
mod states_tests {
    use super::*;

    #[test]
    fn processor_id_roundtrip() -> Result<(), SquallError> {
        let id = ProcessorId::new("agg", 3);
        assert_eq!(id.to_string(), "agg-3");
        assert_eq!(ProcessorId::parse("agg-3")?, id);

        // operator names may contain dashes themselves
        let id = ProcessorId::new("word-count", 0);
        assert_eq!(ProcessorId::parse(&id.to_string())?, id);

        assert!(ProcessorId::parse("noinstance").is_err());
        assert!(ProcessorId::parse("agg-").is_err());
        assert!(ProcessorId::parse("-3").is_err());
        assert!(ProcessorId::parse("agg-999").is_err());
        Ok(())
    }

    #[test]
    fn processor_state_roundtrip() -> Result<(), SquallError> {
        let states = [
            ProcessorState::Unspecified,
            ProcessorState::SpoutRunning,
            ProcessorState::SpoutPaused {
                partition: "p0".into(),
                offset: 73,
            },
            ProcessorState::BoltRunning,
            ProcessorState::BoltLoaded {
                clock: Clock::empty(),
            },
            ProcessorState::BoltSaved {
                clock: Clock::of([("p0", 73), ("p1", 12)]),
            },
            ProcessorState::SinkRunning,
        ];
        for state in states {
            let bytes = state.to_bytes()?;
            assert_eq!(ProcessorState::from_bytes(&bytes)?, state);
        }
        assert!(ProcessorState::from_bytes(&[]).is_err());
        assert!(ProcessorState::from_bytes(&[0xee]).is_err());
        Ok(())
    }

    #[test]
    fn master_state_roundtrip() -> Result<(), SquallError> {
        let states = [
            MasterState::Unavailable,
            MasterState::Initialization,
            MasterState::SpoutsRewind {
                clock: Clock::of([("p0", 73)]),
            },
            MasterState::SpoutsPaused,
            MasterState::Flowing { cut: None },
            MasterState::Flowing {
                cut: Some(Clock::of([("p0", 73)])),
            },
        ];
        for state in states {
            let bytes = state.to_bytes()?;
            assert_eq!(MasterState::from_bytes(&bytes)?, state);
        }
        assert!(MasterState::from_bytes(&[]).is_err());
        assert!(MasterState::from_bytes(&[0xee]).is_err());
        Ok(())
    }

    #[test]
    fn encoding_tags_are_stable() -> Result<(), SquallError> {
        // upgrades must not shift tag values
        assert_eq!(ProcessorState::Unspecified.to_bytes()?[0], 0x00);
        assert_eq!(ProcessorState::SinkRunning.to_bytes()?[0], 0x06);
        assert_eq!(MasterState::Unavailable.to_bytes()?[0], 0x10);
        assert_eq!(
            MasterState::Flowing { cut: None }.to_bytes()?[0],
            0x14
        );
        Ok(())
    }
}
