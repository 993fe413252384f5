//! Clocks name consistent cuts of the input stream; payloads carry the
//! clock of the input record(s) they derive from.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::utils::SquallError;

/// Name of one externally-partitioned slice of the input stream.
pub type Partition = String;

/// Position within a partition. Opaque to the core except for its total
/// order; sources may interpret it as a line number, byte position, etc.
pub type Offset = u64;

/// A mapping `{partition -> offset}`. Clocks form a join-semilattice by
/// pointwise maximum; a clock produced by a snapshot cut contains exactly
/// one offset per spout partition in the topology.
#[derive(
    Debug, PartialEq, Eq, Clone, Default, Serialize, Deserialize,
    PartialOrd, Ord,
)]
pub struct Clock(BTreeMap<Partition, Offset>);

impl Clock {
    /// Creates an empty clock (the bottom of the semilattice).
    pub fn empty() -> Self {
        Clock(BTreeMap::new())
    }

    /// Creates a clock from an iterator of (partition, offset) pairs.
    pub fn of<P>(entries: impl IntoIterator<Item = (P, Offset)>) -> Self
    where
        P: Into<Partition>,
    {
        Clock(entries.into_iter().map(|(p, o)| (p.into(), o)).collect())
    }

    /// Offset recorded for a partition; absent partitions read as 0,
    /// i.e. the start of the partition.
    pub fn get(&self, partition: &str) -> Offset {
        self.0.get(partition).copied().unwrap_or(0)
    }

    /// Sets the offset for a partition.
    pub fn set(&mut self, partition: impl Into<Partition>, offset: Offset) {
        self.0.insert(partition.into(), offset);
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn partitions(&self) -> impl Iterator<Item = &Partition> {
        self.0.keys()
    }

    /// Pointwise maximum with another clock (the semilattice join).
    pub fn join(&mut self, other: &Clock) {
        for (p, &o) in &other.0 {
            let slot = self.0.entry(p.clone()).or_insert(0);
            if o > *slot {
                *slot = o;
            }
        }
    }

    /// True iff every entry of `other` is covered by this clock, i.e.
    /// `other[p] <= self[p]` for all partitions of `other`. A payload with
    /// clock `k` is within the cut `c` exactly when `c.dominates(&k)`.
    pub fn dominates(&self, other: &Clock) -> bool {
        other.0.iter().all(|(p, &o)| self.get(p) >= o)
    }

    /// Compact textual encoding used inside the shuffle line format:
    /// `part=off` pairs joined by `,`, sorted by partition name.
    pub fn to_line(&self) -> String {
        let mut out = String::new();
        for (i, (p, o)) in self.0.iter().enumerate() {
            if i > 0 {
                out.push(',');
            }
            out.push_str(p);
            out.push('=');
            out.push_str(&o.to_string());
        }
        out
    }

    /// Parses the `to_line()` encoding. The empty string is the empty clock.
    pub fn from_line(line: &str) -> Result<Self, SquallError> {
        let mut map = BTreeMap::new();
        if line.is_empty() {
            return Ok(Clock(map));
        }
        for pair in line.split(',') {
            let (p, o) = pair.split_once('=').ok_or_else(|| {
                SquallError::msg(format!("malformed clock entry '{}'", pair))
            })?;
            let offset: Offset = o.parse().map_err(|_| {
                SquallError::msg(format!("malformed clock offset '{}'", o))
            })?;
            map.insert(p.to_string(), offset);
        }
        Ok(Clock(map))
    }
}

impl fmt::Display for Clock {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{{{}}}", self.to_line())
    }
}

/// An opaque user tuple paired with its clock. A payload with an empty
/// tuple is a barrier frame: it carries only its clock and is never handed
/// to user formulas (user tuples are required non-empty).
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub struct Payload {
    pub tuple: String,
    pub clock: Clock,
}

/// Separator between the tuple and clock fields of a shuffle line.
const FIELD_SEP: char = '\x01';

impl Payload {
    /// Creates a data payload.
    pub fn data(tuple: impl Into<String>, clock: Clock) -> Self {
        Payload {
            tuple: tuple.into(),
            clock,
        }
    }

    /// Creates a barrier frame carrying only a clock.
    pub fn barrier(clock: Clock) -> Self {
        Payload {
            tuple: String::new(),
            clock,
        }
    }

    pub fn is_barrier(&self) -> bool {
        self.tuple.is_empty()
    }

    /// The routing key of a tuple: its prefix up to the first tab, or the
    /// whole tuple when it has no tab.
    pub fn key(&self) -> &str {
        match self.tuple.split_once('\t') {
            Some((key, _)) => key,
            None => &self.tuple,
        }
    }

    /// One line of the shuffle wire format: `<tuple>\x01<clock>` (the
    /// trailing newline is added by the transport).
    pub fn to_line(&self) -> String {
        format!("{}{}{}", self.tuple, FIELD_SEP, self.clock.to_line())
    }

    /// Parses a shuffle line (without its trailing newline).
    pub fn from_line(line: &str) -> Result<Self, SquallError> {
        let (tuple, clock) = line.split_once(FIELD_SEP).ok_or_else(|| {
            SquallError::msg(format!("malformed payload line '{}'", line))
        })?;
        Ok(Payload {
            tuple: tuple.to_string(),
            clock: Clock::from_line(clock)?,
        })
    }
}

#[cfg(test)]
mod clock_tests {
    use super::*;

    #[test]
    fn join_pointwise_max() {
        let mut a = Clock::of([("p0", 5), ("p1", 9)]);
        let b = Clock::of([("p0", 7), ("p2", 1)]);
        a.join(&b);
        assert_eq!(a, Clock::of([("p0", 7), ("p1", 9), ("p2", 1)]));
    }

    #[test]
    fn join_commutes() {
        let a = Clock::of([("p0", 5), ("p1", 9)]);
        let b = Clock::of([("p0", 7), ("p2", 1)]);
        let mut ab = a.clone();
        ab.join(&b);
        let mut ba = b.clone();
        ba.join(&a);
        assert_eq!(ab, ba);
    }

    #[test]
    fn dominates_partial_order() {
        let cut = Clock::of([("p0", 73), ("p1", 10)]);
        assert!(cut.dominates(&Clock::of([("p0", 73)])));
        assert!(cut.dominates(&Clock::of([("p0", 1), ("p1", 10)])));
        assert!(!cut.dominates(&Clock::of([("p0", 74)])));
        assert!(!cut.dominates(&Clock::of([("p9", 1)])));
        assert!(cut.dominates(&Clock::empty()));
        assert!(Clock::empty().dominates(&Clock::empty()));
    }

    #[test]
    fn absent_partition_reads_zero() {
        let c = Clock::of([("p0", 73)]);
        assert_eq!(c.get("p0"), 73);
        assert_eq!(c.get("p1"), 0);
    }

    #[test]
    fn line_roundtrip() -> Result<(), SquallError> {
        let c = Clock::of([("p1", 12), ("p0", 73)]);
        assert_eq!(c.to_line(), "p0=73,p1=12");
        assert_eq!(Clock::from_line(&c.to_line())?, c);
        assert_eq!(Clock::from_line("")?, Clock::empty());
        assert!(Clock::from_line("p0").is_err());
        assert!(Clock::from_line("p0=x").is_err());
        Ok(())
    }

    #[test]
    fn payload_line_roundtrip() -> Result<(), SquallError> {
        let p = Payload::data("word\t3", Clock::of([("p0", 73)]));
        assert_eq!(p.to_line(), "word\t3\x01p0=73");
        assert_eq!(Payload::from_line(&p.to_line())?, p);

        let b = Payload::barrier(Clock::of([("p0", 73), ("p1", 12)]));
        assert!(b.is_barrier());
        assert_eq!(Payload::from_line(&b.to_line())?, b);

        let empty = Payload::barrier(Clock::empty());
        assert_eq!(empty.to_line(), "\x01");
        assert_eq!(Payload::from_line(&empty.to_line())?, empty);

        assert!(Payload::from_line("no separator").is_err());
        Ok(())
    }

    #[test]
    fn payload_key() {
        let p = Payload::data("word\t3", Clock::empty());
        assert_eq!(p.key(), "word");
        let p = Payload::data("whole-tuple", Clock::empty());
        assert_eq!(p.key(), "whole-tuple");
    }
}
