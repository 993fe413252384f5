//! Static topology descriptor: operator kinds, parallelism, downstream
//! routing, and processor addresses. Built once, validated, and replicated
//! verbatim to every processor.

use std::collections::{BTreeMap, BTreeSet};
use std::net::SocketAddr;

use serde::{Deserialize, Serialize};

use crate::types::{Partition, ProcessorId};
use crate::utils::SquallError;

/// Role of an operator within the topology.
#[derive(
    Debug, PartialEq, Eq, Clone, Copy, Serialize, Deserialize,
)]
pub enum OperatorKind {
    /// Source operator bound to one input partition per instance.
    Spout,

    /// Stateful operator that consumes payloads and may emit payloads.
    Bolt,

    /// Terminal operator that writes outside the system.
    Sink,
}

/// Static description of one operator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Operator {
    pub kind: OperatorKind,

    pub parallelism: u8,

    /// Names of downstream operators receiving this operator's output.
    pub downstreams: Vec<String>,

    /// Input partition per instance; spouts only, length == parallelism.
    #[serde(default)]
    pub partitions: Vec<Partition>,

    /// Shuffle listen address per instance; bolts and sinks only.
    #[serde(default)]
    pub addresses: Vec<SocketAddr>,
}

/// The validated topology descriptor. All queries are read-only; there is
/// a single concrete representation built from static tables.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Topology {
    processors: BTreeMap<String, Operator>,
}

impl Topology {
    pub fn lookup(&self, name: &str) -> Result<&Operator, SquallError> {
        self.processors.get(name).ok_or_else(|| {
            SquallError::msg(format!("unknown operator '{}'", name))
        })
    }

    pub fn parallelism(&self, name: &str) -> Result<u8, SquallError> {
        Ok(self.lookup(name)?.parallelism)
    }

    pub fn downstreams(&self, name: &str) -> Result<&[String], SquallError> {
        Ok(&self.lookup(name)?.downstreams)
    }

    /// Names of operators whose downstreams include `name`.
    pub fn upstreams(&self, name: &str) -> Vec<&str> {
        self.processors
            .iter()
            .filter(|(_, op)| op.downstreams.iter().any(|d| d == name))
            .map(|(n, _)| n.as_str())
            .collect()
    }

    /// Total number of upstream operator instances feeding `name`. Every
    /// one of them opens a shuffle connection to each instance of `name`
    /// at least for barrier broadcasts.
    pub fn upstream_instances(&self, name: &str) -> usize {
        self.upstreams(name)
            .iter()
            .map(|u| self.processors[*u].parallelism as usize)
            .sum()
    }

    fn ids_of_kind(&self, kind: OperatorKind) -> Vec<ProcessorId> {
        let mut ids = Vec::new();
        for (name, op) in &self.processors {
            if op.kind == kind {
                for instance in 0..op.parallelism {
                    ids.push(ProcessorId::new(name.clone(), instance));
                }
            }
        }
        ids
    }

    pub fn spout_ids(&self) -> Vec<ProcessorId> {
        self.ids_of_kind(OperatorKind::Spout)
    }

    pub fn bolt_ids(&self) -> Vec<ProcessorId> {
        self.ids_of_kind(OperatorKind::Bolt)
    }

    pub fn sink_ids(&self) -> Vec<ProcessorId> {
        self.ids_of_kind(OperatorKind::Sink)
    }

    /// Sum of parallelisms across all operators (the negotiator itself is
    /// not counted).
    pub fn num_processors(&self) -> usize {
        self.processors
            .values()
            .map(|op| op.parallelism as usize)
            .sum()
    }

    /// All spout input partitions, one per spout instance.
    pub fn spout_partitions(&self) -> Vec<&Partition> {
        self.processors
            .values()
            .filter(|op| op.kind == OperatorKind::Spout)
            .flat_map(|op| op.partitions.iter())
            .collect()
    }

    /// The input partition owned by a spout instance.
    pub fn partition_for(
        &self,
        id: &ProcessorId,
    ) -> Result<&Partition, SquallError> {
        let op = self.lookup(&id.name)?;
        op.partitions.get(id.instance as usize).ok_or_else(|| {
            SquallError::msg(format!("no partition for '{}'", id))
        })
    }

    /// The shuffle listen address of a bolt or sink instance.
    pub fn address_for(
        &self,
        id: &ProcessorId,
    ) -> Result<SocketAddr, SquallError> {
        let op = self.lookup(&id.name)?;
        op.addresses.get(id.instance as usize).copied().ok_or_else(
            || SquallError::msg(format!("no address for '{}'", id)),
        )
    }

    /// The downstream instance a keyed payload routes to. Deterministic
    /// across platforms and processes so that every upstream instance
    /// routes identically.
    pub fn downstream_instance(
        &self,
        name: &str,
        key: &str,
    ) -> Result<u8, SquallError> {
        let parallelism = self.parallelism(name)? as u64;
        Ok((fnv1a_64(key.as_bytes()) % parallelism) as u8)
    }

    /// Serializes the topology as a TOML document.
    pub fn to_toml(&self) -> Result<String, SquallError> {
        Ok(toml::to_string(self)?)
    }

    /// Parses and re-validates a topology from a TOML document.
    pub fn from_toml(doc: &str) -> Result<Self, SquallError> {
        let topo: Topology = toml::from_str(doc)?;
        topo.validate()?;
        Ok(topo)
    }

    fn validate(&self) -> Result<(), SquallError> {
        for (name, op) in &self.processors {
            if op.parallelism == 0 {
                return Err(SquallError::msg(format!(
                    "operator '{}' has zero parallelism",
                    name
                )));
            }
            for d in &op.downstreams {
                let down = self.processors.get(d).ok_or_else(|| {
                    SquallError::msg(format!(
                        "operator '{}' routes to unknown '{}'",
                        name, d
                    ))
                })?;
                if down.kind == OperatorKind::Spout {
                    return Err(SquallError::msg(format!(
                        "operator '{}' routes into spout '{}'",
                        name, d
                    )));
                }
            }
            match op.kind {
                OperatorKind::Spout => {
                    if op.partitions.len() != op.parallelism as usize {
                        return Err(SquallError::msg(format!(
                            "spout '{}' needs one partition per instance",
                            name
                        )));
                    }
                    if op.downstreams.is_empty() {
                        return Err(SquallError::msg(format!(
                            "spout '{}' has no downstream",
                            name
                        )));
                    }
                }
                OperatorKind::Bolt | OperatorKind::Sink => {
                    if op.addresses.len() != op.parallelism as usize {
                        return Err(SquallError::msg(format!(
                            "operator '{}' needs one address per instance",
                            name
                        )));
                    }
                    if op.kind == OperatorKind::Sink
                        && !op.downstreams.is_empty()
                    {
                        return Err(SquallError::msg(format!(
                            "sink '{}' cannot have downstreams",
                            name
                        )));
                    }
                }
            }
        }

        // spout partitions must be unique: a clock entry per partition
        let mut seen = BTreeSet::new();
        for p in self.spout_partitions() {
            if !seen.insert(p.clone()) {
                return Err(SquallError::msg(format!(
                    "partition '{}' owned by more than one spout",
                    p
                )));
            }
        }

        self.check_acyclic()
    }

    // Depth-first walk; the operator graph must be a DAG.
    fn check_acyclic(&self) -> Result<(), SquallError> {
        #[derive(Clone, Copy, PartialEq)]
        enum Mark {
            InProgress,
            Done,
        }
        let mut marks: BTreeMap<&str, Mark> = BTreeMap::new();

        fn visit<'a>(
            topo: &'a Topology,
            name: &'a str,
            marks: &mut BTreeMap<&'a str, Mark>,
        ) -> Result<(), SquallError> {
            match marks.get(name) {
                Some(Mark::Done) => return Ok(()),
                Some(Mark::InProgress) => {
                    return Err(SquallError::msg(format!(
                        "topology contains a cycle through '{}'",
                        name
                    )));
                }
                None => {}
            }
            marks.insert(name, Mark::InProgress);
            for d in &topo.processors[name].downstreams {
                visit(topo, d, marks)?;
            }
            marks.insert(name, Mark::Done);
            Ok(())
        }

        for name in self.processors.keys() {
            visit(self, name, &mut marks)?;
        }
        Ok(())
    }
}

/// FNV-1a 64-bit over the routing key. Chosen for determinism across
/// platforms and processes; `DefaultHasher` makes no such promise.
fn fnv1a_64(bytes: &[u8]) -> u64 {
    const OFFSET_BASIS: u64 = 0xcbf2_9ce4_8422_2325;
    const PRIME: u64 = 0x0000_0100_0000_01b3;
    let mut hash = OFFSET_BASIS;
    for &b in bytes {
        hash ^= b as u64;
        hash = hash.wrapping_mul(PRIME);
    }
    hash
}

/// Builder for assembling a validated `Topology` from static tables.
#[derive(Debug, Default)]
pub struct TopologyBuilder {
    inner: Topology,
}

impl TopologyBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a spout; parallelism is the number of partitions given.
    pub fn spout(
        mut self,
        name: impl Into<String>,
        partitions: Vec<Partition>,
        downstreams: Vec<String>,
    ) -> Self {
        self.inner.processors.insert(
            name.into(),
            Operator {
                kind: OperatorKind::Spout,
                parallelism: partitions.len() as u8,
                downstreams,
                partitions,
                addresses: Vec::new(),
            },
        );
        self
    }

    /// Adds a bolt; parallelism is the number of addresses given.
    pub fn bolt(
        mut self,
        name: impl Into<String>,
        addresses: Vec<SocketAddr>,
        downstreams: Vec<String>,
    ) -> Self {
        self.inner.processors.insert(
            name.into(),
            Operator {
                kind: OperatorKind::Bolt,
                parallelism: addresses.len() as u8,
                downstreams,
                partitions: Vec::new(),
                addresses,
            },
        );
        self
    }

    /// Adds a sink; parallelism is the number of addresses given.
    pub fn sink(
        mut self,
        name: impl Into<String>,
        addresses: Vec<SocketAddr>,
    ) -> Self {
        self.inner.processors.insert(
            name.into(),
            Operator {
                kind: OperatorKind::Sink,
                parallelism: addresses.len() as u8,
                downstreams: Vec::new(),
                partitions: Vec::new(),
                addresses,
            },
        );
        self
    }

    pub fn build(self) -> Result<Topology, SquallError> {
        self.inner.validate()?;
        Ok(self.inner)
    }
}

#[cfg(test)]
mod topology_tests {
    use super::*;

    fn sample() -> Topology {
        TopologyBuilder::new()
            .spout("src", vec!["p0".into(), "p1".into()], vec!["agg".into()])
            .bolt(
                "agg",
                vec![
                    "127.0.0.1:7101".parse().unwrap(),
                    "127.0.0.1:7102".parse().unwrap(),
                ],
                vec!["out".into()],
            )
            .sink("out", vec!["127.0.0.1:7201".parse().unwrap()])
            .build()
            .unwrap()
    }

    #[test]
    fn derived_queries() -> Result<(), SquallError> {
        let topo = sample();
        assert_eq!(topo.num_processors(), 5);
        assert_eq!(topo.parallelism("src")?, 2);
        assert_eq!(
            topo.spout_ids(),
            vec![ProcessorId::new("src", 0), ProcessorId::new("src", 1)]
        );
        assert_eq!(
            topo.bolt_ids(),
            vec![ProcessorId::new("agg", 0), ProcessorId::new("agg", 1)]
        );
        assert_eq!(topo.sink_ids(), vec![ProcessorId::new("out", 0)]);
        assert_eq!(topo.upstreams("agg"), vec!["src"]);
        assert_eq!(topo.upstreams("out"), vec!["agg"]);
        assert_eq!(topo.upstream_instances("agg"), 2);
        assert_eq!(topo.upstream_instances("out"), 2);
        assert_eq!(
            topo.partition_for(&ProcessorId::new("src", 1))?,
            &"p1".to_string()
        );
        assert_eq!(
            topo.address_for(&ProcessorId::new("agg", 1))?,
            "127.0.0.1:7102".parse::<SocketAddr>()?
        );
        assert_eq!(topo.spout_partitions().len(), 2);
        Ok(())
    }

    #[test]
    fn keyed_routing_deterministic() -> Result<(), SquallError> {
        let topo = sample();
        for key in ["alpha", "beta", "gamma", ""] {
            let i = topo.downstream_instance("agg", key)?;
            assert!(i < 2);
            // repeated routing of the same key never moves
            assert_eq!(topo.downstream_instance("agg", key)?, i);
        }
        // singleton downstream always routes to instance 0
        assert_eq!(topo.downstream_instance("out", "anything")?, 0);
        Ok(())
    }

    #[test]
    fn keyed_routing_spreads() -> Result<(), SquallError> {
        let topo = sample();
        let mut hit = [false; 2];
        for i in 0..64 {
            let key = format!("key-{}", i);
            hit[topo.downstream_instance("agg", &key)? as usize] = true;
        }
        assert!(hit[0] && hit[1]);
        Ok(())
    }

    #[test]
    fn toml_roundtrip() -> Result<(), SquallError> {
        let topo = sample();
        let doc = topo.to_toml()?;
        let back = Topology::from_toml(&doc)?;
        assert_eq!(back.num_processors(), topo.num_processors());
        assert_eq!(back.spout_ids(), topo.spout_ids());
        assert_eq!(
            back.address_for(&ProcessorId::new("out", 0))?,
            topo.address_for(&ProcessorId::new("out", 0))?
        );
        Ok(())
    }

    #[test]
    fn build_rejects_invalid() {
        // unknown downstream
        assert!(TopologyBuilder::new()
            .spout("src", vec!["p0".into()], vec!["nowhere".into()])
            .build()
            .is_err());

        // duplicate partition across spouts
        assert!(TopologyBuilder::new()
            .spout("a", vec!["p0".into()], vec!["out".into()])
            .spout("b", vec!["p0".into()], vec!["out".into()])
            .sink("out", vec!["127.0.0.1:7301".parse().unwrap()])
            .build()
            .is_err());

        // cycle between bolts
        assert!(TopologyBuilder::new()
            .spout("src", vec!["p0".into()], vec!["x".into()])
            .bolt(
                "x",
                vec!["127.0.0.1:7302".parse().unwrap()],
                vec!["y".into()],
            )
            .bolt(
                "y",
                vec!["127.0.0.1:7303".parse().unwrap()],
                vec!["x".into()],
            )
            .build()
            .is_err());

        // spout with no downstream
        assert!(TopologyBuilder::new()
            .spout("src", vec!["p0".into()], vec![])
            .build()
            .is_err());
    }
}
