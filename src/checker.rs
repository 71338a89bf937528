//! Loop and black-hole detection.
//!
//! The checker follows the predicates an update moved from the updated device
//! through the topology. At every hop the set is narrowed to what the next
//! element forwards out of each of its ports. A position seen twice on one
//! branch closes a forwarding loop; a `default` egress with no link is a black
//! hole.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use log::{debug, trace};

use crate::element::Element;
use crate::error::{Error, Result};
use crate::header::HeaderSpace;
use crate::partition::Partition;
use crate::reference::Ref;
use crate::rule::{DEFAULT_PORT, DENY_PORT};
use crate::topology::{Position, Topology};

/// Partition an element lives in.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Side {
    Main,
    /// The ACL partition, only used in division mode.
    Acl,
}

/// Where the element of a topology node is stored.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct Placement {
    pub side: Side,
    pub id: usize,
}

/// A forwarding loop: the cycle of egress positions and the predicates caught in it.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct LoopRecord {
    pub path: Vec<Position>,
    pub aps: BTreeSet<Ref>,
}

/// Rotate `cycle` so that it starts at its smallest position.
pub fn canonical_cycle(cycle: &[Position]) -> Vec<Position> {
    let Some(start) = cycle
        .iter()
        .enumerate()
        .min_by(|a, b| a.1.cmp(b.1))
        .map(|(i, _)| i)
    else {
        return Vec::new();
    };
    cycle[start..].iter().chain(&cycle[..start]).cloned().collect()
}

/// Loops keyed by their canonical cycle.
#[derive(Debug, Default, Clone, Eq, PartialEq)]
pub struct LoopSet {
    loops: BTreeMap<Vec<Position>, BTreeSet<Ref>>,
}

impl LoopSet {
    /// Record the cycle `path` for `aps`, joining any record of the same cycle.
    pub fn add(&mut self, path: &[Position], aps: &BTreeSet<Ref>) {
        self.loops
            .entry(canonical_cycle(path))
            .or_default()
            .extend(aps);
    }

    pub fn extend(&mut self, other: LoopSet) {
        for (path, aps) in other.loops {
            self.loops.entry(path).or_default().extend(aps);
        }
    }

    pub fn len(&self) -> usize {
        self.loops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.loops.is_empty()
    }

    pub fn clear(&mut self) {
        self.loops.clear();
    }

    pub fn iter(&self) -> impl Iterator<Item = LoopRecord> + '_ {
        self.loops.iter().map(|(path, aps)| LoopRecord {
            path: path.clone(),
            aps: aps.clone(),
        })
    }
}

/// Black holes keyed by position.
#[derive(Debug, Default, Clone, Eq, PartialEq)]
pub struct BlackholeSet {
    holes: BTreeMap<Position, BTreeSet<Ref>>,
}

impl BlackholeSet {
    pub fn add(&mut self, pos: &Position, aps: &BTreeSet<Ref>) {
        self.holes.entry(pos.clone()).or_default().extend(aps);
    }

    pub fn len(&self) -> usize {
        self.holes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.holes.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Position, &BTreeSet<Ref>)> {
        self.holes.iter()
    }
}

#[derive(Debug, Default, Clone)]
pub struct CheckReport {
    pub loops: LoopSet,
    pub blackholes: BlackholeSet,
    /// Branches that reached a `deny` egress while still overlapping the ACL set.
    pub denied_overlaps: usize,
}

/// Whether two predicate sets, possibly from different partitions, share a packet.
pub(crate) fn overlaps(hs: &HeaderSpace, a: &BTreeSet<Ref>, b: &BTreeSet<Ref>) -> bool {
    if a.is_empty() || b.is_empty() {
        return false;
    }
    if a.contains(&hs.one()) || b.contains(&hs.one()) {
        return true;
    }
    hs.intersects(hs.or_all(a.iter().copied()), hs.or_all(b.iter().copied()))
}

struct Frame {
    pos: Position,
    aps: BTreeSet<Ref>,
    acl: Option<BTreeSet<Ref>>,
    history: Vec<Position>,
}

/// Read-only view of a network for one check.
pub struct Checker<'a> {
    pub(crate) hs: &'a HeaderSpace,
    pub(crate) topology: &'a Topology,
    pub(crate) main: &'a Partition,
    /// Present in division mode.
    pub(crate) acl: Option<&'a Partition>,
    pub(crate) placements: &'a HashMap<String, Placement>,
    pub(crate) check_blackholes: bool,
}

impl<'a> Checker<'a> {
    pub(crate) fn placement(&self, node: &str) -> Option<Placement> {
        self.placements.get(node).copied()
    }

    pub(crate) fn element(&self, placement: Placement) -> &'a Element {
        match (placement.side, self.acl) {
            (Side::Acl, Some(acl)) => acl.element(placement.id),
            _ => self.main.element(placement.id),
        }
    }

    fn is_division(&self) -> bool {
        self.acl.is_some()
    }

    /// Follow `moved` from the element of `node`.
    ///
    /// `acl_update` selects the division-mode entry for predicates of the ACL partition.
    pub fn check(&self, node: &str, moved: &BTreeSet<Ref>, acl_update: bool) -> Result<CheckReport> {
        let placement = self
            .placement(node)
            .ok_or_else(|| Error::ElementNotFound(node.to_string()))?;
        let element = self.element(placement);
        let mut stack = Vec::new();

        for (port, port_aps) in element.ports() {
            let (aps, acl) = if !self.is_division() {
                (element.forward_aps(self.hs, port, moved), None)
            } else if port == DEFAULT_PORT {
                continue;
            } else if acl_update {
                (port_aps.clone(), Some(moved.clone()))
            } else {
                (
                    element.forward_aps(self.hs, port, moved),
                    Some(BTreeSet::from([self.hs.one()])),
                )
            };
            if aps.is_empty() {
                continue;
            }
            for phys in self.topology.physical_ports(node, port, None) {
                stack.push(Frame {
                    pos: Position::new(node, phys),
                    aps: aps.clone(),
                    acl: acl.clone(),
                    history: Vec::new(),
                });
            }
        }

        Ok(self.traverse(stack))
    }

    fn traverse(&self, mut stack: Vec<Frame>) -> CheckReport {
        let mut report = CheckReport::default();

        while let Some(Frame {
            pos,
            aps,
            acl,
            mut history,
        }) = stack.pop()
        {
            if aps.is_empty() {
                continue;
            }
            if let Some(acl) = &acl {
                if !overlaps(self.hs, &aps, acl) {
                    continue;
                }
            }
            if let Some(first) = history.iter().position(|p| *p == pos) {
                debug!("loop through {} for {} predicates", pos, aps.len());
                report.loops.add(&history[first..], &aps);
                continue;
            }
            history.push(pos.clone());

            let Some(peers) = self.topology.connected(&pos) else {
                if self.check_blackholes && pos.port == DEFAULT_PORT {
                    report.blackholes.add(&pos, &aps);
                }
                continue;
            };

            for next in peers {
                let Some(placement) = self.placement(&next.device) else {
                    trace!("{} leads to unknown node {}", pos, next);
                    continue;
                };
                let element = self.element(placement);

                if placement.side == Side::Acl {
                    let Some(acl) = &acl else { continue };
                    for (port, _) in element.ports() {
                        let filtered = element.forward_aps(self.hs, port, acl);
                        if port == DENY_PORT {
                            if overlaps(self.hs, &aps, &filtered) {
                                report.denied_overlaps += 1;
                            }
                            continue;
                        }
                        stack.push(Frame {
                            pos: Position::new(next.device.as_str(), port),
                            aps: aps.clone(),
                            acl: Some(filtered),
                            history: history.clone(),
                        });
                    }
                    continue;
                }

                for (port, _) in element.ports() {
                    let forwarded = element.forward_aps(self.hs, port, &aps);
                    if forwarded.is_empty() {
                        continue;
                    }
                    for phys in self
                        .topology
                        .physical_ports(&next.device, port, Some(&next.port))
                    {
                        stack.push(Frame {
                            pos: Position::new(next.device.as_str(), phys),
                            aps: forwarded.clone(),
                            acl: acl.clone(),
                            history: history.clone(),
                        });
                    }
                }
            }
        }

        report
    }
}
