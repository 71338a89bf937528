//! Forwarding graph of a set of predicates.
//!
//! Instead of consulting elements hop by hop, the graph variant first collects
//! every egress position holding one of the predicates, copies the topology
//! links among them and then walks the resulting graph. Removing one link from
//! the copy answers "what if this link failed" without touching the network.

use std::collections::{BTreeMap, BTreeSet};

use log::{debug, trace};

use crate::checker::{overlaps, CheckReport, Checker, Side};
use crate::element::ElementKind;
use crate::error::Result;
use crate::nat::RewriteTable;
use crate::reference::Ref;
use crate::rule::{DEFAULT_PORT, DENY_PORT};
use crate::topology::{acl_nodes, is_vlan, Position};

struct Step {
    pos: Position,
    aps: BTreeSet<Ref>,
    /// Predicates of the ACL partition still permitted, in division mode.
    acl: Option<BTreeSet<Ref>>,
    history: Vec<Position>,
}

#[derive(Debug, Default)]
pub struct ForwardingGraph {
    /// Predicates held at each egress position.
    holding: BTreeMap<Position, BTreeSet<Ref>>,
    /// Egress positions of each node.
    by_node: BTreeMap<String, Vec<Position>>,
    /// Positions obtained by expanding a VLAN.
    vlan_members: BTreeSet<Position>,
    /// NAT nodes and their element ids.
    nat_nodes: BTreeMap<String, usize>,
    edges: BTreeMap<Position, BTreeSet<Position>>,
}

impl ForwardingGraph {
    /// Build the graph of `aps`, leaving out the link `failed` if given.
    pub fn build(checker: &Checker<'_>, aps: &BTreeSet<Ref>, failed: Option<(&Position, &Position)>) -> Result<Self> {
        let mut graph = Self::default();
        let main = checker.main;

        // Close the set under NAT rewriting.
        let tables: Vec<(usize, &RewriteTable)> = main
            .elements()
            .enumerate()
            .filter_map(|(id, e)| e.rewrite_table().map(|t| (id, t)))
            .collect();
        let mut closure: BTreeSet<Ref> = aps.iter().copied().filter(|&ap| main.is_live(ap)).collect();
        let mut frontier: Vec<Ref> = closure.iter().copied().collect();
        while let Some(ap) = frontier.pop() {
            for (_, table) in &tables {
                for &out in table.outputs(ap).into_iter().flatten() {
                    if closure.insert(out) {
                        frontier.push(out);
                    }
                }
            }
        }
        for (id, _) in &tables {
            graph.nat_nodes.insert(main.element(*id).name().to_string(), *id);
        }

        for &ap in &closure {
            for (id, port) in main.hold_positions(ap, true)? {
                let element = main.element(id);
                match element.kind() {
                    ElementKind::Acl => {
                        for node in acl_nodes(element.name()) {
                            graph.hold(Position::new(node, port), ap, false);
                        }
                    }
                    _ => {
                        let name = element.name();
                        if is_vlan(port) {
                            for phys in checker.topology.physical_ports(name, port, None) {
                                let expanded = phys != port;
                                graph.hold(Position::new(name, phys), ap, expanded);
                            }
                        } else {
                            graph.hold(Position::new(name, port), ap, false);
                        }
                    }
                }
            }
        }

        let mut positions: Vec<Position> = graph.holding.keys().cloned().collect();
        // ACL nodes of the other partition filter with their own predicates.
        if let Some(acl) = checker.acl {
            for element in acl.elements() {
                for node in acl_nodes(element.name()) {
                    for (port, _) in element.ports() {
                        if port != DENY_PORT {
                            positions.push(Position::new(node.as_str(), port));
                        }
                    }
                }
            }
        }

        for pos in positions {
            let Some(peers) = checker.topology.connected(&pos) else {
                continue;
            };
            let peers: BTreeSet<Position> = peers
                .iter()
                .filter(|peer| failed != Some((&pos, *peer)))
                .cloned()
                .collect();
            graph.edges.insert(pos, peers);
        }

        debug!(
            "forwarding graph: {} predicates, {} positions, {} edges",
            closure.len(),
            graph.holding.len(),
            graph.edges.values().map(BTreeSet::len).sum::<usize>()
        );
        Ok(graph)
    }

    fn hold(&mut self, pos: Position, ap: Ref, from_vlan: bool) {
        if !self.holding.contains_key(&pos) {
            self.by_node
                .entry(pos.device.clone())
                .or_default()
                .push(pos.clone());
        }
        if from_vlan {
            self.vlan_members.insert(pos.clone());
        }
        self.holding.entry(pos).or_default().insert(ap);
    }

    pub fn num_positions(&self) -> usize {
        self.holding.len()
    }

    pub fn num_edges(&self) -> usize {
        self.edges.values().map(BTreeSet::len).sum()
    }

    /// Predicates held at `pos`.
    pub fn holding(&self, pos: &Position) -> Option<&BTreeSet<Ref>> {
        self.holding.get(pos)
    }

    /// Follow `aps` from every position of `node`.
    ///
    /// In division mode the default port is not followed, as in the direct checker.
    pub fn check_from(&self, checker: &Checker<'_>, node: &str, aps: &BTreeSet<Ref>) -> CheckReport {
        let division = checker.acl.is_some();
        let starts = self
            .by_node
            .get(node)
            .into_iter()
            .flatten()
            .filter(|pos| !(division && pos.port == DEFAULT_PORT))
            .map(|pos| (pos.clone(), self.narrow(checker, pos, aps)))
            .collect();
        self.traverse(checker, starts)
    }

    /// Follow everything the graph holds, from every position.
    pub fn check_all(&self, checker: &Checker<'_>) -> CheckReport {
        let starts = self
            .holding
            .iter()
            .map(|(pos, held)| (pos.clone(), self.narrow(checker, pos, held)))
            .collect();
        self.traverse(checker, starts)
    }

    /// Predicates of `aps` that leave through `pos`, translated by its NAT node if any.
    fn narrow(&self, checker: &Checker<'_>, pos: &Position, aps: &BTreeSet<Ref>) -> BTreeSet<Ref> {
        let Some(held) = self.holding.get(pos) else {
            return BTreeSet::new();
        };
        let kept: BTreeSet<Ref> = aps.intersection(held).copied().collect();
        match self.nat_nodes.get(&pos.device) {
            Some(&id) => match checker.main.element(id).rewrite_table() {
                Some(table) => table.apply(&kept),
                None => kept,
            },
            None => kept,
        }
    }

    fn traverse(&self, checker: &Checker<'_>, starts: Vec<(Position, BTreeSet<Ref>)>) -> CheckReport {
        let mut report = CheckReport::default();
        let hs = checker.hs;
        let acl_start = checker.acl.map(|_| BTreeSet::from([hs.one()]));
        let mut stack: Vec<Step> = starts
            .into_iter()
            .map(|(pos, aps)| Step {
                pos,
                aps,
                acl: acl_start.clone(),
                history: Vec::new(),
            })
            .collect();

        while let Some(Step {
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
                if !overlaps(hs, &aps, acl) {
                    continue;
                }
            }
            if let Some(first) = history.iter().position(|p| *p == pos) {
                report.loops.add(&history[first..], &aps);
                continue;
            }
            history.push(pos.clone());

            let peers = match self.edges.get(&pos) {
                Some(peers) if !peers.is_empty() => peers,
                _ => {
                    if checker.check_blackholes && pos.port == DEFAULT_PORT && checker.topology.connected(&pos).is_none() {
                        report.blackholes.add(&pos, &aps);
                    }
                    continue;
                }
            };

            for next in peers {
                if let Some(placement) = checker.placement(&next.device).filter(|p| p.side == Side::Acl) {
                    let Some(acl) = &acl else { continue };
                    let element = checker.element(placement);
                    for (port, _) in element.ports() {
                        let filtered = element.forward_aps(hs, port, acl);
                        if port == DENY_PORT {
                            if overlaps(hs, &aps, &filtered) {
                                report.denied_overlaps += 1;
                            }
                            continue;
                        }
                        stack.push(Step {
                            pos: Position::new(next.device.as_str(), port),
                            aps: aps.clone(),
                            acl: Some(filtered),
                            history: history.clone(),
                        });
                    }
                    continue;
                }

                let Some(outs) = self.by_node.get(&next.device) else {
                    trace!("{} leads to {} outside the graph", pos, next);
                    continue;
                };
                for out in outs {
                    if out.port == next.port && self.vlan_members.contains(out) {
                        continue;
                    }
                    stack.push(Step {
                        pos: out.clone(),
                        aps: self.narrow(checker, out, &aps),
                        acl: acl.clone(),
                        history: history.clone(),
                    });
                }
            }
        }

        report
    }
}
