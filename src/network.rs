//! A verified network: partitions, topology and the accumulated findings.

use std::collections::{BTreeSet, HashMap};
use std::rc::Rc;
use std::time::Instant;

use log::{debug, info, warn};

use crate::checker::{BlackholeSet, CheckReport, Checker, LoopSet, Placement, Side};
use crate::config::{CheckerMode, VerifierConfig};
use crate::element::{Element, ElementKind};
use crate::error::{Error, Result};
use crate::graph::ForwardingGraph;
use crate::header::HeaderSpace;
use crate::loader::{NetworkSpec, Op, Update};
use crate::partition::Partition;
use crate::reference::Ref;
use crate::report::{LinkFailureReport, RunSummary, UpdateReport};
use crate::topology::{acl_element_of, acl_nodes, is_acl_node, Position, Topology};

#[derive(Debug)]
pub struct Network {
    name: String,
    config: VerifierConfig,
    hs: Rc<HeaderSpace>,
    main: Partition,
    /// ACL elements in division mode.
    acl: Option<Partition>,
    topology: Topology,
    placements: HashMap<String, Placement>,
    /// Device owning each ACL and NAT element.
    owners: HashMap<String, String>,
    loops: LoopSet,
    blackholes: BlackholeSet,
    updates: usize,
    hard_merged: bool,
    ap_count_after_inserts: Option<usize>,
}

impl Network {
    pub fn new(name: impl Into<String>, config: VerifierConfig, spec: &NetworkSpec) -> Result<Self> {
        let name = name.into();
        let hs = Rc::new(HeaderSpace::new(config.bdd));
        let main = Partition::new("main", hs.clone(), config.merge_aps, config.merge_thresholds);
        let acl = config
            .division
            .then(|| Partition::new("acl", hs.clone(), config.merge_aps, config.merge_thresholds));

        let mut network = Self {
            name,
            config,
            hs,
            main,
            acl,
            topology: Topology::new(),
            placements: HashMap::new(),
            owners: HashMap::new(),
            loops: LoopSet::default(),
            blackholes: BlackholeSet::default(),
            updates: 0,
            hard_merged: false,
            ap_count_after_inserts: None,
        };

        for (from, to) in &spec.links {
            network.topology.add_link(from.clone(), to.clone());
        }
        for (device, vlan, ports) in &spec.vlans {
            network.topology.add_vlan(device, vlan, ports.iter().cloned());
        }

        let mut acls: BTreeSet<(String, Option<String>)> = spec
            .acls
            .iter()
            .map(|(device, acl)| (format!("{}_{}", device, acl), Some(device.clone())))
            .collect();
        let declared: BTreeSet<String> = acls.iter().map(|(name, _)| name.clone()).collect();

        let mut devices: BTreeSet<String> = spec.devices.iter().cloned().collect();
        for node in network.topology.nodes() {
            match acl_element_of(node) {
                Some(acl) => {
                    if !declared.contains(acl) {
                        let [inbound, _] = acl_nodes(acl);
                        let feeder = network
                            .topology
                            .links()
                            .find(|(from, to)| to.device == inbound && !is_acl_node(&from.device))
                            .map(|(from, _)| from.device.clone());
                        acls.insert((acl.to_string(), feeder));
                    }
                }
                None => {
                    devices.insert(node.to_string());
                }
            }
        }

        for device in &devices {
            let id = network.main.add_element(Element::forward(device.as_str(), &network.hs));
            network.placements.insert(device.clone(), Placement { side: Side::Main, id });
        }

        for (acl, owner) in acls {
            let element = Element::acl(acl.as_str(), &network.hs);
            let placement = match &mut network.acl {
                Some(partition) => Placement {
                    side: Side::Acl,
                    id: partition.add_element(element),
                },
                None => Placement {
                    side: Side::Main,
                    id: network.main.add_element(element),
                },
            };
            for node in acl_nodes(&acl) {
                network.placements.insert(node, placement);
            }
            if let Some(owner) = owner {
                network.owners.insert(acl, owner);
            }
        }

        for (device, port) in &spec.nats {
            let nat = format!("{}_{}", device, port);
            let id = network.main.add_element(Element::nat(nat.as_str(), &network.hs));
            network.placements.insert(nat.clone(), Placement { side: Side::Main, id });
            network.topology.attach_nat(device, port, &nat);
            network.owners.insert(nat, device.clone());
        }

        info!(
            "{}: {} elements, {} links{}",
            network.name,
            network.placements.len(),
            network.topology.num_links(),
            if network.acl.is_some() { ", division mode" } else { "" }
        );
        Ok(network)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &VerifierConfig {
        &self.config
    }

    pub fn header_space(&self) -> &HeaderSpace {
        &self.hs
    }

    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    /// The forwarding partition, which also holds ACLs outside division mode.
    pub fn partition(&self) -> &Partition {
        &self.main
    }

    pub fn acl_partition(&self) -> Option<&Partition> {
        self.acl.as_ref()
    }

    fn partition_of(&self, side: Side) -> &Partition {
        match (side, &self.acl) {
            (Side::Acl, Some(acl)) => acl,
            _ => &self.main,
        }
    }

    fn partition_of_mut(&mut self, side: Side) -> &mut Partition {
        match (side, &mut self.acl) {
            (Side::Acl, Some(acl)) => acl,
            _ => &mut self.main,
        }
    }

    /// Live predicates over all partitions.
    pub fn ap_count(&self) -> usize {
        self.main.ap_count() + self.acl.as_ref().map_or(0, Partition::ap_count)
    }

    /// Loops found over the whole run.
    pub fn loops(&self) -> &LoopSet {
        &self.loops
    }

    pub fn blackholes(&self) -> &BlackholeSet {
        &self.blackholes
    }

    /// Predicate count recorded by the hard merge, if one ran.
    pub fn ap_count_after_inserts(&self) -> Option<usize> {
        self.ap_count_after_inserts
    }

    fn checker(&self) -> Checker<'_> {
        Checker {
            hs: &self.hs,
            topology: &self.topology,
            main: &self.main,
            acl: self.acl.as_ref(),
            placements: &self.placements,
            check_blackholes: self.config.check_blackholes,
        }
    }

    fn locate(&self, kind: ElementKind, name: &str) -> Result<(Side, usize)> {
        let side = match (kind, &self.acl) {
            (ElementKind::Acl, Some(_)) => Side::Acl,
            _ => Side::Main,
        };
        let partition = self.partition_of(side);
        partition
            .element_id(name)
            .filter(|&id| partition.element(id).kind() == kind)
            .map(|id| (side, id))
            .ok_or_else(|| Error::ElementNotFound(name.to_string()))
    }

    /// Node the check of an update to `element` starts from.
    ///
    /// An ACL no device feeds has no forwarding start in division mode.
    fn start_node(&self, kind: ElementKind, element: &str) -> Option<String> {
        match (kind, self.owners.get(element)) {
            (ElementKind::Forward, _) => Some(element.to_string()),
            (_, Some(owner)) => Some(owner.clone()),
            (_, None) if self.acl.is_none() => {
                let [inbound, _] = acl_nodes(element);
                Some(inbound)
            }
            (_, None) => None,
        }
    }

    /// Apply one rule update and check the traffic it moved.
    ///
    /// `target` is the device for forwarding and NAT updates and the ACL element
    /// otherwise. NAT rule text starts with the translated port.
    pub fn apply_update(&mut self, op: Op, kind: ElementKind, target: &str, rule: &str) -> Result<UpdateReport> {
        let classify_start = Instant::now();
        let (element, rule) = match kind {
            ElementKind::Nat => {
                let (port, rest) = rule
                    .trim()
                    .split_once(char::is_whitespace)
                    .ok_or_else(|| Error::parse("NAT update", rule))?;
                (format!("{}_{}", target, port), rest)
            }
            _ => (target.to_string(), rule),
        };
        let (side, id) = self.locate(kind, &element)?;
        if op == Op::Remove && !self.hard_merged {
            self.hard_merge()?;
        }
        let partition = self.partition_of_mut(side);
        let moved = match op {
            Op::Insert => partition.insert_rule(id, rule)?,
            Op::Remove => partition.remove_rule(id, rule)?,
        };
        let classify_time = classify_start.elapsed();
        self.updates += 1;

        let check_start = Instant::now();
        let start = self.start_node(kind, &element);
        let report = match start {
            _ if moved.is_empty() || !(self.config.check_loops || self.config.check_blackholes) => {
                CheckReport::default()
            }
            None => {
                warn!("{}: no device feeds {}, not checking", self.name, element);
                CheckReport::default()
            }
            Some(node) => {
                let mut report = self.run_check(&node, &moved, side == Side::Acl)?;
                if !self.config.check_loops {
                    report.loops.clear();
                }
                report
            }
        };
        let check_time = check_start.elapsed();

        let loops = report.loops.len();
        let blackholes = report.blackholes.len();
        if loops > 0 {
            debug!("{} {} {}: {} loops", op, kind, target, loops);
        }
        // Findings root their predicates before a merge can retire them.
        self.loops.extend(report.loops);
        for (pos, aps) in report.blackholes.iter() {
            self.blackholes.add(pos, aps);
        }

        self.soft_merge()?;
        if self.config.gc_interval > 0 && self.updates % self.config.gc_interval == 0 {
            self.collect_garbage();
        }

        Ok(UpdateReport {
            moved_aps: moved.len(),
            loops,
            blackholes,
            ap_count: self.ap_count(),
            classify_time,
            check_time,
        })
    }

    pub fn apply_line(&mut self, line: &str) -> Result<UpdateReport> {
        let update: Update = line.parse()?;
        self.apply_update(update.op, update.kind, &update.target, &update.rule)
    }

    /// Apply an update stream. Updates referring to unknown elements or failing to
    /// parse are logged and skipped; any other error aborts the run.
    pub fn run<I, S>(&mut self, lines: I) -> Result<RunSummary>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut summary = RunSummary::default();
        for line in lines {
            let line = line.as_ref();
            match self.apply_line(line) {
                Ok(report) => {
                    if line.trim_start().starts_with('-') {
                        summary.removes += 1;
                    } else {
                        summary.inserts += 1;
                    }
                    summary.record(&report);
                }
                Err(e) if e.is_reference_error() => {
                    warn!("skipping {:?}: {}", line, e);
                    summary.skipped += 1;
                }
                Err(e) => return Err(e),
            }
        }
        summary.ap_count = self.ap_count();
        summary.ap_count_after_inserts = self.ap_count_after_inserts;
        summary.loops = self.loops.len();
        summary.blackholes = self.blackholes.len();
        Ok(summary)
    }

    /// Check `moved` starting from `node`, with the configured checker.
    pub fn check(&self, node: &str, moved: &BTreeSet<Ref>) -> Result<CheckReport> {
        self.run_check(node, moved, false)
    }

    fn run_check(&self, node: &str, moved: &BTreeSet<Ref>, acl_update: bool) -> Result<CheckReport> {
        let checker = self.checker();
        match self.config.checker {
            // The graph only carries forwarding predicates.
            CheckerMode::Graph if !acl_update => {
                let aps = self.expand(moved);
                let graph = ForwardingGraph::build(&checker, &aps, None)?;
                Ok(graph.check_from(&checker, node, &aps))
            }
            _ => checker.check(node, moved, acl_update),
        }
    }

    /// Replace the universal placeholder by the live predicates.
    fn expand(&self, aps: &BTreeSet<Ref>) -> BTreeSet<Ref> {
        let one = self.hs.one();
        if aps.contains(&one) && !self.main.is_live(one) {
            self.main.aps().clone()
        } else {
            aps.clone()
        }
    }

    /// Forwarding predicates leaving through `pos`, VLAN membership included.
    fn aps_at(&self, pos: &Position) -> BTreeSet<Ref> {
        let Some(placement) = self.placements.get(&pos.device) else {
            return BTreeSet::new();
        };
        if placement.side == Side::Acl {
            return BTreeSet::new();
        }
        let element = self.main.element(placement.id);
        element
            .ports()
            .filter(|(port, _)| {
                *port == pos.port
                    || self
                        .topology
                        .physical_ports(&pos.device, port, None)
                        .iter()
                        .any(|p| *p == pos.port)
            })
            .flat_map(|(_, aps)| aps.iter().copied())
            .collect()
    }

    /// Check for loops after the failure of each directed link in turn.
    pub fn check_all_link_failures(&self) -> Result<Vec<LinkFailureReport>> {
        let checker = self.checker();
        let mut reports = Vec::with_capacity(self.topology.num_links());
        for (from, to) in self.topology.links() {
            let aps = self.aps_at(from);

            let start = Instant::now();
            let graph = ForwardingGraph::build(&checker, &aps, Some((from, to)))?;
            let construction_time = start.elapsed();

            let start = Instant::now();
            let report = graph.check_all(&checker);
            let detection_time = start.elapsed();

            debug!("link {} -> {} down: {} loops", from, to, report.loops.len());
            reports.push(LinkFailureReport {
                from: from.clone(),
                to: to.clone(),
                affected_aps: aps.len(),
                construction_time,
                detection_time,
                loops: report.loops.len(),
            });
        }
        Ok(reports)
    }

    /// Loops found so far, one line each: the cycle and the destinations caught in it.
    pub fn dump_loops(&self) -> Vec<String> {
        self.loops
            .iter()
            .map(|record| {
                let path: Vec<String> = record.path.iter().map(Position::to_string).collect();
                let caught = self.hs.or_all(record.aps.iter().copied());
                format!("{}: {}", path.join(" -> "), self.hs.dst_prefixes(caught).join(", "))
            })
            .collect()
    }

    /// Merge every group of predicates sharing a location and record the count before.
    pub fn hard_merge(&mut self) -> Result<usize> {
        self.hard_merged = true;
        let before = self.ap_count();
        self.ap_count_after_inserts = Some(before);
        let mut eliminated = self.main.try_merge_ap_batch()?;
        if let Some(acl) = &mut self.acl {
            eliminated += acl.try_merge_ap_batch()?;
        }
        info!(
            "{}: hard merge {} -> {} predicates",
            self.name,
            before,
            self.ap_count()
        );
        Ok(eliminated)
    }

    fn soft_merge(&mut self) -> Result<()> {
        if self.main.is_mergeable() {
            self.main.try_merge_ap_batch()?;
        }
        if let Some(acl) = &mut self.acl {
            acl.try_merge_ap_batch()?;
        }
        Ok(())
    }

    /// Reclaim BDD nodes no longer referenced by any partition or finding.
    pub fn collect_garbage(&self) {
        let before = self.hs.num_nodes();
        let mut roots = self.main.refs();
        if let Some(acl) = &self.acl {
            roots.extend(acl.refs());
        }
        for record in self.loops.iter() {
            roots.extend(record.aps);
        }
        for (_, aps) in self.blackholes.iter() {
            roots.extend(aps.iter().copied());
        }
        self.hs.collect_garbage(roots);
        debug!("{}: gc {} -> {} nodes", self.name, before, self.hs.num_nodes());
    }
}
