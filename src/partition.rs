//! Atomic predicate partition.
//!
//! The live atomic predicates are pairwise disjoint and cover the whole header
//! space. For every predicate the partition records which port it occupies on
//! each element (its location vector). Predicates with identical location
//! vectors are indistinguishable to the checker and may be merged.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::rc::Rc;

use log::{debug, info};

use crate::config::MergeThresholds;
use crate::element::Element;
use crate::error::{Error, Result};
use crate::header::HeaderSpace;
use crate::reference::Ref;
use crate::rule::{ChangeItem, Rule};

/// Port occupied on each element, indexed by element id.
pub type Location = Rc<Vec<String>>;

#[derive(Debug, Default)]
struct MergeIndex {
    groups: HashMap<Location, BTreeSet<Ref>>,
    /// Locations shared by at least two predicates.
    pending: HashSet<Location>,
    /// Number of predicates that a full merge would eliminate.
    mergeable: usize,
}

impl MergeIndex {
    fn leave(&mut self, loc: &Location, ap: Ref) -> bool {
        let Some(group) = self.groups.get_mut(loc) else {
            return false;
        };
        if !group.remove(&ap) {
            return false;
        }
        if group.is_empty() {
            self.groups.remove(loc);
        } else {
            self.mergeable -= 1;
        }
        if self.groups.get(loc).map_or(true, |g| g.len() < 2) {
            self.pending.remove(loc);
        }
        true
    }

    /// Add `ap` to the group of `loc`, returning the shared key.
    fn join(&mut self, loc: Vec<String>, ap: Ref) -> Location {
        let key = match self.groups.get_key_value(&loc) {
            Some((key, _)) => key.clone(),
            None => Rc::new(loc),
        };
        let group = self.groups.entry(key.clone()).or_default();
        if !group.is_empty() {
            self.mergeable += 1;
        }
        group.insert(ap);
        if group.len() >= 2 {
            self.pending.insert(key.clone());
        }
        key
    }
}

#[derive(Debug)]
pub struct Partition {
    label: String,
    hs: Rc<HeaderSpace>,
    elements: Vec<Element>,
    index: HashMap<String, usize>,
    aps: BTreeSet<Ref>,
    locations: HashMap<Ref, Location>,
    merge: Option<MergeIndex>,
    thresholds: MergeThresholds,
}

impl Partition {
    /// Partition holding only the universal predicate.
    pub fn new(label: impl Into<String>, hs: Rc<HeaderSpace>, merge_aps: bool, thresholds: MergeThresholds) -> Self {
        let universe = hs.one();
        let loc: Location = Rc::new(Vec::new());
        let merge = merge_aps.then(|| {
            let mut index = MergeIndex::default();
            index.groups.insert(loc.clone(), BTreeSet::from([universe]));
            index
        });
        Self {
            label: label.into(),
            hs,
            elements: Vec::new(),
            index: HashMap::new(),
            aps: BTreeSet::from([universe]),
            locations: HashMap::from([(universe, loc)]),
            merge,
            thresholds,
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn header_space(&self) -> &HeaderSpace {
        &self.hs
    }

    /// Register an element; every live predicate starts on its default port.
    pub fn add_element(&mut self, mut element: Element) -> usize {
        let id = self.elements.len();
        let port = element.default_port();
        for &ap in &self.aps {
            element.adopt(ap);
        }
        self.index.insert(element.name().to_string(), id);
        self.elements.push(element);

        let old = std::mem::take(&mut self.locations);
        if let Some(merge) = &mut self.merge {
            *merge = MergeIndex::default();
        }
        for (ap, loc) in old {
            let mut loc = Rc::unwrap_or_clone(loc);
            loc.push(port.to_string());
            let loc = match &mut self.merge {
                Some(merge) => merge.join(loc, ap),
                None => Rc::new(loc),
            };
            self.locations.insert(ap, loc);
        }
        id
    }

    pub fn element_id(&self, name: &str) -> Option<usize> {
        self.index.get(name).copied()
    }

    pub fn element(&self, id: usize) -> &Element {
        &self.elements[id]
    }

    pub fn element_by_name(&self, name: &str) -> Option<&Element> {
        self.element_id(name).map(|id| &self.elements[id])
    }

    pub fn elements(&self) -> impl Iterator<Item = &Element> {
        self.elements.iter()
    }

    pub fn aps(&self) -> &BTreeSet<Ref> {
        &self.aps
    }

    pub fn ap_count(&self) -> usize {
        self.aps.len()
    }

    pub fn is_live(&self, ap: Ref) -> bool {
        self.aps.contains(&ap)
    }

    pub fn location(&self, ap: Ref) -> Option<&[String]> {
        self.locations.get(&ap).map(|loc| loc.as_slice())
    }

    /// Number of predicates a full merge pass would eliminate.
    pub fn mergeable_count(&self) -> usize {
        self.merge.as_ref().map_or(0, |m| m.mergeable)
    }

    /// Encode `text` as a rule of element `id` and insert it, returning the moved predicates.
    pub fn insert_rule(&mut self, id: usize, text: &str) -> Result<BTreeSet<Ref>> {
        let rule = self.elements[id].encode_rule(&self.hs, text)?;
        let changes = self.elements[id].insert(&self.hs, rule)?;
        self.apply_change_set(id, &changes)
    }

    pub fn remove_rule(&mut self, id: usize, text: &str) -> Result<BTreeSet<Ref>> {
        let rule = self.elements[id].encode_rule(&self.hs, text)?;
        self.remove_encoded(id, &rule)
    }

    pub fn remove_encoded(&mut self, id: usize, rule: &Rule) -> Result<BTreeSet<Ref>> {
        let changes = self.elements[id].remove(&self.hs, rule)?;
        self.apply_change_set(id, &changes)
    }

    /// Move the traffic of every change item and return the predicates that moved.
    pub fn apply_change_set(&mut self, id: usize, changes: &[ChangeItem]) -> Result<BTreeSet<Ref>> {
        let hs = self.hs.clone();
        let is_nat = self.elements[id].rewrite_table().is_some();
        let mut moved = BTreeSet::new();

        for item in changes {
            let from_aps = self.elements[id].port_aps(&item.from).ok_or_else(|| Error::PortNotFound {
                element: self.elements[id].name().to_string(),
                port: item.from.clone(),
            })?;

            if from_aps.contains(&item.delta) {
                self.transfer_ap(id, &item.from, &item.to, item.delta)?;
                moved.insert(item.delta);
                if is_nat {
                    moved.insert(self.merge_at(item.delta)?);
                }
                continue;
            }

            let candidates: Vec<Ref> = from_aps.iter().copied().collect();
            let mut delta = item.delta;
            for ap in candidates {
                let inter = hs.and(delta, ap);
                if hs.is_false(inter) {
                    continue;
                }
                if inter != ap {
                    let rest = hs.diff(ap, inter);
                    self.split_ap(ap, rest, inter)?;
                }
                self.transfer_ap(id, &item.from, &item.to, inter)?;
                moved.insert(inter);
                if is_nat {
                    moved.insert(self.merge_at(inter)?);
                }
                delta = hs.diff(delta, inter);
                if hs.is_false(delta) {
                    break;
                }
            }

            if !hs.is_false(delta) {
                return Err(Error::NonFalseResidual {
                    element: self.elements[id].name().to_string(),
                    residual: delta,
                });
            }
        }

        self.refresh_rewrites()?;

        // Later splits and merges may have retired some of the recorded predicates.
        let moved = moved
            .into_iter()
            .flat_map(|ap| {
                if self.is_live(ap) {
                    BTreeSet::from([ap])
                } else {
                    self.ap_exp(ap)
                }
            })
            .collect();
        Ok(moved)
    }

    /// Replace live `origin` by the disjoint `a` and `b` with `a ∨ b = origin`.
    pub fn split_ap(&mut self, origin: Ref, a: Ref, b: Ref) -> Result<()> {
        if !self.aps.remove(&origin) {
            return Err(Error::ApNotFound(origin));
        }
        let loc = self.locations.remove(&origin).ok_or(Error::ApNotFound(origin))?;
        debug!("{}: split {} into {} and {}", self.label, origin, a, b);

        self.aps.insert(a);
        self.aps.insert(b);
        self.hs.incref(a);
        self.hs.incref(b);
        self.hs.decref(origin);

        for (id, port) in loc.iter().enumerate() {
            self.elements[id].on_split(&self.hs, port, origin, [a, b])?;
        }

        match &mut self.merge {
            Some(merge) => {
                merge.leave(&loc, origin);
                let key = merge.join((*loc).clone(), a);
                let key = merge.join((*key).clone(), b);
                self.locations.insert(a, key.clone());
                self.locations.insert(b, key);
            }
            None => {
                self.locations.insert(a, Rc::new((*loc).clone()));
                self.locations.insert(b, loc);
            }
        }
        Ok(())
    }

    /// Move `ap` on element `id` from port `from` to port `to`.
    pub fn transfer_ap(&mut self, id: usize, from: &str, to: &str, ap: Ref) -> Result<()> {
        let loc = self.locations.get_mut(&ap).ok_or(Error::ApNotFound(ap))?;
        if loc[id] != from {
            return Err(Error::ApSetNotFound {
                element: self.elements[id].name().to_string(),
                port: from.to_string(),
            });
        }
        self.elements[id].on_transfer(&self.hs, from, to, ap)?;

        match &mut self.merge {
            Some(merge) => {
                let old = loc.clone();
                merge.leave(&old, ap);
                let mut new = (*old).clone();
                new[id] = to.to_string();
                *loc = merge.join(new, ap);
            }
            None => {
                Rc::make_mut(loc)[id] = to.to_string();
            }
        }
        Ok(())
    }

    /// Whether every NAT element keeps `aps` distinguishable only as a whole.
    fn rewrite_compatible(&self, aps: &[Ref]) -> bool {
        self.elements
            .iter()
            .filter_map(Element::rewrite_table)
            .all(|table| table.is_mergeable(aps))
    }

    /// Merge `ap` with every predicate sharing its location, if allowed.
    ///
    /// Returns the merged predicate. Rewrite outputs are made atomic again
    /// afterwards, which may split it.
    pub fn try_merge_ap(&mut self, ap: Ref) -> Result<Ref> {
        let merged = self.merge_at(ap)?;
        if merged != ap {
            self.refresh_rewrites()?;
        }
        Ok(merged)
    }

    fn merge_at(&mut self, ap: Ref) -> Result<Ref> {
        let Some(merge) = &self.merge else {
            return Ok(ap);
        };
        let loc = self.locations.get(&ap).ok_or(Error::ApNotFound(ap))?.clone();
        let parts: Vec<Ref> = match merge.groups.get(&loc) {
            Some(group) if group.len() >= 2 => group.iter().copied().collect(),
            _ => return Ok(ap),
        };
        if !self.rewrite_compatible(&parts) {
            return Ok(ap);
        }
        self.merge_group(&loc, &parts)
    }

    /// Merge every pending group of predicates sharing a location.
    /// Returns the number of predicates eliminated.
    pub fn try_merge_ap_batch(&mut self) -> Result<usize> {
        let Some(merge) = &mut self.merge else {
            return Ok(0);
        };
        let mut pending: Vec<Location> = merge.pending.drain().collect();
        pending.sort();

        let mut eliminated = 0;
        for loc in pending {
            let parts: Vec<Ref> = match self.merge.as_ref().and_then(|m| m.groups.get(&loc)) {
                Some(group) => group.iter().copied().collect(),
                None => continue,
            };
            if parts.len() < 2 {
                return Err(Error::MergeSingleton(parts));
            }
            if !self.rewrite_compatible(&parts) {
                debug!("{}: {} predicates not rewrite-compatible", self.label, parts.len());
                continue;
            }
            self.merge_group(&loc, &parts)?;
            eliminated += parts.len() - 1;
        }
        if eliminated > 0 {
            self.refresh_rewrites()?;
            info!("{}: merged away {} predicates, {} left", self.label, eliminated, self.aps.len());
        }
        Ok(eliminated)
    }

    fn merge_group(&mut self, loc: &Location, parts: &[Ref]) -> Result<Ref> {
        let merged = self.hs.or_all(parts.iter().copied());
        for part in parts {
            if !self.aps.remove(part) {
                return Err(Error::ApNotFound(*part));
            }
            self.locations.remove(part);
            self.hs.decref(*part);
        }
        self.aps.insert(merged);
        self.hs.incref(merged);
        self.locations.insert(merged, loc.clone());

        for (id, port) in loc.iter().enumerate() {
            self.elements[id].on_merge(&self.hs, port, parts, merged)?;
        }

        if let Some(merge) = &mut self.merge {
            merge.groups.insert(loc.clone(), BTreeSet::from([merged]));
            merge.pending.remove(loc);
            merge.mergeable -= parts.len() - 1;
        }
        debug!("{}: merged {:?} into {}", self.label, parts, merged);
        Ok(merged)
    }

    /// Whether enough merge candidates accumulated for a soft merge pass.
    pub fn is_mergeable(&self) -> bool {
        let Some(merge) = &self.merge else {
            return false;
        };
        if self.aps.len() < self.thresholds.total_aps {
            merge.mergeable >= self.thresholds.low_mergeable
        } else {
            merge.mergeable >= self.thresholds.high_mergeable
        }
    }

    /// Refine the partition so that `pred` is a union of live predicates.
    pub fn add_predicate(&mut self, pred: Ref) -> Result<()> {
        let candidates: Vec<Ref> = self.aps.iter().copied().collect();
        for ap in candidates {
            let inter = self.hs.and(ap, pred);
            if self.hs.is_false(inter) || inter == ap {
                continue;
            }
            let rest = self.hs.diff(ap, inter);
            self.split_ap(ap, inter, rest)?;
        }
        Ok(())
    }

    /// Live predicates intersecting `pred`.
    pub fn ap_exp(&self, pred: Ref) -> BTreeSet<Ref> {
        self.aps
            .iter()
            .copied()
            .filter(|&ap| self.hs.intersects(ap, pred))
            .collect()
    }

    /// Make every NAT rewrite output a live predicate, splitting as needed.
    pub fn refresh_rewrites(&mut self) -> Result<()> {
        loop {
            let aps = &self.aps;
            let unresolved = self
                .elements
                .iter()
                .filter_map(Element::rewrite_table)
                .find_map(|table| table.unresolved(|r| aps.contains(&r)));
            let Some(pred) = unresolved else {
                return Ok(());
            };
            debug!("{}: rewrite output {} is not atomic yet", self.label, pred);
            self.add_predicate(pred)?;
            let covering = self.ap_exp(pred);
            for element in &mut self.elements {
                if let Some(table) = element.rewrite_table_mut() {
                    table.resolve(pred, &covering);
                }
            }
        }
    }

    /// `(element id, port)` pairs holding `ap`, skipping default ports unless asked.
    pub fn hold_positions(&self, ap: Ref, include_default: bool) -> Result<Vec<(usize, &str)>> {
        let loc = self.locations.get(&ap).ok_or(Error::ApNotFound(ap))?;
        let held: Vec<(usize, &str)> = loc
            .iter()
            .enumerate()
            .filter(|&(id, port)| include_default || port != self.elements[id].default_port())
            .map(|(id, port)| (id, port.as_str()))
            .collect();
        if held.is_empty() && !include_default {
            return Err(Error::NoHoldingPorts(ap));
        }
        Ok(held)
    }

    /// Every BDD handle this partition keeps alive.
    pub fn refs(&self) -> Vec<Ref> {
        let mut refs: Vec<Ref> = self.aps.iter().copied().collect();
        for element in &self.elements {
            refs.extend(element.refs());
        }
        refs
    }

    /// Verify the partition invariants, describing the first violation found.
    pub fn check_invariants(&self) -> std::result::Result<(), String> {
        let hs = &self.hs;
        let aps: Vec<Ref> = self.aps.iter().copied().collect();
        for (i, &a) in aps.iter().enumerate() {
            for &b in &aps[i + 1..] {
                if hs.intersects(a, b) {
                    return Err(format!("{} and {} overlap", a, b));
                }
            }
        }
        if !hs.is_true(hs.or_all(aps.iter().copied())) {
            return Err("live predicates do not cover the header space".to_string());
        }

        for (id, element) in self.elements.iter().enumerate() {
            let mut seen = BTreeSet::new();
            for (port, port_aps) in element.ports() {
                for &ap in port_aps {
                    if !seen.insert(ap) {
                        return Err(format!("{} is on two ports of {}", ap, element.name()));
                    }
                    match self.locations.get(&ap) {
                        Some(loc) if loc[id] == port => {}
                        _ => return Err(format!("{} on {}:{} disagrees with its location", ap, element.name(), port)),
                    }
                }
            }
            if seen != self.aps {
                return Err(format!("ports of {} do not cover the live predicates", element.name()));
            }
            if let Some(table) = element.rewrite_table() {
                if let Some(out) = table.all_outputs().into_iter().find(|out| !self.aps.contains(out)) {
                    return Err(format!("rewrite output {} of {} is not live", out, element.name()));
                }
            }
        }

        if let Some(merge) = &self.merge {
            for (ap, loc) in &self.locations {
                if !merge.groups.get(loc).is_some_and(|g| g.contains(ap)) {
                    return Err(format!("{} missing from the merge index", ap));
                }
            }
            let extra: usize = merge.groups.values().map(|g| g.len() - 1).sum();
            if extra != merge.mergeable {
                return Err(format!("mergeable count {} != {}", merge.mergeable, extra));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use num_bigint::BigUint;
    use test_log::test;

    use super::*;
    use crate::header::parse_ip;
    use crate::rule::DEFAULT_PORT;

    fn setup(merge: bool) -> (Rc<HeaderSpace>, Partition) {
        let hs = Rc::new(HeaderSpace::default());
        let mut p = Partition::new("test", hs.clone(), merge, MergeThresholds::default());
        p.add_element(Element::forward("a", &hs));
        p.add_element(Element::forward("b", &hs));
        (hs, p)
    }

    fn ip(s: &str) -> u32 {
        parse_ip(s).unwrap()
    }

    #[test]
    fn test_new_partition() {
        let (hs, p) = setup(true);
        assert_eq!(p.ap_count(), 1);
        assert_eq!(p.location(hs.one()), Some(&[DEFAULT_PORT.to_string(), DEFAULT_PORT.to_string()][..]));
        assert_eq!(p.element_id("b"), Some(1));
        assert_eq!(p.element_id("c"), None);
        p.check_invariants().unwrap();
    }

    #[test]
    fn test_insert_splits_universe() {
        let (hs, mut p) = setup(true);
        let moved = p.insert_rule(0, "10.0.0.0 8 eth0 8").unwrap();
        let p8 = hs.dst_prefix(ip("10.0.0.0"), 8);
        assert_eq!(moved, BTreeSet::from([p8]));
        assert_eq!(p.ap_count(), 2);
        assert!(p.is_live(hs.not(p8)));
        assert_eq!(p.location(p8).unwrap()[0], "eth0");
        p.check_invariants().unwrap();

        let moved = p.insert_rule(0, "10.1.0.0 16 eth1 16").unwrap();
        let p16 = hs.dst_prefix(ip("10.1.0.0"), 16);
        assert_eq!(moved, BTreeSet::from([p16]));
        assert_eq!(p.ap_count(), 3);
        p.check_invariants().unwrap();

        let total: BigUint = p.aps().iter().map(|&ap| hs.measure(ap)).sum();
        assert_eq!(total, hs.measure(hs.one()));
    }

    #[test]
    fn test_remove_allows_merge() {
        let (hs, mut p) = setup(true);
        p.insert_rule(0, "10.0.0.0 8 eth0 8").unwrap();
        let moved = p.remove_rule(0, "10.0.0.0 8 eth0 8").unwrap();
        assert_eq!(moved.len(), 1);
        assert_eq!(p.ap_count(), 2);
        assert_eq!(p.mergeable_count(), 1);
        p.check_invariants().unwrap();

        assert_eq!(p.try_merge_ap_batch().unwrap(), 1);
        assert_eq!(p.aps(), &BTreeSet::from([hs.one()]));
        assert_eq!(p.mergeable_count(), 0);
        p.check_invariants().unwrap();
    }

    #[test]
    fn test_split_then_merge_restores() {
        let (hs, mut p) = setup(true);
        let a = hs.dst_prefix(ip("10.0.0.0"), 8);
        let b = hs.not(a);
        p.split_ap(hs.one(), a, b).unwrap();
        assert_eq!(p.ap_count(), 2);
        p.check_invariants().unwrap();

        assert_eq!(p.try_merge_ap(a).unwrap(), hs.one());
        assert_eq!(p.ap_count(), 1);
        p.check_invariants().unwrap();

        assert!(matches!(p.split_ap(a, a, b), Err(Error::ApNotFound(_))));
    }

    #[test]
    fn test_without_merge_tracking() {
        let (hs, mut p) = setup(false);
        p.insert_rule(0, "10.0.0.0 8 eth0 8").unwrap();
        p.insert_rule(1, "10.0.0.0 8 eth0 8").unwrap();
        p.remove_rule(0, "10.0.0.0 8 eth0 8").unwrap();
        assert_eq!(p.mergeable_count(), 0);
        assert!(!p.is_mergeable());
        assert_eq!(p.try_merge_ap(hs.one()).unwrap(), hs.one());
        assert_eq!(p.ap_count(), 2);
        p.check_invariants().unwrap();
    }

    #[test]
    fn test_add_predicate_and_exp() {
        let (hs, mut p) = setup(true);
        p.insert_rule(0, "10.0.0.0 8 eth0 8").unwrap();
        let p16 = hs.dst_prefix(ip("10.1.0.0"), 16);
        assert_eq!(p.ap_exp(p16).len(), 1);
        p.add_predicate(p16).unwrap();
        assert_eq!(p.ap_count(), 3);
        assert_eq!(p.ap_exp(p16), BTreeSet::from([p16]));
        p.check_invariants().unwrap();
    }

    #[test]
    fn test_hold_positions() {
        let (hs, mut p) = setup(true);
        assert!(matches!(p.hold_positions(hs.one(), false), Err(Error::NoHoldingPorts(_))));
        assert_eq!(p.hold_positions(hs.one(), true).unwrap().len(), 2);

        p.insert_rule(1, "10.0.0.0 8 eth3 8").unwrap();
        let p8 = hs.dst_prefix(ip("10.0.0.0"), 8);
        assert_eq!(p.hold_positions(p8, false).unwrap(), vec![(1, "eth3")]);
    }

    #[test]
    fn test_nat_rewrite_refines_partition() {
        let hs = Rc::new(HeaderSpace::default());
        let mut p = Partition::new("test", hs.clone(), true, MergeThresholds::default());
        let nat = p.add_element(Element::nat("a_eth1", &hs));
        p.insert_rule(nat, "10.0.0.0 8 192.168.0.0 16").unwrap();

        let old = hs.dst_prefix(ip("10.0.0.0"), 8);
        let new = hs.dst_prefix(ip("192.168.0.0"), 16);
        assert!(p.is_live(old));
        assert!(p.is_live(new));
        let table = p.element(nat).rewrite_table().unwrap();
        assert_eq!(table.outputs(old), Some(&BTreeSet::from([new])));
        p.check_invariants().unwrap();

        // Rewrite inputs and outputs are never merged together.
        assert!(!table.is_mergeable(&[old, new]));
    }

    #[test]
    fn test_merge_keeps_rewrite_outputs_live() {
        let hs = Rc::new(HeaderSpace::default());
        let thresholds = MergeThresholds {
            total_aps: 500,
            low_mergeable: 1,
            high_mergeable: 1,
        };
        let mut p = Partition::new("test", hs.clone(), true, thresholds);
        let fwd = p.add_element(Element::forward("a", &hs));
        let nat = p.add_element(Element::nat("a_eth1", &hs));
        let acl = p.add_element(Element::acl("a_acl1", &hs));

        p.insert_rule(nat, "10.0.0.0 8 192.168.0.0 16").unwrap();
        p.insert_rule(fwd, "10.0.0.0 8 eth1 8").unwrap();
        let acl_rule = "10 permit tcp any any 10.0.0.0/8 any";
        p.insert_rule(acl, acl_rule).unwrap();
        p.check_invariants().unwrap();
        p.remove_rule(acl, acl_rule).unwrap();
        p.check_invariants().unwrap();

        assert!(p.is_mergeable());
        assert!(p.try_merge_ap_batch().unwrap() > 0);
        p.check_invariants().unwrap();
        let table = p.element(nat).rewrite_table().unwrap();
        for out in table.all_outputs() {
            assert!(p.is_live(out), "{} is not live", out);
            p.hold_positions(out, true).unwrap();
        }
    }

    #[test]
    fn test_change_items_conserve_traffic() {
        let hs = HeaderSpace::default();
        let mut fwd = Element::forward("a", &hs);
        let mut acl = Element::acl("a_acl1", &hs);

        // Predicate carried by each port, recomputed from the rule tables.
        fn port_pred(hs: &HeaderSpace, element: &Element, port: &str) -> Ref {
            let mut claimed = hs.zero();
            let mut out = hs.zero();
            for rule in element.rules() {
                let hit = hs.diff(rule.match_pred, claimed);
                if rule.port == port {
                    out = hs.or(out, hit);
                }
                claimed = hs.or(claimed, rule.match_pred);
            }
            out
        }

        let check = |element: &mut Element, insert: bool, text: &str| {
            let rule = element.encode_rule(&hs, text).unwrap();
            let ports: Vec<String> = element.ports().map(|(p, _)| p.to_string()).collect();
            let before: Vec<Ref> = ports.iter().map(|p| port_pred(&hs, element, p)).collect();
            let changes = if insert {
                element.insert(&hs, rule).unwrap()
            } else {
                element.remove(&hs, &rule).unwrap()
            };
            assert!(!changes.is_empty(), "{} moved nothing", text);
            for item in &changes {
                let from = ports.iter().position(|p| *p == item.from).unwrap();
                let left = hs.diff(before[from], port_pred(&hs, element, &item.from));
                let to_before = ports
                    .iter()
                    .position(|p| *p == item.to)
                    .map_or(hs.zero(), |i| before[i]);
                let arrived = hs.diff(port_pred(&hs, element, &item.to), to_before);
                assert_eq!(hs.measure(item.delta), hs.measure(hs.and(left, item.delta)));
                assert_eq!(hs.measure(item.delta), hs.measure(hs.and(arrived, item.delta)));
            }
            let moved = hs.or_all(changes.iter().map(|c| c.delta));
            let total: BigUint = changes.iter().map(|c| hs.measure(c.delta)).sum();
            assert_eq!(total, hs.measure(moved));
        };

        check(&mut fwd, true, "10.0.0.0 8 eth0 8");
        check(&mut fwd, true, "10.1.0.0 16 eth1 16");
        check(&mut fwd, true, "10.1.2.0 24 eth2 24");
        check(&mut fwd, false, "10.1.0.0 16 eth1 16");
        check(&mut fwd, false, "10.0.0.0 8 eth0 8");
        check(&mut acl, true, "10 permit tcp any any 10.0.0.0/8 any");
        check(&mut acl, true, "20 deny tcp any any 10.1.0.0/16 any");
        check(&mut acl, false, "10 permit tcp any any 10.0.0.0/8 any");
    }
}
