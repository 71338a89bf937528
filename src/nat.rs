//! Destination NAT rewrite state of one NAT element.

use std::collections::{BTreeSet, HashMap};

use log::debug;

use crate::header::HeaderSpace;
use crate::reference::Ref;
use crate::rule::DEFAULT_PORT;

/// Maps every input predicate sitting on a rewriting port to the predicates it
/// becomes after translation. Once the partition has caught up, the outputs
/// are live atomic predicates.
#[derive(Debug, Default)]
pub struct RewriteTable {
    /// Destination prefix written by each rewriting port.
    values: HashMap<String, Ref>,
    entries: HashMap<Ref, BTreeSet<Ref>>,
}

impl RewriteTable {
    pub fn register_port(&mut self, port: &str, value: Ref) {
        self.values.insert(port.to_string(), value);
    }

    pub fn outputs(&self, ap: Ref) -> Option<&BTreeSet<Ref>> {
        self.entries.get(&ap)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn translate(&self, hs: &HeaderSpace, port: &str, ap: Ref) -> Option<Ref> {
        if port == DEFAULT_PORT {
            return None;
        }
        let value = self.values.get(port)?;
        Some(hs.rewrite(ap, *value))
    }

    /// Apply the table to a set of predicates; predicates without an entry pass through.
    pub fn apply(&self, aps: &BTreeSet<Ref>) -> BTreeSet<Ref> {
        let mut out = BTreeSet::new();
        for ap in aps {
            match self.entries.get(ap) {
                Some(rewritten) => out.extend(rewritten),
                None => {
                    out.insert(*ap);
                }
            }
        }
        out
    }

    /// Union of all output sets.
    pub fn all_outputs(&self) -> BTreeSet<Ref> {
        self.entries.values().flatten().copied().collect()
    }

    pub(crate) fn on_transfer(&mut self, hs: &HeaderSpace, to: &str, ap: Ref) {
        if let Some(old) = self.entries.remove(&ap) {
            debug!("rewrite: dropping {} -> {:?}", ap, old);
        }
        if let Some(out) = self.translate(hs, to, ap) {
            self.entries.insert(ap, BTreeSet::from([out]));
        }
    }

    pub(crate) fn on_split(&mut self, hs: &HeaderSpace, port: &str, origin: Ref, parts: [Ref; 2]) {
        if self.entries.remove(&origin).is_some() {
            for part in parts {
                if let Some(out) = self.translate(hs, port, part) {
                    self.entries.insert(part, BTreeSet::from([out]));
                }
            }
        }
        for outputs in self.entries.values_mut() {
            if outputs.remove(&origin) {
                outputs.extend(parts);
            }
        }
    }

    pub(crate) fn on_merge(&mut self, hs: &HeaderSpace, port: &str, parts: &[Ref], merged: Ref) {
        let mut had_entry = false;
        for part in parts {
            had_entry |= self.entries.remove(part).is_some();
        }
        if had_entry {
            if let Some(out) = self.translate(hs, port, merged) {
                self.entries.insert(merged, BTreeSet::from([out]));
            }
        }
        for outputs in self.entries.values_mut() {
            let before = outputs.len();
            outputs.retain(|o| !parts.contains(o));
            if outputs.len() != before {
                outputs.insert(merged);
            }
        }
    }

    /// Whether `aps` can be merged without conflating post-rewrite destinations.
    pub fn is_mergeable(&self, aps: &[Ref]) -> bool {
        let all_or_none = |set: &BTreeSet<Ref>| {
            let inside = aps.iter().filter(|ap| set.contains(ap)).count();
            inside == 0 || inside == aps.len()
        };
        all_or_none(&self.all_outputs()) && self.entries.values().all(all_or_none)
    }

    /// Some output that `is_live` does not recognise, if any.
    pub(crate) fn unresolved(&self, is_live: impl Fn(Ref) -> bool) -> Option<Ref> {
        self.entries.values().flatten().copied().find(|&o| !is_live(o))
    }

    /// Replace the output predicate `pred` by the atomic predicates covering it.
    pub(crate) fn resolve(&mut self, pred: Ref, aps: &BTreeSet<Ref>) {
        for outputs in self.entries.values_mut() {
            if outputs.remove(&pred) {
                outputs.extend(aps);
            }
        }
    }

    pub(crate) fn refs(&self) -> impl Iterator<Item = Ref> + '_ {
        self.values
            .values()
            .copied()
            .chain(self.entries.keys().copied())
            .chain(self.entries.values().flatten().copied())
    }
}

#[cfg(test)]
mod tests {
    use test_log::test;

    use super::*;
    use crate::header::parse_ip;

    fn setup() -> (HeaderSpace, RewriteTable, Ref, Ref) {
        let hs = HeaderSpace::default();
        let mut table = RewriteTable::default();
        let old = hs.dst_prefix(parse_ip("10.0.0.0").unwrap(), 8);
        let new = hs.dst_prefix(parse_ip("192.168.0.0").unwrap(), 16);
        table.register_port("192.168.0.0/16", new);
        (hs, table, old, new)
    }

    #[test]
    fn test_transfer_records_rewrite() {
        let (hs, mut table, old, new) = setup();
        table.on_transfer(&hs, "192.168.0.0/16", old);
        assert_eq!(table.outputs(old), Some(&BTreeSet::from([new])));

        let applied = table.apply(&BTreeSet::from([old, hs.not(old)]));
        assert_eq!(applied, BTreeSet::from([new, hs.not(old)]));

        table.on_transfer(&hs, DEFAULT_PORT, old);
        assert!(table.is_empty());
    }

    #[test]
    fn test_split_and_merge_follow_outputs() {
        let (hs, mut table, old, new) = setup();
        table.on_transfer(&hs, "192.168.0.0/16", old);

        // The output predicate gets split by the partition.
        let a = hs.dst_prefix(parse_ip("192.168.0.0").unwrap(), 17);
        let b = hs.diff(new, a);
        table.on_split(&hs, DEFAULT_PORT, new, [a, b]);
        assert_eq!(table.outputs(old), Some(&BTreeSet::from([a, b])));
        assert!(table.is_mergeable(&[a, b]));
        assert!(!table.is_mergeable(&[a, old]));

        table.on_merge(&hs, DEFAULT_PORT, &[a, b], new);
        assert_eq!(table.outputs(old), Some(&BTreeSet::from([new])));
    }

    #[test]
    fn test_split_of_input_recomputes() {
        let (hs, mut table, old, new) = setup();
        table.on_transfer(&hs, "192.168.0.0/16", old);

        let a = hs.dst_prefix(parse_ip("10.0.0.0").unwrap(), 9);
        let b = hs.diff(old, a);
        table.on_split(&hs, "192.168.0.0/16", old, [a, b]);
        assert_eq!(table.outputs(old), None);
        assert_eq!(table.outputs(a), Some(&BTreeSet::from([new])));
        assert_eq!(table.outputs(b), Some(&BTreeSet::from([new])));
    }

    #[test]
    fn test_resolve() {
        let (hs, mut table, old, new) = setup();
        table.on_transfer(&hs, "192.168.0.0/16", old);
        assert_eq!(table.unresolved(|r| r == old), Some(new));
        let aps = BTreeSet::from([Ref::positive(1234), Ref::positive(5678)]);
        table.resolve(new, &aps);
        assert_eq!(table.outputs(old), Some(&aps));
        assert_eq!(table.unresolved(|r| aps.contains(&r)), None);
    }
}
