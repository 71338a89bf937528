//! Network elements and their rule classifiers.
//!
//! An [`Element`] owns a rule table and the per-port sets of atomic predicates.
//! Inserting or removing a rule yields the [`ChangeItem`]s the partition then
//! applies. The element never touches the partition itself.

use std::collections::{BTreeMap, BTreeSet};

use log::{debug, info};

use crate::error::{Error, Result};
use crate::header::{format_prefix, mask_prefix, parse_ip, HeaderSpace};
use crate::nat::RewriteTable;
use crate::reference::Ref;
use crate::rule::{
    classify_insert, classify_remove, AclRule, ChangeItem, Precedence, Rule, RuleKind, DEFAULT_PORT,
    DENY_PORT, PERMIT_PORT,
};
use crate::trie::PrefixTrie;

/// Priority of NAT rules given without one.
pub const NAT_PRIORITY: i64 = 65535;

#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum ElementKind {
    Forward,
    Acl,
    Nat,
}

impl std::fmt::Display for ElementKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ElementKind::Forward => write!(f, "forward"),
            ElementKind::Acl => write!(f, "acl"),
            ElementKind::Nat => write!(f, "nat"),
        }
    }
}

impl std::str::FromStr for ElementKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "forward" | "fwd" => Ok(ElementKind::Forward),
            "acl" => Ok(ElementKind::Acl),
            "nat" => Ok(ElementKind::Nat),
            _ => Err(Error::parse("element type", s)),
        }
    }
}

#[derive(Debug)]
enum RuleTable {
    Forward {
        trie: PrefixTrie,
        rules: BTreeMap<Precedence, Rule>,
    },
    Acl {
        rules: BTreeMap<Precedence, Rule>,
    },
    Nat {
        rules: BTreeMap<Precedence, Rule>,
        rewrite: RewriteTable,
    },
}

#[derive(Debug)]
pub struct Element {
    name: String,
    table: RuleTable,
    ports: BTreeMap<String, BTreeSet<Ref>>,
    next_seq: u64,
}

impl Element {
    fn with_table(name: impl Into<String>, table: RuleTable, default: Rule) -> Self {
        let mut element = Self {
            name: name.into(),
            table,
            ports: BTreeMap::new(),
            next_seq: 1,
        };
        element.ports.insert(default.port.clone(), BTreeSet::new());
        let key = default.precedence();
        match &mut element.table {
            RuleTable::Forward { trie, rules } => {
                trie.add_rule(trie.root(), key);
                rules.insert(key, default);
            }
            RuleTable::Acl { rules } | RuleTable::Nat { rules, .. } => {
                rules.insert(key, default);
            }
        }
        element
    }

    /// Forwarding element with the catch-all `0.0.0.0/0 -> default` rule.
    pub fn forward(name: impl Into<String>, hs: &HeaderSpace) -> Self {
        let default = Rule::new(
            RuleKind::Forward { prefix: 0, len: 0 },
            -1,
            DEFAULT_PORT,
            hs.one(),
        );
        let table = RuleTable::Forward {
            trie: PrefixTrie::new(),
            rules: BTreeMap::new(),
        };
        Self::with_table(name, table, default)
    }

    /// ACL element denying everything until permit rules are inserted.
    pub fn acl(name: impl Into<String>, hs: &HeaderSpace) -> Self {
        let default = Rule::new(RuleKind::Default, -1, DENY_PORT, hs.one());
        let mut element = Self::with_table(name, RuleTable::Acl { rules: BTreeMap::new() }, default);
        element.ports.insert(PERMIT_PORT.to_string(), BTreeSet::new());
        element
    }

    /// NAT element passing everything through untranslated.
    pub fn nat(name: impl Into<String>, hs: &HeaderSpace) -> Self {
        let default = Rule::new(RuleKind::Default, 0, DEFAULT_PORT, hs.one());
        let table = RuleTable::Nat {
            rules: BTreeMap::new(),
            rewrite: RewriteTable::default(),
        };
        Self::with_table(name, table, default)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> ElementKind {
        match self.table {
            RuleTable::Forward { .. } => ElementKind::Forward,
            RuleTable::Acl { .. } => ElementKind::Acl,
            RuleTable::Nat { .. } => ElementKind::Nat,
        }
    }

    /// Port every predicate starts on.
    pub fn default_port(&self) -> &'static str {
        match self.kind() {
            ElementKind::Acl => DENY_PORT,
            _ => DEFAULT_PORT,
        }
    }

    pub fn ports(&self) -> impl Iterator<Item = (&str, &BTreeSet<Ref>)> {
        self.ports.iter().map(|(port, aps)| (port.as_str(), aps))
    }

    pub fn port_aps(&self, port: &str) -> Option<&BTreeSet<Ref>> {
        self.ports.get(port)
    }

    fn rule_map(&self) -> &BTreeMap<Precedence, Rule> {
        match &self.table {
            RuleTable::Forward { rules, .. } | RuleTable::Acl { rules } | RuleTable::Nat { rules, .. } => rules,
        }
    }

    /// Rules in precedence order, the catch-all last.
    pub fn rules(&self) -> impl Iterator<Item = &Rule> {
        self.rule_map().values()
    }

    pub fn rewrite_table(&self) -> Option<&RewriteTable> {
        match &self.table {
            RuleTable::Nat { rewrite, .. } => Some(rewrite),
            _ => None,
        }
    }

    /// Predicates leaving through `port`, out of those in `aps`.
    ///
    /// A set holding the universal predicate stands for "anything" and yields the
    /// whole port set. NAT elements translate the result.
    pub fn forward_aps(&self, hs: &HeaderSpace, port: &str, aps: &BTreeSet<Ref>) -> BTreeSet<Ref> {
        let Some(port_aps) = self.ports.get(port) else {
            return BTreeSet::new();
        };
        let filtered: BTreeSet<Ref> = if aps.contains(&hs.one()) {
            port_aps.clone()
        } else if aps.len() <= port_aps.len() {
            aps.iter().filter(|ap| port_aps.contains(ap)).copied().collect()
        } else {
            port_aps.iter().filter(|ap| aps.contains(ap)).copied().collect()
        };
        match &self.table {
            RuleTable::Nat { rewrite, .. } => rewrite.apply(&filtered),
            _ => filtered,
        }
    }

    /// Parse the type-specific part of an update line into a rule.
    ///
    /// - forward: `<prefix> <len> <port> <priority>`
    /// - acl: `<priority> <permit|deny> <proto> <src> <sport> <dst> <dport>`
    /// - nat: `<old-ip> <old-len> <new-ip> <new-len> [<priority>]`
    pub fn encode_rule(&self, hs: &HeaderSpace, text: &str) -> Result<Rule> {
        let tokens: Vec<&str> = text.split_whitespace().collect();
        match self.kind() {
            ElementKind::Forward => {
                let bad = || Error::parse("forwarding rule", text);
                let [prefix, len, port, priority] = tokens[..] else {
                    return Err(bad());
                };
                let len = parse_len(len).ok_or_else(bad)?;
                let prefix = mask_prefix(parse_ip(prefix).ok_or_else(bad)?, len);
                let priority = priority.parse().map_err(|_| bad())?;
                Ok(Rule::new(
                    RuleKind::Forward { prefix, len },
                    priority,
                    port,
                    hs.dst_prefix(prefix, len),
                ))
            }
            ElementKind::Acl => {
                let acl: AclRule = text.parse()?;
                let port = acl.action.port();
                let match_pred = acl.encode(hs);
                Ok(Rule::new(RuleKind::Filter(acl.clone()), acl.priority, port, match_pred))
            }
            ElementKind::Nat => {
                let bad = || Error::parse("NAT rule", text);
                let (old_ip, old_len, new_ip, new_len, priority) = match tokens[..] {
                    [a, b, c, d] => (a, b, c, d, None),
                    [a, b, c, d, p] => (a, b, c, d, Some(p)),
                    _ => return Err(bad()),
                };
                let old_len = parse_len(old_len).ok_or_else(bad)?;
                let new_len = parse_len(new_len).ok_or_else(bad)?;
                let old = (mask_prefix(parse_ip(old_ip).ok_or_else(bad)?, old_len), old_len);
                let new = (mask_prefix(parse_ip(new_ip).ok_or_else(bad)?, new_len), new_len);
                let priority = match priority {
                    Some(p) => p.parse().map_err(|_| bad())?,
                    None => NAT_PRIORITY,
                };
                Ok(Rule::new(
                    RuleKind::Rewrite { old, new },
                    priority,
                    format_prefix(new.0, new.1),
                    hs.dst_prefix(old.0, old.1),
                ))
            }
        }
    }

    fn check_port(&self, rule: &Rule) -> Result<()> {
        let allowed = match self.kind() {
            ElementKind::Acl => rule.port == PERMIT_PORT || rule.port == DENY_PORT,
            _ => true,
        };
        if allowed {
            Ok(())
        } else {
            Err(Error::PortNotFound {
                element: self.name.clone(),
                port: rule.port.clone(),
            })
        }
    }

    /// Insert `rule`, returning the traffic that changed ports.
    ///
    /// A duplicate of an existing rule is logged and ignored.
    pub fn insert(&mut self, hs: &HeaderSpace, mut rule: Rule) -> Result<Vec<ChangeItem>> {
        self.check_port(&rule)?;
        if self.rules().any(|r| r.same_as(&rule)) {
            info!("{}: duplicate rule {} ignored", self.name, rule);
            return Ok(Vec::new());
        }

        rule.seq = self.next_seq;
        self.next_seq += 1;
        let key = rule.precedence();

        let changes = match &mut self.table {
            RuleTable::Forward { trie, rules } => {
                let RuleKind::Forward { prefix, len } = rule.kind else {
                    return Err(Error::parse("forwarding rule", rule.to_string()));
                };
                let node = trie.insert(prefix, len);
                let affected = trie.affected(node);
                match classify_insert(hs, &self.name, rules, &affected, &mut rule) {
                    Ok(changes) => {
                        trie.add_rule(node, key);
                        changes
                    }
                    Err(e) => {
                        trie.prune(node);
                        return Err(e);
                    }
                }
            }
            RuleTable::Acl { rules } => {
                let affected: Vec<Precedence> = rules.keys().copied().collect();
                classify_insert(hs, &self.name, rules, &affected, &mut rule)?
            }
            RuleTable::Nat { rules, rewrite } => {
                if let RuleKind::Rewrite { new, .. } = rule.kind {
                    rewrite.register_port(&rule.port, hs.dst_prefix(new.0, new.1));
                }
                let affected: Vec<Precedence> = rules.keys().copied().collect();
                classify_insert(hs, &self.name, rules, &affected, &mut rule)?
            }
        };

        debug!("{}: inserted {} with {} changes", self.name, rule, changes.len());
        self.ports.entry(rule.port.clone()).or_default();
        self.rule_map_mut().insert(key, rule);
        Ok(changes)
    }

    fn rule_map_mut(&mut self) -> &mut BTreeMap<Precedence, Rule> {
        match &mut self.table {
            RuleTable::Forward { rules, .. } | RuleTable::Acl { rules } | RuleTable::Nat { rules, .. } => rules,
        }
    }

    /// Remove the rule identical to `rule`, returning the traffic that changed ports.
    ///
    /// Removing an unknown rule is logged and ignored.
    pub fn remove(&mut self, hs: &HeaderSpace, rule: &Rule) -> Result<Vec<ChangeItem>> {
        let name = self.name.clone();
        let Some(key) = self
            .rules()
            .find(|r| r.same_as(rule) && r.seq != 0)
            .map(Rule::precedence)
        else {
            info!("{}: rule {} not found, nothing removed", name, rule);
            return Ok(Vec::new());
        };

        let changes = match &mut self.table {
            RuleTable::Forward { trie, rules } => {
                let RuleKind::Forward { prefix, len } = rule.kind else {
                    return Ok(Vec::new());
                };
                let Some(node) = trie.find(prefix, len) else {
                    info!("{}: no trie node for {}", name, format_prefix(prefix, len));
                    return Ok(Vec::new());
                };
                let Some(stored) = rules.remove(&key) else {
                    return Ok(Vec::new());
                };
                trie.remove_rule(node, key);
                let changes = if hs.is_false(stored.hit) {
                    info!("{}: hidden rule {} deleted", name, stored);
                    Vec::new()
                } else {
                    let affected = trie.affected(node);
                    match classify_remove(hs, &name, rules, &affected, &stored) {
                        Ok(changes) => changes,
                        Err(e) => {
                            trie.add_rule(node, key);
                            rules.insert(key, stored);
                            return Err(e);
                        }
                    }
                };
                if trie.rules(node).is_empty() {
                    hs.forget_dst_prefix(prefix, len);
                }
                trie.prune(node);
                changes
            }
            RuleTable::Acl { rules } | RuleTable::Nat { rules, .. } => {
                let Some(stored) = rules.remove(&key) else {
                    return Ok(Vec::new());
                };
                if hs.is_false(stored.hit) {
                    info!("{}: hidden rule {} deleted", name, stored);
                    Vec::new()
                } else {
                    let affected: Vec<Precedence> = rules.keys().copied().collect();
                    match classify_remove(hs, &name, rules, &affected, &stored) {
                        Ok(changes) => changes,
                        Err(e) => {
                            rules.insert(key, stored);
                            return Err(e);
                        }
                    }
                }
            }
        };
        Ok(changes)
    }

    pub(crate) fn port_aps_mut(&mut self, port: &str) -> Result<&mut BTreeSet<Ref>> {
        match self.ports.get_mut(port) {
            Some(aps) => Ok(aps),
            None => Err(Error::PortNotFound {
                element: self.name.clone(),
                port: port.to_string(),
            }),
        }
    }

    /// Called by the partition after `ap` moved from `from` to `to`.
    pub(crate) fn on_transfer(&mut self, hs: &HeaderSpace, from: &str, to: &str, ap: Ref) -> Result<()> {
        if !self.port_aps_mut(from)?.remove(&ap) {
            return Err(Error::ApSetNotFound {
                element: self.name.clone(),
                port: from.to_string(),
            });
        }
        self.port_aps_mut(to)?.insert(ap);
        if let RuleTable::Nat { rewrite, .. } = &mut self.table {
            rewrite.on_transfer(hs, to, ap);
        }
        Ok(())
    }

    /// Called by the partition after `origin`, located on `port`, was split.
    pub(crate) fn on_split(&mut self, hs: &HeaderSpace, port: &str, origin: Ref, parts: [Ref; 2]) -> Result<()> {
        let aps = self.port_aps_mut(port)?;
        if !aps.remove(&origin) {
            return Err(Error::ApNotFound(origin));
        }
        aps.extend(parts);
        if let RuleTable::Nat { rewrite, .. } = &mut self.table {
            rewrite.on_split(hs, port, origin, parts);
        }
        Ok(())
    }

    /// Called by the partition after `parts`, all located on `port`, were merged.
    pub(crate) fn on_merge(&mut self, hs: &HeaderSpace, port: &str, parts: &[Ref], merged: Ref) -> Result<()> {
        let aps = self.port_aps_mut(port)?;
        for part in parts {
            if !aps.remove(part) {
                return Err(Error::ApNotFound(*part));
            }
        }
        aps.insert(merged);
        if let RuleTable::Nat { rewrite, .. } = &mut self.table {
            rewrite.on_merge(hs, port, parts, merged);
        }
        Ok(())
    }

    /// Place a fresh predicate on the default port.
    pub(crate) fn adopt(&mut self, ap: Ref) {
        let port = self.default_port();
        self.ports.entry(port.to_string()).or_default().insert(ap);
    }

    pub(crate) fn rewrite_table_mut(&mut self) -> Option<&mut RewriteTable> {
        match &mut self.table {
            RuleTable::Nat { rewrite, .. } => Some(rewrite),
            _ => None,
        }
    }

    /// Every BDD handle this element keeps alive.
    pub(crate) fn refs(&self) -> Vec<Ref> {
        let mut refs: Vec<Ref> = self
            .rules()
            .flat_map(|r| [r.match_pred, r.hit])
            .collect();
        if let Some(rewrite) = self.rewrite_table() {
            refs.extend(rewrite.refs());
        }
        refs
    }
}

fn parse_len(s: &str) -> Option<u8> {
    s.parse::<u8>().ok().filter(|&len| len <= 32)
}
