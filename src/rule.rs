use std::cmp::Reverse;
use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};
use std::str::FromStr;

use log::debug;

use crate::error::{Error, Result};
use crate::header::{format_prefix, mask_prefix, parse_ip, Field, HeaderSpace};
use crate::reference::Ref;

pub const DEFAULT_PORT: &str = "default";
pub const PERMIT_PORT: &str = "permit";
pub const DENY_PORT: &str = "deny";

/// Position of a rule in its table: higher priority first, then newer first.
///
/// Ordering ascends with decreasing precedence, so iterating a
/// `BTreeMap<Precedence, _>` visits the winning rule first.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct Precedence(Reverse<i64>, Reverse<u64>);

impl Precedence {
    pub fn new(priority: i64, seq: u64) -> Self {
        Self(Reverse(priority), Reverse(seq))
    }
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub enum RuleKind {
    /// Catch-all rule every table starts with.
    Default,
    Forward { prefix: u32, len: u8 },
    Filter(AclRule),
    Rewrite { old: (u32, u8), new: (u32, u8) },
}

#[derive(Debug, Clone)]
pub struct Rule {
    pub kind: RuleKind,
    pub priority: i64,
    pub port: String,
    pub match_pred: Ref,
    /// Part of `match_pred` this rule actually decides.
    pub hit: Ref,
    pub(crate) seq: u64,
}

impl Rule {
    pub fn new(kind: RuleKind, priority: i64, port: impl Into<String>, match_pred: Ref) -> Self {
        Self {
            kind,
            priority,
            port: port.into(),
            match_pred,
            hit: match_pred,
            seq: 0,
        }
    }

    pub fn precedence(&self) -> Precedence {
        Precedence::new(self.priority, self.seq)
    }

    /// Identity used for duplicate detection and removal.
    pub fn same_as(&self, other: &Rule) -> bool {
        self.kind == other.kind && self.port == other.port && self.priority == other.priority
    }
}

impl Display for Rule {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match &self.kind {
            RuleKind::Default => write!(f, "default")?,
            RuleKind::Forward { prefix, len } => write!(f, "{}", format_prefix(*prefix, *len))?,
            RuleKind::Filter(acl) => write!(f, "{}", acl)?,
            RuleKind::Rewrite { old, new } => write!(
                f,
                "{} => {}",
                format_prefix(old.0, old.1),
                format_prefix(new.0, new.1)
            )?,
        }
        write!(f, " -> {} (priority {})", self.port, self.priority)
    }
}

/// Traffic that moved between two ports of one element because of a rule edit.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct ChangeItem {
    pub from: String,
    pub to: String,
    pub delta: Ref,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum Action {
    Permit,
    Deny,
}

impl Action {
    pub fn port(self) -> &'static str {
        match self {
            Action::Permit => PERMIT_PORT,
            Action::Deny => DENY_PORT,
        }
    }
}

/// One ACL line: `<priority> <permit|deny> <proto> <src> <sport> <dst> <dport>`.
///
/// `None` stands for `any`.
#[derive(Debug, Clone, Eq, PartialEq, Hash)]
pub struct AclRule {
    pub priority: i64,
    pub action: Action,
    pub protocol: Option<(u8, u8)>,
    pub src: Option<(u32, u8)>,
    pub src_port: Option<(u16, u16)>,
    pub dst: Option<(u32, u8)>,
    pub dst_port: Option<(u16, u16)>,
}

impl AclRule {
    pub fn encode(&self, hs: &HeaderSpace) -> Ref {
        let mut parts = Vec::new();
        if let Some((ip, len)) = self.dst {
            parts.push(hs.dst_prefix(ip, len));
        }
        if let Some((ip, len)) = self.src {
            parts.push(hs.encode_prefix(Field::SrcIp, mask_prefix(ip, len) as u64, len as u32));
        }
        if let Some((lo, hi)) = self.src_port {
            parts.push(hs.encode_range(Field::SrcPort, lo as u64, hi as u64));
        }
        if let Some((lo, hi)) = self.dst_port {
            parts.push(hs.encode_range(Field::DstPort, lo as u64, hi as u64));
        }
        if let Some((lo, hi)) = self.protocol {
            parts.push(hs.encode_range(Field::Protocol, lo as u64, hi as u64));
        }
        hs.bdd().apply_and_many(parts)
    }
}

fn parse_range<T: FromStr + PartialOrd + Copy>(s: &str) -> Option<Option<(T, T)>> {
    if s == "any" {
        return Some(None);
    }
    let (lo, hi) = match s.split_once('-') {
        Some((lo, hi)) => (lo.parse().ok()?, hi.parse().ok()?),
        None => {
            let v = s.parse().ok()?;
            (v, v)
        }
    };
    (lo <= hi).then_some(Some((lo, hi)))
}

fn parse_protocol(s: &str) -> Option<Option<(u8, u8)>> {
    match s {
        "ip" => Some(None),
        "icmp" => Some(Some((1, 1))),
        "tcp" => Some(Some((6, 6))),
        "udp" => Some(Some((17, 17))),
        _ => parse_range(s),
    }
}

fn parse_host(s: &str) -> Option<Option<(u32, u8)>> {
    if s == "any" {
        return Some(None);
    }
    let (ip, len) = match s.split_once('/') {
        Some((ip, len)) => (parse_ip(ip)?, len.parse::<u8>().ok()?),
        None => (parse_ip(s)?, 32),
    };
    (len <= 32).then_some(Some((mask_prefix(ip, len), len)))
}

impl FromStr for AclRule {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let bad = || Error::parse("ACL rule", s);
        let tokens: Vec<&str> = s.split_whitespace().collect();
        let [priority, action, proto, src, sport, dst, dport] = tokens[..] else {
            return Err(bad());
        };
        let action = match action {
            "permit" => Action::Permit,
            "deny" => Action::Deny,
            _ => return Err(bad()),
        };
        Ok(AclRule {
            priority: priority.parse().map_err(|_| bad())?,
            action,
            protocol: parse_protocol(proto).ok_or_else(bad)?,
            src: parse_host(src).ok_or_else(bad)?,
            src_port: parse_range(sport).ok_or_else(bad)?,
            dst: parse_host(dst).ok_or_else(bad)?,
            dst_port: parse_range(dport).ok_or_else(bad)?,
        })
    }
}

impl Display for AclRule {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        fn range<T: Display + PartialEq>(r: &Option<(T, T)>) -> String {
            match r {
                None => "any".to_string(),
                Some((lo, hi)) if lo == hi => lo.to_string(),
                Some((lo, hi)) => format!("{}-{}", lo, hi),
            }
        }
        fn host(h: &Option<(u32, u8)>) -> String {
            match h {
                None => "any".to_string(),
                Some((ip, len)) => format_prefix(*ip, *len),
            }
        }
        write!(
            f,
            "{} {} {} {} {} {} {}",
            self.priority,
            self.action.port(),
            range(&self.protocol),
            host(&self.src),
            range(&self.src_port),
            host(&self.dst),
            range(&self.dst_port)
        )
    }
}

/// Claim `rule.match_pred` from the lower-precedence rules in `affected`.
///
/// `affected` must be sorted (highest precedence first) and must not contain
/// `rule` itself. On success the new hit predicates of the affected rules and of
/// `rule` are committed. On failure nothing is modified.
pub(crate) fn classify_insert(
    hs: &HeaderSpace,
    element: &str,
    rules: &mut BTreeMap<Precedence, Rule>,
    affected: &[Precedence],
    rule: &mut Rule,
) -> Result<Vec<ChangeItem>> {
    let me = rule.precedence();
    let split = affected.partition_point(|k| *k < me);
    let (higher, lower) = affected.split_at(split);

    let mut hit = rule.match_pred;
    for key in higher {
        hit = hs.diff(hit, rules[key].match_pred);
        if hs.is_false(hit) {
            debug!("{}: inserted rule {} is hidden", element, rule);
            rule.hit = hit;
            return Ok(Vec::new());
        }
    }

    let mut staged = Vec::new();
    let mut changes = Vec::new();
    let mut to_change = hit;

    let mut take = |key: &Precedence, item: &Rule, delta: Ref, staged: &mut Vec<(Precedence, Ref)>| {
        staged.push((*key, hs.diff(item.hit, delta)));
        if item.port != rule.port {
            changes.push(ChangeItem {
                from: item.port.clone(),
                to: rule.port.clone(),
                delta,
            });
        }
    };

    // Most insertions only take from the catch-all rule.
    if let Some(last) = lower.last() {
        let item = &rules[last];
        if hs.is_false(hs.diff(to_change, item.hit)) {
            take(last, item, to_change, &mut staged);
            to_change = hs.zero();
        }
    }

    for key in lower {
        if hs.is_false(to_change) {
            break;
        }
        let item = &rules[key];
        let delta = hs.and(item.hit, to_change);
        if hs.is_false(delta) {
            continue;
        }
        take(key, item, delta, &mut staged);
        to_change = hs.diff(to_change, delta);
    }

    if !hs.is_false(to_change) {
        return Err(Error::NonFalseResidual {
            element: element.to_string(),
            residual: to_change,
        });
    }

    for (key, new_hit) in staged {
        if let Some(item) = rules.get_mut(&key) {
            item.hit = new_hit;
        }
    }
    rule.hit = hit;
    Ok(changes)
}

/// Hand `rule.hit` over to the lower-precedence rules in `affected`.
///
/// `rule` must already be detached from `rules`. Nothing is modified on failure.
pub(crate) fn classify_remove(
    hs: &HeaderSpace,
    element: &str,
    rules: &mut BTreeMap<Precedence, Rule>,
    affected: &[Precedence],
    rule: &Rule,
) -> Result<Vec<ChangeItem>> {
    let me = rule.precedence();
    let mut hit = rule.hit;
    let mut staged = Vec::new();
    let mut changes = Vec::new();

    for key in affected.iter().filter(|&&k| k > me) {
        if hs.is_false(hit) {
            break;
        }
        let item = &rules[key];
        let delta = hs.and(hit, item.match_pred);
        if hs.is_false(delta) {
            continue;
        }
        staged.push((*key, hs.or(item.hit, delta)));
        hit = hs.diff(hit, delta);
        if item.port != rule.port {
            changes.push(ChangeItem {
                from: rule.port.clone(),
                to: item.port.clone(),
                delta,
            });
        }
    }

    if !hs.is_false(hit) {
        return Err(Error::NonFalseResidual {
            element: element.to_string(),
            residual: hit,
        });
    }

    for (key, new_hit) in staged {
        if let Some(item) = rules.get_mut(&key) {
            item.hit = new_hit;
        }
    }
    Ok(changes)
}
