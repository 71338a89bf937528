//! Packet header space as a boolean-set algebra.
//!
//! Every set of packets is a [`Ref`] into one shared [`Bdd`]. The header is laid
//! out as destination IP, source IP, source port, destination port and protocol,
//! each field most-significant bit first. Destination IP sits at the top of the
//! variable order, so prefix decomposition and NAT rewriting only touch the
//! upper part of the diagrams.

use std::cell::RefCell;
use std::collections::HashMap;
use std::net::Ipv4Addr;

use log::{debug, warn};
use num_bigint::BigUint;

use crate::bdd::{Bdd, BddConfig};
use crate::reference::Ref;

#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum Field {
    DstIp,
    SrcIp,
    SrcPort,
    DstPort,
    Protocol,
}

impl Field {
    pub const ALL: [Field; 5] = [
        Field::DstIp,
        Field::SrcIp,
        Field::SrcPort,
        Field::DstPort,
        Field::Protocol,
    ];

    pub const fn width(self) -> u32 {
        match self {
            Field::DstIp | Field::SrcIp => 32,
            Field::SrcPort | Field::DstPort => 16,
            Field::Protocol => 8,
        }
    }

    /// BDD variable of the most significant bit.
    pub const fn first_var(self) -> u32 {
        match self {
            Field::DstIp => 1,
            Field::SrcIp => 33,
            Field::SrcPort => 65,
            Field::DstPort => 81,
            Field::Protocol => 97,
        }
    }

    pub fn vars(self) -> std::ops::Range<u32> {
        self.first_var()..self.first_var() + self.width()
    }
}

/// Total number of header bits.
pub const NUM_VARS: u32 = 104;

/// Parse an IPv4 address given either in dotted form or as a plain integer.
pub fn parse_ip(s: &str) -> Option<u32> {
    s.parse::<Ipv4Addr>()
        .map(u32::from)
        .ok()
        .or_else(|| s.parse::<u32>().ok())
}

pub fn format_prefix(ip: u32, len: u8) -> String {
    format!("{}/{}", Ipv4Addr::from(ip), len)
}

/// Zero all bits of `ip` past the first `len`.
pub fn mask_prefix(ip: u32, len: u8) -> u32 {
    match len {
        0 => 0,
        len if len >= 32 => ip,
        _ => ip & (u32::MAX << (32 - len)),
    }
}

pub struct HeaderSpace {
    bdd: Bdd,
    roots: RefCell<HashMap<Ref, usize>>,
    prefixes: RefCell<HashMap<(u32, u8), Ref>>,
}

impl HeaderSpace {
    pub fn new(config: BddConfig) -> Self {
        Self {
            bdd: Bdd::with_config(config),
            roots: RefCell::new(HashMap::new()),
            prefixes: RefCell::new(HashMap::new()),
        }
    }

    pub fn bdd(&self) -> &Bdd {
        &self.bdd
    }

    pub fn one(&self) -> Ref {
        self.bdd.one
    }
    pub fn zero(&self) -> Ref {
        self.bdd.zero
    }
    pub fn is_false(&self, p: Ref) -> bool {
        self.bdd.is_zero(p)
    }
    pub fn is_true(&self, p: Ref) -> bool {
        self.bdd.is_one(p)
    }

    pub fn and(&self, a: Ref, b: Ref) -> Ref {
        self.bdd.apply_and(a, b)
    }
    pub fn or(&self, a: Ref, b: Ref) -> Ref {
        self.bdd.apply_or(a, b)
    }
    pub fn not(&self, a: Ref) -> Ref {
        self.bdd.apply_not(a)
    }
    pub fn diff(&self, a: Ref, b: Ref) -> Ref {
        self.bdd.apply_diff(a, b)
    }
    pub fn or_all(&self, preds: impl IntoIterator<Item = Ref>) -> Ref {
        self.bdd.apply_or_many(preds)
    }
    pub fn intersects(&self, a: Ref, b: Ref) -> bool {
        !self.is_false(self.and(a, b))
    }

    /// Register `p` as a long-lived handle that must survive garbage collection.
    pub fn incref(&self, p: Ref) -> Ref {
        if !self.bdd.is_terminal(p) {
            *self.roots.borrow_mut().entry(p.regular()).or_insert(0) += 1;
        }
        p
    }

    /// Release one registration of `p`.
    pub fn decref(&self, p: Ref) {
        if self.bdd.is_terminal(p) {
            return;
        }
        let mut roots = self.roots.borrow_mut();
        match roots.get_mut(&p.regular()) {
            Some(count) if *count > 1 => *count -= 1,
            Some(_) => {
                roots.remove(&p.regular());
            }
            None => warn!("decref of unregistered handle {}", p),
        }
    }

    pub fn ref_count(&self, p: Ref) -> usize {
        self.roots.borrow().get(&p.regular()).copied().unwrap_or(0)
    }

    /// Packets whose `field` starts with the first `len` bits of `value`.
    pub fn encode_prefix(&self, field: Field, value: u64, len: u32) -> Ref {
        let width = field.width();
        assert!(len <= width, "prefix length {} exceeds field width {}", len, width);
        let literals = (0..len).map(|i| {
            let var = (field.first_var() + i) as i32;
            if (value >> (width - 1 - i)) & 1 == 1 {
                var
            } else {
                -var
            }
        });
        self.bdd.cube(literals)
    }

    /// Destination-IP prefix, memoised and kept alive until [`forget_dst_prefix`](Self::forget_dst_prefix).
    pub fn dst_prefix(&self, ip: u32, len: u8) -> Ref {
        let key = (mask_prefix(ip, len), len);
        if let Some(&p) = self.prefixes.borrow().get(&key) {
            return p;
        }
        let p = self.encode_prefix(Field::DstIp, key.0 as u64, len as u32);
        self.prefixes.borrow_mut().insert(key, p);
        p
    }

    pub fn forget_dst_prefix(&self, ip: u32, len: u8) {
        self.prefixes
            .borrow_mut()
            .remove(&(mask_prefix(ip, len), len));
    }

    /// Packets whose `field` lies in `lo..=hi`, as a union of aligned prefixes.
    pub fn encode_range(&self, field: Field, lo: u64, hi: u64) -> Ref {
        let width = field.width();
        let max = (1u64 << width) - 1;
        assert!(lo <= hi && hi <= max, "bad range {}..={} for {:?}", lo, hi, field);

        let mut res = self.zero();
        let mut cur = lo;
        loop {
            // Largest aligned block starting at `cur` that fits into the range.
            let mut k = if cur == 0 { width } else { cur.trailing_zeros().min(width) };
            while k > 0 && cur + ((1u64 << k) - 1) > hi {
                k -= 1;
            }
            let block = self.encode_prefix(field, cur, width - k);
            res = self.or(res, block);

            let last = cur + ((1u64 << k) - 1);
            if last >= hi {
                break;
            }
            cur = last + 1;
        }
        res
    }

    /// Rewrite the destination IP of every packet in `pred` to `new_value`.
    pub fn rewrite(&self, pred: Ref, new_value: Ref) -> Ref {
        let vars: Vec<u32> = Field::DstIp.vars().collect();
        let erased = self.bdd.exists(pred, &vars);
        self.and(erased, new_value)
    }

    /// Number of concrete packet headers in `pred`.
    pub fn measure(&self, pred: Ref) -> BigUint {
        self.bdd.sat_count(pred, NUM_VARS as usize)
    }

    /// Destination addresses covered by `pred`, as disjoint maximal prefixes.
    pub fn dst_prefixes(&self, pred: Ref) -> Vec<String> {
        let others: Vec<u32> = Field::ALL
            .iter()
            .filter(|&&f| f != Field::DstIp)
            .flat_map(|f| f.vars())
            .collect();
        let projected = self.bdd.exists(pred, &others);
        let mut out = Vec::new();
        self.collect_prefixes(projected, 0, 0, &mut out);
        out
    }

    fn collect_prefixes(&self, f: Ref, depth: u8, bits: u32, out: &mut Vec<String>) {
        if self.is_false(f) {
            return;
        }
        if self.is_true(f) {
            out.push(format_prefix(bits, depth));
            return;
        }
        let (f0, f1) = self.bdd.top_cofactors(f, depth as u32 + 1);
        self.collect_prefixes(f0, depth + 1, bits, out);
        self.collect_prefixes(f1, depth + 1, bits | (1 << (31 - depth)), out);
    }

    pub fn num_nodes(&self) -> usize {
        self.bdd.num_nodes()
    }

    /// Collect garbage, keeping every registered handle, every cached prefix and `extra`.
    pub fn collect_garbage(&self, extra: impl IntoIterator<Item = Ref>) {
        let mut roots: Vec<Ref> = self.roots.borrow().keys().copied().collect();
        roots.extend(self.prefixes.borrow().values().copied());
        roots.extend(extra);
        debug!("collect_garbage: {} roots", roots.len());
        self.bdd.collect_garbage(roots);
    }
}

impl Default for HeaderSpace {
    fn default() -> Self {
        Self::new(BddConfig::default())
    }
}

impl std::fmt::Debug for HeaderSpace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HeaderSpace")
            .field("bdd", &self.bdd)
            .field("roots", &self.roots.borrow().len())
            .field("prefixes", &self.prefixes.borrow().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use test_log::test;

    use super::*;

    fn ip(s: &str) -> u32 {
        parse_ip(s).unwrap()
    }

    #[test]
    fn test_parse_ip() {
        assert_eq!(parse_ip("10.0.0.0"), Some(0x0a00_0000));
        assert_eq!(parse_ip("167772160"), Some(0x0a00_0000));
        assert_eq!(parse_ip("10.0.0"), None);
        assert_eq!(format_prefix(0x0a00_0000, 8), "10.0.0.0/8");
        assert_eq!(mask_prefix(ip("10.1.2.3"), 16), ip("10.1.0.0"));
        assert_eq!(mask_prefix(ip("10.1.2.3"), 0), 0);
        assert_eq!(mask_prefix(ip("10.1.2.3"), 32), ip("10.1.2.3"));
    }

    #[test]
    fn test_prefix_containment() {
        let hs = HeaderSpace::default();
        let p8 = hs.dst_prefix(ip("10.0.0.0"), 8);
        let p16 = hs.dst_prefix(ip("10.1.0.0"), 16);
        let other = hs.dst_prefix(ip("11.0.0.0"), 8);

        assert_eq!(hs.and(p8, p16), p16);
        assert!(hs.is_false(hs.and(p8, other)));
        assert_eq!(hs.dst_prefix(0, 0), hs.one());
        // Host bits beyond the prefix are ignored.
        assert_eq!(hs.dst_prefix(ip("10.9.9.9"), 8), p8);
        assert_eq!(hs.measure(p8), BigUint::from(1u32) << (NUM_VARS - 8));
    }

    #[test]
    fn test_range() {
        let hs = HeaderSpace::default();
        let r = hs.encode_range(Field::DstPort, 80, 80);
        assert_eq!(r, hs.encode_prefix(Field::DstPort, 80, 16));

        let all = hs.encode_range(Field::SrcPort, 0, 65535);
        assert_eq!(all, hs.one());

        let r = hs.encode_range(Field::DstPort, 1000, 2000);
        assert_eq!(hs.measure(r), BigUint::from(1001u32) << (NUM_VARS - 16));

        let low = hs.encode_range(Field::Protocol, 0, 5);
        let high = hs.encode_range(Field::Protocol, 6, 255);
        assert!(hs.is_false(hs.and(low, high)));
        assert_eq!(hs.or(low, high), hs.one());
    }

    #[test]
    fn test_dst_prefixes() {
        let hs = HeaderSpace::default();
        let p8 = hs.dst_prefix(ip("10.0.0.0"), 8);
        let p16 = hs.dst_prefix(ip("10.1.0.0"), 16);
        assert_eq!(hs.dst_prefixes(p8), vec!["10.0.0.0/8"]);
        assert_eq!(hs.dst_prefixes(hs.one()), vec!["0.0.0.0/0"]);
        assert!(hs.dst_prefixes(hs.zero()).is_empty());

        let hole = hs.diff(p8, p16);
        let parts = hs.dst_prefixes(hole);
        assert_eq!(parts.len(), 8);
        assert!(parts.contains(&"10.0.0.0/16".to_string()));
        assert!(parts.contains(&"10.128.0.0/9".to_string()));
        assert!(!parts.iter().any(|p| p.starts_with("10.1.0.0")));

        // Other fields are projected away.
        let web = hs.and(p16, hs.encode_range(Field::DstPort, 80, 80));
        assert_eq!(hs.dst_prefixes(web), vec!["10.1.0.0/16"]);
    }

    #[test]
    fn test_rewrite() {
        let hs = HeaderSpace::default();
        let old = hs.dst_prefix(ip("10.0.0.0"), 8);
        let new = hs.dst_prefix(ip("192.168.0.0"), 16);
        let web = hs.encode_range(Field::DstPort, 80, 80);

        let pkt = hs.and(old, web);
        let out = hs.rewrite(pkt, new);
        assert_eq!(out, hs.and(new, web));
    }

    #[test]
    fn test_refcount_and_gc() {
        let hs = HeaderSpace::default();
        let kept = hs.incref(hs.encode_prefix(Field::SrcIp, 0x0102_0304, 32));
        hs.incref(kept);
        assert_eq!(hs.ref_count(kept), 2);
        hs.decref(kept);
        assert_eq!(hs.ref_count(kept), 1);

        let _garbage = hs.encode_prefix(Field::SrcIp, 0x0506_0708, 32);
        hs.collect_garbage([]);
        assert_eq!(hs.num_nodes(), hs.bdd().size(kept));
        assert_eq!(hs.encode_prefix(Field::SrcIp, 0x0102_0304, 32), kept);

        hs.decref(kept);
        hs.decref(kept);
        assert_eq!(hs.ref_count(kept), 0);
    }
}
