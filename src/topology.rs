//! Directed port-level topology.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt::{Display, Formatter};

use log::debug;

/// Port of a NAT element that receives the traffic it translates.
pub const NAT_INPORT: &str = "inport";

/// A port on a node. As a traversal state it is the egress position of a packet.
#[derive(Debug, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct Position {
    pub device: String,
    pub port: String,
}

impl Position {
    pub fn new(device: impl Into<String>, port: impl Into<String>) -> Self {
        Self {
            device: device.into(),
            port: port.into(),
        }
    }
}

impl Display for Position {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "({},{})", self.device, self.port)
    }
}

/// Whether `port` names a VLAN interface.
pub fn is_vlan(port: &str) -> bool {
    port.get(..4).is_some_and(|p| p.eq_ignore_ascii_case("vlan"))
}

/// Whether `node` is one of the virtual nodes of an ACL element.
pub fn is_acl_node(node: &str) -> bool {
    acl_element_of(node).is_some()
}

/// ACL element behind the virtual node `<name>_in` or `<name>_out`.
pub fn acl_element_of(node: &str) -> Option<&str> {
    node.strip_suffix("_in")
        .or_else(|| node.strip_suffix("_out"))
        .filter(|name| !name.is_empty())
}

/// Virtual nodes of the ACL element `name`.
pub fn acl_nodes(name: &str) -> [String; 2] {
    [format!("{}_in", name), format!("{}_out", name)]
}

#[derive(Debug, Default, Clone)]
pub struct Topology {
    edges: BTreeMap<Position, BTreeSet<Position>>,
    vlans: HashMap<String, BTreeMap<String, Vec<String>>>,
    /// Egress peers of every NAT node, shared by all its output ports.
    nat_egress: HashMap<String, BTreeSet<Position>>,
}

impl Topology {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_link(&mut self, from: Position, to: Position) {
        self.edges.entry(from).or_default().insert(to);
    }

    pub fn add_vlan(&mut self, device: &str, vlan: &str, ports: impl IntoIterator<Item = String>) {
        self.vlans
            .entry(device.to_string())
            .or_default()
            .entry(vlan.to_string())
            .or_default()
            .extend(ports);
    }

    /// Every directed link, in order.
    pub fn links(&self) -> impl Iterator<Item = (&Position, &Position)> {
        self.edges
            .iter()
            .flat_map(|(from, peers)| peers.iter().map(move |to| (from, to)))
    }

    pub fn num_links(&self) -> usize {
        self.edges.values().map(BTreeSet::len).sum()
    }

    /// Names of all nodes mentioned by a link.
    pub fn nodes(&self) -> BTreeSet<&str> {
        self.links()
            .flat_map(|(a, b)| [a.device.as_str(), b.device.as_str()])
            .collect()
    }

    /// Ingress positions reached from the egress position `pos`.
    pub fn connected(&self, pos: &Position) -> Option<&BTreeSet<Position>> {
        if pos.port != NAT_INPORT {
            if let Some(peers) = self.nat_egress.get(&pos.device) {
                return Some(peers);
            }
        }
        self.edges.get(pos).filter(|peers| !peers.is_empty())
    }

    /// Member ports of `port` on `device`, or the port itself when it is not a known VLAN.
    /// A member equal to `inbound` is left out.
    pub fn physical_ports(&self, device: &str, port: &str, inbound: Option<&str>) -> Vec<String> {
        if is_vlan(port) {
            if let Some(members) = self.vlans.get(device).and_then(|v| v.get(port)) {
                return members
                    .iter()
                    .filter(|m| Some(m.as_str()) != inbound)
                    .cloned()
                    .collect();
            }
        }
        vec![port.to_string()]
    }

    /// Route the egress of `(device, port)` through the NAT element `nat`.
    ///
    /// The links of the port now lead into the NAT element; every output of the
    /// NAT element leads to the original peers.
    pub fn attach_nat(&mut self, device: &str, port: &str, nat: &str) {
        let pos = Position::new(device, port);
        let peers = self.edges.remove(&pos).unwrap_or_default();
        debug!("attach {} behind {} with {} peers", nat, pos, peers.len());
        self.edges
            .insert(pos, BTreeSet::from([Position::new(nat, NAT_INPORT)]));
        self.nat_egress.entry(nat.to_string()).or_default().extend(peers);
    }
}
