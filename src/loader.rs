//! Text formats: network description files and update lines.

use std::fmt::{Display, Formatter};
use std::fs;
use std::path::Path;
use std::str::FromStr;

use log::{debug, info};

use crate::element::ElementKind;
use crate::error::{Error, Result};
use crate::topology::Position;

/// Everything needed to build a network, before any rule is inserted.
#[derive(Debug, Default, Clone, Eq, PartialEq)]
pub struct NetworkSpec {
    /// Directed links.
    pub links: Vec<(Position, Position)>,
    /// Devices that get a forwarding element even without links.
    pub devices: Vec<String>,
    /// `(device, vlan, member ports)`.
    pub vlans: Vec<(String, String, Vec<String>)>,
    /// `(device, acl name)`.
    pub acls: Vec<(String, String)>,
    /// `(device, port)` pairs whose egress is translated.
    pub nats: Vec<(String, String)>,
}

/// Non-empty lines that are not comments, split into tokens.
fn records(text: &str) -> impl Iterator<Item = (&str, Vec<&str>)> {
    text.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(|line| (line, line.split_whitespace().collect()))
}

impl NetworkSpec {
    pub fn parse_topology(&mut self, text: &str) -> Result<()> {
        for (line, tokens) in records(text) {
            let [a, pa, b, pb] = tokens[..] else {
                return Err(Error::parse("link", line));
            };
            self.links.push((Position::new(a, pa), Position::new(b, pb)));
        }
        Ok(())
    }

    pub fn parse_devices(&mut self, text: &str) -> Result<()> {
        for (line, tokens) in records(text) {
            let [device] = tokens[..] else {
                return Err(Error::parse("device", line));
            };
            self.devices.push(device.to_string());
        }
        Ok(())
    }

    pub fn parse_vlans(&mut self, text: &str) -> Result<()> {
        for (line, tokens) in records(text) {
            let [device, vlan, ports @ ..] = &tokens[..] else {
                return Err(Error::parse("vlan", line));
            };
            if ports.is_empty() {
                return Err(Error::parse("vlan", line));
            }
            let ports = ports.iter().map(|p| p.to_string()).collect();
            self.vlans.push((device.to_string(), vlan.to_string(), ports));
        }
        Ok(())
    }

    pub fn parse_acls(&mut self, text: &str) -> Result<()> {
        for (line, tokens) in records(text) {
            let [device, acl] = tokens[..] else {
                return Err(Error::parse("acl", line));
            };
            self.acls.push((device.to_string(), acl.to_string()));
        }
        Ok(())
    }

    pub fn parse_nats(&mut self, text: &str) -> Result<()> {
        for (line, tokens) in records(text) {
            let [device, port] = tokens[..] else {
                return Err(Error::parse("nat", line));
            };
            self.nats.push((device.to_string(), port.to_string()));
        }
        Ok(())
    }

    /// Read `topology` and, when present, `devices`, `vlans`, `acls` and `nats` from `dir`.
    pub fn from_dir(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref();
        let mut spec = Self::default();
        spec.parse_topology(&fs::read_to_string(dir.join("topology"))?)?;

        let optional: [(&str, fn(&mut Self, &str) -> Result<()>); 4] = [
            ("devices", Self::parse_devices),
            ("vlans", Self::parse_vlans),
            ("acls", Self::parse_acls),
            ("nats", Self::parse_nats),
        ];
        for (file, parse) in optional {
            let path = dir.join(file);
            if path.exists() {
                parse(&mut spec, &fs::read_to_string(&path)?)?;
            } else {
                debug!("{} not found, skipping", path.display());
            }
        }

        info!(
            "loaded {}: {} links, {} devices, {} vlans, {} acls, {} nats",
            dir.display(),
            spec.links.len(),
            spec.devices.len(),
            spec.vlans.len(),
            spec.acls.len(),
            spec.nats.len()
        );
        Ok(spec)
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Op {
    Insert,
    Remove,
}

impl Display for Op {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Op::Insert => write!(f, "+"),
            Op::Remove => write!(f, "-"),
        }
    }
}

/// One line of an update stream: `<+|-> <forward|acl|nat> <target> <fields...>`.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Update {
    pub op: Op,
    pub kind: ElementKind,
    pub target: String,
    /// The type-specific rule fields, whitespace-normalised.
    pub rule: String,
}

impl FromStr for Update {
    type Err = Error;

    fn from_str(line: &str) -> Result<Self> {
        let bad = || Error::parse("update", line);
        let mut tokens = line.split_whitespace();
        let op = match tokens.next() {
            Some("+") => Op::Insert,
            Some("-") => Op::Remove,
            _ => return Err(bad()),
        };
        let kind: ElementKind = tokens.next().ok_or_else(bad)?.parse().map_err(|_| bad())?;
        let target = tokens.next().ok_or_else(bad)?.to_string();
        let rule = tokens.collect::<Vec<_>>().join(" ");
        if rule.is_empty() {
            return Err(bad());
        }
        Ok(Update { op, kind, target, rule })
    }
}

impl Display for Update {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {} {} {}", self.op, self.kind, self.target, self.rule)
    }
}

/// Update lines of a file, comments and blank lines removed.
pub fn read_updates(path: impl AsRef<Path>) -> Result<Vec<String>> {
    let text = fs::read_to_string(path)?;
    Ok(records(&text).map(|(line, _)| line.to_string()).collect())
}
