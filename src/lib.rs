//! # ap-verify: incremental data-plane verification
//!
//! **`ap-verify`** checks the forwarding state of a network for loops and black holes
//! while rules are being inserted and removed, one update at a time.
//!
//! ## Atomic predicates
//!
//! Sets of packet headers are represented as BDDs over a 104-bit header
//! (destination IP, source IP, source port, destination port, protocol).
//! The verifier maintains the coarsest partition of the header space into
//! **atomic predicates** such that every port of every element forwards a union of them.
//! An update only moves a few predicates between ports, and only those need to be checked.
//!
//! ## Quick Start
//!
//! ```rust
//! use ap_verify::config::VerifierConfig;
//! use ap_verify::loader::NetworkSpec;
//! use ap_verify::network::Network;
//!
//! let mut spec = NetworkSpec::default();
//! spec.parse_topology("a eth0 b eth0\nb eth0 a eth0\n").unwrap();
//!
//! let mut net = Network::new("demo", VerifierConfig::default(), &spec).unwrap();
//! net.apply_line("+ forward a 10.0.0.0 8 eth0 8").unwrap();
//! let report = net.apply_line("+ forward b 10.0.0.0 8 eth0 8").unwrap();
//! assert_eq!(report.loops, 1);
//! ```
//!
//! ## Core Components
//!
//! - **[`bdd`]**: The BDD manager with complement edges, operation cache and garbage collection.
//! - **[`header`]**: The packet header layout and its encoders on top of the manager.
//! - **[`partition`]**: The atomic predicate partition and its merge index.
//! - **[`element`]**: Forwarding, ACL and NAT elements that classify rule updates.
//! - **[`checker`]** and **[`graph`]**: Loop and black-hole detection.
//! - **[`network`]**: Everything glued together behind the update interface.

pub mod bdd;
pub mod cache;
pub mod checker;
pub mod config;
pub mod element;
pub mod error;
pub mod graph;
pub mod header;
pub mod loader;
pub mod nat;
pub mod network;
pub mod partition;
pub mod reference;
pub mod report;
pub mod rule;
pub mod sat;
pub mod table;
pub mod topology;
pub mod trie;
pub mod utils;

pub use error::{Error, Result};
pub use network::Network;
