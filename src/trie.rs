//! Binary prefix trie over destination IPv4 prefixes.
//!
//! Node `n` at depth `d` stands for one prefix of length `d`; rules for that
//! prefix hang off the node. Less specific prefixes are the ancestors of a node
//! and more specific ones live in its subtree, so both sets are found in
//! O(bits) plus the size of the subtree.

use crate::rule::Precedence;

pub type NodeId = usize;

const ROOT: NodeId = 0;

#[derive(Debug, Default)]
struct TrieNode {
    parent: Option<NodeId>,
    children: [Option<NodeId>; 2],
    rules: Vec<Precedence>,
}

#[derive(Debug)]
pub struct PrefixTrie {
    nodes: Vec<TrieNode>,
    free: Vec<NodeId>,
}

fn bit(prefix: u32, depth: u8) -> usize {
    ((prefix >> (31 - depth)) & 1) as usize
}

impl Default for PrefixTrie {
    fn default() -> Self {
        Self::new()
    }
}

impl PrefixTrie {
    pub fn new() -> Self {
        Self {
            nodes: vec![TrieNode::default()],
            free: Vec::new(),
        }
    }

    pub fn root(&self) -> NodeId {
        ROOT
    }

    /// Number of live nodes, the root included.
    pub fn len(&self) -> usize {
        self.nodes.len() - self.free.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 1 && self.nodes[ROOT].rules.is_empty()
    }

    pub fn find(&self, prefix: u32, len: u8) -> Option<NodeId> {
        let mut node = ROOT;
        for depth in 0..len {
            node = self.nodes[node].children[bit(prefix, depth)]?;
        }
        Some(node)
    }

    /// Node for `prefix/len`, creating the path to it as needed.
    pub fn insert(&mut self, prefix: u32, len: u8) -> NodeId {
        let mut node = ROOT;
        for depth in 0..len {
            let b = bit(prefix, depth);
            node = match self.nodes[node].children[b] {
                Some(child) => child,
                None => {
                    let child = self.alloc(node);
                    self.nodes[node].children[b] = Some(child);
                    child
                }
            };
        }
        node
    }

    fn alloc(&mut self, parent: NodeId) -> NodeId {
        let node = TrieNode {
            parent: Some(parent),
            ..TrieNode::default()
        };
        match self.free.pop() {
            Some(id) => {
                self.nodes[id] = node;
                id
            }
            None => {
                self.nodes.push(node);
                self.nodes.len() - 1
            }
        }
    }

    pub fn rules(&self, node: NodeId) -> &[Precedence] {
        &self.nodes[node].rules
    }

    pub fn add_rule(&mut self, node: NodeId, key: Precedence) {
        let rules = &mut self.nodes[node].rules;
        let pos = rules.partition_point(|k| *k < key);
        rules.insert(pos, key);
    }

    pub fn remove_rule(&mut self, node: NodeId, key: Precedence) -> bool {
        let rules = &mut self.nodes[node].rules;
        match rules.iter().position(|k| *k == key) {
            Some(pos) => {
                rules.remove(pos);
                true
            }
            None => false,
        }
    }

    /// Rules of the node, of every ancestor and of every descendant,
    /// highest precedence first.
    pub fn affected(&self, node: NodeId) -> Vec<Precedence> {
        let mut out = Vec::new();

        let mut cur = self.nodes[node].parent;
        while let Some(id) = cur {
            out.extend_from_slice(&self.nodes[id].rules);
            cur = self.nodes[id].parent;
        }

        let mut stack = vec![node];
        while let Some(id) = stack.pop() {
            out.extend_from_slice(&self.nodes[id].rules);
            stack.extend(self.nodes[id].children.iter().flatten());
        }

        out.sort_unstable();
        out
    }

    /// Release `node` and its ancestors while they carry neither rules nor children.
    pub fn prune(&mut self, node: NodeId) {
        let mut cur = node;
        while cur != ROOT {
            let n = &self.nodes[cur];
            if !n.rules.is_empty() || n.children.iter().any(Option::is_some) {
                break;
            }
            let Some(parent) = n.parent else { break };
            for child in self.nodes[parent].children.iter_mut() {
                if *child == Some(cur) {
                    *child = None;
                }
            }
            self.nodes[cur] = TrieNode::default();
            self.free.push(cur);
            cur = parent;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::header::parse_ip;

    fn ip(s: &str) -> u32 {
        parse_ip(s).unwrap()
    }

    #[test]
    fn test_find_and_insert() {
        let mut trie = PrefixTrie::new();
        assert_eq!(trie.find(0, 0), Some(trie.root()));
        assert_eq!(trie.find(ip("10.0.0.0"), 8), None);

        let n = trie.insert(ip("10.0.0.0"), 8);
        assert_eq!(trie.len(), 9);
        assert_eq!(trie.find(ip("10.0.0.0"), 8), Some(n));
        assert_eq!(trie.insert(ip("10.0.0.0"), 8), n);
        // Only the first `len` bits matter.
        assert_eq!(trie.find(ip("10.255.0.0"), 8), Some(n));
    }

    #[test]
    fn test_affected() {
        let mut trie = PrefixTrie::new();
        let root = trie.root();
        let n8 = trie.insert(ip("10.0.0.0"), 8);
        let n16 = trie.insert(ip("10.1.0.0"), 16);
        let n24 = trie.insert(ip("10.1.2.0"), 24);
        let other = trie.insert(ip("11.0.0.0"), 8);

        let k0 = Precedence::new(-1, 0);
        let k8 = Precedence::new(8, 1);
        let k16 = Precedence::new(16, 2);
        let k24 = Precedence::new(24, 3);
        let k_other = Precedence::new(8, 4);
        trie.add_rule(root, k0);
        trie.add_rule(n8, k8);
        trie.add_rule(n16, k16);
        trie.add_rule(n24, k24);
        trie.add_rule(other, k_other);

        assert_eq!(trie.affected(n16), vec![k24, k16, k8, k0]);
        assert_eq!(trie.affected(other), vec![k_other, k0]);
        assert_eq!(trie.affected(root).len(), 5);
    }

    #[test]
    fn test_prune() {
        let mut trie = PrefixTrie::new();
        let n8 = trie.insert(ip("10.0.0.0"), 8);
        let n16 = trie.insert(ip("10.1.0.0"), 16);
        let key = Precedence::new(8, 1);
        trie.add_rule(n8, key);

        trie.prune(n16);
        assert_eq!(trie.find(ip("10.1.0.0"), 16), None);
        assert_eq!(trie.find(ip("10.0.0.0"), 8), Some(n8));

        assert!(trie.remove_rule(n8, key));
        assert!(!trie.remove_rule(n8, key));
        trie.prune(n8);
        assert!(trie.is_empty());

        // Freed slots are reused.
        let again = trie.insert(ip("10.0.0.0"), 8);
        assert_eq!(trie.len(), 9);
        assert!(again < 17);
    }
}
