//! Token ring used for token-aware routing.

use std::collections::BTreeMap;

use cql_core::Token;

use super::node::NodeId;

/// Maps ring positions to the nodes owning them.
///
/// A node owning token `t` is the primary replica for every token in
/// `(previous token, t]`; the range wraps at the end of the ring.
#[derive(Debug, Clone, Default)]
pub struct TokenMap {
    ring: BTreeMap<Token, NodeId>,
}

impl TokenMap {
    /// Builds a ring from each node's owned tokens.
    pub fn build<'a>(nodes: impl IntoIterator<Item = (NodeId, &'a [Token])>) -> Self {
        let mut ring = BTreeMap::new();
        for (id, tokens) in nodes {
            for token in tokens {
                ring.insert(*token, id);
            }
        }
        Self { ring }
    }

    /// Returns true if no node announced tokens.
    pub fn is_empty(&self) -> bool {
        self.ring.is_empty()
    }

    /// Returns the number of tokens on the ring.
    pub fn len(&self) -> usize {
        self.ring.len()
    }

    /// Returns the primary owner of a token.
    pub fn owner(&self, token: Token) -> Option<NodeId> {
        self.ring
            .range(token..)
            .chain(self.ring.iter())
            .next()
            .map(|(_, id)| *id)
    }

    /// Returns up to `count` distinct nodes walking the ring from the owner
    /// of `token`, primary first.
    pub fn replicas(&self, token: Token, count: usize) -> Vec<NodeId> {
        let mut replicas = Vec::with_capacity(count);
        if count == 0 {
            return replicas;
        }
        for (_, id) in self.ring.range(token..).chain(self.ring.range(..token)) {
            if !replicas.contains(id) {
                replicas.push(*id);
                if replicas.len() == count {
                    break;
                }
            }
        }
        replicas
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ring() -> (TokenMap, NodeId, NodeId, NodeId) {
        let a = NodeId::next();
        let b = NodeId::next();
        let c = NodeId::next();
        let a_tokens = [Token(99)];
        let b_tokens = [Token(199)];
        let c_tokens = [Token(-1)];
        let map = TokenMap::build([
            (a, &a_tokens[..]),
            (b, &b_tokens[..]),
            (c, &c_tokens[..]),
        ]);
        (map, a, b, c)
    }

    #[test]
    fn test_owner_of_range() {
        let (map, a, b, c) = ring();
        assert_eq!(map.owner(Token(0)), Some(a));
        assert_eq!(map.owner(Token(50)), Some(a));
        assert_eq!(map.owner(Token(99)), Some(a));
        assert_eq!(map.owner(Token(100)), Some(b));
        assert_eq!(map.owner(Token(-1)), Some(c));
    }

    #[test]
    fn test_owner_wraps_around() {
        let (map, _, _, c) = ring();
        assert_eq!(map.owner(Token(500)), Some(c));
        assert_eq!(map.owner(Token(i64::MAX)), Some(c));
    }

    #[test]
    fn test_replicas_are_distinct_and_ordered() {
        let (map, a, b, c) = ring();
        assert_eq!(map.replicas(Token(50), 2), vec![a, b]);
        assert_eq!(map.replicas(Token(150), 3), vec![b, c, a]);
        assert_eq!(map.replicas(Token(150), 10).len(), 3);
        assert!(map.replicas(Token(150), 0).is_empty());
    }

    #[test]
    fn test_vnodes_do_not_duplicate_replicas() {
        let a = NodeId::next();
        let b = NodeId::next();
        let a_tokens = [Token(10), Token(20)];
        let b_tokens = [Token(30)];
        let map = TokenMap::build([(a, &a_tokens[..]), (b, &b_tokens[..])]);

        assert_eq!(map.len(), 3);
        assert_eq!(map.replicas(Token(5), 2), vec![a, b]);
    }

    #[test]
    fn test_empty_ring() {
        let map = TokenMap::default();
        assert!(map.is_empty());
        assert_eq!(map.owner(Token(1)), None);
        assert!(map.replicas(Token(1), 3).is_empty());
    }
}
