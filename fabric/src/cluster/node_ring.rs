use crate::core::{NodeId, ShortId};
use std::collections::BTreeMap;

/// A consistent hashing ring. Each member sits at the integer value of its [`NodeId`], and a key
/// belongs to the first member at or after the key's own value, wrapping around past the largest.
#[derive(Clone, Debug, Default)]
pub struct NodeRing {
  pub(in crate::cluster) ring: BTreeMap<u64, ShortId>,
}
impl NodeRing {
  pub fn new() -> NodeRing {
    NodeRing {
      ring: BTreeMap::new(),
    }
  }

  pub fn insert(&mut self, nid: &NodeId) {
    self.ring.insert(nid.to_num(), nid.short());
  }

  pub fn remove(&mut self, nid: &NodeId) -> bool {
    self.ring.remove(&nid.to_num()).is_some()
  }

  pub fn len(&self) -> usize {
    self.ring.len()
  }

  pub fn is_empty(&self) -> bool {
    self.ring.is_empty()
  }

  pub fn owner(&self, key: u64) -> Option<&ShortId> {
    self
      .ring
      .range(key..)
      .chain(self.ring.range(..key))
      .map(|(_, sid)| sid)
      .next()
  }
}
impl<'a> std::iter::FromIterator<&'a NodeId> for NodeRing {
  fn from_iter<I: IntoIterator<Item = &'a NodeId>>(iter: I) -> Self {
    let mut ring = NodeRing::new();
    for nid in iter {
      ring.insert(nid);
    }
    ring
  }
}

#[cfg(test)]
use crate::core::{node_id, NodeAddress};

#[test]
fn test_node_ring() {
  let nids = (5000u16..5005u16)
    .map(|p| node_id(&NodeAddress::new("localhost", p)).unwrap())
    .collect::<Vec<_>>();
  let mut ring = nids.iter().collect::<NodeRing>();
  assert_eq!(ring.len(), 5);
  let mut points = nids.iter().map(|n| (n.to_num(), n.short())).collect::<Vec<_>>();
  points.sort();
  // Exactly on a member, between two members, and past the last one.
  assert_eq!(ring.owner(points[2].0), Some(&points[2].1));
  assert_eq!(ring.owner(points[2].0 + 1), Some(&points[3].1));
  assert_eq!(ring.owner(points[4].0 + 1), Some(&points[0].1));
  assert_eq!(ring.owner(0), Some(&points[0].1));
  for nid in nids.iter() {
    assert!(ring.remove(nid));
  }
  assert!(ring.is_empty());
  assert_eq!(ring.owner(42), None);
}
