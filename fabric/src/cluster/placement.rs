use crate::cluster::{Group, NodeRing};
use crate::core::{id, node_id, Digest, FabricError, NodeAddress, NodeId, Result, ShortId};
use itertools::Itertools;
use serde::{Deserialize, Serialize};

/// Decides which member of a group is responsible for a key.
///
/// Every strategy first reduces the key to `K`, the integer prefix of `id(key)`, and each member to
/// the integer prefix of its [`NodeId`].
///
/// - `Naive`: sort the members and take the one at `K mod n`. Any membership change reshuffles
///   nearly every key.
/// - `Consistent`: the first member clockwise from `K` on a [`NodeRing`]. A membership change only
///   moves the keys adjacent to the changed member.
/// - `Rendezvous`: the member whose `id(kid ++ nid)` is largest. A membership change only moves the
///   keys the changed member owned or would now win.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Placement {
  Naive,
  Consistent,
  Rendezvous,
}
impl Default for Placement {
  fn default() -> Self {
    Placement::Naive
  }
}
impl Placement {
  /// The member of `group` responsible for `key`.
  pub fn locate<K: Serialize + ?Sized>(
    &self,
    key: &K,
    group: &Group,
  ) -> Result<(ShortId, NodeAddress)> {
    let kid = id(key)?;
    let nids = group.values().map(node_id).collect::<Result<Vec<_>>>()?;
    let nid = self.locate_id(&kid, &nids)?;
    let sid = nid.short();
    match group.get(&sid) {
      Some(addr) => Ok((sid, addr.clone())),
      None => Err(FabricError::NodeNotFound(nid.to_string())),
    }
  }

  /// The id in `nids` responsible for the key digest `kid`.
  pub fn locate_id(&self, kid: &Digest, nids: &[NodeId]) -> Result<NodeId> {
    if nids.is_empty() {
      return Err(FabricError::EmptyGroup);
    }
    match self {
      Placement::Naive => naive(kid, nids),
      Placement::Consistent => consistent(kid, nids),
      Placement::Rendezvous => rendezvous(kid, nids),
    }
  }
}

fn naive(kid: &Digest, nids: &[NodeId]) -> Result<NodeId> {
  let sorted = nids.iter().sorted_by(|a, b| a.short().cmp(&b.short())).collect_vec();
  let idx = kid.to_num() % sorted.len() as u64;
  Ok(sorted[idx as usize].clone())
}

fn consistent(kid: &Digest, nids: &[NodeId]) -> Result<NodeId> {
  let ring = nids.iter().collect::<NodeRing>();
  let sid = ring.owner(kid.to_num()).ok_or(FabricError::EmptyGroup)?;
  nids
    .iter()
    .find(|nid| &nid.short() == sid)
    .cloned()
    .ok_or_else(|| FabricError::NodeNotFound(sid.to_string()))
}

pub(in crate::cluster) fn combined_hash(kid: &Digest, nid: &NodeId) -> Result<u64> {
  Ok(id(&format!("{}{}", kid, nid))?.to_num())
}

fn rendezvous(kid: &Digest, nids: &[NodeId]) -> Result<NodeId> {
  let mut best: Option<(u64, &NodeId)> = None;
  for nid in nids {
    let score = combined_hash(kid, nid)?;
    // Strictly greater, so the first maximum wins ties.
    if best.map_or(true, |(top, _)| score > top) {
      best = Some((score, nid));
    }
  }
  best
    .map(|(_, nid)| nid.clone())
    .ok_or(FabricError::EmptyGroup)
}

#[cfg(test)]
use crate::core::short_id;

#[cfg(test)]
fn test_group(ports: std::ops::Range<u16>) -> Group {
  ports
    .map(|p| NodeAddress::new("127.0.0.1", p))
    .map(|a| (short_id(&a).unwrap(), a))
    .collect()
}

#[cfg(test)]
const ALL_STRATEGIES: [Placement; 3] = [
  Placement::Naive,
  Placement::Consistent,
  Placement::Rendezvous,
];

#[test]
fn test_placement_deterministic() {
  let group = test_group(8000..8010);
  for strategy in ALL_STRATEGIES.iter() {
    for key in &["alpha", "beta", "gamma", "delta"] {
      let first = strategy.locate(key, &group).unwrap();
      for _ in 0..5 {
        assert_eq!(strategy.locate(key, &group).unwrap(), first);
      }
      assert!(group.contains_key(&first.0));
    }
  }
}

#[test]
fn test_placement_empty_group() {
  let group = Group::new();
  for strategy in ALL_STRATEGIES.iter() {
    assert!(matches!(strategy.locate("k", &group), Err(FabricError::EmptyGroup)));
  }
}

#[test]
fn test_naive_modulo() {
  let group = test_group(8000..8005);
  let kid = id("some-key").unwrap();
  let sorted = group.keys().cloned().collect::<Vec<_>>();
  let expected = &sorted[(kid.to_num() % sorted.len() as u64) as usize];
  assert_eq!(&Placement::Naive.locate("some-key", &group).unwrap().0, expected);
}

#[test]
fn test_consistent_wraps_around() {
  let group = test_group(8000..8006);
  let nids = group.values().map(|a| node_id(a).unwrap()).collect::<Vec<_>>();
  let smallest = nids.iter().min_by_key(|n| n.to_num()).unwrap();
  let largest = nids.iter().map(|n| n.to_num()).max().unwrap();
  // Find a key whose value lies past every member on the ring.
  let key = (0..100_000)
    .map(|i| format!("key-{}", i))
    .find(|k| id(k).unwrap().to_num() > largest)
    .unwrap();
  let (sid, _) = Placement::Consistent.locate(&key, &group).unwrap();
  assert_eq!(sid, smallest.short());
}

#[test]
fn test_consistent_first_at_or_after_key() {
  let group = test_group(8000..8006);
  let kid = id("ring-key").unwrap();
  let mut points = group
    .values()
    .map(|a| node_id(a).unwrap())
    .map(|n| (n.to_num(), n.short()))
    .collect::<Vec<_>>();
  points.sort();
  let expected = points
    .iter()
    .find(|(n, _)| *n >= kid.to_num())
    .unwrap_or(&points[0]);
  assert_eq!(Placement::Consistent.locate("ring-key", &group).unwrap().0, expected.1);
}

#[test]
fn test_rendezvous_picks_max() {
  let group = test_group(8000..8008);
  for key in &["a", "b", "c", "d", "e"] {
    let kid = id(key).unwrap();
    let (sid, addr) = Placement::Rendezvous.locate(key, &group).unwrap();
    let winner = combined_hash(&kid, &node_id(&addr).unwrap()).unwrap();
    for other in group.values() {
      assert!(combined_hash(&kid, &node_id(other).unwrap()).unwrap() <= winner);
    }
    assert!(group.contains_key(&sid));
  }
}

#[test]
fn test_rendezvous_stable_on_removal() {
  let group = test_group(8000..8008);
  for key in &["apple", "banana", "cherry"] {
    let (winner, _) = Placement::Rendezvous.locate(key, &group).unwrap();
    for loser in group.keys().filter(|s| **s != winner) {
      let smaller = group.without(loser);
      assert_eq!(Placement::Rendezvous.locate(key, &smaller).unwrap().0, winner);
    }
  }
}

#[test]
fn test_placement_serde() {
  assert_eq!(serde_json::to_string(&Placement::Rendezvous).unwrap(), "\"rendezvous\"");
  let p: Placement = serde_json::from_str("\"consistent\"").unwrap();
  assert_eq!(p, Placement::Consistent);
}
