use crate::cluster::{send_to_group, GossipConfig, Group, GroupResult};
use crate::core::{message_id, Digest, FabricError, Result, ShortId, Transport};
use linked_hash_map::LinkedHashMap;
use rand::rngs::SmallRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::cmp::min;
use tracing::trace;

pub const GOSSIP_SERVICE: &str = "gossip";
pub const GOSSIP_RECV: &str = "recv";

/// Which service and method a gossip message should be delivered to on each receiver.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct GossipTarget {
  pub service: String,
  pub method: String,
}
impl GossipTarget {
  pub fn new<S: Into<String>, M: Into<String>>(service: S, method: M) -> GossipTarget {
    GossipTarget {
      service: service.into(),
      method: method.into(),
    }
  }
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct GossipMessage {
  pub config: GossipTarget,
  /// The arguments handed to the target method.
  pub message: Vec<Value>,
  pub gid: String,
  pub gossip_id: Digest,
}

/// Probabilistic broadcast over a group, and the duplicate filter for the receiving side.
///
/// Each message goes to `fanout(size)` members picked by a Fisher-Yates shuffle. Nothing guarantees
/// a receiver sees a message exactly once: relays can bring it back. Receivers call
/// [`Gossiper::observe`] to drop ids they have already handled, for as long as the id stays in the
/// bounded seen-set.
pub struct Gossiper {
  config: GossipConfig,
  rng: SmallRng,
  seen: LinkedHashMap<Digest, u64>,
}
impl Gossiper {
  pub fn new(config: GossipConfig, seed: Option<u64>) -> Gossiper {
    let rng = match seed {
      Some(s) => SmallRng::seed_from_u64(s),
      None => SmallRng::from_entropy(),
    };
    Gossiper {
      config: config,
      rng: rng,
      seen: LinkedHashMap::new(),
    }
  }

  pub fn config(&self) -> &GossipConfig {
    &self.config
  }

  /// A uniformly random subset of `group` of size `fanout(group.len())`, without repeats.
  pub fn select(&mut self, group: &Group) -> Group {
    let amount = self.config.fanout.count(group.len());
    self.pick(group, amount)
  }

  /// Like `select`, but never picks `me`. The fanout is still counted over the whole group, so a
  /// two-member group always reaches the other member.
  pub fn select_peers(&mut self, group: &Group, me: &ShortId) -> Group {
    let peers = group.without(me);
    let amount = min(self.config.fanout.count(group.len()), peers.len());
    self.pick(&peers, amount)
  }

  fn pick(&mut self, group: &Group, amount: usize) -> Group {
    let mut members = group.iter().map(|(sid, addr)| (sid.clone(), addr.clone())).collect::<Vec<_>>();
    let (chosen, _) = members.partial_shuffle(&mut self.rng, amount);
    chosen.iter().cloned().collect()
  }

  /// Wraps `message` with a fresh gossip id.
  pub fn prepare(&self, gid: &str, target: GossipTarget, message: Vec<Value>) -> Result<GossipMessage> {
    Ok(GossipMessage {
      gossip_id: message_id(&message)?,
      config: target,
      message: message,
      gid: gid.to_string(),
    })
  }

  /// Picks targets from `group` and sends them `message`, returning once every target has answered
  /// or failed. An empty group succeeds with nothing sent.
  pub async fn send<T: Transport + ?Sized>(
    &mut self,
    transport: &T,
    group: &Group,
    gid: &str,
    target: GossipTarget,
    message: Vec<Value>,
  ) -> Result<GroupResult> {
    let chosen = self.select(group);
    let msg = self.prepare(gid, target, message)?;
    Ok(disseminate(transport, &chosen, &msg).await)
  }

  /// Records a sighting of `id` at `epoch`. Returns `true` only the first time the id is seen while
  /// it is still remembered.
  pub fn observe(&mut self, id: &Digest, epoch: u64) -> bool {
    if self.seen.contains_key(id) {
      return false;
    }
    self.seen.insert(id.clone(), epoch);
    while self.seen.len() > self.config.seen_capacity {
      self.seen.pop_front();
    }
    true
  }

  /// Forgets ids seen more than `seen_ttl` epochs before `epoch`.
  pub fn expire(&mut self, epoch: u64) {
    let ttl = self.config.seen_ttl;
    while let Some((_, seen_at)) = self.seen.front() {
      if seen_at + ttl >= epoch {
        break;
      }
      self.seen.pop_front();
    }
  }

  pub fn remembered(&self) -> usize {
    self.seen.len()
  }
}

/// Delivers an already prepared message to every member of `chosen`.
pub async fn disseminate<T: Transport + ?Sized>(
  transport: &T,
  chosen: &Group,
  msg: &GossipMessage,
) -> GroupResult {
  let payload = match serde_json::to_value(msg) {
    Ok(v) => v,
    Err(e) => {
      let mut out = GroupResult::default();
      for sid in chosen.keys() {
        out.errors.insert(sid.clone(), FabricError::MalformedResponse(e.to_string()));
      }
      return out;
    }
  };
  trace!(gid = %msg.gid, id = %msg.gossip_id, targets = chosen.len(), "gossiping");
  send_to_group(
    transport,
    vec![payload],
    GOSSIP_SERVICE,
    GOSSIP_RECV,
    chosen,
    Some(msg.gid.as_str()),
    None,
  )
  .await
}

#[cfg(test)]
use crate::cluster::Fanout;
#[cfg(test)]
use crate::core::{short_id, NodeAddress};

#[cfg(test)]
fn group_of(n: u16) -> Group {
  (0..n)
    .map(|i| NodeAddress::new("127.0.0.1", 7000 + i))
    .map(|a| (short_id(&a).unwrap(), a))
    .collect()
}

#[test]
fn test_select_fanout_no_repeats() {
  let mut g = Gossiper::new(GossipConfig::default(), Some(7));
  let group = group_of(8);
  for _ in 0..50 {
    let chosen = g.select(&group);
    assert_eq!(chosen.len(), 3);
    assert!(chosen.keys().all(|sid| group.contains_key(sid)));
  }
  assert!(g.select(&Group::new()).is_empty());
}

#[test]
fn test_select_covers_group() {
  let mut g = Gossiper::new(GossipConfig::default(), Some(11));
  let group = group_of(8);
  let mut hit = std::collections::BTreeSet::new();
  for _ in 0..200 {
    hit.extend(g.select(&group).keys().cloned());
  }
  assert_eq!(hit.len(), 8);
}

#[test]
fn test_select_peers_skips_self() {
  let mut g = Gossiper::new(GossipConfig::default(), Some(3));
  let pair = group_of(2);
  let (me, other) = {
    let mut keys = pair.keys().cloned();
    (keys.next().unwrap(), keys.next().unwrap())
  };
  for _ in 0..20 {
    let chosen = g.select_peers(&pair, &me);
    assert_eq!(chosen.keys().collect::<Vec<_>>(), vec![&other]);
  }
  let group = group_of(8);
  let me = group.keys().next().unwrap().clone();
  for _ in 0..50 {
    let chosen = g.select_peers(&group, &me);
    assert_eq!(chosen.len(), 3);
    assert!(!chosen.contains_key(&me));
  }
  let alone = group_of(1);
  let me = alone.keys().next().unwrap().clone();
  assert!(g.select_peers(&alone, &me).is_empty());
}

#[test]
fn test_seen_set_dedup_and_expiry() {
  let mut cfg = GossipConfig::default();
  cfg.seen_capacity = 3;
  cfg.seen_ttl = 3;
  cfg.fanout = Fanout::All;
  let mut g = Gossiper::new(cfg, Some(1));
  let ids = ["a", "b", "c", "d"]
    .iter()
    .map(|s| message_id(s).unwrap())
    .collect::<Vec<_>>();
  assert!(g.observe(&ids[0], 0));
  assert!(!g.observe(&ids[0], 0));
  assert!(g.observe(&ids[1], 1));
  assert!(g.observe(&ids[2], 2));
  // Over capacity: the oldest id is forgotten.
  assert!(g.observe(&ids[3], 2));
  assert_eq!(g.remembered(), 3);
  assert!(!g.observe(&ids[3], 2));
  // b (epoch 1) expires at epoch 5, c and d (epoch 2) survive until epoch 6.
  g.expire(5);
  assert_eq!(g.remembered(), 2);
  assert!(!g.observe(&ids[2], 5));
  g.expire(6);
  assert_eq!(g.remembered(), 0);
  assert!(g.observe(&ids[1], 6));
}
