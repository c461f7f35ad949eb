use crate::cluster::DetectorConfig;
use crate::core::{FabricError, Result, ShortId};
use serde::{Deserialize, Serialize};
use std::cmp::min;
use std::collections::BTreeMap;
use tracing::{debug, trace};

use LivenessState::*;

#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, Serialize, Deserialize)]
pub enum LivenessState {
  Alive,
  Pinging,
  DeclaredFailure,
  RegisteredFailure,
}

/// What one node believes about one peer.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct LivenessRecord {
  pub state: LivenessState,
  /// Consecutive epochs without fresh evidence.
  pub staleness: u64,
  /// The epoch the failure was registered in. Only set in `RegisteredFailure`.
  pub epoch: Option<u64>,
}
impl LivenessRecord {
  fn alive(staleness: u64) -> LivenessRecord {
    LivenessRecord {
      state: Alive,
      staleness: staleness,
      epoch: None,
    }
  }
}

/// `{sid: staleness}` for every peer the sender currently believes alive, itself included.
pub type AliveVector = BTreeMap<ShortId, u64>;

/// Work the detector wants done on its behalf. It never touches the network itself.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum DetectorAction {
  /// Send a direct confirmation request to the peer.
  Ping(ShortId),
  /// The peer is to be declared failed: broadcast and register it.
  Declare(ShortId),
  /// Disseminate the alive vector over the monitored group.
  Gossip(AliveVector),
}

/// The epoch-driven liveness state machine for one node.
///
/// | state             | every epoch                  | leaves when                                  |
/// |-------------------|------------------------------|----------------------------------------------|
/// | Alive             | staleness += 1 (not for self)| staleness >= ping_threshold: Pinging + ping  |
/// | Pinging           | staleness += 1               | confirmed: Alive; staleness >= fail_threshold: DeclaredFailure |
/// | DeclaredFailure   | asks to be declared          | registered: RegisteredFailure                |
/// | RegisteredFailure | nothing                      | epoch + fail_cooldown < current: forgotten   |
///
/// Gossip can only make the detector more confident: a received staleness replaces the local one
/// only when it is smaller, so duplicated or reordered gossip converges to the same table.
pub struct FailureDetector {
  me: ShortId,
  config: DetectorConfig,
  epoch: u64,
  records: BTreeMap<ShortId, LivenessRecord>,
}
impl FailureDetector {
  pub fn new(me: ShortId, config: DetectorConfig) -> FailureDetector {
    let mut records = BTreeMap::new();
    records.insert(me.clone(), LivenessRecord::alive(0));
    FailureDetector {
      me: me,
      config: config,
      epoch: 0,
      records: records,
    }
  }

  pub fn me(&self) -> &ShortId {
    &self.me
  }

  pub fn epoch(&self) -> u64 {
    self.epoch
  }

  pub fn config(&self) -> &DetectorConfig {
    &self.config
  }

  pub fn record(&self, sid: &ShortId) -> Option<&LivenessRecord> {
    self.records.get(sid)
  }

  pub fn state(&self, sid: &ShortId) -> Option<LivenessState> {
    self.records.get(sid).map(|r| r.state)
  }

  pub fn known(&self) -> usize {
    self.records.len()
  }

  /// Advances one epoch. Fails only if this node finds itself `Pinging`.
  pub fn tick(&mut self) -> Result<Vec<DetectorAction>> {
    self.epoch += 1;
    let mut actions = Vec::new();
    let mut forget = Vec::new();
    let (cooldown, now) = (self.config.fail_cooldown, self.epoch);
    for (sid, rec) in self.records.iter_mut() {
      let is_me = *sid == self.me;
      match rec.state {
        Alive => {
          if is_me {
            continue;
          }
          rec.staleness += 1;
          if rec.staleness >= self.config.ping_threshold {
            debug!(sid = %sid, epoch = self.epoch, "no evidence, pinging");
            rec.state = Pinging;
            rec.staleness = 0;
            actions.push(DetectorAction::Ping(sid.clone()));
          }
        }
        Pinging => {
          if is_me {
            return Err(FabricError::StaleInvariantViolation(sid.clone()));
          }
          rec.staleness += 1;
          if rec.staleness >= self.config.fail_threshold {
            debug!(sid = %sid, epoch = self.epoch, "unconfirmed, declaring failure");
            rec.state = DeclaredFailure;
            actions.push(DetectorAction::Declare(sid.clone()));
          }
        }
        DeclaredFailure => actions.push(DetectorAction::Declare(sid.clone())),
        RegisteredFailure => {
          if rec.epoch.map_or(true, |e| e + cooldown < now) {
            forget.push(sid.clone());
          }
        }
      }
    }
    for sid in forget {
      trace!(sid = %sid, "forgetting registered failure");
      self.records.remove(&sid);
    }
    actions.push(DetectorAction::Gossip(self.alive_vector()));
    Ok(actions)
  }

  pub fn alive_vector(&self) -> AliveVector {
    self
      .records
      .iter()
      .filter(|(_, r)| r.state == Alive)
      .map(|(sid, r)| (sid.clone(), r.staleness))
      .collect()
  }

  /// Merges a peer's alive vector. Returns the ids seen for the first time.
  pub fn receive_status(&mut self, vector: &AliveVector) -> Vec<ShortId> {
    let mut discovered = Vec::new();
    for (sid, reported) in vector {
      match self.records.get_mut(sid) {
        None => {
          trace!(sid = %sid, staleness = reported, "discovered");
          self.records.insert(sid.clone(), LivenessRecord::alive(*reported));
          discovered.push(sid.clone());
        }
        Some(rec) => match rec.state {
          Alive => rec.staleness = min(rec.staleness, *reported),
          Pinging => {
            debug!(sid = %sid, "gossip while pinging, alive again");
            rec.state = Alive;
            rec.staleness = *reported;
          }
          DeclaredFailure | RegisteredFailure => {}
        },
      }
    }
    discovered
  }

  /// Drops everything known about a peer, as if it had never been gossiped. This node's own record
  /// is never dropped.
  pub fn forget(&mut self, sid: &ShortId) -> bool {
    if *sid == self.me {
      return false;
    }
    self.records.remove(sid).is_some()
  }

  /// A confirmation ping came back. Only applies if the peer is still `Pinging`, so a late answer
  /// cannot resurrect a peer that has since been declared failed.
  pub fn confirm(&mut self, sid: &ShortId) -> bool {
    match self.records.get_mut(sid) {
      Some(rec) if rec.state == Pinging => {
        debug!(sid = %sid, "ping confirmed");
        rec.state = Alive;
        rec.staleness = 0;
        true
      }
      _ => false,
    }
  }

  /// Marks `sid` as a registered failure. Returns `false`, changing nothing, if `sid` is unknown or
  /// already registered; the caller must then skip broadcasting and reconfiguring.
  pub fn register_failure(&mut self, sid: &ShortId) -> bool {
    let epoch = self.epoch;
    match self.records.get_mut(sid) {
      Some(rec) if rec.state != RegisteredFailure => {
        rec.state = RegisteredFailure;
        rec.epoch = Some(epoch);
        true
      }
      _ => false,
    }
  }
}

#[cfg(test)]
use maplit::btreemap;

#[cfg(test)]
fn sid(s: &str) -> ShortId {
  ShortId::from(s)
}

#[cfg(test)]
fn detector(ping: u64, fail: u64) -> FailureDetector {
  let mut cfg = DetectorConfig::default();
  cfg.ping_threshold = ping;
  cfg.fail_threshold = fail;
  cfg.fail_cooldown = 2;
  FailureDetector::new(sid("aaaaa"), cfg)
}

#[cfg(test)]
fn non_gossip(actions: Vec<DetectorAction>) -> Vec<DetectorAction> {
  actions
    .into_iter()
    .filter(|a| !matches!(a, DetectorAction::Gossip(_)))
    .collect()
}

#[test]
fn test_state_machine_progression() {
  let mut fd = detector(3, 2);
  fd.receive_status(&btreemap! { sid("bbbbb") => 0 });
  assert!(non_gossip(fd.tick().unwrap()).is_empty());
  assert!(non_gossip(fd.tick().unwrap()).is_empty());
  assert_eq!(fd.state(&sid("bbbbb")), Some(Alive));
  assert_eq!(
    non_gossip(fd.tick().unwrap()),
    vec![DetectorAction::Ping(sid("bbbbb"))]
  );
  assert_eq!(fd.record(&sid("bbbbb")).unwrap().staleness, 0);
  assert_eq!(fd.state(&sid("bbbbb")), Some(Pinging));
  assert!(non_gossip(fd.tick().unwrap()).is_empty());
  assert_eq!(
    non_gossip(fd.tick().unwrap()),
    vec![DetectorAction::Declare(sid("bbbbb"))]
  );
  assert_eq!(fd.state(&sid("bbbbb")), Some(DeclaredFailure));
  assert!(fd.register_failure(&sid("bbbbb")));
  let rec = fd.record(&sid("bbbbb")).unwrap();
  assert_eq!(rec.state, RegisteredFailure);
  assert_eq!(rec.epoch, Some(5));
}

#[test]
fn test_self_never_goes_stale() {
  let mut fd = detector(1, 1);
  for _ in 0..10 {
    let actions = fd.tick().unwrap();
    assert_eq!(
      actions,
      vec![DetectorAction::Gossip(btreemap! { sid("aaaaa") => 0 })]
    );
  }
}

#[test]
fn test_self_pinging_is_fatal() {
  let mut fd = detector(3, 2);
  fd.records.get_mut(&sid("aaaaa")).unwrap().state = Pinging;
  assert!(matches!(fd.tick(), Err(FabricError::StaleInvariantViolation(_))));
}

#[test]
fn test_receive_status_merge() {
  let mut fd = detector(5, 2);
  let found = fd.receive_status(&btreemap! { sid("bbbbb") => 4, sid("ccccc") => 1 });
  assert_eq!(found, vec![sid("bbbbb"), sid("ccccc")]);
  // Known alive peers keep the smaller staleness.
  fd.receive_status(&btreemap! { sid("bbbbb") => 2, sid("ccccc") => 3 });
  assert_eq!(fd.record(&sid("bbbbb")).unwrap().staleness, 2);
  assert_eq!(fd.record(&sid("ccccc")).unwrap().staleness, 1);
  // Duplicates change nothing.
  fd.receive_status(&btreemap! { sid("bbbbb") => 2, sid("ccccc") => 3 });
  assert_eq!(fd.record(&sid("bbbbb")).unwrap().staleness, 2);
}

#[test]
fn test_receive_status_revives_pinging() {
  let mut fd = detector(1, 3);
  fd.receive_status(&btreemap! { sid("bbbbb") => 0 });
  fd.tick().unwrap();
  assert_eq!(fd.state(&sid("bbbbb")), Some(Pinging));
  fd.receive_status(&btreemap! { sid("bbbbb") => 1 });
  let rec = fd.record(&sid("bbbbb")).unwrap();
  assert_eq!((rec.state, rec.staleness), (Alive, 1));
}

#[test]
fn test_registered_failures_ignore_gossip() {
  let mut fd = detector(3, 2);
  fd.receive_status(&btreemap! { sid("bbbbb") => 0 });
  assert!(fd.register_failure(&sid("bbbbb")));
  fd.receive_status(&btreemap! { sid("bbbbb") => 0 });
  assert_eq!(fd.state(&sid("bbbbb")), Some(RegisteredFailure));
  assert!(!fd.alive_vector().contains_key(&sid("bbbbb")));
}

#[test]
fn test_confirm_only_while_pinging() {
  let mut fd = detector(1, 1);
  fd.receive_status(&btreemap! { sid("bbbbb") => 0 });
  assert!(!fd.confirm(&sid("bbbbb")));
  fd.tick().unwrap();
  assert!(fd.confirm(&sid("bbbbb")));
  assert_eq!(fd.state(&sid("bbbbb")), Some(Alive));
  fd.tick().unwrap();
  fd.tick().unwrap();
  assert_eq!(fd.state(&sid("bbbbb")), Some(DeclaredFailure));
  // A late answer to the earlier ping must not undo the declaration.
  assert!(!fd.confirm(&sid("bbbbb")));
  assert!(!fd.confirm(&sid("zzzzz")));
}

#[test]
fn test_register_failure_idempotent() {
  let mut fd = detector(3, 2);
  assert!(!fd.register_failure(&sid("bbbbb")));
  fd.receive_status(&btreemap! { sid("bbbbb") => 0 });
  assert!(fd.register_failure(&sid("bbbbb")));
  assert!(!fd.register_failure(&sid("bbbbb")));
}

#[test]
fn test_cooldown_forgets() {
  let mut fd = detector(3, 2);
  fd.receive_status(&btreemap! { sid("bbbbb") => 0 });
  assert!(fd.register_failure(&sid("bbbbb")));
  // Registered at epoch 0 with a cooldown of 2: still known through epoch 2.
  fd.tick().unwrap();
  fd.tick().unwrap();
  assert_eq!(fd.state(&sid("bbbbb")), Some(RegisteredFailure));
  fd.tick().unwrap();
  assert_eq!(fd.state(&sid("bbbbb")), None);
  assert_eq!(fd.known(), 1);
}

#[test]
fn test_scenario_stale_peer_is_pinged() {
  let mut fd = detector(4, 2);
  fd.receive_status(&btreemap! { sid("aaaaa") => 0, sid("bbbbb") => 0 });
  fd.receive_status(&btreemap! { sid("ccccc") => 5 });
  let actions = fd.tick().unwrap();
  assert!(actions.contains(&DetectorAction::Ping(sid("ccccc"))));
  assert!(!actions.contains(&DetectorAction::Ping(sid("bbbbb"))));
  assert_eq!(fd.state(&sid("ccccc")), Some(Pinging));
  match actions.last() {
    Some(DetectorAction::Gossip(v)) => {
      assert_eq!(v, &btreemap! { sid("aaaaa") => 0, sid("bbbbb") => 1 });
    }
    other => panic!("expected gossip last, got {:?}", other),
  }
}

#[test]
fn test_forget_unreachable_peer() {
  let mut fd = detector(1, 1);
  fd.receive_status(&btreemap! { sid("bbbbb") => 0 });
  fd.tick().unwrap();
  assert_eq!(fd.state(&sid("bbbbb")), Some(Pinging));
  assert!(fd.forget(&sid("bbbbb")));
  assert!(!fd.forget(&sid("bbbbb")));
  assert!(!fd.forget(&sid("aaaaa")));
  // Nothing is left to declare.
  assert!(non_gossip(fd.tick().unwrap()).is_empty());
  assert!(!fd.register_failure(&sid("bbbbb")));
  // Fresh gossip brings it back as a newcomer.
  assert_eq!(fd.receive_status(&btreemap! { sid("bbbbb") => 0 }), vec![sid("bbbbb")]);
}
