use fabric::cluster::{
  elect_leader, Group, GroupConfig, LivenessState, Node, NodeConfig, Placement, ALL,
};
use fabric::core::{short_id, NodeAddress, ShortId};
use fabric::testkit::{
  logging, FailureConfig, FailureConfigMap, LocalNetwork, Reconfigured, RecordingStore,
};
use itertools::Itertools;
use std::time::Duration;
use tokio::time::sleep;

const G: &str = "g";

fn addr(port: u16) -> NodeAddress {
  NodeAddress::new("127.0.0.1", port)
}

fn view_of(addrs: &[NodeAddress]) -> Group {
  addrs
    .iter()
    .map(|a| (short_id(a).unwrap(), a.clone()))
    .collect()
}

async fn everyone_sees(nodes: &[&Node], sid: &ShortId, state: LivenessState) -> bool {
  for node in nodes {
    if node.handle().liveness(sid).await.unwrap() != Some(state) {
      return false;
    }
  }
  true
}

async fn evicted_everywhere(nodes: &[&Node], sid: &ShortId) -> bool {
  for node in nodes {
    for gid in &[G, ALL] {
      if node.handle().get_group(gid).await.unwrap().contains_key(sid) {
        return false;
      }
    }
  }
  true
}

async fn run_crash_scenario(hash: Placement, base: u16) {
  logging::init();
  let net = LocalNetwork::new();
  let (rtx, rrx) = crossbeam::channel::unbounded::<Reconfigured>();
  let addrs = (base..base + 3).map(addr).collect_vec();
  let view = view_of(&addrs);
  let nodes = addrs
    .iter()
    .map(|a| {
      let mut config = NodeConfig::new(a.clone());
      config.seed = Some(a.port as u64);
      let store = RecordingStore::new(short_id(a).unwrap(), rtx.clone());
      net.spawn(config, vec![store]).unwrap()
    })
    .collect_vec();
  for node in &nodes {
    node.handle().put_group(&GroupConfig::from(ALL), &view).await.unwrap();
    node.handle().put_group(&GroupConfig::new(G, hash), &view).await.unwrap();
  }

  let c = nodes[2].handle().sid().clone();
  let survivors = [&nodes[0], &nodes[1]];
  let mut introduced = false;
  for _ in 0..20 {
    sleep(Duration::from_secs(1)).await;
    if everyone_sees(&survivors, &c, LivenessState::Alive).await {
      introduced = true;
      break;
    }
  }
  assert!(introduced, "gossip never introduced C");
  assert_eq!(rrx.try_iter().count(), 0);

  println!("KILLING node {}", c);
  assert!(net.crash(&addrs[2]));
  let mut evicted = false;
  for _ in 0..40 {
    sleep(Duration::from_secs(1)).await;
    if evicted_everywhere(&survivors, &c).await {
      evicted = true;
      break;
    }
  }
  assert!(evicted, "C was never evicted");
  sleep(Duration::from_secs(5)).await;

  let new_view = view.without(&c);
  for node in &survivors {
    assert_eq!(node.handle().get_group(G).await.unwrap(), new_view);
    let state = node.handle().liveness(&c).await.unwrap();
    assert!(state.is_none() || state == Some(LivenessState::RegisteredFailure));
  }
  let reconfs = rrx.try_iter().collect_vec();
  for (gid, config) in &[(G, GroupConfig::new(G, hash)), (ALL, GroupConfig::from(ALL))] {
    let led = reconfs.iter().filter(|r| r.gid == *gid).collect_vec();
    assert_eq!(led.len(), 1, "reconfigurations of {}: {:?}", gid, led);
    assert_eq!(led[0].by, elect_leader(config, &c, &new_view).unwrap());
    assert_eq!(led[0].old, view);
  }
  net.shutdown();
}

#[tokio::test(start_paused = true)]
async fn crash_naive() {
  run_crash_scenario(Placement::Naive, 7400).await;
}

#[tokio::test(start_paused = true)]
async fn crash_consistent() {
  run_crash_scenario(Placement::Consistent, 7410).await;
}

#[tokio::test(start_paused = true)]
async fn crash_rendezvous() {
  run_crash_scenario(Placement::Rendezvous, 7420).await;
}

#[tokio::test(start_paused = true)]
async fn healthy_cluster_stays_intact() {
  logging::init();
  let net = LocalNetwork::new();
  let addrs = (7430..7434).map(addr).collect_vec();
  let view = view_of(&addrs);
  let nodes = addrs
    .iter()
    .map(|a| net.spawn(NodeConfig::new(a.clone()), vec![]).unwrap())
    .collect_vec();
  for node in &nodes {
    node.handle().put_group(&GroupConfig::from(ALL), &view).await.unwrap();
  }
  sleep(Duration::from_secs(60)).await;
  for node in &nodes {
    assert_eq!(node.handle().get_group(ALL).await.unwrap(), view);
    for sid in view.keys() {
      // A peer may be mid-confirmation, but nobody is ever declared failed.
      let state = node.handle().liveness(sid).await.unwrap();
      assert!(matches!(state, Some(LivenessState::Alive) | Some(LivenessState::Pinging)));
    }
  }
  net.shutdown();
}

#[tokio::test(start_paused = true)]
async fn lossy_cluster_stays_intact() {
  logging::init();
  let mut fail_map = FailureConfigMap::default();
  fail_map.cluster_wide = FailureConfig {
    drop_prob: 0.2,
    delay: Some((Duration::from_millis(10), Duration::from_millis(200))),
  };
  let net = LocalNetwork::with_failures(fail_map);
  let (rtx, rrx) = crossbeam::channel::unbounded::<Reconfigured>();
  let addrs = (7440..7445).map(addr).collect_vec();
  let view = view_of(&addrs);
  let nodes = addrs
    .iter()
    .map(|a| {
      let store = RecordingStore::new(short_id(a).unwrap(), rtx.clone());
      net.spawn(NodeConfig::new(a.clone()), vec![store]).unwrap()
    })
    .collect_vec();
  for node in &nodes {
    node.handle().put_group(&GroupConfig::from(ALL), &view).await.unwrap();
    node.handle().put_group(&GroupConfig::new(G, Placement::Consistent), &view).await.unwrap();
  }

  // Lost gossip and lost pings only ever delay evidence; a live peer is never evicted.
  for _ in 0..12 {
    sleep(Duration::from_secs(10)).await;
    for node in &nodes {
      assert_eq!(node.handle().get_group(ALL).await.unwrap(), view);
      assert_eq!(node.handle().get_group(G).await.unwrap(), view);
    }
  }
  for node in &nodes {
    for sid in view.keys() {
      let state = node.handle().liveness(sid).await.unwrap();
      assert!(matches!(state, Some(LivenessState::Alive) | Some(LivenessState::Pinging)));
    }
  }
  assert_eq!(rrx.try_iter().count(), 0);
  net.shutdown();
}
