use fabric::cluster::{
  elect_leader, Group, GroupConfig, Node, NodeConfig, Placement, ALL, FD_SERVICE,
  GROUPS_SERVICE, REGISTER_FAILURE,
};
use fabric::core::{call, short_id, FabricError, NodeAddress, Remote};
use fabric::testkit::{logging, LocalNetwork, RecordingStore, RecordingTransport};
use itertools::Itertools;
use maplit::btreemap;
use serde_json::json;
use std::time::Duration;
use tokio::time::sleep;
use tokio_test::{assert_err, assert_ok};

fn addr(port: u16) -> NodeAddress {
  NodeAddress::new("127.0.0.1", port)
}

fn view_of(addrs: &[&NodeAddress]) -> Group {
  addrs
    .iter()
    .map(|a| (short_id(a).unwrap(), (*a).clone()))
    .collect()
}

#[tokio::test(start_paused = true)]
async fn registry_round_trips_over_the_network() {
  logging::init();
  let net = LocalNetwork::new();
  let (a, b, c) = (addr(7600), addr(7601), addr(7602));
  let _na = net.spawn(NodeConfig::new(a.clone()), vec![]).unwrap();
  let _nb = net.spawn(NodeConfig::new(b.clone()), vec![]).unwrap();
  let groups = |method: &str| Remote::new(b.clone(), GROUPS_SERVICE, method);

  let res = call(&*net, vec![json!("jobs"), json!(c)], &groups("add")).await;
  let added: Group = serde_json::from_value(assert_ok!(res)).unwrap();
  assert_eq!(added, view_of(&[&c]));

  let res = call(&*net, vec![json!("jobs")], &groups("get")).await;
  assert_eq!(serde_json::from_value::<Group>(assert_ok!(res)).unwrap(), added);

  let replacement = view_of(&[&a, &b]);
  let config = GroupConfig::new("jobs", Placement::Consistent);
  let args = vec![json!(config), json!(replacement)];
  assert_ok!(call(&*net, args, &groups("put")).await);
  let res = call(&*net, vec![json!("jobs")], &groups("get")).await;
  assert_eq!(serde_json::from_value::<Group>(assert_ok!(res)).unwrap(), replacement);

  let sid_a = short_id(&a).unwrap();
  let args = vec![json!("jobs"), json!(sid_a.as_str())];
  let res = call(&*net, args.clone(), &groups("rem")).await;
  assert_eq!(serde_json::from_value::<Group>(assert_ok!(res)).unwrap(), view_of(&[&b]));
  // Removing an absent member is fine; removing from an absent group is not.
  assert_ok!(call(&*net, args, &groups("rem")).await);
  let args = vec![json!("nope"), json!(sid_a.as_str())];
  let err = assert_err!(call(&*net, args, &groups("rem")).await);
  assert!(matches!(err, FabricError::GroupNotFound(_)));

  assert_ok!(call(&*net, vec![json!("jobs")], &groups("del")).await);
  let err = assert_err!(call(&*net, vec![json!("jobs")], &groups("get")).await);
  assert!(matches!(err, FabricError::GroupNotFound(_)));

  let bad = NodeAddress::new("", 7609);
  let err = assert_err!(call(&*net, vec![json!("jobs"), json!(bad)], &groups("add")).await);
  assert!(matches!(err, FabricError::InvalidAddress(_)));
  net.shutdown();
}

#[tokio::test(start_paused = true)]
async fn umbrella_fan_out_reaches_every_member() {
  logging::init();
  let net = LocalNetwork::new();
  let addrs = (7610..7614).map(addr).collect_vec();
  let nodes = addrs
    .iter()
    .map(|a| net.spawn(NodeConfig::new(a.clone()), vec![]).unwrap())
    .collect_vec();
  let all = view_of(&addrs.iter().collect_vec());
  nodes[0].handle().put_group(&GroupConfig::from(ALL), &all).await.unwrap();

  let worker = addr(7699);
  let res = nodes[0]
    .handle()
    .everywhere(ALL, "add", vec![json!("workers"), json!(worker)])
    .await
    .unwrap();
  assert!(res.errors.is_empty());
  assert_eq!(res.results.len(), 4);
  for node in &nodes {
    let workers = node.handle().get_group("workers").await.unwrap();
    assert_eq!(workers, view_of(&[&worker]));
  }

  // The umbrella view now travels too.
  let res = nodes[0]
    .handle()
    .everywhere(ALL, "put", vec![json!(GroupConfig::from(ALL)), json!(all)])
    .await
    .unwrap();
  assert_eq!(res.results.len(), 4);
  for node in &nodes {
    assert_eq!(node.handle().get_group(ALL).await.unwrap(), all);
  }

  net.crash(&addrs[3]);
  let res = nodes[0]
    .handle()
    .everywhere(ALL, "del", vec![json!("workers")])
    .await
    .unwrap();
  assert_eq!(res.results.len(), 3);
  assert!(matches!(
    res.errors.get(&short_id(&addrs[3]).unwrap()),
    Some(FabricError::Unreachable(_))
  ));
  net.shutdown();
}

#[tokio::test(start_paused = true)]
async fn register_failure_is_idempotent() {
  logging::init();
  let (transport, sent) = RecordingTransport::new();
  let (rtx, rrx) = crossbeam::channel::unbounded();
  let (a, b, c) = (addr(7620), addr(7621), addr(7622));
  let (sa, sb, sc) = (short_id(&a).unwrap(), short_id(&b).unwrap(), short_id(&c).unwrap());
  let node = Node::spawn(
    NodeConfig::new(a.clone()),
    transport,
    vec![RecordingStore::new(sa.clone(), rtx)],
  )
  .unwrap();
  let h = node.handle();
  let view = view_of(&[&a, &b, &c]);
  let g = GroupConfig::new("g", Placement::Rendezvous);
  h.put_group(&GroupConfig::from(ALL), &view).await.unwrap();
  h.put_group(&g, &view).await.unwrap();
  assert_eq!(h.receive_status(&btreemap! { sc.clone() => 0 }).await.unwrap(), 1);

  assert!(h.register_failure(&sc).await.unwrap());
  assert!(!h.register_failure(&sc).await.unwrap());
  sleep(Duration::from_millis(10)).await;

  let broadcasts = sent
    .try_iter()
    .filter(|s| s.remote.service == FD_SERVICE && s.remote.method == REGISTER_FAILURE)
    .collect_vec();
  assert_eq!(broadcasts.len(), 1);
  assert_eq!(broadcasts[0].remote.node, b);
  assert_eq!(broadcasts[0].args, vec![json!(sc.as_str())]);

  let survivors = view.without(&sc);
  assert_eq!(h.get_group("g").await.unwrap(), survivors);
  assert_eq!(h.get_group(ALL).await.unwrap(), survivors);
  let expected = [&g, &GroupConfig::from(ALL)]
    .iter()
    .filter(|config| elect_leader(config, &sc, &survivors).unwrap() == sa)
    .map(|config| config.gid.clone())
    .sorted()
    .collect_vec();
  let led = rrx.try_iter().map(|r| r.gid).sorted().collect_vec();
  assert_eq!(led, expected);
  assert!(!survivors.contains_key(&sc) && survivors.contains_key(&sb));
  node.stop();
}

#[tokio::test(start_paused = true)]
async fn unknown_failures_are_ignored() {
  let (transport, sent) = RecordingTransport::new();
  let a = addr(7630);
  let node = Node::spawn(NodeConfig::new(a.clone()), transport, vec![]).unwrap();
  let stranger = short_id(&addr(7631)).unwrap();
  assert!(!node.handle().register_failure(&stranger).await.unwrap());
  // Nobody gets to declare this node failed to itself either.
  assert!(!node.handle().register_failure(&short_id(&a).unwrap()).await.unwrap());
  sleep(Duration::from_millis(10)).await;
  assert_eq!(
    sent.try_iter().filter(|s| s.remote.method == REGISTER_FAILURE).count(),
    0
  );
  node.stop();
}

#[tokio::test(start_paused = true)]
async fn store_errors_do_not_undo_eviction() {
  let (transport, _sent) = RecordingTransport::new();
  let (rtx, rrx) = crossbeam::channel::unbounded();
  let (a, c) = (addr(7640), addr(7641));
  let (sa, sc) = (short_id(&a).unwrap(), short_id(&c).unwrap());
  let node = Node::spawn(
    NodeConfig::new(a.clone()),
    transport,
    vec![RecordingStore::failing(sa.clone(), rtx)],
  )
  .unwrap();
  let h = node.handle();
  let pair = view_of(&[&a, &c]);
  h.put_group(&GroupConfig::from(ALL), &pair).await.unwrap();
  h.put_group(&GroupConfig::from("pair"), &pair).await.unwrap();
  h.receive_status(&btreemap! { sc.clone() => 0 }).await.unwrap();

  // The only survivor leads both reconfigurations, and both fail.
  let err = assert_err!(h.register_failure(&sc).await);
  assert!(matches!(err, FabricError::Store(_)));
  assert_eq!(rrx.try_iter().count(), 2);
  assert_eq!(h.get_group("pair").await.unwrap(), view_of(&[&a]));
  assert_eq!(h.get_group(ALL).await.unwrap(), view_of(&[&a]));
  node.stop();
}

#[tokio::test(start_paused = true)]
async fn gossip_only_peers_are_never_declared() {
  let (transport, sent) = RecordingTransport::new();
  let (a, b, p) = (addr(7650), addr(7651), addr(7652));
  let node = Node::spawn(NodeConfig::new(a.clone()), transport, vec![]).unwrap();
  let h = node.handle();
  let all = view_of(&[&a, &b]);
  h.put_group(&GroupConfig::from(ALL), &all).await.unwrap();
  // P is heard of through gossip but belongs to no group, so there is nowhere to ping it.
  let sp = short_id(&p).unwrap();
  assert_eq!(h.receive_status(&btreemap! { sp.clone() => 0 }).await.unwrap(), 1);

  sleep(Duration::from_millis(6500)).await;
  let sent = sent.try_iter().collect_vec();
  assert!(sent.iter().all(|s| s.remote.node != p));
  assert_eq!(
    sent.iter().filter(|s| s.remote.method == REGISTER_FAILURE).count(),
    0
  );
  assert_eq!(h.liveness(&sp).await.unwrap(), None);
  assert_eq!(h.get_group(ALL).await.unwrap(), all);
  node.stop();
}
