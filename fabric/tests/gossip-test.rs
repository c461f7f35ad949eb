use fabric::cluster::{
  Fanout, GossipConfig, GossipMessage, GossipTarget, Gossiper, Group, GroupConfig, Node,
  NodeConfig, FD_SERVICE, GOSSIP_RECV, GOSSIP_SERVICE, RECEIVE_STATUS,
};
use fabric::core::{short_id, NodeAddress};
use fabric::testkit::{RecordingTransport, Sent};
use itertools::Itertools;
use maplit::btreemap;
use serde_json::{json, Value};
use std::collections::BTreeSet;
use std::time::Duration;
use tokio::time::sleep;

fn group_of(ports: std::ops::Range<u16>) -> Group {
  ports
    .map(|p| NodeAddress::new("127.0.0.1", p))
    .map(|a| (short_id(&a).unwrap(), a))
    .collect()
}

fn gossip_ids(sent: &[Sent]) -> Vec<GossipMessage> {
  sent
    .iter()
    .filter(|s| s.remote.service == GOSSIP_SERVICE && s.remote.method == GOSSIP_RECV)
    .map(|s| serde_json::from_value(s.args[0].clone()).unwrap())
    .collect()
}

#[tokio::test]
async fn fanout_three_of_eight_without_repeats() {
  let (transport, sent) = RecordingTransport::new();
  let group = group_of(7700..7708);
  let mut gossiper = Gossiper::new(GossipConfig::default(), Some(42));
  for round in 0..20 {
    let target = GossipTarget::new(FD_SERVICE, RECEIVE_STATUS);
    let res = gossiper
      .send(&*transport, &group, "g", target, vec![json!({ "round": round })])
      .await
      .unwrap();
    assert!(res.errors.is_empty());
    assert_eq!(res.results.len(), 3);

    let round_sent = sent.try_iter().collect_vec();
    assert_eq!(round_sent.len(), 3);
    let nodes = round_sent.iter().map(|s| s.remote.node.clone()).collect::<BTreeSet<_>>();
    assert_eq!(nodes.len(), 3);
    assert!(nodes.iter().all(|n| group.values().any(|a| a == n)));
    assert!(round_sent.iter().all(|s| s.remote.gid.as_deref() == Some("g")));

    let msgs = gossip_ids(&round_sent);
    assert!(msgs.iter().all(|m| m.gossip_id == msgs[0].gossip_id));
    assert_eq!(msgs[0].config, GossipTarget::new(FD_SERVICE, RECEIVE_STATUS));
    assert_eq!(msgs[0].message, vec![json!({ "round": round })]);
  }
}

#[tokio::test]
async fn empty_group_sends_nothing() {
  let (transport, sent) = RecordingTransport::new();
  let mut gossiper = Gossiper::new(GossipConfig::default(), None);
  let target = GossipTarget::new(FD_SERVICE, RECEIVE_STATUS);
  let res = gossiper
    .send(&*transport, &Group::new(), "g", target, vec![])
    .await
    .unwrap();
  assert!(res.is_empty());
  assert_eq!(sent.try_iter().count(), 0);
}

#[tokio::test(start_paused = true)]
async fn receiver_relays_once_and_drops_duplicates() {
  let (transport, sent) = RecordingTransport::new();
  let me = NodeAddress::new("127.0.0.1", 7710);
  let node = Node::spawn(NodeConfig::new(me.clone()), transport, vec![]).unwrap();
  let h = node.handle();
  let mut group = group_of(7711..7718);
  group.insert(h.sid().clone(), me);
  h.put_group(&GroupConfig::from("g"), &group).await.unwrap();

  let newcomer = short_id(&NodeAddress::new("127.0.0.1", 7750)).unwrap();
  let status = serde_json::to_value(btreemap! { newcomer.clone() => 0u64 }).unwrap();
  let msg = Gossiper::new(GossipConfig::default(), None)
    .prepare("g", GossipTarget::new(FD_SERVICE, RECEIVE_STATUS), vec![status])
    .unwrap();
  let wire = serde_json::to_value(&msg).unwrap();

  let first = h.serve(GOSSIP_SERVICE, GOSSIP_RECV, vec![wire.clone()]).await.unwrap();
  assert_eq!(first, json!(1));
  let second = h.serve(GOSSIP_SERVICE, GOSSIP_RECV, vec![wire]).await.unwrap();
  assert_eq!(second, Value::Null);
  sleep(Duration::from_millis(10)).await;

  let relayed = gossip_ids(&sent.try_iter().collect_vec())
    .into_iter()
    .filter(|m| m.gossip_id == msg.gossip_id)
    .count();
  assert_eq!(relayed, 3);
  assert_eq!(
    h.liveness(&newcomer).await.unwrap(),
    Some(fabric::cluster::LivenessState::Alive)
  );
  node.stop();
}

#[tokio::test(start_paused = true)]
async fn relay_can_be_disabled() {
  let (transport, sent) = RecordingTransport::new();
  let me = NodeAddress::new("127.0.0.1", 7720);
  let mut config = NodeConfig::new(me.clone());
  config.gossip.relay = false;
  config.gossip.fanout = Fanout::All;
  let node = Node::spawn(config, transport, vec![]).unwrap();
  let h = node.handle();
  let mut group = group_of(7721..7725);
  group.insert(h.sid().clone(), me);
  h.put_group(&GroupConfig::from("g"), &group).await.unwrap();

  let msg = Gossiper::new(GossipConfig::default(), None)
    .prepare("g", GossipTarget::new(FD_SERVICE, RECEIVE_STATUS), vec![json!({})])
    .unwrap();
  let res = h
    .serve(GOSSIP_SERVICE, GOSSIP_RECV, vec![serde_json::to_value(&msg).unwrap()])
    .await
    .unwrap();
  assert_eq!(res, json!(0));
  sleep(Duration::from_millis(10)).await;
  let relayed = gossip_ids(&sent.try_iter().collect_vec())
    .into_iter()
    .filter(|m| m.gossip_id == msg.gossip_id)
    .count();
  assert_eq!(relayed, 0);
  node.stop();
}

#[tokio::test(start_paused = true)]
async fn status_gossip_every_epoch() {
  let (transport, sent) = RecordingTransport::new();
  let me = NodeAddress::new("127.0.0.1", 7730);
  let mut config = NodeConfig::new(me.clone());
  config.gossip.fanout = Fanout::Fixed(2);
  let node = Node::spawn(config, transport, vec![]).unwrap();
  let h = node.handle();
  let mut all = group_of(7731..7736);
  all.insert(h.sid().clone(), me);
  h.put_group(&GroupConfig::from(fabric::cluster::ALL), &all).await.unwrap();

  sleep(Duration::from_millis(5500)).await;
  let msgs = gossip_ids(&sent.try_iter().collect_vec());
  let rounds = msgs.iter().map(|m| m.gossip_id.clone()).unique().count();
  assert_eq!(rounds, 5);
  for m in &msgs {
    assert_eq!(m.config, GossipTarget::new(FD_SERVICE, RECEIVE_STATUS));
    let vector: std::collections::BTreeMap<String, u64> =
      serde_json::from_value(m.message[0].clone()).unwrap();
    assert_eq!(vector.get(h.sid().as_str()), Some(&0));
  }
  node.stop();
}

#[tokio::test(start_paused = true)]
async fn status_gossip_never_targets_self() {
  let (transport, sent) = RecordingTransport::new();
  let (me, peer) = (NodeAddress::new("127.0.0.1", 7740), NodeAddress::new("127.0.0.1", 7741));
  let node = Node::spawn(NodeConfig::new(me), transport, vec![]).unwrap();
  let h = node.handle();
  let mut pair = group_of(7741..7742);
  pair.insert(h.sid().clone(), h.address().clone());
  h.put_group(&GroupConfig::from(fabric::cluster::ALL), &pair).await.unwrap();

  sleep(Duration::from_millis(5500)).await;
  let gossip = sent
    .try_iter()
    .filter(|s| s.remote.service == GOSSIP_SERVICE)
    .collect_vec();
  // One message per epoch, always to the only other member.
  assert_eq!(gossip.len(), 5);
  assert!(gossip.iter().all(|s| s.remote.node == peer));
  node.stop();
}
