use crate::cluster::{Node, NodeConfig, NodeHandle, Store};
use crate::core::{FabricError, NodeAddress, Remote, Result, Transport};
use crate::testkit::{FailureConfig, FailureConfigMap};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use tokio::time::sleep;
use tracing::trace;

/// An in-memory [`Transport`] connecting every node spawned through it.
///
/// Requests and responses are encoded to CBOR and back on the way through, so anything crossing a
/// node boundary has to survive serialization just like it would on a real wire. A request to a
/// node that was never spawned or has crashed fails with [`FabricError::Unreachable`]. A request
/// lost to the [`FailureConfigMap`] is never answered at all.
pub struct LocalNetwork {
  nodes: RwLock<HashMap<NodeAddress, NodeHandle>>,
  fail_map: FailureConfigMap,
}
impl LocalNetwork {
  pub fn new() -> Arc<LocalNetwork> {
    LocalNetwork::with_failures(FailureConfigMap::default())
  }

  pub fn with_failures(fail_map: FailureConfigMap) -> Arc<LocalNetwork> {
    Arc::new(LocalNetwork {
      nodes: RwLock::new(HashMap::new()),
      fail_map: fail_map,
    })
  }

  /// Spawns a node that talks through this network and makes it reachable at its address.
  pub fn spawn(self: &Arc<Self>, config: NodeConfig, stores: Vec<Arc<dyn Store>>) -> Result<Node> {
    let address = config.address.clone();
    let node = Node::spawn(config, self.clone(), stores)?;
    self
      .nodes
      .write()
      .unwrap_or_else(PoisonError::into_inner)
      .insert(address, node.handle().clone());
    Ok(node)
  }

  /// Stops the node at `address` and makes it unreachable. Returns `false` if there was none.
  pub fn crash(&self, address: &NodeAddress) -> bool {
    let removed = self
      .nodes
      .write()
      .unwrap_or_else(PoisonError::into_inner)
      .remove(address);
    match removed {
      Some(handle) => {
        handle.stop();
        true
      }
      None => false,
    }
  }

  /// Stops every node. The network holds handles to its nodes and the nodes hold the network, so
  /// tests should call this when they are done.
  pub fn shutdown(&self) {
    let mut nodes = self.nodes.write().unwrap_or_else(PoisonError::into_inner);
    for (_, handle) in nodes.drain() {
      handle.stop();
    }
  }

  pub fn handle(&self, address: &NodeAddress) -> Option<NodeHandle> {
    self
      .nodes
      .read()
      .unwrap_or_else(PoisonError::into_inner)
      .get(address)
      .cloned()
  }

  fn failures(&self, address: &NodeAddress) -> FailureConfig {
    *self.fail_map.get(address)
  }
}

fn through_wire<T: Serialize + DeserializeOwned>(value: &T) -> Result<T> {
  let bytes =
    serde_cbor::to_vec(value).map_err(|e| FabricError::MalformedResponse(e.to_string()))?;
  serde_cbor::from_slice(&bytes).map_err(|e| FabricError::MalformedResponse(e.to_string()))
}

#[async_trait]
impl Transport for LocalNetwork {
  async fn send(&self, args: Vec<Value>, remote: &Remote) -> Result<Value> {
    let handle = self
      .handle(&remote.node)
      .ok_or_else(|| FabricError::Unreachable(remote.node.to_string()))?;
    let failures = self.failures(&remote.node);
    if failures.dropped() {
      trace!(to = %remote.node, service = %remote.service, method = %remote.method, "dropped");
      return futures::future::pending().await;
    }
    if let Some(delay) = failures.sample_delay() {
      sleep(delay).await;
    }
    let args = through_wire(&args)?;
    match handle.serve(&remote.service, &remote.method, args).await {
      Ok(value) => through_wire(&value),
      Err(FabricError::Stopped) => Err(FabricError::Unreachable(remote.node.to_string())),
      Err(e) => Err(e),
    }
  }
}

#[cfg(test)]
use crate::cluster::{Group, ALL};
#[cfg(test)]
use serde_json::json;

#[tokio::test]
async fn test_local_network_delivers() {
  let net = LocalNetwork::new();
  let a = NodeAddress::new("127.0.0.1", 9100);
  let node = net.spawn(NodeConfig::new(a.clone()), vec![]).unwrap();
  let remote = Remote::new(a.clone(), "groups", "get");
  let res = crate::core::call(&*net, vec![json!(ALL)], &remote).await.unwrap();
  let group: Group = serde_json::from_value(res).unwrap();
  assert!(group.contains_key(node.handle().sid()));

  assert!(net.crash(&a));
  assert!(!net.crash(&a));
  assert!(matches!(
    crate::core::call(&*net, vec![json!(ALL)], &remote).await,
    Err(FabricError::Unreachable(_))
  ));
}

#[tokio::test(start_paused = true)]
async fn test_dropped_requests_time_out() {
  let a = NodeAddress::new("127.0.0.1", 9101);
  let mut fail_map = FailureConfigMap::default();
  fail_map.cluster_wide.drop_prob = 1.0;
  let net = LocalNetwork::with_failures(fail_map);
  let _node = net.spawn(NodeConfig::new(a.clone()), vec![]).unwrap();
  let remote = Remote::new(a, "status", "get").with_timeout(std::time::Duration::from_secs(2));
  assert!(matches!(
    crate::core::call(&*net, vec![json!("sid")], &remote).await,
    Err(FabricError::Timeout(_))
  ));
  net.shutdown();
}
