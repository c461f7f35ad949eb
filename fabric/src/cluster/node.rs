use crate::cluster::{
  disseminate, elect_leader, run_reconf, send_to_group, AliveVector, DetectorAction,
  FailureDetector, GossipMessage, GossipTarget, Gossiper, Group, GroupConfig, GroupRegistry,
  GroupResult, LivenessState, NodeConfig, ReconfPlan, Store, ALL, GOSSIP_RECV, GOSSIP_SERVICE,
};
use crate::core::{call, node_id, FabricError, NodeAddress, NodeId, Remote, Result, ShortId};
use crate::core::Transport;
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::interval;
use tracing::{debug, error, info, info_span, trace, warn, Instrument};
use NodeMsg::*;

pub const STATUS_SERVICE: &str = "status";
pub const GROUPS_SERVICE: &str = "groups";
pub const FD_SERVICE: &str = "fd";
pub const RECEIVE_STATUS: &str = "receiveStatus";
pub const REGISTER_FAILURE: &str = "registerFailure";

type Reply<T> = oneshot::Sender<T>;

enum NodeMsg {
  Request {
    service: String,
    method: String,
    args: Vec<Value>,
    reply: Reply<Result<Value>>,
  },
  PingResult(ShortId, Result<Value>),
  Evict {
    sid: ShortId,
    gid: String,
    reply: Reply<Option<ReconfPlan>>,
  },
  Stop,
}

/// A cheap, cloneable reference to a running [`Node`]. Every method goes through the node's
/// mailbox, so they all fail with [`FabricError::Stopped`] once the node is gone.
#[derive(Clone)]
pub struct NodeHandle {
  address: NodeAddress,
  sid: ShortId,
  transport: Arc<dyn Transport>,
  tx: mpsc::UnboundedSender<NodeMsg>,
}
impl NodeHandle {
  pub fn address(&self) -> &NodeAddress {
    &self.address
  }

  pub fn sid(&self) -> &ShortId {
    &self.sid
  }

  pub fn is_running(&self) -> bool {
    !self.tx.is_closed()
  }

  pub fn stop(&self) {
    let _ = self.tx.send(Stop);
  }

  /// Serves a request addressed to this node. Transports call this on the receiving end.
  pub async fn serve(&self, service: &str, method: &str, args: Vec<Value>) -> Result<Value> {
    let (reply, rx) = oneshot::channel();
    let msg = Request {
      service: service.to_string(),
      method: method.to_string(),
      args: args,
      reply: reply,
    };
    self.tx.send(msg).map_err(|_| FabricError::Stopped)?;
    rx.await.map_err(|_| FabricError::Stopped)?
  }

  async fn request<T: DeserializeOwned>(
    &self,
    service: &str,
    method: &str,
    args: Vec<Value>,
  ) -> Result<T> {
    let value = self.serve(service, method, args).await?;
    serde_json::from_value(value).map_err(|e| FabricError::MalformedResponse(e.to_string()))
  }

  pub async fn get_group(&self, name: &str) -> Result<Group> {
    self.request(GROUPS_SERVICE, "get", vec![json!(name)]).await
  }

  pub async fn put_group(&self, config: &GroupConfig, group: &Group) -> Result<Group> {
    let args = vec![serde_json::to_value(config)?, serde_json::to_value(group)?];
    self.request(GROUPS_SERVICE, "put", args).await
  }

  pub async fn add_member(&self, name: &str, address: &NodeAddress) -> Result<Group> {
    let args = vec![json!(name), serde_json::to_value(address)?];
    self.request(GROUPS_SERVICE, "add", args).await
  }

  pub async fn rem_member(&self, name: &str, sid: &ShortId) -> Result<Group> {
    let args = vec![json!(name), json!(sid.as_str())];
    self.request(GROUPS_SERVICE, "rem", args).await
  }

  pub async fn del_group(&self, name: &str) -> Result<Group> {
    self.request(GROUPS_SERVICE, "del", vec![json!(name)]).await
  }

  /// Returns the number of peers the vector introduced.
  pub async fn receive_status(&self, vector: &AliveVector) -> Result<usize> {
    let args = vec![serde_json::to_value(vector)?];
    self.request(FD_SERVICE, RECEIVE_STATUS, args).await
  }

  /// Returns `false` if the failure was already registered or the peer was never known. Resolves
  /// only after this node has evicted the peer and led whatever reconfigurations fell to it.
  pub async fn register_failure(&self, sid: &ShortId) -> Result<bool> {
    self
      .request(FD_SERVICE, REGISTER_FAILURE, vec![json!(sid.as_str())])
      .await
  }

  pub async fn liveness(&self, sid: &ShortId) -> Result<Option<LivenessState>> {
    let args = vec![json!("liveness"), json!(sid.as_str())];
    self.request(STATUS_SERVICE, "get", args).await
  }

  pub async fn epoch(&self) -> Result<u64> {
    self.request(STATUS_SERVICE, "get", vec![json!("epoch")]).await
  }

  /// Applies the `groups` operation `method` on every member of this node's view of `via`,
  /// this node included if it is a member.
  pub async fn everywhere(&self, via: &str, method: &str, args: Vec<Value>) -> Result<GroupResult> {
    let view = self.get_group(via).await?;
    Ok(
      send_to_group(
        &*self.transport,
        args,
        GROUPS_SERVICE,
        method,
        &view,
        Some(via),
        None,
      )
      .await,
    )
  }
}

/// One member of the fabric.
///
/// A node is a single task owning its [`GroupRegistry`], its [`FailureDetector`] and its
/// [`Gossiper`]. The task wakes up on every epoch and on every message in its mailbox; nothing else
/// touches that state, so none of it is locked. Anything that talks to the network runs in a
/// spawned task and reports back through the mailbox.
///
/// The node serves four services:
/// - `status.get(field)`: `"sid"`, `"nid"`, `"address"`, `"epoch"`, `"groups"`, or
///   `"liveness", sid`. Pings ask for `"sid"`.
/// - `groups.{get, put, add, rem, del}`: the registry.
/// - `fd.{receiveStatus, registerFailure}`: the failure detector.
/// - `gossip.recv(message)`: unwraps a [`GossipMessage`], drops it if already seen, relays it once
///   and dispatches it locally.
///
/// A fresh node is the only member of the `"all"` group.
pub struct Node {
  handle: NodeHandle,
  task: JoinHandle<Result<()>>,
}
impl Node {
  pub fn spawn(
    config: NodeConfig,
    transport: Arc<dyn Transport>,
    stores: Vec<Arc<dyn Store>>,
  ) -> Result<Node> {
    config.check()?;
    let nid = node_id(&config.address)?;
    let sid = nid.short();
    let (tx, rx) = mpsc::unbounded_channel();

    let mut registry = GroupRegistry::new();
    let me = Group::unit(sid.clone(), config.address.clone());
    registry.put(GroupConfig::from(ALL), me.clone());
    if !registry.contains(&config.detector.gid) {
      registry.put(GroupConfig::from(config.detector.gid.as_str()), me);
    }

    let handle = NodeHandle {
      address: config.address.clone(),
      sid: sid.clone(),
      transport: transport.clone(),
      tx: tx.clone(),
    };
    let state = NodeState {
      detector: FailureDetector::new(sid.clone(), config.detector.clone()),
      gossiper: Gossiper::new(config.gossip.clone(), config.seed),
      config: config,
      sid: sid.clone(),
      nid: nid,
      registry: registry,
      transport: transport,
      stores: stores,
      tx: tx,
    };
    let span = info_span!("node", sid = %sid);
    let task = tokio::spawn(state.run(rx).instrument(span));
    Ok(Node {
      handle: handle,
      task: task,
    })
  }

  pub fn handle(&self) -> &NodeHandle {
    &self.handle
  }

  pub fn stop(&self) {
    self.handle.stop();
  }

  /// Waits for the node to end. An `Err` means it shut itself down, which only happens on
  /// [`FabricError::StaleInvariantViolation`].
  pub async fn join(self) -> Result<()> {
    match self.task.await {
      Ok(res) => res,
      Err(_) => Err(FabricError::Stopped),
    }
  }
}

struct NodeState {
  config: NodeConfig,
  sid: ShortId,
  nid: NodeId,
  registry: GroupRegistry,
  detector: FailureDetector,
  gossiper: Gossiper,
  transport: Arc<dyn Transport>,
  stores: Vec<Arc<dyn Store>>,
  tx: mpsc::UnboundedSender<NodeMsg>,
}
impl NodeState {
  async fn run(mut self, mut rx: mpsc::UnboundedReceiver<NodeMsg>) -> Result<()> {
    info!(address = %self.config.address, nid = %self.nid, "node started");
    let mut ticker = interval(self.config.detector.epoch);
    ticker.tick().await;
    loop {
      tokio::select! {
        _ = ticker.tick() => {
          if let Err(e) = self.on_epoch() {
            error!(error = %e, "failure detector halted");
            return Err(e);
          }
        }
        msg = rx.recv() => {
          match msg {
            Some(Stop) | None => break,
            Some(msg) => self.recv(msg),
          }
        }
      }
    }
    info!("node stopped");
    Ok(())
  }

  fn recv(&mut self, msg: NodeMsg) {
    match msg {
      Request {
        service,
        method,
        args,
        reply,
      } => self.on_request(&service, &method, args, reply),
      PingResult(sid, res) => self.on_ping_result(sid, res),
      Evict { sid, gid, reply } => {
        let _ = reply.send(self.evict(&sid, &gid));
      }
      Stop => {}
    }
  }

  fn on_epoch(&mut self) -> Result<()> {
    let actions = self.detector.tick()?;
    let epoch = self.detector.epoch();
    trace!(epoch, known = self.detector.known(), "epoch");
    self.gossiper.expire(epoch);
    for action in actions {
      match action {
        DetectorAction::Ping(sid) => self.ping(sid),
        DetectorAction::Declare(sid) => {
          info!(sid = %sid, epoch, "declaring failure");
          self.register_failure(sid, None);
        }
        DetectorAction::Gossip(vector) => self.gossip_status(vector),
      }
    }
    Ok(())
  }

  fn ping(&mut self, sid: ShortId) {
    let address = match self.registry.address_of(&self.config.detector.gid, &sid) {
      Ok(address) => address,
      Err(e) => {
        // Known only through gossip. Without an address it can never be confirmed, so it must not
        // be declared either.
        debug!(sid = %sid, error = %e, "no address to ping, forgetting");
        self.detector.forget(&sid);
        return;
      }
    };
    let remote = Remote::new(address, STATUS_SERVICE, "get")
      .with_gid(self.config.detector.gid.as_str())
      .with_timeout(self.config.detector.ping_timeout);
    let transport = self.transport.clone();
    let tx = self.tx.clone();
    tokio::spawn(
      async move {
        let res = call(&*transport, vec![json!("sid")], &remote).await;
        let _ = tx.send(PingResult(sid, res));
      }
      .in_current_span(),
    );
  }

  fn on_ping_result(&mut self, sid: ShortId, res: Result<Value>) {
    match res {
      Ok(Value::String(answer)) if answer == sid.as_str() => {
        self.detector.confirm(&sid);
      }
      Ok(other) => debug!(sid = %sid, answer = %other, "ping answered by someone else"),
      Err(e) if e.is_network() => debug!(sid = %sid, error = %e, "ping unanswered"),
      Err(e) => warn!(sid = %sid, error = %e, "ping failed"),
    }
  }

  fn gossip_status(&mut self, vector: AliveVector) {
    let gid = self.config.detector.gid.clone();
    let group = match self.registry.get(&gid) {
      Ok(group) => group.clone(),
      Err(_) => {
        trace!(gid = %gid, "monitored group is gone, not gossiping");
        return;
      }
    };
    let prepared = serde_json::to_value(&vector).map_err(FabricError::from).and_then(|v| {
      self
        .gossiper
        .prepare(&gid, GossipTarget::new(FD_SERVICE, RECEIVE_STATUS), vec![v])
    });
    let msg = match prepared {
      Ok(msg) => msg,
      Err(e) => {
        warn!(error = %e, "could not prepare status gossip");
        return;
      }
    };
    self.gossiper.observe(&msg.gossip_id, self.detector.epoch());
    let chosen = self.gossiper.select_peers(&group, &self.sid);
    self.spawn_gossip(chosen, msg);
  }

  fn spawn_gossip(&self, chosen: Group, msg: GossipMessage) {
    if chosen.is_empty() {
      return;
    }
    let transport = self.transport.clone();
    tokio::spawn(
      async move {
        let res = disseminate(&*transport, &chosen, &msg).await;
        for (sid, e) in res.errors.iter() {
          if e.is_network() {
            debug!(sid = %sid, id = %msg.gossip_id, error = %e, "gossip not delivered");
          } else {
            warn!(sid = %sid, id = %msg.gossip_id, error = %e, "gossip rejected");
          }
        }
      }
      .in_current_span(),
    );
  }

  fn on_request(
    &mut self,
    service: &str,
    method: &str,
    args: Vec<Value>,
    reply: Reply<Result<Value>>,
  ) {
    trace!(service, method, "request");
    match (service, method) {
      (GOSSIP_SERVICE, GOSSIP_RECV) => self.on_gossip(args, reply),
      (FD_SERVICE, REGISTER_FAILURE) => match arg::<ShortId>(&args, 0, "fd.registerFailure") {
        Ok(sid) => self.register_failure(sid, Some(reply)),
        Err(e) => {
          let _ = reply.send(Err(e));
        }
      },
      _ => {
        let _ = reply.send(self.serve(service, method, args));
      }
    }
  }

  fn on_gossip(&mut self, args: Vec<Value>, reply: Reply<Result<Value>>) {
    let msg = match arg::<GossipMessage>(&args, 0, "gossip.recv") {
      Ok(msg) => msg,
      Err(e) => {
        let _ = reply.send(Err(e));
        return;
      }
    };
    if !self.gossiper.observe(&msg.gossip_id, self.detector.epoch()) {
      trace!(id = %msg.gossip_id, "duplicate gossip dropped");
      let _ = reply.send(Ok(Value::Null));
      return;
    }
    if self.gossiper.config().relay {
      if let Ok(group) = self.registry.get(&msg.gid) {
        let chosen = self.gossiper.select_peers(group, &self.sid);
        self.spawn_gossip(chosen, msg.clone());
      }
    }
    let GossipMessage {
      config, message, ..
    } = msg;
    self.on_request(&config.service, &config.method, message, reply);
  }

  fn serve(&mut self, service: &str, method: &str, args: Vec<Value>) -> Result<Value> {
    match (service, method) {
      (STATUS_SERVICE, "get") => self.status(&args),
      (GROUPS_SERVICE, "get") => {
        let name: String = arg(&args, 0, "groups.get")?;
        Ok(serde_json::to_value(self.registry.get(&name)?)?)
      }
      (GROUPS_SERVICE, "put") => {
        let config = match args.get(0) {
          Some(Value::String(name)) => match self.registry.config(name) {
            Ok(config) => config.clone(),
            Err(_) => GroupConfig::from(name.as_str()),
          },
          _ => arg::<GroupConfig>(&args, 0, "groups.put")?,
        };
        let group: Group = arg(&args, 1, "groups.put")?;
        Ok(serde_json::to_value(self.registry.put(config, group))?)
      }
      (GROUPS_SERVICE, "add") => {
        let name: String = arg(&args, 0, "groups.add")?;
        let address: NodeAddress = arg(&args, 1, "groups.add")?;
        Ok(serde_json::to_value(self.registry.add(&name, address)?)?)
      }
      (GROUPS_SERVICE, "rem") => {
        let name: String = arg(&args, 0, "groups.rem")?;
        let sid: ShortId = arg(&args, 1, "groups.rem")?;
        Ok(serde_json::to_value(self.registry.rem(&name, &sid)?)?)
      }
      (GROUPS_SERVICE, "del") => {
        let name: String = arg(&args, 0, "groups.del")?;
        Ok(serde_json::to_value(self.registry.del(&name)?)?)
      }
      (FD_SERVICE, RECEIVE_STATUS) => {
        let vector: AliveVector = arg(&args, 0, "fd.receiveStatus")?;
        let found = self.detector.receive_status(&vector);
        if !found.is_empty() {
          debug!(peers = ?found, "discovered through gossip");
        }
        Ok(json!(found.len()))
      }
      (STATUS_SERVICE, _) | (GROUPS_SERVICE, _) | (FD_SERVICE, _) | (GOSSIP_SERVICE, _) => {
        Err(FabricError::UnknownMethod {
          service: service.to_string(),
          method: method.to_string(),
        })
      }
      _ => Err(FabricError::UnknownService(service.to_string())),
    }
  }

  fn status(&self, args: &[Value]) -> Result<Value> {
    let field: String = arg(args, 0, "status.get")?;
    match field.as_str() {
      "sid" => Ok(json!(self.sid.as_str())),
      "nid" => Ok(json!(self.nid.as_str())),
      "address" => Ok(serde_json::to_value(&self.config.address)?),
      "epoch" => Ok(json!(self.detector.epoch())),
      "groups" => {
        let names = self.registry.names().collect::<Vec<_>>();
        Ok(serde_json::to_value(names)?)
      }
      "liveness" => {
        let sid: ShortId = arg(args, 1, "status.get")?;
        Ok(serde_json::to_value(self.detector.state(&sid))?)
      }
      _ => Err(FabricError::BadArguments(
        "status.get".to_string(),
        format!("unknown field {}", field),
      )),
    }
  }

  /// Registers the failure of `sid`, broadcasts it once and evicts it from every local group,
  /// leading the reconfigurations this node is elected for. `reply` resolves when all of that is
  /// done; it carries the first store error, if any. The removals stand regardless.
  fn register_failure(&mut self, sid: ShortId, reply: Option<Reply<Result<Value>>>) {
    let answer = |reply: Option<Reply<Result<Value>>>, res: Result<Value>| {
      if let Some(reply) = reply {
        let _ = reply.send(res);
      }
    };
    if sid == self.sid {
      warn!("a peer declared this node failed, ignoring");
      answer(reply, Ok(json!(false)));
      return;
    }
    if !self.detector.register_failure(&sid) {
      trace!(sid = %sid, "failure already registered or peer unknown");
      answer(reply, Ok(json!(false)));
      return;
    }
    info!(sid = %sid, epoch = self.detector.epoch(), "registered failure");

    let gid = self.config.detector.gid.clone();
    let targets = self
      .registry
      .get(&gid)
      .map(|g| g.without(&self.sid).without(&sid))
      .unwrap_or_default();
    let transport = self.transport.clone();
    let failed = sid.clone();
    tokio::spawn(
      async move {
        let res = send_to_group(
          &*transport,
          vec![json!(failed.as_str())],
          FD_SERVICE,
          REGISTER_FAILURE,
          &targets,
          Some(gid.as_str()),
          None,
        )
        .await;
        for (peer, e) in res.errors.iter() {
          if e.is_network() {
            debug!(peer = %peer, failed = %failed, error = %e, "failure broadcast not delivered");
          } else {
            warn!(peer = %peer, failed = %failed, error = %e, "failure broadcast rejected");
          }
        }
      }
      .in_current_span(),
    );

    let order = self.registry.eviction_order(&sid);
    let tx = self.tx.clone();
    let stores = self.stores.clone();
    tokio::spawn(
      async move {
        let outcome = evict_everywhere(tx, stores, sid.clone(), order).await;
        match reply {
          Some(reply) => {
            let _ = reply.send(outcome.map(|_| json!(true)));
          }
          None => {
            if let Err(e) = outcome {
              warn!(sid = %sid, error = %e, "reconfiguration after failure did not complete");
            }
          }
        }
      }
      .in_current_span(),
    );
  }

  /// Removes `sid` from `gid`. Returns a plan if this node is the elected leader.
  fn evict(&mut self, sid: &ShortId, gid: &str) -> Option<ReconfPlan> {
    let config = self.registry.config(gid).ok()?.clone();
    let old = self.registry.get(gid).ok()?.clone();
    if !old.contains_key(sid) {
      return None;
    }
    let new_view = self.registry.rem(gid, sid).ok()?;
    debug!(gid, sid = %sid, size = new_view.len(), "evicted");
    match elect_leader(&config, sid, &new_view) {
      Ok(leader) if leader == self.sid => Some(ReconfPlan {
        config: config,
        old: old,
        failed: sid.clone(),
      }),
      Ok(leader) => {
        debug!(gid, leader = %leader, "reconfiguration led elsewhere");
        None
      }
      Err(e) => {
        debug!(gid, error = %e, "nobody left to reconfigure");
        None
      }
    }
  }
}

/// Evicts `sid` from each group in `order`, one group at a time, running the reconfiguration
/// between evictions whenever this node is the leader.
async fn evict_everywhere(
  tx: mpsc::UnboundedSender<NodeMsg>,
  stores: Vec<Arc<dyn Store>>,
  sid: ShortId,
  order: Vec<String>,
) -> Result<()> {
  let mut outcome = Ok(());
  for gid in order {
    let (reply, rx) = oneshot::channel();
    let msg = Evict {
      sid: sid.clone(),
      gid: gid,
      reply: reply,
    };
    tx.send(msg).map_err(|_| FabricError::Stopped)?;
    if let Some(plan) = rx.await.map_err(|_| FabricError::Stopped)? {
      if let Err(e) = run_reconf(&stores, &plan).await {
        if outcome.is_ok() {
          outcome = Err(e);
        }
      }
    }
  }
  outcome
}

fn arg<T: DeserializeOwned>(args: &[Value], idx: usize, op: &str) -> Result<T> {
  let value = args.get(idx).ok_or_else(|| {
    FabricError::BadArguments(op.to_string(), format!("missing argument {}", idx))
  })?;
  serde_json::from_value(value.clone())
    .map_err(|e| FabricError::BadArguments(op.to_string(), e.to_string()))
}

#[cfg(test)]
use async_trait::async_trait;
#[cfg(test)]
use crate::core::short_id;

#[cfg(test)]
struct Silent;
#[cfg(test)]
#[async_trait]
impl Transport for Silent {
  async fn send(&self, _: Vec<Value>, remote: &Remote) -> Result<Value> {
    Err(FabricError::Unreachable(remote.node.to_string()))
  }
}

#[cfg(test)]
fn lone_node(port: u16) -> Node {
  let config = NodeConfig::new(NodeAddress::new("127.0.0.1", port));
  Node::spawn(config, Arc::new(Silent), vec![]).unwrap()
}

#[tokio::test]
async fn test_fresh_node_is_alone_in_all() {
  let node = lone_node(7200);
  let all = node.handle().get_group(ALL).await.unwrap();
  assert_eq!(all.len(), 1);
  assert!(all.contains_key(node.handle().sid()));
  let sid: String = node
    .handle()
    .request(STATUS_SERVICE, "get", vec![json!("sid")])
    .await
    .unwrap();
  assert_eq!(sid, node.handle().sid().as_str());
  node.stop();
  node.join().await.unwrap();
}

#[tokio::test]
async fn test_dispatch_errors() {
  let node = lone_node(7201);
  let h = node.handle();
  assert!(matches!(
    h.serve("kv", "get", vec![]).await,
    Err(FabricError::UnknownService(_))
  ));
  assert!(matches!(
    h.serve(GROUPS_SERVICE, "frobnicate", vec![]).await,
    Err(FabricError::UnknownMethod { .. })
  ));
  assert!(matches!(
    h.serve(GROUPS_SERVICE, "add", vec![json!("g")]).await,
    Err(FabricError::BadArguments(_, _))
  ));
  assert!(matches!(h.get_group("nope").await, Err(FabricError::GroupNotFound(_))));
  node.stop();
}

#[tokio::test]
async fn test_put_by_name() {
  let node = lone_node(7202);
  let h = node.handle();
  let a = NodeAddress::new("127.0.0.1", 7300);
  let group = Group::unit(short_id(&a).unwrap(), a);
  let config = GroupConfig::new("g", crate::cluster::Placement::Rendezvous);
  h.put_group(&config, &Group::new()).await.unwrap();
  let args = vec![json!("g"), serde_json::to_value(&group).unwrap()];
  let put: Group = h.request(GROUPS_SERVICE, "put", args).await.unwrap();
  assert_eq!(put, group);
  assert_eq!(h.get_group("g").await.unwrap(), group);
  node.stop();
}

#[tokio::test]
async fn test_stopped_node_refuses_requests() {
  let node = lone_node(7203);
  let h = node.handle().clone();
  node.stop();
  node.join().await.unwrap();
  assert!(!h.is_running());
  assert!(matches!(h.get_group(ALL).await, Err(FabricError::Stopped)));
}
