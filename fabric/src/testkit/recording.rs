use crate::cluster::{Group, GroupConfig, Store, STATUS_SERVICE};
use crate::core::{short_id, FabricError, Remote, Result, ShortId, Transport};
use async_trait::async_trait;
use crossbeam::channel::{unbounded, Receiver, Sender};
use serde_json::{json, Value};
use std::sync::Arc;

/// One request seen by a [`RecordingTransport`].
#[derive(Clone, Debug)]
pub struct Sent {
  pub remote: Remote,
  pub args: Vec<Value>,
}

/// A [`Transport`] that answers everything itself and reports every request on a channel.
///
/// Pings (`status.get("sid")`) are answered with the target's own short id, so the peers of a node
/// wired to this transport always look alive when asked directly. Everything else gets `null`.
pub struct RecordingTransport {
  tx: Sender<Sent>,
}
impl RecordingTransport {
  pub fn new() -> (Arc<RecordingTransport>, Receiver<Sent>) {
    let (tx, rx) = unbounded();
    (Arc::new(RecordingTransport { tx: tx }), rx)
  }
}

#[async_trait]
impl Transport for RecordingTransport {
  async fn send(&self, args: Vec<Value>, remote: &Remote) -> Result<Value> {
    let _ = self.tx.send(Sent {
      remote: remote.clone(),
      args: args.clone(),
    });
    if remote.service == STATUS_SERVICE && args.get(0) == Some(&json!("sid")) {
      return Ok(json!(short_id(&remote.node)?.as_str()));
    }
    Ok(Value::Null)
  }
}

/// One reconfiguration led by the node owning a [`RecordingStore`].
#[derive(Clone, Debug)]
pub struct Reconfigured {
  pub by: ShortId,
  pub gid: String,
  pub old: Group,
}

/// A [`Store`] that reports every reconfiguration it is asked to run.
pub struct RecordingStore {
  owner: ShortId,
  tx: Sender<Reconfigured>,
  fail: bool,
}
impl RecordingStore {
  pub fn new(owner: ShortId, tx: Sender<Reconfigured>) -> Arc<RecordingStore> {
    Arc::new(RecordingStore {
      owner: owner,
      tx: tx,
      fail: false,
    })
  }

  /// Records like [`RecordingStore::new`], then fails every reconfiguration.
  pub fn failing(owner: ShortId, tx: Sender<Reconfigured>) -> Arc<RecordingStore> {
    Arc::new(RecordingStore {
      owner: owner,
      tx: tx,
      fail: true,
    })
  }
}

#[async_trait]
impl Store for RecordingStore {
  async fn reconf(&self, config: &GroupConfig, old: &Group) -> Result<()> {
    let _ = self.tx.send(Reconfigured {
      by: self.owner.clone(),
      gid: config.gid.clone(),
      old: old.clone(),
    });
    if self.fail {
      return Err(FabricError::Store(format!("{} refused to reconfigure", self.owner)));
    }
    Ok(())
  }
}
