use crate::cluster::Group;
use crate::core::{call, FabricError, Remote, ShortId, Transport};
use futures::future::join_all;
use serde_json::Value;
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::trace;

/// Per-member outcome of a fan-out. Every member that was sent to appears in exactly one map.
#[derive(Debug, Default)]
pub struct GroupResult {
  pub errors: BTreeMap<ShortId, FabricError>,
  pub results: BTreeMap<ShortId, Value>,
}
impl GroupResult {
  pub fn len(&self) -> usize {
    self.errors.len() + self.results.len()
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }
}

/// Sends the same request to every member of `view` concurrently and waits for all of them.
pub async fn send_to_group<T: Transport + ?Sized>(
  transport: &T,
  args: Vec<Value>,
  service: &str,
  method: &str,
  view: &Group,
  gid: Option<&str>,
  timeout: Option<Duration>,
) -> GroupResult {
  let calls = view.iter().map(|(sid, addr)| {
    let mut remote = Remote::new(addr.clone(), service, method);
    remote.gid = gid.map(str::to_string);
    remote.timeout = timeout;
    let args = args.clone();
    async move {
      let res = call(transport, args, &remote).await;
      (sid.clone(), res)
    }
  });
  let mut out = GroupResult::default();
  for (sid, res) in join_all(calls).await {
    match res {
      Ok(v) => {
        out.results.insert(sid, v);
      }
      Err(e) => {
        trace!(sid = %sid, service, method, error = %e, "group send failed");
        out.errors.insert(sid, e);
      }
    }
  }
  out
}
