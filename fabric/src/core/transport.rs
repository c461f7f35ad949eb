use crate::core::{FabricError, NodeAddress, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;

/// Used when a [`Remote`] does not carry its own timeout.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// Where a request is going: a node, and the service and method that should handle it there.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct Remote {
  pub node: NodeAddress,
  pub service: String,
  pub method: String,
  /// The group this request was issued on behalf of, if any.
  pub gid: Option<String>,
  pub timeout: Option<Duration>,
}
impl Remote {
  pub fn new<S: Into<String>, M: Into<String>>(node: NodeAddress, service: S, method: M) -> Remote {
    Remote {
      node: node,
      service: service.into(),
      method: method.into(),
      gid: None,
      timeout: None,
    }
  }

  pub fn with_gid<S: Into<String>>(mut self, gid: S) -> Remote {
    self.gid = Some(gid.into());
    self
  }

  pub fn with_timeout(mut self, timeout: Duration) -> Remote {
    self.timeout = Some(timeout);
    self
  }
}

/// Point-to-point request/response between nodes. The byte-level framing is the implementor's
/// business; this crate only needs a value back or one of [`FabricError::Unreachable`],
/// [`FabricError::Timeout`] or [`FabricError::MalformedResponse`].
#[async_trait]
pub trait Transport: Send + Sync + 'static {
  async fn send(&self, args: Vec<Value>, remote: &Remote) -> Result<Value>;
}

/// Sends through `transport`, giving up after the remote's timeout (or [`DEFAULT_TIMEOUT`]).
pub async fn call<T: Transport + ?Sized>(
  transport: &T,
  args: Vec<Value>,
  remote: &Remote,
) -> Result<Value> {
  let limit = remote.timeout.unwrap_or(DEFAULT_TIMEOUT);
  match tokio::time::timeout(limit, transport.send(args, remote)).await {
    Ok(res) => res,
    Err(_) => Err(FabricError::Timeout(limit)),
  }
}
