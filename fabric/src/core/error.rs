use crate::core::ShortId;
use std::time::Duration;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, FabricError>;

/// Everything that can go wrong in identity derivation, placement, membership and remoting.
#[derive(Error, Debug)]
pub enum FabricError {
  #[error("invalid address: {0}")]
  InvalidAddress(String),

  #[error("cannot place a key in an empty group")]
  EmptyGroup,

  #[error("node not found: {0}")]
  NodeNotFound(String),

  #[error("group not found: {0}")]
  GroupNotFound(String),

  #[error("node unreachable: {0}")]
  Unreachable(String),

  #[error("timed out after {0:?}")]
  Timeout(Duration),

  #[error("malformed response: {0}")]
  MalformedResponse(String),

  /// The local node found itself in the `Pinging` state. Nothing the detector decides after this
  /// point can be trusted.
  #[error("node {0} believes itself unreachable")]
  StaleInvariantViolation(ShortId),

  #[error("unknown service: {0}")]
  UnknownService(String),

  #[error("unknown method {method} on service {service}")]
  UnknownMethod { service: String, method: String },

  #[error("bad arguments for {0}: {1}")]
  BadArguments(String, String),

  #[error("serialization error: {0}")]
  Serialization(#[from] serde_json::Error),

  #[error("configuration error: {0}")]
  Config(String),

  #[error("store error: {0}")]
  Store(String),

  #[error("node has stopped")]
  Stopped,
}

impl From<validator::ValidationErrors> for FabricError {
  fn from(err: validator::ValidationErrors) -> Self {
    FabricError::Config(err.to_string())
  }
}

impl FabricError {
  /// Network failures are evidence about liveness, not bugs. The node logs these quietly on its
  /// ping, gossip and broadcast paths and warns about anything else.
  pub fn is_network(&self) -> bool {
    matches!(
      self,
      FabricError::Unreachable(_) | FabricError::Timeout(_) | FabricError::MalformedResponse(_)
    )
  }
}

#[test]
fn test_network_errors() {
  assert!(FabricError::Unreachable("x".to_string()).is_network());
  assert!(FabricError::Timeout(Duration::from_secs(5)).is_network());
  assert!(!FabricError::EmptyGroup.is_network());
  assert!(!FabricError::GroupNotFound("all".to_string()).is_network());
}
