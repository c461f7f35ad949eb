use crate::core::{FabricError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::SocketAddr;

/// The remote address of a node. This is the only externally supplied input to a node's identity.
#[derive(Clone, Debug, Deserialize, Eq, Hash, PartialEq, Serialize, Ord, PartialOrd)]
pub struct NodeAddress {
  /// The DNS name or IP address of the machine hosting the node.
  pub host: String,
  /// The port the node receives requests on.
  pub port: u16,
}
impl NodeAddress {
  /// Creates a new [`NodeAddress`]
  pub fn new<S: Into<String>>(host: S, port: u16) -> NodeAddress {
    NodeAddress {
      host: host.into(),
      port: port,
    }
  }

  /// An empty host or a zero port counts as absent.
  pub fn validate(&self) -> Result<()> {
    if self.host.is_empty() {
      return Err(FabricError::InvalidAddress(format!("missing host in {}", self)));
    }
    if self.port == 0 {
      return Err(FabricError::InvalidAddress(format!("missing port in {}", self)));
    }
    Ok(())
  }
}
impl From<SocketAddr> for NodeAddress {
  fn from(addr: SocketAddr) -> Self {
    NodeAddress::new(addr.ip().to_string(), addr.port())
  }
}
impl fmt::Display for NodeAddress {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}:{}", self.host, self.port)
  }
}

#[test]
fn test_address_validation() {
  assert!(NodeAddress::new("127.0.0.1", 7070).validate().is_ok());
  assert!(matches!(
    NodeAddress::new("", 7070).validate(),
    Err(FabricError::InvalidAddress(_))
  ));
  assert!(matches!(
    NodeAddress::new("localhost", 0).validate(),
    Err(FabricError::InvalidAddress(_))
  ));
  let sock: SocketAddr = "10.0.0.4:9000".parse().unwrap();
  assert_eq!(NodeAddress::from(sock), NodeAddress::new("10.0.0.4", 9000));
}
