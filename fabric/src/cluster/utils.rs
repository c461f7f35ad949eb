use crate::core::{NodeAddress, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use validator::Validate;

/// The name of the umbrella group every node belongs to.
pub const ALL: &str = "all";

/// Configures the failure detector of a [`Node`](crate::cluster::Node).
#[derive(Clone, Debug, Serialize, Deserialize, Validate)]
pub struct DetectorConfig {
  /// The group whose members are monitored and gossiped with.
  ///
  /// default: `"all"`
  #[validate(length(min = 1))]
  pub gid: String,
  /// The length of one epoch. Every state transition happens on an epoch boundary.
  ///
  /// default: `1 second`
  pub epoch: Duration,
  /// The number of epochs a peer may go without fresh evidence of life before it is sent a direct
  /// confirmation ping.
  ///
  /// default: `3`
  #[validate(range(min = 1))]
  pub ping_threshold: u64,
  /// The amount of time a confirmation ping may take before it counts as unanswered.
  ///
  /// default: `5 seconds`
  pub ping_timeout: Duration,
  /// The number of epochs a peer may stay unconfirmed after being pinged before it is declared
  /// failed.
  ///
  /// default: `2`
  #[validate(range(min = 1))]
  pub fail_threshold: u64,
  /// The number of epochs a registered failure is remembered before its record is dropped.
  ///
  /// default: `10`
  pub fail_cooldown: u64,
}
impl Default for DetectorConfig {
  #[inline]
  fn default() -> Self {
    DetectorConfig {
      gid: ALL.to_string(),
      epoch: Duration::from_secs(1),
      ping_threshold: 3,
      ping_timeout: Duration::from_secs(5),
      fail_threshold: 2,
      fail_cooldown: 10,
    }
  }
}

/// How many members of a group receive each gossip message, as a function of group size.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum Fanout {
  /// `ceil(log2(size))`
  Log2,
  /// A fixed number, capped at the group size.
  Fixed(usize),
  /// Every member.
  All,
}
impl Fanout {
  pub fn count(&self, size: usize) -> usize {
    match self {
      Fanout::Log2 if size == 0 => 0,
      Fanout::Log2 => (size as f64).log2().ceil() as usize,
      Fanout::Fixed(n) => std::cmp::min(*n, size),
      Fanout::All => size,
    }
  }
}
impl Default for Fanout {
  fn default() -> Self {
    Fanout::Log2
  }
}

/// Configures gossip dissemination and the receiving side's duplicate filter.
#[derive(Clone, Debug, Serialize, Deserialize, Validate)]
pub struct GossipConfig {
  /// default: `Fanout::Log2`
  pub fanout: Fanout,
  /// Whether a node forwards a gossip message the first time it sees it.
  ///
  /// default: `true`
  pub relay: bool,
  /// The most gossip ids remembered at once. The oldest are forgotten first.
  ///
  /// default: `1024`
  #[validate(range(min = 1))]
  pub seen_capacity: usize,
  /// The number of epochs a gossip id is remembered.
  ///
  /// default: `30`
  pub seen_ttl: u64,
}
impl Default for GossipConfig {
  #[inline]
  fn default() -> Self {
    GossipConfig {
      fanout: Fanout::Log2,
      relay: true,
      seen_capacity: 1024,
      seen_ttl: 30,
    }
  }
}

/// Configures a [`Node`](crate::cluster::Node).
#[derive(Clone, Debug, Serialize, Deserialize, Validate)]
pub struct NodeConfig {
  /// The address this node is reachable on. Its identity is derived from it.
  pub address: NodeAddress,
  #[validate]
  pub detector: DetectorConfig,
  #[validate]
  pub gossip: GossipConfig,
  /// Seeds the random number generator used to pick gossip targets. `None` draws from entropy.
  ///
  /// default: `None`
  pub seed: Option<u64>,
}
impl NodeConfig {
  pub fn new(address: NodeAddress) -> NodeConfig {
    NodeConfig {
      address: address,
      detector: DetectorConfig::default(),
      gossip: GossipConfig::default(),
      seed: None,
    }
  }

  pub fn check(&self) -> Result<()> {
    self.address.validate()?;
    self.validate()?;
    Ok(())
  }
}

#[test]
fn test_fanout_counts() {
  assert_eq!(Fanout::Log2.count(0), 0);
  assert_eq!(Fanout::Log2.count(1), 0);
  assert_eq!(Fanout::Log2.count(2), 1);
  assert_eq!(Fanout::Log2.count(5), 3);
  assert_eq!(Fanout::Log2.count(8), 3);
  assert_eq!(Fanout::Log2.count(9), 4);
  assert_eq!(Fanout::Fixed(4).count(2), 2);
  assert_eq!(Fanout::All.count(7), 7);
}

#[test]
fn test_config_validation() {
  let mut cfg = NodeConfig::new(NodeAddress::new("127.0.0.1", 7000));
  assert!(cfg.check().is_ok());
  cfg.detector.ping_threshold = 0;
  assert!(matches!(cfg.check(), Err(crate::core::FabricError::Config(_))));
  cfg.detector.ping_threshold = 3;
  cfg.gossip.seen_capacity = 0;
  assert!(cfg.check().is_err());
  let bad = NodeConfig::new(NodeAddress::new("", 7000));
  assert!(matches!(bad.check(), Err(crate::core::FabricError::InvalidAddress(_))));
}
