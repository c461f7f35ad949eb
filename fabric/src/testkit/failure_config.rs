use crate::core::NodeAddress;
use im::HashMap;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// How unreliable the link to one node is.
#[derive(Default, Serialize, Deserialize, Clone, Copy, Debug)]
pub struct FailureConfig {
  /// The probability a request is lost. A lost request is never answered; the sender finds out
  /// through its own timeout.
  pub drop_prob: f64,
  /// Every delivered request is delayed by a uniformly random amount in this range.
  pub delay: Option<(Duration, Duration)>,
}
impl FailureConfig {
  pub fn dropped(&self) -> bool {
    self.drop_prob > 0.0 && rand::random::<f64>() < self.drop_prob
  }

  pub fn sample_delay(&self) -> Option<Duration> {
    self.delay.map(|(min, max)| {
      let (lo, hi) = (min.as_millis() as u64, max.as_millis() as u64);
      if lo >= hi {
        return min;
      }
      Duration::from_millis(rand::thread_rng().gen_range(lo..=hi))
    })
  }
}

#[derive(Clone, Default, Serialize, Deserialize)]
pub struct FailureConfigMap {
  pub cluster_wide: FailureConfig,
  pub node_wide: HashMap<NodeAddress, FailureConfig>,
}
impl FailureConfigMap {
  pub fn get(&self, address: &NodeAddress) -> &FailureConfig {
    self.node_wide.get(address).unwrap_or(&self.cluster_wide)
  }
}

#[test]
fn test_failure_config_lookup() {
  let flaky = NodeAddress::new("127.0.0.1", 9001);
  let mut map = FailureConfigMap::default();
  map.node_wide.insert(
    flaky.clone(),
    FailureConfig {
      drop_prob: 1.0,
      delay: None,
    },
  );
  assert!(map.get(&flaky).dropped());
  assert!(!map.get(&NodeAddress::new("127.0.0.1", 9002)).dropped());
}

#[test]
fn test_delay_within_range() {
  let cfg = FailureConfig {
    drop_prob: 0.0,
    delay: Some((Duration::from_millis(10), Duration::from_millis(20))),
  };
  for _ in 0..100 {
    let d = cfg.sample_delay().unwrap();
    assert!(d >= Duration::from_millis(10) && d <= Duration::from_millis(20));
  }
  assert_eq!(FailureConfig::default().sample_delay(), None);
}
