use crate::cluster::{Group, GroupConfig};
use crate::core::{Result, ShortId};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{info, warn};

/// Something that keeps state partitioned over a group and has to move it when the group loses a
/// member. Only the elected leader of a reconfiguration calls it.
#[async_trait]
pub trait Store: Send + Sync + 'static {
  /// `old` is the view from before the failed member was removed.
  async fn reconf(&self, config: &GroupConfig, old: &Group) -> Result<()>;
}

/// The reconfiguration this node leads after an eviction.
#[derive(Clone, Debug)]
pub struct ReconfPlan {
  pub config: GroupConfig,
  pub old: Group,
  pub failed: ShortId,
}

/// The member of `new_view` responsible for the failure of `failed`: the group's own placement
/// strategy applied to the failed node's short id. Every node holding the same `new_view` elects
/// the same leader, and no messages are exchanged to get there.
pub fn elect_leader(config: &GroupConfig, failed: &ShortId, new_view: &Group) -> Result<ShortId> {
  config.hash.locate(failed, new_view).map(|(sid, _)| sid)
}

/// Hands `plan` to every store. All stores are attempted; the first failure is returned.
pub async fn run_reconf(stores: &[Arc<dyn Store>], plan: &ReconfPlan) -> Result<()> {
  info!(
    gid = %plan.config.gid,
    failed = %plan.failed,
    old_size = plan.old.len(),
    stores = stores.len(),
    "leading reconfiguration"
  );
  let mut outcome = Ok(());
  for store in stores {
    if let Err(e) = store.reconf(&plan.config, &plan.old).await {
      warn!(gid = %plan.config.gid, error = %e, "store reconfiguration failed");
      if outcome.is_ok() {
        outcome = Err(e);
      }
    }
  }
  outcome
}

#[cfg(test)]
use crate::cluster::{GroupRegistry, Placement};
#[cfg(test)]
use crate::core::{short_id, FabricError, NodeAddress};
#[cfg(test)]
use std::sync::atomic::{AtomicUsize, Ordering};

#[cfg(test)]
fn view(ports: &[u16]) -> Group {
  ports
    .iter()
    .map(|p| NodeAddress::new("127.0.0.1", *p))
    .map(|a| (short_id(&a).unwrap(), a))
    .collect()
}

#[cfg(test)]
struct CountingStore {
  calls: AtomicUsize,
  fail: bool,
}
#[cfg(test)]
#[async_trait]
impl Store for CountingStore {
  async fn reconf(&self, _: &GroupConfig, _: &Group) -> Result<()> {
    self.calls.fetch_add(1, Ordering::SeqCst);
    if self.fail {
      Err(FabricError::Store("disk full".to_string()))
    } else {
      Ok(())
    }
  }
}

#[test]
fn test_single_leader_under_shared_view() {
  let ports = [7100, 7101, 7102, 7103, 7104];
  let extra = NodeAddress::new("127.0.0.1", 7199);
  for hash in [Placement::Naive, Placement::Consistent, Placement::Rendezvous].iter() {
    let config = GroupConfig::new("g", *hash);
    for failed_port in ports.iter() {
      let failed = short_id(&NodeAddress::new("127.0.0.1", *failed_port)).unwrap();
      // Three survivors that learned the membership in different orders.
      let mut whole = GroupRegistry::new();
      whole.put(config.clone(), view(&ports));
      let mut ascending = GroupRegistry::new();
      for p in ports.iter() {
        ascending.add("g", NodeAddress::new("127.0.0.1", *p)).unwrap();
      }
      let mut churned = GroupRegistry::new();
      churned.add("g", extra.clone()).unwrap();
      for p in ports.iter().rev() {
        churned.add("g", NodeAddress::new("127.0.0.1", *p)).unwrap();
      }
      churned.rem("g", &short_id(&extra).unwrap()).unwrap();

      let leaders = vec![whole, ascending, churned]
        .into_iter()
        .map(|mut registry| {
          let survivors = registry.rem("g", &failed).unwrap();
          elect_leader(&config, &failed, &survivors).unwrap()
        })
        .collect::<std::collections::BTreeSet<_>>();
      assert_eq!(leaders.len(), 1);
      let leader = leaders.into_iter().next().unwrap();
      assert!(view(&ports).without(&failed).contains_key(&leader));
      assert_ne!(leader, failed);
    }
  }
}

#[test]
fn test_no_leader_for_empty_view() {
  let config = GroupConfig::from("g");
  let failed = ShortId::from("abcde");
  assert!(matches!(
    elect_leader(&config, &failed, &Group::new()),
    Err(FabricError::EmptyGroup)
  ));
}

#[tokio::test]
async fn test_run_reconf_tries_every_store() {
  let bad = Arc::new(CountingStore {
    calls: AtomicUsize::new(0),
    fail: true,
  });
  let good = Arc::new(CountingStore {
    calls: AtomicUsize::new(0),
    fail: false,
  });
  let stores: Vec<Arc<dyn Store>> = vec![bad.clone(), good.clone()];
  let plan = ReconfPlan {
    config: GroupConfig::from("g"),
    old: view(&[7100, 7101]),
    failed: ShortId::from("abcde"),
  };
  assert!(matches!(run_reconf(&stores, &plan).await, Err(FabricError::Store(_))));
  assert_eq!(bad.calls.load(Ordering::SeqCst), 1);
  assert_eq!(good.calls.load(Ordering::SeqCst), 1);
}
