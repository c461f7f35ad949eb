use crate::cluster::{Placement, ALL};
use crate::core::{short_id, FabricError, NodeAddress, Result, ShortId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{debug, warn};

/// One node's view of a group: who it believes the members are.
pub type Group = im::OrdMap<ShortId, NodeAddress>;

/// The name of a group and the placement strategy used to route keys (and elect reconfiguration
/// leaders) within it.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct GroupConfig {
  pub gid: String,
  #[serde(default)]
  pub hash: Placement,
}
impl GroupConfig {
  pub fn new<S: Into<String>>(gid: S, hash: Placement) -> GroupConfig {
    GroupConfig {
      gid: gid.into(),
      hash: hash,
    }
  }
}
impl From<&str> for GroupConfig {
  fn from(gid: &str) -> Self {
    GroupConfig::new(gid, Placement::default())
  }
}

/// Per-node mapping from group name to membership view. Nothing here is persisted; a restarted node
/// starts empty and has to be put back into its groups explicitly.
#[derive(Clone, Debug, Default)]
pub struct GroupRegistry {
  groups: BTreeMap<String, (GroupConfig, Group)>,
}
impl GroupRegistry {
  pub fn new() -> GroupRegistry {
    GroupRegistry {
      groups: BTreeMap::new(),
    }
  }

  pub fn get(&self, name: &str) -> Result<&Group> {
    self
      .groups
      .get(name)
      .map(|(_, group)| group)
      .ok_or_else(|| FabricError::GroupNotFound(name.to_string()))
  }

  pub fn config(&self, name: &str) -> Result<&GroupConfig> {
    self
      .groups
      .get(name)
      .map(|(config, _)| config)
      .ok_or_else(|| FabricError::GroupNotFound(name.to_string()))
  }

  pub fn contains(&self, name: &str) -> bool {
    self.groups.contains_key(name)
  }

  pub fn names(&self) -> impl Iterator<Item = &String> {
    self.groups.keys()
  }

  /// Replaces the group wholesale, creating it if needed.
  pub fn put(&mut self, config: GroupConfig, group: Group) -> Group {
    debug!(gid = %config.gid, size = group.len(), "put group");
    let name = config.gid.clone();
    self.groups.insert(name, (config, group.clone()));
    group
  }

  /// Inserts `address` under its [`ShortId`], overwriting whatever was there. Creates the group with
  /// the default config if it does not exist yet.
  pub fn add(&mut self, name: &str, address: NodeAddress) -> Result<Group> {
    let sid = short_id(&address)?;
    let (_, group) = self
      .groups
      .entry(name.to_string())
      .or_insert_with(|| (GroupConfig::from(name), Group::new()));
    if let Some(prev) = group.get(&sid) {
      if *prev != address {
        warn!(
          gid = name,
          sid = %sid,
          old = %prev,
          new = %address,
          "short id collision, replacing member"
        );
      }
    }
    group.insert(sid, address);
    Ok(group.clone())
  }

  /// Removes a member. Removing a member that is not there is not an error.
  pub fn rem(&mut self, name: &str, sid: &ShortId) -> Result<Group> {
    let (_, group) = self
      .groups
      .get_mut(name)
      .ok_or_else(|| FabricError::GroupNotFound(name.to_string()))?;
    group.remove(sid);
    Ok(group.clone())
  }

  pub fn del(&mut self, name: &str) -> Result<Group> {
    self
      .groups
      .remove(name)
      .map(|(_, group)| group)
      .ok_or_else(|| FabricError::GroupNotFound(name.to_string()))
  }

  /// The first address known for `sid` in any group, preferring `preferred`.
  pub fn address_of(&self, preferred: &str, sid: &ShortId) -> Result<NodeAddress> {
    self
      .groups
      .get(preferred)
      .into_iter()
      .chain(self.groups.values())
      .find_map(|(_, group)| group.get(sid).cloned())
      .ok_or_else(|| FabricError::NodeNotFound(sid.to_string()))
  }

  /// The names of the groups `sid` belongs to, in the order evictions should be applied: the
  /// umbrella group comes last because reconfiguring the others may still route through it.
  pub fn eviction_order(&self, sid: &ShortId) -> Vec<String> {
    let (all, mut rest): (Vec<String>, Vec<String>) = self
      .groups
      .iter()
      .filter(|(_, (_, group))| group.contains_key(sid))
      .map(|(name, _)| name.clone())
      .partition(|name| name == ALL);
    rest.extend(all);
    rest
  }
}

#[cfg(test)]
fn addr(port: u16) -> NodeAddress {
  NodeAddress::new("127.0.0.1", port)
}

#[test]
fn test_registry_crud() {
  let mut reg = GroupRegistry::new();
  assert!(matches!(reg.get("g"), Err(FabricError::GroupNotFound(_))));
  let group = reg.add("g", addr(9000)).unwrap();
  assert_eq!(group.len(), 1);
  reg.add("g", addr(9001)).unwrap();
  assert_eq!(reg.get("g").unwrap().len(), 2);
  assert_eq!(reg.config("g").unwrap().hash, Placement::Naive);

  let sid = short_id(&addr(9000)).unwrap();
  assert_eq!(reg.rem("g", &sid).unwrap().len(), 1);
  // Removing twice is fine.
  assert_eq!(reg.rem("g", &sid).unwrap().len(), 1);
  assert!(matches!(reg.rem("h", &sid), Err(FabricError::GroupNotFound(_))));

  assert_eq!(reg.del("g").unwrap().len(), 1);
  assert!(matches!(reg.del("g"), Err(FabricError::GroupNotFound(_))));
}

#[test]
fn test_registry_put_replaces() {
  let mut reg = GroupRegistry::new();
  reg.add("g", addr(9000)).unwrap();
  let replacement = vec![addr(9005), addr(9006)]
    .into_iter()
    .map(|a| (short_id(&a).unwrap(), a))
    .collect::<Group>();
  reg.put(GroupConfig::new("g", Placement::Rendezvous), replacement.clone());
  assert_eq!(reg.get("g").unwrap(), &replacement);
  assert_eq!(reg.config("g").unwrap().hash, Placement::Rendezvous);
}

#[test]
fn test_registry_rejects_bad_address() {
  let mut reg = GroupRegistry::new();
  assert!(matches!(
    reg.add("g", NodeAddress::new("", 1)),
    Err(FabricError::InvalidAddress(_))
  ));
}

#[test]
fn test_eviction_order_all_last() {
  let mut reg = GroupRegistry::new();
  for name in &["all", "b", "zz", "a"] {
    reg.add(name, addr(9000)).unwrap();
  }
  reg.add("other", addr(9001)).unwrap();
  let sid = short_id(&addr(9000)).unwrap();
  assert_eq!(reg.eviction_order(&sid), vec!["a", "b", "zz", "all"]);
  assert_eq!(reg.address_of("all", &sid).unwrap(), addr(9000));
  let unknown = ShortId::from("fffff");
  assert!(matches!(reg.address_of("all", &unknown), Err(FabricError::NodeNotFound(_))));
}
