use crate::core::{NodeAddress, Result};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use sha2::{Digest as _, Sha256};
use std::borrow::Borrow;
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

/// Number of hex characters kept in a [`ShortId`].
pub const SHORT_ID_LEN: usize = 5;

/// Number of hex characters reduced to an integer by [`Digest::to_num`]. Sixteen hex characters
/// are exactly 8 bytes, so the value always fits in a `u64`.
const NUM_PREFIX_LEN: usize = 16;

/// A SHA-256 digest in lowercase hex.
#[derive(Clone, Debug, Deserialize, Eq, Hash, PartialEq, Serialize, Ord, PartialOrd)]
#[serde(transparent)]
pub struct Digest(String);
impl Digest {
  pub fn as_str(&self) -> &str {
    self.0.as_str()
  }

  /// The integer formed by the first 8 bytes of the digest.
  pub fn to_num(&self) -> u64 {
    let end = std::cmp::min(NUM_PREFIX_LEN, self.0.len());
    u64::from_str_radix(&self.0[..end], 16).unwrap_or(0)
  }

  pub fn short(&self) -> ShortId {
    let end = std::cmp::min(SHORT_ID_LEN, self.0.len());
    ShortId(self.0[..end].to_string())
  }
}
impl fmt::Display for Digest {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(&self.0)
  }
}

/// The digest of a node's address.
pub type NodeId = Digest;

/// The first [`SHORT_ID_LEN`] hex characters of a [`NodeId`]. This is the key of every membership
/// map. Uniqueness is assumed, not enforced.
#[derive(Clone, Debug, Deserialize, Eq, Hash, PartialEq, Serialize, Ord, PartialOrd)]
#[serde(transparent)]
pub struct ShortId(String);
impl ShortId {
  pub fn as_str(&self) -> &str {
    self.0.as_str()
  }
}
impl From<&str> for ShortId {
  fn from(s: &str) -> Self {
    ShortId(s.to_string())
  }
}
impl From<String> for ShortId {
  fn from(s: String) -> Self {
    ShortId(s)
  }
}
impl Borrow<str> for ShortId {
  fn borrow(&self) -> &str {
    self.0.as_str()
  }
}
impl fmt::Display for ShortId {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(&self.0)
  }
}

/// Digest of the canonical serialization of `value`: JSON with every object's keys sorted, so two
/// structurally equal values always produce the same digest.
pub fn id<T: Serialize + ?Sized>(value: &T) -> Result<Digest> {
  let canonical = canonicalize(serde_json::to_value(value)?);
  let bytes = serde_json::to_vec(&canonical)?;
  Ok(Digest(hex::encode(Sha256::digest(&bytes))))
}

pub fn node_id(address: &NodeAddress) -> Result<NodeId> {
  address.validate()?;
  id(&json!({"host": address.host, "port": address.port}))
}

pub fn short_id(address: &NodeAddress) -> Result<ShortId> {
  Ok(node_id(address)?.short())
}

/// A digest of `message` and the current time. Two identical payloads sent within the clock's
/// granularity share an id.
pub fn message_id<T: Serialize + ?Sized>(message: &T) -> Result<Digest> {
  let timestamp = SystemTime::now()
    .duration_since(UNIX_EPOCH)
    .map(|d| d.as_nanos() as u64)
    .unwrap_or(0);
  id(&json!({"timestamp": timestamp, "payload": serde_json::to_value(message)?}))
}

fn canonicalize(value: Value) -> Value {
  match value {
    Value::Object(map) => {
      let mut entries = map.into_iter().collect::<Vec<_>>();
      entries.sort_by(|(a, _), (b, _)| a.cmp(b));
      let mut sorted = Map::new();
      for (k, v) in entries {
        sorted.insert(k, canonicalize(v));
      }
      Value::Object(sorted)
    }
    Value::Array(items) => Value::Array(items.into_iter().map(canonicalize).collect()),
    other => other,
  }
}

#[cfg(test)]
use crate::core::FabricError;

#[test]
fn test_node_id_deterministic() {
  let a = NodeAddress::new("127.0.0.1", 8080);
  let b = NodeAddress::new("127.0.0.1".to_string(), 8080);
  let nid = node_id(&a).unwrap();
  assert_eq!(nid, node_id(&b).unwrap());
  assert_eq!(nid.as_str().len(), 64);
  assert_eq!(short_id(&a).unwrap().as_str(), &nid.as_str()[..SHORT_ID_LEN]);
  assert_ne!(nid, node_id(&NodeAddress::new("127.0.0.1", 8081)).unwrap());
}

#[test]
fn test_id_ignores_key_order() {
  let x = json!({"port": 1, "host": "h", "nested": {"b": 2, "a": 1}});
  let y = json!({"nested": {"a": 1, "b": 2}, "host": "h", "port": 1});
  assert_eq!(id(&x).unwrap(), id(&y).unwrap());
  let addr = NodeAddress::new("h", 1);
  assert_eq!(node_id(&addr).unwrap(), id(&json!({"port": 1, "host": "h"})).unwrap());
}

#[test]
fn test_node_id_rejects_missing_parts() {
  assert!(matches!(
    node_id(&NodeAddress::new("", 80)),
    Err(FabricError::InvalidAddress(_))
  ));
  assert!(matches!(
    short_id(&NodeAddress::new("host", 0)),
    Err(FabricError::InvalidAddress(_))
  ));
}

#[test]
fn test_to_num_uses_prefix() {
  let d = Digest("00000000000000ffabcdef".to_string());
  assert_eq!(d.to_num(), 255);
  let max = Digest("f".repeat(64));
  assert_eq!(max.to_num(), u64::MAX);
}

#[test]
fn test_message_id_varies_with_payload() {
  let a = message_id(&json!(["x"])).unwrap();
  let b = message_id(&json!(["y"])).unwrap();
  assert_ne!(a, b);
}
