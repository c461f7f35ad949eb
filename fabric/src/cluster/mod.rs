//! Membership, key placement and failure detection for a group of [`Node`]s.
//!
//! Every node keeps its own views of the named groups it takes part in (a [`GroupRegistry`]).
//! Views are never synchronized by a consensus round: two nodes may briefly disagree about who is
//! in a group. Membership changes are pushed explicitly through the `groups` service, and failures
//! are discovered by each node's [`FailureDetector`].
//!
//! ### Placement
//! A group routes keys to members with one of three strategies (see [`Placement`]). The same
//! function doubles as a leader election: after a member fails, the survivors each place the failed
//! member's [`ShortId`](crate::core::ShortId) on the post-removal view, and whoever comes out on top
//! drives the storage reconfiguration for that group. No messages are exchanged to agree on it, so
//! nodes holding the same view always agree.
//!
//! ### Failure Detection
//! Time is cut into epochs. Every epoch a node ages what it knows about its peers and gossips an
//! alive vector (`{sid: staleness}`) to a random subset of the monitored group. Merging takes the
//! smaller staleness, so duplicated or reordered gossip is harmless. A peer nobody has vouched for in
//! `ping_threshold` epochs is pinged directly; if it stays silent for `fail_threshold` more epochs,
//! it is declared failed. Declaration is broadcast once by every node that registers it, and each
//! node then evicts the peer from every group it knows, the `"all"` group last.
//!
//! Nodes are never re-admitted automatically. A failed node that comes back has to be added to its
//! groups again.
//!
//! [`Node`]: crate::cluster::Node

mod comm;
mod detector;
mod gossip;
mod groups;
mod node;
mod node_ring;
mod placement;
mod reconf;
mod utils;

#[rustfmt::skip]
pub use {
  comm::send_to_group,
  comm::GroupResult,
  detector::AliveVector,
  detector::DetectorAction,
  detector::FailureDetector,
  detector::LivenessRecord,
  detector::LivenessState,
  gossip::disseminate,
  gossip::GossipMessage,
  gossip::GossipTarget,
  gossip::Gossiper,
  gossip::GOSSIP_RECV,
  gossip::GOSSIP_SERVICE,
  groups::Group,
  groups::GroupConfig,
  groups::GroupRegistry,
  node::Node,
  node::NodeHandle,
  node::FD_SERVICE,
  node::GROUPS_SERVICE,
  node::RECEIVE_STATUS,
  node::REGISTER_FAILURE,
  node::STATUS_SERVICE,
  node_ring::NodeRing,
  placement::Placement,
  reconf::elect_leader,
  reconf::run_reconf,
  reconf::ReconfPlan,
  reconf::Store,
  utils::DetectorConfig,
  utils::Fanout,
  utils::GossipConfig,
  utils::NodeConfig,
  utils::ALL,
};
