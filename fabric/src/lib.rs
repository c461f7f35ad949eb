//! `fabric` is the coordination layer of a peer-to-peer key-value and compute fabric. Every process
//! is a [`Node`](cluster::Node) that derives a stable identity from its network address, keeps named
//! views of the groups it belongs to, routes keys to group members with a pluggable placement
//! strategy, and runs a gossip failure detector that evicts unreachable peers and hands storage
//! reconfiguration to exactly one survivor.
//!
//! The byte-level transport and the stores being reconfigured are not part of this crate; they plug
//! in through [`Transport`](core::Transport) and [`Store`](cluster::Store).
//! [`testkit`] provides an in-process network for running whole clusters inside a test.

pub mod cluster;
pub mod core;
pub mod testkit;
