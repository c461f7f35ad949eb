//! Tools for running whole clusters inside one test process.
//!
//! [`LocalNetwork`] connects any number of [`Node`](crate::cluster::Node)s in memory, with optional
//! per-node message loss and delay. [`RecordingTransport`] and [`RecordingStore`] capture what a
//! node sends and which reconfigurations it leads.

mod failure_config;
pub mod logging;
mod local_network;
mod recording;

#[rustfmt::skip]
pub use {
  failure_config::FailureConfig,
  failure_config::FailureConfigMap,
  local_network::LocalNetwork,
  recording::Reconfigured,
  recording::RecordingStore,
  recording::RecordingTransport,
  recording::Sent,
};
