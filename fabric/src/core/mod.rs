//! The pieces every node needs before it can join anything: an address, an identity derived from
//! that address, an error type, and the [`Transport`] seam through which nodes talk.
//!
//! ### Identity
//! A node's [`NodeId`] is the SHA-256 digest of the canonical JSON of its [`NodeAddress`]. The same
//! address always yields the same id, on any machine. Membership maps are keyed by the much shorter
//! [`ShortId`], the first five hex characters of the [`NodeId`].
//!
//! ```ignore
//! let addr = NodeAddress::new("127.0.0.1", 7070);
//! let nid = node_id(&addr)?;
//! let sid = short_id(&addr)?;
//! assert!(nid.as_str().starts_with(sid.as_str()));
//! ```
//!
//! ### Remoting
//! This crate does not frame bytes. It hands a list of JSON arguments and a [`Remote`] to a
//! [`Transport`] and gets a value or an error back. Use [`call`] to put a deadline on the request.

mod address;
mod error;
mod id;
mod transport;

#[rustfmt::skip]
pub use {
  address::NodeAddress,
  error::FabricError,
  error::Result,
  id::Digest,
  id::NodeId,
  id::ShortId,
  id::SHORT_ID_LEN,
  id::id,
  id::message_id,
  id::node_id,
  id::short_id,
  transport::call,
  transport::Remote,
  transport::Transport,
  transport::DEFAULT_TIMEOUT,
};
