//! Reliable byte streams over RDMA one-sided writes.
//!
//! Each endpoint owns two double-mapped ring buffers: a *source* staging
//! outgoing bytes and a *sink* the peer writes into with
//! `RDMA_WRITE_WITH_IMM`. Ring descriptors travel in a SETUP message after
//! the connection is established; consumed space returns to the writer in
//! FC messages. [`Connection`] exposes the blocking `read`/`write`/`close`
//! API on top of a [`fabric::Fabric`].

pub mod addr;
pub mod config;
pub mod connection;
pub mod error;
pub mod fabric;
pub mod flow_control;
pub(crate) mod message_buffer;
pub mod messages;
pub mod notifier;
pub mod ring_buffer;
pub mod ring_ptr;
pub mod stats;
pub(crate) mod transport;
pub(crate) mod utils;

pub use config::Config;
pub use connection::{Connection, Description, State};
pub use error::{Error, Result};
pub use fabric::Loopback;
#[cfg(feature = "verbs")]
pub use fabric::Verbs;
pub use stats::Stats;
