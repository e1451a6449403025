//! Providers of connection management and queue pairs.
//!
//! A [`Fabric`] hands out event channels; a channel creates [`CmId`]s and
//! reports their connection manager events; a connected id creates the
//! [`Queues`] (protection domain, completion queue with its channel, and an
//! RC queue pair) that move data. Every call is non-blocking: waiting happens
//! in the connection, on the descriptors these types expose.

use core::ops::BitOr;
use std::net::SocketAddr;
use std::os::fd::{AsRawFd, RawFd};
use std::time::Duration;

use crate::error::Result;

pub mod loopback;
#[cfg(feature = "verbs")]
pub mod verbs;

pub use loopback::Loopback;
#[cfg(feature = "verbs")]
pub use verbs::Verbs;

pub trait Fabric: Clone + Send + Sync + 'static {
    type Channel: EventChannel<Id = Self::Id>;
    type Id: CmId<Channel = Self::Channel>;

    fn create_channel(&self) -> Result<Self::Channel>;
}

pub trait EventChannel: AsRawFd + Send + Sized {
    type Id: CmId<Channel = Self>;

    fn create_id(&self) -> Result<Self::Id>;

    /// Next pending event, if any.
    fn poll_event(&self) -> Result<Option<CmEvent<Self::Id>>>;
}

pub trait CmId: Send + Sized {
    type Channel;
    type Queues: Queues;

    /// Starts resolving `dst`; completes with `AddrResolved` or `AddrError`.
    fn resolve_addr(&mut self, dst: SocketAddr, timeout: Duration) -> Result<()>;
    /// Starts resolving the route; completes with `RouteResolved` or `RouteError`.
    fn resolve_route(&mut self, timeout: Duration) -> Result<()>;
    fn bind(&mut self, addr: SocketAddr) -> Result<()>;
    fn listen(&mut self, backlog: i32) -> Result<()>;
    /// Moves future events of this id to `channel`.
    fn migrate(&mut self, channel: &Self::Channel) -> Result<()>;
    fn connect(&mut self, private_data: &[u8]) -> Result<()>;
    fn accept(&mut self, private_data: &[u8]) -> Result<()>;
    fn reject(&mut self, private_data: &[u8]) -> Result<()>;
    fn disconnect(&mut self) -> Result<()>;

    fn local_addr(&self) -> Option<SocketAddr>;
    fn peer_addr(&self) -> Option<SocketAddr>;
    fn device_name(&self) -> Option<String>;

    /// Creates the queues of a resolved or requested id, `depth` work
    /// requests each way.
    fn create_queues(&mut self, depth: u32) -> Result<Self::Queues>;
}

pub trait Queues: Send {
    type Region: Region;

    /// Readable when a requested completion notification fired.
    fn completion_fd(&self) -> RawFd;

    fn register(&self, addr: *mut u8, len: usize, access: Access) -> Result<Self::Region>;

    fn post_recv(&self, sge: Sge, wr_id: u64) -> Result<()>;
    /// Signaled two-sided send.
    fn post_send(&self, sge: Sge, wr_id: u64) -> Result<()>;
    /// Signaled, solicited RDMA write with immediate data.
    fn post_write_with_imm(
        &self,
        sge: Sge,
        remote_addr: u64,
        rkey: u32,
        imm_data: u32,
        wr_id: u64,
    ) -> Result<()>;

    /// Appends at most `max` completions to `wcs`, returning how many.
    fn poll(&self, wcs: &mut Vec<WorkCompletion>, max: usize) -> Result<usize>;
    fn request_notify(&self, solicited_only: bool) -> Result<()>;
    /// Consumes a fired notification, if any.
    fn consume_notification(&self) -> Result<bool>;
}

pub trait Region: Send {
    fn lkey(&self) -> u32;
    fn rkey(&self) -> u32;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmEventKind {
    AddrResolved,
    AddrError,
    RouteResolved,
    RouteError,
    ConnectRequest,
    ConnectResponse,
    ConnectError,
    Unreachable,
    Rejected,
    Established,
    Disconnected,
    DeviceRemoval,
    TimewaitExit,
    Other(u32),
}

#[derive(Debug)]
pub struct CmEvent<Id> {
    pub kind: CmEventKind,
    /// The new id of a `ConnectRequest`.
    pub id: Option<Id>,
    pub private_data: Vec<u8>,
    pub status: i32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Sge {
    pub addr: u64,
    pub length: u32,
    pub lkey: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WcStatus {
    Success,
    /// Work request flushed by a queue pair in the error state.
    FlushErr,
    Other(u32, String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WcOpcode {
    Send,
    RdmaWrite,
    Recv,
    RecvRdmaWithImm,
    Other(u32),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkCompletion {
    pub wr_id: u64,
    pub status: WcStatus,
    pub opcode: WcOpcode,
    pub byte_len: u32,
    /// Network order, as posted.
    pub imm_data: u32,
}

/// Memory region access rights.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Access(pub u32);

impl Access {
    pub const LOCAL: Access = Access(0);
    pub const LOCAL_WRITE: Access = Access(1 << 0);
    pub const REMOTE_WRITE: Access = Access(1 << 1);

    pub fn contains(&self, other: Access) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for Access {
    type Output = Access;

    fn bitor(self, rhs: Self) -> Self::Output {
        Access(self.0 | rhs.0)
    }
}
