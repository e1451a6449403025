//! In-process fabric.
//!
//! Ids, queue pairs and memory regions live in one process and exchange data
//! with plain memory copies, with the observable behaviour of a reliable
//! connected queue pair: sends and writes with immediate data consume a
//! receive posted by the peer, writes are checked against the remote key,
//! completion notification can be limited to solicited completions and a
//! disconnect flushes outstanding receives. Connection manager events are
//! delivered through channels backed by an eventfd, like `rdma_cm`.
//!
//! Listeners are keyed by socket address; nothing touches the network.

use std::collections::{HashMap, VecDeque};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::os::fd::{AsRawFd, RawFd};
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicU32, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use spin::Mutex;
use tracing::{debug, trace, warn};

use super::{
    Access, CmEvent, CmEventKind, CmId, EventChannel, Fabric, Queues, Region, Sge, WcOpcode,
    WcStatus, WorkCompletion,
};
use crate::error::{Error, Result};
use crate::notifier::EventFd;

const DEVICE_NAME: &str = "loopback0";
const FIRST_EPHEMERAL_PORT: u16 = 49152;
/// Reject reason reported for a connect to an address nobody listens on.
const REJECT_INVALID_SERVICE: i32 = 8;
/// Reject reason reported for a rejection by the consumer.
const REJECT_CONSUMER: i32 = 28;

const WC_LOC_LEN_ERR: u32 = 1;
const WC_LOC_PROT_ERR: u32 = 4;
const WC_WR_FLUSH_ERR: u32 = 5;
const WC_REM_INV_REQ_ERR: u32 = 9;
const WC_REM_ACCESS_ERR: u32 = 10;
const WC_RETRY_EXC_ERR: u32 = 12;
const WC_RNR_RETRY_EXC_ERR: u32 = 13;

#[derive(Clone, Default)]
pub struct Loopback {
    shared: Arc<Shared>,
}

impl Loopback {
    pub fn new() -> Self {
        Self::default()
    }
}

impl core::fmt::Debug for Loopback {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Loopback")
            .field("listeners", &self.shared.listeners.lock().len())
            .field("regions", &self.shared.regions.lock().len())
            .finish()
    }
}

struct Shared {
    listeners: Mutex<HashMap<SocketAddr, Weak<IdShared>>>,
    regions: Mutex<HashMap<u32, RegionEntry>>,
    next_key: AtomicU32,
    next_port: AtomicU16,
}

impl Default for Shared {
    fn default() -> Self {
        Self {
            listeners: Mutex::new(HashMap::new()),
            regions: Mutex::new(HashMap::new()),
            next_key: AtomicU32::new(1),
            next_port: AtomicU16::new(FIRST_EPHEMERAL_PORT),
        }
    }
}

impl Shared {
    fn ephemeral_port(&self) -> u16 {
        loop {
            let port = self.next_port.fetch_add(1, Ordering::Relaxed);
            if port >= FIRST_EPHEMERAL_PORT {
                return port;
            }
        }
    }

    fn listener(&self, dst: &SocketAddr) -> Option<Arc<IdShared>> {
        let listeners = self.listeners.lock();
        if let Some(listener) = listeners.get(dst).and_then(Weak::upgrade) {
            return Some(listener);
        }
        listeners
            .iter()
            .find(|(addr, _)| addr.port() == dst.port() && addr.ip().is_unspecified())
            .and_then(|(_, listener)| listener.upgrade())
    }

    /// Whether `[addr, addr + len)` lies in region `key` with `access`.
    fn covers(&self, key: u32, addr: u64, len: u32, access: Access) -> bool {
        match self.regions.lock().get(&key) {
            Some(region) => {
                region.access.contains(access)
                    && addr >= region.addr
                    && addr + len as u64 <= region.addr + region.len as u64
            }
            None => false,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct RegionEntry {
    addr: u64,
    len: usize,
    access: Access,
}

struct RawEvent {
    kind: CmEventKind,
    id: Option<Arc<IdShared>>,
    private_data: Vec<u8>,
    status: i32,
}

impl RawEvent {
    fn new(kind: CmEventKind) -> Self {
        Self {
            kind,
            id: None,
            private_data: Vec::new(),
            status: 0,
        }
    }
}

struct ChannelShared {
    events: Mutex<VecDeque<RawEvent>>,
    fd: EventFd,
}

impl ChannelShared {
    fn push(&self, event: RawEvent) -> Result<()> {
        let mut events = self.events.lock();
        trace!("queueing connection manager event {:?}", event.kind);
        events.push_back(event);
        self.fd.add(1)
    }
}

pub struct LoopbackChannel {
    fabric: Arc<Shared>,
    shared: Arc<ChannelShared>,
}

impl AsRawFd for LoopbackChannel {
    fn as_raw_fd(&self) -> RawFd {
        self.shared.fd.as_raw_fd()
    }
}

impl Fabric for Loopback {
    type Channel = LoopbackChannel;
    type Id = LoopbackId;

    fn create_channel(&self) -> Result<LoopbackChannel> {
        Ok(LoopbackChannel {
            fabric: self.shared.clone(),
            shared: Arc::new(ChannelShared {
                events: Mutex::new(VecDeque::new()),
                fd: EventFd::new()?,
            }),
        })
    }
}

impl EventChannel for LoopbackChannel {
    type Id = LoopbackId;

    fn create_id(&self) -> Result<LoopbackId> {
        Ok(LoopbackId {
            fabric: self.fabric.clone(),
            shared: Arc::new(IdShared::new(&self.shared)),
        })
    }

    fn poll_event(&self) -> Result<Option<CmEvent<LoopbackId>>> {
        let mut events = self.shared.events.lock();
        let event = match events.pop_front() {
            Some(event) => event,
            None => return Ok(None),
        };
        if events.is_empty() {
            self.shared.fd.take()?;
        }
        Ok(Some(CmEvent {
            kind: event.kind,
            id: event.id.map(|shared| LoopbackId {
                fabric: self.fabric.clone(),
                shared,
            }),
            private_data: event.private_data,
            status: event.status,
        }))
    }
}

struct IdShared {
    channel: Mutex<Weak<ChannelShared>>,
    local: Mutex<Option<SocketAddr>>,
    peer: Mutex<Option<SocketAddr>>,
    /// The id at the other end once a connect request was routed.
    remote: Mutex<Weak<IdShared>>,
    qp: Mutex<Weak<QpShared>>,
    listening: AtomicBool,
    connected: AtomicBool,
}

impl IdShared {
    fn new(channel: &Arc<ChannelShared>) -> Self {
        Self {
            channel: Mutex::new(Arc::downgrade(channel)),
            local: Mutex::new(None),
            peer: Mutex::new(None),
            remote: Mutex::new(Weak::new()),
            qp: Mutex::new(Weak::new()),
            listening: AtomicBool::new(false),
            connected: AtomicBool::new(false),
        }
    }

    /// Events for a dropped channel are discarded.
    fn push(&self, event: RawEvent) -> Result<()> {
        let channel = self.channel.lock().upgrade();
        match channel {
            Some(channel) => channel.push(event),
            None => Ok(()),
        }
    }

    /// Tears down both ends of an established connection once.
    fn hang_up(&self) -> Result<()> {
        if !self.connected.swap(false, Ordering::AcqRel) {
            return Ok(());
        }
        if let Some(qp) = self.qp.lock().upgrade() {
            qp.flush()?;
        }
        self.push(RawEvent::new(CmEventKind::Disconnected))?;
        let remote = self.remote.lock().upgrade();
        if let Some(remote) = remote {
            if remote.connected.swap(false, Ordering::AcqRel) {
                if let Some(qp) = remote.qp.lock().upgrade() {
                    qp.flush()?;
                }
                remote.push(RawEvent::new(CmEventKind::Disconnected))?;
            }
        }
        Ok(())
    }
}

pub struct LoopbackId {
    fabric: Arc<Shared>,
    shared: Arc<IdShared>,
}

impl core::fmt::Debug for LoopbackId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("LoopbackId")
            .field("local", &*self.shared.local.lock())
            .field("peer", &*self.shared.peer.lock())
            .finish()
    }
}

fn loopback_ip(like: &IpAddr) -> IpAddr {
    match like {
        IpAddr::V4(_) => IpAddr::V4(Ipv4Addr::LOCALHOST),
        IpAddr::V6(_) => IpAddr::V6(Ipv6Addr::LOCALHOST),
    }
}

impl CmId for LoopbackId {
    type Channel = LoopbackChannel;
    type Queues = LoopbackQueues;

    fn resolve_addr(&mut self, dst: SocketAddr, _timeout: Duration) -> Result<()> {
        let local = SocketAddr::new(loopback_ip(&dst.ip()), self.fabric.ephemeral_port());
        *self.shared.local.lock() = Some(local);
        *self.shared.peer.lock() = Some(dst);
        self.shared.push(RawEvent::new(CmEventKind::AddrResolved))
    }

    fn resolve_route(&mut self, _timeout: Duration) -> Result<()> {
        if self.shared.peer.lock().is_none() {
            return self.shared.push(RawEvent::new(CmEventKind::RouteError));
        }
        self.shared.push(RawEvent::new(CmEventKind::RouteResolved))
    }

    fn bind(&mut self, mut addr: SocketAddr) -> Result<()> {
        if addr.port() == 0 {
            addr.set_port(self.fabric.ephemeral_port());
        }
        *self.shared.local.lock() = Some(addr);
        Ok(())
    }

    fn listen(&mut self, _backlog: i32) -> Result<()> {
        let local = self
            .shared
            .local
            .lock()
            .ok_or_else(|| Error::Internal("listen on an unbound id".into()))?;
        let mut listeners = self.fabric.listeners.lock();
        if listeners.get(&local).and_then(Weak::upgrade).is_some() {
            return Err(Error::device(
                "rdma_listen",
                std::io::Error::from_raw_os_error(libc::EADDRINUSE),
            ));
        }
        listeners.insert(local, Arc::downgrade(&self.shared));
        self.shared.listening.store(true, Ordering::Release);
        Ok(())
    }

    fn migrate(&mut self, channel: &LoopbackChannel) -> Result<()> {
        *self.shared.channel.lock() = Arc::downgrade(&channel.shared);
        Ok(())
    }

    fn connect(&mut self, private_data: &[u8]) -> Result<()> {
        let dst = self
            .shared
            .peer
            .lock()
            .ok_or_else(|| Error::Internal("connect before address resolution".into()))?;
        let listener = match self.fabric.listener(&dst) {
            Some(listener) => listener,
            None => {
                debug!("nobody listens on {dst}");
                return self.shared.push(RawEvent {
                    status: REJECT_INVALID_SERVICE,
                    ..RawEvent::new(CmEventKind::Rejected)
                });
            }
        };
        let channel = listener.channel.lock().upgrade();
        let channel = match channel {
            Some(channel) => channel,
            None => {
                return self.shared.push(RawEvent {
                    status: REJECT_INVALID_SERVICE,
                    ..RawEvent::new(CmEventKind::Rejected)
                })
            }
        };
        let child = Arc::new(IdShared::new(&channel));
        *child.local.lock() = Some(dst);
        *child.peer.lock() = *self.shared.local.lock();
        *child.remote.lock() = Arc::downgrade(&self.shared);
        *self.shared.remote.lock() = Arc::downgrade(&child);
        channel.push(RawEvent {
            id: Some(child),
            private_data: private_data.to_vec(),
            ..RawEvent::new(CmEventKind::ConnectRequest)
        })
    }

    fn accept(&mut self, private_data: &[u8]) -> Result<()> {
        let remote = self.shared.remote.lock().upgrade();
        let remote =
            remote.ok_or_else(|| Error::Internal("accept without a connect request".into()))?;
        let local_qp = self.shared.qp.lock().upgrade();
        let remote_qp = remote.qp.lock().upgrade();
        let (local_qp, remote_qp) = match (local_qp, remote_qp) {
            (Some(local_qp), Some(remote_qp)) => (local_qp, remote_qp),
            _ => return Err(Error::Internal("accept before queue pair creation".into())),
        };
        *local_qp.peer.lock() = Arc::downgrade(&remote_qp);
        *remote_qp.peer.lock() = Arc::downgrade(&local_qp);
        self.shared.connected.store(true, Ordering::Release);
        remote.connected.store(true, Ordering::Release);
        remote.push(RawEvent {
            private_data: private_data.to_vec(),
            ..RawEvent::new(CmEventKind::Established)
        })?;
        self.shared.push(RawEvent::new(CmEventKind::Established))
    }

    fn reject(&mut self, private_data: &[u8]) -> Result<()> {
        let remote = self.shared.remote.lock().upgrade();
        match remote {
            Some(remote) => remote.push(RawEvent {
                private_data: private_data.to_vec(),
                status: REJECT_CONSUMER,
                ..RawEvent::new(CmEventKind::Rejected)
            }),
            None => Ok(()),
        }
    }

    fn disconnect(&mut self) -> Result<()> {
        self.shared.hang_up()
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        *self.shared.local.lock()
    }

    fn peer_addr(&self) -> Option<SocketAddr> {
        *self.shared.peer.lock()
    }

    fn device_name(&self) -> Option<String> {
        Some(DEVICE_NAME.to_string())
    }

    fn create_queues(&mut self, depth: u32) -> Result<LoopbackQueues> {
        let cq_depth = (depth as usize)
            .checked_mul(2)
            .ok_or_else(|| Error::Internal(format!("queue depth {depth} too large")))?;
        let qp = Arc::new(QpShared {
            depth,
            recvs: Mutex::new(VecDeque::with_capacity(depth as usize)),
            cq: Mutex::new(VecDeque::with_capacity(cq_depth)),
            armed: Mutex::new(None),
            comp: EventFd::new()?,
            peer: Mutex::new(Weak::new()),
            errored: AtomicBool::new(false),
        });
        *self.shared.qp.lock() = Arc::downgrade(&qp);
        Ok(LoopbackQueues {
            fabric: self.fabric.clone(),
            qp,
        })
    }
}

impl Drop for LoopbackId {
    fn drop(&mut self) {
        if self.shared.listening.load(Ordering::Acquire) {
            if let Some(local) = *self.shared.local.lock() {
                let mut listeners = self.fabric.listeners.lock();
                let ours = Arc::downgrade(&self.shared);
                if listeners.get(&local).map_or(false, |id| id.ptr_eq(&ours)) {
                    listeners.remove(&local);
                }
            }
        }
        if let Err(err) = self.shared.hang_up() {
            warn!("failed to hang up dropped id, {err}");
        }
    }
}

struct QpShared {
    depth: u32,
    recvs: Mutex<VecDeque<(u64, Sge)>>,
    cq: Mutex<VecDeque<WorkCompletion>>,
    /// `Some(solicited_only)` while a notification is requested.
    armed: Mutex<Option<bool>>,
    comp: EventFd,
    peer: Mutex<Weak<QpShared>>,
    errored: AtomicBool,
}

impl QpShared {
    fn complete(&self, wc: WorkCompletion, solicited: bool) -> Result<()> {
        {
            let mut cq = self.cq.lock();
            if cq.len() >= 2 * self.depth as usize {
                warn!("completion queue overrun, {} entries", cq.len());
            }
            cq.push_back(wc);
        }
        let mut armed = self.armed.lock();
        if let Some(solicited_only) = *armed {
            if solicited || !solicited_only {
                *armed = None;
                self.comp.add(1)?;
            }
        }
        Ok(())
    }

    fn fail(&self, wr_id: u64, opcode: WcOpcode, code: u32) -> Result<()> {
        let status = if code == WC_WR_FLUSH_ERR {
            WcStatus::FlushErr
        } else {
            WcStatus::Other(code, status_text(code).into())
        };
        self.complete(
            WorkCompletion {
                wr_id,
                status,
                opcode,
                byte_len: 0,
                imm_data: 0,
            },
            false,
        )
    }

    /// Moves to the error state, flushing every posted receive.
    fn flush(&self) -> Result<()> {
        self.errored.store(true, Ordering::Release);
        let recvs: Vec<(u64, Sge)> = self.recvs.lock().drain(..).collect();
        for (wr_id, _) in recvs {
            self.fail(wr_id, WcOpcode::Recv, WC_WR_FLUSH_ERR)?;
        }
        Ok(())
    }
}

fn status_text(code: u32) -> &'static str {
    match code {
        WC_LOC_LEN_ERR => "local length error",
        WC_LOC_PROT_ERR => "local protection error",
        WC_WR_FLUSH_ERR => "Work Request Flushed Error",
        WC_REM_INV_REQ_ERR => "remote invalid request error",
        WC_REM_ACCESS_ERR => "remote access error",
        WC_RETRY_EXC_ERR => "transport retry counter exceeded",
        WC_RNR_RETRY_EXC_ERR => "RNR retry counter exceeded",
        _ => "unknown",
    }
}

pub struct LoopbackQueues {
    fabric: Arc<Shared>,
    qp: Arc<QpShared>,
}

impl LoopbackQueues {
    /// Runs the checks shared by sends and writes, returning the peer and
    /// the receive consumed there, or `None` once the failure was completed.
    fn deliver(
        &self,
        sge: &Sge,
        wr_id: u64,
        opcode: WcOpcode,
    ) -> Result<Option<(Arc<QpShared>, u64, Sge)>> {
        if self.qp.errored.load(Ordering::Acquire) {
            self.qp.fail(wr_id, opcode, WC_WR_FLUSH_ERR)?;
            return Ok(None);
        }
        if !self.fabric.covers(sge.lkey, sge.addr, sge.length, Access::LOCAL) {
            self.qp.fail(wr_id, opcode, WC_LOC_PROT_ERR)?;
            return Ok(None);
        }
        let peer = self.qp.peer.lock().upgrade();
        let peer = match peer {
            Some(peer) if !peer.errored.load(Ordering::Acquire) => peer,
            _ => {
                self.qp.fail(wr_id, opcode, WC_RETRY_EXC_ERR)?;
                return Ok(None);
            }
        };
        let recv = peer.recvs.lock().pop_front();
        match recv {
            Some((recv_id, recv_sge)) => Ok(Some((peer, recv_id, recv_sge))),
            None => {
                self.qp.fail(wr_id, opcode, WC_RNR_RETRY_EXC_ERR)?;
                Ok(None)
            }
        }
    }
}

impl Queues for LoopbackQueues {
    type Region = LoopbackRegion;

    fn completion_fd(&self) -> RawFd {
        self.qp.comp.as_raw_fd()
    }

    fn register(&self, addr: *mut u8, len: usize, access: Access) -> Result<LoopbackRegion> {
        let key = self.fabric.next_key.fetch_add(1, Ordering::Relaxed);
        self.fabric.regions.lock().insert(
            key,
            RegionEntry {
                addr: addr as u64,
                len,
                access,
            },
        );
        Ok(LoopbackRegion {
            fabric: self.fabric.clone(),
            key,
        })
    }

    fn post_recv(&self, sge: Sge, wr_id: u64) -> Result<()> {
        if self.qp.errored.load(Ordering::Acquire) {
            return self.qp.fail(wr_id, WcOpcode::Recv, WC_WR_FLUSH_ERR);
        }
        if !self
            .fabric
            .covers(sge.lkey, sge.addr, sge.length, Access::LOCAL_WRITE)
        {
            return Err(Error::device(
                "ibv_post_recv",
                std::io::Error::from_raw_os_error(libc::EINVAL),
            ));
        }
        let mut recvs = self.qp.recvs.lock();
        if recvs.len() >= self.qp.depth as usize {
            return Err(Error::device(
                "ibv_post_recv",
                std::io::Error::from_raw_os_error(libc::ENOMEM),
            ));
        }
        recvs.push_back((wr_id, sge));
        Ok(())
    }

    fn post_send(&self, sge: Sge, wr_id: u64) -> Result<()> {
        let (peer, recv_id, recv_sge) = match self.deliver(&sge, wr_id, WcOpcode::Send)? {
            Some(delivery) => delivery,
            None => return Ok(()),
        };
        if recv_sge.length < sge.length {
            peer.fail(recv_id, WcOpcode::Recv, WC_LOC_LEN_ERR)?;
            return self.qp.fail(wr_id, WcOpcode::Send, WC_REM_INV_REQ_ERR);
        }
        unsafe {
            core::ptr::copy_nonoverlapping(
                sge.addr as *const u8,
                recv_sge.addr as *mut u8,
                sge.length as usize,
            )
        };
        peer.complete(
            WorkCompletion {
                wr_id: recv_id,
                status: WcStatus::Success,
                opcode: WcOpcode::Recv,
                byte_len: sge.length,
                imm_data: 0,
            },
            false,
        )?;
        self.qp.complete(
            WorkCompletion {
                wr_id,
                status: WcStatus::Success,
                opcode: WcOpcode::Send,
                byte_len: sge.length,
                imm_data: 0,
            },
            false,
        )
    }

    fn post_write_with_imm(
        &self,
        sge: Sge,
        remote_addr: u64,
        rkey: u32,
        imm_data: u32,
        wr_id: u64,
    ) -> Result<()> {
        if !self
            .fabric
            .covers(rkey, remote_addr, sge.length, Access::REMOTE_WRITE)
        {
            return self.qp.fail(wr_id, WcOpcode::RdmaWrite, WC_REM_ACCESS_ERR);
        }
        let (peer, recv_id, _) = match self.deliver(&sge, wr_id, WcOpcode::RdmaWrite)? {
            Some(delivery) => delivery,
            None => return Ok(()),
        };
        unsafe {
            core::ptr::copy_nonoverlapping(
                sge.addr as *const u8,
                remote_addr as *mut u8,
                sge.length as usize,
            )
        };
        peer.complete(
            WorkCompletion {
                wr_id: recv_id,
                status: WcStatus::Success,
                opcode: WcOpcode::RecvRdmaWithImm,
                byte_len: sge.length,
                imm_data,
            },
            true,
        )?;
        self.qp.complete(
            WorkCompletion {
                wr_id,
                status: WcStatus::Success,
                opcode: WcOpcode::RdmaWrite,
                byte_len: sge.length,
                imm_data: 0,
            },
            false,
        )
    }

    fn poll(&self, wcs: &mut Vec<WorkCompletion>, max: usize) -> Result<usize> {
        let mut cq = self.qp.cq.lock();
        let n = cq.len().min(max);
        wcs.extend(cq.drain(..n));
        Ok(n)
    }

    fn request_notify(&self, solicited_only: bool) -> Result<()> {
        *self.qp.armed.lock() = Some(solicited_only);
        Ok(())
    }

    fn consume_notification(&self) -> Result<bool> {
        Ok(self.qp.comp.take()? > 0)
    }
}

pub struct LoopbackRegion {
    fabric: Arc<Shared>,
    key: u32,
}

impl Region for LoopbackRegion {
    fn lkey(&self) -> u32 {
        self.key
    }

    fn rkey(&self) -> u32 {
        self.key
    }
}

impl Drop for LoopbackRegion {
    fn drop(&mut self) {
        self.fabric.regions.lock().remove(&self.key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn next_event(channel: &LoopbackChannel) -> CmEvent<LoopbackId> {
        channel.poll_event().unwrap().expect("no event queued")
    }

    /// A connected pair of ids with queues of depth 4.
    fn connected() -> (
        Loopback,
        (LoopbackChannel, LoopbackId, LoopbackQueues),
        (LoopbackChannel, LoopbackId, LoopbackQueues),
        LoopbackChannel,
    ) {
        let fabric = Loopback::new();
        let listen_channel = fabric.create_channel().unwrap();
        let mut listener = listen_channel.create_id().unwrap();
        listener.bind("127.0.0.1:7471".parse().unwrap()).unwrap();
        listener.listen(8).unwrap();

        let client_channel = fabric.create_channel().unwrap();
        let mut client = client_channel.create_id().unwrap();
        client
            .resolve_addr("127.0.0.1:7471".parse().unwrap(), Duration::from_secs(1))
            .unwrap();
        assert_eq!(CmEventKind::AddrResolved, next_event(&client_channel).kind);
        client.resolve_route(Duration::from_secs(1)).unwrap();
        assert_eq!(CmEventKind::RouteResolved, next_event(&client_channel).kind);
        let client_queues = client.create_queues(4).unwrap();
        client.connect(b"hello").unwrap();

        let request = next_event(&listen_channel);
        assert_eq!(CmEventKind::ConnectRequest, request.kind);
        assert_eq!(b"hello", &request.private_data[..]);
        let mut server = request.id.unwrap();
        let server_channel = fabric.create_channel().unwrap();
        server.migrate(&server_channel).unwrap();
        let server_queues = server.create_queues(4).unwrap();
        server.accept(b"world").unwrap();

        let established = next_event(&client_channel);
        assert_eq!(CmEventKind::Established, established.kind);
        assert_eq!(b"world", &established.private_data[..]);
        assert_eq!(CmEventKind::Established, next_event(&server_channel).kind);
        (
            fabric,
            (client_channel, client, client_queues),
            (server_channel, server, server_queues),
            listen_channel,
        )
    }

    #[test]
    fn connect_to_nobody_is_rejected() {
        let fabric = Loopback::new();
        let channel = fabric.create_channel().unwrap();
        let mut id = channel.create_id().unwrap();
        id.resolve_addr("127.0.0.1:1".parse().unwrap(), Duration::ZERO)
            .unwrap();
        next_event(&channel);
        id.connect(&[]).unwrap();
        let event = next_event(&channel);
        assert_eq!(CmEventKind::Rejected, event.kind);
        assert_eq!(REJECT_INVALID_SERVICE, event.status);
        assert!(channel.poll_event().unwrap().is_none());
    }

    #[test]
    fn send_consumes_posted_receive() {
        let (_fabric, (_, _client, cq), (_, _server, sq), _listen) = connected();
        let mut src = [7u8; 32];
        let mut dst = [0u8; 32];
        let src_mr = cq.register(src.as_mut_ptr(), 32, Access::LOCAL_WRITE).unwrap();
        let dst_mr = sq.register(dst.as_mut_ptr(), 32, Access::LOCAL_WRITE).unwrap();
        let sge = |addr: &mut [u8; 32], key| Sge {
            addr: addr.as_mut_ptr() as u64,
            length: 32,
            lkey: key,
        };

        cq.post_send(sge(&mut src, src_mr.lkey()), 1).unwrap();
        let mut wcs = Vec::new();
        cq.poll(&mut wcs, 8).unwrap();
        assert!(matches!(wcs[0].status, WcStatus::Other(WC_RNR_RETRY_EXC_ERR, _)));

        sq.post_recv(sge(&mut dst, dst_mr.lkey()), 9).unwrap();
        cq.post_send(sge(&mut src, src_mr.lkey()), 2).unwrap();
        wcs.clear();
        sq.poll(&mut wcs, 8).unwrap();
        assert_eq!(9, wcs[0].wr_id);
        assert_eq!(WcOpcode::Recv, wcs[0].opcode);
        assert_eq!([7u8; 32], dst);
    }

    #[test]
    fn writes_check_rkey_and_notify_solicited() {
        let (_fabric, (_, _client, cq), (_, _server, sq), _listen) = connected();
        let mut src = [3u8; 16];
        let mut sink = [0u8; 64];
        let mut recv = [0u8; 32];
        let src_mr = cq.register(src.as_mut_ptr(), 16, Access::LOCAL).unwrap();
        let sink_mr = sq
            .register(sink.as_mut_ptr(), 64, Access::LOCAL_WRITE | Access::REMOTE_WRITE)
            .unwrap();
        let recv_mr = sq.register(recv.as_mut_ptr(), 32, Access::LOCAL_WRITE).unwrap();
        let sge = Sge {
            addr: src.as_ptr() as u64,
            length: 16,
            lkey: src_mr.lkey(),
        };
        sq.post_recv(
            Sge {
                addr: recv.as_ptr() as u64,
                length: 32,
                lkey: recv_mr.lkey(),
            },
            5,
        )
        .unwrap();
        sq.request_notify(true).unwrap();

        let sink_addr = sink.as_ptr() as u64;
        cq.post_write_with_imm(sge, sink_addr + 56, sink_mr.rkey(), 0, 1)
            .unwrap();
        let mut wcs = Vec::new();
        cq.poll(&mut wcs, 8).unwrap();
        assert!(matches!(wcs[0].status, WcStatus::Other(WC_REM_ACCESS_ERR, _)));
        assert!(!sq.consume_notification().unwrap());

        cq.post_write_with_imm(sge, sink_addr + 8, sink_mr.rkey(), 0xabcd, 2)
            .unwrap();
        assert!(sq.consume_notification().unwrap());
        wcs.clear();
        sq.poll(&mut wcs, 8).unwrap();
        assert_eq!(WcOpcode::RecvRdmaWithImm, wcs[0].opcode);
        assert_eq!(0xabcd, wcs[0].imm_data);
        assert_eq!([3u8; 16], sink[8..24]);
    }

    #[test]
    fn disconnect_flushes_and_notifies_both_ends() {
        let (_fabric, (cc, mut client, _cq), (sc, _server, sq), _listen) = connected();
        let mut recv = [0u8; 32];
        let recv_mr = sq.register(recv.as_mut_ptr(), 32, Access::LOCAL_WRITE).unwrap();
        sq.post_recv(
            Sge {
                addr: recv.as_ptr() as u64,
                length: 32,
                lkey: recv_mr.lkey(),
            },
            3,
        )
        .unwrap();
        client.disconnect().unwrap();
        client.disconnect().unwrap();
        assert_eq!(CmEventKind::Disconnected, next_event(&cc).kind);
        assert_eq!(CmEventKind::Disconnected, next_event(&sc).kind);
        assert!(cc.poll_event().unwrap().is_none());
        let mut wcs = Vec::new();
        sq.poll(&mut wcs, 8).unwrap();
        assert_eq!(WcStatus::FlushErr, wcs[0].status);
    }

    #[test]
    fn listen_twice_fails() {
        let fabric = Loopback::new();
        let channel = fabric.create_channel().unwrap();
        let mut first = channel.create_id().unwrap();
        first.bind("0.0.0.0:9000".parse().unwrap()).unwrap();
        first.listen(1).unwrap();
        let mut second = channel.create_id().unwrap();
        second.bind("0.0.0.0:9000".parse().unwrap()).unwrap();
        assert!(second.listen(1).is_err());
        drop(first);
        second.listen(1).unwrap();
    }
}
