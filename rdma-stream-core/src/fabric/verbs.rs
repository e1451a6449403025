//! librdmacm and libibverbs through `rdma-sys`.

use std::ffi::CStr;
use std::io;
use std::net::SocketAddr;
use std::os::fd::{AsRawFd, RawFd};
use std::ptr::{null_mut, NonNull};
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use rdma_sys::*;
use tracing::{error, warn};

use super::{
    Access, CmEvent, CmEventKind, CmId, EventChannel, Fabric, Queues, Region, Sge, WcOpcode,
    WcStatus, WorkCompletion,
};
use crate::addr::sockaddr_from_raw;
use crate::error::{Error, Result};

/// Completion events acknowledged at once.
const CQ_EVENT_ACK_BATCH: u32 = 64;
const MAX_POLL: usize = 32;
const RETRY_COUNT: u8 = 7;
const RNR_RETRY_COUNT: u8 = 7;

#[derive(Debug, Clone, Copy, Default)]
pub struct Verbs;

impl Verbs {
    pub fn new() -> Self {
        Self
    }
}

fn set_nonblocking(fd: RawFd) -> Result<()> {
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    if flags < 0 || unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) } < 0 {
        return Err(Error::last_os("fcntl"));
    }
    Ok(())
}

fn check(ret: i32, op: &'static str) -> Result<()> {
    if ret != 0 {
        let err = Error::last_os(op);
        error!("{err}");
        return Err(err);
    }
    Ok(())
}

/// Like [`check`] for the ibverbs calls that return the error number.
fn check_errno(ret: i32, op: &'static str) -> Result<()> {
    if ret != 0 {
        return Err(Error::device(op, io::Error::from_raw_os_error(ret.abs())));
    }
    Ok(())
}

fn timeout_ms(timeout: Duration) -> i32 {
    timeout.as_millis().try_into().unwrap_or(i32::MAX)
}

fn to_storage(addr: &SocketAddr) -> libc::sockaddr_storage {
    let mut storage: libc::sockaddr_storage = unsafe { core::mem::zeroed() };
    match addr {
        SocketAddr::V4(v4) => {
            let sin = &mut storage as *mut _ as *mut libc::sockaddr_in;
            unsafe {
                (*sin).sin_family = libc::AF_INET as libc::sa_family_t;
                (*sin).sin_port = v4.port().to_be();
                (*sin).sin_addr.s_addr = u32::from_ne_bytes(v4.ip().octets());
            }
        }
        SocketAddr::V6(v6) => {
            let sin6 = &mut storage as *mut _ as *mut libc::sockaddr_in6;
            unsafe {
                (*sin6).sin6_family = libc::AF_INET6 as libc::sa_family_t;
                (*sin6).sin6_port = v6.port().to_be();
                (*sin6).sin6_addr.s6_addr = v6.ip().octets();
                (*sin6).sin6_flowinfo = v6.flowinfo();
                (*sin6).sin6_scope_id = v6.scope_id();
            }
        }
    }
    storage
}

fn storage_bytes<T>(storage: &T) -> &[u8] {
    unsafe {
        core::slice::from_raw_parts(storage as *const T as *const u8, core::mem::size_of::<T>())
    }
}

fn event_kind(event: rdma_cm_event_type::Type) -> CmEventKind {
    use rdma_cm_event_type::*;
    match event {
        RDMA_CM_EVENT_ADDR_RESOLVED => CmEventKind::AddrResolved,
        RDMA_CM_EVENT_ADDR_ERROR => CmEventKind::AddrError,
        RDMA_CM_EVENT_ROUTE_RESOLVED => CmEventKind::RouteResolved,
        RDMA_CM_EVENT_ROUTE_ERROR => CmEventKind::RouteError,
        RDMA_CM_EVENT_CONNECT_REQUEST => CmEventKind::ConnectRequest,
        RDMA_CM_EVENT_CONNECT_RESPONSE => CmEventKind::ConnectResponse,
        RDMA_CM_EVENT_CONNECT_ERROR => CmEventKind::ConnectError,
        RDMA_CM_EVENT_UNREACHABLE => CmEventKind::Unreachable,
        RDMA_CM_EVENT_REJECTED => CmEventKind::Rejected,
        RDMA_CM_EVENT_ESTABLISHED => CmEventKind::Established,
        RDMA_CM_EVENT_DISCONNECTED => CmEventKind::Disconnected,
        RDMA_CM_EVENT_DEVICE_REMOVAL => CmEventKind::DeviceRemoval,
        RDMA_CM_EVENT_TIMEWAIT_EXIT => CmEventKind::TimewaitExit,
        other => CmEventKind::Other(other as u32),
    }
}

pub struct VerbsChannel {
    ptr: NonNull<rdma_event_channel>,
}

unsafe impl Send for VerbsChannel {}

impl AsRawFd for VerbsChannel {
    fn as_raw_fd(&self) -> RawFd {
        unsafe { self.ptr.as_ref().fd }
    }
}

impl Drop for VerbsChannel {
    fn drop(&mut self) {
        unsafe { rdma_destroy_event_channel(self.ptr.as_ptr()) };
    }
}

impl Fabric for Verbs {
    type Channel = VerbsChannel;
    type Id = VerbsId;

    fn create_channel(&self) -> Result<VerbsChannel> {
        let ptr = NonNull::new(unsafe { rdma_create_event_channel() })
            .ok_or_else(|| Error::last_os("rdma_create_event_channel"))?;
        let channel = VerbsChannel { ptr };
        set_nonblocking(channel.as_raw_fd())?;
        Ok(channel)
    }
}

impl EventChannel for VerbsChannel {
    type Id = VerbsId;

    fn create_id(&self) -> Result<VerbsId> {
        let mut id = null_mut();
        check(
            unsafe {
                rdma_create_id(
                    self.ptr.as_ptr(),
                    &mut id,
                    null_mut(),
                    rdma_port_space::RDMA_PS_TCP,
                )
            },
            "rdma_create_id",
        )?;
        let ptr = NonNull::new(id).ok_or_else(|| Error::Internal("null rdma_cm_id".into()))?;
        Ok(VerbsId { ptr })
    }

    fn poll_event(&self) -> Result<Option<CmEvent<VerbsId>>> {
        let mut event = null_mut();
        if unsafe { rdma_get_cm_event(self.ptr.as_ptr(), &mut event) } != 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::WouldBlock {
                return Ok(None);
            }
            return Err(Error::device("rdma_get_cm_event", err));
        }
        let cm_event = unsafe {
            let kind = event_kind((*event).event);
            let private_data = match kind {
                CmEventKind::ConnectRequest
                | CmEventKind::ConnectResponse
                | CmEventKind::Established
                | CmEventKind::Rejected => {
                    let conn = &(*event).param.conn;
                    if conn.private_data.is_null() {
                        Vec::new()
                    } else {
                        core::slice::from_raw_parts(
                            conn.private_data as *const u8,
                            conn.private_data_len as usize,
                        )
                        .to_vec()
                    }
                }
                _ => Vec::new(),
            };
            let id = match kind {
                CmEventKind::ConnectRequest => NonNull::new((*event).id).map(|ptr| VerbsId { ptr }),
                _ => None,
            };
            CmEvent {
                kind,
                id,
                private_data,
                status: (*event).status,
            }
        };
        if unsafe { rdma_ack_cm_event(event) } != 0 {
            warn!(
                "failed to ack connection manager event, {}",
                io::Error::last_os_error()
            );
        }
        Ok(Some(cm_event))
    }
}

pub struct VerbsId {
    ptr: NonNull<rdma_cm_id>,
}

unsafe impl Send for VerbsId {}

impl Drop for VerbsId {
    fn drop(&mut self) {
        if unsafe { rdma_destroy_id(self.ptr.as_ptr()) } != 0 {
            error!("failed to destroy id, {}", io::Error::last_os_error());
        }
    }
}

impl VerbsId {
    fn conn_param(private_data: &[u8]) -> rdma_conn_param {
        let mut param: rdma_conn_param = unsafe { core::mem::zeroed() };
        param.private_data = private_data.as_ptr() as *const _;
        param.private_data_len = private_data.len().min(u8::MAX as usize) as u8;
        param.responder_resources = 1;
        param.initiator_depth = 1;
        param.retry_count = RETRY_COUNT;
        param.rnr_retry_count = RNR_RETRY_COUNT;
        param
    }
}

impl CmId for VerbsId {
    type Channel = VerbsChannel;
    type Queues = VerbsQueues;

    fn resolve_addr(&mut self, dst: SocketAddr, timeout: Duration) -> Result<()> {
        let mut dst = to_storage(&dst);
        check(
            unsafe {
                rdma_resolve_addr(
                    self.ptr.as_ptr(),
                    null_mut(),
                    &mut dst as *mut _ as *mut _,
                    timeout_ms(timeout),
                )
            },
            "rdma_resolve_addr",
        )
    }

    fn resolve_route(&mut self, timeout: Duration) -> Result<()> {
        check(
            unsafe { rdma_resolve_route(self.ptr.as_ptr(), timeout_ms(timeout)) },
            "rdma_resolve_route",
        )
    }

    fn bind(&mut self, addr: SocketAddr) -> Result<()> {
        let mut addr = to_storage(&addr);
        check(
            unsafe { rdma_bind_addr(self.ptr.as_ptr(), &mut addr as *mut _ as *mut _) },
            "rdma_bind_addr",
        )
    }

    fn listen(&mut self, backlog: i32) -> Result<()> {
        check(unsafe { rdma_listen(self.ptr.as_ptr(), backlog) }, "rdma_listen")
    }

    fn migrate(&mut self, channel: &VerbsChannel) -> Result<()> {
        check(
            unsafe { rdma_migrate_id(self.ptr.as_ptr(), channel.ptr.as_ptr()) },
            "rdma_migrate_id",
        )
    }

    fn connect(&mut self, private_data: &[u8]) -> Result<()> {
        let mut param = Self::conn_param(private_data);
        check(
            unsafe { rdma_connect(self.ptr.as_ptr(), &mut param) },
            "rdma_connect",
        )
    }

    fn accept(&mut self, private_data: &[u8]) -> Result<()> {
        let mut param = Self::conn_param(private_data);
        check(
            unsafe { rdma_accept(self.ptr.as_ptr(), &mut param) },
            "rdma_accept",
        )
    }

    fn reject(&mut self, private_data: &[u8]) -> Result<()> {
        check(
            unsafe {
                rdma_reject(
                    self.ptr.as_ptr(),
                    private_data.as_ptr() as *const _,
                    private_data.len().min(u8::MAX as usize) as u8,
                )
            },
            "rdma_reject",
        )
    }

    fn disconnect(&mut self) -> Result<()> {
        check(
            unsafe { rdma_disconnect(self.ptr.as_ptr()) },
            "rdma_disconnect",
        )
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        let storage = unsafe { &self.ptr.as_ref().route.addr.__bindgen_anon_1.src_storage };
        sockaddr_from_raw(storage_bytes(storage))
    }

    fn peer_addr(&self) -> Option<SocketAddr> {
        let storage = unsafe { &self.ptr.as_ref().route.addr.__bindgen_anon_2.dst_storage };
        sockaddr_from_raw(storage_bytes(storage))
    }

    fn device_name(&self) -> Option<String> {
        unsafe {
            let verbs = self.ptr.as_ref().verbs;
            if verbs.is_null() {
                return None;
            }
            let name = ibv_get_device_name((*verbs).device);
            if name.is_null() {
                return None;
            }
            Some(CStr::from_ptr(name).to_string_lossy().into_owned())
        }
    }

    fn create_queues(&mut self, depth: u32) -> Result<VerbsQueues> {
        let id = self.ptr.as_ptr();
        let ctx = unsafe { (*id).verbs };
        if ctx.is_null() {
            return Err(Error::Internal("id is not bound to a device".into()));
        }
        let cq_depth = depth
            .checked_mul(2)
            .and_then(|n| i32::try_from(n).ok())
            .ok_or_else(|| Error::Internal(format!("queue depth {depth} too large")))?;
        // Partially built queues are released by drop.
        let mut queues = VerbsQueues {
            id,
            pd: null_mut(),
            comp_channel: null_mut(),
            cq: null_mut(),
            qp: null_mut(),
            unacked: AtomicU32::new(0),
        };
        queues.pd = unsafe { ibv_alloc_pd(ctx) };
        if queues.pd.is_null() {
            return Err(Error::last_os("ibv_alloc_pd"));
        }
        queues.comp_channel = unsafe { ibv_create_comp_channel(ctx) };
        if queues.comp_channel.is_null() {
            return Err(Error::last_os("ibv_create_comp_channel"));
        }
        set_nonblocking(unsafe { (*queues.comp_channel).fd })?;
        queues.cq = unsafe {
            ibv_create_cq(
                ctx,
                cq_depth,
                null_mut(),
                queues.comp_channel,
                0,
            )
        };
        if queues.cq.is_null() {
            return Err(Error::last_os("ibv_create_cq"));
        }

        let mut attr: ibv_qp_init_attr = unsafe { core::mem::zeroed() };
        attr.send_cq = queues.cq;
        attr.recv_cq = queues.cq;
        attr.cap.max_send_wr = depth;
        attr.cap.max_recv_wr = depth;
        attr.cap.max_send_sge = 1;
        attr.cap.max_recv_sge = 1;
        attr.qp_type = ibv_qp_type::IBV_QPT_RC;
        attr.sq_sig_all = 1;
        check(
            unsafe { rdma_create_qp(id, queues.pd, &mut attr) },
            "rdma_create_qp",
        )?;
        queues.qp = unsafe { (*id).qp };
        Ok(queues)
    }
}

pub struct VerbsQueues {
    id: *mut rdma_cm_id,
    pd: *mut ibv_pd,
    comp_channel: *mut ibv_comp_channel,
    cq: *mut ibv_cq,
    qp: *mut ibv_qp,
    unacked: AtomicU32,
}

unsafe impl Send for VerbsQueues {}

impl VerbsQueues {
    fn post_send_wr(&self, wr: &mut ibv_send_wr, op: &'static str) -> Result<()> {
        let mut bad_wr = null_mut();
        check_errno(unsafe { ibv_post_send(self.qp, wr, &mut bad_wr) }, op)
    }
}

impl Drop for VerbsQueues {
    fn drop(&mut self) {
        unsafe {
            let unacked = self.unacked.swap(0, Ordering::AcqRel);
            if unacked > 0 && !self.cq.is_null() {
                ibv_ack_cq_events(self.cq, unacked);
            }
            if !self.qp.is_null() {
                rdma_destroy_qp(self.id);
            }
            if !self.cq.is_null() && ibv_destroy_cq(self.cq) != 0 {
                error!("failed to destroy completion queue");
            }
            if !self.comp_channel.is_null() && ibv_destroy_comp_channel(self.comp_channel) != 0 {
                error!("failed to destroy completion channel");
            }
            if !self.pd.is_null() && ibv_dealloc_pd(self.pd) != 0 {
                error!("failed to deallocate protection domain");
            }
        }
    }
}

impl Queues for VerbsQueues {
    type Region = VerbsRegion;

    fn completion_fd(&self) -> RawFd {
        unsafe { (*self.comp_channel).fd }
    }

    fn register(&self, addr: *mut u8, len: usize, access: Access) -> Result<VerbsRegion> {
        let mut flags = 0;
        if access.contains(Access::LOCAL_WRITE) {
            flags |= ibv_access_flags::IBV_ACCESS_LOCAL_WRITE.0;
        }
        if access.contains(Access::REMOTE_WRITE) {
            flags |= ibv_access_flags::IBV_ACCESS_REMOTE_WRITE.0;
        }
        let mr = unsafe { ibv_reg_mr(self.pd, addr as *mut _, len, flags as i32) };
        let mr = NonNull::new(mr).ok_or_else(|| Error::last_os("ibv_reg_mr"))?;
        Ok(VerbsRegion { mr })
    }

    fn post_recv(&self, sge: Sge, wr_id: u64) -> Result<()> {
        let mut sge = ibv_sge {
            addr: sge.addr,
            length: sge.length,
            lkey: sge.lkey,
        };
        let mut wr: ibv_recv_wr = unsafe { core::mem::zeroed() };
        wr.wr_id = wr_id;
        wr.sg_list = &mut sge;
        wr.num_sge = 1;
        let mut bad_wr = null_mut();
        check_errno(
            unsafe { ibv_post_recv(self.qp, &mut wr, &mut bad_wr) },
            "ibv_post_recv",
        )
    }

    fn post_send(&self, sge: Sge, wr_id: u64) -> Result<()> {
        let mut sge = ibv_sge {
            addr: sge.addr,
            length: sge.length,
            lkey: sge.lkey,
        };
        let mut wr: ibv_send_wr = unsafe { core::mem::zeroed() };
        wr.wr_id = wr_id;
        wr.sg_list = &mut sge;
        wr.num_sge = 1;
        wr.opcode = ibv_wr_opcode::IBV_WR_SEND;
        wr.send_flags = ibv_send_flags::IBV_SEND_SIGNALED.0;
        self.post_send_wr(&mut wr, "ibv_post_send")
    }

    fn post_write_with_imm(
        &self,
        sge: Sge,
        remote_addr: u64,
        rkey: u32,
        imm_data: u32,
        wr_id: u64,
    ) -> Result<()> {
        let mut sge = ibv_sge {
            addr: sge.addr,
            length: sge.length,
            lkey: sge.lkey,
        };
        let mut wr: ibv_send_wr = unsafe { core::mem::zeroed() };
        wr.wr_id = wr_id;
        wr.sg_list = &mut sge;
        wr.num_sge = 1;
        wr.opcode = ibv_wr_opcode::IBV_WR_RDMA_WRITE_WITH_IMM;
        wr.send_flags =
            ibv_send_flags::IBV_SEND_SIGNALED.0 | ibv_send_flags::IBV_SEND_SOLICITED.0;
        wr.imm_data_invalidated_rkey_union = imm_data_invalidated_rkey_union_t { imm_data };
        wr.wr.rdma.remote_addr = remote_addr;
        wr.wr.rdma.rkey = rkey;
        self.post_send_wr(&mut wr, "ibv_post_send")
    }

    fn poll(&self, wcs: &mut Vec<WorkCompletion>, max: usize) -> Result<usize> {
        let mut raw: [ibv_wc; MAX_POLL] = unsafe { core::mem::zeroed() };
        let n = unsafe { ibv_poll_cq(self.cq, max.min(MAX_POLL) as i32, raw.as_mut_ptr()) };
        if n < 0 {
            return Err(Error::device("ibv_poll_cq", io::Error::from_raw_os_error(-n)));
        }
        for wc in &raw[..n as usize] {
            let status = match wc.status {
                ibv_wc_status::IBV_WC_SUCCESS => WcStatus::Success,
                ibv_wc_status::IBV_WC_WR_FLUSH_ERR => WcStatus::FlushErr,
                status => {
                    let text = unsafe { CStr::from_ptr(ibv_wc_status_str(status)) };
                    WcStatus::Other(status as u32, text.to_string_lossy().into_owned())
                }
            };
            let opcode = match wc.opcode {
                ibv_wc_opcode::IBV_WC_SEND => WcOpcode::Send,
                ibv_wc_opcode::IBV_WC_RDMA_WRITE => WcOpcode::RdmaWrite,
                ibv_wc_opcode::IBV_WC_RECV => WcOpcode::Recv,
                ibv_wc_opcode::IBV_WC_RECV_RDMA_WITH_IMM => WcOpcode::RecvRdmaWithImm,
                other => WcOpcode::Other(other as u32),
            };
            wcs.push(WorkCompletion {
                wr_id: wc.wr_id,
                status,
                opcode,
                byte_len: wc.byte_len,
                imm_data: unsafe { wc.imm_data_invalidated_rkey_union.imm_data },
            });
        }
        Ok(n as usize)
    }

    fn request_notify(&self, solicited_only: bool) -> Result<()> {
        check_errno(
            unsafe { ibv_req_notify_cq(self.cq, solicited_only as i32) },
            "ibv_req_notify_cq",
        )
    }

    fn consume_notification(&self) -> Result<bool> {
        let mut cq = null_mut();
        let mut ctx = null_mut();
        if unsafe { ibv_get_cq_event(self.comp_channel, &mut cq, &mut ctx) } != 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::WouldBlock {
                return Ok(false);
            }
            return Err(Error::device("ibv_get_cq_event", err));
        }
        let unacked = self.unacked.fetch_add(1, Ordering::AcqRel) + 1;
        if unacked >= CQ_EVENT_ACK_BATCH {
            self.unacked.fetch_sub(unacked, Ordering::AcqRel);
            unsafe { ibv_ack_cq_events(self.cq, unacked) };
        }
        Ok(true)
    }
}

pub struct VerbsRegion {
    mr: NonNull<ibv_mr>,
}

unsafe impl Send for VerbsRegion {}

impl Region for VerbsRegion {
    fn lkey(&self) -> u32 {
        unsafe { self.mr.as_ref().lkey }
    }

    fn rkey(&self) -> u32 {
        unsafe { self.mr.as_ref().rkey }
    }
}

impl Drop for VerbsRegion {
    fn drop(&mut self) {
        if unsafe { ibv_dereg_mr(self.mr.as_ptr()) } != 0 {
            error!("failed to deregister memory region");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    #[ignore = "needs an RDMA device"]
    fn resolves_local_device() {
        let fabric = Verbs::new();
        let channel = fabric.create_channel().unwrap();
        let mut id = channel.create_id().unwrap();
        id.resolve_addr("127.0.0.1:7471".parse().unwrap(), Duration::from_secs(2))
            .unwrap();
        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        let event = loop {
            if let Some(event) = channel.poll_event().unwrap() {
                break event;
            }
            assert!(std::time::Instant::now() < deadline, "no address event");
            std::thread::yield_now();
        };
        assert_eq!(CmEventKind::AddrResolved, event.kind);
        assert!(id.device_name().is_some());
    }

    #[test]
    fn maps_addresses_to_storage() {
        let addr: SocketAddr = "10.1.2.3:4791".parse().unwrap();
        let storage = to_storage(&addr);
        assert_eq!(Some(addr), sockaddr_from_raw(storage_bytes(&storage)));
        let addr: SocketAddr = "[fe80::2]:4791".parse().unwrap();
        assert_eq!(Some(addr), sockaddr_from_raw(storage_bytes(&to_storage(&addr))));
    }
}
