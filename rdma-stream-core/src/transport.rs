use std::os::fd::{AsRawFd, RawFd};

use tracing::{debug, error, trace, warn};

use crate::error::{Error, Result};
use crate::fabric::{
    Access, CmEvent, CmId, EventChannel, Fabric, Queues, Region, Sge, WcOpcode, WcStatus,
    WorkCompletion,
};
use crate::flow_control::FlowControl;
use crate::message_buffer::BufferPool;
use crate::messages::{
    FcPayload, Imm, Message, SetupPayload, MAX_BYTES_PER_WRITE, MESSAGE_BUFFER_SIZE,
};
use crate::notifier::Notifier;
use crate::ring_buffer::RingBuffer;
use crate::ring_ptr::{Cursor, RingPtr};
use crate::stats::Stats;

pub(crate) type QueuesOf<F> = <<F as Fabric>::Id as CmId>::Queues;
type RegionOf<F> = <QueuesOf<F> as Queues>::Region;

/// Completions handled per poll call.
const POLL_BATCH: usize = 16;

/// The sink ring buffer of the peer, as announced by its SETUP message.
#[derive(Debug)]
struct RemoteSink {
    addr: u64,
    rkey: u32,
    ptr: RingPtr,
}

/// Everything a connected endpoint owns, released in field order: memory
/// regions first, then the memory they cover, then the queues, the id and
/// finally the event channel.
pub(crate) struct Transport<F: Fabric> {
    sink_region: RegionOf<F>,
    source_region: RegionOf<F>,
    pool_region: RegionOf<F>,
    pool: BufferPool,
    sink: RingBuffer,
    source: RingBuffer,
    queues: QueuesOf<F>,
    id: F::Id,
    channel: F::Channel,

    depth: u32,
    flow: FlowControl,
    sink_ptr: RingPtr,
    source_ptr: RingPtr,
    remote: Option<RemoteSink>,
    wcs: Vec<WorkCompletion>,
}

impl<F: Fabric> Transport<F> {
    /// Creates the queues of `id`, allocates and registers the ring buffers
    /// and message buffers and posts `depth` receives.
    pub(crate) fn new(
        channel: F::Channel,
        mut id: F::Id,
        depth: u32,
        ring_size: usize,
    ) -> Result<Self> {
        let queues = id.create_queues(depth).map_err(|err| {
            error!("failed to create queue pair, {err}");
            err
        })?;
        let pool = BufferPool::new(2 * depth as usize, MESSAGE_BUFFER_SIZE)?;
        let sink = RingBuffer::new(ring_size)?;
        let source = RingBuffer::new(ring_size)?;
        let pool_region = queues.register(pool.as_ptr(), pool.len(), Access::LOCAL_WRITE)?;
        let source_region = queues.register(source.as_ptr(), source.size(), Access::LOCAL)?;
        let sink_region = queues.register(
            sink.as_ptr(),
            sink.size(),
            Access::LOCAL_WRITE | Access::REMOTE_WRITE,
        )?;
        debug!(
            "registered {} byte rings and {} message buffers, depth {depth}",
            sink.size(),
            2 * depth
        );

        let mut transport = Self {
            sink_ptr: RingPtr::new(sink.size()),
            source_ptr: RingPtr::staged(source.size()),
            sink_region,
            source_region,
            pool_region,
            pool,
            sink,
            source,
            queues,
            id,
            channel,
            depth,
            flow: FlowControl::new(depth),
            remote: None,
            wcs: Vec::with_capacity(POLL_BATCH),
        };
        let threshold = (transport.sink.size() / 4).min(u32::MAX as usize) as u32;
        transport.flow.set_fc_threshold(threshold);
        transport.post_receives(depth)?;
        Ok(transport)
    }

    pub(crate) fn id(&self) -> &F::Id {
        &self.id
    }

    pub(crate) fn id_mut(&mut self) -> &mut F::Id {
        &mut self.id
    }

    pub(crate) fn depth(&self) -> u32 {
        self.depth
    }

    pub(crate) fn cm_fd(&self) -> RawFd {
        self.channel.as_raw_fd()
    }

    pub(crate) fn completion_fd(&self) -> RawFd {
        self.queues.completion_fd()
    }

    pub(crate) fn poll_event(&self) -> Result<Option<CmEvent<F::Id>>> {
        self.channel.poll_event()
    }

    pub(crate) fn has_remote(&self) -> bool {
        self.remote.is_some()
    }

    /// Asks for an event on the next solicited completion.
    pub(crate) fn arm(&self) -> Result<()> {
        self.queues.request_notify(true)
    }

    /// Consumes a fired completion notification and re-arms it.
    pub(crate) fn rearm(&self) -> Result<()> {
        if self.queues.consume_notification()? {
            self.arm()?;
        }
        Ok(())
    }

    fn post_receives(&mut self, count: u32) -> Result<()> {
        for _ in 0..count {
            let addr = self
                .pool
                .get()
                .ok_or_else(|| Error::Internal("no free receive buffer".into()))?;
            self.post_receive(addr)?;
        }
        Ok(())
    }

    fn post_receive(&self, addr: u64) -> Result<()> {
        let sge = Sge {
            addr,
            length: MESSAGE_BUFFER_SIZE as u32,
            lkey: self.pool_region.lkey(),
        };
        self.queues.post_recv(sge, addr).map_err(|err| {
            error!("failed to post receive, {err}");
            err
        })
    }

    /// Serializes `msg` into a free message buffer and sends it. The caller
    /// accounts for the FC credit.
    fn send(&mut self, msg: &Message) -> Result<()> {
        let addr = self
            .pool
            .get()
            .ok_or_else(|| Error::Internal("no free message buffer".into()))?;
        let encoded = msg.encode_into(self.pool.slice_mut(addr)?);
        let len = match encoded {
            Ok(len) => len,
            Err(err) => {
                error!("failed to serialize {msg}, {err}");
                self.pool.free(addr)?;
                return Err(err);
            }
        };
        let sge = Sge {
            addr,
            length: len as u32,
            lkey: self.pool_region.lkey(),
        };
        trace!("sending {msg}");
        self.queues.post_send(sge, addr).map_err(|err| {
            error!("failed to post send, {err}");
            err
        })
    }

    /// Announces the local sink ring buffer.
    pub(crate) fn post_setup(&mut self) -> Result<()> {
        self.flow.start_message()?;
        let setup = SetupPayload {
            rbase: self.sink.as_ptr() as u64,
            rlen: self.sink.size() as u64,
            rkey: self.sink_region.rkey() as u64,
        };
        self.send(&Message::Setup(setup))
    }

    /// Sends owed receive progress, if an FC credit allows.
    pub(crate) fn post_fc(&mut self, stats: &mut Stats) -> Result<()> {
        if !self.flow.needs_fc() {
            return Ok(());
        }
        match self.flow.take_fc() {
            Some(fc) => self.send(&Message::Fc(fc)),
            None => {
                stats.no_credits_fc += 1;
                Ok(())
            }
        }
    }

    /// Handles every available completion.
    pub(crate) fn check_cq(&mut self, notifier: &Notifier) -> Result<()> {
        loop {
            let mut wcs = core::mem::take(&mut self.wcs);
            wcs.clear();
            let n = self.queues.poll(&mut wcs, POLL_BATCH)?;
            let handled = wcs.drain(..).try_for_each(|wc| self.handle(wc, notifier));
            self.wcs = wcs;
            handled?;
            if n < POLL_BATCH {
                return Ok(());
            }
        }
    }

    fn handle(&mut self, wc: WorkCompletion, notifier: &Notifier) -> Result<()> {
        match &wc.status {
            WcStatus::Success => {}
            WcStatus::FlushErr => {
                trace!("ignoring flushed work request {:#x}", wc.wr_id);
                return Ok(());
            }
            WcStatus::Other(code, text) => {
                error!(
                    "{:?} work request {:#x} failed, {text} ({code})",
                    wc.opcode, wc.wr_id
                );
                return Err(Error::Completion {
                    wr_id: wc.wr_id,
                    status: text.clone(),
                });
            }
        }
        match wc.opcode {
            WcOpcode::RecvRdmaWithImm => {
                let imm = Imm::from_wire(wc.imm_data);
                self.sink_ptr.incr_head(imm.bytes_sent as usize)?;
                notifier.add_available(imm.bytes_sent as u64)?;
                self.flow.on_write_received(imm)?;
                self.post_receive(wc.wr_id)
            }
            WcOpcode::Recv => {
                let msg = Message::decode(self.pool.slice(wc.wr_id, wc.byte_len as usize)?);
                // the buffer is reposted even when the message is bad
                self.post_receive(wc.wr_id)?;
                self.on_message(msg?)
            }
            WcOpcode::Send => Ok(self.pool.free(wc.wr_id)?),
            WcOpcode::RdmaWrite => Ok(self.source_ptr.incr_tail(wc.wr_id as usize)?),
            WcOpcode::Other(op) => {
                warn!("ignoring completion with opcode {op}");
                Ok(())
            }
        }
    }

    fn on_message(&mut self, msg: Message) -> Result<()> {
        trace!("received {msg}");
        match msg {
            Message::Setup(setup) => {
                if self.remote.is_some() {
                    return Err(Error::Message("repeated setup".into()));
                }
                let rlen = usize::try_from(setup.rlen)
                    .map_err(|_| Error::Message(format!("setup with length {}", setup.rlen)))?;
                let rkey = u32::try_from(setup.rkey)
                    .map_err(|_| Error::Message(format!("setup with key {:#x}", setup.rkey)))?;
                if rlen == 0 {
                    return Err(Error::Message("setup with an empty ring".into()));
                }
                debug!(
                    "remote sink at {:#x}, {rlen} bytes, key {rkey:#x}",
                    setup.rbase
                );
                self.remote = Some(RemoteSink {
                    addr: setup.rbase,
                    rkey,
                    ptr: RingPtr::new(rlen),
                });
                Ok(())
            }
            Message::Fc(fc) => self.on_fc(fc),
        }
    }

    fn on_fc(&mut self, fc: FcPayload) -> Result<()> {
        let remote = self
            .remote
            .as_mut()
            .ok_or_else(|| Error::Message("flow control before setup".into()))?;
        remote.ptr.incr_tail(fc.bytes_received as usize)?;
        self.flow.on_fc_received(&fc)?;
        Ok(())
    }

    /// Bytes that fit both the local source ring and the remote sink without
    /// wrapping either.
    pub(crate) fn writable(&self) -> usize {
        match &self.remote {
            Some(remote) => self
                .source_ptr
                .contiguous_free()
                .min(remote.ptr.contiguous_free())
                .min(MAX_BYTES_PER_WRITE as usize),
            None => 0,
        }
    }

    /// Whether the source ring or the remote sink has no room left.
    pub(crate) fn is_full(&self) -> bool {
        self.source_ptr.is_full() || self.remote.as_ref().map_or(false, |r| r.ptr.is_full())
    }

    pub(crate) fn can_write(&self) -> bool {
        self.flow.can_write()
    }

    /// Copies the head of `buf` into the source ring and writes it to the
    /// peer with one RDMA write, returning the bytes written.
    pub(crate) fn fill(&mut self, buf: &[u8]) -> Result<usize> {
        let n = buf.len().min(self.writable());
        if n == 0 {
            return Ok(0);
        }
        let (remote_addr, rkey) = match &self.remote {
            Some(remote) => (remote.addr + remote.ptr.head() as u64, remote.rkey),
            None => return Ok(0),
        };
        let offset = self.source_ptr.head();
        self.source.write_at(offset, &buf[..n]);
        self.source_ptr.incr_head(n)?;
        let imm = self.flow.start_write(n as u32)?;
        let sge = Sge {
            addr: self.source.addr_at(offset),
            length: n as u32,
            lkey: self.source_region.lkey(),
        };
        self.queues
            .post_write_with_imm(sge, remote_addr, rkey, imm.to_wire(), n as u64)
            .map_err(|err| {
                error!("failed to post rdma write of {n} bytes, {err}");
                err
            })?;
        self.source_ptr.incr(Cursor::Middle, n)?;
        if let Some(remote) = self.remote.as_mut() {
            remote.ptr.incr_head(n)?;
        }
        Ok(n)
    }

    /// Copies up to `buf.len()` of `available` received bytes out of the sink.
    pub(crate) fn drain(&mut self, buf: &mut [u8], available: usize) -> Result<usize> {
        let n = buf.len().min(available).min(self.sink_ptr.available());
        if n == 0 {
            return Ok(0);
        }
        self.sink.read_at(self.sink_ptr.tail(), &mut buf[..n]);
        self.sink_ptr.incr_tail(n)?;
        self.flow.on_drained(n as u32);
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fabric::{CmEventKind, Loopback};
    use crate::messages::ConnParamData;
    use std::time::Duration;

    fn next_event<C: EventChannel>(channel: &C) -> CmEvent<C::Id> {
        channel.poll_event().unwrap().expect("no event queued")
    }

    /// Two transports joined over the loopback fabric, setup not yet exchanged.
    fn pair(depth: u32, ring: usize) -> (Transport<Loopback>, Transport<Loopback>) {
        let fabric = Loopback::new();
        let listen_channel = fabric.create_channel().unwrap();
        let mut listener = listen_channel.create_id().unwrap();
        listener.bind("127.0.0.1:5000".parse().unwrap()).unwrap();
        listener.listen(1).unwrap();

        let client_channel = fabric.create_channel().unwrap();
        let mut client_id = client_channel.create_id().unwrap();
        client_id
            .resolve_addr("127.0.0.1:5000".parse().unwrap(), Duration::ZERO)
            .unwrap();
        client_id.resolve_route(Duration::ZERO).unwrap();
        let mut client =
            Transport::<Loopback>::new(client_channel, client_id, depth, ring).unwrap();
        let private = ConnParamData::new(depth as i32).to_bytes().unwrap();
        client.id_mut().connect(&private).unwrap();

        let request = next_event(&listen_channel);
        let server_channel = fabric.create_channel().unwrap();
        let mut server_id = request.id.unwrap();
        server_id.migrate(&server_channel).unwrap();
        let mut server =
            Transport::<Loopback>::new(server_channel, server_id, depth, ring).unwrap();
        server.id_mut().accept(&private).unwrap();
        while let Some(event) = client.poll_event().unwrap() {
            if event.kind == CmEventKind::Established {
                break;
            }
        }
        (client, server)
    }

    #[test]
    fn setup_then_write_then_fc() {
        let notifier = Notifier::new().unwrap();
        let (mut client, mut server) = pair(8, 4096);
        let mut stats = Stats::default();
        assert_eq!(0, client.writable());
        client.post_setup().unwrap();
        server.post_setup().unwrap();
        client.check_cq(&notifier).unwrap();
        server.check_cq(&notifier).unwrap();
        assert!(client.has_remote() && server.has_remote());
        let size = client.source.size();
        assert_eq!(size, client.writable());

        let payload: Vec<u8> = (0..100u8).collect();
        assert_eq!(100, client.fill(&payload).unwrap());
        assert_eq!(1, client.flow.write_credits());
        server.check_cq(&notifier).unwrap();
        assert_eq!(100, notifier.take_available().unwrap());

        let mut out = [0u8; 64];
        assert_eq!(64, server.drain(&mut out, 100).unwrap());
        assert_eq!(&payload[..64], &out[..]);
        server.post_fc(&mut stats).unwrap();
        client.check_cq(&notifier).unwrap();
        assert_eq!(2, client.flow.write_credits());
        assert_eq!(size - 100, client.writable());
    }

    #[test]
    fn writes_stop_at_ring_end() {
        let notifier = Notifier::new().unwrap();
        let (mut client, mut server) = pair(16, 4096);
        client.post_setup().unwrap();
        server.post_setup().unwrap();
        client.check_cq(&notifier).unwrap();
        server.check_cq(&notifier).unwrap();

        let size = client.source.size();
        let data = vec![0x5au8; size + 904];
        assert!(!client.is_full());
        assert_eq!(size, client.fill(&data).unwrap());
        assert!(client.is_full());
        assert_eq!(0, client.fill(&data).unwrap());
        client.check_cq(&notifier).unwrap();
        assert_eq!(0, client.writable());
    }

    #[test]
    fn long_writes_split_at_the_immediate_limit() {
        let notifier = Notifier::new().unwrap();
        let limit = MAX_BYTES_PER_WRITE as usize;
        let (mut client, mut server) = pair(16, limit + 1 + 4096);
        client.post_setup().unwrap();
        server.post_setup().unwrap();
        client.check_cq(&notifier).unwrap();
        server.check_cq(&notifier).unwrap();
        assert_eq!(limit, client.writable());

        let data = vec![0u8; limit + 100];
        let first = client.fill(&data).unwrap();
        assert_eq!(limit, first);
        assert_eq!(100, client.fill(&data[first..]).unwrap());
        server.check_cq(&notifier).unwrap();
        assert_eq!(data.len() as u64, notifier.take_available().unwrap());
    }

    #[test]
    fn fc_before_setup_is_rejected() {
        let notifier = Notifier::new().unwrap();
        let (mut client, mut server) = pair(8, 4096);
        server.flow.start_message().unwrap();
        server.send(&Message::Fc(FcPayload::default())).unwrap();
        assert!(matches!(
            client.check_cq(&notifier),
            Err(Error::Message(_))
        ));
    }
}
