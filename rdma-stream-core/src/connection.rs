//! The connection state machine and the blocking byte-stream API.
//!
//! ```text
//! CLOSED -> CONNECTING -> LISTENING | CONNECTED -> CLOSING -> CLOSED
//! ```
//!
//! Handshake steps run without the connection lock; read, write and close
//! take it once per loop iteration, so a concurrent [`Connection::close`]
//! is observed by spinning calls on their next iteration.

use std::net::ToSocketAddrs;
use std::os::fd::{AsRawFd, RawFd};
use std::time::Duration;

use spin::Mutex;
use tracing::{debug, error, info, warn};

use crate::addr::{describe, lookup};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::fabric::{CmEvent, CmEventKind, CmId, EventChannel, Fabric};
use crate::flow_control::{MAX_DEPTH, MIN_DEPTH};
use crate::messages::ConnParamData;
use crate::notifier::{Notifier, Source};
use crate::stats::Stats;
use crate::transport::Transport;
use crate::utils::{relax, Deadline};

const LISTEN_BACKLOG: i32 = 16;
/// Longest single sleep of a thread waiting in [`Connection::accept`].
const ACCEPT_POLL_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Closed,
    Connecting,
    Listening,
    Connected,
    Closing,
}

/// Addresses and device of a connection, for logging.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Description {
    pub local: String,
    pub peer: String,
    pub device: String,
}

enum Link<F: Fabric> {
    Listener { id: F::Id, channel: F::Channel },
    Stream(Transport<F>),
}

struct Inner<F: Fabric> {
    state: State,
    established: bool,
    link: Option<Link<F>>,
    description: Description,
    stats: Stats,
}

/// One endpoint of an RDMA byte stream, or a listener producing them.
pub struct Connection<F: Fabric> {
    fabric: F,
    config: Config,
    notifier: Notifier,
    inner: Mutex<Inner<F>>,
}

impl<F: Fabric> Connection<F> {
    pub fn new(fabric: F, config: Config) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            fabric,
            config,
            notifier: Notifier::new()?,
            inner: Mutex::new(Inner {
                state: State::Closed,
                established: false,
                link: None,
                description: Description::default(),
                stats: Stats::default(),
            }),
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn state(&self) -> State {
        self.inner.lock().state
    }

    pub fn is_established(&self) -> bool {
        self.inner.lock().established
    }

    pub fn stats(&self) -> Stats {
        self.inner.lock().stats
    }

    pub fn description(&self) -> Description {
        self.inner.lock().description.clone()
    }

    pub fn local_address(&self) -> String {
        self.inner.lock().description.local.clone()
    }

    pub fn peer_address(&self) -> String {
        self.inner.lock().description.peer.clone()
    }

    pub fn device_name(&self) -> String {
        self.inner.lock().description.device.clone()
    }

    /// Negotiated queue depth of a connected endpoint.
    pub fn depth(&self) -> Option<u32> {
        match &self.inner.lock().link {
            Some(Link::Stream(transport)) => Some(transport.depth()),
            _ => None,
        }
    }

    /// Descriptor that polls readable when received bytes, completions or
    /// connection events are pending.
    pub fn notifier(&self) -> RawFd {
        self.notifier.as_raw_fd()
    }

    /// Moves from CLOSED to CONNECTING.
    fn begin(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.state != State::Closed {
            return Err(Error::State(inner.state));
        }
        inner.state = State::Connecting;
        Ok(())
    }

    /// Leaves CONNECTING after a failed handshake step.
    fn abandon(&self, what: &str, err: &Error) {
        error!("failed to {what}, {err}");
        let mut inner = self.inner.lock();
        if inner.state == State::Connecting {
            inner.state = State::Closed;
        }
        // drop what a racing close may have left behind
        let _ = self.notifier.take_available();
    }

    /// Installs a completed handshake unless the connection was closed
    /// meanwhile.
    fn establish(&self, (transport, established): (Transport<F>, bool)) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.state != State::Connecting {
            warn!("connection closed during handshake");
            return Err(Error::State(inner.state));
        }
        let id = transport.id();
        inner.description = Description {
            local: id.local_addr().map(|addr| describe(&addr)).unwrap_or_default(),
            peer: id.peer_addr().map(|addr| describe(&addr)).unwrap_or_default(),
            device: id.device_name().unwrap_or_default(),
        };
        info!(
            "connected {} <-> {} on {}, depth {}",
            inner.description.local,
            inner.description.peer,
            inner.description.device,
            transport.depth()
        );
        inner.link = Some(Link::Stream(transport));
        inner.established = established;
        inner.state = State::Connected;
        Ok(())
    }

    fn register(&self, transport: &Transport<F>) -> Result<()> {
        self.notifier.register(Source::Cm, transport.cm_fd())?;
        self.notifier
            .register(Source::Completion, transport.completion_fd())
    }

    /// Connects to a listening peer.
    pub fn connect<A: ToSocketAddrs>(&self, addr: A) -> Result<()> {
        self.begin()?;
        match self.initiate(addr) {
            Ok(handshake) => self.establish(handshake),
            Err(err) => {
                self.abandon("connect", &err);
                Err(err)
            }
        }
    }

    fn initiate<A: ToSocketAddrs>(&self, addr: A) -> Result<(Transport<F>, bool)> {
        let dst = lookup(addr)?;
        let resolve_timeout = self.config.resolve_timeout();
        let resolve = Deadline::after(Some(resolve_timeout));
        let deadline = Deadline::after(self.config.timeout());

        let channel = self.fabric.create_channel()?;
        let mut id = channel.create_id()?;
        id.resolve_addr(dst, resolve_timeout)
            .map_err(|err| Error::Resolve {
                what: "address",
                reason: err.to_string(),
            })?;
        wait_event(
            || channel.poll_event(),
            CmEventKind::AddrResolved,
            resolve,
            "resolving address",
        )?;
        id.resolve_route(resolve_timeout)
            .map_err(|err| Error::Resolve {
                what: "route",
                reason: err.to_string(),
            })?;
        wait_event(
            || channel.poll_event(),
            CmEventKind::RouteResolved,
            resolve,
            "resolving route",
        )?;
        debug!("resolved {dst}");

        let depth = self.config.send_queue_depth;
        let mut transport =
            Transport::new(channel, id, depth, self.config.ring_buffer_size())?;
        self.register(&transport)?;
        transport
            .id_mut()
            .connect(&ConnParamData::new(depth as i32).to_bytes()?)?;
        let event = wait_event(
            || transport.poll_event(),
            CmEventKind::Established,
            deadline,
            "waiting for the connection",
        )?;
        let result = ConnParamData::from_bytes(&event.private_data)
            .check()
            .and_then(|()| {
                transport.arm()?;
                transport.post_setup()?;
                self.wait_setup(&mut transport, deadline)
            });
        match result {
            Ok(established) => Ok((transport, established)),
            Err(err) => {
                hang_up(&mut transport);
                Err(err)
            }
        }
    }

    /// Waits for the peer's SETUP message, returning whether the peer is
    /// still connected.
    fn wait_setup(&self, transport: &mut Transport<F>, deadline: Deadline) -> Result<bool> {
        loop {
            // events first: a disconnect seen here follows any completion
            // polled below
            let event = transport.poll_event()?;
            transport.check_cq(&self.notifier)?;
            match event.map(|event| event.kind) {
                None => {}
                Some(CmEventKind::Disconnected) if transport.has_remote() => {
                    debug!("peer disconnected right after setup");
                    return Ok(false);
                }
                Some(CmEventKind::Disconnected) => return Err(Error::Disconnected),
                Some(got) => {
                    return Err(Error::UnexpectedEvent {
                        got,
                        expected: CmEventKind::Disconnected,
                    })
                }
            }
            if transport.has_remote() {
                return Ok(true);
            }
            deadline.check("waiting for setup")?;
            relax();
        }
    }

    /// Binds to `addr` and waits for connect requests.
    pub fn listen<A: ToSocketAddrs>(&self, addr: A) -> Result<()> {
        self.begin()?;
        let (id, channel) = match self.bind(addr) {
            Ok(bound) => bound,
            Err(err) => {
                self.abandon("listen", &err);
                return Err(err);
            }
        };
        let mut inner = self.inner.lock();
        if inner.state != State::Connecting {
            return Err(Error::State(inner.state));
        }
        inner.description = Description {
            local: id.local_addr().map(|addr| describe(&addr)).unwrap_or_default(),
            peer: String::new(),
            device: id.device_name().unwrap_or_default(),
        };
        info!("listening on {}", inner.description.local);
        inner.link = Some(Link::Listener { id, channel });
        inner.state = State::Listening;
        Ok(())
    }

    fn bind<A: ToSocketAddrs>(&self, addr: A) -> Result<(F::Id, F::Channel)> {
        let addr = lookup(addr)?;
        let channel = self.fabric.create_channel()?;
        let mut id = channel.create_id()?;
        id.bind(addr).map_err(|err| Error::Resolve {
            what: "bind address",
            reason: err.to_string(),
        })?;
        id.listen(LISTEN_BACKLOG)?;
        self.notifier.register(Source::Cm, channel.as_raw_fd())?;
        Ok((id, channel))
    }

    /// Waits for the next connect request and completes its handshake.
    ///
    /// A request with a foreign protocol is rejected and reported as
    /// [`Error::ProtocolMismatch`], one proposing a queue deeper than
    /// [`MAX_DEPTH`] as [`Error::DepthOutOfRange`]; the listener keeps
    /// listening.
    pub fn accept(&self) -> Result<Connection<F>> {
        let deadline = Deadline::after(self.config.timeout());
        let event = loop {
            if let Some(event) = self.next_request()? {
                break event;
            }
            deadline.check("waiting for a connect request")?;
            let wait = deadline
                .remaining()
                .map_or(ACCEPT_POLL_INTERVAL, |left| left.min(ACCEPT_POLL_INTERVAL));
            self.notifier.wait(Some(wait))?;
        };
        let id = event
            .id
            .ok_or_else(|| Error::Internal("connect request without an id".into()))?;
        let child = Connection::new(self.fabric.clone(), self.config)?;
        child.respond(id, &event.private_data)?;
        Ok(child)
    }

    fn next_request(&self) -> Result<Option<CmEvent<F::Id>>> {
        let inner = self.inner.lock();
        if inner.state != State::Listening {
            return Err(Error::State(inner.state));
        }
        let channel = match &inner.link {
            Some(Link::Listener { channel, .. }) => channel,
            _ => return Err(Error::Internal("listening without a listener".into())),
        };
        while let Some(event) = channel.poll_event()? {
            match event.kind {
                CmEventKind::ConnectRequest => return Ok(Some(event)),
                kind => warn!("ignoring {kind:?} on a listening id"),
            }
        }
        Ok(None)
    }

    /// Accepts `id` as this connection.
    fn respond(&self, id: F::Id, private_data: &[u8]) -> Result<()> {
        self.begin()?;
        match self.answer(id, private_data) {
            Ok(handshake) => self.establish(handshake),
            Err(err) => {
                self.abandon("accept", &err);
                Err(err)
            }
        }
    }

    fn answer(&self, mut id: F::Id, private_data: &[u8]) -> Result<(Transport<F>, bool)> {
        let proposal = ConnParamData::from_bytes(private_data);
        let checked = proposal.check().and_then(|_| {
            if proposal.depth > MAX_DEPTH as i32 {
                Err(Error::DepthOutOfRange(proposal.depth))
            } else {
                Ok(proposal.depth.max(MIN_DEPTH as i32) as u32)
            }
        });
        let depth = match checked {
            Ok(depth) => depth,
            Err(err) => {
                warn!("rejecting connect request, {err}");
                if let Err(reject) = id.reject(&[]) {
                    warn!("failed to reject connect request, {reject}");
                }
                return Err(err);
            }
        };
        let deadline = Deadline::after(self.config.timeout());
        if let Some(peer) = id.peer_addr() {
            debug!("connect request from {peer}, depth {depth}");
        }

        let channel = self.fabric.create_channel()?;
        id.migrate(&channel)?;
        let mut transport =
            Transport::new(channel, id, depth, self.config.ring_buffer_size())?;
        self.register(&transport)?;
        transport
            .id_mut()
            .accept(&ConnParamData::new(depth as i32).to_bytes()?)?;
        let result = wait_event(
            || transport.poll_event(),
            CmEventKind::Established,
            deadline,
            "waiting for the connection",
        )
        .and_then(|_| {
            transport.arm()?;
            let established = self.wait_setup(&mut transport, deadline)?;
            if established {
                transport.post_setup()?;
            }
            Ok(established)
        });
        match result {
            Ok(established) => Ok((transport, established)),
            Err(err) => {
                hang_up(&mut transport);
                Err(err)
            }
        }
    }

    /// Reads received bytes into `buf`.
    ///
    /// Returns `Ok(0)` only for an empty `buf` or a non-blocking read with
    /// nothing received, and [`Error::EndOfStream`] once the peer
    /// disconnected and every received byte was read. Any other failure,
    /// including a timeout, closes the connection.
    pub fn read(&self, buf: &mut [u8], block: bool) -> Result<usize> {
        let deadline = Deadline::after(self.config.timeout());
        loop {
            let progress = self.inner.lock().read_once(&self.notifier, buf, block);
            match progress {
                Ok(Some(n)) => return Ok(n),
                Ok(None) => {}
                Err(err @ (Error::EndOfStream | Error::State(_))) => return Err(err),
                Err(err) => return Err(self.fail("read", err)),
            }
            if let Err(err) = deadline.check("reading") {
                return Err(self.fail("read", err));
            }
            relax();
        }
    }

    /// Writes a prefix of `buf` with one RDMA write, returning its length.
    ///
    /// Waits for write credit and ring space until the timeout, which fails
    /// the call but keeps the connection.
    pub fn write(&self, buf: &[u8]) -> Result<usize> {
        let deadline = Deadline::after(self.config.timeout());
        loop {
            let progress = self.inner.lock().write_once(&self.notifier, buf);
            match progress {
                Ok(Some(n)) => return Ok(n),
                Ok(None) => {}
                Err(err @ (Error::State(_) | Error::Disconnected)) => return Err(err),
                Err(err) => return Err(self.fail("write", err)),
            }
            deadline.check("writing")?;
            relax();
        }
    }

    /// Writes all of `buf`, as many RDMA writes as it takes.
    pub fn write_all(&self, mut buf: &[u8]) -> Result<()> {
        while !buf.is_empty() {
            let n = self.write(buf)?;
            buf = &buf[n..];
        }
        Ok(())
    }

    fn fail(&self, what: &str, err: Error) -> Error {
        error!("failed to {what}, {err}");
        self.close();
        err
    }

    /// Disconnects and releases every resource. Closing a closed connection
    /// does nothing.
    pub fn close(&self) {
        let link = {
            let mut inner = self.inner.lock();
            if matches!(inner.state, State::Closed | State::Closing) {
                return;
            }
            debug!("closing connection in state {:?}", inner.state);
            inner.state = State::Closing;
            let mut link = inner.link.take();
            if inner.established {
                if let Some(Link::Stream(transport)) = link.as_mut() {
                    hang_up(transport);
                }
            }
            inner.established = false;
            link
        };
        if let Some(link) = link {
            self.release(link);
        }
        let _ = self.notifier.take_available();
        let mut inner = self.inner.lock();
        inner.state = State::Closed;
        debug!("closed, {}", inner.stats);
    }

    fn release(&self, link: Link<F>) {
        let fds = match &link {
            Link::Listener { id, channel } => {
                debug!("releasing listener on {:?}", id.local_addr());
                vec![channel.as_raw_fd()]
            }
            Link::Stream(transport) => vec![transport.cm_fd(), transport.completion_fd()],
        };
        for fd in fds {
            if let Err(err) = self.notifier.deregister(fd) {
                debug!("failed to deregister {fd}, {err}");
            }
        }
    }
}

impl<F: Fabric> Inner<F> {
    /// The transport and statistics of a connected endpoint, borrowed apart.
    fn parts(&mut self) -> Result<(&mut Transport<F>, &mut Stats)> {
        match self.link.as_mut() {
            Some(Link::Stream(transport)) => Ok((transport, &mut self.stats)),
            _ => Err(Error::Internal("connected without a transport".into())),
        }
    }

    /// Handles pending connection manager events.
    fn check_disconnected(&mut self) -> Result<()> {
        let mut disconnected = false;
        {
            let (transport, _) = self.parts()?;
            while let Some(event) = transport.poll_event()? {
                match event.kind {
                    CmEventKind::Disconnected => disconnected = true,
                    CmEventKind::TimewaitExit => {}
                    got => {
                        error!("unexpected {got:?} on an established connection");
                        return Err(Error::UnexpectedEvent {
                            got,
                            expected: CmEventKind::Disconnected,
                        });
                    }
                }
            }
        }
        if disconnected && self.established {
            info!("peer {} disconnected", self.description.peer);
            self.established = false;
        }
        Ok(())
    }

    fn read_once(
        &mut self,
        notifier: &Notifier,
        buf: &mut [u8],
        block: bool,
    ) -> Result<Option<usize>> {
        if self.state != State::Connected {
            return Err(Error::State(self.state));
        }
        self.check_disconnected()?;
        let established = self.established;
        let (transport, stats) = self.parts()?;
        transport.rearm()?;
        transport.check_cq(notifier)?;

        // one FC per iteration, after draining, reports both writes and bytes
        let available = if buf.is_empty() {
            0
        } else {
            notifier.take_available()? as usize
        };
        let drained = if available > 0 {
            let n = transport.drain(buf, available)?;
            notifier.add_available((available - n) as u64)?;
            stats.reads += 1;
            Some(n)
        } else {
            None
        };
        if established {
            transport.post_fc(stats)?;
        }
        if buf.is_empty() {
            return Ok(Some(0));
        }
        if drained.is_some() {
            return Ok(drained);
        }
        if !established {
            return Err(Error::EndOfStream);
        }
        stats.buffer_empty += 1;
        Ok(if block { None } else { Some(0) })
    }

    fn write_once(&mut self, notifier: &Notifier, buf: &[u8]) -> Result<Option<usize>> {
        if self.state != State::Connected {
            return Err(Error::State(self.state));
        }
        self.check_disconnected()?;
        if !self.established {
            return Err(Error::Disconnected);
        }
        let (transport, stats) = self.parts()?;
        transport.rearm()?;
        transport.check_cq(notifier)?;
        if buf.is_empty() {
            return Ok(Some(0));
        }
        if !transport.can_write() {
            stats.no_credits_rdma += 1;
            return Ok(None);
        }
        let n = transport.fill(buf)?;
        if n == 0 {
            if transport.is_full() {
                stats.buffer_full += 1;
            }
            return Ok(None);
        }
        stats.writes += 1;
        Ok(Some(n))
    }
}

impl<F: Fabric> AsRawFd for Connection<F> {
    fn as_raw_fd(&self) -> RawFd {
        self.notifier.as_raw_fd()
    }
}

impl<F: Fabric> Drop for Connection<F> {
    fn drop(&mut self) {
        self.close();
    }
}

impl<F: Fabric> core::fmt::Debug for Connection<F> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("Connection")
            .field("state", &inner.state)
            .field("established", &inner.established)
            .field("description", &inner.description)
            .finish()
    }
}

fn hang_up<F: Fabric>(transport: &mut Transport<F>) {
    if let Err(err) = transport.id_mut().disconnect() {
        warn!("failed to disconnect, {err}");
    }
}

/// Polls until `expected` arrives; any other event fails.
fn wait_event<I>(
    mut poll: impl FnMut() -> Result<Option<CmEvent<I>>>,
    expected: CmEventKind,
    deadline: Deadline,
    what: &'static str,
) -> Result<CmEvent<I>> {
    loop {
        if let Some(event) = poll()? {
            return match event.kind {
                kind if kind == expected => Ok(event),
                CmEventKind::Rejected => {
                    warn!("connection rejected, status {}", event.status);
                    Err(Error::Rejected(event.status))
                }
                kind @ (CmEventKind::AddrError | CmEventKind::RouteError) => {
                    Err(Error::Resolve {
                        what,
                        reason: format!("{kind:?}, status {}", event.status),
                    })
                }
                got => Err(Error::UnexpectedEvent { got, expected }),
            };
        }
        deadline.check(what)?;
        relax();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fabric::Loopback;

    fn config() -> Config {
        Config::default()
            .with_send_queue_depth(16)
            .with_timeout(Some(Duration::from_secs(10)))
    }

    #[test]
    fn calls_check_state() {
        let conn = Connection::new(Loopback::new(), config()).unwrap();
        let mut buf = [0u8; 4];
        assert!(matches!(
            conn.read(&mut buf, false),
            Err(Error::State(State::Closed))
        ));
        assert!(matches!(conn.write(&buf), Err(Error::State(State::Closed))));
        assert!(matches!(conn.accept(), Err(Error::State(State::Closed))));
        conn.listen("127.0.0.1:6100").unwrap();
        assert_eq!(State::Listening, conn.state());
        assert!(matches!(
            conn.connect("127.0.0.1:6100"),
            Err(Error::State(State::Listening))
        ));
        conn.close();
        conn.close();
        assert_eq!(State::Closed, conn.state());
    }

    #[test]
    fn failed_listen_returns_to_closed() {
        let conn = Connection::new(Loopback::new(), config()).unwrap();
        // a plain file in place of the epoll instance fails every registration
        let null = std::fs::File::open("/dev/null").unwrap();
        assert!(unsafe { libc::dup2(null.as_raw_fd(), conn.notifier()) } >= 0);
        for _ in 0..2 {
            assert!(matches!(
                conn.listen("127.0.0.1:6102"),
                Err(Error::Device { op: "epoll_ctl", .. })
            ));
            assert_eq!(State::Closed, conn.state());
        }
    }

    #[test]
    fn connect_without_listener_is_rejected() {
        let conn = Connection::new(Loopback::new(), config()).unwrap();
        assert!(matches!(
            conn.connect("127.0.0.1:6101"),
            Err(Error::Rejected(_))
        ));
        assert_eq!(State::Closed, conn.state());
    }

    #[test]
    fn wait_event_maps_failures() {
        let deadline = Deadline::after(Some(Duration::from_millis(20)));
        let rejected = || {
            Ok(Some(CmEvent::<()> {
                kind: CmEventKind::Rejected,
                id: None,
                private_data: Vec::new(),
                status: 28,
            }))
        };
        assert!(matches!(
            wait_event(rejected, CmEventKind::Established, deadline, "test"),
            Err(Error::Rejected(28))
        ));
        let nothing = || Ok(None::<CmEvent<()>>);
        assert!(matches!(
            wait_event(nothing, CmEventKind::Established, deadline, "test"),
            Err(Error::Timeout("test"))
        ));
    }
}
