use std::io;
use std::net::ToSocketAddrs;
use std::os::fd::{AsRawFd, RawFd};

use rdma_stream_core::fabric::Fabric;
use rdma_stream_core::{Config, Connection, Error};
use tracing::warn;

use crate::stream::RdmaStream;

/// Accepts [`RdmaStream`]s, like `std::net::TcpListener`.
#[derive(Debug)]
pub struct RdmaListener<F: Fabric> {
    conn: Connection<F>,
}

impl<F: Fabric> RdmaListener<F> {
    /// Listens with the configuration found in the environment.
    pub fn bind<A: ToSocketAddrs>(fabric: F, addr: A) -> io::Result<Self> {
        Self::bind_with_config(fabric, addr, Config::from_env()?)
    }

    pub fn bind_with_config<A: ToSocketAddrs>(
        fabric: F,
        addr: A,
        config: Config,
    ) -> io::Result<Self> {
        let conn = Connection::new(fabric, config)?;
        conn.listen(addr)?;
        Ok(Self { conn })
    }

    pub fn local_addr(&self) -> String {
        self.conn.local_address()
    }

    /// Waits for a peer, returning the stream and the peer's address.
    pub fn accept(&self) -> io::Result<(RdmaStream<F>, String)> {
        let conn = self.conn.accept()?;
        let peer = conn.peer_address();
        Ok((RdmaStream::from_connection(conn), peer))
    }

    /// Endless iterator over accepted streams.
    ///
    /// Peers speaking another protocol or proposing an oversized queue are
    /// skipped; other failures are yielded.
    pub fn incoming(&self) -> Incoming<'_, F> {
        Incoming { listener: self }
    }
}

impl<F: Fabric> AsRawFd for RdmaListener<F> {
    fn as_raw_fd(&self) -> RawFd {
        self.conn.notifier()
    }
}

#[derive(Debug)]
pub struct Incoming<'a, F: Fabric> {
    listener: &'a RdmaListener<F>,
}

impl<F: Fabric> Iterator for Incoming<'_, F> {
    type Item = io::Result<RdmaStream<F>>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            match self.listener.conn.accept() {
                Ok(conn) => return Some(Ok(RdmaStream::from_connection(conn))),
                Err(err @ Error::ProtocolMismatch { .. }) => warn!("skipping peer, {err}"),
                Err(err @ Error::DepthOutOfRange(_)) => warn!("skipping peer, {err}"),
                Err(err) => return Some(Err(err.into())),
            }
        }
    }
}
