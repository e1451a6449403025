use std::io::{self, Read, Write};
use std::net::ToSocketAddrs;
use std::os::fd::{AsRawFd, RawFd};

use rdma_stream_core::fabric::Fabric;
use rdma_stream_core::{Config, Connection, Error, Stats};
use tracing::debug;

/// A connected RDMA byte stream.
///
/// Reads block until bytes arrive and return `Ok(0)` once the peer
/// disconnected and everything it sent was read. Both `Read` and `Write`
/// are implemented for `&RdmaStream` too, so one thread may read while
/// another writes.
#[derive(Debug)]
pub struct RdmaStream<F: Fabric> {
    conn: Connection<F>,
}

impl<F: Fabric> RdmaStream<F> {
    /// Connects with the configuration found in the environment.
    pub fn connect<A: ToSocketAddrs>(fabric: F, addr: A) -> io::Result<Self> {
        Self::connect_with_config(fabric, addr, Config::from_env()?)
    }

    pub fn connect_with_config<A: ToSocketAddrs>(
        fabric: F,
        addr: A,
        config: Config,
    ) -> io::Result<Self> {
        let conn = Connection::new(fabric, config)?;
        conn.connect(addr)?;
        Ok(Self { conn })
    }

    pub(crate) fn from_connection(conn: Connection<F>) -> Self {
        Self { conn }
    }

    pub fn connection(&self) -> &Connection<F> {
        &self.conn
    }

    pub fn local_addr(&self) -> String {
        self.conn.local_address()
    }

    pub fn peer_addr(&self) -> String {
        self.conn.peer_address()
    }

    pub fn stats(&self) -> Stats {
        self.conn.stats()
    }

    /// Reads whatever was received without waiting.
    ///
    /// Fails with [`io::ErrorKind::WouldBlock`] when nothing is pending.
    pub fn try_read(&self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        match self.conn.read(buf, false) {
            Ok(0) => Err(io::ErrorKind::WouldBlock.into()),
            Ok(n) => Ok(n),
            Err(Error::EndOfStream) => Ok(0),
            Err(err) => Err(err.into()),
        }
    }

    /// Disconnects; later calls fail with [`io::ErrorKind::NotConnected`].
    pub fn shutdown(&self) {
        debug!("shutting down stream to {}", self.conn.peer_address());
        self.conn.close();
    }

    fn read_blocking(&self, buf: &mut [u8]) -> io::Result<usize> {
        match self.conn.read(buf, true) {
            Ok(n) => Ok(n),
            Err(Error::EndOfStream) => Ok(0),
            Err(err) => Err(err.into()),
        }
    }

    fn write_some(&self, buf: &[u8]) -> io::Result<usize> {
        Ok(self.conn.write(buf)?)
    }
}

impl<F: Fabric> Read for RdmaStream<F> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.read_blocking(buf)
    }
}

impl<F: Fabric> Read for &RdmaStream<F> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.read_blocking(buf)
    }
}

impl<F: Fabric> Write for RdmaStream<F> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.write_some(buf)
    }

    /// Bytes are posted to the device as they are written.
    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl<F: Fabric> Write for &RdmaStream<F> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.write_some(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl<F: Fabric> AsRawFd for RdmaStream<F> {
    fn as_raw_fd(&self) -> RawFd {
        self.conn.notifier()
    }
}
